use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

use crate::package::{Origin, PackageDecl, PackageDef, PackageSet};

/// Which package set an alias overlay reads its targets from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AliasSource {
    /// The cumulative result of every earlier overlay.
    #[default]
    Prev,
    /// The original base set, ignoring earlier overlays.
    Base,
}

/// A transformation layer applied on top of a package set.
///
/// Overlays are realized once (input snapshots already loaded) and are then
/// applied per platform: declarations are instantiated for the platform of the
/// set they are applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Overlay {
    /// Add packages, merging field-wise into existing definitions unless the
    /// declaration sets `replace = true`.
    Extend {
        origin: Origin,
        packages: BTreeMap<String, PackageDecl>,
    },
    /// Expose an existing definition under another name.
    Alias {
        from: AliasSource,
        aliases: BTreeMap<String, String>,
    },
    /// Drop packages from the set.
    Remove { names: Vec<String> },
}

impl Overlay {
    /// Produce a new set from the cumulative set `prev` and the original `base`.
    pub fn apply(&self, prev: &PackageSet, base: &PackageSet) -> PackageSet {
        let mut next = prev.clone();

        match self {
            Overlay::Extend { origin, packages } => {
                for (name, decl) in packages {
                    let Some(fields) = decl.instantiate(prev.platform()) else {
                        continue;
                    };

                    let merged = match prev.get(name) {
                        Some(existing) if !decl.replace => {
                            let mut merged = existing.fields.clone();
                            merged.apply(&fields);
                            merged
                        }
                        _ => fields,
                    };

                    next.insert(
                        name.clone(),
                        PackageDef {
                            name: name.clone(),
                            fields: merged,
                            origin: origin.clone(),
                        },
                    );
                }
            }
            Overlay::Alias { from, aliases } => {
                let source = match from {
                    AliasSource::Prev => prev,
                    AliasSource::Base => base,
                };

                for (alias, target) in aliases {
                    match source.get(target) {
                        Some(def) => next.insert(alias.clone(), def.clone()),
                        // Left unresolved; requesting the alias reports it as unknown.
                        None => trace!(%alias, %target, "alias target not present"),
                    }
                }
            }
            Overlay::Remove { names } => {
                for name in names {
                    next.remove(name);
                }
            }
        }

        next
    }
}

/// Apply `overlays` to `base` in order.
///
/// Overlay `i` observes the output of overlays `0..i`; every overlay also sees
/// the untouched `base`.
pub fn compose(base: &PackageSet, overlays: &[Overlay]) -> PackageSet {
    overlays
        .iter()
        .fold(base.clone(), |prev, overlay| overlay.apply(&prev, base))
}
