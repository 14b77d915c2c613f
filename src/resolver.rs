use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::cache::SlotCache;
use crate::error::{Error, Result};
use crate::overlay::{compose, AliasSource, Overlay};
use crate::package::{Origin, PackageDecl, PackageFile, PackageSet};
use crate::platform::PlatformId;
use crate::registry::{InputRef, InputRegistry};

/// Builds the composed package set for one platform.
pub trait PackageSetFactory: Send + Sync {
    fn build(&self, platform: &PlatformId) -> Result<PackageSet>;
}

/// Instantiates composed package sets for the supported platforms.
///
/// Each platform is built at most once; later calls return the cached set.
pub struct PackageSetResolver {
    supported: Vec<PlatformId>,
    factory: Arc<dyn PackageSetFactory>,
    sets: SlotCache<PlatformId, PackageSet>,
}

impl PackageSetResolver {
    pub fn new(supported: Vec<PlatformId>, factory: Arc<dyn PackageSetFactory>) -> Self {
        Self {
            supported,
            factory,
            sets: SlotCache::new(),
        }
    }

    pub fn supported(&self) -> &[PlatformId] {
        &self.supported
    }

    pub fn is_supported(&self, platform: &PlatformId) -> bool {
        self.supported.contains(platform)
    }

    pub fn instantiate(&self, platform: &PlatformId) -> Result<Arc<PackageSet>> {
        if !self.is_supported(platform) {
            return Err(Error::UnsupportedPlatform {
                platform: platform.to_string(),
                supported: self.supported.iter().map(ToString::to_string).collect(),
            });
        }

        self.sets.get_or_try_insert_with(platform, || {
            debug!(%platform, "instantiating package set");
            let set = self.factory.build(platform)?;
            debug!(%platform, packages = set.len(), "package set ready");
            Ok(set)
        })
    }
}

/// A package file inside an input snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSource {
    pub input: InputRef,
    /// Path of the package file relative to the snapshot root.
    pub file: PathBuf,
}

/// One manifest overlay, before its input (if any) has been resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlaySource {
    Input(PackageSource),
    Packages(BTreeMap<String, PackageDecl>),
    Alias {
        from: AliasSource,
        aliases: BTreeMap<String, String>,
    },
    Remove(Vec<String>),
}

/// Production factory: base package file plus manifest overlays.
pub struct ManifestFactory {
    registry: Arc<InputRegistry>,
    base: Option<PackageSource>,
    overlays: Vec<OverlaySource>,
}

impl ManifestFactory {
    pub fn new(
        registry: Arc<InputRegistry>,
        base: Option<PackageSource>,
        overlays: Vec<OverlaySource>,
    ) -> Self {
        Self {
            registry,
            base,
            overlays,
        }
    }

    fn load(&self, source: &PackageSource) -> Result<(Origin, PackageFile)> {
        let snapshot = self.registry.resolve(&source.input)?;
        let relative = checked_relative(&source.file).ok_or_else(|| {
            Error::unresolvable(
                &source.input.name,
                &source.input.locator,
                format!("package file {:?} escapes the snapshot", source.file),
            )
        })?;

        let path = snapshot.root.join(relative);
        if !path.is_file() {
            return Err(Error::unresolvable(
                &source.input.name,
                &source.input.locator,
                format!("package file {:?} not found in snapshot", source.file),
            ));
        }

        let file = PackageFile::load(&path)?;
        let origin = Origin::Input {
            name: snapshot.input.clone(),
            digest: snapshot.digest.clone(),
        };
        Ok((origin, file))
    }

    /// Load every referenced package file and turn the sources into overlays.
    fn realize_overlays(&self) -> Result<Vec<Overlay>> {
        self.overlays
            .iter()
            .enumerate()
            .map(|(index, source)| {
                Ok(match source {
                    OverlaySource::Input(source) => {
                        let (origin, file) = self.load(source)?;
                        Overlay::Extend {
                            origin,
                            packages: file.packages,
                        }
                    }
                    OverlaySource::Packages(packages) => Overlay::Extend {
                        origin: Origin::Inline { overlay: index },
                        packages: packages.clone(),
                    },
                    OverlaySource::Alias { from, aliases } => Overlay::Alias {
                        from: *from,
                        aliases: aliases.clone(),
                    },
                    OverlaySource::Remove(names) => Overlay::Remove {
                        names: names.clone(),
                    },
                })
            })
            .collect()
    }
}

impl PackageSetFactory for ManifestFactory {
    fn build(&self, platform: &PlatformId) -> Result<PackageSet> {
        let base = match &self.base {
            Some(source) => {
                let (origin, file) = self.load(source)?;
                PackageSet::from_decls(platform.clone(), &origin, &file.packages)
            }
            None => PackageSet::empty(platform.clone()),
        };

        let overlays = self.realize_overlays()?;
        Ok(compose(&base, &overlays))
    }
}

fn checked_relative(path: &Path) -> Option<&Path> {
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        None
    } else {
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::Locator;
    use crate::registry::tests::CountingFetcher;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn platform(value: &str) -> PlatformId {
        PlatformId::parse(value).unwrap()
    }

    struct CountingFactory {
        calls: AtomicUsize,
    }

    impl PackageSetFactory for CountingFactory {
        fn build(&self, platform: &PlatformId) -> Result<PackageSet> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PackageSet::empty(platform.clone()))
        }
    }

    #[test]
    fn instantiate_is_cached_per_platform() {
        let factory = Arc::new(CountingFactory {
            calls: AtomicUsize::new(0),
        });
        let resolver = PackageSetResolver::new(
            vec![platform("x86_64-linux"), platform("aarch64-darwin")],
            factory.clone(),
        );

        let a = resolver.instantiate(&platform("x86_64-linux")).unwrap();
        let b = resolver.instantiate(&platform("x86_64-linux")).unwrap();
        let c = resolver.instantiate(&platform("aarch64-darwin")).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(c.platform().as_str(), "aarch64-darwin");
        assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsupported_platform_is_rejected() {
        let factory = Arc::new(CountingFactory {
            calls: AtomicUsize::new(0),
        });
        let resolver = PackageSetResolver::new(vec![platform("x86_64-linux")], factory.clone());

        let error = resolver
            .instantiate(&platform("riscv64-windows"))
            .unwrap_err();
        assert!(
            matches!(error, Error::UnsupportedPlatform { ref platform, .. } if platform == "riscv64-windows")
        );
        assert_eq!(factory.calls.load(Ordering::SeqCst), 0);
    }

    fn registry_with_dir(dir: &Path) -> (Arc<InputRegistry>, InputRef) {
        let mut registry = InputRegistry::new(Arc::new(crate::fetch::DefaultFetcher::new(
            dir.join("cache"),
            std::time::Duration::from_secs(5),
        )));
        let input = registry
            .register("nixpkgs", Locator::Path(dir.join("pkgs")), None)
            .unwrap();
        (Arc::new(registry), input)
    }

    #[test]
    fn manifest_factory_composes_base_and_overlays() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("pkgs")).unwrap();
        fs::write(
            temp.path().join("pkgs/packages.toml"),
            r#"
[packages.rustc]
version = "1.82.0"
bin = ["rustc", "cargo"]

[packages.legacy]
version = "0.1"
"#,
        )
        .unwrap();

        let (registry, input) = registry_with_dir(temp.path());
        let factory = ManifestFactory::new(
            registry,
            Some(PackageSource {
                input,
                file: PathBuf::from("packages.toml"),
            }),
            vec![
                OverlaySource::Packages(
                    toml::from_str::<PackageFile>("[packages.foo]\nversion = \"1.0.0\"\n")
                        .unwrap()
                        .packages,
                ),
                OverlaySource::Alias {
                    from: AliasSource::Prev,
                    aliases: BTreeMap::from([(
                        "rust-toolchain".to_string(),
                        "rustc".to_string(),
                    )]),
                },
                OverlaySource::Remove(vec!["legacy".to_string()]),
            ],
        );

        let set = factory.build(&platform("x86_64-linux")).unwrap();
        assert_eq!(
            set.names().collect::<Vec<_>>(),
            vec!["foo", "rust-toolchain", "rustc"]
        );
        assert_eq!(
            set.get("foo").unwrap().origin,
            Origin::Inline { overlay: 0 }
        );
        assert!(matches!(set.get("rustc").unwrap().origin, Origin::Input { .. }));
    }

    #[test]
    fn missing_package_file_is_unresolvable() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("pkgs")).unwrap();

        let (registry, input) = registry_with_dir(temp.path());
        let factory = ManifestFactory::new(
            registry,
            Some(PackageSource {
                input,
                file: PathBuf::from("packages.toml"),
            }),
            Vec::new(),
        );

        let error = factory.build(&platform("x86_64-linux")).unwrap_err();
        assert!(matches!(error, Error::UnresolvableInput { .. }));
        assert!(error.to_string().contains("not found in snapshot"));
    }

    #[test]
    fn package_file_outside_snapshot_is_rejected() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("pkgs")).unwrap();

        let (registry, input) = registry_with_dir(temp.path());
        let factory = ManifestFactory::new(
            registry,
            None,
            vec![OverlaySource::Input(PackageSource {
                input,
                file: PathBuf::from("../secrets.toml"),
            })],
        );

        let error = factory.build(&platform("x86_64-linux")).unwrap_err();
        assert!(error.to_string().contains("escapes the snapshot"));
    }

    #[test]
    fn base_resolution_failures_are_not_cached() {
        let fetcher = Arc::new(CountingFetcher::default());
        *fetcher.fail_next.lock().unwrap() = true;
        let mut registry = InputRegistry::new(fetcher.clone());
        let input = registry
            .register("nixpkgs", Locator::Path(PathBuf::from("/nowhere")), None)
            .unwrap();

        let factory = ManifestFactory::new(
            Arc::new(registry),
            Some(PackageSource {
                input,
                file: PathBuf::from("packages.toml"),
            }),
            Vec::new(),
        );
        let resolver = PackageSetResolver::new(vec![platform("x86_64-linux")], Arc::new(factory));

        assert!(resolver.instantiate(&platform("x86_64-linux")).is_err());
        // The fetch now succeeds but the snapshot root has no package file.
        let error = resolver
            .instantiate(&platform("x86_64-linux"))
            .unwrap_err();
        assert!(error.to_string().contains("not found in snapshot"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }
}
