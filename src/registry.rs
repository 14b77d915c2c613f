use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::SlotCache;
use crate::error::{Error, Result};
use crate::fetch::{Fetcher, Locator};

/// A named input source as declared in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputRef {
    pub name: String,
    pub locator: Locator,
    pub pinned_revision: Option<String>,
}

/// An input realized as an immutable file tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub input: String,
    pub locator: String,
    /// Commit id for git inputs, content digest otherwise.
    pub revision: String,
    /// `sha256-<hex>` over the snapshot's file tree.
    pub digest: String,
    pub root: PathBuf,
}

type SnapshotKey = (String, String, Option<String>);

/// Registered inputs and the snapshots resolved from them.
///
/// Snapshots are fetched on first resolution and memoized by
/// `(name, locator, pinned revision)` for the lifetime of the registry.
pub struct InputRegistry {
    inputs: BTreeMap<String, InputRef>,
    expected_digests: HashMap<String, String>,
    fetcher: Arc<dyn Fetcher>,
    snapshots: SlotCache<SnapshotKey, Snapshot>,
}

impl InputRegistry {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            inputs: BTreeMap::new(),
            expected_digests: HashMap::new(),
            fetcher,
            snapshots: SlotCache::new(),
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        locator: Locator,
        pinned_revision: Option<String>,
    ) -> Result<InputRef> {
        if self.inputs.contains_key(name) {
            return Err(Error::DuplicateName {
                name: name.to_string(),
            });
        }

        let input = InputRef {
            name: name.to_string(),
            locator,
            pinned_revision,
        };
        debug!(input = %input.name, locator = %input.locator, "registered input");
        self.inputs.insert(input.name.clone(), input.clone());
        Ok(input)
    }

    /// Require the snapshot of `name` to have exactly `digest`, as recorded in a lockfile.
    pub fn expect_digest(&mut self, name: &str, digest: impl Into<String>) {
        self.expected_digests.insert(name.to_string(), digest.into());
    }

    pub fn get(&self, name: &str) -> Option<&InputRef> {
        self.inputs.get(name)
    }

    pub fn inputs(&self) -> impl Iterator<Item = &InputRef> {
        self.inputs.values()
    }

    pub fn resolve(&self, input: &InputRef) -> Result<Arc<Snapshot>> {
        if self.inputs.get(&input.name) != Some(input) {
            return Err(Error::unresolvable(
                &input.name,
                &input.locator,
                "input is not registered",
            ));
        }

        let key = (
            input.name.clone(),
            input.locator.to_string(),
            input.pinned_revision.clone(),
        );

        if let Some(snapshot) = self.snapshots.get(&key) {
            debug!(input = %input.name, revision = %snapshot.revision, "snapshot cache hit");
            return Ok(snapshot);
        }

        self.snapshots.get_or_try_insert_with(&key, || {
            info!(
                input = %input.name,
                locator = %input.locator,
                rev = input.pinned_revision.as_deref().unwrap_or("latest"),
                "resolving input"
            );
            let snapshot = self.fetcher.fetch(input)?;

            if let Some(expected) = self.expected_digests.get(&input.name) {
                if *expected != snapshot.digest {
                    warn!(
                        input = %input.name,
                        expected = %expected,
                        actual = %snapshot.digest,
                        "snapshot digest differs from lockfile"
                    );
                    return Err(Error::unresolvable(
                        &input.name,
                        &input.locator,
                        format!(
                            "content digest {} does not match locked digest {}",
                            snapshot.digest, expected
                        ),
                    ));
                }
            }

            debug!(input = %input.name, revision = %snapshot.revision, digest = %snapshot.digest, "resolved input");
            Ok(snapshot)
        })
    }

    /// Resolve every registered input, stopping at the first failure.
    pub fn resolve_all(&self) -> Result<Vec<Arc<Snapshot>>> {
        self.inputs.values().map(|input| self.resolve(input)).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    /// Fetcher serving fixed snapshots; locators containing "offline" fail.
    #[derive(Default)]
    pub(crate) struct CountingFetcher {
        pub calls: AtomicUsize,
        pub fail_next: Mutex<bool>,
    }

    impl Fetcher for CountingFetcher {
        fn fetch(&self, input: &InputRef) -> Result<Snapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));

            let mut fail_next = self.fail_next.lock().unwrap();
            if *fail_next || input.locator.to_string().contains("offline") {
                *fail_next = false;
                return Err(Error::unresolvable(&input.name, &input.locator, "unreachable"));
            }

            Ok(Snapshot {
                input: input.name.clone(),
                locator: input.locator.to_string(),
                revision: input
                    .pinned_revision
                    .clone()
                    .unwrap_or_else(|| "HEAD".to_string()),
                digest: format!("sha256-{}", input.name),
                root: PathBuf::from("/snapshots").join(&input.name),
            })
        }
    }

    fn locator(raw: &str) -> Locator {
        Locator::parse(raw, Path::new("/work")).unwrap()
    }

    #[test]
    fn register_rejects_duplicate_names() {
        let mut registry = InputRegistry::new(Arc::new(CountingFetcher::default()));
        registry
            .register("nixpkgs", locator("./pkgs"), Some("abc123".to_string()))
            .unwrap();

        let error = registry
            .register("nixpkgs", locator("./other"), None)
            .unwrap_err();
        assert!(matches!(error, Error::DuplicateName { ref name } if name == "nixpkgs"));
        assert_eq!(registry.inputs().count(), 1);
    }

    #[test]
    fn resolve_is_memoized() {
        let fetcher = Arc::new(CountingFetcher::default());
        let mut registry = InputRegistry::new(fetcher.clone());
        let input = registry
            .register("nixpkgs", locator("./pkgs"), Some("abc123".to_string()))
            .unwrap();

        let first = registry.resolve(&input).unwrap();
        let second = registry.resolve(&input).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.revision, "abc123");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_resolution_fetches_once() {
        let fetcher = Arc::new(CountingFetcher::default());
        let mut registry = InputRegistry::new(fetcher.clone());
        let input = registry.register("nixpkgs", locator("./pkgs"), None).unwrap();

        let snapshots: Vec<Arc<Snapshot>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..6)
                .map(|_| scope.spawn(|| registry.resolve(&input).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(snapshots.iter().all(|s| Arc::ptr_eq(s, &snapshots[0])));
    }

    #[test]
    fn failures_are_retried_on_next_call() {
        let fetcher = Arc::new(CountingFetcher::default());
        *fetcher.fail_next.lock().unwrap() = true;
        let mut registry = InputRegistry::new(fetcher.clone());
        let input = registry.register("nixpkgs", locator("./pkgs"), None).unwrap();

        let error = registry.resolve(&input).unwrap_err();
        assert!(matches!(error, Error::UnresolvableInput { .. }));

        assert!(registry.resolve(&input).is_ok());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unreachable_locator_reports_name_and_locator() {
        let mut registry = InputRegistry::new(Arc::new(CountingFetcher::default()));
        let input = registry
            .register("overlay", locator("git+https://offline.example.com/o.git"), None)
            .unwrap();

        let message = registry.resolve(&input).unwrap_err().to_string();
        assert!(message.contains("'overlay'"));
        assert!(message.contains("git+https://offline.example.com/o.git"));
    }

    #[test]
    fn locked_digest_mismatch_is_unresolvable() {
        let mut registry = InputRegistry::new(Arc::new(CountingFetcher::default()));
        let input = registry.register("nixpkgs", locator("./pkgs"), None).unwrap();
        registry.expect_digest("nixpkgs", "sha256-locked");

        let message = registry.resolve(&input).unwrap_err().to_string();
        assert!(message.contains("does not match locked digest sha256-locked"));
    }

    #[test]
    fn unregistered_inputs_are_rejected() {
        let registry = InputRegistry::new(Arc::new(CountingFetcher::default()));
        let stray = InputRef {
            name: "stray".to_string(),
            locator: locator("./stray"),
            pinned_revision: None,
        };
        assert!(registry.resolve(&stray).is_err());
    }
}
