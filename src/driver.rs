use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use tokio::runtime::{Builder, Handle};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::evaluator::{EnvironmentDescriptor, Evaluator};
use crate::platform::PlatformId;
use crate::resolver::PackageSetResolver;

/// Evaluates one request across several platforms.
///
/// Platforms are isolated: a failure on one never prevents descriptors for
/// the others. Callers that want fail-fast behavior use
/// [`DriverReport::into_result`].
pub struct Driver {
    resolver: Arc<PackageSetResolver>,
    evaluator: Arc<Evaluator>,
}

impl Driver {
    pub fn new(resolver: Arc<PackageSetResolver>, evaluator: Arc<Evaluator>) -> Self {
        Self {
            resolver,
            evaluator,
        }
    }

    pub fn resolver(&self) -> &PackageSetResolver {
        &self.resolver
    }

    /// Evaluate a single platform.
    pub fn build(&self, platform: &PlatformId, requested: &[String]) -> Result<EnvironmentDescriptor> {
        evaluate_platform(&self.resolver, &self.evaluator, platform, requested)
    }

    /// Evaluate every platform, one blocking task each.
    ///
    /// Safe to call from inside an async context: the worker runtime is then
    /// driven from a separate thread instead of the caller's.
    pub fn build_all(&self, platforms: &[PlatformId], requested: &[String]) -> DriverReport {
        let mut platforms = platforms.to_vec();
        platforms.sort();
        platforms.dedup();

        if platforms.len() <= 1 {
            return self.build_sequential(&platforms, requested);
        }

        let run = || match Builder::new_multi_thread()
            .thread_name("devshell-eval")
            .build()
        {
            Ok(runtime) => runtime.block_on(self.build_parallel(&platforms, requested)),
            Err(err) => {
                warn!(error = %err, "failed to start worker pool; evaluating platforms sequentially");
                self.build_sequential(&platforms, requested)
            }
        };

        if Handle::try_current().is_err() {
            return run();
        }

        debug!("called from an async context; driving evaluation from a helper thread");
        thread::scope(|scope| match scope.spawn(run).join() {
            Ok(report) => report,
            Err(payload) => std::panic::resume_unwind(payload),
        })
    }

    fn build_sequential(&self, platforms: &[PlatformId], requested: &[String]) -> DriverReport {
        let results = platforms
            .iter()
            .map(|platform| (platform.clone(), self.build(platform, requested)))
            .collect();
        DriverReport { results }
    }

    async fn build_parallel(&self, platforms: &[PlatformId], requested: &[String]) -> DriverReport {
        let requested: Arc<[String]> = requested.into();

        let handles: Vec<(PlatformId, JoinHandle<Result<EnvironmentDescriptor>>)> = platforms
            .iter()
            .map(|platform| {
                let resolver = Arc::clone(&self.resolver);
                let evaluator = Arc::clone(&self.evaluator);
                let requested = Arc::clone(&requested);
                let task_platform = platform.clone();
                let handle = tokio::task::spawn_blocking(move || {
                    evaluate_platform(&resolver, &evaluator, &task_platform, &requested)
                });
                (platform.clone(), handle)
            })
            .collect();

        let mut results = BTreeMap::new();
        for (platform, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => match err.try_into_panic() {
                    Ok(payload) => std::panic::resume_unwind(payload),
                    Err(err) => Err(Error::Io(std::io::Error::other(err))),
                },
            };
            results.insert(platform, result);
        }

        DriverReport { results }
    }
}

fn evaluate_platform(
    resolver: &PackageSetResolver,
    evaluator: &Evaluator,
    platform: &PlatformId,
    requested: &[String],
) -> Result<EnvironmentDescriptor> {
    let set = resolver.instantiate(platform)?;
    let result = evaluator.evaluate(&set, requested);
    if let Err(err) = &result {
        debug!(%platform, kind = err.kind(), "platform evaluation failed");
    }
    result
}

/// Per-platform outcome of [`Driver::build_all`], ordered by platform.
#[derive(Debug)]
pub struct DriverReport {
    results: BTreeMap<PlatformId, Result<EnvironmentDescriptor>>,
}

impl DriverReport {
    pub fn iter(&self) -> impl Iterator<Item = (&PlatformId, &Result<EnvironmentDescriptor>)> {
        self.results.iter()
    }

    pub fn get(&self, platform: &PlatformId) -> Option<&Result<EnvironmentDescriptor>> {
        self.results.get(platform)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.results.values().all(Result::is_ok)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = (&PlatformId, &EnvironmentDescriptor)> {
        self.results
            .iter()
            .filter_map(|(platform, result)| result.as_ref().ok().map(|d| (platform, d)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&PlatformId, &Error)> {
        self.results
            .iter()
            .filter_map(|(platform, result)| result.as_ref().err().map(|e| (platform, e)))
    }

    /// All descriptors, or the first failure in platform order.
    pub fn into_result(self) -> Result<BTreeMap<PlatformId, EnvironmentDescriptor>> {
        self.results
            .into_iter()
            .map(|(platform, result)| result.map(|descriptor| (platform, descriptor)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{Origin, PackageFile, PackageSet};
    use crate::resolver::PackageSetFactory;

    struct StaticFactory;

    impl PackageSetFactory for StaticFactory {
        fn build(&self, platform: &PlatformId) -> Result<PackageSet> {
            let decls = toml::from_str::<PackageFile>(
                r#"
[packages.rust-toolchain]
version = "1.82.0"
bin = ["rustc", "cargo"]

[packages.foo]
version = "0.1.0"
bin = ["foo"]

[packages.strace]
version = "6.7"
bin = ["strace"]
platforms = ["x86_64-linux"]
"#,
            )
            .unwrap()
            .packages;
            Ok(PackageSet::from_decls(
                platform.clone(),
                &Origin::Inline { overlay: 0 },
                &decls,
            ))
        }
    }

    fn platforms(values: &[&str]) -> Vec<PlatformId> {
        values.iter().map(|v| PlatformId::parse(v).unwrap()).collect()
    }

    fn driver(supported: &[&str]) -> Driver {
        Driver::new(
            Arc::new(PackageSetResolver::new(
                platforms(supported),
                Arc::new(StaticFactory),
            )),
            Arc::new(Evaluator::new("/store")),
        )
    }

    fn request(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn builds_every_platform() {
        let driver = driver(&["x86_64-linux", "aarch64-darwin"]);
        let report = driver.build_all(
            &platforms(&["x86_64-linux", "aarch64-darwin"]),
            &request(&["rust-toolchain", "foo"]),
        );

        assert!(report.is_success());
        assert_eq!(report.len(), 2);
        let keys: Vec<_> = report.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(keys, vec!["aarch64-darwin", "x86_64-linux"]);
    }

    #[test]
    fn unsupported_platform_is_isolated() {
        let driver = driver(&["x86_64-linux", "aarch64-darwin"]);
        let report = driver.build_all(
            &platforms(&["x86_64-linux", "riscv64-windows", "aarch64-darwin"]),
            &request(&["foo"]),
        );

        assert!(!report.is_success());
        assert_eq!(report.descriptors().count(), 2);

        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0.as_str(), "riscv64-windows");
        assert!(matches!(failures[0].1, Error::UnsupportedPlatform { .. }));
    }

    #[test]
    fn platform_specific_package_fails_only_where_missing() {
        let driver = driver(&["x86_64-linux", "aarch64-darwin"]);
        let report = driver.build_all(
            &platforms(&["x86_64-linux", "aarch64-darwin"]),
            &request(&["strace"]),
        );

        let linux = PlatformId::parse("x86_64-linux").unwrap();
        let darwin = PlatformId::parse("aarch64-darwin").unwrap();
        assert!(report.get(&linux).unwrap().is_ok());
        assert!(matches!(
            report.get(&darwin).unwrap(),
            Err(Error::UnknownPackage { .. })
        ));
    }

    #[test]
    fn into_result_returns_first_failure() {
        let driver = driver(&["x86_64-linux"]);
        let report = driver.build_all(
            &platforms(&["x86_64-linux", "riscv64-windows"]),
            &request(&["bar"]),
        );

        // riscv64-windows sorts before x86_64-linux.
        let error = report.into_result().unwrap_err();
        assert!(matches!(error, Error::UnsupportedPlatform { .. }));
    }

    #[test]
    fn repeated_builds_are_identical() {
        let driver = driver(&["x86_64-linux", "aarch64-linux"]);
        let targets = platforms(&["x86_64-linux", "aarch64-linux"]);
        let first = driver
            .build_all(&targets, &request(&["rust-toolchain", "foo"]))
            .into_result()
            .unwrap();
        let second = driver
            .build_all(&targets, &request(&["rust-toolchain", "foo"]))
            .into_result()
            .unwrap();

        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn build_all_inside_async_context() {
        let driver = driver(&["x86_64-linux", "aarch64-darwin"]);
        let targets = platforms(&["x86_64-linux", "aarch64-darwin"]);
        let runtime = Builder::new_current_thread().build().unwrap();

        let report = runtime.block_on(async { driver.build_all(&targets, &request(&["foo"])) });

        assert!(report.is_success());
        assert_eq!(report.len(), 2);
    }

    #[test]
    fn single_platform_build() {
        let driver = driver(&["x86_64-linux"]);
        let descriptor = driver
            .build(&PlatformId::parse("x86_64-linux").unwrap(), &request(&["foo"]))
            .unwrap();
        assert_eq!(descriptor.package_names().collect::<Vec<_>>(), vec!["foo"]);
    }
}
