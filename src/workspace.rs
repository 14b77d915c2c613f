use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::driver::Driver;
use crate::error::Error;
use crate::evaluator::Evaluator;
use crate::fetch::{DefaultFetcher, Fetcher, Locator};
use crate::lockfile::{Lockfile, LOCKFILE_NAME};
use crate::manifest::{Manifest, OverlayDecl};
use crate::platform::PlatformId;
use crate::registry::InputRegistry;
use crate::resolver::{ManifestFactory, OverlaySource, PackageSetResolver, PackageSource};

/// Workspace path types
#[derive(Debug, Clone, Copy)]
pub enum WorkspacePath {
    /// The manifest: `--manifest`, default `./devshell.toml`
    Manifest,
    /// Lockfile next to the manifest: `devshell.lock`
    Lockfile,
    /// Input mirrors and snapshots: `$XDG_CACHE_HOME/devshell`
    Cache,
    /// Root of package out paths: `$XDG_DATA_HOME/devshell/store`
    Store,
}

/// A manifest together with the user's config and the directories derived from it.
#[derive(Debug)]
pub struct Workspace {
    manifest_path: PathBuf,
    config: Config,
    cache_dir: PathBuf,
    store_dir: PathBuf,
}

impl Workspace {
    /// Open the workspace for `manifest_path` using the user config.
    pub fn new(manifest_path: PathBuf) -> Result<Self> {
        Self::with_config(manifest_path, Config::load_default()?)
    }

    pub fn with_config(manifest_path: PathBuf, config: Config) -> Result<Self> {
        let manifest_path = if manifest_path.is_absolute() {
            manifest_path
        } else {
            std::env::current_dir()
                .context("Failed to determine current directory")?
                .join(manifest_path)
        };

        let cache_dir = config.cache_dir()?;
        let store_dir = config.store_dir()?;

        Ok(Self {
            manifest_path,
            config,
            cache_dir,
            store_dir,
        })
    }

    /// Get path for a specific workspace location
    pub fn path(&self, path_type: WorkspacePath) -> PathBuf {
        match path_type {
            WorkspacePath::Manifest => self.manifest_path.clone(),
            WorkspacePath::Lockfile => self.manifest_dir().join(LOCKFILE_NAME),
            WorkspacePath::Cache => self.cache_dir.clone(),
            WorkspacePath::Store => self.store_dir.clone(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn manifest_dir(&self) -> &Path {
        self.manifest_path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn load_manifest(&self) -> Result<Manifest> {
        if !self.manifest_path.exists() {
            anyhow::bail!(
                "No manifest found at {:?} (pass --manifest or set DEVSHELL_MANIFEST)",
                self.manifest_path
            );
        }
        Ok(Manifest::load(&self.manifest_path)?)
    }

    pub fn load_lockfile(&self) -> Result<Lockfile> {
        Lockfile::load_or_default(&self.path(WorkspacePath::Lockfile))
    }

    /// Wire registry, resolver and driver for `manifest`.
    ///
    /// Inputs named in `unlocked` ignore their lockfile entry.
    pub fn session(&self, manifest: &Manifest, unlocked: &[String]) -> Result<Session> {
        let lockfile = self.load_lockfile()?;
        let fetcher = Arc::new(DefaultFetcher::new(
            self.cache_dir.clone(),
            self.config.http_timeout(),
        ));

        Ok(Session::from_manifest(
            manifest,
            fetcher,
            self.store_dir.clone(),
            Some(&lockfile),
            unlocked,
        )?)
    }
}

/// Everything needed to evaluate shells for one manifest.
pub struct Session {
    registry: Arc<InputRegistry>,
    driver: Driver,
    systems: Vec<PlatformId>,
}

impl Session {
    pub fn from_manifest(
        manifest: &Manifest,
        fetcher: Arc<dyn Fetcher>,
        store_dir: PathBuf,
        lockfile: Option<&Lockfile>,
        unlocked: &[String],
    ) -> Result<Self, Error> {
        let systems = manifest.systems()?;
        let mut registry = InputRegistry::new(fetcher);

        for (name, decl) in &manifest.inputs {
            let locator = Locator::parse(&decl.url, manifest.root()).map_err(|err| {
                Error::unresolvable(name, &decl.url, format!("unsupported locator: {err:#}"))
            })?;

            let mut pinned = decl.rev.clone();
            let locked = lockfile
                .filter(|_| !unlocked.contains(name))
                .and_then(|lockfile| lockfile.get(name))
                .filter(|entry| entry.locator == locator.to_string());

            if let Some(entry) = locked.filter(|_| pinned.is_none()) {
                debug!(input = %name, revision = %entry.revision, "using locked revision");
                pinned = Some(entry.revision.clone());
                registry.expect_digest(name, entry.digest.clone());
            }

            registry.register(name, locator, pinned)?;
        }

        let base = match &manifest.base {
            Some(name) => Some(package_source(manifest, &registry, name, None)?),
            None => None,
        };

        let overlays = manifest
            .overlays
            .iter()
            .map(|overlay| {
                Ok(match overlay {
                    OverlayDecl::Input { input, file } => OverlaySource::Input(package_source(
                        manifest,
                        &registry,
                        input,
                        file.clone(),
                    )?),
                    OverlayDecl::Packages { packages } => OverlaySource::Packages(packages.clone()),
                    OverlayDecl::Alias { from, aliases } => OverlaySource::Alias {
                        from: *from,
                        aliases: aliases.clone(),
                    },
                    OverlayDecl::Remove { packages } => OverlaySource::Remove(packages.clone()),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let registry = Arc::new(registry);
        let factory = ManifestFactory::new(Arc::clone(&registry), base, overlays);
        let resolver = PackageSetResolver::new(systems.clone(), Arc::new(factory));
        let driver = Driver::new(Arc::new(resolver), Arc::new(Evaluator::new(store_dir)));

        Ok(Self {
            registry,
            driver,
            systems,
        })
    }

    pub fn registry(&self) -> &InputRegistry {
        &self.registry
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Supported platforms declared by the manifest.
    pub fn systems(&self) -> &[PlatformId] {
        &self.systems
    }
}

fn package_source(
    manifest: &Manifest,
    registry: &InputRegistry,
    input: &str,
    file: Option<PathBuf>,
) -> Result<PackageSource, Error> {
    let (Some(input_ref), Some(decl)) = (registry.get(input), manifest.inputs.get(input)) else {
        return Err(Error::Manifest {
            path: manifest.path().to_path_buf(),
            reason: format!("refers to undeclared input '{input}'"),
        });
    };

    Ok(PackageSource {
        input: input_ref.clone(),
        file: file.unwrap_or_else(|| decl.file()),
    })
}
