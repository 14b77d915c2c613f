// Public API
pub mod cli;
pub mod commands;

// Core domain types
pub mod driver;
pub mod environment;
pub mod evaluator;
pub mod fetch;
pub mod manifest;
pub mod overlay;
pub mod package;
pub mod platform;
pub mod registry;
pub mod resolver;

mod cache;
mod config;
mod error;
mod lockfile;
mod ui;
mod util;
mod workspace;

// Re-export main types
pub use config::Config;
pub use driver::{Driver, DriverReport};
pub use environment::{Environment, Shell};
pub use error::{Error, Result};
pub use evaluator::{EnvironmentDescriptor, Evaluator, PackageRef};
pub use fetch::{DefaultFetcher, Fetcher, Locator};
pub use lockfile::{LockedInput, Lockfile};
pub use manifest::{Manifest, ManifestIssue};
pub use overlay::{compose, AliasSource, Overlay};
pub use package::{Origin, PackageDef, PackageSet};
pub use platform::PlatformId;
pub use registry::{InputRef, InputRegistry, Snapshot};
pub use resolver::{ManifestFactory, PackageSetFactory, PackageSetResolver};
pub use workspace::{Session, Workspace, WorkspacePath};
