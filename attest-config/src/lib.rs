//! Shared configuration library for attest.
//!
//! Configuration is composed from an optional file (`attest.toml` or a JSON
//! document), inline JSON from the environment, and individual environment
//! overrides, in that order of increasing precedence. Guard rails reject
//! settings the orchestrator cannot run with and surface warnings for the
//! ones it can run with but probably should not.

pub mod loader;
pub mod models;
pub mod sources;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{CollaboratorConfig, Config, ConfigMetadata, ConfigSource, DatabaseConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
