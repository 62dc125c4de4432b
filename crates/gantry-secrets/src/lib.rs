//! Secret resolution and per-instance environment binding for Gantry.

pub mod binder;
pub mod providers;

pub use binder::{EnvironmentBinding, SecretBinder};
pub use providers::{EnvProvider, FileProvider, SecretProvider};
