//! The plugin interface workers configure during init, per the component design's
//! "each module exposes `apply_config`" external interface.

use dusa_collection_utils::core::errors::ErrorArrayItem;
use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;

use crate::config::SupervisorConfig;

/// An application-level module the worker configures at startup. Plugin failures are
/// logged but non-fatal to the worker, per the spec's error-handling design.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn apply_config(&self, config: &SupervisorConfig) -> Result<(), ErrorArrayItem>;
}

/// A no-op example plugin: logs the fact that it was configured. Stands in for the
/// application-level modules the spec treats as opaque.
pub struct LoggingPlugin;

impl Plugin for LoggingPlugin {
    fn name(&self) -> &str {
        "logging"
    }

    fn apply_config(&self, config: &SupervisorConfig) -> Result<(), ErrorArrayItem> {
        log!(
            LogLevel::Debug,
            "logging plugin configured with {} worker(s) targeted",
            config.worker_processes
        );
        Ok(())
    }
}

/// Runs `apply_config` for every plugin, logging and swallowing individual failures so
/// one broken module cannot abort worker init.
pub async fn configure_all(plugins: &[Box<dyn Plugin>], config: &SupervisorConfig) {
    for plugin in plugins {
        if let Err(e) = plugin.apply_config(config) {
            log!(LogLevel::Error, "Plugin '{}' failed to configure: {}", plugin.name(), e);
        }
    }
}
