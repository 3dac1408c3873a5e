// src/config.rs

use config::{Config, ConfigError, Environment, File};
use dusa_collection_utils::core::types::pathtype::PathType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

/// Configuration for the master/worker supervision core.
///
/// Loaded the same way the rest of this codebase loads configuration: defaults set in
/// code, then layered with an optional `Settings.toml` / `Settings.<RUN_MODE>.toml`,
/// then environment overrides (`FLEET__worker_processes=4`, etc.).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SupervisorConfig {
    /// Number of worker processes to keep running (`N` in the master loop's init step).
    pub worker_processes: usize,

    /// The worker entrypoint binary. Stands in for the spec's opaque in-process
    /// `proc`/`data` pair, since this core supervises separate OS processes.
    pub worker_program: PathType,

    /// Extra arguments passed to the worker program on every spawn/respawn.
    pub worker_args: Vec<String>,

    /// Extra environment variables merged into every worker's environment, in
    /// addition to the channel fd/slot handoff variables the core sets itself.
    pub worker_env: HashMap<String, String>,

    /// Starting escalation delay, in milliseconds, for graceful termination.
    pub escalation_start_ms: u64,

    /// Escalation ceiling: once the doubling delay exceeds this, SIGKILL is sent.
    pub escalation_ceiling_ms: u64,

    /// How long reconfigure waits after spawning a new generation before draining
    /// the old one.
    pub reconfigure_settle_ms: u64,
}

impl SupervisorConfig {
    /// Loads configuration from files and environment variables using `ConfigBuilder`,
    /// following the same layering convention as the rest of this codebase's
    /// `config.rs`-style loaders.
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("worker_processes", 2)?
            .set_default("worker_program", "/usr/bin/true")?
            .set_default("worker_args", Vec::<String>::new())?
            .set_default("escalation_start_ms", 50)?
            .set_default("escalation_ceiling_ms", 1000)?
            .set_default("reconfigure_settle_ms", 100)?;

        let builder = builder.add_source(File::with_name("Settings").required(false));
        let builder =
            builder.add_source(File::with_name(&format!("Settings.{}", run_mode)).required(false));
        let builder = builder.add_source(Environment::with_prefix("FLEET").separator("__"));

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validates invariants this core relies on beyond what serde enforces.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_processes == 0 {
            return Err("worker_processes must be greater than 0".into());
        }
        if self.escalation_start_ms == 0 {
            return Err("escalation_start_ms must be greater than 0".into());
        }
        if self.escalation_ceiling_ms < self.escalation_start_ms {
            return Err("escalation_ceiling_ms must be >= escalation_start_ms".into());
        }
        Ok(())
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_processes: 2,
            worker_program: PathType::from("/usr/bin/true"),
            worker_args: Vec::new(),
            worker_env: HashMap::new(),
            escalation_start_ms: 50,
            escalation_ceiling_ms: 1000,
            reconfigure_settle_ms: 100,
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = SupervisorConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = SupervisorConfig {
            worker_processes: 0,
            ..SupervisorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_escalation_bounds() {
        let cfg = SupervisorConfig {
            escalation_start_ms: 50,
            escalation_ceiling_ms: 10,
            ..SupervisorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
