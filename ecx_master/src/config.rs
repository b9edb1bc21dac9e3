//! TOML configuration loader with validation.
//!
//! Every field carries a default, so an empty file (or no file at all)
//! yields a runnable simulation configuration. Numeric parameters have
//! const `MIN`/`MAX` bounds checked by [`MasterConfig::validate`].

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Lower bound for the cycle time [µs].
pub const CYCLE_TIME_US_MIN: u32 = 100;
/// Upper bound for the cycle time [µs].
pub const CYCLE_TIME_US_MAX: u32 = 1_000_000;
/// Lowest valid SCHED_FIFO priority.
pub const RT_PRIORITY_MIN: i32 = 1;
/// Highest valid SCHED_FIFO priority.
pub const RT_PRIORITY_MAX: i32 = 99;

// ─── Config ─────────────────────────────────────────────────────────

/// Master configuration, loaded from TOML at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    /// Network interface to bind, or `"sim"` for the simulated bus.
    #[serde(default = "default_ifname")]
    pub ifname: String,

    /// Bus instance id; scopes every shared segment and semaphore name,
    /// so several masters can coexist on one host.
    #[serde(default)]
    pub instance: u32,

    /// Target cycle time in microseconds (default: 1000 = 1 ms).
    #[serde(default = "default_cycle_time_us")]
    pub cycle_time_us: u32,

    /// CPU core the cyclic loop is pinned to (`rt` builds only).
    #[serde(default = "default_cpu_core")]
    pub cpu_core: usize,

    /// SCHED_FIFO priority of the cyclic loop (`rt` builds only).
    #[serde(default = "default_rt_priority")]
    pub rt_priority: i32,
}

fn default_ifname() -> String {
    "sim".to_string()
}

fn default_cycle_time_us() -> u32 {
    1000
}

fn default_cpu_core() -> usize {
    1
}

fn default_rt_priority() -> i32 {
    80
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            ifname: default_ifname(),
            instance: 0,
            cycle_time_us: default_cycle_time_us(),
            cpu_core: default_cpu_core(),
            rt_priority: default_rt_priority(),
        }
    }
}

impl MasterConfig {
    /// Validate parameter bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ifname.is_empty() {
            return Err(ConfigError::Validation(
                "ifname must not be empty".to_string(),
            ));
        }
        if !(CYCLE_TIME_US_MIN..=CYCLE_TIME_US_MAX).contains(&self.cycle_time_us) {
            return Err(ConfigError::Validation(format!(
                "cycle_time_us {} out of range [{CYCLE_TIME_US_MIN}, {CYCLE_TIME_US_MAX}]",
                self.cycle_time_us
            )));
        }
        if !(RT_PRIORITY_MIN..=RT_PRIORITY_MAX).contains(&self.rt_priority) {
            return Err(ConfigError::Validation(format!(
                "rt_priority {} out of range [{RT_PRIORITY_MIN}, {RT_PRIORITY_MAX}]",
                self.rt_priority
            )));
        }
        Ok(())
    }
}

// ─── Error type ─────────────────────────────────────────────────────

/// Configuration loading/validation error.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path as given on the command line.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or type error.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A parameter is out of bounds.
    #[error("config validation: {0}")]
    Validation(String),
}

/// Load and validate a master configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<MasterConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let config: MasterConfig = toml::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_simulation_defaults() {
        let config: MasterConfig = toml::from_str("").unwrap();
        assert_eq!(config.ifname, "sim");
        assert_eq!(config.instance, 0);
        assert_eq!(config.cycle_time_us, 1000);
        assert_eq!(config.cpu_core, 1);
        assert_eq!(config.rt_priority, 80);
        config.validate().unwrap();
    }

    #[test]
    fn full_file_parses() {
        let raw = r#"
            ifname = "enp3s0"
            instance = 2
            cycle_time_us = 500
            cpu_core = 3
            rt_priority = 55
        "#;
        let config: MasterConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.ifname, "enp3s0");
        assert_eq!(config.instance, 2);
        assert_eq!(config.cycle_time_us, 500);
        assert_eq!(config.cpu_core, 3);
        assert_eq!(config.rt_priority, 55);
        config.validate().unwrap();
    }

    #[test]
    fn cycle_time_bounds_are_enforced() {
        let too_fast = MasterConfig {
            cycle_time_us: CYCLE_TIME_US_MIN - 1,
            ..MasterConfig::default()
        };
        assert!(matches!(
            too_fast.validate(),
            Err(ConfigError::Validation(_))
        ));

        let too_slow = MasterConfig {
            cycle_time_us: CYCLE_TIME_US_MAX + 1,
            ..MasterConfig::default()
        };
        assert!(too_slow.validate().is_err());

        let edges = MasterConfig {
            cycle_time_us: CYCLE_TIME_US_MAX,
            ..MasterConfig::default()
        };
        edges.validate().unwrap();
    }

    #[test]
    fn rt_priority_bounds_are_enforced() {
        let zero = MasterConfig {
            rt_priority: 0,
            ..MasterConfig::default()
        };
        assert!(zero.validate().is_err());

        let over = MasterConfig {
            rt_priority: 100,
            ..MasterConfig::default()
        };
        assert!(over.validate().is_err());

        let top = MasterConfig {
            rt_priority: RT_PRIORITY_MAX,
            ..MasterConfig::default()
        };
        top.validate().unwrap();
    }

    #[test]
    fn empty_ifname_is_rejected() {
        let config = MasterConfig {
            ifname: String::new(),
            ..MasterConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn load_config_reads_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ifname = \"sim\"\ncycle_time_us = 2000").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.cycle_time_us, 2000);
        assert_eq!(config.ifname, "sim");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_config(Path::new("/nonexistent/ecx_master.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cycle_time_us = \"fast\"").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn out_of_range_file_is_a_validation_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cycle_time_us = 1").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
