use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::DebuggerError;

/// Name under which the debugger module is preloaded into Lua.
pub const DEFAULT_MODULE_NAME: &str = "emmy_core";

/// Runtime settings for the debugger facade and engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    /// Module name passed to `require` by debugged scripts.
    pub module_name: String,
    /// Interval of the forced re-check while waiting for the IDE.
    pub wake_interval_ms: u64,
    /// Upper bound for the initial wait for the IDE, unbounded when unset.
    pub ready_timeout_ms: Option<u64>,
    pub connect_timeout_ms: u64,
    /// How many levels of tables are expanded in break notifications.
    pub stack_variable_depth: usize,
    /// Maximum number of entries expanded per table level.
    pub max_children: usize,
    pub log_filter: String,
    /// Forward the debugger's own log lines to the IDE console.
    pub forward_logs: bool,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            module_name: DEFAULT_MODULE_NAME.to_string(),
            wake_interval_ms: 100,
            ready_timeout_ms: None,
            connect_timeout_ms: 5_000,
            stack_variable_depth: 1,
            max_children: 100,
            log_filter: "emmy_core=info".to_string(),
            forward_logs: false,
        }
    }
}

impl DebuggerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, DebuggerError> {
        let config: Self = toml::from_str(s).map_err(|e| DebuggerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DebuggerError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            DebuggerError::Config(format!("Failed to read '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), DebuggerError> {
        if self.wake_interval_ms == 0 {
            return Err(DebuggerError::Config(
                "wake_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.module_name.is_empty() {
            return Err(DebuggerError::Config("module_name must not be empty".to_string()));
        }
        Ok(())
    }

    #[inline(always)]
    pub fn wake_interval(&self) -> Duration {
        Duration::from_millis(self.wake_interval_ms)
    }

    #[inline(always)]
    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }

    #[inline(always)]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
