//! Tracker configuration
//!
//! Loaded from TOML (`reftrack.toml`) or the `REFTRACK_*` environment
//! variables. Every field has a default so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TrackerError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Peg roots whose actual count exceeds the expected count
    #[serde(default = "default_true")]
    pub implicit_peg: bool,

    #[serde(default)]
    pub leak_check: LeakCheckMode,

    /// Bind new objects to the thread that created them
    #[serde(default = "default_false")]
    pub thread_affinity: bool,

    /// Ask the host for a collection every time a peg count drops to zero
    #[serde(default = "default_false")]
    pub peer_stress: bool,

    /// How long `wait_for_idle` blocks before logging that it is still waiting, in milliseconds
    #[serde(default = "default_wait_timeout")]
    pub cycle_wait_timeout_ms: u64,
}

/// What to do when an unreachable object's counts disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeakCheckMode {
    Off,
    #[default]
    Log,
    /// Log, then assert in debug builds
    Assert,
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_wait_timeout() -> u64 {
    100
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            implicit_peg: true,
            leak_check: LeakCheckMode::default(),
            thread_affinity: false,
            peer_stress: false,
            cycle_wait_timeout_ms: default_wait_timeout(),
        }
    }
}

impl TrackerConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| TrackerError::Config(format!("failed to read {}: {}", path.display(), e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| TrackerError::Config(format!("failed to parse config: {}", e)))
    }

    /// Defaults with `REFTRACK_*` overrides applied
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup. Unparseable values are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(val) = lookup("REFTRACK_IMPLICIT_PEG") {
            self.implicit_peg = parse_flag(&val).unwrap_or(self.implicit_peg);
        }

        if let Some(val) = lookup("REFTRACK_LEAK_CHECK") {
            self.leak_check = match val.to_lowercase().as_str() {
                "off" => LeakCheckMode::Off,
                "log" => LeakCheckMode::Log,
                "assert" => LeakCheckMode::Assert,
                _ => self.leak_check,
            };
        }

        if let Some(val) = lookup("REFTRACK_THREAD_AFFINITY") {
            self.thread_affinity = parse_flag(&val).unwrap_or(self.thread_affinity);
        }

        if let Some(val) = lookup("REFTRACK_PEER_STRESS") {
            self.peer_stress = parse_flag(&val).unwrap_or(self.peer_stress);
        }

        if let Some(val) = lookup("REFTRACK_CYCLE_WAIT_TIMEOUT_MS") {
            self.cycle_wait_timeout_ms = val.trim().parse().unwrap_or(self.cycle_wait_timeout_ms);
        }

        self
    }

    pub fn cycle_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.cycle_wait_timeout_ms)
    }
}

fn parse_flag(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
