//! Logging infrastructure - structured tracing for the tracking protocol
//!
//! Design: `tracing` events with a per-concern target:
//! - `reftrack::cycle` - cycle brackets and per-phase summaries
//! - `reftrack::walk` - per-object walk decisions (trace level)
//! - `reftrack::peg` - peg transitions and implicit pegs
//! - `reftrack::leak` - suspected tracker leaks
//!
//! Console output by default, optional non-blocking file output.

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::tracker::{CoreId, TrackerId, WalkPhase};

/// Set once; holds the file writer guard so buffered lines are flushed at exit
static LOGGER: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    /// Log file path; `None` logs to stdout only
    pub log_path: Option<String>,
    pub json_format: bool,
    /// Show span enter/close events
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // REFTRACK_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("REFTRACK_LOG_LEVEL") {
            config.level = parse_level(&level_str);
        }

        if let Ok(path) = std::env::var("REFTRACK_LOG_FILE") {
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("REFTRACK_LOG_JSON").is_ok();
        config.show_spans = std::env::var("REFTRACK_LOG_SPANS").is_ok();

        config
    }

    /// Errors only
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            ..Self::default()
        }
    }

    /// Everything, including per-object walk decisions, mirrored to a file
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            log_path: Some("reftrack.log".to_string()),
            json_format: false,
            show_spans: true,
        }
    }
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with configuration from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration. Later calls are no-ops.
pub fn init_with_config(config: LogConfig) {
    LOGGER.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("reftrack={}", config.level.as_str().to_lowercase())));

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let console = if config.json_format {
            fmt::layer()
                .json()
                .with_writer(io::stdout)
                .with_span_events(span_events.clone())
                .boxed()
        } else {
            fmt::layer()
                .with_writer(io::stdout)
                .with_span_events(span_events.clone())
                .with_target(true)
                .with_thread_ids(cfg!(debug_assertions))
                .with_line_number(cfg!(debug_assertions))
                .boxed()
        };

        let (file_layer, guard) = match config.log_path.as_deref() {
            Some(path) => {
                let path = Path::new(path);
                let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
                let file_name = path.file_name().map(|n| n.to_owned()).unwrap_or_else(|| "reftrack.log".into());
                let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
                let layer = fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_span_events(span_events);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        // Another subscriber may already be installed (tests, embedding hosts)
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console)
            .with(file_layer)
            .try_init()
            .ok();

        guard
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER.get().is_some()
}

// ============================================================================
// Protocol events
// ============================================================================

pub fn log_cycle_start(cycle: u64, cores: usize) {
    tracing::debug!(target: "reftrack::cycle", cycle, cores, "reference tracking cycle started");
}

pub fn log_phase_complete(core: CoreId, phase: WalkPhase, visited: usize, pruned: usize) {
    tracing::debug!(
        target: "reftrack::cycle",
        core = %core,
        phase = ?phase,
        visited,
        pruned,
        "walk phase complete"
    );
}

pub fn log_cycle_complete(cycle: u64, duration_us: u64, peers_walked: usize, targets_found: usize, unreachable: usize) {
    tracing::info!(
        target: "reftrack::cycle",
        cycle,
        duration_us,
        peers_walked,
        targets_found,
        unreachable,
        "reference tracking cycle complete"
    );
}

#[inline]
pub fn log_walk_pruned(object: TrackerId, phase: WalkPhase, is_root: bool) {
    tracing::trace!(target: "reftrack::walk", object = %object, phase = ?phase, is_root, "pruned");
}

pub fn log_implicit_peg(object: TrackerId, expected: usize, actual: usize) {
    tracing::debug!(
        target: "reftrack::peg",
        object = %object,
        expected,
        actual,
        "implicit peg from untracked reference"
    );
}

pub fn log_unreachable(object: TrackerId, disconnected: bool) {
    tracing::debug!(target: "reftrack::cycle", object = %object, disconnected, "object unreachable");
}

pub fn log_suspected_leak(object: TrackerId, expected: usize, actual: usize) {
    tracing::warn!(
        target: "reftrack::leak",
        object = %object,
        expected,
        actual,
        "suspected tracker leak: reference counts disagree on an unreachable object"
    );
}

pub fn log_core_lifecycle(core: CoreId, event: &'static str, peers: usize) {
    tracing::info!(target: "reftrack::cycle", core = %core, event, peers, "core lifecycle");
}

/// Time a block of code and log its duration at debug level
///
/// Usage:
/// ```ignore
/// time_block!("peg_walk", {
///     // code to time
/// });
/// ```
#[macro_export]
macro_rules! time_block {
    ($name:expr, $block:block) => {{
        let _span = ::tracing::debug_span!($name).entered();
        let start = ::std::time::Instant::now();
        let result = $block;
        ::tracing::debug!(
            target: "reftrack::cycle",
            operation = $name,
            duration_us = start.elapsed().as_micros() as u64,
            "operation complete"
        );
        result
    }};
}
