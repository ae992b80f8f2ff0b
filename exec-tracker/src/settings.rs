use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

const ENV_PREFIX: &str = "EXEC_TRACKER";

const DEFAULT_PERF_PAGES: usize = 64;
const DEFAULT_CHANNEL_CAPACITY: usize = 4096;
const DEFAULT_BATCH_LIMIT: usize = 1024;
const DEFAULT_READ_BUFFERS: usize = 16;
const DEFAULT_ACTIVITY_INTERVAL_MS: u64 = 200;
const DEFAULT_ACTIVITY_SLOTS: usize = 80;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 500;
const DEFAULT_MAX_EXECUTIONS: usize = 500;

/// Perf buffer and hand-off sizing.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CollectorSettings {
    /// Pages per CPU for each perf buffer; must be a power of two.
    pub perf_pages: usize,
    pub channel_capacity: usize,
    /// Maximum records returned by one poll.
    pub batch_limit: usize,
    /// Read slots handed to each perf buffer read.
    pub read_buffers: usize,
    /// Length of one exec activity slot.
    pub activity_interval_ms: u64,
    pub activity_slots: usize,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            perf_pages: DEFAULT_PERF_PAGES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            batch_limit: DEFAULT_BATCH_LIMIT,
            read_buffers: DEFAULT_READ_BUFFERS,
            activity_interval_ms: DEFAULT_ACTIVITY_INTERVAL_MS,
            activity_slots: DEFAULT_ACTIVITY_SLOTS,
        }
    }
}

impl CollectorSettings {
    pub fn activity_interval(&self) -> Duration {
        Duration::from_millis(self.activity_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `pid, comm`
    #[default]
    Plain,
    /// One JSON object per line
    Json,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputSettings {
    pub format: OutputFormat,
    pub poll_timeout_ms: u64,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
        }
    }
}

impl OutputSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiSettings {
    /// Socket address for the HTTP API; disabled when unset.
    pub listen: Option<String>,
    pub max_executions: usize,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            listen: None,
            max_executions: DEFAULT_MAX_EXECUTIONS,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub collector: CollectorSettings,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub api: ApiSettings,
}

impl Settings {
    /// Loads settings from an optional YAML file, then from
    /// `EXEC_TRACKER__<SECTION>__<KEY>` environment variables.
    pub fn new(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }

        let s = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_defaults_without_sources() {
        let settings = Settings::new(None).expect("Failed to load settings");

        assert_eq!(settings.collector.perf_pages, DEFAULT_PERF_PAGES);
        assert_eq!(settings.collector.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(settings.collector.activity_interval(), Duration::from_millis(200));
        assert_eq!(settings.collector.activity_slots, 80);
        assert_eq!(settings.output.format, OutputFormat::Plain);
        assert_eq!(settings.output.poll_timeout(), Duration::from_millis(500));
        assert_eq!(settings.api.listen, None);
        assert_eq!(settings.api.max_executions, 500);
    }

    #[test]
    #[serial]
    fn test_load_from_env() {
        unsafe {
            std::env::set_var("EXEC_TRACKER__COLLECTOR__PERF_PAGES", "8");
            std::env::set_var("EXEC_TRACKER__OUTPUT__FORMAT", "json");
            std::env::set_var("EXEC_TRACKER__API__LISTEN", "127.0.0.1:3000");
        }

        let settings = Settings::new(None).expect("Failed to load settings");

        unsafe {
            std::env::remove_var("EXEC_TRACKER__COLLECTOR__PERF_PAGES");
            std::env::remove_var("EXEC_TRACKER__OUTPUT__FORMAT");
            std::env::remove_var("EXEC_TRACKER__API__LISTEN");
        }

        assert_eq!(settings.collector.perf_pages, 8);
        assert_eq!(settings.collector.batch_limit, DEFAULT_BATCH_LIMIT);
        assert_eq!(settings.output.format, OutputFormat::Json);
        assert_eq!(settings.api.listen.as_deref(), Some("127.0.0.1:3000"));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let path = std::env::temp_dir().join(format!("exec-tracker-{}.yaml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "collector:\n  read_buffers: 4\n  channel_capacity: 32\n  activity_slots: 20"
        )
        .unwrap();
        writeln!(file, "api:\n  max_executions: 10").unwrap();
        drop(file);

        unsafe {
            std::env::set_var("EXEC_TRACKER__COLLECTOR__CHANNEL_CAPACITY", "64");
        }
        let settings = Settings::new(Some(&path));
        unsafe {
            std::env::remove_var("EXEC_TRACKER__COLLECTOR__CHANNEL_CAPACITY");
        }
        std::fs::remove_file(&path).unwrap();

        let settings = settings.expect("Failed to load settings");
        assert_eq!(settings.collector.read_buffers, 4);
        assert_eq!(settings.collector.channel_capacity, 64);
        assert_eq!(settings.collector.activity_slots, 20);
        assert_eq!(settings.api.max_executions, 10);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let path = Path::new("/nonexistent/exec-tracker.yaml");
        assert!(Settings::new(Some(path)).is_err());
    }
}
