// =================================================================
// logging.rs - Tracing Subscriber Setup
// =================================================================

use serde::Deserialize;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Filter directive used when RUST_LOG is unset, e.g. "info" or "stream_core=debug"
    pub level: String,
    pub format: LogFormat,
    pub with_target: bool,
    pub with_file: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            with_target: true,
            with_file: false,
        }
    }
}

impl LogSettings {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the global subscriber. Only binaries call this.
pub fn init_tracing(settings: &LogSettings) -> Result<(), String> {
    let builder = fmt()
        .with_env_filter(settings.filter())
        .with_target(settings.with_target)
        .with_file(settings.with_file)
        .with_line_number(settings.with_file);

    let result = match settings.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| format!("Failed to install tracing subscriber: {}", e))
}
