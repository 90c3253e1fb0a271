use std::path::PathBuf;

use time::{UtcOffset, format_description::well_known::Iso8601};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
};

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Where log lines go and what is logged when `RUST_LOG` is unset.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Also write to this file (created or truncated), without colors.
    pub log_file: Option<PathBuf>,
    pub console: bool,
    pub default_directive: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_file: None,
            console: true,
            default_directive: DEFAULT_DIRECTIVE.to_string(),
        }
    }
}

pub struct Guard {
    _private: (),
}

impl Drop for Guard {
    fn drop(&mut self) {}
}

/// Log to the console, filtered by `RUST_LOG` (default `info`).
pub fn init() -> Result<Guard, Error> {
    initiate_logging(LogOptions::default())
}

fn env_filter(default_directive: &str) -> Result<EnvFilter, Error> {
    match std::env::var("RUST_LOG") {
        Ok(var) if !var.is_empty() => Ok(EnvFilter::try_new(var)?),
        _ => Ok(EnvFilter::try_new(default_directive)?),
    }
}

/// Start logging to file and console, both optional.
pub fn initiate_logging(opts: LogOptions) -> Result<Guard, Error> {
    // Timestamps use the local offset at the time logging starts.
    let timer = OffsetTime::new(
        UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?,
        Iso8601::DEFAULT,
    );

    let file_layer = match &opts.log_file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            Some(
                fmt::layer()
                    .with_timer(timer.clone())
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true),
            )
        }
        None => None,
    };

    let console_layer = opts.console.then(|| {
        fmt::layer()
            .with_timer(timer)
            .with_ansi(!cfg!(windows))
            .with_file(true)
            .with_line_number(true)
    });

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(env_filter(&opts.default_directive)?);
    tracing::subscriber::set_global_default(collector)?;

    if let Some(path) = &opts.log_file {
        tracing::debug!("Logging initiated to file \"{}\".", path.display());
    }
    if opts.console {
        tracing::debug!("Logging initiated to console.");
    }

    Ok(Guard { _private: () })
}
