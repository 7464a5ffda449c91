use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::Result;

/// Timestamp layout of every log line, local time.
pub const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Install the global subscriber: stderr always, plus a timestamped run log
/// under `log_dir` when one is given. Returns the log file path.
pub fn init_logging(log_dir: Option<&Path>) -> Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
        .with_target(false);

    let (file_layer, log_path) = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let path = dir.join(format!(
                "contamination_calculation_{}.log",
                chrono::Local::now().format("%Y%m%d_%H%M%S")
            ));
            let file = File::create(&path)?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
                .with_target(false)
                .with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    // A second init (tests, embedding hosts) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    Ok(log_path)
}
