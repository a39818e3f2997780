use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Local time with milliseconds, e.g. `14:03:27.512`.
const TIME_FORMAT: &str = "%H:%M:%S%.3f";

/// Default filter for a verbosity count (`-v`, `-vv`). `RUST_LOG` wins when set.
pub(crate) fn default_filter(verbosity: u8) -> String {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    format!("can2mqtt_lib={level},can2mqtt={level}")
}

/// Create a timestamped log file in `log_dir` and point a `can2mqtt.log`
/// symlink at it (Unix only).
pub(crate) fn create_log_file(log_dir: &Path) -> Result<(PathBuf, std::fs::File), String> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| format!("Failed to create log dir {}: {}", log_dir.display(), e))?;

    let filename = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-can2mqtt.log")
        .to_string();
    let log_path = log_dir.join(&filename);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("Failed to create log file: {}", e))?;

    // Symlinks on Windows need elevated privileges
    #[cfg(unix)]
    {
        let symlink_path = log_dir.join("can2mqtt.log");
        let _ = std::fs::remove_file(&symlink_path);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &symlink_path) {
            eprintln!(
                "{} [logging] Failed to create can2mqtt.log symlink: {}",
                chrono::Local::now().format(TIME_FORMAT),
                e
            );
        }
    }

    Ok((log_path, file))
}

/// Install the global tracing subscriber.
///
/// Logs go to stderr, or to a fresh file in `log_dir` when one is given.
/// Returns the log file path, if any.
pub(crate) fn init(verbosity: u8, log_dir: Option<&Path>) -> Result<Option<PathBuf>, String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

    let (writer, log_path, ansi) = match log_dir {
        Some(dir) => {
            let (path, file) = create_log_file(dir)?;
            (BoxMakeWriter::new(Mutex::new(file)), Some(path), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), None, true),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_writer(writer)
        .with_ansi(ansi)
        .try_init()
        .map_err(|e| format!("Failed to install logger: {}", e))?;

    if let Some(path) = &log_path {
        tracing::info!("file logging started: {}", path.display());
    }

    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_levels() {
        assert_eq!(default_filter(0), "can2mqtt_lib=info,can2mqtt=info");
        assert_eq!(default_filter(1), "can2mqtt_lib=debug,can2mqtt=debug");
        assert_eq!(default_filter(5), "can2mqtt_lib=trace,can2mqtt=trace");
    }

    #[test]
    fn test_create_log_file() {
        let dir = std::env::temp_dir().join(format!("can2mqtt-logs-{}", uuid::Uuid::new_v4()));
        let (path, _file) = create_log_file(&dir).unwrap();

        assert!(path.exists());
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("-can2mqtt.log"));

        #[cfg(unix)]
        {
            let link = std::fs::read_link(dir.join("can2mqtt.log")).unwrap();
            assert_eq!(link, PathBuf::from(&name));
        }

        let _ = std::fs::remove_dir_all(&dir);
    }
}
