use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

fn level_filter(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

/// Logs to stdout and to `<log_dir>/<app_name>_<timestamp>.log`.
pub fn setup_logging(app_name: &str, log_dir: &Path, log_level: &str) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    }

    // Clean up old log files, keeping only the most recent one
    cleanup_old_logs(log_dir, app_name)?;

    let log_file_name = format!("{}_{}.log", app_name, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = log_dir.join(log_file_name);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level_filter(log_level))
        // Connection internals of the HTTP stack are noise at debug level.
        .level_for("hyper_util", log::LevelFilter::Info)
        .level_for("rustls", log::LevelFilter::Info)
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_path).with_context(|| format!("Failed to open log file {}", log_path.display()))?)
        .apply()?;

    Ok(())
}

fn cleanup_old_logs(log_dir: &Path, app_name: &str) -> Result<()> {
    let mut entries: Vec<(SystemTime, std::path::PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| {
            let path = e.path();
            path.extension().is_some_and(|ext| ext == "log")
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(app_name))
        })
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Sort by modification time, newest first
    entries.sort_by_key(|(modified, _)| std::cmp::Reverse(*modified));

    // Keep the most recent one (index 0), delete the rest
    for (_, path) in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to delete old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn only_the_newest_log_of_this_app_survives() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("server_weather_1.log");
        let new = dir.path().join("server_weather_2.log");
        let other = dir.path().join("weather_watch_1.log");
        let notes = dir.path().join("server_weather.txt");
        for path in [&old, &new, &other, &notes] {
            fs::write(path, "x").unwrap();
        }
        let past = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(past)
            .unwrap();

        cleanup_old_logs(dir.path(), "server_weather").unwrap();

        assert!(!old.exists());
        assert!(new.exists());
        assert!(other.exists());
        assert!(notes.exists());
    }

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(level_filter("TRACE"), log::LevelFilter::Trace);
        assert_eq!(level_filter("fatal"), log::LevelFilter::Info);
    }
}
