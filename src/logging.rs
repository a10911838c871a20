//! Logging setup (C12).
//!
//! One log file per run under a run directory named by process id, plus a
//! `last` convenience symlink. The formatter tags each line with the
//! originating execution context (session / engine-io / guest), timestamp,
//! level, and source location, mirroring the teacher's `env_logger::Builder`
//! custom-format closure. A panic hook routes panics through `log::error!`
//! instead of letting them print raw to stderr.

use chrono::Local;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Chooses (and creates) a per-process run directory under `base`.
pub fn run_dir_for(base: &Path, pid: u32) -> std::io::Result<PathBuf> {
    let dir = base.join(pid.to_string());
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Installs env_logger with the adapter's custom formatter, writing to a file
/// under `log_dir` (or the value of `DAPPER_LOG_DIR` if `log_dir` is `None`).
/// Also installs a panic hook that logs via `log::error!`.
pub fn init(log_dir: Option<PathBuf>) -> std::io::Result<PathBuf> {
    let base = log_dir
        .or_else(|| std::env::var(crate::config::ENV_LOG_DIR).ok().map(PathBuf::from))
        .unwrap_or_else(std::env::temp_dir);
    let run_dir = run_dir_for(&base, std::process::id())?;
    let log_path = run_dir.join("dapper.log");
    let file = File::create(&log_path)?;

    let level = std::env::var(crate::config::ENV_LOG_LEVEL).unwrap_or_else(|_| "info".into());

    let mut builder = env_logger::Builder::new();
    builder
        .parse_filters(&level)
        .format(move |buf, record| {
            let thread = std::thread::current();
            let thread_name = thread.name().unwrap_or("unnamed");
            writeln!(
                buf,
                "[{thread_name}] {}:{} {} [{}] {}",
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(file)))
        .try_init()
        .ok();

    let last = base.join("last");
    let _ = std::fs::remove_file(&last);
    #[cfg(unix)]
    if let Err(e) = std::os::unix::fs::symlink(&run_dir, &last) {
        log::warn!("could not create 'last' run symlink: {e}");
    }

    std::panic::set_hook(Box::new(|info| {
        log::error!("panic: {info}");
    }));

    Ok(log_path)
}
