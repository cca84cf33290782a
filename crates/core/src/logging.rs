use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::{self, Write},
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// Appended when the user did not pick a filter explicitly.
pub const DEFAULT_NOISE_FILTER: &str = "ort=warn";
/// The file sink always keeps per-tile detail, whatever the console shows.
pub const FILE_DETAIL_FILTER: &str = "upscaler_core::tiling=debug";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
pub const LOG_FILE_PREFIX: &str = "upscaler";
pub const LOG_FILE_SUFFIX: &str = "log";

static CRASH_HOOK_LOCK: Mutex<()> = Mutex::new(());
static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static CRASH_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static CRASH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub data_dir: Option<PathBuf>,
    /// `-v` count.
    pub verbose: u8,
    /// `--log-filter`.
    pub cli_filter: Option<String>,
    /// `RUST_LOG`.
    pub env_filter: Option<String>,
    pub retention_files: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_filter: None,
            env_filter: None,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogOptions {
    /// Filter precedence: `--log-filter` > `-v`/`-vv` > `RUST_LOG` > `info`.
    /// The noise filter is only added when the choice was implicit.
    pub fn filters(&self) -> LogFilters {
        let explicit = self.cli_filter.is_some() || self.verbose > 0;
        let user = if let Some(filter) = self.cli_filter.as_deref() {
            filter.to_string()
        } else if self.verbose >= 2 {
            "trace".to_string()
        } else if self.verbose == 1 {
            "debug".to_string()
        } else if let Some(filter) = self.env_filter.as_deref() {
            filter.to_string()
        } else {
            DEFAULT_LOG_FILTER.to_string()
        };

        if explicit {
            return LogFilters {
                console: user.clone(),
                file: user,
            };
        }
        LogFilters {
            console: format!("{DEFAULT_NOISE_FILTER},{user}"),
            file: format!("{DEFAULT_NOISE_FILTER},{FILE_DETAIL_FILTER},{user}"),
        }
    }
}

#[derive(Debug)]
pub enum FileSink {
    Rolling {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    /// Console-only logging; `reason` is shown once at startup.
    Unavailable {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSink {
    pub fn is_rolling(&self) -> bool {
        matches!(self, Self::Rolling { .. })
    }
}

/// Daily rolling `upscaler.*.log` files under `<data_dir>/logs`.
pub fn open_file_sink(options: &LogOptions) -> FileSink {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSink::Unavailable {
            attempted_log_dir: None,
            reason: "no data directory configured".to_string(),
        };
    };

    let log_dir = data_dir.join(LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSink::Unavailable {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let retention = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };
    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSink::Rolling { log_dir, appender },
        Err(error) => FileSink::Unavailable {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to open rolling log file: {error}"),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashHook {
    Installed { crash_dir: PathBuf },
    AlreadyInstalled { crash_dir: PathBuf },
    Unavailable { reason: String },
}

/// Installs a panic hook that writes a crash report into
/// `<data_dir>/logs/crash` before delegating to the previous hook.
pub fn install_crash_hook(data_dir: Option<&Path>) -> CrashHook {
    if let Some(crash_dir) = CRASH_DIR.get() {
        return CrashHook::AlreadyInstalled {
            crash_dir: crash_dir.clone(),
        };
    }
    let Some(data_dir) = data_dir else {
        return CrashHook::Unavailable {
            reason: "no data directory configured".to_string(),
        };
    };

    let crash_dir = data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return CrashHook::Unavailable {
            reason: format!("failed to create {}: {error}", crash_dir.display()),
        };
    }

    let _guard = CRASH_HOOK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = CRASH_DIR.get() {
        return CrashHook::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let previous = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_crash(&hook_dir, info);
        previous(info);
    }));

    let _ = CRASH_DIR.set(crash_dir.clone());
    CrashHook::Installed { crash_dir }
}

#[derive(Debug)]
struct CrashReport {
    timestamp: chrono::DateTime<chrono::Utc>,
    thread: String,
    location: String,
    payload: String,
    backtrace_status: &'static str,
    backtrace: String,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::capture();
        let backtrace_status = match backtrace.status() {
            BacktraceStatus::Captured => "captured",
            BacktraceStatus::Disabled => "disabled (set RUST_BACKTRACE=1 to enable)",
            BacktraceStatus::Unsupported => "unsupported",
            _ => "unknown",
        };
        Self {
            timestamp: chrono::Utc::now(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload: payload_text(info.payload()),
            backtrace_status,
            backtrace: backtrace.to_string(),
        }
    }
}

fn record_crash(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic while writing the report must not recurse into the hook.
    if CRASH_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let written = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        write_crash_report(crash_dir, &CrashReport::capture(info))
    }));
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: could not write crash report to '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: crash hook panicked while writing to '{}'",
            crash_dir.display()
        ),
    }

    CRASH_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn write_crash_report(crash_dir: &Path, report: &CrashReport) -> io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;
    let sequence = CRASH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = crash_dir.join(format!(
        "crash-{}-{sequence:04}.log",
        report.timestamp.format("%Y%m%d-%H%M%S")
    ));

    let mut file = fs::File::create(&path)?;
    writeln!(file, "time={}", report.timestamp.to_rfc3339())?;
    writeln!(file, "thread={}", report.thread)?;
    writeln!(file, "location={}", report.location)?;
    writeln!(file, "message={}", report.payload)?;
    writeln!(file, "backtrace_status={}", report.backtrace_status)?;
    writeln!(file, "{}", report.backtrace)?;
    file.flush()?;
    Ok(path)
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
