use std::{fs, path::PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// Target used by the engine implementations for per-call diagnostics.
pub const ENGINE_LOG_TARGET: &str = "cugan_engine";
pub const DEFAULT_NOISE_FILTER: &str = "cugan_engine=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "cugan";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready(RollingFileAppender),
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// Daily-rotated `<data_dir>/logs/cugan.<date>.log`, or a fallback
/// explaining why no file sink is available.
pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(DEFAULT_LOG_RETENTION_FILES)
        .build(&log_dir)
        .map_or_else(
            |error| FileSinkPlan::Fallback {
                attempted_log_dir: Some(log_dir),
                reason: format!("failed to initialize rolling file sink: {error}"),
            },
            FileSinkPlan::Ready,
        )
}

/// Filter precedence: CLI filter, then `-v`/`-vv`, then `RUST_LOG`, then the
/// default. The noise filter only applies when none of the first two were
/// given; the file sink keeps engine diagnostics at debug.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = select_user_filter(options);
    if options.cli_log_filter.is_some() || options.verbose > 0 {
        return LoggingFilterPlan {
            console_filter: user_filter.clone(),
            file_filter: user_filter,
        };
    }

    let file_noise = rewrite_noise_filter_for_file(DEFAULT_NOISE_FILTER);
    LoggingFilterPlan {
        console_filter: format!("{DEFAULT_NOISE_FILTER},{user_filter}"),
        file_filter: format!("{file_noise},{user_filter}"),
    }
}

fn select_user_filter(options: &LoggingInitOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        DEFAULT_LOG_FILTER.to_string()
    }
}

fn rewrite_noise_filter_for_file(noise_filter: &str) -> String {
    let mut directives: Vec<String> = noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .filter(|directive| {
            directive
                .split_once('=')
                .map_or(true, |(target, _)| target.trim() != ENGINE_LOG_TARGET)
        })
        .map(str::to_string)
        .collect();
    directives.push(format!("{ENGINE_LOG_TARGET}=debug"));
    directives.join(",")
}
