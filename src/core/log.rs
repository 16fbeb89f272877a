//! 日志系统模块
//!
//! 基于 `tracing` 提供结构化的日志记录功能。
//!
//! # 使用示例
//!
//! ```no_run
//! use dist_rhi::core::log;
//! use dist_rhi::core::config::LogLevel;
//!
//! log::init_logger(LogLevel::Info, false, None);
//! tracing::info!(frames_in_flight = 2, "Device created");
//! ```
//!
//! 不可恢复的状态（同步超时、命令流溢出、超出单帧提交上限）统一通过
//! `gpu_fatal!` 上报：先以 error 级别写入 `dist_rhi::fatal` 目标，再终止。

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use std::path::Path;

use super::config::LogLevel;

/// 初始化日志系统
///
/// 必须在程序开始时调用一次；重复调用会被忽略。
///
/// # 参数
///
/// * `level` - 日志级别（`RUST_LOG` 环境变量优先）
/// * `file_output` - 是否输出到文件
/// * `log_file_path` - 日志文件路径（可选，默认为 "dist_rhi.log"）
pub fn init_logger(level: LogLevel, file_output: bool, log_file_path: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_ansi(true);

    let result = if file_output {
        let log_path = log_file_path.unwrap_or("dist_rhi.log");
        let path = Path::new(log_path);
        let directory = path.parent().unwrap_or(Path::new("."));
        let filename = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("dist_rhi.log");

        let file_appender = RollingFileAppender::new(Rotation::DAILY, directory, filename);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Logger already initialized, keeping the existing subscriber");
    }
}

fn level_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

/// 记录致命错误并终止
///
/// 用于继续执行会破坏 GPU 状态的情形。
#[macro_export]
macro_rules! gpu_fatal {
    ($($arg:tt)*) => {{
        tracing::error!(target: "dist_rhi::fatal", $($arg)*);
        panic!($($arg)*)
    }};
}

/// 日志级别转换
impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(level_directive(LogLevel::Warn), "warn");
    }

    #[test]
    fn test_init_logger_twice_is_harmless() {
        init_logger(LogLevel::Debug, false, None);
        init_logger(LogLevel::Info, false, None);
    }

    #[test]
    #[should_panic(expected = "sync wait timed out after 5000 ms")]
    fn test_gpu_fatal_panics() {
        gpu_fatal!("sync wait timed out after {} ms", 5000);
    }
}
