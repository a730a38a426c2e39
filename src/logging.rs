// vocalsplit - 日志管理模块
// 提供异步非阻塞的日志持久化功能

use std::path::Path;
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer,
};
use crate::config::{AppConfig, LogLevel};

/// 日志保留天数
const LOG_RETENTION_DAYS: u64 = 7;

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "vocalsplit.log";

/// 从配置文件读取日志级别
fn read_log_level_from_config(data_dir: &Path) -> LogLevel {
    let config_path = data_dir.join("config.json");

    if let Ok(content) = fs::read_to_string(&config_path) {
        if let Ok(config) = serde_json::from_str::<AppConfig>(&content) {
            return config.log_level;
        }
    }

    // 默认 info 级别
    LogLevel::default()
}

/// 构建过滤器字符串
/// - verbose 时至少为 debug
/// - ureq / rustls 只记录 warn（减少 HTTP 库噪音）
fn filter_string(level: &LogLevel, verbose: bool) -> String {
    let level = match (verbose, level) {
        (true, LogLevel::Trace) => "trace",
        (true, _) => "debug",
        (false, level) => level.as_str(),
    };
    format!("{},ureq=warn,rustls=warn", level)
}

/// 初始化日志系统
///
/// 返回 WorkerGuard，必须在 main 函数中保持存活，否则异步日志线程会提前退出
pub fn init_logging(data_dir: &Path, verbose: bool) -> WorkerGuard {
    let log_dir = data_dir.join("logs");

    // 确保日志目录存在
    if let Err(e) = fs::create_dir_all(&log_dir) {
        eprintln!("创建日志目录失败: {}", e);
    }

    // 清理旧日志文件
    cleanup_old_logs(&log_dir);

    // 按天轮转日志文件
    let file_appender = RollingFileAppender::new(
        Rotation::DAILY,
        &log_dir,
        LOG_FILE_PREFIX,
    );

    // 异步非阻塞写入
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let log_level = read_log_level_from_config(data_dir);
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_string(&log_level, verbose)));

    // 文件日志层 - 详细格式
    let file_layer = fmt::layer()
        .with_writer(non_blocking_writer)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(true);

    // 控制台日志层 - 写到 stderr，stdout 留给结果输出
    let console_level = if verbose { LevelFilter::DEBUG } else { LevelFilter::WARN };
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_target(verbose)
        .with_filter(console_level);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}

/// 清理超过保留期限的旧日志文件
fn cleanup_old_logs(log_dir: &Path) {
    let now = std::time::SystemTime::now();
    let retention_duration = std::time::Duration::from_secs(LOG_RETENTION_DAYS * 24 * 60 * 60);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();

        if !path.is_file() {
            continue;
        }

        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };

        if !file_name.starts_with(LOG_FILE_PREFIX) {
            continue;
        }

        let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => continue,
        };

        if let Ok(age) = now.duration_since(modified) {
            if age > retention_duration {
                if let Err(e) = fs::remove_file(&path) {
                    eprintln!("删除旧日志文件失败 {:?}: {}", path, e);
                }
            }
        }
    }
}
