use std::path::Path;

use anyhow::{anyhow, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化日志系统
///
/// 指定 `log_file` 时日志写入文件（非阻塞），返回的 guard 必须保持到进程退出，
/// 否则缓冲中的日志会丢失。
pub fn init_logging(
    log_level: &str,
    log_format: Option<&str>,
    log_file: Option<&str>,
    quiet: bool,
) -> Result<Option<WorkerGuard>> {
    // 静默模式只输出错误
    let level = if quiet { "error" } else { log_level };

    // RUST_LOG 优先
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, guard) = match log_file {
        Some(path) => {
            let path = Path::new(path);
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow!("无效的日志文件路径: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };
    let ansi = log_file.is_none();

    let result = match log_format {
        Some("json") => {
            // JSON 格式（适合生产环境）
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(writer))
                .try_init()
        }
        Some("pretty") | Some("dev") => {
            // Pretty 格式（适合开发环境）
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty().with_ansi(ansi).with_writer(writer))
                .try_init()
        }
        _ => {
            // Compact 格式（默认）
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_ansi(ansi).with_writer(writer))
                .try_init()
        }
    };
    result.map_err(|e| anyhow!("日志系统初始化失败: {}", e))?;

    Ok(guard)
}
