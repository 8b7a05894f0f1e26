use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tunnel_session::{
    cli::{Cli, Commands},
    config::{self, AppConfig},
    infra::metrics::{self, PrometheusReporter},
    logging, CloseReason, Orchestrator, SessionLimiter, SessionRegistry,
};

/// 限流器状态指标的刷新间隔
const LIMITER_GAUGE_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // 加载 .env 文件（如果存在）
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if let Some(command) = &cli.command {
        return match command {
            Commands::GenerateConfig { path } => generate_config(path),
            Commands::ValidateConfig { path } => validate_config(path),
            Commands::ShowConfig => show_config(&cli),
        };
    }

    // 快速读取 [logging] 段（优先级：CLI > config.toml > 默认值）
    let early_log = config::load_early_logging_config(cli.config_file.as_deref());
    let log_level = cli.get_log_level().unwrap_or(early_log.level);
    let log_format = cli.get_log_format().or(early_log.format);
    let log_file = cli.log_file.clone().or(early_log.file);
    let _log_guard = logging::init_logging(
        &log_level,
        log_format.as_deref(),
        log_file.as_deref(),
        cli.quiet,
    )?;

    tracing::info!("🚀 tunnel-sessiond starting...");

    let config = AppConfig::load(&cli).context("加载配置失败")?;

    tracing::info!("📊 Session Configuration:");
    tracing::info!(
        "  - Max Active Sessions: {}",
        describe_limit(cli.max_active_sessions.unwrap_or(config.session.max_active_sessions))
    );
    tracing::info!("  - Local Override: {}", cli.max_active_sessions.is_some());
    tracing::info!("  - Idle Timeout: {:?}", config.session.idle_timeout());
    tracing::info!("  - Metrics: {}", config.metrics.enabled);

    if config.metrics.enabled {
        let addr = config.metrics.listen_addr()?;
        metrics::init(Some(addr))?;
        tracing::info!("📈 Prometheus metrics listening on {}", addr);
    }

    let limiter = Arc::new(SessionLimiter::new(config.session.max_active_sessions));
    let orchestrator = Orchestrator::new(
        limiter.clone(),
        config.session.max_active_sessions,
        cli.max_active_sessions,
    );
    let registry = Arc::new(
        SessionRegistry::new(limiter.clone(), Arc::new(PrometheusReporter))
            .with_idle_timeout(config.session.idle_timeout()),
    );

    let reaper = registry.spawn_idle_reaper(config.session.reap_interval());

    let gauge_limiter = limiter.clone();
    let gauge_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(LIMITER_GAUGE_INTERVAL);
        loop {
            interval.tick().await;
            metrics::record_limiter_state(gauge_limiter.active(), gauge_limiter.limit());
        }
    });

    tracing::info!(
        "✅ session registry ready (config version {})",
        orchestrator.current_version()
    );

    tokio::signal::ctrl_c()
        .await
        .context("无法监听退出信号")?;

    tracing::info!("🛑 shutting down...");
    let closed = registry.shutdown(CloseReason::Shutdown);
    gauge_task.abort();
    let _ = reaper.await;
    tracing::info!("👋 closed {} sessions, active slots left: {}", closed, limiter.active());

    Ok(())
}

fn describe_limit(limit: u64) -> String {
    if limit == 0 {
        "unlimited".to_string()
    } else {
        limit.to_string()
    }
}

/// 生成默认配置文件
fn generate_config(path: &str) -> Result<()> {
    let default_config = r#"# tunnel-sessiond 配置文件
# 此文件由 tunnel-sessiond generate-config 生成

[session]
# 最大并发会话数，0 表示不限制（可被远端配置或 --max-active-sessions 覆盖）
max_active_sessions = 0
# 空闲超时（秒），不配置则不回收空闲会话
# idle_timeout_secs = 210
reap_interval_secs = 5

[logging]
level = "info"
# format = "json"
# file = "logs/tunnel-sessiond.log"

[metrics]
enabled = false
listen_address = "127.0.0.1:9464"
"#;

    fs::write(path, default_config).with_context(|| format!("无法写入配置文件: {}", path))?;
    println!("✅ 已生成配置文件: {}", path);
    Ok(())
}

/// 验证配置文件
fn validate_config(path: &str) -> Result<()> {
    let config = AppConfig::from_toml_file(path)?;
    config.validate()?;
    println!("✅ 配置文件有效: {}", path);
    Ok(())
}

/// 显示合并后的配置
fn show_config(cli: &Cli) -> Result<()> {
    let config = AppConfig::load(cli)?;
    println!("{}", config.to_toml_string()?);
    if let Some(limit) = cli.max_active_sessions {
        println!("# --max-active-sessions 覆盖: {}", describe_limit(limit));
    }
    Ok(())
}
