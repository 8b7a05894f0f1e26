use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 会话准入配置
    pub session: SessionConfig,
    /// 日志配置
    pub logging: LoggingConfig,
    /// 监控指标配置
    pub metrics: MetricsConfig,
}

/// 会话准入配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// 最大并发会话数，0 表示不限制
    pub max_active_sessions: u64,
    /// 空闲超时（秒）；不配置则不回收空闲会话
    pub idle_timeout_secs: Option<u64>,
    /// 空闲回收扫描间隔（秒）
    pub reap_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_active_sessions: 0,
            idle_timeout_secs: None,
            reap_interval_secs: 5,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: String,
    /// 日志格式：compact / pretty / json
    pub format: Option<String>,
    /// 日志文件路径
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
            file: None,
        }
    }
}

/// 监控指标配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// 是否启用 Prometheus 指标
    pub enabled: bool,
    /// 抓取端点监听地址
    pub listen_address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: "127.0.0.1:9464".to_string(),
        }
    }
}

impl MetricsConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_address
            .parse()
            .with_context(|| format!("无效的指标监听地址: {}", self.listen_address))
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content).context("配置文件格式错误")?;
        Ok(toml_config.into())
    }

    /// 序列化为 TOML（show-config 使用）
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("配置序列化失败")
    }

    /// 从环境变量合并配置（TUNNEL_ 前缀）
    pub fn merge_from_env(&mut self) {
        if let Ok(value) = env::var("TUNNEL_MAX_ACTIVE_SESSIONS") {
            match value.parse() {
                Ok(max) => self.session.max_active_sessions = max,
                Err(_) => warn!("⚠️ 忽略无效的 TUNNEL_MAX_ACTIVE_SESSIONS: {}", value),
            }
        }
        if let Ok(value) = env::var("TUNNEL_IDLE_TIMEOUT_SECS") {
            match value.parse() {
                Ok(secs) => self.session.idle_timeout_secs = Some(secs),
                Err(_) => warn!("⚠️ 忽略无效的 TUNNEL_IDLE_TIMEOUT_SECS: {}", value),
            }
        }
        if let Ok(level) = env::var("TUNNEL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("TUNNEL_LOG_FORMAT") {
            self.logging.format = Some(format);
        }
        if let Ok(address) = env::var("TUNNEL_METRICS_ADDRESS") {
            self.metrics.enabled = true;
            self.metrics.listen_address = address;
        }
    }

    /// 从命令行参数合并配置
    ///
    /// `--max-active-sessions` 不写入这里：它是本地覆盖值，由 `Orchestrator` 处理。
    pub fn merge_from_cli(&mut self, cli: &crate::cli::Cli) {
        if let Some(level) = cli.get_log_level() {
            self.logging.level = level;
        }
        if let Some(format) = cli.get_log_format() {
            self.logging.format = Some(format);
        }
        if let Some(file) = &cli.log_file {
            self.logging.file = Some(file.clone());
        }
        if cli.enable_metrics {
            self.metrics.enabled = true;
        }
        if let Some(address) = &cli.metrics_address {
            self.metrics.enabled = true;
            self.metrics.listen_address = address.clone();
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.session.reap_interval_secs == 0 {
            bail!("session.reap_interval_secs 必须大于 0");
        }
        if self.session.idle_timeout_secs == Some(0) {
            bail!("session.idle_timeout_secs 必须大于 0（不回收请删除该项）");
        }
        if self.metrics.enabled {
            self.metrics.listen_addr()?;
        }
        Ok(())
    }

    /// 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    pub fn load(cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if let Some(config_file) = &cli.config_file {
            if Path::new(config_file).exists() {
                info!("📄 从配置文件加载: {}", config_file);
                Self::from_toml_file(config_file)?
            } else {
                warn!("⚠️ 配置文件不存在: {}", config_file);
                Self::new()
            }
        } else if Path::new("config.toml").exists() {
            info!("📄 从默认配置文件加载: config.toml");
            Self::from_toml_file("config.toml")?
        } else {
            Self::new()
        };

        config.merge_from_env();
        config.merge_from_cli(cli);
        config.validate()?;

        Ok(config)
    }
}

/// 在完整加载配置前读取 [logging] 段，用于尽早初始化日志
pub fn load_early_logging_config(config_file: Option<&str>) -> LoggingConfig {
    let path = config_file.unwrap_or("config.toml");
    fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<TomlConfig>(&content).ok())
        .map(|toml| AppConfig::from(toml).logging)
        .unwrap_or_default()
}

/// TOML 配置文件结构（用于反序列化，所有字段可缺省）
#[derive(Debug, Deserialize)]
struct TomlConfig {
    session: Option<TomlSessionConfig>,
    logging: Option<TomlLoggingConfig>,
    metrics: Option<TomlMetricsConfig>,
}

#[derive(Debug, Deserialize)]
struct TomlSessionConfig {
    max_active_sessions: Option<u64>,
    idle_timeout_secs: Option<u64>,
    reap_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TomlLoggingConfig {
    level: Option<String>,
    format: Option<String>,
    file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TomlMetricsConfig {
    enabled: Option<bool>,
    listen_address: Option<String>,
}

impl From<TomlConfig> for AppConfig {
    fn from(toml: TomlConfig) -> Self {
        let mut config = Self::default();

        if let Some(session) = toml.session {
            if let Some(max) = session.max_active_sessions {
                config.session.max_active_sessions = max;
            }
            if session.idle_timeout_secs.is_some() {
                config.session.idle_timeout_secs = session.idle_timeout_secs;
            }
            if let Some(interval) = session.reap_interval_secs {
                config.session.reap_interval_secs = interval;
            }
        }

        if let Some(logging) = toml.logging {
            if let Some(level) = logging.level {
                config.logging.level = level;
            }
            config.logging.format = logging.format;
            config.logging.file = logging.file;
        }

        if let Some(metrics) = toml.metrics {
            if let Some(enabled) = metrics.enabled {
                config.metrics.enabled = enabled;
            }
            if let Some(address) = metrics.listen_address {
                config.metrics.listen_address = address;
            }
        }

        config
    }
}
