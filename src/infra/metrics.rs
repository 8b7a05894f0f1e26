//! Prometheus 指标：会话准入拒绝、活跃会话数、会话生命周期计数
//!
//! 通过 `init()` 安装全局 Recorder；配置了监听地址时同时启动 `/metrics` 抓取端点。
//! 所有标签都来自封闭的 `SessionType` / `CloseReason` 集合。

use std::net::SocketAddr;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::session::{CloseReason, SessionType};

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 指标名称
pub const COUNTER_REGISTRATIONS_RATE_LIMITED: &str =
    "session_client_registrations_rate_limited_total";
pub const COUNTER_REGISTRATIONS_FAILED: &str = "session_client_registrations_failed_total";
const GAUGE_ACTIVE_SESSIONS: &str = "session_client_active_sessions";
const COUNTER_SESSIONS_TOTAL: &str = "session_client_sessions_total";
const COUNTER_SESSIONS_CLOSED: &str = "session_client_sessions_closed_total";
const COUNTER_SESSIONS_MIGRATED: &str = "session_client_sessions_migrated_total";
const GAUGE_LIMITER_ACTIVE: &str = "session_client_limiter_active";
const GAUGE_LIMITER_LIMIT: &str = "session_client_limiter_limit";

const LABEL_SESSION_TYPE: &str = "session_type";
const LABEL_REASON: &str = "reason";

/// 初始化 Prometheus 指标。
/// `listen` 为 Some 时在该地址暴露 HTTP 抓取端点（需在 tokio runtime 内调用）。
/// 仅需在进程内调用一次；重复调用会返回 Err。
pub fn init(listen: Option<SocketAddr>) -> Result<()> {
    if HANDLE.get().is_some() {
        return Err(anyhow!("metrics already initialized"));
    }

    let handle = match listen {
        Some(addr) => {
            let (recorder, exporter) = PrometheusBuilder::new()
                .with_http_listener(addr)
                .build()
                .context("failed to build prometheus exporter")?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|_| anyhow!("metrics recorder already installed"))?;
            tokio::spawn(async move {
                if let Err(e) = exporter.await {
                    tracing::error!("❌ prometheus exporter stopped: {:?}", e);
                }
            });
            handle
        }
        None => PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install prometheus recorder")?,
    };

    HANDLE
        .set(handle)
        .map_err(|_| anyhow!("metrics already initialized"))?;
    Ok(())
}

/// 是否已初始化
pub fn is_initialized() -> bool {
    HANDLE.get().is_some()
}

/// 渲染当前指标为 Prometheus 文本格式
pub fn render_metrics() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// 记录一次被限流拒绝的会话注册（Counter）。
pub fn record_registration_rate_limited(session_type: SessionType) {
    metrics::counter!(COUNTER_REGISTRATIONS_RATE_LIMITED, LABEL_SESSION_TYPE => session_type.as_str())
        .increment(1);
}

/// 记录一次非限流原因失败的会话注册（重复注册、已绑定到其他连接）。
pub fn record_registration_failed(session_type: SessionType) {
    metrics::counter!(COUNTER_REGISTRATIONS_FAILED, LABEL_SESSION_TYPE => session_type.as_str())
        .increment(1);
}

/// 会话准入成功：活跃 +1，总数 +1。
pub fn record_session_opened(session_type: SessionType) {
    metrics::gauge!(GAUGE_ACTIVE_SESSIONS, LABEL_SESSION_TYPE => session_type.as_str())
        .increment(1.0);
    metrics::counter!(COUNTER_SESSIONS_TOTAL, LABEL_SESSION_TYPE => session_type.as_str())
        .increment(1);
}

/// 会话关闭：活跃 -1，按原因计数。
pub fn record_session_closed(session_type: SessionType, reason: &CloseReason) {
    metrics::gauge!(GAUGE_ACTIVE_SESSIONS, LABEL_SESSION_TYPE => session_type.as_str())
        .decrement(1.0);
    metrics::counter!(
        COUNTER_SESSIONS_CLOSED,
        LABEL_SESSION_TYPE => session_type.as_str(),
        LABEL_REASON => reason.as_label()
    )
    .increment(1);
}

/// 会话迁移到另一条隧道连接（Counter）。
pub fn record_session_migrated(session_type: SessionType) {
    metrics::counter!(COUNTER_SESSIONS_MIGRATED, LABEL_SESSION_TYPE => session_type.as_str())
        .increment(1);
}

/// 更新限流器状态（Gauge）。由定时任务周期调用。
pub fn record_limiter_state(active: u64, limit: u64) {
    metrics::gauge!(GAUGE_LIMITER_ACTIVE).set(active as f64);
    metrics::gauge!(GAUGE_LIMITER_LIMIT).set(limit as f64);
}

/// 会话生命周期指标上报接口
///
/// 注册表通过它上报，限流器本身不依赖指标。
pub trait MetricsReporter: Send + Sync {
    /// 注册因并发上限被拒绝
    fn record_rejection(&self, session_type: SessionType);

    /// 注册因限流以外的原因失败
    fn registration_failed(&self, _session_type: SessionType) {}

    fn session_opened(&self, _session_type: SessionType) {}

    fn session_closed(&self, _session_type: SessionType, _reason: &CloseReason) {}

    fn session_migrated(&self, _session_type: SessionType) {}
}

/// 写入全局 `metrics` Recorder 的默认实现
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusReporter;

impl MetricsReporter for PrometheusReporter {
    fn record_rejection(&self, session_type: SessionType) {
        record_registration_rate_limited(session_type);
    }

    fn registration_failed(&self, session_type: SessionType) {
        record_registration_failed(session_type);
    }

    fn session_opened(&self, session_type: SessionType) {
        record_session_opened(session_type);
    }

    fn session_closed(&self, session_type: SessionType, reason: &CloseReason) {
        record_session_closed(session_type, reason);
    }

    fn session_migrated(&self, session_type: SessionType) {
        record_session_migrated(session_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_with<F: FnOnce()>(f: F) -> String {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, f);
        handle.render()
    }

    #[test]
    fn test_rejections_partitioned_by_session_type() {
        let output = render_with(|| {
            let reporter = PrometheusReporter;
            reporter.record_rejection(SessionType::Udp);
            reporter.record_rejection(SessionType::Udp);
            reporter.record_rejection(SessionType::Icmp);
        });

        assert!(output.contains(COUNTER_REGISTRATIONS_RATE_LIMITED));
        assert!(output.contains(r#"session_type="udp"} 2"#));
        assert!(output.contains(r#"session_type="icmp"} 1"#));
        assert!(!output.contains(r#"session_type="tcp""#));
    }

    #[test]
    fn test_failed_registrations_counted_apart_from_rate_limited() {
        let output = render_with(|| {
            let reporter = PrometheusReporter;
            reporter.registration_failed(SessionType::Tcp);
            reporter.record_rejection(SessionType::Udp);
        });

        assert!(output
            .contains(r#"session_client_registrations_failed_total{session_type="tcp"} 1"#));
        assert!(!output
            .contains(r#"session_client_registrations_failed_total{session_type="udp"}"#));
    }

    #[test]
    fn test_lifecycle_metrics() {
        let output = render_with(|| {
            let reporter = PrometheusReporter;
            reporter.session_opened(SessionType::Tcp);
            reporter.session_opened(SessionType::Tcp);
            reporter.session_closed(SessionType::Tcp, &CloseReason::IdleTimeout);
            reporter.session_migrated(SessionType::Tcp);
        });

        assert!(output.contains(r#"session_client_active_sessions{session_type="tcp"} 1"#));
        assert!(output.contains(r#"session_client_sessions_total{session_type="tcp"} 2"#));
        assert!(output.contains(r#"reason="idle_timeout""#));
        assert!(output.contains(r#"session_client_sessions_migrated_total{session_type="tcp"} 1"#));
    }
}
