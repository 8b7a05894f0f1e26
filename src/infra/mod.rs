// Infrastructure layer - 基础设施层
// 负责准入限流与监控指标，不感知具体会话

pub mod metrics;
pub mod session_limiter;

pub use metrics::{MetricsReporter, PrometheusReporter};
pub use session_limiter::{Limiter, SessionLimiter, UNLIMITED};
