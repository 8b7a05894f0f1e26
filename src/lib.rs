//! 隧道客户端会话准入与生命周期管理
//!
//! - [`SessionLimiter`]：全局并发会话上限，运行时可调整，失败立即返回
//! - [`SessionRegistry`]：session_id -> Session 映射，保证每个已准入会话只释放一次名额
//! - [`infra::metrics`]：按会话类型统计被拒绝的注册等指标
//! - [`Orchestrator`]：应用远端下发的上限配置

pub mod cli;
pub mod config;
pub mod error;
pub mod infra;
pub mod logging;
pub mod orchestration;
pub mod session;

pub use config::AppConfig;
pub use error::{Result, SessionError, TooManyActiveSessions, UnknownSessionType};
pub use infra::metrics::{MetricsReporter, PrometheusReporter};
pub use infra::session_limiter::{Limiter, SessionLimiter, UNLIMITED};
pub use orchestration::{Orchestrator, UpdateConfigurationResponse};
pub use session::{
    CloseReason, RegistrationRequest, Session, SessionId, SessionPermit, SessionRegistry,
    SessionSnapshot, SessionState, SessionType,
};
