use thiserror::Error;

use crate::session::{SessionId, SessionType};

/// 并发会话数已达上限
///
/// `Limiter::acquire` 唯一会返回的错误，调用方用类型匹配区分，不要比较字符串。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("too many active sessions")]
pub struct TooManyActiveSessions;

/// 无法识别的会话类型标签
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown session type: {0:?}")]
pub struct UnknownSessionType(pub String);

/// 会话注册表错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// 准入被拒绝（并发上限）
    #[error("session registration rate limited for {session_type}")]
    RegistrationRateLimited {
        session_type: SessionType,
        #[source]
        source: TooManyActiveSessions,
    },
    /// 同一连接上重复注册
    #[error("session {0} is already registered on this connection")]
    AlreadyRegistered(SessionId),
    /// 会话已绑定到另一条连接
    #[error("session {id} is bound to connection {conn_index}")]
    BoundToOtherConnection { id: SessionId, conn_index: u8 },
    /// 会话不存在
    #[error("session {0} not found")]
    NotFound(SessionId),
    /// 注册表已关闭
    #[error("session registry closed")]
    ManagerClosed,
}

impl SessionError {
    /// 是否为准入拒绝，传输层据此回复 "too many concurrent sessions"
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SessionError::RegistrationRateLimited { .. })
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, SessionError>;
