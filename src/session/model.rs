use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use crate::error::UnknownSessionType;
use crate::session::permit::SessionPermit;

/// 会话 ID（注册请求中的 request id）
pub type SessionId = Uuid;

/// 会话拆除钩子，在 `Closing` 阶段执行一次
pub type TeardownHook = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// 代理会话类型
///
/// 取值集合是封闭的，指标标签只会来自这里，避免标签基数失控。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Udp,
    Tcp,
    Icmp,
}

impl SessionType {
    pub const ALL: [SessionType; 3] = [SessionType::Udp, SessionType::Tcp, SessionType::Icmp];

    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionType::Udp => "udp",
            SessionType::Tcp => "tcp",
            SessionType::Icmp => "icmp",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionType {
    type Err = UnknownSessionType;

    /// 规范化外部传入的标签（忽略大小写和首尾空白）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(SessionType::Udp),
            "tcp" => Ok(SessionType::Tcp),
            "icmp" => Ok(SessionType::Icmp),
            _ => Err(UnknownSessionType(s.to_string())),
        }
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionState {
    Registering = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Registering,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// 会话关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 本端主动关闭（代理流正常结束）
    Local,
    /// 对端请求关闭
    Remote,
    /// 传输层报告该流出错
    TransportError(String),
    /// 空闲超时
    IdleTimeout,
    /// 所属隧道连接已断开
    ConnectionClosed,
    /// 注册表关闭
    Shutdown,
}

impl CloseReason {
    /// 指标标签
    pub const fn as_label(&self) -> &'static str {
        match self {
            CloseReason::Local => "local",
            CloseReason::Remote => "remote",
            CloseReason::TransportError(_) => "transport_error",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::ConnectionClosed => "connection_closed",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TransportError(msg) => write!(f, "transport error: {}", msg),
            other => f.write_str(other.as_label()),
        }
    }
}

/// 会话注册请求
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub id: SessionId,
    pub session_type: SessionType,
    /// 对端给出的空闲超时提示，优先于注册表的全局设置
    pub idle_timeout: Option<Duration>,
}

impl RegistrationRequest {
    pub fn new(id: SessionId, session_type: SessionType) -> Self {
        Self {
            id,
            session_type,
            idle_timeout: None,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }
}

/// 单个代理会话
///
/// 只有准入成功后才会创建，由 `SessionRegistry` 独占管理。
/// 名额由 `permit` 持有，在进入 `Closed` 时释放且只释放一次。
pub struct Session {
    id: SessionId,
    session_type: SessionType,
    state: AtomicU8,
    conn_index: AtomicU8,
    created_at: DateTime<Utc>,
    last_activity_at: Mutex<DateTime<Utc>>,
    idle_timeout: Option<Duration>,
    permit: Mutex<Option<SessionPermit>>,
    teardown: Mutex<Vec<TeardownHook>>,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    pub(crate) fn new(
        request: &RegistrationRequest,
        conn_index: u8,
        idle_timeout: Option<Duration>,
        permit: SessionPermit,
    ) -> Self {
        let now = Utc::now();
        let (closed_tx, _) = watch::channel(false);
        Self {
            id: request.id,
            session_type: request.session_type,
            state: AtomicU8::new(SessionState::Registering as u8),
            conn_index: AtomicU8::new(conn_index),
            created_at: now,
            last_activity_at: Mutex::new(now),
            idle_timeout,
            permit: Mutex::new(Some(permit)),
            teardown: Mutex::new(Vec::new()),
            closed_tx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 当前绑定的隧道连接
    pub fn conn_index(&self) -> u8 {
        self.conn_index.load(Ordering::Acquire)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        *self.last_activity_at.lock()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// 记录一次数据活动（转发路径每次读写时调用）
    pub fn touch(&self) {
        *self.last_activity_at.lock() = Utc::now();
    }

    /// 没有配置空闲超时的会话永远不会空闲过期
    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        let Some(timeout) = self.idle_timeout else {
            return false;
        };
        let elapsed = now.signed_duration_since(self.last_activity_at());
        chrono::Duration::from_std(timeout)
            .map(|timeout| elapsed >= timeout)
            .unwrap_or(false)
    }

    /// 注册拆除钩子（关闭源站 socket 等）。
    ///
    /// 会话已经开始关闭时钩子立即执行。
    pub fn on_teardown<F>(&self, hook: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        {
            let mut hooks = self.teardown.lock();
            if self.state() < SessionState::Closing {
                hooks.push(Box::new(hook));
                return;
            }
        }
        self.run_hook(Box::new(hook));
    }

    /// 等待会话关闭，供转发任务退出使用
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub(crate) fn activate(&self) {
        let _ = self.state.compare_exchange(
            SessionState::Registering as u8,
            SessionState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn bind(&self, conn_index: u8) -> u8 {
        self.conn_index.swap(conn_index, Ordering::AcqRel)
    }

    /// 关闭流程的唯一入口：Closing -> 执行钩子 -> Closed -> 释放名额。
    ///
    /// 只有第一次调用返回 true；钩子失败只记录日志，不影响名额释放。
    pub(crate) fn close(&self, reason: &CloseReason) -> bool {
        let transitioned = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state < SessionState::Closing as u8).then_some(SessionState::Closing as u8)
            })
            .is_ok();
        if !transitioned {
            return false;
        }

        let hooks = std::mem::take(&mut *self.teardown.lock());
        for hook in hooks {
            self.run_hook(hook);
        }

        self.state.store(SessionState::Closed as u8, Ordering::Release);
        drop(self.permit.lock().take());
        self.closed_tx.send_replace(true);

        tracing::debug!(
            session_id = %self.id,
            session_type = %self.session_type,
            conn_index = self.conn_index(),
            reason = %reason,
            "🔒 session closed"
        );
        true
    }

    fn run_hook(&self, hook: TeardownHook) {
        if let Err(e) = hook() {
            warn!(
                session_id = %self.id,
                session_type = %self.session_type,
                error = %e,
                "⚠️ session teardown failed"
            );
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("session_type", &self.session_type)
            .field("state", &self.state())
            .field("conn_index", &self.conn_index())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// 会话只读快照，用于调试和诊断输出
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub session_type: SessionType,
    pub state: SessionState,
    pub conn_index: u8,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl From<&Session> for SessionSnapshot {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id(),
            session_type: session.session_type(),
            state: session.state(),
            conn_index: session.conn_index(),
            created_at: session.created_at(),
            last_activity_at: session.last_activity_at(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::session_limiter::{Limiter, SessionLimiter};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn new_session(limiter: &Arc<SessionLimiter>, idle_timeout: Option<Duration>) -> Session {
        let request = RegistrationRequest::new(Uuid::new_v4(), SessionType::Udp);
        let permit = SessionPermit::acquire(limiter.clone(), request.session_type).unwrap();
        Session::new(&request, 0, idle_timeout, permit)
    }

    #[test]
    fn test_session_type_from_str_normalizes() {
        assert_eq!(" UDP ".parse::<SessionType>().unwrap(), SessionType::Udp);
        assert_eq!("Icmp".parse::<SessionType>().unwrap(), SessionType::Icmp);
        assert!("sctp".parse::<SessionType>().is_err());
    }

    #[test]
    fn test_close_releases_exactly_once() {
        let limiter = Arc::new(SessionLimiter::new(2));
        limiter.acquire("other").unwrap();
        let session = new_session(&limiter, None);
        session.activate();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(limiter.active(), 2);

        assert!(session.close(&CloseReason::Local));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(limiter.active(), 1);

        assert!(!session.close(&CloseReason::Remote));
        assert_eq!(limiter.active(), 1);
    }

    #[test]
    fn test_teardown_error_does_not_block_release() {
        let limiter = Arc::new(SessionLimiter::new(1));
        let session = new_session(&limiter, None);
        session.activate();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        session.on_teardown(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("origin socket already closed"))
        });

        assert!(session.close(&CloseReason::TransportError("reset".to_string())));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.active(), 0);
    }

    #[test]
    fn test_hook_after_close_runs_immediately() {
        let limiter = Arc::new(SessionLimiter::new(1));
        let session = new_session(&limiter, None);
        session.close(&CloseReason::Local);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        session.on_teardown(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_idle_detection() {
        let limiter = Arc::new(SessionLimiter::new(0));
        let session = new_session(&limiter, Some(Duration::from_secs(5)));
        let now = session.last_activity_at();

        assert!(!session.is_idle(now + chrono::Duration::seconds(4)));
        assert!(session.is_idle(now + chrono::Duration::seconds(5)));

        let no_timeout = new_session(&limiter, None);
        assert!(!no_timeout.is_idle(now + chrono::Duration::days(365)));
    }

    #[test]
    fn test_dropping_unclosed_session_releases_slot() {
        let limiter = Arc::new(SessionLimiter::new(1));
        let session = new_session(&limiter, None);
        assert_eq!(limiter.active(), 1);

        drop(session);
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test]
    async fn test_closed_notifies_waiters() {
        let limiter = Arc::new(SessionLimiter::new(0));
        let session = Arc::new(new_session(&limiter, None));
        session.activate();

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.closed().await })
        };
        session.close(&CloseReason::Remote);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
