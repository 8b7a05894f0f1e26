use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::infra::metrics::MetricsReporter;
use crate::infra::session_limiter::Limiter;
use crate::session::permit::SessionPermit;
use crate::session::{CloseReason, RegistrationRequest, Session, SessionId, SessionSnapshot};

/// 空闲回收任务的最小间隔
pub const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// 会话注册表
///
/// 独占 session_id -> Session 映射，是代表会话调用限流器的唯一组件。
/// 所有退出路径（正常关闭、传输错误、空闲超时、连接断开、关闭注册表）
/// 都经过 `unregister`：先从映射中移除，再进入 `Closed` 并释放名额。
/// 不在映射中的会话无法被再次关闭。
pub struct SessionRegistry {
    /// 会话映射（DashMap 分片锁，不在持锁期间调用外部代码）
    sessions: DashMap<SessionId, Arc<Session>>,
    limiter: Arc<dyn Limiter>,
    reporter: Arc<dyn MetricsReporter>,
    /// 注册请求没有给出提示时使用的空闲超时；None 表示不做空闲回收
    default_idle_timeout: Option<Duration>,
    closed: AtomicBool,
}

impl SessionRegistry {
    pub fn new(limiter: Arc<dyn Limiter>, reporter: Arc<dyn MetricsReporter>) -> Self {
        Self {
            sessions: DashMap::new(),
            limiter,
            reporter,
            default_idle_timeout: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.default_idle_timeout = idle_timeout;
        self
    }

    /// 注册会话
    ///
    /// 重复 ID 在申请名额前就被拒绝，不会占用名额。
    /// 准入失败时上报拒绝指标并返回 `RegistrationRateLimited`，不重试。
    /// 限流器与指标上报都在分片锁之外调用。
    pub fn register(&self, request: RegistrationRequest, conn_index: u8) -> Result<Arc<Session>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::ManagerClosed);
        }

        let session_type = request.session_type;
        let existing = self.sessions.get(&request.id).map(|entry| entry.conn_index());
        if let Some(bound_to) = existing {
            return Err(self.duplicate(&request, conn_index, bound_to));
        }

        let permit = match SessionPermit::acquire(Arc::clone(&self.limiter), session_type) {
            Ok(permit) => permit,
            Err(rejected) => {
                self.reporter.record_rejection(session_type);
                debug!(
                    session_id = %request.id,
                    session_type = %session_type,
                    conn_index,
                    "🚫 session registration rate limited"
                );
                return Err(SessionError::RegistrationRateLimited {
                    session_type,
                    source: rejected,
                });
            }
        };

        let idle_timeout = request.idle_timeout.or(self.default_idle_timeout);
        let session = Arc::new(Session::new(&request, conn_index, idle_timeout, permit));
        let inserted = match self.sessions.entry(request.id) {
            Entry::Occupied(entry) => Err(entry.get().conn_index()),
            Entry::Vacant(entry) => {
                session.activate();
                entry.insert(Arc::clone(&session));
                Ok(())
            }
        };

        if let Err(bound_to) = inserted {
            // 并发注册了同一 ID：未插入的会话随 drop 归还名额
            drop(session);
            return Err(self.duplicate(&request, conn_index, bound_to));
        }

        // 先上报打开，之后任何关闭路径上报的关闭都有对应的打开
        self.reporter.session_opened(session_type);

        // 与 shutdown 竞争时，shutdown 可能已经清空过映射
        if self.closed.load(Ordering::Acquire) {
            self.unregister(&request.id, CloseReason::Shutdown);
            return Err(SessionError::ManagerClosed);
        }

        debug!(
            session_id = %request.id,
            session_type = %session_type,
            conn_index,
            "✅ session registered"
        );
        Ok(session)
    }

    /// 获取会话
    pub fn get(&self, id: &SessionId) -> Result<Arc<Session>> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SessionError::NotFound(*id))
    }

    /// 注销并关闭会话
    ///
    /// 返回 false 表示会话不存在（已关闭或从未注册），此时不做任何事。
    pub fn unregister(&self, id: &SessionId, reason: CloseReason) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                self.finish(&session, &reason);
                true
            }
            None => false,
        }
    }

    /// 将会话迁移到另一条隧道连接
    pub fn migrate(&self, id: &SessionId, conn_index: u8) -> Result<()> {
        let session = self.get(id)?;
        let previous = session.bind(conn_index);
        if previous != conn_index {
            self.reporter.session_migrated(session.session_type());
            info!(
                session_id = %id,
                from = previous,
                to = conn_index,
                "🔀 session migrated to another connection"
            );
        }
        Ok(())
    }

    /// 关闭绑定在指定连接上的所有会话，返回关闭数量
    pub fn close_connection(&self, conn_index: u8, reason: CloseReason) -> usize {
        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().conn_index() == conn_index)
            .map(|entry| *entry.key())
            .collect();

        let closed = ids
            .iter()
            .filter(|id| self.unregister(id, reason.clone()))
            .count();

        if closed > 0 {
            info!(conn_index, closed, reason = %reason, "🔌 closed sessions of connection");
        }
        closed
    }

    /// 回收空闲会话，返回回收数量
    pub fn reap_idle(&self, now: DateTime<Utc>) -> usize {
        let candidates: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_idle(now))
            .map(|entry| *entry.key())
            .collect();

        let mut reaped = 0;
        for id in candidates {
            // 收集之后可能又有数据活动，移除时再确认一次
            if let Some((_, session)) = self.sessions.remove_if(&id, |_, s| s.is_idle(now)) {
                self.finish(&session, &CloseReason::IdleTimeout);
                reaped += 1;
            }
        }

        if reaped > 0 {
            debug!(reaped, "🧹 reaped idle sessions");
        }
        reaped
    }

    /// 启动后台空闲回收任务；注册表被释放或关闭后任务自动退出
    ///
    /// 间隔不低于 `MIN_REAP_INTERVAL`。
    pub fn spawn_idle_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let interval = if interval < MIN_REAP_INTERVAL {
            warn!(
                requested = ?interval,
                "⚠️ idle reap interval too small, using {:?}",
                MIN_REAP_INTERVAL
            );
            MIN_REAP_INTERVAL
        } else {
            interval
        };
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if registry.is_closed() {
                    break;
                }
                registry.reap_idle(Utc::now());
            }
        })
    }

    /// 停止接受注册并关闭全部会话，返回关闭数量
    pub fn shutdown(&self, reason: CloseReason) -> usize {
        self.closed.store(true, Ordering::Release);

        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let closed = ids
            .iter()
            .filter(|id| self.unregister(id, reason.clone()))
            .count();

        info!(closed, reason = %reason, "🛑 session registry shut down");
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 当前会话数
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// 所有会话的只读快照
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| SessionSnapshot::from(entry.value().as_ref()))
            .collect()
    }

    fn duplicate(
        &self,
        request: &RegistrationRequest,
        conn_index: u8,
        bound_to: u8,
    ) -> SessionError {
        self.reporter.registration_failed(request.session_type);
        if bound_to == conn_index {
            SessionError::AlreadyRegistered(request.id)
        } else {
            SessionError::BoundToOtherConnection {
                id: request.id,
                conn_index: bound_to,
            }
        }
    }

    fn finish(&self, session: &Session, reason: &CloseReason) {
        if session.close(reason) {
            self.reporter.session_closed(session.session_type(), reason);
        }
    }
}
