//! 会话准入限流器
//!
//! 限制同时存活的代理会话数量（所有会话类型共享一个全局上限），
//! 上限可在运行时调整，不影响已准入的会话。
//!
//! - `limit == 0` 表示不限制（哨兵值，不是 "容量为 0"）
//! - `acquire` 失败立即返回，不排队、不重试
//! - `release` 多调用不会让计数变成负数，也不会放大后续可准入数量

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::error::TooManyActiveSessions;

/// 不限制并发会话数
pub const UNLIMITED: u64 = 0;

/// 准入控制接口
///
/// 注册表只依赖这个 trait，测试中可以替换为脚本化的实现。
pub trait Limiter: Send + Sync {
    /// 尝试占用一个会话名额（非阻塞）。`session_type` 只用于诊断。
    fn acquire(&self, session_type: &str) -> Result<(), TooManyActiveSessions>;

    /// 归还一个名额；计数在 0 处截断
    fn release(&self);

    /// 替换上限，对之后的 `acquire` 立即生效；0 = 不限制
    fn set_limit(&self, limit: u64);
}

/// 基于原子计数的会话限流器
///
/// `limit` 和 `active` 各自独立原子读写，`acquire` 每次都重新读取 `limit`。
#[derive(Debug, Default)]
pub struct SessionLimiter {
    limit: AtomicU64,
    active: AtomicU64,
}

impl SessionLimiter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit: AtomicU64::new(limit),
            active: AtomicU64::new(0),
        }
    }

    /// 当前占用的名额数（不限制模式下仅供诊断）
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    /// 当前上限，0 表示不限制
    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Acquire)
    }
}

impl Limiter for SessionLimiter {
    fn acquire(&self, session_type: &str) -> Result<(), TooManyActiveSessions> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            let limit = self.limit.load(Ordering::Acquire);
            if limit != UNLIMITED && current >= limit {
                trace!(session_type, active = current, limit, "session admission rejected");
                return Err(TooManyActiveSessions);
            }

            match self.active.compare_exchange_weak(
                current,
                current.saturating_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self) {
        // 已经是 0 时 checked_sub 返回 None，fetch_update 放弃写入
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn set_limit(&self, limit: u64) {
        self.limit.store(limit, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_unlimited() {
        let limiter = SessionLimiter::new(UNLIMITED);

        for _ in 0..1000 {
            assert!(limiter.acquire("test").is_ok());
        }
        assert_eq!(limiter.active(), 1000);
    }

    #[test]
    fn test_limited() {
        let max_sessions = 5u64;
        let limiter = SessionLimiter::new(max_sessions);

        for _ in 0..max_sessions {
            assert!(limiter.acquire("test").is_ok());
        }

        assert_eq!(limiter.acquire("should fail"), Err(TooManyActiveSessions));
        assert_eq!(limiter.active(), max_sessions);
    }

    #[test]
    fn test_acquire_and_release() {
        let max_sessions = 5u64;
        let limiter = SessionLimiter::new(max_sessions);

        for _ in 0..max_sessions {
            limiter.acquire("test").unwrap();
        }
        assert_eq!(limiter.acquire("should fail"), Err(TooManyActiveSessions));

        for _ in 0..max_sessions {
            limiter.release();
        }
        assert!(limiter.acquire("shouldn't fail").is_ok());

        // 多释放 10 倍，计数停在 0
        for _ in 0..10 * max_sessions {
            limiter.release();
        }
        assert_eq!(limiter.active(), 0);

        for _ in 0..max_sessions {
            assert!(limiter.acquire("test").is_ok());
        }
        assert_eq!(limiter.acquire("should fail"), Err(TooManyActiveSessions));
    }

    #[test]
    fn test_set_limit() {
        let max_sessions = 5u64;
        let limiter = SessionLimiter::new(max_sessions);

        for _ in 0..max_sessions {
            limiter.acquire("test").unwrap();
        }
        assert_eq!(limiter.acquire("should fail"), Err(TooManyActiveSessions));

        // 上调一个名额
        limiter.set_limit(max_sessions + 1);
        assert!(limiter.acquire("shouldn't fail").is_ok());
        assert_eq!(limiter.acquire("should fail"), Err(TooManyActiveSessions));

        for _ in 0..max_sessions + 1 {
            limiter.release();
        }
        assert!(limiter.acquire("shouldn't fail").is_ok());

        // 下调到 1，已占用 1 个
        limiter.set_limit(1);
        assert_eq!(limiter.acquire("should fail"), Err(TooManyActiveSessions));

        // 切换为不限制
        limiter.set_limit(UNLIMITED);
        for _ in 0..10 * max_sessions {
            assert!(limiter.acquire("shouldn't fail").is_ok());
        }
    }

    #[test]
    fn test_lowering_limit_keeps_existing_sessions() {
        let limiter = SessionLimiter::new(4);
        for _ in 0..4 {
            limiter.acquire("test").unwrap();
        }

        limiter.set_limit(1);
        assert_eq!(limiter.active(), 4);
        assert!(limiter.acquire("test").is_err());

        // 需要降到 0 才能再准入一个
        for _ in 0..3 {
            limiter.release();
            assert!(limiter.acquire("test").is_err());
        }
        limiter.release();
        assert!(limiter.acquire("test").is_ok());
        assert!(limiter.acquire("test").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_acquire_never_exceeds_limit() {
        let limit = 16u64;
        let limiter = Arc::new(SessionLimiter::new(limit));
        let admitted = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let limiter = Arc::clone(&limiter);
            let admitted = Arc::clone(&admitted);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                for _ in 0..500 {
                    if limiter.acquire("stress").is_ok() {
                        let now = admitted.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        assert!(limiter.active() <= limit);
                        tokio::task::yield_now().await;
                        admitted.fetch_sub(1, Ordering::SeqCst);
                        limiter.release();
                    } else {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= limit);
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_last_slot_has_single_winner() {
        for _ in 0..100 {
            let limiter = Arc::new(SessionLimiter::new(1));
            let mut tasks = Vec::new();
            for _ in 0..8 {
                let limiter = Arc::clone(&limiter);
                tasks.push(tokio::spawn(async move { limiter.acquire("race").is_ok() }));
            }

            let mut winners = 0;
            for task in tasks {
                if task.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
        }
    }
}
