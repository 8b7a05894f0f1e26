use std::fmt;
use std::sync::Arc;

use crate::error::TooManyActiveSessions;
use crate::infra::session_limiter::Limiter;
use crate::session::SessionType;

/// 一个已准入的会话名额
///
/// 创建时调用 `acquire`，drop 时调用 `release`。每个名额只能 drop 一次，
/// 因此无论会话从哪条路径退出（正常关闭、出错、超时、注册被放弃），
/// 对限流器的释放都恰好发生一次。
pub struct SessionPermit {
    limiter: Arc<dyn Limiter>,
}

impl SessionPermit {
    pub fn acquire(
        limiter: Arc<dyn Limiter>,
        session_type: SessionType,
    ) -> Result<Self, TooManyActiveSessions> {
        limiter.acquire(session_type.as_str())?;
        Ok(Self { limiter })
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

impl fmt::Debug for SessionPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPermit").finish_non_exhaustive()
    }
}
