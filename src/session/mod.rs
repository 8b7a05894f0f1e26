//! 代理会话生命周期
//!
//! `Registering -> Active -> Closing -> Closed`，名额在进入 `Closed` 时释放。

pub mod model;
pub mod permit;
pub mod registry;

pub use model::{
    CloseReason, RegistrationRequest, Session, SessionId, SessionSnapshot, SessionState,
    SessionType, TeardownHook,
};
pub use permit::SessionPermit;
pub use registry::{SessionRegistry, MIN_REAP_INTERVAL};
