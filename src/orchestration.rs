//! 远端配置下发
//!
//! 边缘网络会按版本推送配置，其中携带并发会话上限。这里负责：
//! - 丢弃不比当前版本新的推送
//! - 本地覆盖值（命令行 `--max-active-sessions`）优先于远端值
//! - 调用 `Limiter::set_limit` 立即生效，已准入的会话不受影响

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::infra::session_limiter::Limiter;

/// 远端配置结构（只关心会话相关字段，其余字段忽略）
#[derive(Debug, Default, Deserialize)]
struct RemoteConfig {
    #[serde(rename = "warp-routing", default)]
    warp_routing: RemoteSessionSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteSessionSettings {
    /// 0 或缺省表示不限制
    #[serde(default)]
    max_active_flows: u64,
}

/// 配置更新结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateConfigurationResponse {
    pub last_applied_version: i32,
    pub error: Option<String>,
}

#[derive(Debug)]
struct OrchestratorState {
    current_version: i32,
    max_active_sessions: u64,
}

/// 配置编排器
pub struct Orchestrator {
    limiter: Arc<dyn Limiter>,
    local_max_active_sessions: Option<u64>,
    /// 串行化配置更新（只在更新路径上加锁，不影响准入热路径）
    state: Mutex<OrchestratorState>,
}

impl Orchestrator {
    /// `initial_limit` 为本地配置文件中的上限，`local_override` 为命令行覆盖值
    pub fn new(limiter: Arc<dyn Limiter>, initial_limit: u64, local_override: Option<u64>) -> Self {
        let effective = local_override.unwrap_or(initial_limit);
        limiter.set_limit(effective);
        Self {
            limiter,
            local_max_active_sessions: local_override,
            // 任何远端版本（包括 0）都比初始状态新
            state: Mutex::new(OrchestratorState {
                current_version: -1,
                max_active_sessions: effective,
            }),
        }
    }

    /// 应用一次远端配置推送
    pub fn update_config(&self, version: i32, config: &[u8]) -> UpdateConfigurationResponse {
        let mut state = self.state.lock();

        if state.current_version >= version {
            debug!(
                current_version = state.current_version,
                received_version = version,
                "Current version is equal or newer than received version"
            );
            return UpdateConfigurationResponse {
                last_applied_version: state.current_version,
                error: None,
            };
        }

        let remote: RemoteConfig = match serde_json::from_slice(config) {
            Ok(remote) => remote,
            Err(e) => {
                warn!(version, error = %e, "⚠️ failed to deserialize remote configuration");
                return UpdateConfigurationResponse {
                    last_applied_version: state.current_version,
                    error: Some(format!("invalid configuration: {}", e)),
                };
            }
        };

        let limit = self
            .local_max_active_sessions
            .unwrap_or(remote.warp_routing.max_active_flows);
        self.limiter.set_limit(limit);

        let previous = state.max_active_sessions;
        state.max_active_sessions = limit;
        state.current_version = version;

        info!(
            version,
            previous_limit = previous,
            limit,
            local_override = self.local_max_active_sessions.is_some(),
            "🔧 applied remote configuration"
        );
        UpdateConfigurationResponse {
            last_applied_version: version,
            error: None,
        }
    }

    pub fn current_version(&self) -> i32 {
        self.state.lock().current_version
    }

    /// 当前生效的会话上限，0 表示不限制
    pub fn max_active_sessions(&self) -> u64 {
        self.state.lock().max_active_sessions
    }
}
