//! 连接状态管理
//!
//! 提供连接状态信息，包括：
//! - 面向 UI 的连接状态（connected / reconnecting / disconnected）
//! - 会话身份
//! - 同步统计

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::storage::entities::SessionIdentity;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityStatus {
    /// 已连接（推送流已就绪）
    Connected,
    /// 重连中（退避等待或正在重新订阅）
    Reconnecting,
    /// 未连接
    Disconnected,
}

impl std::fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityStatus::Connected => write!(f, "已连接"),
            ConnectivityStatus::Reconnecting => write!(f, "重连中"),
            ConnectivityStatus::Disconnected => write!(f, "未连接"),
        }
    }
}

/// 同步统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    /// 推送流收到的事件数（含重复）
    pub events_received: u64,
    /// 已应用的批次数
    pub batches_applied: u64,
    /// 检测到的空洞数
    pub holes_detected: u64,
    /// 全量重建次数
    pub full_fetches: u64,
    /// diff 续传次数
    pub diffs_applied: u64,
    /// 整集合重拉次数
    pub resyncs: u64,
    /// 重连次数
    pub reconnects: u64,
    /// 已提交 / 失败的 mutation
    pub mutations_committed: u64,
    pub mutations_failed: u64,
    /// 最后活动时间（UTC毫秒时间戳）
    pub last_activity_time: Option<i64>,
}

/// SDK 连接状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectivityStatus,
    pub identity: Option<SessionIdentity>,
    pub stats: SyncStats,
    /// 推送流就绪时间（UTC毫秒时间戳）
    pub connected_at: Option<i64>,
    pub sdk_version: String,
    /// 最近一次断开原因
    pub last_disconnect_reason: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectivityStatus::Disconnected,
            identity: None,
            stats: SyncStats::default(),
            connected_at: None,
            sdk_version: crate::version::SDK_VERSION.to_string(),
            last_disconnect_reason: None,
        }
    }
}

impl ConnectionState {
    /// 获取连接持续时间（秒）
    pub fn connection_duration_secs(&self) -> Option<i64> {
        self.connected_at.map(|connected_at| {
            let now = Utc::now().timestamp_millis();
            (now - connected_at) / 1000
        })
    }

    /// 格式化连接持续时间为可读字符串
    pub fn format_connection_duration(&self) -> String {
        match self.connection_duration_secs() {
            Some(secs) => {
                let hours = secs / 3600;
                let minutes = (secs % 3600) / 60;
                let seconds = secs % 60;

                if hours > 0 {
                    format!("{}小时{}分{}秒", hours, minutes, seconds)
                } else if minutes > 0 {
                    format!("{}分{}秒", minutes, seconds)
                } else {
                    format!("{}秒", seconds)
                }
            }
            None => "未连接".to_string(),
        }
    }

    /// 生成状态摘要（用于日志打印）
    pub fn summary(&self) -> String {
        let identity = self
            .identity
            .as_ref()
            .map(|i| i.to_string())
            .unwrap_or_else(|| "未绑定会话".to_string());

        format!(
            "【连接状态】\n\
             状态: {}\n\
             会话: {}\n\
             已连接: {}\n\
             同步: 批次{}/空洞{}/全量{}/diff{}/重拉{}\n\
             重连: {}次\n\
             SDK版本: {}",
            self.status,
            identity,
            self.format_connection_duration(),
            self.stats.batches_applied,
            self.stats.holes_detected,
            self.stats.full_fetches,
            self.stats.diffs_applied,
            self.stats.resyncs,
            self.stats.reconnects,
            self.sdk_version,
        )
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// 连接状态管理器（线程安全）
#[derive(Debug, Clone, Default)]
pub struct ConnectionStateManager {
    state: Arc<RwLock<ConnectionState>>,
}

impl ConnectionStateManager {
    pub fn new(identity: SessionIdentity) -> Self {
        let state = ConnectionState {
            identity: Some(identity),
            ..ConnectionState::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// 更新状态；状态确有变化时返回旧值
    pub async fn set_status(&self, status: ConnectivityStatus) -> Option<ConnectivityStatus> {
        let mut state = self.state.write().await;
        if state.status == status {
            return None;
        }
        let old = state.status;
        state.status = status;
        match status {
            ConnectivityStatus::Connected => {
                state.connected_at = Some(Utc::now().timestamp_millis());
            }
            ConnectivityStatus::Reconnecting | ConnectivityStatus::Disconnected => {
                state.connected_at = None;
            }
        }
        Some(old)
    }

    pub async fn status(&self) -> ConnectivityStatus {
        self.state.read().await.status
    }

    pub async fn record_disconnect(&self, reason: &str) {
        let mut state = self.state.write().await;
        state.stats.reconnects += 1;
        state.last_disconnect_reason = Some(reason.to_string());
    }

    /// 修改统计
    pub async fn update_stats(&self, f: impl FnOnce(&mut SyncStats)) {
        let mut state = self.state.write().await;
        f(&mut state.stats);
        state.stats.last_activity_time = Some(Utc::now().timestamp_millis());
    }

    pub async fn get_state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    pub async fn get_summary(&self) -> String {
        self.state.read().await.summary()
    }

    pub async fn log_state(&self) {
        let summary = self.get_summary().await;
        tracing::info!("\n{}", summary);
    }
}
