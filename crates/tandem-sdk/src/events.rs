//! 事件系统模块 - SDK 向 UI 层广播的信号
//!
//! 功能包括：
//! - 连接状态 / 同步阶段变更
//! - 副本更新、集合重拉、空洞检测
//! - mutation 提交与失败通知
//! - 会话被强制重置
//! - 事件广播、过滤订阅和回调监听

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::connection_state::ConnectivityStatus;
use crate::storage::entities::{Collection, MutationId};
use crate::storage::ephemeral::EphemeralKind;
use crate::sync::SyncPhase;

/// SDK 事件类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SDKEvent {
    /// 连接状态变更
    ConnectivityChanged {
        old_status: ConnectivityStatus,
        new_status: ConnectivityStatus,
        timestamp: u64,
    },
    /// 同步阶段变更
    SyncPhaseChanged {
        old_phase: SyncPhase,
        new_phase: SyncPhase,
        timestamp: u64,
    },
    /// 副本中有集合被改写
    ReplicaUpdated {
        collections: Vec<Collection>,
        offset: u64,
        timestamp: u64,
    },
    /// catch-up 完成
    CatchUpCompleted {
        full_fetch: bool,
        offset: u64,
        timestamp: u64,
    },
    /// 推送流出现未补齐的空洞，即将全量重建
    HoleDetected {
        offset: u64,
        lowest_buffered: u64,
        timestamp: u64,
    },
    /// 集合整表重拉完成
    CollectionResynced {
        collection: Collection,
        rows: usize,
        timestamp: u64,
    },
    /// 输入 / 在线状态变化
    EphemeralUpdated {
        kind: EphemeralKind,
        scope_id: Option<String>,
        timestamp: u64,
    },
    /// mutation 已被服务端确认
    MutationCommitted {
        mutation_id: MutationId,
        name: String,
        timestamp: u64,
    },
    /// mutation 被服务端终态拒绝，乐观写入已回滚
    MutationFailed {
        mutation_id: MutationId,
        name: String,
        error: String,
        timestamp: u64,
    },
    /// 会话被强制重置（例如当前用户被移出组织），本地数据已清除
    SessionReset { reason: String, timestamp: u64 },
}

impl SDKEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SDKEvent::ConnectivityChanged { .. } => "connectivity_changed",
            SDKEvent::SyncPhaseChanged { .. } => "sync_phase_changed",
            SDKEvent::ReplicaUpdated { .. } => "replica_updated",
            SDKEvent::CatchUpCompleted { .. } => "catch_up_completed",
            SDKEvent::HoleDetected { .. } => "hole_detected",
            SDKEvent::CollectionResynced { .. } => "collection_resynced",
            SDKEvent::EphemeralUpdated { .. } => "ephemeral_updated",
            SDKEvent::MutationCommitted { .. } => "mutation_committed",
            SDKEvent::MutationFailed { .. } => "mutation_failed",
            SDKEvent::SessionReset { .. } => "session_reset",
        }
    }

    /// 获取事件时间戳（毫秒）
    pub fn timestamp(&self) -> u64 {
        match self {
            SDKEvent::ConnectivityChanged { timestamp, .. }
            | SDKEvent::SyncPhaseChanged { timestamp, .. }
            | SDKEvent::ReplicaUpdated { timestamp, .. }
            | SDKEvent::CatchUpCompleted { timestamp, .. }
            | SDKEvent::HoleDetected { timestamp, .. }
            | SDKEvent::CollectionResynced { timestamp, .. }
            | SDKEvent::EphemeralUpdated { timestamp, .. }
            | SDKEvent::MutationCommitted { timestamp, .. }
            | SDKEvent::MutationFailed { timestamp, .. }
            | SDKEvent::SessionReset { timestamp, .. } => *timestamp,
        }
    }

    /// 事件涉及的集合
    pub fn collections(&self) -> Vec<Collection> {
        match self {
            SDKEvent::ReplicaUpdated { collections, .. } => collections.clone(),
            SDKEvent::CollectionResynced { collection, .. } => vec![*collection],
            _ => Vec::new(),
        }
    }

    pub fn mutation_id(&self) -> Option<MutationId> {
        match self {
            SDKEvent::MutationCommitted { mutation_id, .. }
            | SDKEvent::MutationFailed { mutation_id, .. } => Some(*mutation_id),
            _ => None,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 集合过滤器（只对携带集合的事件生效）
    pub collections: Option<Vec<Collection>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_collections(mut self, collections: Vec<Collection>) -> Self {
        self.collections = Some(collections);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SDKEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref collections) = self.collections {
            let touched = event.collections();
            // 事件没有集合信息但过滤器要求有
            if touched.is_empty() || !touched.iter().any(|c| collections.contains(c)) {
                return false;
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SDKEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<u64>,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SDKEvent>,
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SDKEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 没有订阅者时 send 会失败，属于正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SDKEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器；`"*"` 监听所有事件
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SDKEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        self.listeners.write().await.clear();
        self.stats.write().await.listener_count = 0;
        info!("Cleared all event listeners");
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SDKEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SDKEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SDKEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SDKEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;
    use crate::sync::catch_up::CatchUpOutcome;

    pub fn now_millis() -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    pub fn connectivity_changed(
        old_status: ConnectivityStatus,
        new_status: ConnectivityStatus,
    ) -> SDKEvent {
        SDKEvent::ConnectivityChanged {
            old_status,
            new_status,
            timestamp: now_millis(),
        }
    }

    pub fn sync_phase_changed(old_phase: SyncPhase, new_phase: SyncPhase) -> SDKEvent {
        SDKEvent::SyncPhaseChanged {
            old_phase,
            new_phase,
            timestamp: now_millis(),
        }
    }

    pub fn replica_updated(collections: impl IntoIterator<Item = Collection>, offset: u64) -> SDKEvent {
        SDKEvent::ReplicaUpdated {
            collections: collections.into_iter().collect(),
            offset,
            timestamp: now_millis(),
        }
    }

    pub fn catch_up_completed(outcome: &CatchUpOutcome) -> SDKEvent {
        SDKEvent::CatchUpCompleted {
            full_fetch: outcome.is_full_fetch(),
            offset: outcome.offset(),
            timestamp: now_millis(),
        }
    }

    pub fn hole_detected(offset: u64, lowest_buffered: u64) -> SDKEvent {
        SDKEvent::HoleDetected {
            offset,
            lowest_buffered,
            timestamp: now_millis(),
        }
    }

    pub fn collection_resynced(collection: Collection, rows: usize) -> SDKEvent {
        SDKEvent::CollectionResynced {
            collection,
            rows,
            timestamp: now_millis(),
        }
    }

    pub fn ephemeral_updated(kind: EphemeralKind, scope_id: Option<String>) -> SDKEvent {
        SDKEvent::EphemeralUpdated {
            kind,
            scope_id,
            timestamp: now_millis(),
        }
    }

    pub fn mutation_committed(mutation_id: MutationId, name: &str) -> SDKEvent {
        SDKEvent::MutationCommitted {
            mutation_id,
            name: name.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn mutation_failed(mutation_id: MutationId, name: &str, error: &str) -> SDKEvent {
        SDKEvent::MutationFailed {
            mutation_id,
            name: name.to_string(),
            error: error.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn session_reset(reason: &str) -> SDKEvent {
        SDKEvent::SessionReset {
            reason: reason.to_string(),
            timestamp: now_millis(),
        }
    }
}
