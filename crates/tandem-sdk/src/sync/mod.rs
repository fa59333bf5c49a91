/// 副本同步模块
///
/// 职责：
/// - 把乱序、重复的推送流整理成有序批次（sequencer）
/// - 把单条服务端事件翻译成副本补丁（mapper）
/// - 重连后的 catch-up：diff 续传或全量重建（catch_up）
/// - 编排推送流、catch-up 和 mutation 队列（orchestrator）

pub mod catch_up;
pub mod mapper;
pub mod orchestrator;
pub mod sequencer;

pub use catch_up::{CatchUpOutcome, FullFetchReason};
pub use mapper::{map_event, MappedEvent};
pub use orchestrator::{DrainReport, SyncOrchestrator};
pub use sequencer::{SequencerConfig, SequencerOutput, UpdateSequencer};

use serde::{Deserialize, Serialize};

use crate::reconnect::ReconnectConfig;

/// 同步阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// 尚未启动
    Idle,
    /// 恢复快照、等待首次 catch-up
    Bootstrapping,
    /// 推送流已追上
    Live,
    /// 断线、空洞或服务端要求重置后正在恢复
    Recovering,
    /// 已销毁
    Destroyed,
}

/// 同步配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    pub sequencer: SequencerConfig,
    pub reconnect: ReconnectConfig,
    /// 每次应用后写快照
    pub persist_snapshots: bool,
}
