//! 线上协议类型
//!
//! 推送通道、diff 接口与命令执行的请求/响应结构。JSON 字段统一为 camelCase。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::entities::{Collection, EntityId, FieldMap};

/// 服务端事件（分配 seqno 后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEvent {
    pub id: String,
    #[serde(default)]
    pub origin_user_id: Option<String>,
    /// 组织内严格递增、永不复用的序号
    pub seqno: u64,
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// diff 请求
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRequest {
    pub offset: u64,
}

/// diff 响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResponse {
    #[serde(default)]
    pub events: Vec<ServerEvent>,
    pub head_offset: u64,
    /// 服务端已无法从 offset 续传（日志已压缩），客户端必须全量重建
    #[serde(default)]
    pub reset_required: bool,
}

/// 推送通道信号。ready / keep-alive 属于带外信号，不消耗 seqno。
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    /// 订阅已就绪，可以开始 catch-up
    Ready,
    /// 心跳
    KeepAlive,
    /// 一条服务端事件（至少一次投递，可能乱序）
    Event(ServerEvent),
    /// 通道断开
    Disconnected { reason: String },
}

/// 服务端确认后的实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedEntity {
    pub collection: Collection,
    pub id: EntityId,
    pub fields: FieldMap,
    /// 该实体替换的乐观临时 ID（乐观创建时回传）
    #[serde(default)]
    pub client_id: Option<EntityId>,
}

/// 命令执行结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    #[serde(default)]
    pub entities: Vec<ConfirmedEntity>,
    /// 该命令在服务端日志中产生的 seqno（仅用于日志，offset 仍只随事件流推进）
    #[serde(default)]
    pub seqno: Option<u64>,
}
