use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::{CommandOutcome, DiffResponse, TransportSignal};
use crate::storage::entities::{Collection, PendingMutation};

/// 事件传输层（由上层实现：WebSocket / SSE / 长轮询等，帧格式对 SDK 不透明）
///
/// `subscribe` 每次调用都建立一条新的推送订阅，旧的 receiver 随之失效。
/// 断开时实现方应发送 `TransportSignal::Disconnected` 或直接关闭 channel。
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// 建立推送订阅
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<TransportSignal>>;

    /// 拉取 offset 之后的事件
    async fn diff(&self, offset: u64) -> Result<DiffResponse>;

    /// 服务端当前日志头（全量同步前读取）
    async fn head_offset(&self) -> Result<u64>;

    /// 拉取某个顶层集合的全部实体（每个元素为带 `id` 的实体对象）
    async fn fetch_collection(&self, collection: Collection) -> Result<Vec<Value>>;
}

/// 命令执行器：把一条待确认 mutation 发往服务端
///
/// 返回 `Err(TandemSDKError::Rejected { .. })` 表示服务端终态拒绝；
/// 网络类错误（`is_retryable()`）会让 mutation 留在队列里等待下一次触发。
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, mutation: &PendingMutation) -> Result<CommandOutcome>;
}
