//! Tandem SDK - 离线可用的副本同步客户端
//!
//! 把服务端推送流、重连后的 catch-up 和本地乐观 mutation 收敛成一份一致的内存副本：
//! - 推送流按 seqno 排序、去重、去抖后成批应用，空洞超时后全量重建
//! - 重连后 diff 续传，服务端要求重置或 diff 失败时全量拉取
//! - mutation 先乐观写入副本，再严格 FIFO 单飞发往服务端，以服务端结果为准
//! - 副本快照按会话身份持久化到 sled，身份不匹配的快照一律丢弃
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tandem_sdk::{SessionIdentity, TandemConfig, TandemSDK};
//! # async fn run(
//! #     transport: Arc<dyn tandem_sdk::EventTransport>,
//! #     executor: Arc<dyn tandem_sdk::CommandExecutor>,
//! # ) -> tandem_sdk::Result<()> {
//! let config = TandemConfig::builder().data_dir("/path/to/data").build();
//! let sdk = TandemSDK::initialize(
//!     config,
//!     SessionIdentity::new("user-1", "org-1"),
//!     transport,
//!     executor,
//! )
//! .await?;
//! sdk.start().await?;
//!
//! sdk.mutate(
//!     "update",
//!     serde_json::json!({"collection": "documents", "id": "doc-1", "fields": {"title": "Plan"}}),
//! )?;
//!
//! sdk.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod connection_state;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod protocol;
pub mod reconnect;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod version;

#[cfg(test)]
mod test_support;

pub use connection_state::{ConnectionState, ConnectionStateManager, ConnectivityStatus, SyncStats};
pub use error::{Result, TandemSDKError};
pub use events::{EventFilter, EventManager, SDKEvent};
pub use lifecycle::{LifecycleHook, LifecycleManager, SyncLifecycleHook};
pub use protocol::{
    CommandOutcome, ConfirmedEntity, DiffRequest, DiffResponse, ServerEvent, TransportSignal,
};
pub use reconnect::{ReconnectBackoff, ReconnectConfig, ReconnectState};
pub use sdk::{init_tracing, TandemConfig, TandemConfigBuilder, TandemSDK};
pub use storage::{
    Collection, EntityId, EntityRecord, FieldMap, MutationId, MutatorRegistry, OptimisticTx,
    PendingMutation, RebaseOptions, ReplicaStore, RowOp, RowPatch, SessionIdentity,
};
pub use sync::orchestrator::BootstrapOutcome;
pub use sync::{
    CatchUpOutcome, DrainReport, FullFetchReason, SequencerConfig, SyncConfig, SyncOrchestrator,
    SyncPhase, UpdateSequencer,
};
pub use transport::{CommandExecutor, EventTransport};
