//! Tandem SDK 主入口
//!
//! ```text
//! TandemSDK
//!   ├── ReplicaStore (内存副本 + 乐观 mutation 队列)
//!   ├── SyncOrchestrator (推送流 / catch-up / drain)
//!   ├── SnapshotStore → KvStore (sled 快照)
//!   ├── EventManager (UI 通知)
//!   └── LifecycleManager (前后台)
//! ```
//!
//! 传输层和命令执行由调用方通过 [`EventTransport`] 与 [`CommandExecutor`] 注入。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn, Level};

use crate::connection_state::{ConnectionState, ConnectivityStatus};
use crate::error::{Result, TandemSDKError};
use crate::events::{EventFilter, EventManager, FilteredEventReceiver, SDKEvent};
use crate::lifecycle::{LifecycleManager, SyncLifecycleHook};
use crate::reconnect::ReconnectConfig;
use crate::storage::entities::{Collection, FieldMap, MutationId, SessionIdentity};
use crate::storage::kv::KvStore;
use crate::storage::mutators::MutatorRegistry;
use crate::storage::replica::{OptimisticTx, ReplicaStore};
use crate::storage::snapshot::SnapshotStore;
use crate::sync::catch_up::CatchUpOutcome;
use crate::sync::orchestrator::BootstrapOutcome;
use crate::sync::sequencer::SequencerConfig;
use crate::sync::{DrainReport, SyncConfig, SyncOrchestrator, SyncPhase};
use crate::transport::{CommandExecutor, EventTransport};
use crate::version;

/// Tandem SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TandemConfig {
    /// 数据存储目录（快照 KV 位于 `{data_dir}/kv`）
    pub data_dir: PathBuf,
    pub sequencer: SequencerConfig,
    pub reconnect: ReconnectConfig,
    /// 事件广播缓冲区大小
    pub event_buffer_size: usize,
    /// 每次应用后写副本快照
    pub persist_snapshots: bool,
    pub debug_mode: bool,
}

impl Default for TandemConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sequencer: SequencerConfig::default(),
            reconnect: ReconnectConfig::default(),
            event_buffer_size: 1000,
            persist_snapshots: true,
            debug_mode: false,
        }
    }
}

/// 默认数据目录 ~/.tandem/
fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(".tandem"))
        .unwrap_or_else(|_| PathBuf::from("./tandem_data"))
}

impl TandemConfig {
    pub fn builder() -> TandemConfigBuilder {
        TandemConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.sequencer.flush_debounce_ms == 0 {
            return Err(TandemSDKError::Config("flush_debounce_ms 必须大于 0".into()));
        }
        if self.sequencer.max_batch_wait_ms == 0 {
            return Err(TandemSDKError::Config("max_batch_wait_ms 必须大于 0".into()));
        }
        if self.sequencer.hole_timeout_ms == 0 {
            return Err(TandemSDKError::Config("hole_timeout_ms 必须大于 0".into()));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(TandemSDKError::Config("base_delay_ms 必须大于 0".into()));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(TandemSDKError::Config(format!(
                "base_delay_ms ({}) 不能大于 max_delay_ms ({})",
                self.reconnect.base_delay_ms, self.reconnect.max_delay_ms
            )));
        }
        if self.event_buffer_size == 0 {
            return Err(TandemSDKError::Config("event_buffer_size 必须大于 0".into()));
        }
        Ok(())
    }

    fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            sequencer: self.sequencer.clone(),
            reconnect: self.reconnect.clone(),
            persist_snapshots: self.persist_snapshots,
        }
    }
}

#[derive(Debug, Default)]
pub struct TandemConfigBuilder {
    config: TandemConfig,
}

impl TandemConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn flush_debounce_ms(mut self, ms: u64) -> Self {
        self.config.sequencer.flush_debounce_ms = ms;
        self
    }

    /// 持续推送时一个批次最长等待多久
    pub fn max_batch_wait_ms(mut self, ms: u64) -> Self {
        self.config.sequencer.max_batch_wait_ms = ms;
        self
    }

    pub fn hole_timeout_ms(mut self, ms: u64) -> Self {
        self.config.sequencer.hole_timeout_ms = ms;
        self
    }

    pub fn reconnect(mut self, config: ReconnectConfig) -> Self {
        self.config.reconnect = config;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn persist_snapshots(mut self, enabled: bool) -> Self {
        self.config.persist_snapshots = enabled;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> TandemConfig {
        self.config
    }
}

/// 安装 fmt subscriber。已经安装过（宿主应用或测试）时静默跳过。
pub fn init_tracing(debug_mode: bool) {
    let level = if debug_mode { Level::DEBUG } else { Level::INFO };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

pub struct TandemSDK {
    config: TandemConfig,
    identity: SessionIdentity,
    kv: Arc<KvStore>,
    events: Arc<EventManager>,
    store: Arc<ReplicaStore>,
    orchestrator: Arc<SyncOrchestrator>,
    lifecycle: RwLock<LifecycleManager>,
    shutting_down: AtomicBool,
}

impl TandemSDK {
    /// 使用内置 mutator 初始化
    pub async fn initialize(
        config: TandemConfig,
        identity: SessionIdentity,
        transport: Arc<dyn EventTransport>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Arc<Self>> {
        Self::initialize_with_mutators(config, identity, transport, executor, MutatorRegistry::default())
            .await
    }

    pub async fn initialize_with_mutators(
        config: TandemConfig,
        identity: SessionIdentity,
        transport: Arc<dyn EventTransport>,
        executor: Arc<dyn CommandExecutor>,
        mutators: MutatorRegistry,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        init_tracing(config.debug_mode);
        info!("正在初始化 {} (会话 {})", version::version_line(), identity);

        let kv = Arc::new(KvStore::new(&config.data_dir).await?);
        let snapshots = Arc::new(SnapshotStore::new(kv.clone()));
        let events = Arc::new(EventManager::new(config.event_buffer_size));
        let store = Arc::new(ReplicaStore::with_mutators(identity.clone(), mutators));

        let orchestrator = Arc::new(
            SyncOrchestrator::new(
                store.clone(),
                transport,
                executor,
                events.clone(),
                config.sync_config(),
            )
            .with_snapshot_store(snapshots),
        );

        let mut lifecycle = LifecycleManager::new();
        lifecycle.register_hook(Arc::new(SyncLifecycleHook::new(&orchestrator)));

        info!("Tandem SDK 初始化完成");
        Ok(Arc::new(Self {
            config,
            identity,
            kv,
            events,
            store,
            orchestrator,
            lifecycle: RwLock::new(lifecycle),
            shutting_down: AtomicBool::new(false),
        }))
    }

    /// 恢复快照并开始订阅推送流
    pub async fn start(&self) -> Result<BootstrapOutcome> {
        self.check_running()?;
        self.orchestrator.start().await
    }

    fn check_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) || self.orchestrator.is_destroyed() {
            return Err(TandemSDKError::Destroyed(self.identity.to_string()));
        }
        Ok(())
    }

    // ========== 读写 ==========

    pub fn config(&self) -> &TandemConfig {
        &self.config
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    pub fn register_mutator<F>(&self, name: impl Into<String>, mutator: F)
    where
        F: Fn(&mut OptimisticTx<'_>, &Value) -> Result<()> + Send + Sync + 'static,
    {
        self.store.register_mutator(name, mutator);
    }

    /// 乐观执行一个已注册的 mutator，返回 mutation id
    pub fn mutate(&self, name: &str, input: Value) -> Result<MutationId> {
        self.check_running()?;
        self.orchestrator.mutate(name, input)
    }

    pub fn set_local_fields(&self, collection: Collection, id: &str, fields: FieldMap) -> Result<bool> {
        self.check_running()?;
        self.orchestrator.set_local_fields(collection, id, fields)
    }

    /// 立即 catch-up（例如用户下拉刷新）
    pub async fn catch_up(&self) -> Result<CatchUpOutcome> {
        self.check_running()?;
        self.orchestrator.catch_up().await
    }

    /// 立即排空 mutation 队列
    pub async fn flush_mutations(&self) -> Result<DrainReport> {
        self.check_running()?;
        Ok(self.orchestrator.drain_mutations().await)
    }

    // ========== 状态与事件 ==========

    pub fn subscribe_events(&self) -> broadcast::Receiver<SDKEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.events.subscribe_filtered(filter)
    }

    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn phase(&self) -> SyncPhase {
        self.orchestrator.phase()
    }

    pub async fn connectivity(&self) -> ConnectivityStatus {
        self.orchestrator.connectivity().await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.orchestrator.connection_state().get_state().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    // ========== 生命周期 ==========

    pub async fn enter_foreground(&self) -> Result<()> {
        self.check_running()?;
        self.lifecycle.read().await.notify_foreground().await
    }

    pub async fn enter_background(&self) -> Result<()> {
        self.check_running()?;
        self.lifecycle.read().await.notify_background().await
    }

    /// 写最后一次快照，停止推送循环。重复调用无副作用。
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("正在关闭 Tandem SDK...");
        self.orchestrator.shutdown().await;
        if let Err(e) = self.kv.flush().await {
            warn!("刷新 KV 失败: {}", e);
        }
        self.orchestrator.connection_state().log_state().await;
        info!("Tandem SDK 关闭完成");
        Ok(())
    }
}
