//! 同步编排器
//!
//! 把三条独立的时间线收敛成一份一致的副本：
//! - 推送流：sequencer 排序 → mapper 翻译 → 副本一次性应用
//! - catch-up：重连后 diff 续传，必要时全量重建
//! - mutation 队列：严格 FIFO、单飞地发往服务端，再用权威结果 rebase
//!
//! 阶段：idle → bootstrapping → live ⇄ recovering → live，任意阶段都可以进入 destroyed。

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use chrono::Utc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::catch_up::{self, CatchUpOutcome, CatchUpPlan, FullFetchReason, MAX_DIFF_PAGES};
use super::mapper::{map_event, MappedEvent};
use super::sequencer::{SequencerOutput, SequencerStats, UpdateSequencer};
use super::{SyncConfig, SyncPhase};
use crate::connection_state::{ConnectionStateManager, ConnectivityStatus};
use crate::error::{Result, TandemSDKError};
use crate::events::{event_builders, EventManager};
use crate::protocol::{DiffResponse, ServerEvent, TransportSignal};
use crate::reconnect::{ReconnectBackoff, ReconnectState};
use crate::storage::entities::{Collection, FieldMap, MutationId, SessionIdentity};
use crate::storage::ephemeral::{EphemeralKind, EphemeralRecord};
use crate::storage::replica::ReplicaStore;
use crate::storage::snapshot::{SnapshotLoad, SnapshotStore};
use crate::transport::{CommandExecutor, EventTransport};

type SharedCatchUp = Shared<BoxFuture<'static, Result<CatchUpOutcome>>>;

/// 关闭时等待推送循环退出的上限
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// 启动时的快照恢复结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// 没有可用快照，从空基线开始
    Fresh,
    Restored { offset: u64, pending: usize },
    /// 快照身份或格式不匹配，已丢弃
    Discarded { reason: String },
}

/// 一次 drain 的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub committed: Vec<MutationId>,
    /// 被服务端终态拒绝的 mutation（本轮到此停止）
    pub failed: Option<MutationId>,
    /// 因网络类错误留在队首等待下次触发的 mutation
    pub deferred: Option<MutationId>,
    /// 另一轮 drain 正在进行，本次调用什么也没做
    pub skipped: bool,
}

/// 一批事件应用后的汇总
#[derive(Debug, Default)]
struct ApplySummary {
    collections: BTreeSet<Collection>,
    resyncs: BTreeSet<Collection>,
    ephemeral: Vec<(EphemeralKind, Option<String>)>,
    revoked: bool,
}

enum LoopExit {
    Destroyed,
    Disconnected(String),
}

pub struct SyncOrchestrator {
    identity: SessionIdentity,
    config: SyncConfig,
    store: Arc<ReplicaStore>,
    transport: Arc<dyn EventTransport>,
    executor: Arc<dyn CommandExecutor>,
    events: Arc<EventManager>,
    connection: ConnectionStateManager,
    snapshots: Option<Arc<SnapshotStore>>,
    sequencer: Mutex<UpdateSequencer>,
    backoff: ReconnectBackoff,
    phase: RwLock<SyncPhase>,
    started: AtomicBool,
    destroyed: AtomicBool,
    draining: AtomicBool,
    shutdown: Notify,
    catch_up_inflight: Mutex<Option<SharedCatchUp>>,
    /// 副本写入闸门：catch-up 期间推送批次的应用被挂起
    apply_gate: AsyncMutex<()>,
    live_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<ReplicaStore>,
        transport: Arc<dyn EventTransport>,
        executor: Arc<dyn CommandExecutor>,
        events: Arc<EventManager>,
        config: SyncConfig,
    ) -> Self {
        let identity = store.identity().clone();
        let sequencer = UpdateSequencer::new(store.offset(), config.sequencer.clone());
        let backoff = ReconnectBackoff::new(config.reconnect.clone());
        Self {
            connection: ConnectionStateManager::new(identity.clone()),
            identity,
            config,
            store,
            transport,
            executor,
            events,
            snapshots: None,
            sequencer: Mutex::new(sequencer),
            backoff,
            phase: RwLock::new(SyncPhase::Idle),
            started: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            shutdown: Notify::new(),
            catch_up_inflight: Mutex::new(None),
            apply_gate: AsyncMutex::new(()),
            live_task: Mutex::new(None),
        }
    }

    pub fn with_snapshot_store(mut self, snapshots: Arc<SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn with_connection_state(mut self, connection: ConnectionStateManager) -> Self {
        self.connection = connection;
        self
    }

    // ========== 状态查询 ==========

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.read()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub async fn connectivity(&self) -> ConnectivityStatus {
        self.connection.status().await
    }

    pub fn connection_state(&self) -> &ConnectionStateManager {
        &self.connection
    }

    pub fn sequencer_stats(&self) -> SequencerStats {
        self.sequencer.lock().stats()
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.backoff.state()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(TandemSDKError::Destroyed(self.identity.to_string()));
        }
        Ok(())
    }

    async fn set_phase(&self, phase: SyncPhase) {
        let old = {
            let mut current = self.phase.write();
            let old = *current;
            if old == phase || old == SyncPhase::Destroyed {
                return;
            }
            *current = phase;
            old
        };
        info!("同步阶段: {:?} -> {:?}", old, phase);
        self.events
            .emit(event_builders::sync_phase_changed(old, phase))
            .await;
    }

    async fn set_connectivity(&self, status: ConnectivityStatus) {
        if let Some(old) = self.connection.set_status(status).await {
            info!("连接状态: {} -> {}", old, status);
            self.events
                .emit(event_builders::connectivity_changed(old, status))
                .await;
        }
    }

    // ========== 启动 / 销毁 ==========

    /// 恢复快照并启动推送循环
    pub async fn start(self: &Arc<Self>) -> Result<BootstrapOutcome> {
        self.ensure_alive()?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(TandemSDKError::InvalidInput("同步已启动".to_string()));
        }

        self.set_phase(SyncPhase::Bootstrapping).await;
        let outcome = self.bootstrap().await?;
        info!("启动引导完成: {:?}", outcome);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run_live_loop().await;
        });
        *self.live_task.lock() = Some(handle);
        Ok(outcome)
    }

    /// 只恢复与当前会话身份一致的快照
    pub async fn bootstrap(&self) -> Result<BootstrapOutcome> {
        self.ensure_alive()?;
        let Some(snapshots) = &self.snapshots else {
            return Ok(BootstrapOutcome::Fresh);
        };

        match snapshots.load(&self.identity).await {
            Ok(SnapshotLoad::Restored(snapshot)) => {
                let offset = snapshot.offset;
                let pending = snapshot.pending.len();
                self.store.restore(snapshot)?;
                self.sequencer.lock().reset(offset);
                Ok(BootstrapOutcome::Restored { offset, pending })
            }
            Ok(SnapshotLoad::Missing) => Ok(BootstrapOutcome::Fresh),
            Ok(SnapshotLoad::Discarded { reason }) => Ok(BootstrapOutcome::Discarded { reason }),
            Err(e) => {
                warn!("读取快照失败，从空基线开始: {}", e);
                Ok(BootstrapOutcome::Fresh)
            }
        }
    }

    /// 标记销毁、停止 sequencer 计时器并唤醒推送循环。进行中的网络调用会完成，但结果被丢弃。
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("同步编排器销毁: {}", self.identity);
        self.sequencer.lock().destroy();
        self.shutdown.notify_one();

        let old = std::mem::replace(&mut *self.phase.write(), SyncPhase::Destroyed);
        if old != SyncPhase::Destroyed {
            self.events
                .emit(event_builders::sync_phase_changed(old, SyncPhase::Destroyed))
                .await;
        }
        self.set_connectivity(ConnectivityStatus::Disconnected).await;
    }

    /// 写最后一次快照后销毁，并等待推送循环退出
    pub async fn shutdown(&self) {
        self.persist().await;
        self.destroy().await;

        let handle = self.live_task.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("推送循环未在 {:?} 内退出，强制终止", SHUTDOWN_GRACE);
                handle.abort();
            }
        }
    }

    // ========== 推送循环 ==========

    async fn run_live_loop(self: &Arc<Self>) {
        info!("推送循环启动: {}", self.identity);
        loop {
            if self.is_destroyed() {
                break;
            }

            let exit = match self.transport.subscribe().await {
                Ok(receiver) => self.pump(receiver).await,
                Err(e) => LoopExit::Disconnected(format!("订阅失败: {}", e)),
            };
            let reason = match exit {
                LoopExit::Destroyed => break,
                LoopExit::Disconnected(reason) => reason,
            };
            if self.is_destroyed() {
                break;
            }

            warn!("推送流断开: {}", reason);
            self.connection.record_disconnect(&reason).await;
            self.set_connectivity(ConnectivityStatus::Reconnecting).await;
            self.set_phase(SyncPhase::Recovering).await;

            let delay = self.backoff.on_disconnect();
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("推送循环退出: {}", self.identity);
    }

    async fn pump(self: &Arc<Self>, mut receiver: mpsc::UnboundedReceiver<TransportSignal>) -> LoopExit {
        loop {
            if self.is_destroyed() {
                return LoopExit::Destroyed;
            }
            let deadline = self.sequencer.lock().next_deadline();

            tokio::select! {
                _ = self.shutdown.notified() => return LoopExit::Destroyed,
                signal = receiver.recv() => {
                    let Some(signal) = signal else {
                        return LoopExit::Disconnected("推送通道已关闭".to_string());
                    };
                    match signal {
                        TransportSignal::Ready => {
                            if let Err(e) = self.on_ready().await {
                                if self.is_destroyed() {
                                    return LoopExit::Destroyed;
                                }
                                return LoopExit::Disconnected(format!("catch-up 失败: {}", e));
                            }
                        }
                        TransportSignal::KeepAlive => trace!("keep-alive"),
                        TransportSignal::Event(event) => self.on_event(event).await,
                        TransportSignal::Disconnected { reason } => {
                            return LoopExit::Disconnected(reason);
                        }
                    }
                }
                _ = sleep_until_deadline(deadline) => {
                    if let Err(e) = self.on_deadline().await {
                        if self.is_destroyed() {
                            return LoopExit::Destroyed;
                        }
                        return LoopExit::Disconnected(format!("全量重建失败: {}", e));
                    }
                }
            }
        }
    }

    async fn on_ready(self: &Arc<Self>) -> Result<()> {
        info!("推送流已就绪，开始 catch-up");
        self.backoff.mark_ready();
        self.set_connectivity(ConnectivityStatus::Connected).await;

        self.catch_up().await?;
        self.set_phase(SyncPhase::Live).await;
        self.trigger_drain();
        Ok(())
    }

    async fn on_event(&self, event: ServerEvent) {
        trace!("收到事件: seqno={} type={}", event.seqno, event.event_type);
        self.connection
            .update_stats(|s| s.events_received += 1)
            .await;
        self.sequencer.lock().push(event, Instant::now());
    }

    async fn on_deadline(self: &Arc<Self>) -> Result<()> {
        let outputs = self.sequencer.lock().poll(Instant::now());
        for output in outputs {
            match output {
                SequencerOutput::Batch(batch) => self.apply_batch(batch).await,
                SequencerOutput::Hole {
                    offset,
                    lowest_buffered,
                } => {
                    self.connection
                        .update_stats(|s| s.holes_detected += 1)
                        .await;
                    self.events
                        .emit(event_builders::hole_detected(offset, lowest_buffered))
                        .await;
                    self.set_phase(SyncPhase::Recovering).await;
                    self.coalesced(Some(FullFetchReason::Hole)).await?;
                    self.set_phase(SyncPhase::Live).await;
                }
            }
        }
        Ok(())
    }

    /// 进行中的 catch-up 结束之前不会应用推送批次
    async fn apply_batch(self: &Arc<Self>, batch: Vec<ServerEvent>) {
        let _gate = self.apply_gate.lock().await;
        if self.is_destroyed() {
            return;
        }

        let floor = self.store.offset();
        let Some(last) = batch.last().map(|e| e.seqno).filter(|last| *last > floor) else {
            debug!("批次已被 catch-up 覆盖 (offset={})，跳过", floor);
            self.raise_sequencer_floor(floor);
            return;
        };

        debug!("应用批次: {} 条, 截至 seqno={}", batch.len(), last);
        let summary = self.apply_events(&batch);
        let offset = self.store.advance_offset(last);
        self.raise_sequencer_floor(offset);
        self.connection
            .update_stats(|s| s.batches_applied += 1)
            .await;
        self.finish_apply(summary, offset).await;
    }

    /// 把一组有序事件翻译并一次性写入副本。seqno 不大于当前 offset 的事件不再应用。
    fn apply_events(&self, events: &[ServerEvent]) -> ApplySummary {
        let mut summary = ApplySummary::default();
        let mut patches = Vec::new();
        let mut ephemeral: Vec<EphemeralRecord> = Vec::new();

        let floor = self.store.offset();
        for event in events.iter().filter(|e| e.seqno > floor) {
            match map_event(event) {
                MappedEvent::Patch(patch) => {
                    debug!("补丁: {} {} (seqno={})", patch.collection, patch.id, event.seqno);
                    patches.push(patch);
                }
                MappedEvent::Resync(collection) => {
                    summary.resyncs.insert(collection);
                }
                MappedEvent::Ephemeral(record) => {
                    summary.ephemeral.push((record.kind, record.scope_id.clone()));
                    ephemeral.push(record);
                }
                MappedEvent::MembershipRevoked { user_id } => {
                    if user_id == self.identity.user_id {
                        summary.revoked = true;
                    } else {
                        summary.resyncs.insert(Collection::Memberships);
                    }
                }
                MappedEvent::Ignored => {}
            }
        }

        summary.collections = self.store.apply_server_patches(patches);
        let store = self.store.ephemeral();
        if !ephemeral.is_empty() {
            store.extend(ephemeral);
        }
        let pruned = store.prune(Utc::now());
        if pruned > 0 {
            trace!("回收过期临时记录: {}", pruned);
        }
        summary
    }

    /// 应用之后：持久化、通知 UI、处理会话撤销，最后发起整集合重拉（不阻塞补丁应用）
    async fn finish_apply(self: &Arc<Self>, summary: ApplySummary, offset: u64) {
        self.persist().await;

        if !summary.collections.is_empty() {
            self.events
                .emit(event_builders::replica_updated(
                    summary.collections.iter().copied(),
                    offset,
                ))
                .await;
        }
        for (kind, scope_id) in summary.ephemeral {
            self.events
                .emit(event_builders::ephemeral_updated(kind, scope_id))
                .await;
        }

        if summary.revoked {
            self.handle_session_revoked().await;
            return;
        }
        for collection in summary.resyncs {
            self.spawn_resync(collection);
        }
    }

    fn spawn_resync(self: &Arc<Self>, collection: Collection) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            debug!("整集合重拉: {}", collection);
            match this.transport.fetch_collection(collection).await {
                Ok(rows) => {
                    if this.is_destroyed() {
                        debug!("编排器已销毁，丢弃重拉结果: {}", collection);
                        return;
                    }
                    let count = this.store.replace_collection(collection, rows);
                    this.connection.update_stats(|s| s.resyncs += 1).await;
                    this.persist().await;
                    this.events
                        .emit(event_builders::collection_resynced(collection, count))
                        .await;
                }
                Err(e) => warn!("整集合重拉失败: {}: {}", collection, e),
            }
        });
    }

    async fn handle_session_revoked(&self) {
        warn!("当前用户已被移出组织，重置会话: {}", self.identity);
        self.destroy().await;

        if let Some(snapshots) = &self.snapshots {
            if let Err(e) = snapshots.clear(&self.identity).await {
                warn!("清除快照失败: {}", e);
            }
        }
        self.store.clear();
        self.events
            .emit(event_builders::session_reset("removed_from_organization"))
            .await;
    }

    /// catch-up 之后重新定位 sequencer。sequencer 已经跑在前面时保持不动，除非强制。
    fn rearm_sequencer(&self, offset: u64, force: bool) {
        let mut sequencer = self.sequencer.lock();
        if force || offset >= sequencer.offset() {
            sequencer.rearm(offset, Instant::now());
        }
    }

    /// 副本已经越过 sequencer 时（它交出的批次被 catch-up 部分覆盖），把 sequencer 推到副本 offset
    fn raise_sequencer_floor(&self, offset: u64) {
        let mut sequencer = self.sequencer.lock();
        if sequencer.offset() < offset {
            sequencer.rearm(offset, Instant::now());
        }
    }

    // ========== catch-up ==========

    /// 追上服务端。并发调用共享同一次执行。
    pub async fn catch_up(self: &Arc<Self>) -> Result<CatchUpOutcome> {
        self.coalesced(None).await
    }

    /// `restart` 为空时按 offset 规划，否则强制全量重建。已有进行中的 catch-up 时直接加入它。
    /// 执行期间持有写入闸门，推送批次要等它应用完并重新定位 sequencer 之后才会被处理。
    async fn coalesced(self: &Arc<Self>, restart: Option<FullFetchReason>) -> Result<CatchUpOutcome> {
        let future = {
            let mut inflight = self.catch_up_inflight.lock();
            match inflight.as_ref() {
                Some(future) => {
                    debug!("catch-up 已在进行，合并本次调用");
                    future.clone()
                }
                None => {
                    let this = Arc::clone(self);
                    let future = async move {
                        let result = {
                            let _gate = this.apply_gate.lock().await;
                            this.run_catch_up(restart).await
                        };
                        *this.catch_up_inflight.lock() = None;
                        result
                    }
                    .boxed()
                    .shared();
                    *inflight = Some(future.clone());
                    future
                }
            }
        };
        future.await
    }

    async fn run_catch_up(self: &Arc<Self>, restart: Option<FullFetchReason>) -> Result<CatchUpOutcome> {
        self.ensure_alive()?;

        let plan = match restart {
            Some(reason) => CatchUpPlan::FullFetch(reason),
            None => catch_up::plan(self.store.offset()),
        };
        let outcome = match plan {
            CatchUpPlan::FullFetch(reason) => self.full_fetch(reason, None).await?,
            CatchUpPlan::Diff { offset } => match self.transport.diff(offset).await {
                Ok(response) => self.apply_diff_response(response).await?,
                Err(e) => {
                    warn!("diff 失败，按空洞处理: {}", e);
                    self.full_fetch(FullFetchReason::DiffFailed, None).await?
                }
            },
        };

        info!("catch-up 完成: {:?}", outcome);
        self.events
            .emit(event_builders::catch_up_completed(&outcome))
            .await;
        Ok(outcome)
    }

    async fn apply_diff_response(self: &Arc<Self>, first: DiffResponse) -> Result<CatchUpOutcome> {
        let mut applied = 0usize;
        let mut response = first;
        let mut pages = 0usize;

        loop {
            pages += 1;
            let current = self.store.offset();
            if response.reset_required {
                return self
                    .full_fetch(FullFetchReason::ResetRequired, Some(response.head_offset))
                    .await;
            }
            if response.head_offset < current {
                warn!(
                    "服务端 head ({}) 落后于本地 offset ({})，全量重建",
                    response.head_offset, current
                );
                return self
                    .full_fetch(FullFetchReason::ResetRequired, Some(response.head_offset))
                    .await;
            }

            let head = response.head_offset;
            let slice = catch_up::contiguous_after(response.events, current);
            if let Some(seqno) = slice.gap_before {
                warn!("diff 事件不连续 (offset={}, 断在 {})，全量重建", current, seqno);
                return self.full_fetch(FullFetchReason::DiffFailed, None).await;
            }

            let page_len = slice.events.len();
            if let Some(last) = slice.events.last().map(|e| e.seqno) {
                self.ensure_alive()?;
                let summary = self.apply_events(&slice.events);
                applied += page_len;
                let stored = self.store.advance_offset(last);
                self.finish_apply(summary, stored).await;
                self.ensure_alive()?;
            }

            let current = self.store.offset();
            if head <= current || page_len == 0 || pages >= MAX_DIFF_PAGES {
                break;
            }
            debug!("diff 继续分页: offset={}, head={}", current, head);
            response = match self.transport.diff(current).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("diff 分页失败，按空洞处理: {}", e);
                    return self.full_fetch(FullFetchReason::DiffFailed, None).await;
                }
            };
        }

        let offset = self.store.offset();
        self.rearm_sequencer(offset, false);
        self.connection
            .update_stats(|s| s.diffs_applied += 1)
            .await;
        Ok(CatchUpOutcome::Diff { applied, offset })
    }

    /// 全量重建：先读 head，再逐个集合整表替换，最后把 offset 设为 head
    async fn full_fetch(
        self: &Arc<Self>,
        reason: FullFetchReason,
        head_override: Option<u64>,
    ) -> Result<CatchUpOutcome> {
        self.ensure_alive()?;
        info!("全量拉取开始: reason={:?}", reason);

        let head = match head_override {
            Some(head) => head,
            None => self.transport.head_offset().await?,
        };

        let mut fetched = Vec::with_capacity(Collection::ALL.len());
        for collection in Collection::ALL {
            let rows = self.transport.fetch_collection(collection).await?;
            debug!("拉取集合 {}: {} 行", collection, rows.len());
            fetched.push((collection, rows));
        }

        self.ensure_alive()?;
        let rows = self.store.replace_collections(fetched);
        self.store.reset_offset(head);
        self.rearm_sequencer(head, reason == FullFetchReason::ResetRequired);
        self.connection
            .update_stats(|s| s.full_fetches += 1)
            .await;

        self.persist().await;
        self.events
            .emit(event_builders::replica_updated(Collection::ALL, head))
            .await;

        info!("全量拉取完成: head={}, rows={}", head, rows);
        Ok(CatchUpOutcome::FullFetch {
            reason,
            head_offset: head,
            rows,
        })
    }

    // ========== mutation ==========

    /// 乐观执行并在后台排空队列
    pub fn mutate(self: &Arc<Self>, name: &str, input: Value) -> Result<MutationId> {
        self.ensure_alive()?;
        let mutation_id = self.store.mutate(name, input)?;
        self.spawn_background(true);
        Ok(mutation_id)
    }

    /// 写设备本地字段（不进入 mutation 队列）
    pub fn set_local_fields(
        self: &Arc<Self>,
        collection: Collection,
        id: &str,
        fields: FieldMap,
    ) -> Result<bool> {
        self.ensure_alive()?;
        let changed = self.store.set_local_fields(collection, id, fields);
        if changed {
            self.spawn_background(false);
        }
        Ok(changed)
    }

    /// 在后台触发一次 drain
    pub fn trigger_drain(self: &Arc<Self>) {
        self.spawn_background_task(false, true);
    }

    fn spawn_background(self: &Arc<Self>, drain: bool) {
        self.spawn_background_task(true, drain);
    }

    fn spawn_background_task(self: &Arc<Self>, persist: bool, drain: bool) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("当前线程没有 tokio 运行时，跳过后台持久化 / drain");
            return;
        };
        let this = Arc::clone(self);
        handle.spawn(async move {
            if persist {
                this.persist().await;
            }
            if drain {
                this.drain_mutations().await;
            }
        });
    }

    /// 严格按提交顺序逐条发往服务端。并发调用直接返回 `skipped`。
    pub async fn drain_mutations(&self) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug!("mutation 队列正在排空，跳过本次触发");
                report.skipped = report.committed.is_empty();
                return report;
            }

            let halted = self.drain_pass(&mut report).await;
            self.draining.store(false, Ordering::Release);

            // 标志清除之前入队的 mutation 可能错过了触发
            if halted || self.is_destroyed() || self.store.pending_len() == 0 {
                return report;
            }
        }
    }

    /// 返回 true 表示本轮被中止
    async fn drain_pass(&self, report: &mut DrainReport) -> bool {
        loop {
            if self.is_destroyed() {
                return true;
            }
            let Some(mutation) = self.store.peek_pending() else {
                return false;
            };
            debug!("执行 mutation: {} {}", mutation.name, mutation.id);

            match self.executor.execute(&mutation).await {
                Ok(outcome) => {
                    if self.is_destroyed() {
                        return true;
                    }
                    if let Some(seqno) = outcome.seqno {
                        debug!("mutation {} 落在 seqno={}", mutation.id, seqno);
                    }
                    let touched = self.store.rebase_confirmed(outcome.entities);
                    self.store.commit(mutation.id);
                    self.connection
                        .update_stats(|s| s.mutations_committed += 1)
                        .await;
                    self.persist().await;

                    self.events
                        .emit(event_builders::mutation_committed(mutation.id, &mutation.name))
                        .await;
                    if !touched.is_empty() {
                        self.events
                            .emit(event_builders::replica_updated(touched, self.store.offset()))
                            .await;
                    }
                    report.committed.push(mutation.id);
                }
                Err(e) if e.is_retryable() => {
                    warn!("mutation {} 暂时无法发送，留在队列: {}", mutation.id, e);
                    report.deferred = Some(mutation.id);
                    return true;
                }
                Err(e) => {
                    if self.is_destroyed() {
                        return true;
                    }
                    warn!("mutation {} 被拒绝: {}", mutation.id, e);
                    let rolled_back = self.store.commit_failed(mutation.id);
                    self.connection
                        .update_stats(|s| s.mutations_failed += 1)
                        .await;
                    self.persist().await;

                    self.events
                        .emit(event_builders::mutation_failed(
                            mutation.id,
                            &mutation.name,
                            &e.to_string(),
                        ))
                        .await;
                    if !rolled_back.is_empty() {
                        let collections: BTreeSet<Collection> =
                            rolled_back.iter().map(|(c, _)| *c).collect();
                        self.events
                            .emit(event_builders::replica_updated(collections, self.store.offset()))
                            .await;
                    }
                    report.failed = Some(mutation.id);
                    return true;
                }
            }
        }
    }

    // ========== 持久化 ==========

    pub async fn persist(&self) {
        if !self.config.persist_snapshots || self.is_destroyed() {
            return;
        }
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        let snapshot = self.store.persist();
        if let Err(e) = snapshots.save(&snapshot).await {
            warn!("写入快照失败: {}", e);
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SDKEvent;
    use crate::protocol::{CommandOutcome, ConfirmedEntity};
    use crate::storage::entities::RowPatch;
    use crate::storage::kv::KvStore;
    use crate::test_support::{event, settle, MockExecutor, ScriptedTransport};
    use serde_json::json;
    use tokio::sync::broadcast;

    struct Harness {
        orchestrator: Arc<SyncOrchestrator>,
        store: Arc<ReplicaStore>,
        transport: Arc<ScriptedTransport>,
        executor: Arc<MockExecutor>,
        events: broadcast::Receiver<SDKEvent>,
    }

    fn harness(executor: Arc<MockExecutor>) -> Harness {
        let store = Arc::new(ReplicaStore::new(SessionIdentity::new("u1", "org1")));
        let transport = ScriptedTransport::new();
        let events = Arc::new(EventManager::new(256));
        let receiver = events.subscribe();
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            transport.clone(),
            executor.clone(),
            events,
            SyncConfig::default(),
        ));
        Harness {
            orchestrator,
            store,
            transport,
            executor,
            events: receiver,
        }
    }

    fn collected(receiver: &mut broadcast::Receiver<SDKEvent>) -> Vec<SDKEvent> {
        let mut out = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            out.push(event);
        }
        out
    }

    fn fields(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap_or_default()
    }

    fn seed_document(store: &ReplicaStore, id: &str, title: &str) {
        store.apply_server_patches(vec![RowPatch::server_upsert(
            Collection::Documents,
            id,
            fields(json!({"id": id, "title": title})),
        )]);
    }

    fn update_input(id: &str, title: &str) -> Value {
        json!({"collection": "documents", "id": id, "fields": {"title": title}})
    }

    // ---------- catch-up ----------

    #[tokio::test]
    async fn zero_offset_catch_up_fetches_everything_and_never_diffs() {
        let h = harness(MockExecutor::accepting());
        h.transport.set_head(7);
        h.transport
            .set_rows(Collection::Users, vec![json!({"id": "u1", "name": "Ada"})]);
        h.transport
            .set_rows(Collection::Documents, vec![json!({"id": "d1", "title": "Plan"})]);

        let outcome = h.orchestrator.catch_up().await.unwrap();
        assert_eq!(
            outcome,
            CatchUpOutcome::FullFetch {
                reason: FullFetchReason::InitialSync,
                head_offset: 7,
                rows: 2,
            }
        );
        assert!(h.transport.diff_calls().is_empty());
        assert_eq!(h.transport.fetch_calls(), Collection::ALL.to_vec());
        assert_eq!(h.store.offset(), 7);
        assert_eq!(h.orchestrator.sequencer_stats().offset, 7);
    }

    #[tokio::test]
    async fn reset_required_lands_on_reported_head() {
        let h = harness(MockExecutor::accepting());
        h.store.advance_offset(5);
        h.transport.push_diff(Ok(DiffResponse {
            events: vec![event(6, "user.updated", json!({"id": "u1", "name": "x"}))],
            head_offset: 40,
            reset_required: true,
        }));

        let outcome = h.orchestrator.catch_up().await.unwrap();
        assert_eq!(outcome.offset(), 40);
        assert!(matches!(
            outcome,
            CatchUpOutcome::FullFetch {
                reason: FullFetchReason::ResetRequired,
                ..
            }
        ));
        assert_eq!(h.store.offset(), 40);
        assert_eq!(h.transport.head_calls(), 0);
        assert!(h.store.get(Collection::Users, "u1").is_none());
    }

    #[tokio::test]
    async fn diff_events_apply_and_rearm_sequencer() {
        let h = harness(MockExecutor::accepting());
        h.store.advance_offset(10);
        h.transport.push_diff(Ok(DiffResponse {
            events: vec![
                event(12, "document.updated", json!({"id": "d1", "title": "B"})),
                event(11, "document.created", json!({"id": "d1", "title": "A"})),
                event(10, "document.created", json!({"id": "d0", "title": "old"})),
            ],
            head_offset: 12,
            reset_required: false,
        }));

        let outcome = h.orchestrator.catch_up().await.unwrap();
        assert_eq!(outcome, CatchUpOutcome::Diff { applied: 2, offset: 12 });
        assert_eq!(h.store.get(Collection::Documents, "d1").unwrap().server["title"], "B");
        assert!(h.store.get(Collection::Documents, "d0").is_none());
        assert_eq!(h.orchestrator.sequencer_stats().offset, 12);
        assert_eq!(h.transport.diff_calls(), vec![10]);
    }

    #[tokio::test]
    async fn paginated_diff_follows_head() {
        let h = harness(MockExecutor::accepting());
        h.store.advance_offset(1);
        h.transport.push_diff(Ok(DiffResponse {
            events: vec![event(2, "user.created", json!({"id": "u2", "name": "B"}))],
            head_offset: 3,
            reset_required: false,
        }));
        h.transport.push_diff(Ok(DiffResponse {
            events: vec![event(3, "user.created", json!({"id": "u3", "name": "C"}))],
            head_offset: 3,
            reset_required: false,
        }));

        let outcome = h.orchestrator.catch_up().await.unwrap();
        assert_eq!(outcome, CatchUpOutcome::Diff { applied: 2, offset: 3 });
        assert_eq!(h.transport.diff_calls(), vec![1, 2]);
    }

    #[tokio::test]
    async fn failed_diff_falls_back_to_full_fetch() {
        let h = harness(MockExecutor::accepting());
        h.store.advance_offset(3);
        h.transport
            .push_diff(Err(TandemSDKError::Transport("502".into())));
        h.transport.set_head(9);

        let outcome = h.orchestrator.catch_up().await.unwrap();
        assert_eq!(
            outcome,
            CatchUpOutcome::FullFetch {
                reason: FullFetchReason::DiffFailed,
                head_offset: 9,
                rows: 0,
            }
        );
        assert_eq!(h.store.offset(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_catch_ups_share_one_diff() {
        let h = harness(MockExecutor::accepting());
        h.store.advance_offset(10);
        h.transport.set_diff_delay(Duration::from_millis(50));
        h.transport.push_diff(Ok(DiffResponse {
            events: vec![],
            head_offset: 10,
            reset_required: false,
        }));

        let (a, b) = tokio::join!(h.orchestrator.catch_up(), h.orchestrator.catch_up());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(h.transport.diff_calls().len(), 1);

        // 上一次结束后可以再次发起
        h.orchestrator.catch_up().await.unwrap();
        assert_eq!(h.transport.diff_calls().len(), 2);
    }

    #[tokio::test]
    async fn unknown_events_do_not_block_the_batch() {
        let h = harness(MockExecutor::accepting());
        h.store.advance_offset(1);
        h.transport.push_diff(Ok(DiffResponse {
            events: vec![
                event(2, "workspace.archived", json!({"id": "w1"})),
                event(3, "document.created", json!({"id": "d1", "title": "ok"})),
            ],
            head_offset: 3,
            reset_required: false,
        }));

        let outcome = h.orchestrator.catch_up().await.unwrap();
        assert_eq!(outcome.offset(), 3);
        assert!(h.store.get(Collection::Documents, "d1").is_some());
    }

    #[tokio::test]
    async fn id_only_events_trigger_collection_resync() {
        let mut h = harness(MockExecutor::accepting());
        h.store.advance_offset(1);
        h.transport.set_rows(
            Collection::Memberships,
            vec![json!({"id": "m1", "channelId": "ch1", "userId": "u1"})],
        );
        h.transport.push_diff(Ok(DiffResponse {
            events: vec![
                event(2, "channel.members_changed", json!({"channelId": "ch1"})),
                event(3, "organization.member_removed", json!({"userId": "u9"})),
            ],
            head_offset: 3,
            reset_required: false,
        }));

        h.orchestrator.catch_up().await.unwrap();
        settle().await;

        // 同一批里的两个重拉标记合并成一次
        assert_eq!(h.transport.fetch_calls(), vec![Collection::Memberships]);
        assert_eq!(h.store.count(Collection::Memberships), 1);
        assert!(collected(&mut h.events).iter().any(|e| matches!(
            e,
            SDKEvent::CollectionResynced {
                collection: Collection::Memberships,
                rows: 1,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_discards_in_flight_catch_up() {
        let h = harness(MockExecutor::accepting());
        h.store.advance_offset(5);
        h.transport.set_diff_delay(Duration::from_millis(100));
        h.transport.push_diff(Ok(DiffResponse {
            events: vec![event(6, "user.created", json!({"id": "u6", "name": "late"}))],
            head_offset: 6,
            reset_required: false,
        }));

        let orchestrator = h.orchestrator.clone();
        let pending = tokio::spawn(async move { orchestrator.catch_up().await });
        settle().await;
        h.orchestrator.destroy().await;

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(TandemSDKError::Destroyed(_))));
        assert_eq!(h.store.offset(), 5);
        assert!(h.store.get(Collection::Users, "u6").is_none());
    }

    // ---------- 推送循环 ----------

    #[tokio::test(start_paused = true)]
    async fn live_events_apply_in_one_debounced_batch() {
        let mut h = harness(MockExecutor::accepting());
        h.orchestrator.start().await.unwrap();
        settle().await;
        h.transport.ready();
        settle().await;
        assert_eq!(h.orchestrator.phase(), SyncPhase::Live);
        assert_eq!(h.orchestrator.connectivity().await, ConnectivityStatus::Connected);
        collected(&mut h.events);

        h.transport.emit(1, "user.created", json!({"id": "u1", "name": "Ada"}));
        h.transport.emit(3, "document.created", json!({"id": "d1", "title": "T"}));
        h.transport.emit(2, "channel.created", json!({"id": "ch1", "name": "general"}));
        h.transport.emit(2, "channel.created", json!({"id": "ch1", "name": "general"}));
        settle().await;
        assert_eq!(h.store.offset(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.store.offset(), 3);
        assert!(h.store.get(Collection::Documents, "d1").is_some());

        let updates: Vec<_> = collected(&mut h.events)
            .into_iter()
            .filter(|e| e.event_type() == "replica_updated")
            .collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0].collections(),
            vec![Collection::Users, Collection::Channels, Collection::Documents]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_hole_triggers_full_restart() {
        let mut h = harness(MockExecutor::accepting());
        h.orchestrator.start().await.unwrap();
        settle().await;
        h.transport.ready();
        settle().await;
        assert_eq!(h.transport.fetch_calls().len(), 5);

        h.transport.set_head(3);
        h.transport
            .set_rows(Collection::Users, vec![json!({"id": "u1", "name": "server"})]);
        h.transport.emit(1, "user.created", json!({"id": "u1", "name": "Ada"}));
        h.transport.emit(3, "user.created", json!({"id": "u3", "name": "Cy"}));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.store.offset(), 1);
        assert_eq!(h.transport.fetch_calls().len(), 5);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let events = collected(&mut h.events);
        let holes: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, SDKEvent::HoleDetected { offset: 1, lowest_buffered: 3, .. }))
            .collect();
        assert_eq!(holes.len(), 1);
        assert_eq!(h.transport.fetch_calls().len(), 10);
        assert_eq!(h.store.offset(), 3);
        assert_eq!(h.store.get(Collection::Users, "u1").unwrap().server["name"], "server");
        assert_eq!(h.orchestrator.phase(), SyncPhase::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_backs_off_and_resubscribes() {
        let h = harness(MockExecutor::accepting());
        h.orchestrator.start().await.unwrap();
        settle().await;
        h.transport.ready();
        settle().await;
        assert_eq!(h.transport.subscribe_calls(), 1);

        h.transport.disconnect("socket reset");
        settle().await;
        assert_eq!(
            h.orchestrator.connectivity().await,
            ConnectivityStatus::Reconnecting
        );
        assert_eq!(h.orchestrator.phase(), SyncPhase::Recovering);
        assert_eq!(h.orchestrator.reconnect_state().attempt_count, 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.transport.subscribe_calls(), 1);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.transport.subscribe_calls(), 2);

        h.transport.ready();
        settle().await;
        assert_eq!(h.orchestrator.connectivity().await, ConnectivityStatus::Connected);
        assert_eq!(h.orchestrator.reconnect_state().attempt_count, 0);
        assert_eq!(h.orchestrator.phase(), SyncPhase::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn removal_of_session_user_resets_session() {
        let mut h = harness(MockExecutor::accepting());
        h.orchestrator.start().await.unwrap();
        settle().await;
        h.transport.ready();
        settle().await;

        h.transport.emit(1, "document.created", json!({"id": "d1", "title": "T"}));
        h.transport
            .emit(2, "organization.member_removed", json!({"userId": "u1"}));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(h.orchestrator.is_destroyed());
        assert_eq!(h.orchestrator.phase(), SyncPhase::Destroyed);
        assert_eq!(h.store.count(Collection::Documents), 0);
        assert!(collected(&mut h.events)
            .iter()
            .any(|e| e.event_type() == "session_reset"));
        assert!(matches!(
            h.orchestrator.mutate("create", json!({})),
            Err(TandemSDKError::Destroyed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn foreground_catch_up_never_rolls_back_live_state() {
        let h = harness(MockExecutor::accepting());
        h.store.advance_offset(5);
        h.orchestrator.start().await.unwrap();
        settle().await;
        h.transport.ready();
        settle().await;
        assert_eq!(h.orchestrator.phase(), SyncPhase::Live);
        assert_eq!(h.orchestrator.sequencer_stats().offset, 5);

        let doc = |title: &str| json!({"id": "d1", "title": title});
        h.transport.set_diff_delay(Duration::from_millis(300));
        h.transport.push_diff(Ok(DiffResponse {
            events: vec![
                event(6, "document.updated", doc("v6")),
                event(7, "document.updated", doc("v7")),
            ],
            head_offset: 7,
            reset_required: false,
        }));
        let orchestrator = h.orchestrator.clone();
        let foreground = tokio::spawn(async move { orchestrator.catch_up().await });
        settle().await;

        h.transport.emit(6, "document.updated", doc("v6"));
        h.transport.emit(7, "document.updated", doc("v7"));
        h.transport.emit(8, "document.updated", doc("v8"));

        // 批次已到期，但要等 catch-up 应用完
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.store.offset(), 5);
        assert!(h.store.get(Collection::Documents, "d1").is_none());

        let outcome = foreground.await.unwrap().unwrap();
        assert_eq!(outcome, CatchUpOutcome::Diff { applied: 2, offset: 7 });
        settle().await;

        assert_eq!(h.store.offset(), 8);
        assert_eq!(h.store.get(Collection::Documents, "d1").unwrap().server["title"], "v8");
        assert_eq!(h.orchestrator.sequencer_stats().offset, 8);

        // 再来一条就能直接推进，不会被当成空洞
        h.transport.emit(9, "document.updated", doc("v9"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.store.offset(), 9);
        assert_eq!(h.orchestrator.sequencer_stats().buffered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hole_during_foreground_catch_up_joins_it() {
        let mut h = harness(MockExecutor::accepting());
        h.orchestrator.start().await.unwrap();
        settle().await;
        h.transport.ready();
        settle().await;
        assert_eq!(h.transport.fetch_calls().len(), 5);

        h.transport.emit(1, "user.created", json!({"id": "u1", "name": "Ada"}));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.store.offset(), 1);
        collected(&mut h.events);

        h.transport.set_diff_delay(Duration::from_secs(6));
        h.transport.push_diff(Ok(DiffResponse {
            events: vec![
                event(2, "user.created", json!({"id": "u2", "name": "Bo"})),
                event(3, "user.created", json!({"id": "u3", "name": "Cy"})),
            ],
            head_offset: 3,
            reset_required: false,
        }));
        let orchestrator = h.orchestrator.clone();
        let foreground = tokio::spawn(async move { orchestrator.catch_up().await });
        settle().await;

        h.transport.emit(3, "user.created", json!({"id": "u3", "name": "Cy"}));
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(h.orchestrator.phase(), SyncPhase::Recovering);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let outcome = foreground.await.unwrap().unwrap();
        assert_eq!(outcome, CatchUpOutcome::Diff { applied: 2, offset: 3 });
        settle().await;

        // 空洞恢复加入了进行中的 diff，没有再做全量拉取
        assert_eq!(h.transport.fetch_calls().len(), 5);
        assert_eq!(h.transport.diff_calls(), vec![1]);
        assert_eq!(h.store.offset(), 3);
        assert_eq!(h.orchestrator.sequencer_stats().offset, 3);
        assert_eq!(h.orchestrator.sequencer_stats().buffered, 0);
        assert_eq!(h.orchestrator.phase(), SyncPhase::Live);

        let holes = collected(&mut h.events)
            .into_iter()
            .filter(|e| e.event_type() == "hole_detected")
            .count();
        assert_eq!(holes, 1);
    }

    #[tokio::test]
    async fn stale_diff_events_are_not_reapplied() {
        let h = harness(MockExecutor::accepting());
        seed_document(&h.store, "d1", "current");
        h.store.advance_offset(4);
        h.transport.push_diff(Ok(DiffResponse {
            events: vec![
                event(3, "document.updated", json!({"id": "d1", "title": "old"})),
                event(4, "document.updated", json!({"id": "d1", "title": "older"})),
            ],
            head_offset: 4,
            reset_required: false,
        }));

        let outcome = h.orchestrator.catch_up().await.unwrap();
        assert_eq!(outcome, CatchUpOutcome::Diff { applied: 0, offset: 4 });
        assert_eq!(
            h.store.get(Collection::Documents, "d1").unwrap().server["title"],
            "current"
        );
    }

    #[tokio::test]
    async fn expired_ephemeral_records_are_pruned_on_apply() {
        let h = harness(MockExecutor::accepting());
        h.store.advance_offset(1);
        h.transport.push_diff(Ok(DiffResponse {
            events: vec![
                event(2, "typing.started", json!({"userId": "u2", "channelId": "ch1"})),
                event(3, "typing.stopped", json!({"userId": "u3", "channelId": "ch1"})),
            ],
            head_offset: 3,
            reset_required: false,
        }));

        h.orchestrator.catch_up().await.unwrap();
        assert_eq!(h.store.ephemeral().len(), 1);
        assert_eq!(
            h.store.ephemeral().typing_in("ch1", chrono::Utc::now()),
            vec!["u2".to_string()]
        );
    }

    // ---------- mutation 队列 ----------

    #[tokio::test]
    async fn queued_edits_end_with_servers_last_word() {
        let executor = MockExecutor::new(|mutation| {
            let title = mutation.input["fields"]["title"]
                .as_str()
                .unwrap_or_default()
                .to_uppercase();
            Ok(CommandOutcome {
                entities: vec![ConfirmedEntity {
                    collection: Collection::Documents,
                    id: "d1".into(),
                    fields: fields(json!({"id": "d1", "title": title})),
                    client_id: None,
                }],
                seqno: None,
            })
        });
        let h = harness(executor);
        seed_document(&h.store, "d1", "draft");

        let first = h.store.mutate("update", update_input("d1", "first")).unwrap();
        let second = h.store.mutate("update", update_input("d1", "second")).unwrap();
        assert_eq!(h.store.get(Collection::Documents, "d1").unwrap().server["title"], "second");

        let report = h.orchestrator.drain_mutations().await;
        assert_eq!(report.committed, vec![first, second]);
        assert_eq!(h.executor.executed_ids(), vec![first, second]);

        let record = h.store.get(Collection::Documents, "d1").unwrap();
        assert_eq!(record.server["title"], "SECOND");
        assert!(!record.is_optimistic());
        assert_eq!(h.store.pending_len(), 0);
    }

    #[tokio::test]
    async fn rejected_mutation_rolls_back_and_halts_the_pass() {
        let executor = MockExecutor::new(|mutation| {
            if mutation.input["fields"]["title"] == "bad" {
                Err(TandemSDKError::rejected(409, "conflict"))
            } else {
                Ok(CommandOutcome::default())
            }
        });
        let mut h = harness(executor);
        seed_document(&h.store, "d1", "original");
        seed_document(&h.store, "d2", "other");

        let bad = h.store.mutate("update", update_input("d1", "bad")).unwrap();
        let good = h.store.mutate("update", update_input("d2", "good")).unwrap();

        let report = h.orchestrator.drain_mutations().await;
        assert_eq!(report.failed, Some(bad));
        assert!(report.committed.is_empty());
        assert_eq!(h.store.pending_len(), 1);
        assert_eq!(h.store.get(Collection::Documents, "d1").unwrap().server["title"], "original");

        let failures: Vec<_> = collected(&mut h.events)
            .into_iter()
            .filter(|e| e.event_type() == "mutation_failed")
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].mutation_id(), Some(bad));

        let report = h.orchestrator.drain_mutations().await;
        assert_eq!(report.committed, vec![good]);
        assert_eq!(h.store.pending_len(), 0);
    }

    #[tokio::test]
    async fn transport_failure_keeps_mutation_queued() {
        let executor = MockExecutor::new(|_| Err(TandemSDKError::NotConnected));
        let h = harness(executor);
        seed_document(&h.store, "d1", "original");
        let id = h.store.mutate("update", update_input("d1", "offline edit")).unwrap();

        let report = h.orchestrator.drain_mutations().await;
        assert_eq!(report.deferred, Some(id));
        assert_eq!(h.store.pending_len(), 1);
        assert_eq!(
            h.store.get(Collection::Documents, "d1").unwrap().server["title"],
            "offline edit"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_drain_is_a_noop() {
        let executor = MockExecutor::accepting();
        executor.set_delay(Duration::from_millis(100));
        let h = harness(executor);
        seed_document(&h.store, "d1", "original");
        h.store.mutate("update", update_input("d1", "x")).unwrap();

        let (a, b) = tokio::join!(
            h.orchestrator.drain_mutations(),
            h.orchestrator.drain_mutations()
        );
        assert_eq!(a.committed.len(), 1);
        assert!(b.skipped);
        assert_eq!(h.executor.executed_ids().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn submissions_during_drain_are_appended() {
        let executor = MockExecutor::accepting();
        executor.set_delay(Duration::from_millis(100));
        let h = harness(executor);
        seed_document(&h.store, "d1", "original");

        let first = h.orchestrator.mutate("update", update_input("d1", "1")).unwrap();
        settle().await;
        let second = h.orchestrator.mutate("update", update_input("d1", "2")).unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.executor.executed_ids(), vec![first, second]);
        assert_eq!(h.store.pending_len(), 0);
    }

    #[tokio::test]
    async fn bootstrap_restores_only_matching_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let kv = Arc::new(KvStore::new(dir.path()).await.unwrap());
        let snapshots = Arc::new(SnapshotStore::new(kv));

        let previous = ReplicaStore::new(SessionIdentity::new("u1", "org1"));
        seed_document(&previous, "d1", "saved");
        previous.advance_offset(21);
        snapshots.save(&previous.persist()).await.unwrap();

        let h = harness(MockExecutor::accepting());
        let orchestrator = Arc::new(
            SyncOrchestrator::new(
                h.store.clone(),
                h.transport.clone(),
                h.executor.clone(),
                Arc::new(EventManager::new(16)),
                SyncConfig {
                    persist_snapshots: true,
                    ..SyncConfig::default()
                },
            )
            .with_snapshot_store(snapshots.clone()),
        );
        assert_eq!(
            orchestrator.bootstrap().await.unwrap(),
            BootstrapOutcome::Restored {
                offset: 21,
                pending: 0
            }
        );
        assert_eq!(h.store.offset(), 21);
        assert_eq!(orchestrator.sequencer_stats().offset, 21);

        let stranger = Arc::new(
            SyncOrchestrator::new(
                Arc::new(ReplicaStore::new(SessionIdentity::new("u2", "org1"))),
                h.transport.clone(),
                h.executor.clone(),
                Arc::new(EventManager::new(16)),
                SyncConfig::default(),
            )
            .with_snapshot_store(snapshots),
        );
        assert_eq!(stranger.bootstrap().await.unwrap(), BootstrapOutcome::Fresh);
        assert_eq!(stranger.store().offset(), 0);
    }
}
