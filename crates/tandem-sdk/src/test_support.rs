//! 单元测试共用的脚本化传输层与命令执行器

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Result, TandemSDKError};
use crate::protocol::{CommandOutcome, DiffResponse, ServerEvent, TransportSignal};
use crate::storage::entities::{Collection, MutationId, PendingMutation};
use crate::transport::{CommandExecutor, EventTransport};

pub fn event(seqno: u64, event_type: &str, payload: Value) -> ServerEvent {
    ServerEvent {
        id: format!("evt-{}", seqno),
        origin_user_id: None,
        seqno,
        event_type: event_type.to_string(),
        payload,
        created_at: Utc::now(),
    }
}

/// 让出足够多次，使已就绪的后台任务跑到下一个等待点
pub async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    sender: Mutex<Option<mpsc::UnboundedSender<TransportSignal>>>,
    subscribe_calls: AtomicUsize,
    diff_calls: Mutex<Vec<u64>>,
    fetch_calls: Mutex<Vec<Collection>>,
    head_calls: AtomicUsize,
    diff_responses: Mutex<VecDeque<Result<DiffResponse>>>,
    head: AtomicU64,
    collections: Mutex<HashMap<Collection, Vec<Value>>>,
    diff_delay: Mutex<Option<Duration>>,
    fail_fetch: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn set_rows(&self, collection: Collection, rows: Vec<Value>) {
        self.collections.lock().insert(collection, rows);
    }

    pub fn push_diff(&self, response: Result<DiffResponse>) {
        self.diff_responses.lock().push_back(response);
    }

    pub fn set_diff_delay(&self, delay: Duration) {
        *self.diff_delay.lock() = Some(delay);
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn diff_calls(&self) -> Vec<u64> {
        self.diff_calls.lock().clone()
    }

    pub fn fetch_calls(&self) -> Vec<Collection> {
        self.fetch_calls.lock().clone()
    }

    pub fn head_calls(&self) -> usize {
        self.head_calls.load(Ordering::SeqCst)
    }

    pub fn send(&self, signal: TransportSignal) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(signal);
        }
    }

    pub fn ready(&self) {
        self.send(TransportSignal::Ready);
    }

    pub fn emit(&self, seqno: u64, event_type: &str, payload: Value) {
        self.send(TransportSignal::Event(event(seqno, event_type, payload)));
    }

    pub fn disconnect(&self, reason: &str) {
        self.send(TransportSignal::Disconnected {
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl EventTransport for ScriptedTransport {
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<TransportSignal>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock() = Some(tx);
        Ok(rx)
    }

    async fn diff(&self, offset: u64) -> Result<DiffResponse> {
        self.diff_calls.lock().push(offset);
        let delay = *self.diff_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.diff_responses.lock().pop_front();
        scripted.unwrap_or(Ok(DiffResponse {
            events: Vec::new(),
            head_offset: offset,
            reset_required: false,
        }))
    }

    async fn head_offset(&self) -> Result<u64> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn fetch_collection(&self, collection: Collection) -> Result<Vec<Value>> {
        self.fetch_calls.lock().push(collection);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(TandemSDKError::Transport(format!("fetch {} failed", collection)));
        }
        Ok(self
            .collections
            .lock()
            .get(&collection)
            .cloned()
            .unwrap_or_default())
    }
}

type Handler = Box<dyn Fn(&PendingMutation) -> Result<CommandOutcome> + Send + Sync>;

pub struct MockExecutor {
    handler: Handler,
    executed: Mutex<Vec<(MutationId, String)>>,
    delay: Mutex<Option<Duration>>,
}

impl MockExecutor {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&PendingMutation) -> Result<CommandOutcome> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            executed: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        })
    }

    /// 所有 mutation 都被接受，服务端不回传实体
    pub fn accepting() -> Arc<Self> {
        Self::new(|_| Ok(CommandOutcome::default()))
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn executed_ids(&self) -> Vec<MutationId> {
        self.executed.lock().iter().map(|(id, _)| *id).collect()
    }

    pub fn executed_names(&self) -> Vec<String> {
        self.executed.lock().iter().map(|(_, name)| name.clone()).collect()
    }
}

#[async_trait]
impl CommandExecutor for MockExecutor {
    async fn execute(&self, mutation: &PendingMutation) -> Result<CommandOutcome> {
        self.executed
            .lock()
            .push((mutation.id, mutation.name.clone()));
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(mutation)
    }
}
