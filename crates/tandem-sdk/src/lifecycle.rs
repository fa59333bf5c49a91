//! 前后台切换
//!
//! 回到前台时立刻 catch-up 并排空 mutation 队列；进入后台前写一次快照。

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::sync::{SyncOrchestrator, SyncPhase};

#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn on_background(&self) -> Result<()>;

    async fn on_foreground(&self) -> Result<()>;
}

#[derive(Default)]
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        debug!("生命周期 Hook 已注册: 当前共 {} 个", self.hooks.len());
    }

    /// 按注册顺序通知；某个 Hook 失败不影响后续 Hook，返回第一个错误
    pub async fn notify_background(&self) -> Result<()> {
        info!("App 切换到后台");
        let mut first_error = None;
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_background().await {
                warn!("Hook #{} 后台切换失败: {}", index, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn notify_foreground(&self) -> Result<()> {
        info!("App 切换到前台");
        let mut first_error = None;
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_foreground().await {
                warn!("Hook #{} 前台切换失败: {}", index, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// 同步编排器的前后台 Hook（弱引用，不延长编排器寿命）
pub struct SyncLifecycleHook {
    orchestrator: Weak<SyncOrchestrator>,
}

impl SyncLifecycleHook {
    pub fn new(orchestrator: &Arc<SyncOrchestrator>) -> Self {
        Self {
            orchestrator: Arc::downgrade(orchestrator),
        }
    }
}

#[async_trait]
impl LifecycleHook for SyncLifecycleHook {
    async fn on_background(&self) -> Result<()> {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator.persist().await;
        }
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return Ok(());
        };
        if orchestrator.is_destroyed() || orchestrator.phase() == SyncPhase::Idle {
            return Ok(());
        }
        orchestrator.catch_up().await?;
        orchestrator.drain_mutations().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TandemSDKError;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl LifecycleHook for Recorder {
        async fn on_background(&self) -> Result<()> {
            self.log.lock().push(format!("{}:bg", self.name));
            if self.fail {
                return Err(TandemSDKError::Config(self.name.to_string()));
            }
            Ok(())
        }

        async fn on_foreground(&self) -> Result<()> {
            self.log.lock().push(format!("{}:fg", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_hook_does_not_stop_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = LifecycleManager::new();
        for (name, fail) in [("a", true), ("b", false)] {
            manager.register_hook(Arc::new(Recorder {
                name,
                log: log.clone(),
                fail,
            }));
        }
        assert_eq!(manager.hook_count(), 2);

        let result = manager.notify_background().await;
        assert_eq!(result, Err(TandemSDKError::Config("a".into())));
        manager.notify_foreground().await.unwrap();
        assert_eq!(*log.lock(), vec!["a:bg", "b:bg", "a:fg", "b:fg"]);
    }

    #[tokio::test]
    async fn dropped_orchestrator_is_ignored() {
        use crate::events::EventManager;
        use crate::storage::entities::SessionIdentity;
        use crate::storage::replica::ReplicaStore;
        use crate::sync::SyncConfig;
        use crate::test_support::{MockExecutor, ScriptedTransport};

        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::new(ReplicaStore::new(SessionIdentity::new("u1", "org1"))),
            ScriptedTransport::new(),
            MockExecutor::accepting(),
            Arc::new(EventManager::new(8)),
            SyncConfig::default(),
        ));
        let hook = SyncLifecycleHook::new(&orchestrator);

        // 未启动时前台切换什么也不做
        hook.on_foreground().await.unwrap();
        drop(orchestrator);
        hook.on_foreground().await.unwrap();
        hook.on_background().await.unwrap();
    }
}
