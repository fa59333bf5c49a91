//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 每个会话身份（用户 + 组织）一棵独立的 Tree，Tree 名为身份的 SHA-256。
//! 值统一以 JSON 编码。

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::entities::SessionIdentity;
use crate::error::{Result, TandemSDKError};

/// KV 统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvStats {
    pub session_trees: usize,
    pub current_keys: usize,
    pub size_on_disk: u64,
}

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    base_path: PathBuf,
    db: Arc<Db>,
    /// 已打开的会话 Tree，键为身份存储键
    session_trees: Arc<RwLock<HashMap<String, Tree>>>,
    /// 当前会话存储键
    current_session: Arc<RwLock<Option<String>>>,
}

fn tree_name(storage_key: &str) -> String {
    format!("session_{}", storage_key)
}

impl KvStore {
    /// 在 `{base_path}/kv` 打开数据库
    pub async fn new(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| TandemSDKError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 切换会话后旧实例可能刚释放文件锁，带退避重试
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(db) => {
                    db_opt = Some(db);
                    break;
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            TandemSDKError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        Ok(Self {
            base_path,
            db: Arc::new(db),
            session_trees: Arc::new(RwLock::new(HashMap::new())),
            current_session: Arc::new(RwLock::new(None)),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    async fn open_session_tree(&self, storage_key: &str) -> Result<Tree> {
        if let Some(tree) = self.session_trees.read().await.get(storage_key) {
            return Ok(tree.clone());
        }

        let tree = self
            .db
            .open_tree(tree_name(storage_key))
            .map_err(|e| TandemSDKError::KvStore(format!("打开会话 Tree 失败: {}", e)))?;
        self.session_trees
            .write()
            .await
            .insert(storage_key.to_string(), tree.clone());
        Ok(tree)
    }

    /// 切换当前会话（Tree 不存在则创建）
    pub async fn switch_session(&self, identity: &SessionIdentity) -> Result<()> {
        let storage_key = identity.storage_key();
        self.open_session_tree(&storage_key).await?;
        *self.current_session.write().await = Some(storage_key);
        info!("KV 会话已切换: {}", identity);
        Ok(())
    }

    /// 删除某个会话的全部数据
    pub async fn cleanup_session(&self, identity: &SessionIdentity) -> Result<()> {
        let storage_key = identity.storage_key();
        self.session_trees.write().await.remove(&storage_key);
        self.db
            .drop_tree(tree_name(&storage_key))
            .map_err(|e| TandemSDKError::KvStore(format!("删除会话 Tree 失败: {}", e)))?;

        let mut current = self.current_session.write().await;
        if current.as_deref() == Some(storage_key.as_str()) {
            *current = None;
        }
        info!("KV 会话数据已清理: {}", identity);
        Ok(())
    }

    async fn current_tree(&self) -> Result<Tree> {
        let current = self.current_session.read().await;
        let storage_key = current
            .as_ref()
            .ok_or_else(|| TandemSDKError::KvStore("尚未选择会话".to_string()))?;

        let trees = self.session_trees.read().await;
        trees
            .get(storage_key)
            .cloned()
            .ok_or_else(|| TandemSDKError::KvStore("会话 Tree 不存在".to_string()))
    }

    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let tree = self.current_tree().await?;
        let bytes = serde_json::to_vec(value)
            .map_err(|e| TandemSDKError::Serialization(format!("序列化值失败: {}", e)))?;
        tree.insert(key, bytes)
            .map_err(|e| TandemSDKError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let tree = self.current_tree().await?;
        let result = tree
            .get(key)
            .map_err(|e| TandemSDKError::KvStore(format!("获取键值对失败: {}", e)))?;

        match result {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| {
                    TandemSDKError::Serialization(format!("反序列化值失败: {}", e))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn delete<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.current_tree().await?;
        let removed = tree
            .remove(key)
            .map_err(|e| TandemSDKError::KvStore(format!("删除键值对失败: {}", e)))?;
        Ok(removed.is_some())
    }

    pub async fn exists<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.current_tree().await?;
        tree.contains_key(key)
            .map_err(|e| TandemSDKError::KvStore(format!("检查键存在失败: {}", e)))
    }

    /// 刷盘
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| TandemSDKError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<KvStats> {
        let current_keys = match self.current_tree().await {
            Ok(tree) => tree.len(),
            Err(_) => 0,
        };
        Ok(KvStats {
            session_trees: self.session_trees.read().await.len(),
            current_keys,
            size_on_disk: self.db.size_on_disk()?,
        })
    }
}
