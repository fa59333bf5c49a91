//! 副本快照持久化
//!
//! 快照是一个不透明的 JSON blob，存放在会话身份对应的 sled Tree 中，
//! 并在 blob 内部再嵌一份身份。加载时身份或格式版本不匹配都会丢弃快照，
//! 对调用方而言就像首次启动。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::entities::{Collection, EntityRecord, PendingMutation, SessionIdentity};
use super::kv::KvStore;
use crate::error::Result;
use crate::version::SNAPSHOT_FORMAT_VERSION;

const SNAPSHOT_KEY: &str = "replica_snapshot";

/// 持久化的副本快照（临时记录不入快照）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    pub format_version: u32,
    pub identity: SessionIdentity,
    pub offset: u64,
    pub collections: BTreeMap<Collection, Vec<EntityRecord>>,
    pub pending: Vec<PendingMutation>,
    pub saved_at: DateTime<Utc>,
}

/// 快照加载结果
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotLoad {
    Restored(ReplicaSnapshot),
    Missing,
    /// 快照存在但不可用，已删除
    Discarded { reason: String },
}

pub struct SnapshotStore {
    kv: Arc<KvStore>,
}

impl SnapshotStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    pub async fn save(&self, snapshot: &ReplicaSnapshot) -> Result<()> {
        self.kv.switch_session(&snapshot.identity).await?;
        self.kv.set(SNAPSHOT_KEY, snapshot).await
    }

    pub async fn load(&self, identity: &SessionIdentity) -> Result<SnapshotLoad> {
        self.kv.switch_session(identity).await?;

        let snapshot = match self.kv.get::<_, ReplicaSnapshot>(SNAPSHOT_KEY).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(SnapshotLoad::Missing),
            Err(e) => {
                return self.discard(format!("快照无法解析: {}", e)).await;
            }
        };

        if &snapshot.identity != identity {
            return self
                .discard(format!("快照身份不匹配: {} != {}", snapshot.identity, identity))
                .await;
        }
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return self
                .discard(format!(
                    "快照格式版本不兼容: {} != {}",
                    snapshot.format_version, SNAPSHOT_FORMAT_VERSION
                ))
                .await;
        }

        info!(
            "加载快照: offset={}, pending={}, saved_at={}",
            snapshot.offset,
            snapshot.pending.len(),
            snapshot.saved_at
        );
        Ok(SnapshotLoad::Restored(snapshot))
    }

    pub async fn clear(&self, identity: &SessionIdentity) -> Result<()> {
        self.kv.switch_session(identity).await?;
        self.kv.delete(SNAPSHOT_KEY).await?;
        Ok(())
    }

    async fn discard(&self, reason: String) -> Result<SnapshotLoad> {
        warn!("丢弃快照: {}", reason);
        self.kv.delete(SNAPSHOT_KEY).await?;
        Ok(SnapshotLoad::Discarded { reason })
    }
}
