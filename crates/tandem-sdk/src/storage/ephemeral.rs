//! 临时状态存储（输入状态 / 在线状态）
//!
//! 这类记录只存在于内存，带显式过期时间，从不持久化，也不参与 offset 推进。
//! 读取方按当前时间过滤，`prune` 只负责回收内存。

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// 临时记录类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EphemeralKind {
    Typing,
    Presence,
}

/// 临时记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EphemeralRecord {
    pub kind: EphemeralKind,
    /// 同类记录内的唯一键：输入状态为 `{user}:{scope}`，在线状态为 user_id
    pub key: String,
    pub user_id: String,
    /// 作用域（输入状态所在的 channel / document）
    pub scope_id: Option<String>,
    pub data: Value,
    pub expires_at: DateTime<Utc>,
}

impl EphemeralRecord {
    pub fn typing(
        user_id: impl Into<String>,
        scope_id: impl Into<String>,
        data: Value,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let user_id = user_id.into();
        let scope_id = scope_id.into();
        Self {
            kind: EphemeralKind::Typing,
            key: format!("{}:{}", user_id, scope_id),
            user_id,
            scope_id: Some(scope_id),
            data,
            expires_at,
        }
    }

    pub fn presence(user_id: impl Into<String>, data: Value, expires_at: DateTime<Utc>) -> Self {
        let user_id = user_id.into();
        Self {
            kind: EphemeralKind::Presence,
            key: user_id.clone(),
            user_id,
            scope_id: None,
            data,
            expires_at,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// 临时记录存储
#[derive(Default)]
pub struct EphemeralStore {
    records: RwLock<HashMap<(EphemeralKind, String), EphemeralRecord>>,
}

impl EphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入（同键覆盖）
    pub fn upsert(&self, record: EphemeralRecord) {
        debug!(
            "临时记录更新: {:?} {} expires_at={}",
            record.kind, record.key, record.expires_at
        );
        self.records
            .write()
            .insert((record.kind, record.key.clone()), record);
    }

    pub fn extend(&self, records: impl IntoIterator<Item = EphemeralRecord>) {
        let mut guard = self.records.write();
        for record in records {
            guard.insert((record.kind, record.key.clone()), record);
        }
    }

    /// 当前仍有效的记录
    pub fn active(&self, kind: EphemeralKind, now: DateTime<Utc>) -> Vec<EphemeralRecord> {
        let mut out: Vec<EphemeralRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.kind == kind && r.is_active(now))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// 某个作用域内正在输入的用户
    pub fn typing_in(&self, scope_id: &str, now: DateTime<Utc>) -> Vec<String> {
        let mut users: Vec<String> = self
            .records
            .read()
            .values()
            .filter(|r| {
                r.kind == EphemeralKind::Typing
                    && r.scope_id.as_deref() == Some(scope_id)
                    && r.is_active(now)
            })
            .map(|r| r.user_id.clone())
            .collect();
        users.sort();
        users
    }

    /// 某个用户的在线状态
    pub fn presence_of(&self, user_id: &str, now: DateTime<Utc>) -> Option<EphemeralRecord> {
        self.records
            .read()
            .get(&(EphemeralKind::Presence, user_id.to_string()))
            .filter(|r| r.is_active(now))
            .cloned()
    }

    /// 回收已过期记录，返回回收数量
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.records.write();
        let before = guard.len();
        guard.retain(|_, r| r.is_active(now));
        before - guard.len()
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
