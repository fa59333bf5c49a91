//! 副本实体定义
//!
//! 每一行记录都把字段分成两条互不覆盖的轴：
//! - `server`：服务端权威字段，原样保存，客户端从不重新计算
//! - `local`：设备本地字段（草稿、折叠状态等），服务端写入永远不会触碰

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 实体 ID（服务端分配，或乐观创建时客户端生成的临时 UUID）
pub type EntityId = String;

/// 字段表
pub type FieldMap = serde_json::Map<String, Value>;

/// 待确认 mutation 的 ID（客户端生成）
pub type MutationId = Uuid;

/// 顶层集合（全量同步按此顺序逐个拉取）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Users,
    Memberships,
    Channels,
    Documents,
    Comments,
}

impl Collection {
    /// 所有顶层集合；channels 先于 documents/comments，保证引用的父实体已落库
    pub const ALL: [Collection; 5] = [
        Collection::Users,
        Collection::Memberships,
        Collection::Channels,
        Collection::Documents,
        Collection::Comments,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Memberships => "memberships",
            Self::Channels => "channels",
            Self::Documents => "documents",
            Self::Comments => "comments",
        }
    }

    /// 事件类型前缀（`document.updated` 中的 `document`）到集合的映射
    pub fn from_entity_name(name: &str) -> Option<Self> {
        match name {
            "user" => Some(Self::Users),
            "membership" => Some(Self::Memberships),
            "channel" => Some(Self::Channels),
            "document" => Some(Self::Documents),
            "comment" => Some(Self::Comments),
            _ => None,
        }
    }
}

impl FromStr for Collection {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "users" => Ok(Self::Users),
            "memberships" => Ok(Self::Memberships),
            "channels" => Ok(Self::Channels),
            "documents" => Ok(Self::Documents),
            "comments" => Ok(Self::Comments),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话身份：用户 + 组织。所有持久化数据都以此为作用域，不同身份的数据绝不合并。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub user_id: String,
    pub organization_id: String,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id: organization_id.into(),
        }
    }

    /// 身份的稳定存储键：sha256("{user}:{org}") 的 hex
    pub fn storage_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.user_id.as_bytes());
        hasher.update(b":");
        hasher.update(self.organization_id.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.organization_id)
    }
}

/// 副本中的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    /// 服务端权威字段
    #[serde(default)]
    pub server: FieldMap,
    /// 设备本地字段
    #[serde(default)]
    pub local: FieldMap,
    /// 最近一次乐观写入该行、尚未确认的 mutation
    #[serde(default)]
    pub optimistic_by: Option<MutationId>,
    /// 权威写入计数，每次服务端写入 +1
    #[serde(default)]
    pub server_rev: u64,
}

impl EntityRecord {
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            server: FieldMap::new(),
            local: FieldMap::new(),
            optimistic_by: None,
            server_rev: 0,
        }
    }

    /// 读取字段：本地字段优先（本地轴只存服务端没有的字段，正常情况下不会重名）
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.local.get(name).or_else(|| self.server.get(name))
    }

    pub fn is_optimistic(&self) -> bool {
        self.optimistic_by.is_some()
    }
}

/// 单行补丁操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowOp {
    /// 写入：`server` 整体替换服务端轴，`local` 按键合并到本地轴（值为 null 表示删除该键）
    Upsert { server: FieldMap, local: FieldMap },
    /// 删除整行
    Delete,
}

/// 作用于某个集合某一行的补丁
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowPatch {
    pub collection: Collection,
    pub id: EntityId,
    pub op: RowOp,
}

impl RowPatch {
    /// 服务端实体写入
    pub fn server_upsert(collection: Collection, id: impl Into<EntityId>, fields: FieldMap) -> Self {
        Self {
            collection,
            id: id.into(),
            op: RowOp::Upsert {
                server: fields,
                local: FieldMap::new(),
            },
        }
    }

    /// 本地字段写入
    pub fn local_upsert(collection: Collection, id: impl Into<EntityId>, fields: FieldMap) -> Self {
        Self {
            collection,
            id: id.into(),
            op: RowOp::Upsert {
                server: FieldMap::new(),
                local: fields,
            },
        }
    }

    pub fn delete(collection: Collection, id: impl Into<EntityId>) -> Self {
        Self {
            collection,
            id: id.into(),
            op: RowOp::Delete,
        }
    }
}

/// rebase 时允许写入的字段轴
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebaseOptions {
    pub allow_local_fields: bool,
    pub allow_server_fields: bool,
}

impl RebaseOptions {
    /// 服务端事件 / 命令确认：只写服务端轴
    pub const SERVER: RebaseOptions = RebaseOptions {
        allow_local_fields: false,
        allow_server_fields: true,
    };

    /// UI 本地状态：只写本地轴
    pub const LOCAL: RebaseOptions = RebaseOptions {
        allow_local_fields: true,
        allow_server_fields: false,
    };
}

/// 乐观写入前的行快照，用于终态失败时回滚
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchedEntity {
    pub collection: Collection,
    pub id: EntityId,
    /// 写入前的服务端字段；None 表示该行由本次 mutation 乐观创建
    pub before: Option<FieldMap>,
    /// 写入时该行的 server_rev；回滚前若已变化说明服务端已覆盖，不再回滚
    pub server_rev: u64,
    /// 写入前持有该行的乐观 mutation（回滚时若它仍在队列中则还给它）
    #[serde(default)]
    pub optimistic_before: Option<MutationId>,
}

/// 待确认的 mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: MutationId,
    pub name: String,
    pub input: Value,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub touched: Vec<TouchedEntity>,
}

impl PendingMutation {
    /// 本次 mutation 乐观创建的行（服务端确认时以 client_id 回传以替换临时 ID）
    pub fn created_ids(&self) -> impl Iterator<Item = (Collection, &str)> {
        self.touched
            .iter()
            .filter(|t| t.before.is_none())
            .map(|t| (t.collection, t.id.as_str()))
    }
}
