//! 存储层
//!
//! - `entities`：集合、行、补丁、会话身份
//! - `replica`：内存副本（mutate / rebase / commit / persist / restore）
//! - `mutators`：乐观写入逻辑注册表
//! - `selectors`：读侧查询
//! - `ephemeral`：输入 / 在线等临时状态
//! - `kv` / `snapshot`：基于 sled 的快照持久化

pub mod entities;
pub mod ephemeral;
pub mod kv;
pub mod mutators;
pub mod replica;
pub mod selectors;
pub mod snapshot;

pub use entities::{
    Collection, EntityId, EntityRecord, FieldMap, MutationId, PendingMutation, RebaseOptions,
    RowOp, RowPatch, SessionIdentity, TouchedEntity,
};
pub use ephemeral::{EphemeralKind, EphemeralRecord, EphemeralStore};
pub use kv::{KvStats, KvStore};
pub use mutators::{MutatorFn, MutatorRegistry};
pub use replica::{OptimisticTx, ReplicaStore};
pub use snapshot::{ReplicaSnapshot, SnapshotLoad, SnapshotStore};
