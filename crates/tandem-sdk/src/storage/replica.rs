//! 副本存储
//!
//! 进程内唯一的共享可变状态。所有入口都是同步方法，内部只持有很短的
//! `parking_lot::RwLock` 临界区，绝不跨 `.await` 持锁。
//!
//! - `mutate`：按名字执行 mutator，乐观写入并把 mutation 追加到待确认队列
//! - `rebase`：按字段轴写入补丁（服务端轴 / 本地轴互不覆盖）
//! - `commit`：mutation 往返结束后出队
//! - `persist` / `restore`：快照导出与恢复

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::entities::{
    Collection, EntityId, EntityRecord, FieldMap, MutationId, PendingMutation, RebaseOptions,
    RowOp, RowPatch, SessionIdentity, TouchedEntity,
};
use super::ephemeral::EphemeralStore;
use super::mutators::MutatorRegistry;
use super::snapshot::ReplicaSnapshot;
use crate::error::{Result, TandemSDKError};
use crate::protocol::ConfirmedEntity;
use crate::version::SNAPSHOT_FORMAT_VERSION;

type Rows = BTreeMap<EntityId, EntityRecord>;

#[derive(Debug, Default)]
pub(crate) struct ReplicaState {
    offset: u64,
    collections: BTreeMap<Collection, Rows>,
    pending: VecDeque<PendingMutation>,
}

impl ReplicaState {
    fn rows(&self, collection: Collection) -> Option<&Rows> {
        self.collections.get(&collection)
    }

    fn rows_mut(&mut self, collection: Collection) -> &mut Rows {
        self.collections.entry(collection).or_default()
    }

    fn is_pending(&self, id: &MutationId) -> bool {
        self.pending.iter().any(|m| &m.id == id)
    }

    /// 返回是否有写入发生
    fn rebase(&mut self, patch: RowPatch, options: RebaseOptions) -> bool {
        let RowPatch { collection, id, op } = patch;
        match op {
            RowOp::Delete => {
                if !options.allow_server_fields {
                    return false;
                }
                self.rows_mut(collection).remove(&id).is_some()
            }
            RowOp::Upsert { server, local } => {
                let write_server = options.allow_server_fields && !server.is_empty();
                let write_local = options.allow_local_fields && !local.is_empty();
                if !write_server && !write_local {
                    return false;
                }

                let record = self
                    .rows_mut(collection)
                    .entry(id.clone())
                    .or_insert_with(|| EntityRecord::new(id));

                if write_server {
                    record.server = server;
                    record.server_rev += 1;
                    record.optimistic_by = None;
                }
                if write_local {
                    merge_fields(&mut record.local, local);
                }
                true
            }
        }
    }

    fn replace_collection(&mut self, collection: Collection, rows: Vec<Value>) -> usize {
        let pending: HashSet<MutationId> = self.pending.iter().map(|m| m.id).collect();
        let previous = std::mem::take(self.rows_mut(collection));
        let mut next = Rows::new();

        for row in rows {
            let Value::Object(fields) = row else {
                warn!("全量数据行不是对象，跳过: {}", collection);
                continue;
            };
            let Some(id) = fields.get("id").and_then(Value::as_str).map(str::to_string) else {
                warn!("全量数据行缺少字符串 id，跳过: {}", collection);
                continue;
            };

            let mut record = EntityRecord::new(id.clone());
            if let Some(prev) = previous.get(&id) {
                record.local = prev.local.clone();
                record.server_rev = prev.server_rev + 1;
            } else {
                record.server_rev = 1;
            }
            record.server = fields;
            next.insert(id, record);
        }

        let fetched = next.len();
        for (id, prev) in previous {
            let held = prev
                .optimistic_by
                .map(|m| pending.contains(&m))
                .unwrap_or(false);
            if held && !next.contains_key(&id) {
                debug!("保留待确认的乐观行: {} {}", collection, id);
                next.insert(id, prev);
            }
        }

        self.collections.insert(collection, next);
        fetched
    }
}

/// 本地轴按键合并，null 表示删除该键
fn merge_fields(target: &mut FieldMap, patch: FieldMap) {
    for (key, value) in patch {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}

/// mutator 看到的乐观写入事务
///
/// 每个实体第一次被写入时记录写入前的镜像，用于 mutator 自身报错时撤销，
/// 以及服务端终态拒绝时回滚。
pub struct OptimisticTx<'a> {
    state: &'a mut ReplicaState,
    mutation_id: MutationId,
    touched: Vec<TouchedEntity>,
    undo: Vec<(Collection, EntityId, Option<EntityRecord>)>,
}

impl<'a> OptimisticTx<'a> {
    fn new(state: &'a mut ReplicaState, mutation_id: MutationId) -> Self {
        Self {
            state,
            mutation_id,
            touched: Vec::new(),
            undo: Vec::new(),
        }
    }

    pub fn mutation_id(&self) -> MutationId {
        self.mutation_id
    }

    pub fn get(&self, collection: Collection, id: &str) -> Option<&EntityRecord> {
        self.state.rows(collection).and_then(|rows| rows.get(id))
    }

    /// 乐观创建一行；未给出 id 时生成临时 UUID
    pub fn insert(
        &mut self,
        collection: Collection,
        id: Option<EntityId>,
        mut fields: FieldMap,
    ) -> Result<EntityId> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.get(collection, &id).is_some() {
            return Err(TandemSDKError::InvalidInput(format!(
                "实体已存在: {} {}",
                collection, id
            )));
        }
        self.remember(collection, &id);

        fields.insert("id".to_string(), Value::String(id.clone()));
        let mut record = EntityRecord::new(id.clone());
        record.server = fields;
        record.optimistic_by = Some(self.mutation_id);
        self.state.rows_mut(collection).insert(id.clone(), record);
        Ok(id)
    }

    /// 乐观更新：字段合并进服务端轴
    pub fn update(&mut self, collection: Collection, id: &str, fields: FieldMap) -> Result<()> {
        if self.get(collection, id).is_none() {
            return Err(TandemSDKError::NotFound(format!("{} {}", collection, id)));
        }
        self.remember(collection, id);

        let mutation_id = self.mutation_id;
        if let Some(record) = self.state.rows_mut(collection).get_mut(id) {
            for (key, value) in fields {
                if key != "id" {
                    record.server.insert(key, value);
                }
            }
            record.optimistic_by = Some(mutation_id);
        }
        Ok(())
    }

    /// 乐观删除
    pub fn delete(&mut self, collection: Collection, id: &str) -> Result<()> {
        if self.get(collection, id).is_none() {
            return Err(TandemSDKError::NotFound(format!("{} {}", collection, id)));
        }
        self.remember(collection, id);
        self.state.rows_mut(collection).remove(id);
        Ok(())
    }

    fn remember(&mut self, collection: Collection, id: &str) {
        if self
            .touched
            .iter()
            .any(|t| t.collection == collection && t.id == id)
        {
            return;
        }
        let previous = self.get(collection, id).cloned();
        self.touched.push(TouchedEntity {
            collection,
            id: id.to_string(),
            before: previous.as_ref().map(|r| r.server.clone()),
            server_rev: previous.as_ref().map(|r| r.server_rev).unwrap_or(0),
            optimistic_before: previous.as_ref().and_then(|r| r.optimistic_by),
        });
        self.undo.push((collection, id.to_string(), previous));
    }

    fn finish(self) -> Vec<TouchedEntity> {
        self.touched
    }

    fn abort(self) {
        for (collection, id, previous) in self.undo.into_iter().rev() {
            let rows = self.state.rows_mut(collection);
            match previous {
                Some(record) => {
                    rows.insert(id, record);
                }
                None => {
                    rows.remove(&id);
                }
            }
        }
    }
}

/// 副本存储
pub struct ReplicaStore {
    identity: SessionIdentity,
    state: RwLock<ReplicaState>,
    mutators: RwLock<MutatorRegistry>,
    ephemeral: EphemeralStore,
}

impl ReplicaStore {
    pub fn new(identity: SessionIdentity) -> Self {
        Self::with_mutators(identity, MutatorRegistry::default())
    }

    pub fn with_mutators(identity: SessionIdentity, mutators: MutatorRegistry) -> Self {
        Self {
            identity,
            state: RwLock::new(ReplicaState::default()),
            mutators: RwLock::new(mutators),
            ephemeral: EphemeralStore::new(),
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn ephemeral(&self) -> &EphemeralStore {
        &self.ephemeral
    }

    /// 注册自定义 mutator（同名覆盖）
    pub fn register_mutator<F>(&self, name: impl Into<String>, mutator: F)
    where
        F: Fn(&mut OptimisticTx<'_>, &Value) -> Result<()> + Send + Sync + 'static,
    {
        self.mutators.write().register(name, mutator);
    }

    // ========== offset ==========

    pub fn offset(&self) -> u64 {
        self.state.read().offset
    }

    /// 只前进不后退，返回推进后的值
    pub fn advance_offset(&self, offset: u64) -> u64 {
        let mut state = self.state.write();
        if offset > state.offset {
            state.offset = offset;
        }
        state.offset
    }

    /// 显式重置到服务端报告的 head（全量重建时使用）
    pub fn reset_offset(&self, offset: u64) {
        let mut state = self.state.write();
        info!("副本 offset 重置: {} -> {}", state.offset, offset);
        state.offset = offset;
    }

    // ========== mutate / rebase / commit ==========

    /// 乐观执行一条 mutation，返回客户端生成的 mutation ID
    pub fn mutate(&self, name: &str, input: Value) -> Result<MutationId> {
        let mutator = self
            .mutators
            .read()
            .get(name)
            .ok_or_else(|| TandemSDKError::UnknownMutator(name.to_string()))?;

        let mutation_id = Uuid::new_v4();
        let mut state = self.state.write();
        let mut tx = OptimisticTx::new(&mut state, mutation_id);

        if let Err(e) = mutator(&mut tx, &input) {
            tx.abort();
            return Err(e);
        }
        let touched = tx.finish();

        debug!(
            "乐观写入: mutation={} name={} touched={}",
            mutation_id,
            name,
            touched.len()
        );
        state.pending.push_back(PendingMutation {
            id: mutation_id,
            name: name.to_string(),
            input,
            enqueued_at: Utc::now(),
            touched,
        });
        Ok(mutation_id)
    }

    /// 按字段轴写入一个补丁
    pub fn rebase(&self, patch: RowPatch, options: RebaseOptions) -> bool {
        self.state.write().rebase(patch, options)
    }

    /// 一次性写入一批服务端补丁，返回被改动的集合
    pub fn apply_server_patches(&self, patches: Vec<RowPatch>) -> BTreeSet<Collection> {
        let mut touched = BTreeSet::new();
        let mut state = self.state.write();
        for patch in patches {
            let collection = patch.collection;
            if state.rebase(patch, RebaseOptions::SERVER) {
                touched.insert(collection);
            }
        }
        touched
    }

    /// 用命令确认的实体覆盖乐观结果；带 client_id 的行先迁移本地字段再替换临时 ID
    pub fn rebase_confirmed(&self, entities: Vec<ConfirmedEntity>) -> BTreeSet<Collection> {
        let mut touched = BTreeSet::new();
        let mut state = self.state.write();
        for entity in entities {
            let ConfirmedEntity {
                collection,
                id,
                mut fields,
                client_id,
            } = entity;

            let mut carried_local = FieldMap::new();
            if let Some(client_id) = client_id {
                if client_id != id {
                    if let Some(temp) = state.rows_mut(collection).remove(&client_id) {
                        debug!("临时 ID 替换: {} {} -> {}", collection, client_id, id);
                        carried_local = temp.local;
                    }
                }
            }

            fields
                .entry("id".to_string())
                .or_insert_with(|| Value::String(id.clone()));
            let patch = RowPatch {
                collection,
                id,
                op: RowOp::Upsert {
                    server: fields,
                    local: carried_local,
                },
            };
            let options = RebaseOptions {
                allow_local_fields: true,
                allow_server_fields: true,
            };
            if state.rebase(patch, options) {
                touched.insert(collection);
            }
        }
        touched
    }

    /// 写入设备本地字段
    pub fn set_local_fields(&self, collection: Collection, id: &str, fields: FieldMap) -> bool {
        self.rebase(RowPatch::local_upsert(collection, id, fields), RebaseOptions::LOCAL)
    }

    /// mutation 往返成功，出队
    pub fn commit(&self, mutation_id: MutationId) -> Option<PendingMutation> {
        let mut state = self.state.write();
        let index = state.pending.iter().position(|m| m.id == mutation_id)?;
        let mutation = state.pending.remove(index)?;

        for touched in &mutation.touched {
            if let Some(record) = state.rows_mut(touched.collection).get_mut(&touched.id) {
                if record.optimistic_by == Some(mutation_id) {
                    record.optimistic_by = None;
                }
            }
        }
        debug!("mutation 已提交: {} {}", mutation.name, mutation_id);
        Some(mutation)
    }

    /// mutation 终态失败：回滚仍由它持有、且服务端未覆盖过的乐观写入，然后出队。
    /// 返回被回滚的行。
    pub fn commit_failed(&self, mutation_id: MutationId) -> Vec<(Collection, EntityId)> {
        let mut state = self.state.write();
        let Some(index) = state.pending.iter().position(|m| m.id == mutation_id) else {
            return Vec::new();
        };
        let Some(mutation) = state.pending.remove(index) else {
            return Vec::new();
        };

        let mut rolled_back = Vec::new();
        for touched in mutation.touched.iter().rev() {
            let restored_owner = touched
                .optimistic_before
                .filter(|owner| state.is_pending(owner));
            let rows = state.rows_mut(touched.collection);

            let exists = match rows.get(&touched.id) {
                Some(record) => {
                    if record.server_rev != touched.server_rev
                        || record.optimistic_by != Some(mutation_id)
                    {
                        continue;
                    }
                    true
                }
                None => false,
            };

            match (&touched.before, exists) {
                (Some(server), true) => {
                    if let Some(record) = rows.get_mut(&touched.id) {
                        record.server = server.clone();
                        record.optimistic_by = restored_owner;
                    }
                }
                (None, true) => {
                    rows.remove(&touched.id);
                }
                // 乐观删除的行
                (Some(server), false) => {
                    let mut record = EntityRecord::new(touched.id.clone());
                    record.server = server.clone();
                    record.server_rev = touched.server_rev;
                    record.optimistic_by = restored_owner;
                    rows.insert(touched.id.clone(), record);
                }
                (None, false) => continue,
            }
            rolled_back.push((touched.collection, touched.id.clone()));
        }

        warn!(
            "mutation 失败出队: {} {}, 回滚 {} 行",
            mutation.name,
            mutation_id,
            rolled_back.len()
        );
        rolled_back
    }

    /// 队首（最早）的待确认 mutation
    pub fn peek_pending(&self) -> Option<PendingMutation> {
        self.state.read().pending.front().cloned()
    }

    pub fn pending(&self) -> Vec<PendingMutation> {
        self.state.read().pending.iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.state.read().pending.len()
    }

    // ========== 全量替换 ==========

    /// 整集合替换：保留仍存在行的本地字段，以及待确认乐观创建的行
    pub fn replace_collection(&self, collection: Collection, rows: Vec<Value>) -> usize {
        self.state.write().replace_collection(collection, rows)
    }

    /// 一次性替换多个集合
    pub fn replace_collections(&self, fetched: Vec<(Collection, Vec<Value>)>) -> usize {
        let mut state = self.state.write();
        fetched
            .into_iter()
            .map(|(collection, rows)| state.replace_collection(collection, rows))
            .sum()
    }

    // ========== persist / restore ==========

    pub fn persist(&self) -> ReplicaSnapshot {
        let state = self.state.read();
        ReplicaSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            identity: self.identity.clone(),
            offset: state.offset,
            collections: state
                .collections
                .iter()
                .map(|(collection, rows)| (*collection, rows.values().cloned().collect()))
                .collect(),
            pending: state.pending.iter().cloned().collect(),
            saved_at: Utc::now(),
        }
    }

    pub fn restore(&self, snapshot: ReplicaSnapshot) -> Result<()> {
        if snapshot.identity != self.identity {
            return Err(TandemSDKError::InvalidData(format!(
                "快照身份不匹配: {} != {}",
                snapshot.identity, self.identity
            )));
        }
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(TandemSDKError::InvalidData(format!(
                "快照格式版本不兼容: {} != {}",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        let mut state = self.state.write();
        state.offset = snapshot.offset;
        state.collections = snapshot
            .collections
            .into_iter()
            .map(|(collection, rows)| {
                let rows = rows
                    .into_iter()
                    .map(|record| (record.id.clone(), record))
                    .collect();
                (collection, rows)
            })
            .collect();
        state.pending = snapshot.pending.into_iter().collect();
        info!(
            "副本已从快照恢复: offset={}, pending={}",
            state.offset,
            state.pending.len()
        );
        Ok(())
    }

    /// 清空整个副本（会话被重置时使用）
    pub fn clear(&self) {
        *self.state.write() = ReplicaState::default();
        self.ephemeral.clear();
    }

    /// 读侧查询入口
    pub(crate) fn with_rows<R>(&self, collection: Collection, f: impl FnOnce(Option<&Rows>) -> R) -> R {
        let state = self.state.read();
        f(state.rows(collection))
    }
}
