//! Mutator 注册表
//!
//! mutator 是一段同步的乐观写入逻辑：读取参数，通过 `OptimisticTx` 修改副本。
//! 同名 mutation 交给 `CommandExecutor` 发往服务端，由服务端给出权威结果。
//!
//! 内置三个通用 mutator：
//! - `create`：`{collection, id?, fields}`
//! - `update`：`{collection, id, fields}`
//! - `delete`：`{collection, id}`

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::entities::{Collection, EntityId, FieldMap};
use super::replica::OptimisticTx;
use crate::error::{Result, TandemSDKError};

pub type MutatorFn = Arc<dyn Fn(&mut OptimisticTx<'_>, &Value) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct MutatorRegistry {
    mutators: HashMap<String, MutatorFn>,
}

impl Default for MutatorRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl MutatorRegistry {
    /// 空注册表（不含内置 mutator）
    pub fn empty() -> Self {
        Self {
            mutators: HashMap::new(),
        }
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("create", create);
        registry.register("update", update);
        registry.register("delete", delete);
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, mutator: F)
    where
        F: Fn(&mut OptimisticTx<'_>, &Value) -> Result<()> + Send + Sync + 'static,
    {
        self.mutators.insert(name.into(), Arc::new(mutator));
    }

    pub fn get(&self, name: &str) -> Option<MutatorFn> {
        self.mutators.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.mutators.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mutators.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Deserialize)]
struct CreateInput {
    collection: Collection,
    #[serde(default)]
    id: Option<EntityId>,
    #[serde(default)]
    fields: FieldMap,
}

#[derive(Debug, Deserialize)]
struct UpdateInput {
    collection: Collection,
    id: EntityId,
    fields: FieldMap,
}

#[derive(Debug, Deserialize)]
struct DeleteInput {
    collection: Collection,
    id: EntityId,
}

fn parse<T: DeserializeOwned>(mutator: &str, input: &Value) -> Result<T> {
    T::deserialize(input)
        .map_err(|e| TandemSDKError::InvalidInput(format!("{} 参数无效: {}", mutator, e)))
}

fn create(tx: &mut OptimisticTx<'_>, input: &Value) -> Result<()> {
    let input: CreateInput = parse("create", input)?;
    tx.insert(input.collection, input.id, input.fields)?;
    Ok(())
}

fn update(tx: &mut OptimisticTx<'_>, input: &Value) -> Result<()> {
    let input: UpdateInput = parse("update", input)?;
    tx.update(input.collection, &input.id, input.fields)
}

fn delete(tx: &mut OptimisticTx<'_>, input: &Value) -> Result<()> {
    let input: DeleteInput = parse("delete", input)?;
    tx.delete(input.collection, &input.id)
}
