//! 副本读侧查询
//!
//! 查询都返回克隆出来的行，调用方不会持有存储锁。

use serde_json::Value;

use super::entities::{Collection, EntityRecord};
use super::replica::ReplicaStore;

impl ReplicaStore {
    pub fn get(&self, collection: Collection, id: &str) -> Option<EntityRecord> {
        self.with_rows(collection, |rows| rows.and_then(|r| r.get(id)).cloned())
    }

    /// 按 ID 排序的整集合
    pub fn list(&self, collection: Collection) -> Vec<EntityRecord> {
        self.with_rows(collection, |rows| {
            rows.map(|r| r.values().cloned().collect()).unwrap_or_default()
        })
    }

    pub fn count(&self, collection: Collection) -> usize {
        self.with_rows(collection, |rows| rows.map(|r| r.len()).unwrap_or(0))
    }

    pub fn find<F>(&self, collection: Collection, predicate: F) -> Vec<EntityRecord>
    where
        F: Fn(&EntityRecord) -> bool,
    {
        self.with_rows(collection, |rows| {
            rows.map(|r| r.values().filter(|rec| predicate(*rec)).cloned().collect())
                .unwrap_or_default()
        })
    }

    /// 某字段等于给定值的行
    pub fn where_field(&self, collection: Collection, field: &str, value: &Value) -> Vec<EntityRecord> {
        self.find(collection, |record| record.field(field) == Some(value))
    }

    pub fn documents_in_channel(&self, channel_id: &str) -> Vec<EntityRecord> {
        self.where_field(
            Collection::Documents,
            "channelId",
            &Value::String(channel_id.to_string()),
        )
    }

    pub fn comments_on(&self, document_id: &str) -> Vec<EntityRecord> {
        self.where_field(
            Collection::Comments,
            "documentId",
            &Value::String(document_id.to_string()),
        )
    }

    pub fn members_of(&self, channel_id: &str) -> Vec<EntityRecord> {
        self.where_field(
            Collection::Memberships,
            "channelId",
            &Value::String(channel_id.to_string()),
        )
    }

    /// 某用户加入的频道（经 memberships 关联）
    pub fn channels_for_user(&self, user_id: &str) -> Vec<EntityRecord> {
        let channel_ids: Vec<String> = self
            .where_field(
                Collection::Memberships,
                "userId",
                &Value::String(user_id.to_string()),
            )
            .into_iter()
            .filter_map(|m| m.field("channelId").and_then(Value::as_str).map(str::to_string))
            .collect();

        channel_ids
            .iter()
            .filter_map(|id| self.get(Collection::Channels, id))
            .collect()
    }

    /// 仍在等待服务端确认的行
    pub fn optimistic_rows(&self, collection: Collection) -> Vec<EntityRecord> {
        self.find(collection, EntityRecord::is_optimistic)
    }
}
