//! 事件 → 补丁映射
//!
//! 纯函数：一条 `ServerEvent` 映射为一个单行补丁、一个集合重拉标记、
//! 一条临时记录，或者什么都不做。这里不做 I/O，也不关心顺序。

use chrono::Duration;
use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::ServerEvent;
use crate::storage::entities::{Collection, FieldMap, RowPatch};
use crate::storage::ephemeral::EphemeralRecord;

/// 输入状态默认有效期
pub const TYPING_TTL_MS: i64 = 5_000;
/// 在线状态默认有效期
pub const PRESENCE_TTL_MS: i64 = 60_000;

/// 映射结果
#[derive(Debug, Clone, PartialEq)]
pub enum MappedEvent {
    /// 携带完整实体的事件，直接写入副本
    Patch(RowPatch),
    /// 只携带 ID 的事件，整集合重拉
    Resync(Collection),
    /// 输入 / 在线状态
    Ephemeral(EphemeralRecord),
    /// 某个用户被移出组织，由编排器决定如何处理
    MembershipRevoked { user_id: String },
    /// 未知或格式错误的事件
    Ignored,
}

pub fn map_event(event: &ServerEvent) -> MappedEvent {
    let Some((entity, action)) = event.event_type.split_once('.') else {
        debug!("忽略未知事件类型: {}", event.event_type);
        return MappedEvent::Ignored;
    };

    match (entity, action) {
        ("channel", "members_changed") => MappedEvent::Resync(Collection::Memberships),
        ("organization", "roster_changed") => MappedEvent::Resync(Collection::Users),
        ("organization", "member_removed") => match string_field(&event.payload, "userId") {
            Some(user_id) => MappedEvent::MembershipRevoked { user_id },
            None => malformed(event, "缺少 userId"),
        },
        ("typing", "started") | ("typing", "stopped") => map_typing(event, action == "stopped"),
        ("presence", "updated") => map_presence(event),
        (entity, "created" | "updated" | "deleted") => match Collection::from_entity_name(entity) {
            Some(collection) => map_row(event, collection, action),
            None => {
                debug!("忽略未知实体事件: {}", event.event_type);
                MappedEvent::Ignored
            }
        },
        _ => {
            debug!("忽略未知事件类型: {}", event.event_type);
            MappedEvent::Ignored
        }
    }
}

fn map_row(event: &ServerEvent, collection: Collection, action: &str) -> MappedEvent {
    let Some(fields) = event.payload.as_object() else {
        return malformed(event, "payload 不是对象");
    };
    let Some(id) = fields.get("id").and_then(Value::as_str) else {
        return malformed(event, "缺少字符串 id");
    };

    if action == "deleted" {
        return MappedEvent::Patch(RowPatch::delete(collection, id));
    }

    if fields.len() == 1 {
        debug!("仅含 ID 的事件，标记集合重拉: {} {}", event.event_type, id);
        return MappedEvent::Resync(collection);
    }

    MappedEvent::Patch(RowPatch::server_upsert(
        collection,
        id,
        FieldMap::clone(fields),
    ))
}

fn map_typing(event: &ServerEvent, stopped: bool) -> MappedEvent {
    let Some(user_id) = string_field(&event.payload, "userId").or_else(|| event.origin_user_id.clone())
    else {
        return malformed(event, "缺少 userId");
    };
    let Some(scope_id) = string_field(&event.payload, "channelId")
        .or_else(|| string_field(&event.payload, "documentId"))
    else {
        return malformed(event, "缺少 channelId / documentId");
    };

    let expires_at = if stopped {
        event.created_at
    } else {
        event.created_at + Duration::milliseconds(ttl_ms(&event.payload, TYPING_TTL_MS))
    };

    MappedEvent::Ephemeral(EphemeralRecord::typing(
        user_id,
        scope_id,
        event.payload.clone(),
        expires_at,
    ))
}

fn map_presence(event: &ServerEvent) -> MappedEvent {
    let Some(user_id) = string_field(&event.payload, "userId").or_else(|| event.origin_user_id.clone())
    else {
        return malformed(event, "缺少 userId");
    };
    let expires_at =
        event.created_at + Duration::milliseconds(ttl_ms(&event.payload, PRESENCE_TTL_MS));
    MappedEvent::Ephemeral(EphemeralRecord::presence(
        user_id,
        event.payload.clone(),
        expires_at,
    ))
}

fn ttl_ms(payload: &Value, default: i64) -> i64 {
    payload
        .get("ttlMs")
        .and_then(Value::as_i64)
        .filter(|ttl| *ttl >= 0)
        .unwrap_or(default)
}

fn string_field(payload: &Value, name: &str) -> Option<String> {
    payload.get(name).and_then(Value::as_str).map(str::to_string)
}

fn malformed(event: &ServerEvent, reason: &str) -> MappedEvent {
    warn!(
        "忽略格式错误的事件: type={}, seqno={}, 原因: {}",
        event.event_type, event.seqno, reason
    );
    MappedEvent::Ignored
}
