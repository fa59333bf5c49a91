//! catch-up 决策与结果
//!
//! - offset 为 0：全量拉取，绝不调用 diff
//! - offset > 0：调用 diff；`resetRequired` 或 diff 失败都退化为全量拉取

use serde::{Deserialize, Serialize};

use crate::protocol::ServerEvent;

/// diff 分页上限，超过后交给推送流继续追
pub const MAX_DIFF_PAGES: usize = 64;

/// 全量拉取原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullFetchReason {
    /// 本地没有任何基线
    InitialSync,
    /// 服务端要求重置（日志已压缩）
    ResetRequired,
    /// diff 调用失败或返回了不连续的事件
    DiffFailed,
    /// 推送流空洞超时
    Hole,
}

/// catch-up 计划
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpPlan {
    FullFetch(FullFetchReason),
    Diff { offset: u64 },
}

pub fn plan(offset: u64) -> CatchUpPlan {
    if offset == 0 {
        CatchUpPlan::FullFetch(FullFetchReason::InitialSync)
    } else {
        CatchUpPlan::Diff { offset }
    }
}

/// catch-up 结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CatchUpOutcome {
    FullFetch {
        reason: FullFetchReason,
        head_offset: u64,
        rows: usize,
    },
    Diff {
        applied: usize,
        offset: u64,
    },
}

impl CatchUpOutcome {
    pub fn is_full_fetch(&self) -> bool {
        matches!(self, CatchUpOutcome::FullFetch { .. })
    }

    /// catch-up 结束后的 offset
    pub fn offset(&self) -> u64 {
        match self {
            CatchUpOutcome::FullFetch { head_offset, .. } => *head_offset,
            CatchUpOutcome::Diff { offset, .. } => *offset,
        }
    }
}

/// 一页 diff 中可应用的部分
#[derive(Debug, Clone, PartialEq)]
pub struct DiffSlice {
    /// 从 offset+1 开始连续的事件
    pub events: Vec<ServerEvent>,
    /// 事件序列在此 seqno 前断开
    pub gap_before: Option<u64>,
}

/// 按 seqno 排序去重，丢弃已应用的部分，只保留从 `offset + 1` 开始的连续前缀
pub fn contiguous_after(mut events: Vec<ServerEvent>, offset: u64) -> DiffSlice {
    events.sort_by_key(|e| e.seqno);
    events.dedup_by_key(|e| e.seqno);

    let mut expected = offset + 1;
    let mut slice = Vec::with_capacity(events.len());
    for event in events.into_iter().filter(|e| e.seqno > offset) {
        if event.seqno != expected {
            return DiffSlice {
                events: slice,
                gap_before: Some(event.seqno),
            };
        }
        expected += 1;
        slice.push(event);
    }

    DiffSlice {
        events: slice,
        gap_before: None,
    }
}
