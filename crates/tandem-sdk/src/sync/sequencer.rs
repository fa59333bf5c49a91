//! Update Sequencer
//!
//! 把至少一次投递、可能乱序的推送流整理成严格递增、无空洞的批次：
//! - `seqno <= offset`：重复或过期，丢弃
//! - `seqno == offset + 1`：推进 offset，追加到当前批次，并连带吸收缓冲区里已连续的事件
//! - `seqno > offset + 1`：放入空洞缓冲区，启动空洞计时器
//!
//! 序列器本身不做任何 I/O，也不持有定时器任务：调用方传入 `now`，
//! 通过 `next_deadline()` 得知下一次需要 `poll()` 的时刻。空洞只上报，不修复。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::protocol::ServerEvent;

/// 序列器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// 批次去抖时间（毫秒）
    pub flush_debounce_ms: u64,
    /// 空洞超时（毫秒）
    pub hole_timeout_ms: u64,
    /// 空洞缓冲区上限，超过立即上报空洞
    pub max_buffered: usize,
    /// 批次从第一条事件起最多等待多久（毫秒），不随去抖顺延
    #[serde(default = "default_max_batch_wait_ms")]
    pub max_batch_wait_ms: u64,
}

fn default_max_batch_wait_ms() -> u64 {
    1_000
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            flush_debounce_ms: 100,
            hole_timeout_ms: 5_000,
            max_buffered: 10_000,
            max_batch_wait_ms: default_max_batch_wait_ms(),
        }
    }
}

impl SequencerConfig {
    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }

    pub fn hole_timeout(&self) -> Duration {
        Duration::from_millis(self.hole_timeout_ms)
    }

    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms)
    }
}

/// `push` 的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// 重复、过期或已销毁
    Discarded,
    /// offset 已推进（可能连带吸收了缓冲事件）
    Advanced,
    /// 乱序，进入空洞缓冲区
    Buffered,
}

/// `poll` 的输出
#[derive(Debug, Clone, PartialEq)]
pub enum SequencerOutput {
    /// 一段连续有序的事件
    Batch(Vec<ServerEvent>),
    /// 空洞未能在超时内补齐
    Hole { offset: u64, lowest_buffered: u64 },
}

/// 序列器状态快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerStats {
    pub offset: u64,
    pub buffered: usize,
    pub pending_batch: usize,
    pub discarded: u64,
    pub batches_flushed: u64,
    pub holes_reported: u64,
}

pub struct UpdateSequencer {
    config: SequencerConfig,
    offset: u64,
    /// 已推进但尚未交付的连续事件
    active: Vec<ServerEvent>,
    /// 当前批次第一条事件的推进时刻
    batch_started: Option<Instant>,
    /// 空洞缓冲区
    buffer: BTreeMap<u64, ServerEvent>,
    flush_at: Option<Instant>,
    hole_at: Option<Instant>,
    destroyed: bool,
    discarded: u64,
    batches_flushed: u64,
    holes_reported: u64,
}

impl UpdateSequencer {
    pub fn new(offset: u64, config: SequencerConfig) -> Self {
        Self {
            config,
            offset,
            active: Vec::new(),
            batch_started: None,
            buffer: BTreeMap::new(),
            flush_at: None,
            hole_at: None,
            destroyed: false,
            discarded: 0,
            batches_flushed: 0,
            holes_reported: 0,
        }
    }

    /// 已连续推进到的 seqno（包含尚未 flush 的批次）
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn push(&mut self, event: ServerEvent, now: Instant) -> PushOutcome {
        if self.destroyed {
            return PushOutcome::Discarded;
        }

        let seqno = event.seqno;
        if seqno <= self.offset {
            self.discarded += 1;
            debug!("丢弃过期事件: seqno={}, offset={}", seqno, self.offset);
            return PushOutcome::Discarded;
        }

        if seqno == self.offset + 1 {
            self.offset = seqno;
            self.active.push(event);

            while let Some(next) = self.buffer.remove(&(self.offset + 1)) {
                self.offset = next.seqno;
                self.active.push(next);
            }

            if self.buffer.is_empty() {
                self.hole_at = None;
            }
            let started = *self.batch_started.get_or_insert(now);
            let debounced = now + self.config.flush_debounce();
            self.flush_at = Some(debounced.min(started + self.config.max_batch_wait()));
            return PushOutcome::Advanced;
        }

        if self.buffer.contains_key(&seqno) {
            self.discarded += 1;
            debug!("丢弃重复缓冲事件: seqno={}", seqno);
            return PushOutcome::Discarded;
        }

        self.buffer.insert(seqno, event);
        debug!(
            "事件乱序，进入缓冲区: seqno={}, offset={}, buffered={}",
            seqno,
            self.offset,
            self.buffer.len()
        );

        if self.buffer.len() > self.config.max_buffered {
            warn!(
                "空洞缓冲区溢出 ({} > {})，立即上报空洞",
                self.buffer.len(),
                self.config.max_buffered
            );
            self.hole_at = Some(now);
        } else if self.hole_at.is_none() {
            self.hole_at = Some(now + self.config.hole_timeout());
        }

        PushOutcome::Buffered
    }

    /// 触发所有已到期的 flush / 空洞计时器。批次总是先于空洞输出。
    pub fn poll(&mut self, now: Instant) -> Vec<SequencerOutput> {
        let mut outputs = Vec::new();
        if self.destroyed {
            return outputs;
        }

        if matches!(self.flush_at, Some(at) if at <= now) {
            self.flush_at = None;
            if let Some(batch) = self.take_batch() {
                outputs.push(SequencerOutput::Batch(batch));
            }
        }

        if matches!(self.hole_at, Some(at) if at <= now) {
            self.hole_at = None;
            if let Some(&lowest_buffered) = self.buffer.keys().next() {
                self.holes_reported += 1;
                warn!(
                    "检测到空洞: offset={}, lowest_buffered={}",
                    self.offset, lowest_buffered
                );
                outputs.push(SequencerOutput::Hole {
                    offset: self.offset,
                    lowest_buffered,
                });
            }
        }

        outputs
    }

    /// 不等去抖，立即交付当前批次
    pub fn flush_now(&mut self) -> Option<Vec<ServerEvent>> {
        if self.destroyed {
            return None;
        }
        self.flush_at = None;
        self.take_batch()
    }

    /// 下一个需要 `poll` 的时刻
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.flush_at, self.hole_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// 清空缓冲区与计时器，从 `offset` 重新开始
    pub fn reset(&mut self, offset: u64) {
        if self.destroyed {
            return;
        }
        debug!("序列器重置: {} -> {}", self.offset, offset);
        self.offset = offset;
        self.active.clear();
        self.batch_started = None;
        self.buffer.clear();
        self.flush_at = None;
        self.hole_at = None;
    }

    /// catch-up 结束后重新定位到 `offset`：等同于 `reset(offset)`，
    /// 但缓冲区里 seqno 更大的事件会被重新 push，而不是丢掉
    pub fn rearm(&mut self, offset: u64, now: Instant) {
        if self.destroyed {
            return;
        }
        let retained: Vec<ServerEvent> = std::mem::take(&mut self.active)
            .into_iter()
            .chain(std::mem::take(&mut self.buffer).into_values())
            .filter(|e| e.seqno > offset)
            .collect();
        self.reset(offset);
        for event in retained {
            self.push(event, now);
        }
    }

    /// 停止所有计时器，之后的 push 都是空操作
    pub fn destroy(&mut self) {
        self.destroyed = true;
        self.active.clear();
        self.batch_started = None;
        self.buffer.clear();
        self.flush_at = None;
        self.hole_at = None;
    }

    pub fn stats(&self) -> SequencerStats {
        SequencerStats {
            offset: self.offset,
            buffered: self.buffer.len(),
            pending_batch: self.active.len(),
            discarded: self.discarded,
            batches_flushed: self.batches_flushed,
            holes_reported: self.holes_reported,
        }
    }

    fn take_batch(&mut self) -> Option<Vec<ServerEvent>> {
        if self.active.is_empty() {
            return None;
        }
        self.batches_flushed += 1;
        self.batch_started = None;
        Some(std::mem::take(&mut self.active))
    }
}
