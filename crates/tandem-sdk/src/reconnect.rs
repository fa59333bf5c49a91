//! 重连退避
//!
//! 推送流每断开一次，下一次重连等待 `min(base * 2^attempts, cap)`；
//! 收到 ready 信号后尝试次数清零。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// 重连配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// 初始重连间隔（毫秒）
    pub base_delay_ms: u64,
    /// 最大重连间隔（毫秒）
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,  // 1s → 2s → 4s → 8s → 16s → 30s 封顶
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    /// 第 `attempt` 次（从 0 开始）断开后的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let delay_ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// 重连状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectState {
    /// 自上次 ready 以来的断开次数
    pub attempt_count: u32,
    /// 下一次断开时的等待时间
    pub next_delay: Duration,
}

/// 重连统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconnectStats {
    pub attempt_count: u32,
    pub total_disconnects: u64,
    pub next_delay_ms: u64,
}

#[derive(Debug)]
pub struct ReconnectBackoff {
    config: ReconnectConfig,
    attempt_count: RwLock<u32>,
    total_disconnects: RwLock<u64>,
}

impl ReconnectBackoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: RwLock::new(0),
            total_disconnects: RwLock::new(0),
        }
    }

    /// 记录一次断开，返回本次应等待的时间
    pub fn on_disconnect(&self) -> Duration {
        let mut attempts = self.attempt_count.write();
        let delay = self.config.delay_for(*attempts);
        *attempts = attempts.saturating_add(1);
        *self.total_disconnects.write() += 1;

        info!(
            "重连尝试 #{}, 等待 {}ms",
            *attempts,
            delay.as_millis()
        );
        delay
    }

    /// 推送流就绪，重置退避
    pub fn mark_ready(&self) {
        let mut attempts = self.attempt_count.write();
        if *attempts > 0 {
            info!("推送流已就绪，重置重连计数器（之前尝试了 {} 次）", *attempts);
        }
        *attempts = 0;
    }

    pub fn state(&self) -> ReconnectState {
        let attempt_count = *self.attempt_count.read();
        ReconnectState {
            attempt_count,
            next_delay: self.config.delay_for(attempt_count),
        }
    }

    pub fn stats(&self) -> ReconnectStats {
        let state = self.state();
        ReconnectStats {
            attempt_count: state.attempt_count,
            total_disconnects: *self.total_disconnects.read(),
            next_delay_ms: state.next_delay.as_millis() as u64,
        }
    }
}
