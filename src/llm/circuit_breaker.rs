//! 单个 Provider 的熔断器与健康统计
//!
//! 状态转换：
//! - closed -> open：连续失败达到 failure_threshold
//! - open -> half_open：冷却时间到期后的第一次准入（即探测请求）
//! - half_open -> closed：探测成功一次
//! - half_open -> open：探测失败一次（重新计时冷却）
//!
//! half_open 期间同一时刻只放行一个探测请求。冷却计时使用 tokio 时钟，测试可暂停/推进。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// 熔断状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// 准入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// closed：正常放行
    Allowed,
    /// half_open：本冷却窗口内唯一的探测请求
    Probe,
    /// open 或已有探测在途：跳过该 Provider
    Rejected,
}

/// Provider 健康状态（由 Router 按 Provider 单独加锁持有）
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    state: CircuitState,
    consecutive_failures: u32,
    total_requests: u64,
    success_count: u64,
    failure_count: u64,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    average_latency_ms: f64,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    times_opened: u32,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            total_requests: 0,
            success_count: 0,
            failure_count: 0,
            last_failure_at: None,
            last_success_at: None,
            average_latency_ms: 0.0,
            opened_at: None,
            probe_in_flight: false,
            times_opened: 0,
        }
    }
}

/// 只读快照（供外部监控）
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    pub name: String,
    pub priority: u32,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub average_latency_ms: f64,
    pub times_opened: u32,
}

impl ProviderHealth {
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn times_opened(&self) -> u32 {
        self.times_opened
    }

    /// 请求前的准入判断；可能触发 open -> half_open
    pub fn try_acquire(&mut self, config: &CircuitBreakerConfig, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let cooled = self
                    .opened_at
                    .map_or(true, |at| now.saturating_duration_since(at) >= config.cooldown);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    tracing::info!("circuit half-open, sending probe");
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Admission::Rejected
                } else {
                    self.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// 探测被取消（调用方放弃）时归还探测名额，状态保持 half_open
    pub fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }

    fn record_latency(&mut self, latency: Duration) {
        self.total_requests += 1;
        let ms = latency.as_secs_f64() * 1000.0;
        let n = self.total_requests as f64;
        self.average_latency_ms += (ms - self.average_latency_ms) / n;
    }

    pub fn on_success(&mut self, latency: Duration) {
        self.record_latency(latency);
        self.success_count += 1;
        self.last_success_at = Some(Utc::now());
        self.consecutive_failures = 0;
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.opened_at = None;
                self.probe_in_flight = false;
                tracing::info!("circuit closed after successful probe");
            }
            CircuitState::Closed => {}
            // 熔断前已放行的请求迟到成功：不改变状态
            CircuitState::Open => {}
        }
    }

    pub fn on_failure(&mut self, config: &CircuitBreakerConfig, latency: Duration, now: Instant) {
        self.record_latency(latency);
        self.failure_count += 1;
        self.last_failure_at = Some(Utc::now());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= config.failure_threshold {
                    self.open(now);
                }
            }
            CircuitState::HalfOpen => self.open(now),
            CircuitState::Open => {}
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
        self.times_opened += 1;
        tracing::warn!(
            consecutive_failures = self.consecutive_failures,
            "circuit opened"
        );
    }

    /// 手动重置：清空连续失败计数并强制 closed（累计统计保留）
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    pub fn snapshot(&self, name: &str, priority: u32) -> ProviderSnapshot {
        ProviderSnapshot {
            name: name.to_string(),
            priority,
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            total_requests: self.total_requests,
            success_count: self.success_count,
            failure_count: self.failure_count,
            last_failure_at: self.last_failure_at,
            last_success_at: self.last_success_at,
            average_latency_ms: self.average_latency_ms,
            times_opened: self.times_opened,
        }
    }
}
