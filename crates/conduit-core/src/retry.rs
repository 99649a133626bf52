//! # Retry Backoff
//!
//! Per-service bounded backoff. A schedule is a list of delays (each with
//! optional random jitter) and a ceiling on the number of retries. Once
//! the ceiling is reached a service can be switched to "forever" mode,
//! which keeps retrying at the last delay handed out.
//!
//! Schedule strings follow the comma separated form
//! `max_retries=N, default_randomization=R, D1, D2:R2, ...` (all values in
//! milliseconds; `max_retries=infinite` never stops).

use std::str::FromStr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngExt as _, SeedableRng};

use crate::config::ConfigError;

pub const DEFAULT_RETRY_SCHEDULE: &str = "default_randomization=2000,5000,10000,20000,40000,\
80000:5000,160000:5000,320000:5000,640000:5000,1280000:5000,1800000:5000";

/// Forever mode never retries faster than this.
const FOREVER_FLOOR_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStep {
    pub delay_ms: u64,
    pub randomization_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    Count(u32),
    Infinite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    pub steps: Vec<RetryStep>,
    pub limit: RetryLimit,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        DEFAULT_RETRY_SCHEDULE
            .parse()
            .unwrap_or_else(|_| RetrySchedule {
                steps: vec![RetryStep {
                    delay_ms: 5_000,
                    randomization_ms: 0,
                }],
                limit: RetryLimit::Count(1),
            })
    }
}

impl FromStr for RetrySchedule {
    type Err = ConfigError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let bad = |reason: &str| ConfigError::InvalidRetrySchedule {
            input: input.to_string(),
            reason: reason.to_string(),
        };
        let parse_ms = |s: &str| -> Result<u64, ConfigError> {
            s.trim()
                .parse::<u64>()
                .map_err(|_| bad(&format!("`{}` is not a millisecond value", s.trim())))
        };

        let mut limit = None;
        let mut default_randomization = 0;
        let mut steps = Vec::new();

        for token in input.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if let Some((key, value)) = token.split_once('=') {
                match key.trim() {
                    "max_retries" => {
                        let value = value.trim();
                        limit = Some(if value.eq_ignore_ascii_case("infinite") {
                            RetryLimit::Infinite
                        } else {
                            let n = value
                                .parse::<u32>()
                                .map_err(|_| bad("max_retries must be a count or `infinite`"))?;
                            RetryLimit::Count(n)
                        });
                    }
                    "default_randomization" => default_randomization = parse_ms(value)?,
                    other => return Err(bad(&format!("unknown key `{other}`"))),
                }
                continue;
            }
            let step = match token.split_once(':') {
                Some((delay, rand)) => RetryStep {
                    delay_ms: parse_ms(delay)?,
                    randomization_ms: parse_ms(rand)?,
                },
                None => RetryStep {
                    delay_ms: parse_ms(token)?,
                    randomization_ms: default_randomization,
                },
            };
            steps.push(step);
        }

        let limit = limit.unwrap_or(RetryLimit::Count(steps.len() as u32));
        if steps.is_empty() && limit != RetryLimit::Count(0) {
            return Err(bad("at least one delay is required"));
        }
        Ok(RetrySchedule { steps, limit })
    }
}

/// Backoff state for one service.
#[derive(Debug)]
pub struct RetryManager {
    schedule: RetrySchedule,
    attempt_count: u32,
    last_timeout_ms: u64,
    forever: bool,
    rng: StdRng,
}

impl RetryManager {
    pub fn new(schedule: RetrySchedule, seed: u64) -> Self {
        Self {
            schedule,
            attempt_count: 0,
            last_timeout_ms: 0,
            forever: false,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// True while the attempt count is below the ceiling, or in forever mode.
    pub fn is_retry_needed(&self) -> bool {
        if self.forever {
            return true;
        }
        match self.schedule.limit {
            RetryLimit::Infinite => true,
            RetryLimit::Count(max) => self.attempt_count < max,
        }
    }

    /// Delay before the next attempt. Never shorter than the previous one.
    pub fn retry_timer(&mut self) -> Duration {
        let ms = if self.forever {
            self.last_timeout_ms.max(FOREVER_FLOOR_MS)
        } else {
            let step = self.current_step();
            let jitter = if step.randomization_ms > 0 {
                (self.rng.random::<f64>() * step.randomization_ms as f64) as u64
            } else {
                0
            };
            (step.delay_ms + jitter).max(self.last_timeout_ms)
        };
        self.last_timeout_ms = ms;
        Duration::from_millis(ms)
    }

    pub fn increase_retry_count(&mut self) {
        self.attempt_count = self.attempt_count.saturating_add(1);
    }

    /// Switch to fixed-interval indefinite retries at the last delay used.
    pub fn retry_forever_using_last_timeout(&mut self) {
        if !self.forever && self.last_timeout_ms == 0 {
            self.last_timeout_ms = self.current_step().delay_ms;
        }
        self.forever = true;
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.last_timeout_ms = 0;
        self.forever = false;
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn is_forever(&self) -> bool {
        self.forever
    }

    pub fn last_timeout(&self) -> Duration {
        Duration::from_millis(self.last_timeout_ms)
    }

    fn current_step(&self) -> RetryStep {
        let idx = (self.attempt_count as usize).min(self.schedule.steps.len().saturating_sub(1));
        self.schedule.steps.get(idx).copied().unwrap_or(RetryStep {
            delay_ms: FOREVER_FLOOR_MS,
            randomization_ms: 0,
        })
    }
}
