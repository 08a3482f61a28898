//! Recovery plans and their structural validation.

use std::collections::HashMap;

use drx_id::PlanId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default limit on how long a single wave may stay in progress.
pub const DEFAULT_MAX_WAIT_SECONDS: u64 = 3600;

/// Longest delay a wave may request after its predecessor settles (30 days).
pub const MAX_WAIT_TIME_SECONDS: u64 = 30 * 24 * 3600;

/// How servers inside a wave are launched.
///
/// The provider launches every server of a job in one batch, so this is
/// carried through as plan metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaveExecutionType {
    #[default]
    Sequential,
    Parallel,
}

/// A plan-level wave definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wave {
    pub number: u32,
    pub name: String,
    pub server_ids: Vec<String>,
    #[serde(default)]
    pub execution_type: WaveExecutionType,
    /// Minimum delay between the previous wave finishing and this one starting.
    #[serde(default)]
    pub wait_time_seconds: u64,
    #[serde(default)]
    pub pause_before_wave: bool,
    #[serde(default = "default_max_wait")]
    pub max_wait_seconds: u64,
    /// Region of the wave's recovery job; the configured default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

fn default_max_wait() -> u64 {
    DEFAULT_MAX_WAIT_SECONDS
}

impl Wave {
    pub fn new(number: u32, name: impl Into<String>, server_ids: Vec<String>) -> Self {
        Self {
            number,
            name: name.into(),
            server_ids,
            execution_type: WaveExecutionType::Sequential,
            wait_time_seconds: 0,
            pause_before_wave: false,
            max_wait_seconds: DEFAULT_MAX_WAIT_SECONDS,
            region: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_pause_before(mut self) -> Self {
        self.pause_before_wave = true;
        self
    }

    pub fn with_max_wait(mut self, seconds: u64) -> Self {
        self.max_wait_seconds = seconds;
        self
    }

    pub fn with_wait_time(mut self, seconds: u64) -> Self {
        self.wait_time_seconds = seconds;
        self
    }

    pub fn region_or<'a>(&'a self, default_region: &'a str) -> &'a str {
        self.region.as_deref().unwrap_or(default_region)
    }
}

/// An ordered sequence of waves.
///
/// Plans are frozen with the execution that references them; edits to the
/// source definition never reach a running execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPlan {
    pub plan_id: PlanId,
    #[serde(default)]
    pub name: String,
    pub waves: Vec<Wave>,
}

/// Structural problems found in a plan.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("plan has no waves")]
    EmptyPlan,

    #[error("wave numbers must strictly increase: {current} follows {previous}")]
    WaveOrder { previous: u32, current: u32 },

    #[error("wave {0} has no servers")]
    EmptyWave(u32),

    #[error("server {server_id} appears in wave {first} and wave {second}")]
    DuplicateServer {
        server_id: String,
        first: u32,
        second: u32,
    },

    #[error("wave {0} must allow a positive maxWaitSeconds")]
    InvalidMaxWait(u32),

    #[error("wave {wave_number} waitTimeSeconds {seconds} exceeds the {max}s limit")]
    WaitTimeTooLong {
        wave_number: u32,
        seconds: u64,
        max: u64,
    },

    #[error("wave {wave_number} has {server_count} servers, the per-job limit is {max}")]
    WaveTooLarge {
        wave_number: u32,
        server_count: usize,
        max: usize,
    },
}

impl RecoveryPlan {
    pub fn new(plan_id: PlanId, name: impl Into<String>, waves: Vec<Wave>) -> Self {
        Self {
            plan_id,
            name: name.into(),
            waves,
        }
    }

    pub fn wave(&self, number: u32) -> Option<&Wave> {
        self.waves.iter().find(|w| w.number == number)
    }

    pub fn first_wave(&self) -> Option<&Wave> {
        self.waves.first()
    }

    /// The wave following `number` in plan order.
    pub fn next_wave(&self, number: u32) -> Option<&Wave> {
        let idx = self.waves.iter().position(|w| w.number == number)?;
        self.waves.get(idx + 1)
    }

    /// The wave preceding `number` in plan order.
    pub fn previous_wave(&self, number: u32) -> Option<&Wave> {
        let idx = self.waves.iter().position(|w| w.number == number)?;
        idx.checked_sub(1).and_then(|i| self.waves.get(i))
    }

    pub fn total_waves(&self) -> u32 {
        self.waves.len() as u32
    }

    /// Checks the plan shape. Size limits are the quota guard's concern.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.waves.is_empty() {
            return Err(ValidationError::EmptyPlan);
        }

        let mut seen: HashMap<&str, u32> = HashMap::new();
        let mut previous: Option<u32> = None;

        for wave in &self.waves {
            if let Some(previous) = previous {
                if wave.number <= previous {
                    return Err(ValidationError::WaveOrder {
                        previous,
                        current: wave.number,
                    });
                }
            }
            previous = Some(wave.number);

            if wave.server_ids.is_empty() {
                return Err(ValidationError::EmptyWave(wave.number));
            }
            if wave.max_wait_seconds == 0 {
                return Err(ValidationError::InvalidMaxWait(wave.number));
            }
            if wave.wait_time_seconds > MAX_WAIT_TIME_SECONDS {
                return Err(ValidationError::WaitTimeTooLong {
                    wave_number: wave.number,
                    seconds: wave.wait_time_seconds,
                    max: MAX_WAIT_TIME_SECONDS,
                });
            }

            for server_id in &wave.server_ids {
                if let Some(first) = seen.insert(server_id.as_str(), wave.number) {
                    return Err(ValidationError::DuplicateServer {
                        server_id: server_id.clone(),
                        first,
                        second: wave.number,
                    });
                }
            }
        }

        Ok(())
    }
}
