//! Per-user circuit breaker for tool calls.
//!
//! State machine: Closed → Open → HalfOpen → Closed | Open
//! - Consecutive failures in Closed trip the breaker at the threshold
//! - Open rejects every call until the cooldown elapses
//! - HalfOpen lets exactly one trial call through
//! - Cooldown doubles with each consecutive trip, capped
//!
//! State is keyed by user id, not by connection, so a reconnecting agent
//! keeps its failure history. A user with no failure history has no entry:
//! one is created on the first failure and dropped again once the breaker is
//! back at rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

use agentlink_core::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Admission granted by [`CircuitBreakers::try_acquire`].
///
/// A `Trial` permit holds the single HalfOpen slot; it must be settled with
/// `record_success`, `record_failure` or `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    Trial,
}

/// Call rejected because the breaker is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Seconds until a trial call will be admitted, while open.
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { opened_at: Instant, cooldown: Duration },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
struct UserBreaker {
    phase: Phase,
    consecutive_failures: u32,
    /// Trips since the last close; drives the backoff exponent.
    consecutive_trips: u32,
}

impl Default for UserBreaker {
    fn default() -> Self {
        Self {
            phase: Phase::Closed,
            consecutive_failures: 0,
            consecutive_trips: 0,
        }
    }
}

impl UserBreaker {
    /// Indistinguishable from a missing entry.
    const fn at_rest(&self) -> bool {
        matches!(self.phase, Phase::Closed)
            && self.consecutive_failures == 0
            && self.consecutive_trips == 0
    }
}

/// Retry hint handed out while another caller holds the trial slot.
const TRIAL_BUSY_RETRY: Duration = Duration::from_secs(1);

/// Circuit breakers for every user, each behind its own lock.
pub struct CircuitBreakers {
    failure_threshold: u32,
    base_cooldown: Duration,
    max_cooldown: Duration,
    users: RwLock<HashMap<String, Arc<Mutex<UserBreaker>>>>,
}

impl CircuitBreakers {
    pub fn new(config: &BreakerConfig) -> Self {
        Self::with_cooldowns(
            config.failure_threshold,
            config.base_cooldown(),
            config.max_cooldown(),
        )
    }

    pub fn with_cooldowns(
        failure_threshold: u32,
        base_cooldown: Duration,
        max_cooldown: Duration,
    ) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            base_cooldown,
            max_cooldown: max_cooldown.max(base_cooldown),
            users: RwLock::new(HashMap::new()),
        }
    }

    async fn existing(&self, user_id: &str) -> Option<Arc<Mutex<UserBreaker>>> {
        self.users.read().await.get(user_id).cloned()
    }

    async fn entry(&self, user_id: &str) -> Arc<Mutex<UserBreaker>> {
        if let Some(b) = self.existing(user_id).await {
            return b;
        }
        Arc::clone(
            self.users
                .write()
                .await
                .entry(user_id.to_string())
                .or_default(),
        )
    }

    /// Cooldown for the given trip number: `base * 2^(trips - 1)`, capped.
    fn cooldown_for(&self, trips: u32) -> Duration {
        let shift = trips.saturating_sub(1).min(31);
        let multiplier = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_cooldown
            .saturating_mul(multiplier)
            .min(self.max_cooldown)
    }

    /// Ask to make a call for `user_id`.
    pub async fn try_acquire(&self, user_id: &str) -> Result<Permit, Rejected> {
        let Some(entry) = self.existing(user_id).await else {
            return Ok(Permit::Normal);
        };
        let mut b = entry.lock().await;
        match b.phase {
            Phase::Closed => Ok(Permit::Normal),
            Phase::Open {
                opened_at,
                cooldown,
            } => {
                let elapsed = opened_at.elapsed();
                if elapsed >= cooldown {
                    info!(user_id = %user_id, "Circuit half-open, admitting trial call");
                    b.phase = Phase::HalfOpen {
                        trial_in_flight: true,
                    };
                    Ok(Permit::Trial)
                } else {
                    Err(Rejected {
                        retry_after: cooldown - elapsed,
                    })
                }
            }
            Phase::HalfOpen {
                trial_in_flight: true,
            } => Err(Rejected {
                retry_after: TRIAL_BUSY_RETRY,
            }),
            Phase::HalfOpen {
                trial_in_flight: false,
            } => {
                b.phase = Phase::HalfOpen {
                    trial_in_flight: true,
                };
                Ok(Permit::Trial)
            }
        }
    }

    pub async fn record_success(&self, user_id: &str, permit: Permit) {
        let Some(entry) = self.existing(user_id).await else {
            return;
        };
        let at_rest = {
            let mut b = entry.lock().await;
            match (b.phase, permit) {
                (Phase::Closed, _) => b.consecutive_failures = 0,
                (Phase::HalfOpen { .. }, Permit::Trial) => {
                    info!(user_id = %user_id, "Trial call succeeded, circuit closed");
                    *b = UserBreaker::default();
                }
                // A call admitted before the trip finished late; the state
                // machine has moved on without it.
                _ => {}
            }
            b.at_rest()
        };
        drop(entry);
        if at_rest {
            self.prune(user_id).await;
        }
    }

    /// Remove the user's entry if it is at rest and nobody else holds it.
    ///
    /// The map's write lock stops new holders from appearing, so an entry
    /// only the map references cannot be mutated after removal.
    async fn prune(&self, user_id: &str) {
        let mut users = self.users.write().await;
        let Some(entry) = users.get(user_id) else {
            return;
        };
        if Arc::strong_count(entry) > 1 {
            return;
        }
        if entry.try_lock().is_ok_and(|b| b.at_rest()) {
            users.remove(user_id);
        }
    }

    pub async fn tracked_users(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn record_failure(&self, user_id: &str, permit: Permit) {
        let entry = self.entry(user_id).await;
        let mut b = entry.lock().await;
        match (b.phase, permit) {
            (Phase::Closed, _) => {
                b.consecutive_failures += 1;
                if b.consecutive_failures >= self.failure_threshold {
                    self.trip(user_id, &mut b);
                }
            }
            (Phase::HalfOpen { .. }, Permit::Trial) => {
                b.consecutive_failures += 1;
                self.trip(user_id, &mut b);
            }
            _ => {}
        }
    }

    /// Give back a permit without an outcome (the call never reached the
    /// agent). Frees the HalfOpen trial slot.
    pub async fn release(&self, user_id: &str, permit: Permit) {
        if permit != Permit::Trial {
            return;
        }
        let Some(entry) = self.existing(user_id).await else {
            return;
        };
        let mut b = entry.lock().await;
        if let Phase::HalfOpen {
            trial_in_flight: true,
        } = b.phase
        {
            b.phase = Phase::HalfOpen {
                trial_in_flight: false,
            };
        }
    }

    fn trip(&self, user_id: &str, b: &mut UserBreaker) {
        b.consecutive_trips = b.consecutive_trips.saturating_add(1);
        let cooldown = self.cooldown_for(b.consecutive_trips);
        warn!(
            user_id = %user_id,
            failures = b.consecutive_failures,
            trips = b.consecutive_trips,
            cooldown_secs = cooldown.as_secs(),
            "Circuit opened"
        );
        b.phase = Phase::Open {
            opened_at: Instant::now(),
            cooldown,
        };
    }

    pub async fn snapshot(&self, user_id: &str) -> BreakerSnapshot {
        let Some(entry) = self.users.read().await.get(user_id).cloned() else {
            return BreakerSnapshot {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                retry_after_secs: None,
            };
        };
        let b = entry.lock().await;
        let (state, retry_after_secs) = match b.phase {
            Phase::Closed => (CircuitState::Closed, None),
            Phase::Open {
                opened_at,
                cooldown,
            } => {
                let remaining = cooldown.saturating_sub(opened_at.elapsed());
                if remaining.is_zero() {
                    (CircuitState::HalfOpen, None)
                } else {
                    (CircuitState::Open, Some(ceil_secs(remaining)))
                }
            }
            Phase::HalfOpen { .. } => (CircuitState::HalfOpen, None),
        };
        BreakerSnapshot {
            state,
            consecutive_failures: b.consecutive_failures,
            retry_after_secs,
        }
    }
}

/// Whole seconds, rounded up so a caller never retries too early.
pub fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 { secs + 1 } else { secs }
}
