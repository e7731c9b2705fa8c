// src/core/circuit.rs — Per-budget circuit breaker
//
// Closed -> Open (trip, reason recorded) -> HalfOpen (cool-down elapsed)
//        -> Closed (probe succeeded or operator reset)
// HalfOpen -> Open again when a probe is blocked.
// Every transition carries the reason of the trip that started the cycle.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use crate::infra::audit::{AuditRecord, AuditSink};
use crate::infra::config::CircuitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitMode {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitMode::Closed => "closed",
            CircuitMode::Open => "open",
            CircuitMode::HalfOpen => "half_open",
        })
    }
}

/// Why a circuit was tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripReason {
    BudgetExceeded,
    ThresholdCrossed,
    AnomalyDetected,
    ActionRule,
    ProbeFailed,
    Manual,
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TripReason::BudgetExceeded => "budget exceeded",
            TripReason::ThresholdCrossed => "threshold crossed",
            TripReason::AnomalyDetected => "anomaly detected",
            TripReason::ActionRule => "action rule",
            TripReason::ProbeFailed => "half-open probe blocked",
            TripReason::Manual => "manual",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitState {
    pub budget_id: String,
    pub budget_name: String,
    pub mode: CircuitMode,
    pub reason: TripReason,
    pub detail: Option<String>,
    pub tripped_at: DateTime<Utc>,
    pub trip_count: u32,
    pub probe_successes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitTransition {
    pub budget_id: String,
    pub budget_name: String,
    pub from: CircuitMode,
    pub to: CircuitMode,
    pub reason: TripReason,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

pub struct CircuitBreaker {
    config: RwLock<CircuitConfig>,
    states: Mutex<HashMap<String, CircuitState>>,
    transitions: Mutex<VecDeque<CircuitTransition>>,
    audit: Arc<dyn AuditSink>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            config: RwLock::new(config),
            states: Mutex::new(HashMap::new()),
            transitions: Mutex::new(VecDeque::new()),
            audit,
        }
    }

    pub fn config(&self) -> CircuitConfig {
        self.config.read().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn update_config(&self, config: CircuitConfig) {
        if let Ok(mut c) = self.config.write() {
            *c = config;
        }
    }

    /// Force a budget open. Returns true when this call opened the circuit.
    pub fn trip(
        &self,
        budget_id: &str,
        budget_name: &str,
        reason: TripReason,
        detail: Option<String>,
    ) -> bool {
        self.trip_at(budget_id, budget_name, reason, detail, Utc::now())
    }

    pub fn trip_at(
        &self,
        budget_id: &str,
        budget_name: &str,
        reason: TripReason,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.config().enabled {
            return false;
        }
        let Ok(mut states) = self.states.lock() else {
            return false;
        };

        let from = states
            .get(budget_id)
            .map(|s| s.mode)
            .unwrap_or(CircuitMode::Closed);
        if from == CircuitMode::Open {
            tracing::debug!(budget_id, "Circuit already open, trip ignored");
            return false;
        }

        let state = states
            .entry(budget_id.to_string())
            .or_insert_with(|| CircuitState {
                budget_id: budget_id.to_string(),
                budget_name: budget_name.to_string(),
                mode: CircuitMode::Closed,
                reason,
                detail: None,
                tripped_at: now,
                trip_count: 0,
                probe_successes: 0,
            });
        state.mode = CircuitMode::Open;
        state.budget_name = budget_name.to_string();
        state.reason = reason;
        state.detail = detail;
        state.tripped_at = now;
        state.trip_count += 1;
        state.probe_successes = 0;

        tracing::warn!(
            budget_id,
            reason = %reason,
            detail = state.detail.as_deref().unwrap_or(""),
            "Circuit tripped"
        );
        let transition = transition_of(state, from, now);
        drop(states);
        self.record(transition);
        true
    }

    /// Current mode, moving Open -> HalfOpen once the cool-down has elapsed.
    pub fn status(&self, budget_id: &str) -> CircuitMode {
        self.status_at(budget_id, Utc::now())
    }

    pub fn status_at(&self, budget_id: &str, now: DateTime<Utc>) -> CircuitMode {
        let config = self.config();
        if !config.enabled {
            return CircuitMode::Closed;
        }
        let Ok(mut states) = self.states.lock() else {
            return CircuitMode::Closed;
        };
        let Some(state) = states.get_mut(budget_id) else {
            return CircuitMode::Closed;
        };

        if state.mode == CircuitMode::Open && config.cooldown_secs > 0 {
            let cooldown = Duration::seconds(config.cooldown_secs as i64);
            if now >= state.tripped_at + cooldown {
                state.mode = CircuitMode::HalfOpen;
                state.probe_successes = 0;
                tracing::info!(budget_id, "Circuit cool-down elapsed, half-open");
                let mut transition = transition_of(state, CircuitMode::Open, now);
                transition.detail = Some("cool-down elapsed".into());
                drop(states);
                self.record(transition);
                return CircuitMode::HalfOpen;
            }
        }
        state.mode
    }

    pub fn is_open(&self, budget_id: &str) -> bool {
        self.status(budget_id) == CircuitMode::Open
    }

    pub fn is_open_at(&self, budget_id: &str, now: DateTime<Utc>) -> bool {
        self.status_at(budget_id, now) == CircuitMode::Open
    }

    /// Report the outcome of a request evaluated while half-open.
    /// A blocked probe re-opens the circuit; enough passing probes close it.
    pub fn record_probe(&self, budget_id: &str, passed: bool) {
        self.record_probe_at(budget_id, passed, Utc::now())
    }

    pub fn record_probe_at(&self, budget_id: &str, passed: bool, now: DateTime<Utc>) {
        let needed = self.config().half_open_successes.max(1);
        let Ok(mut states) = self.states.lock() else {
            return;
        };
        let Some(state) = states.get_mut(budget_id) else {
            return;
        };
        if state.mode != CircuitMode::HalfOpen {
            return;
        }

        let transition = if passed {
            state.probe_successes += 1;
            if state.probe_successes < needed {
                return;
            }
            state.mode = CircuitMode::Closed;
            tracing::info!(budget_id, "Circuit closed after successful probe");
            let mut t = transition_of(state, CircuitMode::HalfOpen, now);
            t.detail = Some(format!("{} probe(s) passed", state.probe_successes));
            t
        } else {
            state.mode = CircuitMode::Open;
            state.reason = TripReason::ProbeFailed;
            state.tripped_at = now;
            state.trip_count += 1;
            state.probe_successes = 0;
            tracing::warn!(budget_id, "Half-open probe blocked, circuit re-opened");
            transition_of(state, CircuitMode::HalfOpen, now)
        };
        drop(states);
        self.record(transition);
    }

    /// Operator reset back to closed. Returns false if already closed.
    pub fn reset(&self, budget_id: &str, operator: &str) -> bool {
        self.reset_at(budget_id, operator, Utc::now())
    }

    pub fn reset_at(&self, budget_id: &str, operator: &str, now: DateTime<Utc>) -> bool {
        let Ok(mut states) = self.states.lock() else {
            return false;
        };
        let Some(state) = states.get_mut(budget_id) else {
            return false;
        };
        if state.mode == CircuitMode::Closed {
            return false;
        }
        let from = state.mode;
        state.mode = CircuitMode::Closed;
        state.probe_successes = 0;
        tracing::info!(budget_id, operator, "Circuit reset");
        let mut transition = transition_of(state, from, now);
        transition.detail = Some(format!("reset by {operator}"));
        drop(states);
        self.record(transition);
        true
    }

    pub fn state(&self, budget_id: &str) -> Option<CircuitState> {
        self.states.lock().ok()?.get(budget_id).cloned()
    }

    /// Budgets whose circuit is not closed.
    pub fn open_circuits(&self) -> Vec<CircuitState> {
        let mut open: Vec<CircuitState> = self
            .states
            .lock()
            .map(|s| {
                s.values()
                    .filter(|st| st.mode != CircuitMode::Closed)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        open.sort_by(|a, b| a.budget_id.cmp(&b.budget_id));
        open
    }

    /// Most recent transitions, newest last.
    pub fn transitions(&self, limit: usize) -> Vec<CircuitTransition> {
        self.transitions
            .lock()
            .map(|t| {
                let skip = t.len().saturating_sub(limit);
                t.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    fn record(&self, transition: CircuitTransition) {
        let cap = self.config().transition_history.max(1);
        if let Ok(mut log) = self.transitions.lock() {
            while log.len() >= cap {
                log.pop_front();
            }
            log.push_back(transition.clone());
        }
        self.audit.append(AuditRecord::CircuitTransition(transition));
    }
}

fn transition_of(state: &CircuitState, from: CircuitMode, now: DateTime<Utc>) -> CircuitTransition {
    CircuitTransition {
        budget_id: state.budget_id.clone(),
        budget_name: state.budget_name.clone(),
        from,
        to: state.mode,
        reason: state.reason,
        detail: state.detail.clone(),
        at: now,
    }
}
