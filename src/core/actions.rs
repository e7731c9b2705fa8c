// src/core/actions.rs — Reactive rules that mutate budgets and notify people
//
// An event (trigger + budget) selects enabled rules for that trigger, highest
// priority first. A rule fires when its cooldown has elapsed, its daily cap is
// not reached, and all of its conditions hold. Counters are reserved before
// the actions run, so a failing chain still consumes the cooldown and cap.
// Actions run in order; a failure without `retry_on_failure` abandons the
// rest of that rule's chain. Nothing is rolled back.
//
// Conditions see the budget as read at event time, or the snapshot the event
// carries when the store cannot be read. Only mutating actions need the store.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use super::circuit::{CircuitBreaker, TripReason};
use super::guard::Guard;
use super::rules::{evaluate_all, Condition, FieldMap, Value};
use super::templates::render;
use crate::budget::{Budget, BudgetRepository, BudgetStatus, BudgetUpdate};
use crate::infra::audit::{AuditRecord, AuditSink};
use crate::infra::config::ActionsConfig;
use crate::infra::errors::{Result, SpendGuardError};
use crate::notify::{Notification, NotificationChannel, Notifier, Severity};
use crate::util::{format_amount, format_pct};

/// Utilization levels that `check_thresholds` reports once each.
const ALERT_80: f64 = 0.8;
const ALERT_100: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    ThresholdCrossed,
    AnomalyDetected,
    CircuitTripped,
    ForecastWarning,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::ThresholdCrossed => "threshold_crossed",
            TriggerType::AnomalyDetected => "anomaly_detected",
            TriggerType::CircuitTripped => "circuit_tripped",
            TriggerType::ForecastWarning => "forecast_warning",
            TriggerType::Manual => "manual",
        }
    }

    /// Events that an open circuit makes moot.
    fn suppressed_by_open_circuit(&self) -> bool {
        matches!(self, TriggerType::ThresholdCrossed | TriggerType::ForecastWarning)
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = SpendGuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "threshold_crossed" => Ok(TriggerType::ThresholdCrossed),
            "anomaly_detected" => Ok(TriggerType::AnomalyDetected),
            "circuit_tripped" => Ok(TriggerType::CircuitTripped),
            "forecast_warning" => Ok(TriggerType::ForecastWarning),
            "manual" => Ok(TriggerType::Manual),
            other => Err(SpendGuardError::UnknownTrigger(other.to_string())),
        }
    }
}

/// What a rule does. Notification text may use `{field}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    PauseBudget,
    ResumeBudget,
    ReduceLimit {
        #[serde(default)]
        amount: Option<f64>,
        #[serde(default)]
        percentage: Option<f64>,
    },
    IncreaseLimit {
        #[serde(default)]
        amount: Option<f64>,
        #[serde(default)]
        percentage: Option<f64>,
    },
    ResetSpend,
    SetThrottleThreshold {
        threshold: f64,
    },
    BlockRequests {
        #[serde(default)]
        reason: Option<String>,
    },
    Notify {
        channel: NotificationChannel,
        #[serde(default)]
        recipient: Option<String>,
        #[serde(default)]
        subject: Option<String>,
        message: String,
    },
    Escalate {
        channel: NotificationChannel,
        recipient: String,
        message: String,
    },
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::PauseBudget => "pause_budget",
            ActionKind::ResumeBudget => "resume_budget",
            ActionKind::ReduceLimit { .. } => "reduce_limit",
            ActionKind::IncreaseLimit { .. } => "increase_limit",
            ActionKind::ResetSpend => "reset_spend",
            ActionKind::SetThrottleThreshold { .. } => "set_throttle_threshold",
            ActionKind::BlockRequests { .. } => "block_requests",
            ActionKind::Notify { .. } => "notify",
            ActionKind::Escalate { .. } => "escalate",
        }
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| Err(SpendGuardError::invalid_action(self.as_str(), msg));
        match self {
            ActionKind::ReduceLimit { amount, percentage }
            | ActionKind::IncreaseLimit { amount, percentage } => match (amount, percentage) {
                (Some(a), _) if *a >= 0.0 => Ok(()),
                (None, Some(p)) if *p >= 0.0 => Ok(()),
                _ => bad("needs a non-negative amount or percentage"),
            },
            ActionKind::SetThrottleThreshold { threshold } if !(*threshold > 0.0) => {
                bad("threshold must be positive")
            }
            ActionKind::Notify { message, .. } | ActionKind::Escalate { message, .. }
                if message.trim().is_empty() =>
            {
                bad("message is empty")
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    #[serde(flatten)]
    pub action: ActionKind,
    /// Wait before running this action.
    #[serde(default)]
    pub delay_ms: u64,
    /// Retry once on failure, then continue the chain either way.
    #[serde(default)]
    pub retry_on_failure: bool,
}

impl ActionDefinition {
    pub fn new(action: ActionKind) -> Self {
        Self {
            action,
            delay_ms: 0,
            retry_on_failure: false,
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn retrying(mut self) -> Self {
        self.retry_on_failure = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRule {
    pub id: String,
    pub name: String,
    pub trigger: TriggerType,
    /// Restrict to one budget. `None` matches every budget.
    pub budget_id: Option<String>,
    pub user_id: Option<String>,
    pub conditions: Vec<Condition>,
    pub actions: Vec<ActionDefinition>,
    pub priority: i32,
    pub enabled: bool,
    pub cooldown_minutes: u32,
    pub max_executions_per_day: u32,
    pub execution_count: u64,
    pub executions_today: u32,
    pub counter_date: NaiveDate,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Input to `ActionsManager::register_rule`. Omitted limits use config defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewActionRule {
    pub name: String,
    pub trigger: TriggerType,
    #[serde(default)]
    pub budget_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub actions: Vec<ActionDefinition>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub cooldown_minutes: Option<u32>,
    #[serde(default)]
    pub max_executions_per_day: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl NewActionRule {
    pub fn new(name: impl Into<String>, trigger: TriggerType, actions: Vec<ActionDefinition>) -> Self {
        Self {
            name: name.into(),
            trigger,
            budget_id: None,
            user_id: None,
            conditions: Vec::new(),
            actions,
            priority: 0,
            enabled: true,
            cooldown_minutes: None,
            max_executions_per_day: None,
        }
    }

    pub fn for_budget(mut self, budget_id: impl Into<String>) -> Self {
        self.budget_id = Some(budget_id.into());
        self
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_limits(mut self, cooldown_minutes: u32, max_per_day: u32) -> Self {
        self.cooldown_minutes = Some(cooldown_minutes);
        self.max_executions_per_day = Some(max_per_day);
        self
    }
}

/// Partial rule update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
    pub conditions: Option<Vec<Condition>>,
    pub actions: Option<Vec<ActionDefinition>>,
    pub cooldown_minutes: Option<u32>,
    pub max_executions_per_day: Option<u32>,
}

/// An event handed to the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionContext {
    pub trigger: TriggerType,
    pub budget_id: String,
    /// Requester behind the event. Rule scoping falls back to the budget owner.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Budget state when the event was raised, used if the store is unreadable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<Budget>,
    /// Extra fields from the event source, e.g. an anomaly score.
    #[serde(default)]
    pub data: FieldMap,
}

impl ActionContext {
    pub fn new(trigger: TriggerType, budget_id: impl Into<String>) -> Self {
        Self {
            trigger,
            budget_id: budget_id.into(),
            user_id: None,
            budget: None,
            data: FieldMap::new(),
        }
    }

    /// Event about `budget`, carrying its current state as the snapshot.
    pub fn for_budget(trigger: TriggerType, budget: &Budget) -> Self {
        Self {
            budget: Some(budget.clone()),
            ..Self::new(trigger, budget.id.clone())
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Outcome of one action within a rule's chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub rule_id: String,
    pub rule_name: String,
    pub budget_id: String,
    pub trigger: TriggerType,
    pub action: String,
    pub success: bool,
    pub previous_value: Option<String>,
    pub new_value: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
    pub executed_at: DateTime<Utc>,
}

struct ActionOutcome {
    previous: Option<String>,
    new: Option<String>,
    tripped: bool,
}

/// The budget an event is about, as far as it could be read.
struct Subject {
    id: String,
    name: String,
    /// Event requester, else the budget owner.
    user_id: Option<String>,
    budget: Option<Budget>,
}

impl Subject {
    fn resolve(event: &ActionContext, budget: Option<Budget>) -> Self {
        let user_id = event
            .user_id
            .clone()
            .or_else(|| budget.as_ref().map(|b| b.user_id.clone()));
        let name = budget
            .as_ref()
            .map(|b| b.name.clone())
            .unwrap_or_else(|| event.budget_id.clone());
        Self {
            id: event.budget_id.clone(),
            name,
            user_id,
            budget,
        }
    }
}

impl ActionOutcome {
    fn values(previous: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            previous: Some(previous.into()),
            new: Some(new.into()),
            tripped: false,
        }
    }
}

pub struct ActionsManager {
    config: RwLock<ActionsConfig>,
    repo: Arc<dyn BudgetRepository>,
    guard: Arc<Guard>,
    circuit: Arc<CircuitBreaker>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    rules: Mutex<HashMap<String, ActionRule>>,
    history: Mutex<VecDeque<ActionResult>>,
}

impl ActionsManager {
    pub fn new(
        config: ActionsConfig,
        repo: Arc<dyn BudgetRepository>,
        guard: Arc<Guard>,
        circuit: Arc<CircuitBreaker>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            repo,
            guard,
            circuit,
            notifier,
            audit,
            rules: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> ActionsConfig {
        self.config.read().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn update_config(&self, config: ActionsConfig) {
        if let Ok(mut c) = self.config.write() {
            *c = config;
        }
    }

    pub fn register_rule(&self, rule: NewActionRule) -> Result<ActionRule> {
        if rule.actions.is_empty() {
            return Err(SpendGuardError::invalid_action("rule", "has no actions"));
        }
        for def in &rule.actions {
            def.action.validate()?;
        }
        let config = self.config();
        let now = Utc::now();
        let created = ActionRule {
            id: uuid::Uuid::new_v4().to_string(),
            name: rule.name,
            trigger: rule.trigger,
            budget_id: rule.budget_id,
            user_id: rule.user_id,
            conditions: rule.conditions,
            actions: rule.actions,
            priority: rule.priority,
            enabled: rule.enabled,
            cooldown_minutes: rule
                .cooldown_minutes
                .unwrap_or(config.default_cooldown_minutes),
            max_executions_per_day: rule
                .max_executions_per_day
                .unwrap_or(config.max_actions_per_day),
            execution_count: 0,
            executions_today: 0,
            counter_date: now.date_naive(),
            last_executed_at: None,
            created_at: now,
        };
        tracing::info!(rule_id = %created.id, trigger = %created.trigger, name = %created.name, "Action rule registered");
        self.lock_rules()?.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    pub fn update_rule(&self, id: &str, update: RuleUpdate) -> Result<ActionRule> {
        if let Some(actions) = &update.actions {
            if actions.is_empty() {
                return Err(SpendGuardError::invalid_action("rule", "has no actions"));
            }
            for def in actions {
                def.action.validate()?;
            }
        }
        let mut rules = self.lock_rules()?;
        let rule = rules
            .get_mut(id)
            .ok_or_else(|| SpendGuardError::RuleNotFound { id: id.to_string() })?;
        if let Some(name) = update.name {
            rule.name = name;
        }
        if let Some(enabled) = update.enabled {
            rule.enabled = enabled;
        }
        if let Some(priority) = update.priority {
            rule.priority = priority;
        }
        if let Some(conditions) = update.conditions {
            rule.conditions = conditions;
        }
        if let Some(actions) = update.actions {
            rule.actions = actions;
        }
        if let Some(cooldown) = update.cooldown_minutes {
            rule.cooldown_minutes = cooldown;
        }
        if let Some(cap) = update.max_executions_per_day {
            rule.max_executions_per_day = cap;
        }
        Ok(rule.clone())
    }

    pub fn delete_rule(&self, id: &str) -> Result<()> {
        self.lock_rules()?
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SpendGuardError::RuleNotFound { id: id.to_string() })
    }

    pub fn get_rule(&self, id: &str) -> Option<ActionRule> {
        self.rules.lock().ok()?.get(id).cloned()
    }

    /// All rules, highest priority first.
    pub fn list_rules(&self) -> Vec<ActionRule> {
        let mut rules: Vec<ActionRule> = self
            .rules
            .lock()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        rules
    }

    /// Most recent results, newest last.
    pub fn history(&self, limit: usize) -> Vec<ActionResult> {
        self.history
            .lock()
            .map(|h| {
                let skip = h.len().saturating_sub(limit);
                h.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Emit `threshold_crossed` the first time a budget passes 80% and 100%,
    /// recording the alert flags on the budget row.
    pub async fn check_thresholds(&self, budget: &Budget) -> Vec<ActionResult> {
        let utilization = budget.utilization();
        let (update, level) = if utilization >= ALERT_100 && !budget.alert_100_sent {
            (
                BudgetUpdate {
                    alert_80_sent: Some(true),
                    alert_100_sent: Some(true),
                    ..Default::default()
                },
                ALERT_100,
            )
        } else if utilization >= ALERT_80 && !budget.alert_80_sent {
            (
                BudgetUpdate {
                    alert_80_sent: Some(true),
                    ..Default::default()
                },
                ALERT_80,
            )
        } else {
            return Vec::new();
        };

        if let Err(e) = self.repo.update_budget(&budget.id, &update).await {
            tracing::warn!(budget_id = %budget.id, "Could not record threshold alert: {e}");
            return Vec::new();
        }
        tracing::info!(budget_id = %budget.id, threshold = level, "Budget crossed alert threshold");

        let ctx = ActionContext::for_budget(TriggerType::ThresholdCrossed, budget)
            .with_data("threshold", level * 100.0);
        self.evaluate_and_execute(&ctx).await
    }

    pub async fn evaluate_and_execute(&self, ctx: &ActionContext) -> Vec<ActionResult> {
        self.evaluate_and_execute_at(ctx, Utc::now()).await
    }

    pub async fn evaluate_and_execute_at(
        &self,
        ctx: &ActionContext,
        now: DateTime<Utc>,
    ) -> Vec<ActionResult> {
        let config = self.config();
        if !config.enabled {
            return Vec::new();
        }

        let mut results = Vec::new();
        // (event, cascaded): a cascaded event never cascades again
        let mut queue = VecDeque::from([(ctx.clone(), false)]);

        while let Some((event, cascaded)) = queue.pop_front() {
            if event.trigger.suppressed_by_open_circuit()
                && self.circuit.is_open_at(&event.budget_id, now)
            {
                tracing::debug!(budget_id = %event.budget_id, trigger = %event.trigger, "Circuit open, event suppressed");
                continue;
            }

            let budget = match self.repo.get_budget(&event.budget_id).await {
                Ok(Some(b)) => Some(b),
                Ok(None) => {
                    tracing::warn!(budget_id = %event.budget_id, "Action event for unknown budget");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        budget_id = %event.budget_id,
                        has_snapshot = event.budget.is_some(),
                        "Budget unreadable, evaluating rules on event data: {e}"
                    );
                    event.budget.clone()
                }
            };

            let subject = Subject::resolve(&event, budget);
            let fields = event_fields(&event, &subject);
            for rule in self.claim_rules(&event, &subject, &fields, now) {
                let tripped = self
                    .run_chain(&rule, &event, &subject, &fields, now, &config, &mut results)
                    .await;
                if tripped && !cascaded && event.trigger != TriggerType::CircuitTripped {
                    let mut next = ActionContext::new(TriggerType::CircuitTripped, subject.id.clone());
                    next.user_id = event.user_id.clone();
                    next.budget = subject.budget.clone();
                    next.data = event.data.clone();
                    queue.push_back((next, true));
                }
            }
        }
        results
    }

    /// Select rules that fire for this event and reserve their counters.
    fn claim_rules(
        &self,
        event: &ActionContext,
        subject: &Subject,
        fields: &FieldMap,
        now: DateTime<Utc>,
    ) -> Vec<ActionRule> {
        let Ok(mut rules) = self.rules.lock() else {
            return Vec::new();
        };
        let today = now.date_naive();

        let mut candidates: Vec<&mut ActionRule> = rules
            .values_mut()
            .filter(|r| r.enabled && r.trigger == event.trigger)
            .filter(|r| r.budget_id.as_deref().is_none_or(|id| id == subject.id))
            .filter(|r| {
                r.user_id
                    .as_deref()
                    .is_none_or(|u| subject.user_id.as_deref() == Some(u))
            })
            .collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));

        let mut fired = Vec::new();
        for rule in candidates {
            if rule.counter_date != today {
                tracing::debug!(rule_id = %rule.id, "New day, daily counter reset");
                rule.executions_today = 0;
                rule.counter_date = today;
            }
            if let Some(last) = rule.last_executed_at {
                let ready_at = last + Duration::minutes(rule.cooldown_minutes as i64);
                if now < ready_at {
                    tracing::debug!(rule_id = %rule.id, ready_at = %ready_at, "Rule cooling down");
                    continue;
                }
            }
            if rule.executions_today >= rule.max_executions_per_day {
                let capped = SpendGuardError::DailyCapReached {
                    rule_id: rule.id.clone(),
                    cap: rule.max_executions_per_day,
                };
                tracing::info!(rule_id = %rule.id, "{capped}, skipped");
                continue;
            }
            if !evaluate_all(&rule.conditions, fields) {
                continue;
            }
            rule.execution_count += 1;
            rule.executions_today += 1;
            rule.last_executed_at = Some(now);
            fired.push(rule.clone());
        }
        fired
    }

    /// Run a rule's actions in order. Returns true if a `block_requests`
    /// action newly opened the circuit.
    #[allow(clippy::too_many_arguments)]
    async fn run_chain(
        &self,
        rule: &ActionRule,
        event: &ActionContext,
        subject: &Subject,
        fields: &FieldMap,
        now: DateTime<Utc>,
        config: &ActionsConfig,
        results: &mut Vec<ActionResult>,
    ) -> bool {
        tracing::info!(rule_id = %rule.id, budget_id = %subject.id, trigger = %event.trigger, "Action rule fired");
        let mut tripped = false;

        for def in &rule.actions {
            if def.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(def.delay_ms)).await;
            }

            let mut attempts = 1;
            let mut outcome = self.run_action(&def.action, rule, subject, fields).await;
            if let Err(e) = &outcome {
                if def.retry_on_failure {
                    tracing::warn!(
                        rule_id = %rule.id,
                        action = def.action.as_str(),
                        delay_ms = config.action_retry_delay_ms,
                        "Action failed, retrying once: {e}"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(
                        config.action_retry_delay_ms,
                    ))
                    .await;
                    attempts = 2;
                    outcome = self.run_action(&def.action, rule, subject, fields).await;
                }
            }

            let mut result = ActionResult {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                budget_id: subject.id.clone(),
                trigger: event.trigger,
                action: def.action.as_str().to_string(),
                success: outcome.is_ok(),
                previous_value: None,
                new_value: None,
                error: None,
                attempts,
                executed_at: now,
            };
            let abandon = match outcome {
                Ok(o) => {
                    tripped |= o.tripped;
                    result.previous_value = o.previous;
                    result.new_value = o.new;
                    false
                }
                Err(e) => {
                    result.error = Some(e.to_string());
                    if def.retry_on_failure {
                        tracing::warn!(rule_id = %rule.id, action = def.action.as_str(), "Action failed after retry, continuing: {e}");
                        false
                    } else {
                        tracing::warn!(rule_id = %rule.id, action = def.action.as_str(), "Action failed, rest of chain abandoned: {e}");
                        true
                    }
                }
            };
            self.record(result.clone(), config.history_limit);
            results.push(result);
            if abandon {
                break;
            }
        }
        tripped
    }

    async fn run_action(
        &self,
        action: &ActionKind,
        rule: &ActionRule,
        subject: &Subject,
        fields: &FieldMap,
    ) -> Result<ActionOutcome> {
        match action {
            ActionKind::PauseBudget => self.set_status(&subject.id, BudgetStatus::Paused).await,
            ActionKind::ResumeBudget => self.set_status(&subject.id, BudgetStatus::Active).await,
            ActionKind::ReduceLimit { amount, percentage } => {
                self.adjust_limit(action, &subject.id, *amount, *percentage, -1.0)
                    .await
            }
            ActionKind::IncreaseLimit { amount, percentage } => {
                self.adjust_limit(action, &subject.id, *amount, *percentage, 1.0)
                    .await
            }
            ActionKind::ResetSpend => {
                let update = BudgetUpdate {
                    current_spend: Some(0.0),
                    alert_80_sent: Some(false),
                    alert_100_sent: Some(false),
                    ..Default::default()
                };
                let change = self.repo.update_budget(&subject.id, &update).await?;
                Ok(ActionOutcome::values(
                    format_amount(change.before.current_spend),
                    format_amount(change.after.current_spend),
                ))
            }
            ActionKind::SetThrottleThreshold { threshold } => {
                let previous = self.guard.set_throttle_threshold(*threshold)?;
                Ok(ActionOutcome::values(
                    previous.to_string(),
                    threshold.to_string(),
                ))
            }
            ActionKind::BlockRequests { reason } => {
                let detail = reason
                    .as_deref()
                    .map(|r| render(r, fields))
                    .unwrap_or_else(|| format!("rule '{}'", rule.name));
                let tripped = self.circuit.trip(
                    &subject.id,
                    &subject.name,
                    TripReason::ActionRule,
                    Some(detail),
                );
                Ok(ActionOutcome {
                    previous: None,
                    new: Some("open".into()),
                    tripped,
                })
            }
            ActionKind::Notify {
                channel,
                recipient,
                subject: title,
                message,
            } => {
                let title = title
                    .as_deref()
                    .map(|s| render(s, fields))
                    .unwrap_or_else(|| format!("Budget alert: {}", subject.name));
                let mut n = Notification::new(*channel, title, render(message, fields))
                    .with_severity(Severity::Warning)
                    .with_field("budget_id", subject.id.clone());
                if let Some(budget) = &subject.budget {
                    n = n.with_field("utilization", format_pct(budget.utilization()));
                }
                if let Some(to) = recipient {
                    n = n.to(render(to, fields));
                }
                self.notifier.send(&n).await?;
                Ok(ActionOutcome {
                    previous: None,
                    new: Some(format!("sent via {channel}")),
                    tripped: false,
                })
            }
            ActionKind::Escalate {
                channel,
                recipient,
                message,
            } => {
                let n = Notification::new(
                    *channel,
                    format!("Escalation: {} ({})", rule.name, subject.name),
                    render(message, fields),
                )
                .to(render(recipient, fields))
                .with_severity(Severity::Critical)
                .with_field("budget_id", subject.id.clone())
                .with_field("rule", rule.name.clone());
                self.notifier.send(&n).await?;
                Ok(ActionOutcome {
                    previous: None,
                    new: Some(format!("escalated to {recipient}")),
                    tripped: false,
                })
            }
        }
    }

    async fn set_status(&self, budget_id: &str, status: BudgetStatus) -> Result<ActionOutcome> {
        let update = BudgetUpdate {
            status: Some(status),
            ..Default::default()
        };
        let change = self.repo.update_budget(budget_id, &update).await?;
        Ok(ActionOutcome::values(
            change.before.status.to_string(),
            change.after.status.to_string(),
        ))
    }

    /// Relative limit change, applied by the repository against the stored row.
    async fn adjust_limit(
        &self,
        action: &ActionKind,
        budget_id: &str,
        amount: Option<f64>,
        percentage: Option<f64>,
        sign: f64,
    ) -> Result<ActionOutcome> {
        action.validate()?;
        let update = match (amount, percentage) {
            (Some(a), _) => BudgetUpdate {
                limit_delta: Some(sign * a),
                ..Default::default()
            },
            (None, p) => BudgetUpdate {
                limit_percent: p.map(|p| sign * p),
                ..Default::default()
            },
        };
        let change = self.repo.update_budget(budget_id, &update).await?;
        Ok(ActionOutcome::values(
            format_amount(change.before.limit_amount),
            format_amount(change.after.limit_amount),
        ))
    }

    fn record(&self, result: ActionResult, limit: usize) {
        if let Ok(mut history) = self.history.lock() {
            while history.len() >= limit.max(1) {
                history.pop_front();
            }
            history.push_back(result.clone());
        }
        self.audit.append(AuditRecord::ActionResult(result));
    }

    fn lock_rules(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ActionRule>>> {
        self.rules
            .lock()
            .map_err(|_| SpendGuardError::Config("rule table poisoned".into()))
    }
}

/// Fields visible to rule conditions and message templates. Spend fields are
/// absent when neither the store nor the event could supply the budget.
fn event_fields(event: &ActionContext, subject: &Subject) -> FieldMap {
    let mut fields = event.data.clone();
    if let Some(budget) = &subject.budget {
        fields.insert("current_spend".into(), Value::from(budget.current_spend));
        fields.insert("limit_amount".into(), Value::from(budget.limit_amount));
        fields.insert("utilization".into(), Value::from(budget.utilization()));
        fields.insert("remaining".into(), Value::from(budget.remaining()));
    }
    if let Some(user_id) = &subject.user_id {
        fields.insert("user_id".into(), Value::from(user_id.as_str()));
    }
    fields.insert("budget_id".into(), Value::from(subject.id.as_str()));
    fields.insert("budget_name".into(), Value::from(subject.name.as_str()));
    fields.insert("trigger".into(), Value::from(event.trigger.as_str()));
    fields
}
