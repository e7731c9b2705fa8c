// src/core/guard.rs — Admission control for metered requests
//
// Order of checks: disabled -> cached decision -> active budget -> circuit
// -> priority bypass -> per-user rules -> threshold ladder.
// Evaluation never returns an error; internal failures fail open.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use super::circuit::{CircuitBreaker, CircuitMode};
use super::decision_cache::DecisionCache;
use super::rules::{evaluate_all, Condition, FieldMap, Value};
use super::types::RequestPriority;
use crate::budget::{Budget, BudgetKey, BudgetRepository, BudgetScope};
use crate::infra::audit::{AuditRecord, AuditSink};
use crate::infra::config::GuardConfig;
use crate::infra::errors::{Result, SpendGuardError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardAction {
    Allow,
    Warn,
    Throttle,
    DowngradeModel,
    Block,
}

impl GuardAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardAction::Allow => "allow",
            GuardAction::Warn => "warn",
            GuardAction::Throttle => "throttle",
            GuardAction::DowngradeModel => "downgrade_model",
            GuardAction::Block => "block",
        }
    }

    /// Only `allow` and `warn` let the request through unchanged.
    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardAction::Allow | GuardAction::Warn)
    }
}

impl fmt::Display for GuardAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The request being admitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardContext {
    pub user_id: String,
    pub scope: BudgetScope,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub estimated_cost: f64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub priority: RequestPriority,
}

impl GuardContext {
    pub fn new(user_id: impl Into<String>, scope: BudgetScope) -> Self {
        Self {
            user_id: user_id.into(),
            scope,
            scope_id: None,
            estimated_cost: 0.0,
            model: None,
            priority: RequestPriority::Normal,
        }
    }

    pub fn with_scope_id(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost.max(0.0);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn key(&self) -> BudgetKey {
        BudgetKey::new(self.user_id.clone(), self.scope, self.scope_id.clone())
    }
}

/// Result of one evaluation. Shared behind an `Arc` once cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardDecision {
    pub action: GuardAction,
    pub allowed: bool,
    pub reason: String,
    pub utilization: Option<f64>,
    pub projected_utilization: Option<f64>,
    pub remaining: Option<f64>,
    pub budget_id: Option<String>,
    pub alternative_model: Option<String>,
    pub throttle_delay_ms: Option<u64>,
    pub rule_id: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl GuardDecision {
    pub fn new(action: GuardAction, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            action,
            allowed: action.is_allowed(),
            reason: reason.into(),
            utilization: None,
            projected_utilization: None,
            remaining: None,
            budget_id: None,
            alternative_model: None,
            throttle_delay_ms: None,
            rule_id: None,
            evaluated_at: now,
        }
    }

    fn for_budget(mut self, budget: &Budget, estimated_cost: f64) -> Self {
        self.utilization = Some(budget.utilization());
        self.projected_utilization = Some(budget.projected_utilization(estimated_cost));
        self.remaining = Some(budget.remaining());
        self.budget_id = Some(budget.id.clone());
        self
    }
}

/// A per-user predicate mapped to a guard action. Higher priority runs first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardRule {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub action: GuardAction,
    #[serde(default)]
    pub alternative_model: Option<String>,
    #[serde(default)]
    pub throttle_delay_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl GuardRule {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        action: GuardAction,
        conditions: Vec<Condition>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            user_id: user_id.into(),
            priority: 0,
            conditions,
            action,
            alternative_model: None,
            throttle_delay_ms: None,
            enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_alternative_model(mut self, model: impl Into<String>) -> Self {
        self.alternative_model = Some(model.into());
        self
    }
}

/// Evaluation counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GuardStats {
    pub evaluations: u64,
    pub cache_hits: u64,
    pub allowed: u64,
    pub blocked: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    evaluations: AtomicU64,
    cache_hits: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
    errors: AtomicU64,
}

pub struct Guard {
    config: RwLock<GuardConfig>,
    repo: Arc<dyn BudgetRepository>,
    circuit: Arc<CircuitBreaker>,
    audit: Arc<dyn AuditSink>,
    cache: Mutex<DecisionCache>,
    rules: Mutex<HashMap<String, Vec<GuardRule>>>,
    counters: Counters,
}

impl Guard {
    pub fn new(
        config: GuardConfig,
        repo: Arc<dyn BudgetRepository>,
        circuit: Arc<CircuitBreaker>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            repo,
            circuit,
            audit,
            cache: Mutex::new(DecisionCache::new()),
            rules: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> GuardConfig {
        self.config.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Replace the configuration and drop every cached decision.
    pub fn update_config(&self, config: GuardConfig) {
        if let Ok(mut c) = self.config.write() {
            *c = config;
        }
        self.invalidate_cache();
        tracing::info!("Guard configuration updated");
    }

    /// Move the throttle step within `[warn_threshold, block_threshold)`.
    /// Returns the previous value.
    pub fn set_throttle_threshold(&self, threshold: f64) -> Result<f64> {
        let mut config = self.config();
        if !(threshold >= config.warn_threshold && threshold < config.block_threshold) {
            return Err(SpendGuardError::invalid_action(
                "set_throttle_threshold",
                format!(
                    "threshold {threshold} outside [{}, {})",
                    config.warn_threshold, config.block_threshold
                ),
            ));
        }
        let previous = config.throttle_threshold;
        config.throttle_threshold = threshold;
        self.update_config(config);
        Ok(previous)
    }

    pub fn invalidate_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    pub fn add_rule(&self, rule: GuardRule) {
        let user_id = rule.user_id.clone();
        if let Ok(mut rules) = self.rules.lock() {
            let list = rules.entry(user_id.clone()).or_default();
            list.retain(|r| r.id != rule.id);
            tracing::debug!(rule_id = %rule.id, user_id = %user_id, "Guard rule added");
            list.push(rule);
            list.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
        self.invalidate_user(&user_id);
    }

    /// Remove a rule by id. Returns true if it existed.
    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut owner = None;
        if let Ok(mut rules) = self.rules.lock() {
            for (user_id, list) in rules.iter_mut() {
                let before = list.len();
                list.retain(|r| r.id != rule_id);
                if list.len() != before {
                    owner = Some(user_id.clone());
                    break;
                }
            }
            rules.retain(|_, list| !list.is_empty());
        }
        match owner {
            Some(user_id) => {
                self.invalidate_user(&user_id);
                true
            }
            None => false,
        }
    }

    /// Rules for a user, highest priority first.
    pub fn rules_for(&self, user_id: &str) -> Vec<GuardRule> {
        self.rules
            .lock()
            .ok()
            .and_then(|r| r.get(user_id).cloned())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            evaluations: self.counters.evaluations.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            blocked: self.counters.blocked.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    pub async fn evaluate(&self, ctx: &GuardContext) -> Arc<GuardDecision> {
        self.evaluate_at(ctx, Utc::now()).await
    }

    pub async fn evaluate_at(&self, ctx: &GuardContext, now: DateTime<Utc>) -> Arc<GuardDecision> {
        self.counters.evaluations.fetch_add(1, Ordering::Relaxed);
        let config = self.config();
        let key = ctx.key();

        if !config.enabled {
            return self.finish(&key, GuardDecision::new(GuardAction::Allow, "guard disabled", now));
        }

        if let Some(hit) = self.cached(&key, now) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.count_outcome(&hit);
            tracing::debug!(key = %key, action = %hit.action, "Guard cache hit");
            return hit;
        }

        let budget = match self.repo.find_active_budget(&key).await {
            Ok(Some(budget)) => budget,
            Ok(None) => {
                let decision = GuardDecision::new(GuardAction::Allow, "no budget configured", now);
                return self.cache_and_finish(&key, decision, &config, now);
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, error = %e, "Guard evaluation failed, allowing");
                return self.finish(
                    &key,
                    GuardDecision::new(GuardAction::Allow, "evaluation error", now),
                );
            }
        };

        let mode = self.circuit.status_at(&budget.id, now);
        if mode == CircuitMode::Open {
            let reason = self
                .circuit
                .state(&budget.id)
                .map(|s| s.reason.to_string())
                .unwrap_or_else(|| "tripped".into());
            let decision = GuardDecision::new(GuardAction::Block, format!("circuit open: {reason}"), now)
                .for_budget(&budget, ctx.estimated_cost);
            return self.cache_and_finish(&key, decision, &config, now);
        }

        if config.bypass_priorities.contains(&ctx.priority) {
            // Bypass is per request, so it is never cached for the key
            let decision = GuardDecision::new(
                GuardAction::Allow,
                format!("priority bypass ({})", ctx.priority),
                now,
            )
            .for_budget(&budget, ctx.estimated_cost);
            return self.finish(&key, decision);
        }

        let decision = match self.match_rule(ctx, &budget) {
            Some(rule) => {
                let mut d = GuardDecision::new(rule.action, format!("rule '{}' matched", rule.name), now)
                    .for_budget(&budget, ctx.estimated_cost);
                d.rule_id = Some(rule.id.clone());
                d.alternative_model = rule.alternative_model.clone();
                if rule.action == GuardAction::Throttle {
                    d.throttle_delay_ms = Some(
                        rule.throttle_delay_ms
                            .unwrap_or_else(|| throttle_delay(budget.utilization(), &config)),
                    );
                }
                d
            }
            None => threshold_decision(ctx, &budget, &config, now),
        };

        if mode == CircuitMode::HalfOpen {
            self.circuit
                .record_probe_at(&budget.id, decision.action != GuardAction::Block, now);
        }

        if decision.action != GuardAction::Allow {
            tracing::info!(
                budget_id = %budget.id,
                user_id = %ctx.user_id,
                action = %decision.action,
                reason = %decision.reason,
                "Guard decision"
            );
        }
        self.cache_and_finish(&key, decision, &config, now)
    }

    fn cached(&self, key: &BudgetKey, now: DateTime<Utc>) -> Option<Arc<GuardDecision>> {
        let hit = self.cache.lock().ok()?.get(key, now)?;
        // A cached decision is stale once its budget's circuit leaves closed
        if let Some(budget_id) = &hit.budget_id {
            if self.circuit.status_at(budget_id, now) != CircuitMode::Closed {
                return None;
            }
        }
        Some(hit)
    }

    fn match_rule(&self, ctx: &GuardContext, budget: &Budget) -> Option<GuardRule> {
        let rules = self.rules_for(&ctx.user_id);
        if rules.is_empty() {
            return None;
        }
        let fields = rule_fields(ctx, budget);
        rules
            .into_iter()
            .filter(|r| r.enabled)
            .find(|r| evaluate_all(&r.conditions, &fields))
    }

    fn invalidate_user(&self, user_id: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.invalidate_user(user_id);
        }
    }

    fn cache_and_finish(
        &self,
        key: &BudgetKey,
        decision: GuardDecision,
        config: &GuardConfig,
        now: DateTime<Utc>,
    ) -> Arc<GuardDecision> {
        let decision = self.finish(key, decision);
        if config.decision_cache_ttl_ms > 0 {
            let expires_at = now + Duration::milliseconds(config.decision_cache_ttl_ms as i64);
            if let Ok(mut cache) = self.cache.lock() {
                cache.insert(key.clone(), Arc::clone(&decision), expires_at);
            }
        }
        decision
    }

    fn finish(&self, key: &BudgetKey, decision: GuardDecision) -> Arc<GuardDecision> {
        self.count_outcome(&decision);
        self.audit.append(AuditRecord::GuardDecision {
            key: key.clone(),
            decision: decision.clone(),
        });
        Arc::new(decision)
    }

    fn count_outcome(&self, decision: &GuardDecision) {
        if decision.allowed {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        } else if decision.action == GuardAction::Block {
            self.counters.blocked.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Fields exposed to per-user guard rules.
fn rule_fields(ctx: &GuardContext, budget: &Budget) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("current_spend".into(), Value::from(budget.current_spend));
    fields.insert("limit_amount".into(), Value::from(budget.limit_amount));
    fields.insert("utilization".into(), Value::from(budget.utilization()));
    fields.insert(
        "projected_utilization".into(),
        Value::from(budget.projected_utilization(ctx.estimated_cost)),
    );
    fields.insert("estimated_cost".into(), Value::from(ctx.estimated_cost));
    fields.insert("remaining".into(), Value::from(budget.remaining()));
    fields.insert("budget_id".into(), Value::from(budget.id.as_str()));
    fields.insert("user_id".into(), Value::from(ctx.user_id.as_str()));
    fields.insert("priority".into(), Value::from(ctx.priority.as_str()));
    fields.insert("scope".into(), Value::from(ctx.scope.as_str()));
    if let Some(model) = &ctx.model {
        fields.insert("model".into(), Value::from(model.as_str()));
    }
    fields
}

fn threshold_decision(
    ctx: &GuardContext,
    budget: &Budget,
    config: &GuardConfig,
    now: DateTime<Utc>,
) -> GuardDecision {
    let utilization = budget.utilization();
    let projected = budget.projected_utilization(ctx.estimated_cost);
    let pct = |u: f64| format!("{:.1}%", u * 100.0);

    if budget.hard_limit && projected > config.block_threshold {
        return GuardDecision::new(
            GuardAction::Block,
            format!("projected utilization {} exceeds hard limit", pct(projected)),
            now,
        )
        .for_budget(budget, ctx.estimated_cost);
    }

    if utilization >= config.throttle_threshold {
        let cheaper = ctx
            .model
            .as_ref()
            .and_then(|m| config.model_downgrade_map.get(m))
            .filter(|alt| !alt.is_empty());
        if let Some(alt) = cheaper {
            let mut d = GuardDecision::new(
                GuardAction::DowngradeModel,
                format!("utilization {} above throttle threshold, use {alt}", pct(utilization)),
                now,
            )
            .for_budget(budget, ctx.estimated_cost);
            d.alternative_model = Some(alt.clone());
            return d;
        }
        let mut d = GuardDecision::new(
            GuardAction::Throttle,
            format!("utilization {} above throttle threshold", pct(utilization)),
            now,
        )
        .for_budget(budget, ctx.estimated_cost);
        d.throttle_delay_ms = Some(throttle_delay(utilization, config));
        return d;
    }

    if utilization >= config.warn_threshold {
        return GuardDecision::new(
            GuardAction::Warn,
            format!("utilization {} above warn threshold", pct(utilization)),
            now,
        )
        .for_budget(budget, ctx.estimated_cost);
    }

    GuardDecision::new(GuardAction::Allow, "within budget", now).for_budget(budget, ctx.estimated_cost)
}

/// Linear delay between the throttle and block thresholds.
pub fn throttle_delay(utilization: f64, config: &GuardConfig) -> u64 {
    let span = config.block_threshold - config.throttle_threshold;
    let ratio = if span > 0.0 {
        ((utilization - config.throttle_threshold) / span).clamp(0.0, 1.0)
    } else {
        1.0
    };
    (ratio * config.max_throttle_delay_ms as f64).round() as u64
}
