// src/core/scheduler.rs — Time-based budget mutation jobs
//
// A background loop wakes every `check_interval_ms`, picks due tasks in
// ascending `next_run_at` order, and spawns them up to the configured
// ceiling. A task id stays in the running set until its execution finishes
// and is never dispatched twice. Failures are retried after `retry_delay_ms`;
// after `max_retries` consecutive failures the task is disabled and
// `next_run_at` is left alone. Config updates reach the loop over a watch
// channel, so a new interval applies without a restart.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

pub use super::schedule_time::{compute_next_run, ScheduleTiming, ScheduleType};
use crate::budget::{Budget, BudgetPeriod, BudgetRepository, BudgetStatus, BudgetUpdate};
use crate::infra::audit::{AuditRecord, AuditSink};
use crate::infra::config::SchedulerConfig;
use crate::infra::errors::{Result, SpendGuardError};
use crate::notify::{Notification, NotificationChannel, Notifier};
use crate::util::{format_amount, format_pct};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    IncreaseLimit,
    DecreaseLimit,
    SetLimit,
    ResetSpend,
    PauseBudget,
    ResumeBudget,
    ChangePeriod,
    SendReport,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::IncreaseLimit => "increase_limit",
            TaskAction::DecreaseLimit => "decrease_limit",
            TaskAction::SetLimit => "set_limit",
            TaskAction::ResetSpend => "reset_spend",
            TaskAction::PauseBudget => "pause_budget",
            TaskAction::ResumeBudget => "resume_budget",
            TaskAction::ChangePeriod => "change_period",
            TaskAction::SendReport => "send_report",
        }
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskAction {
    type Err = SpendGuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "increase_limit" => Ok(TaskAction::IncreaseLimit),
            "decrease_limit" => Ok(TaskAction::DecreaseLimit),
            "set_limit" => Ok(TaskAction::SetLimit),
            "reset_spend" => Ok(TaskAction::ResetSpend),
            "pause_budget" => Ok(TaskAction::PauseBudget),
            "resume_budget" => Ok(TaskAction::ResumeBudget),
            "change_period" => Ok(TaskAction::ChangePeriod),
            "send_report" => Ok(TaskAction::SendReport),
            other => Err(SpendGuardError::invalid_action(other, "unknown task action")),
        }
    }
}

/// Parameters for a task's action. Which fields matter depends on the action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    /// Absolute amount for limit changes.
    pub amount: Option<f64>,
    /// Percentage of the current limit, used when `amount` is absent.
    pub percentage: Option<f64>,
    pub period: Option<BudgetPeriod>,
    pub channel: Option<NotificationChannel>,
    pub recipient: Option<String>,
}

impl ActionConfig {
    pub fn amount(amount: f64) -> Self {
        Self {
            amount: Some(amount),
            ..Default::default()
        }
    }

    pub fn percentage(percentage: f64) -> Self {
        Self {
            percentage: Some(percentage),
            ..Default::default()
        }
    }

    /// Relative limit change, applied by the repository against the stored row.
    fn limit_change(&self, action: TaskAction, sign: f64) -> Result<BudgetUpdate> {
        match (self.amount, self.percentage) {
            (Some(a), _) if a >= 0.0 => Ok(BudgetUpdate {
                limit_delta: Some(sign * a),
                ..Default::default()
            }),
            (None, Some(p)) if p >= 0.0 => Ok(BudgetUpdate {
                limit_percent: Some(sign * p),
                ..Default::default()
            }),
            _ => Err(SpendGuardError::invalid_action(
                action.as_str(),
                "needs a non-negative amount or percentage",
            )),
        }
    }

    /// Reject configurations the action can never execute.
    pub fn validate(&self, action: TaskAction) -> Result<()> {
        match action {
            TaskAction::IncreaseLimit | TaskAction::DecreaseLimit => {
                self.limit_change(action, 1.0).map(|_| ())
            }
            TaskAction::SetLimit => match self.amount {
                Some(a) if a >= 0.0 => Ok(()),
                _ => Err(SpendGuardError::invalid_action(
                    action.as_str(),
                    "needs a non-negative amount",
                )),
            },
            TaskAction::ChangePeriod if self.period.is_none() => Err(
                SpendGuardError::invalid_action(action.as_str(), "needs a period"),
            ),
            TaskAction::SendReport if self.channel.is_none() => Err(
                SpendGuardError::invalid_action(action.as_str(), "needs a channel"),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub budget_id: String,
    pub name: String,
    pub schedule_type: ScheduleType,
    pub timing: ScheduleTiming,
    pub action: TaskAction,
    pub action_config: ActionConfig,
    pub enabled: bool,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: u32,
    pub failed_runs: u32,
    pub consecutive_failures: u32,
    pub max_runs: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// Input to `Scheduler::schedule_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub budget_id: String,
    pub name: String,
    pub schedule_type: ScheduleType,
    pub action: TaskAction,
    #[serde(default)]
    pub action_config: ActionConfig,
    #[serde(default)]
    pub timing: ScheduleTiming,
    #[serde(default)]
    pub max_runs: Option<u32>,
}

impl NewTask {
    pub fn new(
        budget_id: impl Into<String>,
        name: impl Into<String>,
        schedule_type: ScheduleType,
        action: TaskAction,
        timing: ScheduleTiming,
    ) -> Self {
        Self {
            budget_id: budget_id.into(),
            name: name.into(),
            schedule_type,
            action,
            action_config: ActionConfig::default(),
            timing,
            max_runs: None,
        }
    }

    pub fn with_config(mut self, config: ActionConfig) -> Self {
        self.action_config = config;
        self
    }

    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }
}

/// One execution attempt, kept in the bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub task_name: String,
    pub budget_id: String,
    pub action: TaskAction,
    pub success: bool,
    pub previous_value: Option<String>,
    pub new_value: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub executed_at: DateTime<Utc>,
}

pub struct Scheduler {
    config: watch::Sender<SchedulerConfig>,
    repo: Arc<dyn BudgetRepository>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    tasks: Mutex<HashMap<String, ScheduledTask>>,
    running: Mutex<HashSet<String>>,
    history: Mutex<VecDeque<TaskResult>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        repo: Arc<dyn BudgetRepository>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let (config, _) = watch::channel(config);
        Self {
            config,
            repo,
            notifier,
            audit,
            tasks: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
            history: Mutex::new(VecDeque::new()),
            stop_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config.borrow().clone()
    }

    /// Takes effect from the next tick. A running loop picks up a changed
    /// `check_interval_ms` immediately.
    pub fn update_config(&self, config: SchedulerConfig) {
        tracing::info!(interval_ms = config.check_interval_ms, "Scheduler configuration updated");
        self.config.send_replace(config);
    }

    pub fn schedule_task(&self, task: NewTask) -> Result<ScheduledTask> {
        self.schedule_task_at(task, Utc::now())
    }

    pub fn schedule_task_at(&self, task: NewTask, now: DateTime<Utc>) -> Result<ScheduledTask> {
        task.action_config.validate(task.action)?;
        let next_run_at = compute_next_run(task.schedule_type, &task.timing, now)?;

        let scheduled = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            budget_id: task.budget_id,
            name: task.name,
            schedule_type: task.schedule_type,
            timing: task.timing,
            action: task.action,
            action_config: task.action_config,
            enabled: true,
            next_run_at,
            last_run_at: None,
            run_count: 0,
            failed_runs: 0,
            consecutive_failures: 0,
            max_runs: task.max_runs,
            created_at: now,
        };
        tracing::info!(
            task_id = %scheduled.id,
            budget_id = %scheduled.budget_id,
            action = %scheduled.action,
            next_run_at = %scheduled.next_run_at,
            "Task scheduled"
        );
        self.lock_tasks()?
            .insert(scheduled.id.clone(), scheduled.clone());
        Ok(scheduled)
    }

    pub fn get_task(&self, id: &str) -> Option<ScheduledTask> {
        self.tasks.lock().ok()?.get(id).cloned()
    }

    /// Tasks ordered by next run, optionally for one budget.
    pub fn list_tasks(&self, budget_id: Option<&str>) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self
            .tasks
            .lock()
            .map(|t| {
                t.values()
                    .filter(|task| budget_id.is_none_or(|b| task.budget_id == b))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        tasks.sort_by_key(|t| t.next_run_at);
        tasks
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        self.lock_tasks()?
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SpendGuardError::TaskNotFound { id: id.to_string() })
    }

    /// Re-enabling clears the failure streak and recomputes the next run.
    pub fn set_task_enabled(&self, id: &str, enabled: bool) -> Result<ScheduledTask> {
        let now = Utc::now();
        let mut tasks = self.lock_tasks()?;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| SpendGuardError::TaskNotFound { id: id.to_string() })?;
        if enabled && !task.enabled {
            task.next_run_at = compute_next_run(task.schedule_type, &task.timing, now)?;
            task.consecutive_failures = 0;
        }
        task.enabled = enabled;
        Ok(task.clone())
    }

    /// Most recent results, newest last.
    pub fn history(&self, limit: usize) -> Vec<TaskResult> {
        self.history
            .lock()
            .map(|h| {
                let skip = h.len().saturating_sub(limit);
                h.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .map(|h| h.as_ref().is_some_and(|j| !j.is_finished()))
            .unwrap_or(false)
    }

    /// Spawn the polling loop. Errors if it is already running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let config = self.config();
        if !config.enabled {
            tracing::info!("Scheduler disabled, not starting");
            return Ok(());
        }
        let mut handle = self
            .handle
            .lock()
            .map_err(|_| SpendGuardError::Config("scheduler state poisoned".into()))?;
        if handle.as_ref().is_some_and(|j| !j.is_finished()) {
            return Err(SpendGuardError::AlreadyRunning);
        }

        let (tx, rx) = watch::channel(false);
        if let Ok(mut stop) = self.stop_tx.lock() {
            *stop = Some(tx);
        }
        *handle = Some(tokio::spawn(Arc::clone(self).run_loop(rx)));
        tracing::info!(interval_ms = config.check_interval_ms, "Scheduler started");
        Ok(())
    }

    /// Signal the loop to stop and wait for in-flight tasks to finish.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().ok().and_then(|mut s| s.take()) {
            let _ = tx.send(true);
        }
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Scheduler loop ended abnormally: {e}");
            }
            tracing::info!("Scheduler stopped");
        }
    }

    async fn run_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut config_rx = self.config.subscribe();
        let mut interval_ms = config_rx.borrow_and_update().check_interval_ms.max(1);
        let mut ticker = new_ticker(interval_ms, tokio::time::Instant::now());
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    for task in self.claim_due(now) {
                        let this = Arc::clone(&self);
                        in_flight.spawn(async move {
                            this.execute(task, now).await;
                        });
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Scheduled task aborted: {e}");
                    }
                }
                Ok(()) = config_rx.changed() => {
                    let next = config_rx.borrow_and_update().check_interval_ms.max(1);
                    if next != interval_ms {
                        tracing::info!(from_ms = interval_ms, to_ms = next, "Scheduler interval changed");
                        interval_ms = next;
                        let period = std::time::Duration::from_millis(next);
                        ticker = new_ticker(next, tokio::time::Instant::now() + period);
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        // Each execution is bounded by task_timeout_ms
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Scheduled task aborted: {e}");
            }
        }
    }

    /// Run every due task that is not already running, up to the free slots,
    /// and wait for them.
    pub async fn run_due_tasks(&self, now: DateTime<Utc>) -> Vec<TaskResult> {
        let due = self.claim_due(now);
        if due.is_empty() {
            return Vec::new();
        }
        futures::future::join_all(due.into_iter().map(|t| self.execute(t, now))).await
    }

    /// Move due tasks into the running set, oldest `next_run_at` first.
    fn claim_due(&self, now: DateTime<Utc>) -> Vec<ScheduledTask> {
        let config = self.config();
        if !config.enabled {
            return Vec::new();
        }

        let due: Vec<ScheduledTask> = {
            let Ok(tasks) = self.tasks.lock() else {
                return Vec::new();
            };
            let Ok(mut running) = self.running.lock() else {
                return Vec::new();
            };
            let mut candidates: Vec<&ScheduledTask> = tasks
                .values()
                .filter(|t| t.enabled && t.next_run_at <= now && !running.contains(&t.id))
                .collect();
            candidates.sort_by_key(|t| t.next_run_at);
            let free = config.max_concurrent_tasks.saturating_sub(running.len());
            candidates
                .into_iter()
                .take(free)
                .map(|t| {
                    running.insert(t.id.clone());
                    t.clone()
                })
                .collect()
        };
        if !due.is_empty() {
            tracing::debug!(count = due.len(), "Dispatching due tasks");
        }
        due
    }

    /// Execute a task immediately, outside its schedule.
    pub async fn run_task_now(&self, id: &str) -> Result<TaskResult> {
        let task = self
            .get_task(id)
            .ok_or_else(|| SpendGuardError::TaskNotFound { id: id.to_string() })?;
        {
            let mut running = self
                .running
                .lock()
                .map_err(|_| SpendGuardError::Config("scheduler state poisoned".into()))?;
            if !running.insert(task.id.clone()) {
                return Err(SpendGuardError::AlreadyRunning);
            }
        }
        Ok(self.execute(task, Utc::now()).await)
    }

    /// Run one task already claimed in the running set, then release it.
    async fn execute(&self, task: ScheduledTask, now: DateTime<Utc>) -> TaskResult {
        let config = self.config();
        let started = std::time::Instant::now();
        let timeout = std::time::Duration::from_millis(config.task_timeout_ms.max(1));

        let outcome = match tokio::time::timeout(timeout, self.perform(&task)).await {
            Ok(r) => r,
            Err(_) => Err(SpendGuardError::Timeout {
                task_id: task.id.clone(),
                timeout_ms: config.task_timeout_ms,
            }),
        };

        let mut result = TaskResult {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            budget_id: task.budget_id.clone(),
            action: task.action,
            success: outcome.is_ok(),
            previous_value: None,
            new_value: None,
            error: None,
            duration_ms: started.elapsed().as_millis() as u64,
            executed_at: now,
        };
        match outcome {
            Ok((previous, new)) => {
                result.previous_value = previous;
                result.new_value = new;
            }
            Err(e) => result.error = Some(e.to_string()),
        }

        self.apply_outcome(&task.id, result.success, now, &config);
        self.record(result.clone(), config.history_limit);
        if let Ok(mut running) = self.running.lock() {
            running.remove(&task.id);
        }
        result
    }

    fn apply_outcome(&self, id: &str, success: bool, now: DateTime<Utc>, config: &SchedulerConfig) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        // Deleted while running
        let Some(task) = tasks.get_mut(id) else {
            return;
        };
        task.last_run_at = Some(now);

        if success {
            task.run_count += 1;
            task.consecutive_failures = 0;
            tracing::info!(task_id = %task.id, action = %task.action, run_count = task.run_count, "Task succeeded");
            if task.schedule_type == ScheduleType::Once {
                task.enabled = false;
                tracing::info!(task_id = %task.id, "One-shot task complete, disabled");
                return;
            }
            if task.max_runs.is_some_and(|max| task.run_count >= max) {
                task.enabled = false;
                tracing::info!(task_id = %task.id, max_runs = ?task.max_runs, "Task reached max runs, disabled");
                return;
            }
            match compute_next_run(task.schedule_type, &task.timing, now) {
                Ok(next) => task.next_run_at = next,
                Err(e) => {
                    task.enabled = false;
                    tracing::error!(task_id = %task.id, "Cannot compute next run, disabled: {e}");
                }
            }
            return;
        }

        task.failed_runs += 1;
        task.consecutive_failures += 1;
        if task.consecutive_failures >= config.max_retries.max(1) {
            task.enabled = false;
            let exhausted = SpendGuardError::RetriesExhausted {
                task_id: task.id.clone(),
                attempts: task.consecutive_failures,
            };
            tracing::error!(task_id = %task.id, "{exhausted}, disabled");
        } else {
            task.next_run_at = now + Duration::milliseconds(config.retry_delay_ms as i64);
            tracing::warn!(
                task_id = %task.id,
                attempt = task.consecutive_failures,
                max_retries = config.max_retries,
                retry_at = %task.next_run_at,
                "Task failed, will retry"
            );
        }
    }

    fn record(&self, result: TaskResult, limit: usize) {
        if let Ok(mut history) = self.history.lock() {
            while history.len() >= limit.max(1) {
                history.pop_front();
            }
            history.push_back(result.clone());
        }
        self.audit.append(AuditRecord::TaskResult(result));
    }

    /// Apply the action. Returns (previous, new) values as display strings.
    async fn perform(&self, task: &ScheduledTask) -> Result<(Option<String>, Option<String>)> {
        let cfg = &task.action_config;
        let update = match task.action {
            TaskAction::IncreaseLimit => cfg.limit_change(task.action, 1.0)?,
            TaskAction::DecreaseLimit => cfg.limit_change(task.action, -1.0)?,
            TaskAction::SetLimit => {
                cfg.validate(task.action)?;
                BudgetUpdate {
                    limit_amount: cfg.amount,
                    ..Default::default()
                }
            }
            TaskAction::ResetSpend => BudgetUpdate {
                current_spend: Some(0.0),
                alert_80_sent: Some(false),
                alert_100_sent: Some(false),
                ..Default::default()
            },
            TaskAction::PauseBudget => BudgetUpdate {
                status: Some(BudgetStatus::Paused),
                ..Default::default()
            },
            TaskAction::ResumeBudget => BudgetUpdate {
                status: Some(BudgetStatus::Active),
                ..Default::default()
            },
            TaskAction::ChangePeriod => BudgetUpdate {
                period: Some(cfg.period.ok_or_else(|| {
                    SpendGuardError::invalid_action(task.action.as_str(), "needs a period")
                })?),
                ..Default::default()
            },
            TaskAction::SendReport => {
                let budget = self.repo.get_budget(&task.budget_id).await?.ok_or_else(|| {
                    SpendGuardError::BudgetNotFound {
                        id: task.budget_id.clone(),
                    }
                })?;
                let sent_to = self.send_report(task, &budget).await?;
                return Ok((None, Some(sent_to)));
            }
        };

        let change = self.repo.update_budget(&task.budget_id, &update).await?;
        Ok((
            Some(changed_value(task.action, &change.before)),
            Some(changed_value(task.action, &change.after)),
        ))
    }

    async fn send_report(&self, task: &ScheduledTask, budget: &Budget) -> Result<String> {
        let cfg = &task.action_config;
        let channel = cfg.channel.ok_or_else(|| {
            SpendGuardError::invalid_action(task.action.as_str(), "needs a channel")
        })?;
        let mut notification = Notification::new(
            channel,
            format!("Spend report: {}", budget.name),
            format!(
                "{} has spent {} of {} ({}) this {} period.",
                budget.name,
                format_amount(budget.current_spend),
                format_amount(budget.limit_amount),
                format_pct(budget.utilization()),
                budget.period,
            ),
        )
        .with_field("budget_id", budget.id.clone())
        .with_field("status", budget.status.to_string())
        .with_field("remaining", format_amount(budget.remaining()));
        if let Some(to) = &cfg.recipient {
            notification = notification.to(to.clone());
        }
        self.notifier.send(&notification).await?;
        Ok(format!("report sent via {channel}"))
    }

    fn lock_tasks(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ScheduledTask>>> {
        self.tasks
            .lock()
            .map_err(|_| SpendGuardError::Config("scheduler state poisoned".into()))
    }
}

/// The budget field a task action writes, as a display string.
fn changed_value(action: TaskAction, budget: &Budget) -> String {
    match action {
        TaskAction::IncreaseLimit | TaskAction::DecreaseLimit | TaskAction::SetLimit => {
            format_amount(budget.limit_amount)
        }
        TaskAction::ResetSpend => format_amount(budget.current_spend),
        TaskAction::PauseBudget | TaskAction::ResumeBudget => budget.status.to_string(),
        TaskAction::ChangePeriod => budget.period.to_string(),
        TaskAction::SendReport => String::new(),
    }
}

/// First tick at `start`, then every `interval_ms`.
fn new_ticker(interval_ms: u64, start: tokio::time::Instant) -> tokio::time::Interval {
    let mut ticker =
        tokio::time::interval_at(start, std::time::Duration::from_millis(interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::memory::MemoryBudgetRepository;
    use crate::budget::BudgetScope;
    use crate::infra::audit::MemoryAuditSink;
    use crate::notify::NotificationDispatcher;
    use chrono::TimeZone;

    fn scheduler(repo: Arc<MemoryBudgetRepository>) -> Scheduler {
        Scheduler::new(
            SchedulerConfig::default(),
            repo,
            Arc::new(NotificationDispatcher::new()),
            Arc::new(MemoryAuditSink::new(50)),
        )
    }

    fn repo() -> Arc<MemoryBudgetRepository> {
        Arc::new(MemoryBudgetRepository::with_budgets([Budget::new(
            "b1",
            "u1",
            BudgetScope::User,
            100.0,
        )
        .with_spend(40.0)]))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_action_config_validation() {
        assert!(ActionConfig::default().validate(TaskAction::SetLimit).is_err());
        assert!(ActionConfig::amount(5.0).validate(TaskAction::SetLimit).is_ok());
        assert!(ActionConfig::percentage(10.0)
            .validate(TaskAction::IncreaseLimit)
            .is_ok());
        assert!(ActionConfig::amount(-1.0)
            .validate(TaskAction::DecreaseLimit)
            .is_err());
        assert!(ActionConfig::default().validate(TaskAction::ChangePeriod).is_err());
        assert!(ActionConfig::default().validate(TaskAction::PauseBudget).is_ok());
    }

    #[test]
    fn test_schedule_rejects_bad_timing() {
        let s = scheduler(repo());
        let task = NewTask::new(
            "b1",
            "weekly",
            ScheduleType::Weekly,
            TaskAction::ResetSpend,
            ScheduleTiming::at(9, 0),
        );
        assert!(matches!(
            s.schedule_task(task),
            Err(SpendGuardError::InvalidSchedule(_))
        ));
    }

    #[tokio::test]
    async fn test_percentage_increase_records_values() {
        let repo = repo();
        let s = scheduler(repo.clone());
        let task = s
            .schedule_task_at(
                NewTask::new(
                    "b1",
                    "bump",
                    ScheduleType::Daily,
                    TaskAction::IncreaseLimit,
                    ScheduleTiming::at(9, 0),
                )
                .with_config(ActionConfig::percentage(10.0)),
                t0(),
            )
            .unwrap();
        let results = s.run_due_tasks(task.next_run_at).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(results[0].previous_value.as_deref(), Some("100.00"));
        assert_eq!(results[0].new_value.as_deref(), Some("110.00"));
        assert_eq!(repo.snapshot("b1").unwrap().limit_amount, 110.0);

        let after = s.get_task(&task.id).unwrap();
        assert_eq!(after.run_count, 1);
        assert_eq!(after.next_run_at, task.next_run_at + Duration::days(1));
    }

    #[tokio::test]
    async fn test_reset_spend_clears_alert_flags() {
        let repo = repo();
        let mut flagged = repo.snapshot("b1").unwrap();
        flagged.alert_80_sent = true;
        flagged.alert_100_sent = true;
        repo.insert(flagged);
        let s = scheduler(repo.clone());
        let task = s
            .schedule_task_at(
                NewTask::new("b1", "reset", ScheduleType::Once, TaskAction::ResetSpend, ScheduleTiming::at(9, 0)),
                t0(),
            )
            .unwrap();
        s.run_due_tasks(task.next_run_at).await;
        let b = repo.snapshot("b1").unwrap();
        assert_eq!(b.current_spend, 0.0);
        assert!(!b.alert_80_sent && !b.alert_100_sent);
        // One-shot tasks disable after success
        assert!(!s.get_task(&task.id).unwrap().enabled);
    }

    #[tokio::test]
    async fn test_not_due_tasks_skipped() {
        let s = scheduler(repo());
        let task = s
            .schedule_task_at(
                NewTask::new("b1", "pause", ScheduleType::Daily, TaskAction::PauseBudget, ScheduleTiming::at(9, 0)),
                t0(),
            )
            .unwrap();
        assert!(s.run_due_tasks(task.next_run_at - Duration::seconds(1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_max_runs_disables() {
        let s = scheduler(repo());
        let task = s
            .schedule_task_at(
                NewTask::new("b1", "pause", ScheduleType::Daily, TaskAction::PauseBudget, ScheduleTiming::at(9, 0))
                    .with_max_runs(1),
                t0(),
            )
            .unwrap();
        s.run_due_tasks(task.next_run_at).await;
        assert!(!s.get_task(&task.id).unwrap().enabled);
    }

    #[tokio::test]
    async fn test_send_report_without_transport_fails() {
        let s = scheduler(repo());
        let task = s
            .schedule_task_at(
                NewTask::new("b1", "report", ScheduleType::Daily, TaskAction::SendReport, ScheduleTiming::at(9, 0))
                    .with_config(ActionConfig {
                        channel: Some(NotificationChannel::Email),
                        ..Default::default()
                    }),
                t0(),
            )
            .unwrap();
        let results = s.run_due_tasks(task.next_run_at).await;
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("no transport"));
        assert_eq!(s.get_task(&task.id).unwrap().failed_runs, 1);
    }

    #[tokio::test]
    async fn test_list_delete_and_enable() {
        let s = scheduler(repo());
        let a = s
            .schedule_task(NewTask::new("b1", "a", ScheduleType::Cron, TaskAction::PauseBudget, ScheduleTiming::at(0, 5)))
            .unwrap();
        s.schedule_task(NewTask::new("b2", "b", ScheduleType::Daily, TaskAction::ResumeBudget, ScheduleTiming::at(1, 0)))
            .unwrap();
        assert_eq!(s.list_tasks(None).len(), 2);
        assert_eq!(s.list_tasks(Some("b1")).len(), 1);

        let disabled = s.set_task_enabled(&a.id, false).unwrap();
        assert!(!disabled.enabled);
        assert!(s.set_task_enabled(&a.id, true).unwrap().enabled);

        s.delete_task(&a.id).unwrap();
        assert!(matches!(
            s.delete_task(&a.id),
            Err(SpendGuardError::TaskNotFound { .. })
        ));
        assert!(s.run_task_now("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_start_twice_is_error_and_stop_ends_loop() {
        let s = Arc::new(scheduler(repo()));
        s.start().unwrap();
        assert!(s.is_running());
        assert!(matches!(s.start(), Err(SpendGuardError::AlreadyRunning)));
        s.stop().await;
        assert!(!s.is_running());
    }
}
