// tests/scheduler_test.rs — Integration test: task scheduling, retries, and concurrency

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc, Weekday};
use pretty_assertions::assert_eq;
use tokio::sync::Notify;

use spendguard::budget::memory::MemoryBudgetRepository;
use spendguard::budget::{
    Budget, BudgetChange, BudgetKey, BudgetRepository, BudgetScope, BudgetStatus, BudgetUpdate,
};
use spendguard::core::scheduler::{
    compute_next_run, ActionConfig, NewTask, ScheduleTiming, ScheduleType, Scheduler, TaskAction,
};
use spendguard::infra::audit::MemoryAuditSink;
use spendguard::infra::config::SchedulerConfig;
use spendguard::infra::errors::{Result, SpendGuardError};
use spendguard::notify::NotificationDispatcher;

fn t0() -> DateTime<Utc> {
    // A Wednesday
    Utc.with_ymd_and_hms(2025, 6, 11, 12, 30, 0).unwrap()
}

fn scheduler(repo: Arc<MemoryBudgetRepository>, config: SchedulerConfig) -> Scheduler {
    Scheduler::new(
        config,
        repo,
        Arc::new(NotificationDispatcher::new()),
        Arc::new(MemoryAuditSink::new(200)),
    )
}

fn seeded_repo() -> Arc<MemoryBudgetRepository> {
    Arc::new(MemoryBudgetRepository::with_budgets([
        Budget::new("team-a", "ops", BudgetScope::Team, 500.0).with_spend(120.0),
        Budget::new("team-b", "ops", BudgetScope::Team, 300.0).with_spend(10.0),
    ]))
}

/// Holds writes to one budget until the test releases them.
struct GatedRepository {
    inner: Arc<MemoryBudgetRepository>,
    gated_id: String,
    entered: Notify,
    release: Notify,
}

impl GatedRepository {
    fn new(inner: Arc<MemoryBudgetRepository>, gated_id: &str) -> Self {
        Self {
            inner,
            gated_id: gated_id.to_string(),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl BudgetRepository for GatedRepository {
    async fn find_active_budget(&self, key: &BudgetKey) -> Result<Option<Budget>> {
        self.inner.find_active_budget(key).await
    }

    async fn get_budget(&self, id: &str) -> Result<Option<Budget>> {
        self.inner.get_budget(id).await
    }

    async fn update_budget(&self, id: &str, update: &BudgetUpdate) -> Result<BudgetChange> {
        if id == self.gated_id {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.update_budget(id, update).await
    }
}

fn gated_scheduler(repo: Arc<GatedRepository>, config: SchedulerConfig) -> Arc<Scheduler> {
    Arc::new(Scheduler::new(
        config,
        repo,
        Arc::new(NotificationDispatcher::new()),
        Arc::new(MemoryAuditSink::new(200)),
    ))
}

/// Poll until `done` holds, failing after two seconds.
async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while !done() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within two seconds");
}

fn pause_a() -> NewTask {
    NewTask::new("team-a", "pause a", ScheduleType::Daily, TaskAction::PauseBudget, ScheduleTiming::at(13, 0))
}

fn raise_b() -> NewTask {
    NewTask::new("team-b", "raise b", ScheduleType::Daily, TaskAction::IncreaseLimit, ScheduleTiming::at(14, 0))
        .with_config(ActionConfig::amount(50.0))
}

#[test]
fn test_weekly_monday_lands_on_monday() {
    let timing = ScheduleTiming::at(9, 15).on_weekday(1);
    let next = compute_next_run(ScheduleType::Weekly, &timing, t0()).unwrap();
    assert_eq!(next.weekday(), Weekday::Mon);
    assert_eq!((next.hour(), next.minute()), (9, 15));
    assert!(next > t0());
    assert!(next - t0() <= Duration::days(7));
}

#[test]
fn test_weekly_in_offset_timezone() {
    // 09:00 at +05:30 is 03:30 UTC
    let timing = ScheduleTiming::at(9, 0).on_weekday(1).in_timezone("+05:30");
    let next = compute_next_run(ScheduleType::Weekly, &timing, t0()).unwrap();
    assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 16, 3, 30, 0).unwrap());
}

#[tokio::test]
async fn test_retries_exhausted_disables_and_freezes_next_run() {
    let config = SchedulerConfig {
        max_retries: 3,
        retry_delay_ms: 60_000,
        ..Default::default()
    };
    // Task points at a budget that does not exist, so every run fails
    let s = scheduler(seeded_repo(), config);
    let task = s
        .schedule_task_at(
            NewTask::new(
                "ghost",
                "nightly reset",
                ScheduleType::Daily,
                TaskAction::ResetSpend,
                ScheduleTiming::at(0, 0),
            ),
            t0(),
        )
        .unwrap();

    let mut now = task.next_run_at;
    for attempt in 1..=3 {
        let results = s.run_due_tasks(now).await;
        assert_eq!(results.len(), 1, "attempt {attempt}");
        assert!(!results[0].success);
        let t = s.get_task(&task.id).unwrap();
        assert_eq!(t.consecutive_failures, attempt);
        if attempt < 3 {
            assert!(t.enabled);
            assert_eq!(t.next_run_at, now + Duration::minutes(1));
            now = t.next_run_at;
        }
    }

    let frozen = s.get_task(&task.id).unwrap();
    assert!(!frozen.enabled);
    assert_eq!(frozen.failed_runs, 3);

    // Disabled tasks never run and their next run stays put
    assert!(s.run_due_tasks(now + Duration::days(2)).await.is_empty());
    assert_eq!(s.get_task(&task.id).unwrap().next_run_at, frozen.next_run_at);
}

#[tokio::test]
async fn test_reenable_resets_failures() {
    let config = SchedulerConfig {
        max_retries: 1,
        ..Default::default()
    };
    let s = scheduler(seeded_repo(), config);
    let task = s
        .schedule_task_at(
            NewTask::new("ghost", "pause", ScheduleType::Daily, TaskAction::PauseBudget, ScheduleTiming::at(6, 0)),
            t0(),
        )
        .unwrap();
    s.run_due_tasks(task.next_run_at).await;
    assert!(!s.get_task(&task.id).unwrap().enabled);

    let revived = s.set_task_enabled(&task.id, true).unwrap();
    assert!(revived.enabled);
    assert_eq!(revived.consecutive_failures, 0);
}

#[tokio::test]
async fn test_concurrency_limit_and_due_order() {
    let config = SchedulerConfig {
        max_concurrent_tasks: 2,
        ..Default::default()
    };
    let repo = seeded_repo();
    let s = scheduler(repo.clone(), config);

    let early = s
        .schedule_task_at(
            NewTask::new("team-a", "pause a", ScheduleType::Daily, TaskAction::PauseBudget, ScheduleTiming::at(13, 0)),
            t0(),
        )
        .unwrap();
    let middle = s
        .schedule_task_at(
            NewTask::new("team-b", "raise b", ScheduleType::Daily, TaskAction::IncreaseLimit, ScheduleTiming::at(14, 0))
                .with_config(ActionConfig::amount(50.0)),
            t0(),
        )
        .unwrap();
    let late = s
        .schedule_task_at(
            NewTask::new("team-a", "set a", ScheduleType::Daily, TaskAction::SetLimit, ScheduleTiming::at(15, 0))
                .with_config(ActionConfig::amount(750.0)),
            t0(),
        )
        .unwrap();

    let first = s.run_due_tasks(late.next_run_at).await;
    let mut ran: Vec<&str> = first.iter().map(|r| r.task_name.as_str()).collect();
    ran.sort();
    assert_eq!(ran, vec!["pause a", "raise b"]);
    assert_eq!(repo.snapshot("team-a").unwrap().status, BudgetStatus::Paused);
    assert_eq!(repo.snapshot("team-b").unwrap().limit_amount, 350.0);

    // The task left over runs on the next sweep
    let second = s.run_due_tasks(late.next_run_at).await;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].task_id, late.id);
    assert_eq!(repo.snapshot("team-a").unwrap().limit_amount, 750.0);

    assert_eq!(s.get_task(&early.id).unwrap().run_count, 1);
    assert_eq!(s.get_task(&middle.id).unwrap().run_count, 1);
    assert_eq!(s.history(10).len(), 3);
}

#[tokio::test]
async fn test_monthly_task_advances_a_month() {
    let s = scheduler(seeded_repo(), SchedulerConfig::default());
    let task = s
        .schedule_task_at(
            NewTask::new("team-a", "monthly reset", ScheduleType::Monthly, TaskAction::ResetSpend, ScheduleTiming::at(0, 0).on_day(1)),
            t0(),
        )
        .unwrap();
    assert_eq!(task.next_run_at, Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap());

    s.run_due_tasks(task.next_run_at).await;
    let after = s.get_task(&task.id).unwrap();
    assert_eq!(after.next_run_at, Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap());
    assert_eq!(after.last_run_at, Some(task.next_run_at));
}

#[tokio::test]
async fn test_task_in_flight_is_not_dispatched_again() {
    let repo = Arc::new(GatedRepository::new(seeded_repo(), "team-a"));
    let s = gated_scheduler(repo.clone(), SchedulerConfig::default());
    let task = s.schedule_task_at(pause_a(), t0()).unwrap();
    let due = task.next_run_at;

    let first = tokio::spawn({
        let s = Arc::clone(&s);
        async move { s.run_due_tasks(due).await }
    });
    repo.entered.notified().await;

    assert!(s.run_due_tasks(due).await.is_empty());
    assert!(matches!(
        s.run_task_now(&task.id).await,
        Err(SpendGuardError::AlreadyRunning)
    ));

    repo.release.notify_one();
    let results = first.await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    assert_eq!(s.get_task(&task.id).unwrap().run_count, 1);
    assert_eq!(s.history(10).len(), 1);

    // Released from the running set once finished
    let again = s.run_task_now(&task.id).await.unwrap();
    assert!(again.success);
}

#[tokio::test]
async fn test_slow_task_does_not_hold_up_the_loop() {
    let inner = seeded_repo();
    let repo = Arc::new(GatedRepository::new(inner.clone(), "team-a"));
    let config = SchedulerConfig {
        check_interval_ms: 10,
        ..Default::default()
    };
    let s = gated_scheduler(repo.clone(), config);
    let slow = s.schedule_task_at(pause_a(), t0()).unwrap();
    s.start().unwrap();
    repo.entered.notified().await;

    // Becomes due while the slow task is still executing
    s.schedule_task_at(raise_b(), t0()).unwrap();
    wait_until(|| s.history(10).len() == 1).await;
    assert_eq!(s.history(10)[0].task_name, "raise b");
    assert_eq!(inner.snapshot("team-b").unwrap().limit_amount, 350.0);
    assert!(matches!(
        s.run_task_now(&slow.id).await,
        Err(SpendGuardError::AlreadyRunning)
    ));

    repo.release.notify_one();
    wait_until(|| s.history(10).len() == 2).await;
    assert_eq!(inner.snapshot("team-a").unwrap().status, BudgetStatus::Paused);
    s.stop().await;
    assert!(!s.is_running());
}

#[tokio::test]
async fn test_interval_change_reaches_running_loop() {
    let repo = seeded_repo();
    let s = Arc::new(scheduler(
        repo.clone(),
        SchedulerConfig {
            check_interval_ms: 3_600_000,
            ..Default::default()
        },
    ));
    s.start().unwrap();
    // The first tick fires at start, before anything is scheduled
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    s.schedule_task_at(pause_a(), t0()).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(s.history(10).is_empty());

    s.update_config(SchedulerConfig {
        check_interval_ms: 10,
        ..Default::default()
    });
    wait_until(|| !s.history(10).is_empty()).await;
    assert_eq!(repo.snapshot("team-a").unwrap().status, BudgetStatus::Paused);
    assert_eq!(s.config().check_interval_ms, 10);
    s.stop().await;
}
