// src/infra/daemon/mod.rs — Composition root and long-running daemon
//
// ControlPlane wires the circuit breaker, guard, scheduler, and actions
// manager around one repository, notifier, and audit sink. run_daemon starts
// the scheduler, sweeps budgets for threshold alerts, and stops on Ctrl+C.

pub mod automation;
pub mod process;

use std::sync::Arc;
use std::time::Duration;

use crate::budget::store_server::StoreHandle;
use crate::budget::BudgetRepository;
use crate::core::actions::ActionsManager;
use crate::core::circuit::CircuitBreaker;
use crate::core::guard::{Guard, GuardContext, GuardDecision};
use crate::core::scheduler::Scheduler;
use crate::infra::audit::AuditSink;
use crate::infra::config::Config;
use crate::notify::Notifier;

pub use automation::{load_automation, parse_automation, Automation, InstallSummary};

pub struct ControlPlane {
    pub repo: Arc<dyn BudgetRepository>,
    pub circuit: Arc<CircuitBreaker>,
    pub guard: Arc<Guard>,
    pub scheduler: Arc<Scheduler>,
    pub actions: Arc<ActionsManager>,
    pub audit: Arc<dyn AuditSink>,
}

impl ControlPlane {
    pub fn new(
        config: &Config,
        repo: Arc<dyn BudgetRepository>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let circuit = Arc::new(CircuitBreaker::new(config.circuit.clone(), audit.clone()));
        let guard = Arc::new(Guard::new(
            config.guard.clone(),
            repo.clone(),
            circuit.clone(),
            audit.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            repo.clone(),
            notifier.clone(),
            audit.clone(),
        ));
        let actions = Arc::new(ActionsManager::new(
            config.actions.clone(),
            repo.clone(),
            guard.clone(),
            circuit.clone(),
            notifier,
            audit.clone(),
        ));
        Self {
            repo,
            circuit,
            guard,
            scheduler,
            actions,
            audit,
        }
    }

    pub async fn evaluate(&self, ctx: &GuardContext) -> Arc<GuardDecision> {
        self.guard.evaluate(ctx).await
    }

    /// Hot-swap every component's section.
    pub fn update_config(&self, config: &Config) {
        self.circuit.update_config(config.circuit.clone());
        self.guard.update_config(config.guard.clone());
        self.scheduler.update_config(config.scheduler.clone());
        self.actions.update_config(config.actions.clone());
    }

    /// Register rules and tasks. Bad entries are reported, not fatal.
    pub fn install(&self, automation: Automation) -> InstallSummary {
        let mut summary = InstallSummary {
            errors: automation.errors,
            ..Default::default()
        };
        for rule in automation.guard_rules {
            self.guard.add_rule(rule);
            summary.guard_rules += 1;
        }
        for rule in automation.action_rules {
            let name = rule.name.clone();
            match self.actions.register_rule(rule) {
                Ok(_) => summary.action_rules += 1,
                Err(e) => summary.errors.push(format!("action rule '{name}': {e}")),
            }
        }
        for task in automation.tasks {
            let name = task.name.clone();
            match self.scheduler.schedule_task(task) {
                Ok(_) => summary.tasks += 1,
                Err(e) => summary.errors.push(format!("task '{name}': {e}")),
            }
        }
        for err in &summary.errors {
            tracing::warn!("Automation entry skipped: {err}");
        }
        summary
    }

    /// Emit threshold alerts for every stored budget that crossed one.
    pub async fn sweep_thresholds(&self, store: &StoreHandle) -> usize {
        let budgets = match store.list_budgets().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("Threshold sweep skipped: {e}");
                return 0;
            }
        };
        let mut fired = 0;
        for budget in budgets.iter().filter(|b| b.is_active()) {
            fired += self.actions.check_thresholds(budget).await.len();
        }
        fired
    }
}

/// Run until Ctrl+C. With a store handle, budgets are swept for threshold
/// alerts on every scheduler interval.
pub async fn run_daemon(plane: Arc<ControlPlane>, store: Option<StoreHandle>) -> anyhow::Result<()> {
    if process::is_daemon_running() {
        anyhow::bail!("another spendguard daemon is already running");
    }
    let _pid = process::PidFile::create()?;
    tracing::info!("spendguard daemon starting");

    plane.scheduler.start()?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let interval_ms = plane.scheduler.config().check_interval_ms.max(1_000);
    let mut sweep = tokio::time::interval(Duration::from_millis(interval_ms));
    sweep.tick().await;

    println!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                if let Some(store) = &store {
                    let fired = plane.sweep_thresholds(store).await;
                    if fired > 0 {
                        tracing::info!(actions = fired, "Threshold sweep executed actions");
                    }
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    plane.scheduler.stop().await;
    tracing::info!("spendguard daemon stopped");
    Ok(())
}
