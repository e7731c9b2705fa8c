// src/cli/run.rs — `run` and `evaluate` commands

use std::path::Path;
use std::sync::Arc;

use crate::budget::store::Store;
use crate::budget::store_server::{spawn_store_server, StoreHandle};
use crate::core::guard::GuardContext;
use crate::infra::audit::StoreAuditSink;
use crate::infra::config::Config;
use crate::infra::daemon::{self, ControlPlane};
use crate::notify::NotificationDispatcher;

/// Open the configured SQLite store and build a control plane on top of it.
pub fn build_plane(config: &Config) -> anyhow::Result<(Arc<ControlPlane>, StoreHandle)> {
    let store = Store::open(&config.store.resolved_path())?;
    let (handle, _join) = spawn_store_server(store);
    let plane = ControlPlane::new(
        config,
        Arc::new(handle.clone()),
        Arc::new(NotificationDispatcher::from_config(&config.notifications)),
        Arc::new(StoreAuditSink::new(handle.clone())),
    );
    Ok((Arc::new(plane), handle))
}

pub async fn run_daemon(config: &Config, automation: Option<&str>) -> anyhow::Result<()> {
    let (plane, handle) = build_plane(config)?;

    if let Some(path) = automation {
        let loaded = daemon::load_automation(Path::new(path))?;
        let summary = plane.install(loaded);
        println!(
            "Loaded {} guard rule(s), {} action rule(s), {} task(s) from {}",
            summary.guard_rules, summary.action_rules, summary.tasks, path
        );
        for err in &summary.errors {
            eprintln!("  skipped: {err}");
        }
    }

    daemon::run_daemon(plane, Some(handle)).await
}

pub async fn evaluate(config: &Config, ctx: GuardContext) -> anyhow::Result<()> {
    let (plane, _handle) = build_plane(config)?;
    let decision = plane.evaluate(&ctx).await;
    println!("{}", serde_json::to_string_pretty(decision.as_ref())?);
    Ok(())
}
