// src/cli/inspect.rs — Read-only commands: next-run and audit

use chrono::Utc;

use crate::budget::store::Store;
use crate::core::schedule_time::{compute_next_run, parse_timezone, ScheduleTiming, ScheduleType};
use crate::infra::config::Config;
use crate::util::truncate_str;

pub fn show_next_run(schedule_type: &str, timing: ScheduleTiming) -> anyhow::Result<()> {
    let schedule_type: ScheduleType = schedule_type.parse()?;
    timing.validate(schedule_type)?;
    let next = compute_next_run(schedule_type, &timing, Utc::now())?;
    let zone = parse_timezone(&timing.timezone)?;

    println!("{}", next.to_rfc3339());
    println!("  local ({}): {}", timing.timezone, zone.format_local(next));
    Ok(())
}

pub fn show_audit(config: &Config, limit: u32) -> anyhow::Result<()> {
    let path = config.store.resolved_path();
    if !path.exists() {
        println!("No store at {}", path.display());
        return Ok(());
    }
    let store = Store::open(&path)?;
    let rows = store.query_audit(limit)?;
    if rows.is_empty() {
        println!("No audit records.");
        return Ok(());
    }
    for row in rows.iter().rev() {
        let mark = if row.success { "ok  " } else { "FAIL" };
        println!(
            "  {}  {mark}  {:<18}  {:<24}  {}",
            row.recorded_at,
            row.kind,
            truncate_str(row.subject_id.as_deref().unwrap_or("-"), 24),
            truncate_str(&row.payload, 80),
        );
    }
    Ok(())
}
