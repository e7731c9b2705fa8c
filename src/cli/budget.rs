// src/cli/budget.rs — Budget maintenance commands

use crate::budget::store::Store;
use crate::budget::{Budget, BudgetPeriod, BudgetScope};
use crate::cli::BudgetAction;
use crate::infra::config::Config;
use crate::util::{format_amount, format_pct, truncate_str};

pub async fn run_budget(action: BudgetAction, config: &Config) -> anyhow::Result<()> {
    let store = Store::open(&config.store.resolved_path())?;

    match action {
        BudgetAction::Add {
            id,
            name,
            user,
            scope,
            scope_id,
            limit,
            spend,
            period,
            soft,
        } => {
            if limit < 0.0 {
                anyhow::bail!("--limit must be non-negative");
            }
            let scope: BudgetScope = scope.parse()?;
            let period: BudgetPeriod = period.parse()?;
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let mut budget = Budget::new(&id, user, scope, limit)
                .with_spend(spend)
                .with_period(period)
                .with_hard_limit(!soft);
            if let Some(name) = name {
                budget = budget.with_name(name);
            }
            if let Some(scope_id) = scope_id {
                budget = budget.with_scope_id(scope_id);
            }
            store.insert_budget(&budget)?;
            println!("Added budget {id}");
        }
        BudgetAction::List => {
            let budgets = store.list_budgets()?;
            if budgets.is_empty() {
                println!("No budgets.");
                return Ok(());
            }
            println!(
                "  {:<36}  {:<20}  {:<8}  {:>10}  {:>10}  {:>10}  STATUS",
                "ID", "NAME", "SCOPE", "SPEND", "LIMIT", "USED"
            );
            for b in &budgets {
                println!(
                    "  {:<36}  {:<20}  {:<8}  {:>10}  {:>10}  {:>10}  {}",
                    truncate_str(&b.id, 36),
                    truncate_str(&b.name, 20),
                    b.scope,
                    format_amount(b.current_spend),
                    format_amount(b.limit_amount),
                    format_pct(b.utilization()),
                    b.status,
                );
            }
        }
        BudgetAction::Show { id } => match store.get_budget(&id)? {
            Some(budget) => println!("{}", serde_json::to_string_pretty(&budget)?),
            None => anyhow::bail!("budget '{id}' not found"),
        },
    }
    Ok(())
}
