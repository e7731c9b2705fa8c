// src/main.rs — spendguard entry point

use clap::Parser;

use spendguard::budget::BudgetScope;
use spendguard::cli::{Cli, Commands};
use spendguard::core::guard::GuardContext;
use spendguard::core::schedule_time::ScheduleTiming;
use spendguard::core::types::RequestPriority;
use spendguard::infra::config::Config;
use spendguard::infra::logger;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Falls back to defaults if no config.toml
    let config = if let Some(ref path) = cli.config {
        Config::load_from(std::path::Path::new(path))?
    } else {
        Config::load()?
    };
    logger::init_logging(&config.logging.level);

    match cli.command {
        Commands::Run { automation } => {
            spendguard::cli::run::run_daemon(&config, automation.as_deref()).await
        }
        Commands::Evaluate {
            user,
            scope,
            scope_id,
            cost,
            model,
            priority,
        } => {
            let scope: BudgetScope = scope.parse()?;
            let priority: RequestPriority = priority.parse()?;
            let mut ctx = GuardContext::new(user, scope)
                .with_cost(cost)
                .with_priority(priority);
            if let Some(scope_id) = scope_id {
                ctx = ctx.with_scope_id(scope_id);
            }
            if let Some(model) = model {
                ctx = ctx.with_model(model);
            }
            spendguard::cli::run::evaluate(&config, ctx).await
        }
        Commands::Budget { action } => spendguard::cli::budget::run_budget(action, &config).await,
        Commands::NextRun {
            schedule_type,
            hour,
            minute,
            day_of_week,
            day_of_month,
            timezone,
        } => {
            let timing = ScheduleTiming {
                hour,
                minute,
                day_of_week,
                day_of_month,
                timezone,
            };
            spendguard::cli::inspect::show_next_run(&schedule_type, timing)
        }
        Commands::Audit { limit } => spendguard::cli::inspect::show_audit(&config, limit),
    }
}
