// src/cli/mod.rs — CLI definition (clap derive)

pub mod budget;
pub mod inspect;
pub mod run;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "spendguard", about = "Budget enforcement and automation control plane", version)]
pub struct Cli {
    /// Config file path
    #[arg(long)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon: scheduler, threshold sweeps, automation rules
    Run {
        /// JSON file with guard rules, action rules and scheduled tasks
        #[arg(long)]
        automation: Option<String>,
    },
    /// Evaluate one request against its budget and print the decision
    Evaluate {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "user")]
        scope: String,
        #[arg(long)]
        scope_id: Option<String>,
        /// Estimated cost of the request
        #[arg(long, default_value = "0")]
        cost: f64,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value = "normal")]
        priority: String,
    },
    /// Maintain budgets in the local store
    Budget {
        #[command(subcommand)]
        action: BudgetAction,
    },
    /// Print the next run time for a schedule
    NextRun {
        /// once, daily, weekly, monthly or cron
        #[arg(long = "type")]
        schedule_type: String,
        #[arg(long, default_value = "0")]
        hour: u32,
        #[arg(long, default_value = "0")]
        minute: u32,
        /// 0 = Sunday .. 6 = Saturday
        #[arg(long)]
        day_of_week: Option<u32>,
        #[arg(long)]
        day_of_month: Option<u32>,
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },
    /// Show recent audit records
    Audit {
        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

#[derive(Subcommand, Clone)]
pub enum BudgetAction {
    /// Add a budget
    Add {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "user")]
        scope: String,
        #[arg(long)]
        scope_id: Option<String>,
        #[arg(long)]
        limit: f64,
        #[arg(long, default_value = "0")]
        spend: f64,
        #[arg(long, default_value = "monthly")]
        period: String,
        /// Only warn and throttle, never block on thresholds
        #[arg(long)]
        soft: bool,
    },
    /// List budgets
    List,
    /// Show one budget as JSON
    Show { id: String },
}
