// src/budget/mod.rs — Budget record and the repository contract

pub mod memory;
pub mod schema;
pub mod store;
pub mod store_server;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::infra::errors::{Result, SpendGuardError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    User,
    Team,
    Agent,
    Workflow,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    Active,
    Paused,
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = SpendGuardError;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_lowercase().as_str() {
                    $($s => Ok($ty::$variant),)+
                    other => Err(SpendGuardError::Config(format!(
                        "unknown {} '{}'",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

str_enum!(BudgetScope {
    User => "user",
    Team => "team",
    Agent => "agent",
    Workflow => "workflow",
    Global => "global",
});

str_enum!(BudgetPeriod {
    Daily => "daily",
    Weekly => "weekly",
    Monthly => "monthly",
});

str_enum!(BudgetStatus {
    Active => "active",
    Paused => "paused",
});

/// A spend limit owned by the external budget store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub scope: BudgetScope,
    pub scope_id: Option<String>,
    pub limit_amount: f64,
    pub current_spend: f64,
    pub period: BudgetPeriod,
    pub status: BudgetStatus,
    pub hard_limit: bool,
    #[serde(default)]
    pub alert_80_sent: bool,
    #[serde(default)]
    pub alert_100_sent: bool,
    pub updated_at: DateTime<Utc>,
}

impl Budget {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        scope: BudgetScope,
        limit_amount: f64,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            user_id: user_id.into(),
            scope,
            scope_id: None,
            limit_amount: limit_amount.max(0.0),
            current_spend: 0.0,
            period: BudgetPeriod::Monthly,
            status: BudgetStatus::Active,
            hard_limit: true,
            alert_80_sent: false,
            alert_100_sent: false,
            updated_at: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_scope_id(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn with_spend(mut self, spend: f64) -> Self {
        self.current_spend = spend.max(0.0);
        self
    }

    pub fn with_period(mut self, period: BudgetPeriod) -> Self {
        self.period = period;
        self
    }

    pub fn with_hard_limit(mut self, hard_limit: bool) -> Self {
        self.hard_limit = hard_limit;
        self
    }

    pub fn key(&self) -> BudgetKey {
        BudgetKey {
            user_id: self.user_id.clone(),
            scope: self.scope,
            scope_id: self.scope_id.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == BudgetStatus::Active
    }

    pub fn utilization(&self) -> f64 {
        utilization(self.current_spend, self.limit_amount)
    }

    /// Utilization if `additional` were spent on top of the current spend.
    pub fn projected_utilization(&self, additional: f64) -> f64 {
        utilization(self.current_spend + additional.max(0.0), self.limit_amount)
    }

    pub fn remaining(&self) -> f64 {
        (self.limit_amount - self.current_spend).max(0.0)
    }
}

/// `spend / limit`. A zero limit with any spend counts as unbounded overrun.
pub fn utilization(spend: f64, limit: f64) -> f64 {
    if limit > 0.0 {
        spend / limit
    } else if spend > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

/// Lookup key for the single active budget of a requester.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BudgetKey {
    pub user_id: String,
    pub scope: BudgetScope,
    pub scope_id: Option<String>,
}

impl BudgetKey {
    pub fn new(user_id: impl Into<String>, scope: BudgetScope, scope_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            scope,
            scope_id,
        }
    }
}

impl fmt::Display for BudgetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope_id {
            Some(id) => write!(f, "{}/{}:{}", self.user_id, self.scope, id),
            None => write!(f, "{}/{}", self.user_id, self.scope),
        }
    }
}

/// Partial update applied to a budget row. `None` leaves a field untouched.
///
/// `limit_delta` and `limit_percent` are relative to the stored limit and are
/// applied inside the same write, after any absolute `limit_amount`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetUpdate {
    pub limit_amount: Option<f64>,
    pub limit_delta: Option<f64>,
    /// Scales the limit by `1 + limit_percent / 100`.
    pub limit_percent: Option<f64>,
    pub current_spend: Option<f64>,
    pub period: Option<BudgetPeriod>,
    pub status: Option<BudgetStatus>,
    pub alert_80_sent: Option<bool>,
    pub alert_100_sent: Option<bool>,
}

impl BudgetUpdate {
    pub fn is_empty(&self) -> bool {
        self == &BudgetUpdate::default()
    }

    /// Apply onto an in-memory copy, clamping amounts at zero.
    pub fn apply_to(&self, budget: &mut Budget) {
        if let Some(limit) = self.limit_amount {
            budget.limit_amount = limit.max(0.0);
        }
        if let Some(delta) = self.limit_delta {
            budget.limit_amount = (budget.limit_amount + delta).max(0.0);
        }
        if let Some(pct) = self.limit_percent {
            budget.limit_amount = (budget.limit_amount + budget.limit_amount * pct / 100.0).max(0.0);
        }
        if let Some(spend) = self.current_spend {
            budget.current_spend = spend.max(0.0);
        }
        if let Some(period) = self.period {
            budget.period = period;
        }
        if let Some(status) = self.status {
            budget.status = status;
        }
        if let Some(flag) = self.alert_80_sent {
            budget.alert_80_sent = flag;
        }
        if let Some(flag) = self.alert_100_sent {
            budget.alert_100_sent = flag;
        }
        budget.updated_at = Utc::now();
    }
}

/// A budget row as it was read and as it was written by one update.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetChange {
    pub before: Budget,
    pub after: Budget,
}

/// Access to the persisted budget rows.
#[async_trait]
pub trait BudgetRepository: Send + Sync {
    /// The single active budget for a requester, if any.
    async fn find_active_budget(&self, key: &BudgetKey) -> Result<Option<Budget>>;

    async fn get_budget(&self, id: &str) -> Result<Option<Budget>>;

    /// Apply `update` atomically against the stored row.
    async fn update_budget(&self, id: &str, update: &BudgetUpdate) -> Result<BudgetChange>;
}
