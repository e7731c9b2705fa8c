// src/core/mod.rs — Admission control, circuit breaking, scheduling, automation

pub mod actions;
pub mod circuit;
pub mod decision_cache;
pub mod guard;
pub mod rules;
pub mod schedule_time;
pub mod scheduler;
pub mod templates;
pub mod types;
