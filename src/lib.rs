// src/lib.rs — Library root for spendguard

pub mod budget;
pub mod cli;
pub mod core;
pub mod infra;
pub mod notify;
pub mod util;
