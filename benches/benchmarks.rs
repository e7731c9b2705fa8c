// benches/benchmarks.rs — Performance benchmarks (criterion)
//
// Hot paths of admission control:
//   1. Condition evaluation over a request's field map
//   2. Guard evaluation, cached and uncached
//   3. Next-run computation for each schedule type

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use spendguard::budget::memory::MemoryBudgetRepository;
use spendguard::budget::{Budget, BudgetScope};
use spendguard::core::circuit::CircuitBreaker;
use spendguard::core::guard::{Guard, GuardContext};
use spendguard::core::rules::{evaluate_all, Condition, FieldMap, Operator, Value};
use spendguard::core::schedule_time::{compute_next_run, ScheduleTiming, ScheduleType};
use spendguard::infra::audit::MemoryAuditSink;
use spendguard::infra::config::{CircuitConfig, GuardConfig};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn request_fields() -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("utilization".into(), Value::from(0.87));
    fields.insert("estimated_cost".into(), Value::from(1.25));
    fields.insert("model".into(), Value::from("claude-opus"));
    fields.insert("priority".into(), Value::from("normal"));
    fields.insert("scope".into(), Value::from("team"));
    fields
}

fn conditions() -> Vec<Condition> {
    vec![
        Condition::new("utilization", Operator::Gte, 0.8),
        Condition::new(
            "estimated_cost",
            Operator::Between,
            Value::List(vec![Value::from(0.5), Value::from(5.0)]),
        ),
        Condition::new(
            "model",
            Operator::In,
            Value::List(vec!["claude-opus".into(), "gpt-4.5".into()]),
        ),
        Condition::new("scope", Operator::NotIn, Value::List(vec!["global".into()])),
    ]
}

fn guard(ttl_ms: u64) -> Guard {
    let repo = Arc::new(MemoryBudgetRepository::with_budgets((0..100).map(|i| {
        Budget::new(format!("b{i}"), format!("user-{i}"), BudgetScope::User, 100.0)
            .with_spend(i as f64)
    })));
    let audit = Arc::new(MemoryAuditSink::new(64));
    let circuit = Arc::new(CircuitBreaker::new(CircuitConfig::default(), audit.clone()));
    let config = GuardConfig {
        decision_cache_ttl_ms: ttl_ms,
        ..Default::default()
    };
    Guard::new(config, repo, circuit, audit)
}

// ─── Benchmarks ─────────────────────────────────────────────────────────────

fn bench_rules(c: &mut Criterion) {
    let fields = request_fields();
    let conditions = conditions();
    c.bench_function("rules_evaluate_all_4", |b| {
        b.iter(|| evaluate_all(black_box(&conditions), black_box(&fields)))
    });
}

fn bench_guard(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let cached = guard(60_000);
    let ctx = GuardContext::new("user-87", BudgetScope::User).with_cost(2.0);
    c.bench_function("guard_evaluate_cached", |b| {
        b.iter(|| rt.block_on(cached.evaluate(black_box(&ctx))))
    });

    let uncached = guard(0);
    c.bench_function("guard_evaluate_uncached", |b| {
        b.iter(|| rt.block_on(uncached.evaluate(black_box(&ctx))))
    });
}

fn bench_next_run(c: &mut Criterion) {
    let now = Utc.with_ymd_and_hms(2025, 1, 31, 22, 45, 0).unwrap();
    let cases = [
        (ScheduleType::Daily, ScheduleTiming::at(6, 0).in_timezone("-08:00")),
        (ScheduleType::Weekly, ScheduleTiming::at(9, 30).on_weekday(1)),
        (ScheduleType::Monthly, ScheduleTiming::at(0, 0).on_day(31)),
        (ScheduleType::Cron, ScheduleTiming::at(0, 15)),
    ];
    c.bench_function("compute_next_run_mixed", |b| {
        b.iter(|| {
            for (kind, timing) in &cases {
                let _ = compute_next_run(*kind, black_box(timing), black_box(now));
            }
        })
    });
}

criterion_group!(benches, bench_rules, bench_guard, bench_next_run);
criterion_main!(benches);
