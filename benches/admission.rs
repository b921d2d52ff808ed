use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

use article_relay::{AdmissionController, CircuitBreaker, CircuitBreakerConfig, PolicySet, RateLimitPolicy};

fn policies() -> PolicySet {
    PolicySet::new()
        .with_global(RateLimitPolicy::fixed("global", 1_000_000, Duration::from_secs(60)).unwrap())
        .with_route("/articles", RateLimitPolicy::sliding("articles", 1_000_000, Duration::from_secs(60)).unwrap())
}

fn admission_single_client(c: &mut Criterion) {
    let controller = AdmissionController::new(policies());

    c.bench_function("admission_single_client", |b| {
        b.iter(|| black_box(controller.admit(black_box("203.0.113.7"), Some("/articles"))));
    });
}

fn admission_many_clients(c: &mut Criterion) {
    let controller = AdmissionController::new(policies());
    let clients: Vec<String> = (0..1024).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect();
    let mut next = 0usize;

    c.bench_function("admission_1024_clients", |b| {
        b.iter(|| {
            next = (next + 1) % clients.len();
            black_box(controller.admit(&clients[next], Some("/articles")))
        });
    });
}

fn breaker_permit_round_trip(c: &mut Criterion) {
    let breaker = CircuitBreaker::new("cms", CircuitBreakerConfig::default());

    c.bench_function("breaker_acquire_record_success", |b| {
        b.iter(|| {
            if let Ok(permit) = breaker.try_acquire() {
                black_box(permit.record_success());
            }
        });
    });
}

criterion_group!(benches, admission_single_client, admission_many_clients, breaker_permit_round_trip);
criterion_main!(benches);
