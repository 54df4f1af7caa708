use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ip_guard_service::core::memory::MemoryCounterStore;
use ip_guard_service::core::{Clock, RateLimitKey, RateLimiter, SystemClock};
use ip_guard_service::models::{RateLimitConfig, WindowPolicy};

fn rate_limiter_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let limiter = RateLimiter::new(
        Arc::new(MemoryCounterStore::new(clock.clone())),
        clock,
        RateLimitConfig::default(),
    );

    // A large budget keeps every check on the admit path.
    let admit_policy = WindowPolicy::new(u32::MAX, 60);
    let mut n: u32 = 0;
    c.bench_function("rate_limiter_admit_distinct_keys", |b| {
        b.iter(|| {
            n = n.wrapping_add(1);
            let key = RateLimitKey::anonymous(IpAddr::V4(Ipv4Addr::from(n)));
            black_box(rt.block_on(limiter.check_rate_limit(&key, admit_policy)).unwrap())
        })
    });

    let hot_key = RateLimitKey::anonymous(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
    let reject_policy = WindowPolicy::new(5, 60);
    c.bench_function("rate_limiter_reject_full_window", |b| {
        b.iter(|| black_box(rt.block_on(limiter.allow_with(&hot_key, reject_policy))))
    });
}

criterion_group!(benches, rate_limiter_benchmark);
criterion_main!(benches);
