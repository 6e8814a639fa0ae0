use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mclock_sched::{ClientInfo, PullQueue, PullRequest, QueueConfig, ReqParams, ServiceClass};
use std::time::Duration;

fn bench_config() -> QueueConfig {
    QueueConfig {
        idle_age: Duration::from_secs(600),
        erase_age: Duration::from_secs(900),
        check_time: Duration::from_secs(360),
        system_capacity: 10_000.0,
        win_size: 30.0,
        allow_limit_break: false,
        anticipation_timeout: 0.0,
    }
}

fn client_info(id: &u32) -> ClientInfo {
    match id % 3 {
        0 => ClientInfo::new(100.0, 2.0, 500.0, ServiceClass::Reservation),
        1 => ClientInfo::new(0.0, 1.0, 200.0, ServiceClass::Burst),
        _ => ClientInfo::new(0.0, 1.0, 0.0, ServiceClass::Area),
    }
}

fn bench_add_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_request");

    group.bench_function("single_client", |b| {
        let queue: PullQueue<u32, u64> =
            PullQueue::new(client_info, bench_config()).expect("valid config");
        let mut i = 0u64;
        b.iter(|| {
            queue.add_request_at(black_box(i), 2, ReqParams::new(1, 1), i as f64 * 1e-6);
            i += 1;
        });
    });

    group.bench_function("hundred_clients", |b| {
        let queue: PullQueue<u32, u64> =
            PullQueue::new(client_info, bench_config()).expect("valid config");
        let mut i = 0u64;
        b.iter(|| {
            let client = (i % 100) as u32;
            queue.add_request_at(black_box(i), client, ReqParams::new(1, 1), i as f64 * 1e-6);
            i += 1;
        });
    });

    group.finish();
}

fn bench_add_pull_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_pull_cycle");

    group.bench_function("best_effort_turnaround", |b| {
        let queue: PullQueue<u32, u64> =
            PullQueue::new(client_info, bench_config()).expect("valid config");
        let mut i = 0u64;
        b.iter(|| {
            let now = i as f64 * 1e-6;
            queue.add_request_at(black_box(i), 2, ReqParams::new(1, 1), now);
            let pulled = queue.pull_request_at(now + 1e-6);
            assert!(matches!(pulled, PullRequest::Returning { .. }));
            i += 1;
        });
    });

    group.bench_function("thirty_clients_backlogged", |b| {
        let area = |_: &u32| ClientInfo::new(0.0, 1.0, 0.0, ServiceClass::Area);
        let queue: PullQueue<u32, u64> =
            PullQueue::new(area, bench_config()).expect("valid config");
        for i in 0..30u64 {
            queue.add_request_at(i, (i % 30) as u32, ReqParams::new(1, 1), 0.0);
        }
        let mut i = 30u64;
        b.iter(|| {
            let now = i as f64 * 1e-6;
            queue.add_request_at(black_box(i), (i % 30) as u32, ReqParams::new(1, 1), now);
            let pulled = queue.pull_request_at(now);
            assert!(matches!(pulled, PullRequest::Returning { .. }));
            i += 1;
        });
    });

    group.finish();
}

criterion_group!(benches, bench_add_request, bench_add_pull_cycle);
criterion_main!(benches);
