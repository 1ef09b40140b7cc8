// Criterion benchmarks for switchyard-control
//
// Run benchmarks with:
//   cargo bench -p switchyard-control

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Runtime;

use switchyard_common::methods::{HeartbeatParams, RankedCandidate, RouteConnectionParams};
use switchyard_common::{InstanceId, ModuleType, RegisterModuleRequest, Route};
use switchyard_control::router::rank;
use switchyard_control::testing::MockModuleClient;
use switchyard_control::{ControlPlane, ControlPlaneConfig, MemoryAuditSink};

const ALB: ModuleType = ModuleType::ApplicationBalancer;

fn populated(rt: &Runtime, instances: usize, cache_ttl_ms: u64) -> ControlPlane {
    rt.block_on(async {
        let mut config = ControlPlaneConfig {
            routes: vec![Route::new("tcp:443".parse().unwrap(), ALB, 50)],
            ..Default::default()
        };
        config.routing.can_handle_cache_ttl_ms = cache_ttl_ms;
        let modules = Arc::new(MockModuleClient::new());
        let control = ControlPlane::builder(config, modules.clone())
            .audit_sink(Arc::new(MemoryAuditSink::new(16)))
            .without_background_tasks()
            .start()
            .await
            .unwrap();

        for i in 0..instances {
            let address = format!("10.0.{}.{}:9000", i / 250, i % 250);
            modules.answer(&address, (i % 100) as u8, (i % 10) as f64 / 10.0);
            let registered = control
                .register_module(RegisterModuleRequest {
                    instance_id: None,
                    module_type: ALB,
                    address,
                    capabilities: vec!["tcp:443".parse().unwrap()],
                    version: "v1".into(),
                })
                .await
                .unwrap();
            control
                .heartbeat(HeartbeatParams {
                    instance_id: registered.instance_id,
                    load: 0.3,
                    custom_metrics: HashMap::new(),
                })
                .await
                .unwrap();
        }
        control
    })
}

fn bench_route_connection(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("route_connection");

    for count in [1usize, 4, 16, 64].iter() {
        let control = populated(&rt, *count, 60_000);
        group.bench_with_input(BenchmarkId::new("cached", count), count, |b, _| {
            let mut connection_id = 0u64;
            b.iter(|| {
                connection_id += 1;
                let decision = rt.block_on(control.route_connection(RouteConnectionParams {
                    pattern: "tcp:443".parse().unwrap(),
                    connection_id: Some(connection_id),
                }));
                black_box(decision.unwrap());
            });
        });
    }

    let control = populated(&rt, 16, 0);
    group.bench_function("uncached_16", |b| {
        b.iter(|| {
            let decision = rt.block_on(control.route_connection(RouteConnectionParams {
                pattern: "tcp:443".parse().unwrap(),
                connection_id: Some(1),
            }));
            black_box(decision.unwrap());
        });
    });

    group.finish();
}

fn bench_rank(c: &mut Criterion) {
    let mut group = c.benchmark_group("rank");

    for count in [4usize, 64, 512].iter() {
        let candidates: Vec<RankedCandidate> = (0..*count)
            .map(|i| RankedCandidate {
                instance_id: InstanceId::new(format!("alb-{:06}", i)),
                module_type: ALB,
                address: String::new(),
                version: "v1".into(),
                priority: (i * 37 % 101) as u8,
                load: (i % 13) as f64 / 13.0,
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(count), &candidates, |b, candidates| {
            b.iter(|| {
                let mut list = candidates.clone();
                rank(black_box(&mut list));
                black_box(list);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_route_connection, bench_rank);
criterion_main!(benches);
