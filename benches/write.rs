use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ed25519_dalek::SigningKey;
use pkarr_record_relay::{
    Record, RecordService,
    cache::{CacheConfig, ResolutionCache},
    dht::MemoryDht,
    metrics::Metrics,
    service::RecordsConfig,
    store::RedbRecordStore,
};
use tokio::runtime::Runtime;

fn service() -> RecordService {
    let store = RedbRecordStore::in_memory().expect("in-memory store");
    RecordService::new(
        Arc::new(store),
        Arc::new(MemoryDht::default()),
        ResolutionCache::new(&CacheConfig::default()),
        &RecordsConfig::default(),
        Arc::new(Metrics::default()),
    )
}

fn benchmark_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_publishes");
    group.sample_size(10);
    for iters in [10_u64, 100_u64, 250_u64, 1000_u64].iter() {
        group.throughput(Throughput::Elements(*iters));
        group.bench_with_input(BenchmarkId::from_parameter(iters), iters, |b, &iters| {
            b.iter_custom(|rounds| {
                let rt = Runtime::new().unwrap();
                rt.block_on(async move {
                    let service = service();
                    let signing_key = SigningKey::from_bytes(&rand::random());
                    let mut duration = std::time::Duration::ZERO;
                    for _ in 0..rounds {
                        let records: Vec<_> = (0..iters)
                            .map(|seq| Record::new_signed(&signing_key, "bench-record", seq as i64 + 1))
                            .map(|r| (r.identifier(), r.to_response().to_bytes()))
                            .collect();
                        let start = std::time::Instant::now();
                        for (id, body) in &records {
                            service.publish(id, body).await.unwrap();
                        }
                        duration += start.elapsed();
                    }
                    service.shutdown().await;
                    duration
                })
            });
        });
    }
}

criterion_group!(benches, benchmark_publish);
criterion_main!(benches);
