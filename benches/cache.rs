//! Cache facade benchmarks on the in-memory fallback path.
//!
//! Run with: cargo bench --bench cache

use afrikmode_cache::cache::{Cache, CacheConfig, ValueCodec};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
  tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()
    .unwrap()
}

fn bench_fallback(c: &mut Criterion) {
  let rt = create_runtime();

  let mut group = c.benchmark_group("fallback");
  group.throughput(Throughput::Elements(1));

  for codec in [ValueCodec::Json, ValueCodec::MessagePack] {
    let config = CacheConfig {
      codec,
      sweep_interval: 0,
      ..CacheConfig::default()
    };
    let cache = rt.block_on(Cache::connect(&config));
    let product = json!({
      "id": 1042,
      "name": "Ankara wrap dress",
      "price": {"amount": 18500, "currency": "NGN"},
      "tags": ["women", "dresses", "ankara"]
    });

    group.bench_function(format!("set_{}", codec), |b| {
      b.iter(|| {
        rt.block_on(async {
          black_box(cache.set("product:1042", &product).await.unwrap());
        });
      });
    });

    group.bench_function(format!("get_{}", codec), |b| {
      b.iter(|| {
        rt.block_on(async {
          black_box(cache.get::<serde_json::Value>("product:1042").await);
        });
      });
    });
  }

  group.finish();
}

criterion_group!(benches, bench_fallback);
criterion_main!(benches);
