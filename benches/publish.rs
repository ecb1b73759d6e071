//! Performance benchmarks for integration-events
//!
//! Run with: cargo bench

use integration_events::{
    EventBus, EventMeta, HandlerResult, IntegrationEvent, IntegrationEventHandler, MemoryBroker,
    OutboundMessage, SubscriptionRegistry,
};
use criterion::{criterion_group, criterion_main, Criterion};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateChanged {
    #[serde(flatten)]
    meta: EventMeta,
    currency: String,
    rate: f64,
}

impl IntegrationEvent for RateChanged {
    const NAME: &'static str = "RateChanged";
    fn meta(&self) -> &EventMeta {
        &self.meta
    }
}

fn rate_changed() -> RateChanged {
    RateChanged {
        meta: EventMeta::new(),
        currency: "USD/CNY".to_string(),
        rate: 7.35,
    }
}

struct Noop;

#[async_trait::async_trait]
impl IntegrationEventHandler<RateChanged> for Noop {
    async fn handle(&self, _event: &RateChanged) -> HandlerResult {
        Ok(())
    }
}

fn bench_envelope_serialization(c: &mut Criterion) {
    let event = rate_changed();

    c.bench_function("OutboundMessage::from_event", |b| {
        b.iter(|| OutboundMessage::from_event(&event).unwrap());
    });

    let bytes = serde_json::to_vec(&event).unwrap();
    c.bench_function("envelope deserialize", |b| {
        b.iter(|| serde_json::from_slice::<RateChanged>(&bytes).unwrap());
    });
}

fn bench_registry_lookup(c: &mut Criterion) {
    let registry = SubscriptionRegistry::new();
    registry.add_subscription::<RateChanged, _, _>(|| Noop).unwrap();

    c.bench_function("registry has_subscriptions_for_event", |b| {
        b.iter(|| registry.has_subscriptions_for_event(RateChanged::NAME));
    });

    c.bench_function("registry get_handlers_for_event", |b| {
        b.iter(|| registry.get_handlers_for_event(RateChanged::NAME).unwrap());
    });
}

fn bench_memory_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let broker = MemoryBroker::new();
    let bus = EventBus::new(broker.transport("bench"));
    let event = rate_changed();

    c.bench_function("MemoryBroker publish", |b| {
        b.to_async(&rt)
            .iter(|| async { bus.publish(&event).await.unwrap() });
    });
}

fn bench_memory_publish_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("publish_throughput");
    for count in [10, 100, 1000] {
        group.bench_function(format!("{} events", count), |b| {
            b.to_async(&rt).iter(|| async {
                let broker = MemoryBroker::new();
                let bus = EventBus::new(broker.transport("bench"));
                for _ in 0..count {
                    bus.publish(&rate_changed()).await.unwrap();
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_envelope_serialization,
    bench_registry_lookup,
    bench_memory_publish,
    bench_memory_publish_throughput,
);
criterion_main!(benches);
