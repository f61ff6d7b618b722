use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use taskflow_core::{Entity, EntityKind, EntityStore, Patch, Reconciler, RemoteChange, StoreConfig};

fn notification(i: usize) -> Entity {
    Entity::new(EntityKind::Notification, format!("n{i}"))
        .with_field("read", i % 2 == 0)
        .with_field("title", "Task assigned to you")
}

fn bench_store_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("Store");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_with_eviction_10k", |b| {
        let mut store = EntityStore::new(StoreConfig {
            capacity: 10_000,
            ..StoreConfig::default()
        });
        let mut i = 0usize;
        // Keeps the store at capacity so each set also evicts.
        b.iter(|| {
            store.set(black_box(notification(i)));
            i += 1;
        })
    });

    group.bench_function("unread_count_10k", |b| {
        let mut store = EntityStore::default();
        for i in 0..10_000 {
            store.set(notification(i));
        }
        b.iter(|| black_box(store.unread_count()))
    });

    group.finish();
}

fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("Reconciler");
    group.throughput(Throughput::Elements(1));

    group.bench_function("edit_then_echo", |b| {
        let mut rec = Reconciler::new(EntityStore::default());
        rec.apply_remote(RemoteChange::upsert(notification(1)));
        b.iter(|| {
            let ticket = rec
                .begin_edit(EntityKind::Notification, "n1", Patch::new().set("read", true))
                .unwrap();
            let echo = notification(1).with_field("read", true);
            black_box(rec.apply_remote(RemoteChange::Upsert {
                entity: echo,
                origin: Some(ticket.edit_id()),
            }));
        })
    });

    group.finish();
}

criterion_group!(benches, bench_store_set, bench_reconcile);
criterion_main!(benches);
