use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use tavern_core::{SharedText, TextEdit, TextId};

fn bench_local_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("Shared text");
    group.throughput(Throughput::Elements(1));

    group.bench_function("append_char", |b| {
        let mut text = SharedText::new();
        let id = TextId::from("bench");
        let mut index = 0u32;
        b.iter(|| {
            let update = text
                .edit(
                    &id,
                    &TextEdit::Insert {
                        index,
                        chunk: "a".to_string(),
                    },
                )
                .unwrap();
            index += 1;
            black_box(update);
        })
    });

    group.finish();
}

fn bench_catch_up(c: &mut Criterion) {
    let mut group = c.benchmark_group("Shared text");

    let mut source = SharedText::new();
    let id = TextId::from("bench");
    for i in 0..1_000u32 {
        source
            .edit(
                &id,
                &TextEdit::Insert {
                    index: i,
                    chunk: "x".to_string(),
                },
            )
            .unwrap();
    }
    let empty = SharedText::new().state_vector();

    group.bench_function("diff_and_apply_1000", |b| {
        b.iter(|| {
            let diff = source.diff(black_box(&empty)).unwrap();
            let mut replica = SharedText::new();
            replica.apply_update(&diff).unwrap();
            black_box(replica);
        })
    });

    group.finish();
}

criterion_group!(benches, bench_local_insert, bench_catch_up);
criterion_main!(benches);
