use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use telemetry_core::{markup, BlockKind, BlockSpec, Bridge, StorySnapshot};

fn seeded_bridge(paragraphs: usize) -> Bridge {
    let mut bridge = Bridge::new();
    let mut blocks = vec![BlockSpec::plain(BlockKind::Title, "Benchmark")];
    blocks.extend(
        (0..paragraphs).map(|i| BlockSpec::plain(BlockKind::Paragraph, format!("Paragraph {i} body text."))),
    );
    bridge.seed(&blocks).unwrap();
    bridge
}

fn bench_local_edit(c: &mut Criterion) {
    let mut group = c.benchmark_group("Bridge");
    group.throughput(Throughput::Elements(1));

    group.bench_function("local_insert_text", |b| {
        let mut bridge = seeded_bridge(50);
        let key = bridge.snapshot().blocks()[1];
        b.iter(|| {
            let update = bridge
                .apply_local(|edit| edit.insert_text(key, 0, black_box("x")))
                .unwrap();
            black_box(update);
        })
    });

    group.finish();
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("Bridge");
    group.throughput(Throughput::Elements(1));

    let mut source = seeded_bridge(50);
    let state = source.encode_state();
    let key = source.snapshot().blocks()[1];
    let update = source
        .apply_local(|edit| edit.insert_text(key, 0, "typed"))
        .unwrap()
        .unwrap();

    group.bench_function("apply_remote_update", |b| {
        b.iter(|| {
            let mut dest = Bridge::new();
            dest.apply_remote(&state).unwrap();
            black_box(dest.apply_remote(black_box(&update)).unwrap());
        })
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let bridge = seeded_bridge(200);
    let tree = bridge.snapshot();
    c.bench_function("derive_story_snapshot", |b| {
        b.iter(|| black_box(StorySnapshot::derive(black_box(&tree))))
    });

    let markup = markup::render(&tree);
    c.bench_function("parse_markup", |b| b.iter(|| black_box(markup::parse(black_box(&markup)))));
}

criterion_group!(benches, bench_local_edit, bench_apply_remote, bench_snapshot);
criterion_main!(benches);
