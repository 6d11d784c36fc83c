use criterion::{criterion_group, criterion_main, Criterion};
use ginger_core::reconcile;
use ginger_core::{Document, KeyPath, Sequence, SetOptions};
use serde_json::json;
use std::hint::black_box;

fn ids(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}{}", prefix, i)).collect()
}

fn bench_plan_identical(c: &mut Criterion) {
    let remote = ids("i", 1_000);
    let local: Vec<(String, bool)> = remote.iter().map(|id| (id.clone(), false)).collect();

    c.bench_function("reconcile_plan_identical_1K", |b| {
        b.iter(|| black_box(reconcile::plan(black_box(&local), black_box(&remote))))
    });
}

fn bench_plan_divergent(c: &mut Criterion) {
    let remote = ids("i", 1_000);
    // Every third item missing locally, plus pending items sprinkled in.
    let local: Vec<(String, bool)> = remote
        .iter()
        .enumerate()
        .filter(|(n, _)| n % 3 != 0)
        .flat_map(|(n, id)| {
            let mut out = vec![(id.clone(), false)];
            if n % 10 == 0 {
                out.push((format!("pending{}", n), true));
            }
            out
        })
        .collect();

    c.bench_function("reconcile_plan_divergent_1K", |b| {
        b.iter(|| black_box(reconcile::plan(black_box(&local), black_box(&remote))))
    });
}

fn bench_sequence_push(c: &mut Criterion) {
    c.bench_function("sequence_push_1K", |b| {
        b.iter(|| {
            let seq = Sequence::empty(KeyPath::from(["parade", "1", "animals"]));
            for n in 0..1_000 {
                let doc = Document::from_persisted("animals", &json!({"_id": n.to_string()}))
                    .expect("valid doc");
                seq.push(&doc, SetOptions::nosync()).expect("push");
            }
            black_box(seq.len());
        })
    });
}

criterion_group!(benches, bench_plan_identical, bench_plan_divergent, bench_sequence_push);
criterion_main!(benches);
