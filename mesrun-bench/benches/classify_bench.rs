//! Error classification benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mesrun_core::{AbortError, BoxError, ErrorClassification, Fault};
use std::error::Error;
use std::fmt;

/// A generic error wrapping a cause.
#[derive(Debug)]
struct Wrapped(BoxError);

impl fmt::Display for Wrapped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wrapped")
    }
}

impl Error for Wrapped {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&*self.0)
    }
}

fn nested(depth: usize, root: BoxError) -> BoxError {
    (0..depth).fold(root, |inner, _| Box::new(Wrapped(inner)) as BoxError)
}

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");
    let classification = ErrorClassification::new();

    let cases: Vec<(&str, BoxError)> = vec![
        ("temporary_with_delay", Fault::temporary_with_delay("busy").into()),
        ("invalid", Fault::invalid("bad").into()),
        ("requires_exit", AbortError::new("fatal").into()),
        ("unclassified", "plain".into()),
        (
            "io_timed_out",
            std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into(),
        ),
    ];

    for (name, error) in &cases {
        group.bench_function(*name, |b| {
            b.iter(|| black_box(classification.classify(&**error)))
        });
    }

    group.finish();
}

fn bench_nested(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify_nested");
    let classification = ErrorClassification::new();

    for depth in [1usize, 4, 16] {
        let error = nested(depth, AbortError::new("fatal").into());
        group.bench_with_input(BenchmarkId::from_parameter(depth), &error, |b, error| {
            b.iter(|| black_box(classification.requires_exit(&**error)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_classify, bench_nested);
criterion_main!(benches);
