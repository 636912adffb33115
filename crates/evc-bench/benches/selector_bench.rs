//! Policy search benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use evc_control::{
    AllocationSampleSpace, AllocationSamples, ControlSignalSpec, ControllerConfig, CostOptions,
    EvcController, SearchStrategy,
};
use evc_harness::ScenarioGraph;

const GRAPH: &str = r#"{
    "inputs": ["color", "word"],
    "parameters": {"color_gain": 1.0, "word_gain": 1.0, "threshold": 1.0},
    "nodes": [
        {"name": "color", "op": "input", "input": "color"},
        {"name": "word", "op": "input", "input": "word"},
        {"name": "color_drive", "op": "scale", "source": "color", "parameter": "color_gain"},
        {"name": "word_drive", "op": "scale", "source": "word", "parameter": "word_gain"},
        {"name": "net", "op": "sum", "sources": ["color_drive", "word_drive"]},
        {"name": "evidence", "op": "integrator", "source": "net", "rate": 0.1},
        {"name": "bound", "op": "scale", "source": "evidence", "parameter": "threshold"},
        {"name": "response", "op": "logistic", "source": "bound", "gain": 4.0, "bias": 0.5}
    ],
    "outputs": ["response", "evidence"]
}"#;

fn controller(samples: usize, search: SearchStrategy) -> EvcController<ScenarioGraph> {
    let graph = ScenarioGraph::from_json(GRAPH).expect("bench graph parses");
    let step = 1.0 / samples as f64;
    let mut cfg = ControllerConfig::new()
        .with_search(search)
        .with_monitor("response", 1.0, 1.0)
        .with_monitor("evidence", 0.5, 1.0);
    for target in ["color_gain", "word_gain", "threshold"] {
        cfg = cfg.with_signal(
            ControlSignalSpec::new(target)
                .with_sample_range(step, 1.0 + step / 2.0, step)
                .with_cost_options(CostOptions::INTENSITY.union(CostOptions::ADJUSTMENT)),
        );
    }
    EvcController::new(graph, cfg).expect("bench controller builds")
}

fn bench_sample_space_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("sample_space_build");
    for signals in [1_usize, 2, 3, 4] {
        let samples = AllocationSamples::range(0.0, 1.0, 0.1).expect("range");
        let refs: Vec<&AllocationSamples> = (0..signals).map(|_| &samples).collect();
        group.bench_with_input(BenchmarkId::new("signals", signals), &refs, |b, refs| {
            b.iter(|| criterion::black_box(AllocationSampleSpace::build(refs).expect("space")));
        });
    }
    group.finish();
}

fn bench_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("select");
    group.sample_size(20);
    for samples in [4_usize, 10] {
        let strategies = [
            ("sequential", SearchStrategy::Sequential),
            ("parallel", SearchStrategy::Parallel { threads: None }),
        ];
        for (label, strategy) in strategies {
            let mut ctl = controller(samples, strategy);
            ctl.step(&[vec![1.0], vec![0.5]]).expect("warm-up step");
            group.bench_function(BenchmarkId::new(label, samples.pow(3)), |b| {
                b.iter(|| criterion::black_box(ctl.select().expect("select")));
            });
        }
    }
    group.finish();
}

fn bench_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("step");
    group.sample_size(20);
    let mut ctl = controller(4, SearchStrategy::Sequential);
    let inputs = [vec![1.0], vec![0.5]];
    group.bench_function("sequential_64_rows", |b| {
        b.iter(|| criterion::black_box(ctl.step(&inputs).expect("step")));
    });
    group.finish();
}

criterion_group!(benches, bench_sample_space_build, bench_select, bench_step);
criterion_main!(benches);
