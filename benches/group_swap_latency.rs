//! Process-group arbitration setup throughput: config normalization,
//! command tokenization, and group/process table construction — the
//! synchronous work done once per reload, ahead of any swap decision.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use modelmux::command::tokenize;
use modelmux::config::Config;
use modelmux::group::ProcessGroup;

fn config_yaml(model_count: usize) -> String {
    let mut yaml = String::from("startPort: 6000\nmodels:\n");
    for i in 0..model_count {
        yaml.push_str(&format!(
            "  model-{i}:\n    cmd: \"llama-server --port ${{PORT}} -m model-{i}.gguf\"\n    ttl: 300\n"
        ));
    }
    yaml.push_str("groups:\n  shared:\n    swap: true\n    exclusive: true\n    members: [");
    yaml.push_str(
        &(0..model_count)
            .map(|i| format!("model-{i}"))
            .collect::<Vec<_>>()
            .join(", "),
    );
    yaml.push_str("]\n");
    yaml
}

fn bench_config_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("config_normalize");

    for size in [1, 10, 50] {
        let yaml = config_yaml(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("models", size), &yaml, |b, yaml| {
            b.iter(|| {
                let config = Config::from_yaml(black_box(yaml)).unwrap();
                black_box(config);
            })
        });
    }

    group.finish();
}

fn bench_tokenize(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_tokenize");
    let cmd = r#"llama-server --port ${PORT} -m "models/7b instruct.gguf" --ctx-size 4096 --n-gpu-layers 99"#;

    group.throughput(Throughput::Bytes(cmd.len() as u64));
    group.bench_function("typical_cmd", |b| {
        b.iter(|| {
            let tokens = tokenize(black_box(cmd)).unwrap();
            black_box(tokens);
        })
    });

    group.finish();
}

fn bench_group_member_table(c: &mut Criterion) {
    let mut group_bench = c.benchmark_group("group_member_lookup");

    for size in [10, 100, 1000] {
        group_bench.throughput(Throughput::Elements(size as u64));
        group_bench.bench_with_input(BenchmarkId::new("members", size), &size, |b, &count| {
            b.iter_batched(
                || {
                    let cfg = modelmux::config::GroupConfig {
                        swap: true,
                        exclusive: true,
                        persistent: false,
                        members: (0..count).map(|i| format!("model-{i}")).collect(),
                    };
                    ProcessGroup::new("bench-group", cfg)
                },
                |group| {
                    let ids = group.member_ids();
                    black_box(ids);
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group_bench.finish();
}

criterion_group!(benches, bench_config_normalize, bench_tokenize, bench_group_member_table);
criterion_main!(benches);
