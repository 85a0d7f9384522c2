/// Query compilation and in-process evaluation benchmarks
///
/// Run with: cargo bench -p pstore-tests

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pstore_core::query::opts::*;
use pstore_core::{
    Dialect, Direction, DocumentCompiler, Item, ItemBuilder, KvMatcher, Operator, Query, SqlCompiler,
};
use pstore_test_utils::person_schema;

fn sample_query() -> Query {
    Query::new()
        .filter(and([
            or([
                where_("status", Operator::Equal, "active"),
                where_("status", Operator::Equal, "pending"),
            ]),
            where_("age", Operator::GreaterThan, 23),
            where_("name", Operator::Like, "%an%"),
        ]))
        .order_by("age", Direction::Desc)
        .limit(20)
        .offset(40)
}

fn bench_compile(c: &mut Criterion) {
    let schema = person_schema();
    let query = sample_query();
    let mut group = c.benchmark_group("compile");

    group.bench_function("sql", |b| {
        let compiler = SqlCompiler::new(Dialect::Sqlite).with_schema(&schema);
        b.iter(|| compiler.compile_select("people", black_box(&query)).unwrap());
    });
    group.bench_function("document", |b| {
        let compiler = DocumentCompiler::new().with_schema(&schema);
        b.iter(|| compiler.compile_query(black_box(&query)).unwrap());
    });
    group.bench_function("key_value", |b| {
        b.iter(|| KvMatcher::compile(black_box(&query)).unwrap());
    });
    group.finish();
}

fn records(n: usize) -> Vec<Item> {
    const STATUSES: [&str; 3] = ["active", "pending", "closed"];
    (0..n)
        .map(|i| {
            ItemBuilder::new()
                .set("id", format!("p{}", i))
                .set("name", if i % 2 == 0 { "dan" } else { "amy" })
                .set("age", (i % 60) as i64)
                .set("status", STATUSES[i % 3])
                .build()
        })
        .collect()
}

fn bench_kv_execute(c: &mut Criterion) {
    let plan = KvMatcher::compile(&sample_query()).unwrap();
    let mut group = c.benchmark_group("kv_execute");

    for size in [100, 1_000, 10_000] {
        let data = records(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("records", size), &data, |b, data| {
            b.iter(|| plan.execute(black_box(data.clone())));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compile, bench_kv_execute);
criterion_main!(benches);
