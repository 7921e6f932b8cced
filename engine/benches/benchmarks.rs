//! Performance benchmarks for larder-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use larder_engine::adapter::executor;
use larder_engine::{
    q, AppSchema, ColumnSchema, ColumnType, Database, DatabaseConfig, Matcher, MemoryAdapter,
    QueryDescription, RawRecord, SerializedQuery, SortOrder, SyncStatus, TableName, TableSchema,
    Value,
};
use std::collections::HashMap;
use std::sync::Arc;

fn create_test_schema() -> AppSchema {
    AppSchema::new(1).with_table(TableSchema::new(
        "users",
        vec![
            ColumnSchema::new("name", ColumnType::String),
            ColumnSchema::optional("email", ColumnType::String),
            ColumnSchema::optional("age", ColumnType::Number),
        ],
    ))
}

fn rows(count: usize) -> Vec<RawRecord> {
    (0..count)
        .map(|i| RawRecord {
            id: format!("user_{}", i),
            status: SyncStatus::Synced,
            changed: String::new(),
            last_modified: None,
            columns: [
                ("name".to_string(), Value::from(format!("User {}", i))),
                (
                    "email".to_string(),
                    if i % 3 == 0 {
                        Value::Null
                    } else {
                        Value::from(format!("user{}@test.com", i))
                    },
                ),
                ("age".to_string(), Value::from((i % 90) as f64)),
            ]
            .into_iter()
            .collect(),
        })
        .collect()
}

fn adults_with_email() -> QueryDescription {
    QueryDescription::build(vec![
        q::where_("age", q::gte(18)),
        q::or(vec![
            q::where_("email", q::like("%@test.com")),
            q::where_("name", q::one_of(["User 1", "User 2"])),
        ]),
    ])
    .expect("valid query")
}

fn bench_predicates(c: &mut Criterion) {
    let mut group = c.benchmark_group("predicates");
    let schema = create_test_schema();

    for size in [100, 1000, 10000].iter() {
        let data = rows(*size);
        let description = adults_with_email();

        group.bench_with_input(BenchmarkId::new("matcher", size), &data, |b, data| {
            let matcher = Matcher::compile(&description).expect("compilable");
            b.iter(|| data.iter().filter(|raw| matcher.matches(black_box(raw))).count())
        });

        group.bench_with_input(BenchmarkId::new("executor", size), &data, |b, data| {
            let serialized =
                SerializedQuery::new(&schema, "users", description.clone()).expect("serializable");
            let mut source: HashMap<TableName, Vec<RawRecord>> = HashMap::new();
            source.insert("users".to_string(), data.clone());
            b.iter(|| executor::count(black_box(&source), black_box(&serialized)))
        });
    }

    group.bench_function("matcher_compile", |b| {
        let description = adults_with_email();
        b.iter(|| Matcher::compile(black_box(&description)))
    });

    group.finish();
}

fn bench_sorted_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("sorted_query");
    let schema = create_test_schema();

    for size in [1000, 10000].iter() {
        let mut source: HashMap<TableName, Vec<RawRecord>> = HashMap::new();
        source.insert("users".to_string(), rows(*size));
        let description = QueryDescription::build(vec![
            q::where_("age", q::lt(50)).into(),
            q::sort_by("name", SortOrder::Desc),
            q::take(20),
        ])
        .expect("valid query");
        let serialized = SerializedQuery::new(&schema, "users", description).expect("serializable");

        group.bench_with_input(BenchmarkId::new("execute", size), &source, |b, source| {
            b.iter(|| executor::execute(black_box(source), black_box(&serialized)).map(|r| r.len()))
        });
    }

    group.finish();
}

fn bench_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("batches");
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");

    for size in [1, 10, 100].iter() {
        group.bench_with_input(BenchmarkId::new("create", size), size, |b, &size| {
            b.to_async(&runtime).iter(|| async move {
                let adapter = Arc::new(MemoryAdapter::new(create_test_schema()));
                let db = Database::new(adapter, DatabaseConfig::default().with_queue_warnings(false))
                    .expect("database");
                let users = db.get("users").expect("users");
                let writer = db.clone();
                db.write("bench", move |action| async move {
                    let records = (0..size)
                        .map(|i| {
                            users.prepare_create(|user| {
                                user.set_raw("name", format!("User {}", i));
                            })
                        })
                        .collect::<larder_engine::Result<Vec<_>>>()?;
                    writer.batch(&action, records).await
                })
                .await
            })
        });
    }

    group.bench_function("queued_readers", |b| {
        b.to_async(&runtime).iter(|| async {
            let adapter = Arc::new(MemoryAdapter::new(create_test_schema()));
            let db = Database::new(adapter, DatabaseConfig::default().with_queue_warnings(false))
                .expect("database");
            let readers: Vec<_> = (0..100)
                .map(|i| db.read("bench", move |_| async move { Ok(i) }))
                .collect();
            futures::future::join_all(readers).await
        })
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");

    for size in [100, 1000].iter() {
        let adapter = MemoryAdapter::new(create_test_schema());
        runtime.block_on(async {
            use larder_engine::{BatchOperation, StorageAdapter};
            let operations = rows(*size)
                .into_iter()
                .map(|raw| BatchOperation::Create {
                    table: "users".to_string(),
                    raw,
                })
                .collect();
            adapter.batch(operations).await.expect("seed batch");
        });

        group.bench_with_input(BenchmarkId::new("export", size), &adapter, |b, adapter| {
            b.iter(|| adapter.export_snapshot())
        });

        let json = adapter.export_snapshot().to_json().expect("json");
        group.bench_with_input(BenchmarkId::new("import_json", size), &json, |b, json| {
            b.iter(|| {
                let snapshot =
                    larder_engine::MemorySnapshot::from_json(black_box(json)).expect("snapshot");
                adapter.import_snapshot(snapshot)
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_predicates,
    bench_sorted_query,
    bench_batches,
    bench_snapshot,
);
criterion_main!(benches);
