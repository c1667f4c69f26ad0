//! Benchmarks for query compilation and response parsing
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use tsbridge::drivers::graphite::GraphiteCompiler;
use tsbridge::drivers::influxdb::{parse_time_series, FluxCompiler, ValueColumn};
use tsbridge::drivers::prometheus::PromQlCompiler;
use tsbridge::drivers::rrdtool::{FolderStrategy, RrdCompiler};
use tsbridge::{parse_query, AggregateFunction, Compiler, FillPolicy, Query};

fn sample_query() -> Query {
    Query::new("cpu")
        .and_where("host", "=", "server01")
        .where_in("dc", vec!["eu-1", "eu-2", "us-1"])
        .where_regex("env", "^prod")
        .latest("6h")
        .unwrap()
        .interval("5m")
        .group_by("host")
        .aggregate(AggregateFunction::Mean, "usage")
        .aggregate(AggregateFunction::Max, "usage")
        .fill(FillPolicy::Previous)
        .limit(100)
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let query = sample_query();

    let flux = FluxCompiler::new("telemetry");
    group.bench_function("flux", |b| b.iter(|| flux.compile(black_box(&query)).unwrap()));

    let graphite = GraphiteCompiler::new(Some("servers".to_string()));
    group.bench_function("graphite", |b| {
        b.iter(|| graphite.compile(black_box(&query)).unwrap())
    });

    let rrd = RrdCompiler::new("/var/lib/rrd", Arc::new(FolderStrategy));
    group.bench_function("rrdtool", |b| b.iter(|| rrd.compile(black_box(&query)).unwrap()));

    let promql = PromQlCompiler::default();
    group.bench_function("promql", |b| b.iter(|| promql.compile(black_box(&query)).unwrap()));

    group.finish();
}

fn bench_parse_query(c: &mut Criterion) {
    let text = "SELECT mean(usage) AS avg_usage, max(usage) FROM cpu \
                WHERE host = 'server01' AND dc IN ('eu-1', 'eu-2') AND time >= now() - 6h \
                GROUP BY host, time(5m) FILL(previous) LIMIT 100";

    c.bench_function("parse_query", |b| b.iter(|| parse_query(black_box(text)).unwrap()));
}

fn annotated_csv(rows: usize) -> String {
    let mut body = String::from(
        "#datatype,string,long,dateTime:RFC3339,double,string,string\n\
         #group,false,false,false,false,true,true\n\
         #default,_result,,,,,\n\
         ,result,table,_time,_value,_measurement,host\n",
    );
    for i in 0..rows {
        let table = i / 100;
        let minute = i % 60;
        let hour = (i / 60) % 24;
        body.push_str(&format!(
            ",_result,{},2023-10-27T{:02}:{:02}:00Z,{}.5,cpu,server{}\n",
            table, hour, minute, i, table
        ));
    }
    body
}

fn bench_csv(c: &mut Criterion) {
    let mut group = c.benchmark_group("annotated_csv");
    let columns = vec![ValueColumn {
        column: "_value".into(),
        name: None,
    }];

    for rows in [100, 1000, 10000] {
        let body = annotated_csv(rows);
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_function(format!("parse_{}", rows), |b| {
            b.iter(|| parse_time_series(black_box(&body), &columns).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compile, bench_parse_query, bench_csv);
criterion_main!(benches);
