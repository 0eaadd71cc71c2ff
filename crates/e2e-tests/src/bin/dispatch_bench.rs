use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use e2e_tests::{routed, TestHarness, ROUTED};
use outbox_indexing::Dispatcher;
use outbox_types::DispatchSettings;

#[derive(Parser, Debug)]
#[command(name = "dispatch_bench", about = "Outbox dispatch throughput benchmark")]
struct Args {
    /// Distinct entities written
    #[arg(long, default_value_t = 1_000)]
    entities: usize,
    /// Writes per entity (first is an insert)
    #[arg(long, default_value_t = 3)]
    writes_per_entity: usize,
    /// Number of routing partitions
    #[arg(long, default_value_t = 8)]
    routes: usize,
    /// Concurrent dispatchers
    #[arg(long, default_value_t = 2)]
    workers: usize,
    #[arg(long, default_value_t = 100)]
    batch_size: usize,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    events: usize,
    write_ms: u128,
    dispatch_ms: u128,
    events_per_sec: f64,
    operations: u64,
    coalescing_ratio: f64,
    cycles: u64,
    claim_conflicts: u64,
}

fn write_events(harness: &TestHarness, args: &Args) -> usize {
    let mut written = 0;
    for round in 0..args.writes_per_entity {
        for entity in 0..args.entities {
            let id = entity.to_string();
            let route = format!("route-{}", (entity + round) % args.routes.max(1));
            let state = routed(&route);
            let result = if round == 0 {
                harness.writer.insert(ROUTED, &id, &state)
            } else {
                harness.writer.update(ROUTED, &id, &state)
            };
            if let Err(e) = result {
                eprintln!("write failed for {}: {}", id, e);
                std::process::exit(1);
            }
            written += 1;
        }
    }
    written
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let harness = TestHarness::new();

    let started = Instant::now();
    let events = write_events(&harness, &args);
    let write_ms = started.elapsed().as_millis();

    let settings = DispatchSettings::default().with_batch_size(args.batch_size);
    let dispatchers: Vec<Arc<Dispatcher>> = (0..args.workers.max(1))
        .map(|i| Arc::new(harness.dispatcher(&format!("bench-{}", i), settings.clone())))
        .collect();

    let cancel = CancellationToken::new();
    let started = Instant::now();
    while harness.outbox_len() > 0 {
        let runs = dispatchers.iter().map(|d| {
            let d = d.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { d.run_until_idle(&cancel, 1_000).await })
        });
        join_all(runs).await;
    }
    let dispatch_ms = started.elapsed().as_millis();

    let stats: Vec<_> = dispatchers.iter().map(|d| d.stats()).collect();
    let operations: u64 = stats.iter().map(|s| s.submitted_operations).sum();
    let report = Report {
        events,
        write_ms,
        dispatch_ms,
        events_per_sec: events as f64 / (dispatch_ms.max(1) as f64 / 1_000.0),
        operations,
        coalescing_ratio: events as f64 / operations.max(1) as f64,
        cycles: stats.iter().map(|s| s.cycles).sum(),
        claim_conflicts: stats.iter().map(|s| s.claim_conflicts).sum(),
    };

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("failed to encode report: {}", e),
        }
    } else {
        println!(
            "{} events in {}ms ({:.0}/s), {} operations (x{:.2} coalescing), {} cycles, {} conflicts",
            report.events,
            report.dispatch_ms,
            report.events_per_sec,
            report.operations,
            report.coalescing_ratio,
            report.cycles,
            report.claim_conflicts
        );
    }
}
