//! Warbler write-batching benchmark harness.
//!
//! Runs a concurrent post/read workload against one status container and
//! reports submit latency, throughput and how the batcher coalesced writes
//! (flushes, timer firings, largest batch).
//!
//! Usage:
//!   cargo run -p warbler_bench -- --ops 20000 --threads 4 --window-ms 50
//!   cargo run -p warbler_bench -- --compare --export json
//!   cargo run -p warbler_bench -- --data-dir /tmp/warbler --metrics-addr 127.0.0.1:9100

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use clap::Parser;

use warbler_common::config::WarblerConfig;
use warbler_observability::{record_container_metrics, record_persist, record_submit, MetricsObserver};
use warbler_storage::{ContainerRegistry, ContainerStats, IdRange, StatusDraft, StatusFilter};

/// Warbler write-batching benchmark.
#[derive(Parser, Debug)]
#[command(name = "warbler-bench", about = "Concurrent submit/read benchmark for warbler")]
struct Args {
    /// Total number of operations.
    #[arg(long, default_value_t = 10000)]
    ops: u64,

    /// Percentage of read operations (0-100). Remainder are posts.
    #[arg(long, default_value_t = 20)]
    read_pct: u8,

    /// Number of submitting threads.
    #[arg(long, default_value_t = 4)]
    threads: u32,

    /// Distinct authors posting.
    #[arg(long, default_value_t = 50)]
    authors: u64,

    /// Override the configured batch window (ms). 0 = synchronous.
    #[arg(long)]
    window_ms: Option<u64>,

    /// TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable the journal under this directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Namespace to write into.
    #[arg(long, default_value = "bench")]
    namespace: String,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Export format: text | csv | json
    #[arg(long, default_value = "text")]
    export: String,

    /// Run the workload batched and synchronous and compare.
    #[arg(long, default_value_t = false)]
    compare: bool,

    /// Print the default config as TOML and exit.
    #[arg(long, default_value_t = false)]
    print_default_config: bool,
}

const TAGS: [&str; 8] = [
    "release", "standup", "design", "ops", "random", "lunch", "review", "incident",
];

/// Simple deterministic pseudo-random (xorshift64).
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(if seed == 0 { 1 } else { seed })
    }
    fn next_u64(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
    fn next_pct(&mut self) -> u8 {
        (self.next_u64() % 100) as u8
    }
}

struct BenchResult {
    label: String,
    window_ms: u64,
    ops: u64,
    posts: u64,
    reads: u64,
    elapsed_ms: u64,
    tps: f64,
    p50_us: u64,
    p95_us: u64,
    p99_us: u64,
    /// Time after the last submit until the queue was empty without help.
    drain_ms: u64,
    persisted: usize,
    observed: u64,
    stats: ContainerStats,
}

#[derive(Default)]
struct ThreadReport {
    latencies_us: Vec<u64>,
    reads: u64,
}

fn percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn run_workload(args: &Args, config: &WarblerConfig, label: &str) -> anyhow::Result<BenchResult> {
    let registry = ContainerRegistry::new(config.clone());
    let container = registry
        .open(args.namespace.as_str())
        .with_context(|| format!("opening namespace '{}'", args.namespace))?;
    let observer = Arc::new(MetricsObserver::new());
    container.subscribe(observer.clone());

    let threads = args.threads.max(1) as u64;
    let per_thread = args.ops / threads;
    let remainder = args.ops % threads;

    tracing::info!(
        label,
        ops = args.ops,
        threads,
        window_ms = config.batch.batch_window_ms,
        "starting workload"
    );

    let start = Instant::now();
    let reports: Vec<anyhow::Result<ThreadReport>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let container = Arc::clone(&container);
                let ops = per_thread + if t == 0 { remainder } else { 0 };
                scope.spawn(move || -> anyhow::Result<ThreadReport> {
                    let mut rng = Rng::new(42 + t);
                    let mut report = ThreadReport::default();
                    for i in 0..ops {
                        let tag = TAGS[(rng.next_u64() % TAGS.len() as u64) as usize];
                        if rng.next_pct() < args.read_pct {
                            let _ = container.filtered_keys(tag, IdRange::all());
                            let _ = container
                                .query()
                                .recent(&StatusFilter::new().tags(tag), 20);
                            report.reads += 1;
                            continue;
                        }
                        let author = format!("user{}", rng.next_u64() % args.authors.max(1));
                        let draft =
                            StatusDraft::from_text(author, format!("post {} from t{} #{}", i, t, tag));
                        let submitted = Instant::now();
                        let outcome = container.submit(draft)?;
                        report
                            .latencies_us
                            .push(submitted.elapsed().as_micros() as u64);
                        record_submit(&outcome);
                    }
                    Ok(report)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow!("worker thread panicked"))?)
            .collect()
    });
    let elapsed = start.elapsed();

    let mut latencies = Vec::new();
    let mut reads = 0;
    for report in reports {
        let report = report?;
        reads += report.reads;
        latencies.extend(report.latencies_us);
    }
    latencies.sort_unstable();
    let posts = latencies.len() as u64;

    // Let the fallback timer drain the tail on its own.
    let drain_start = Instant::now();
    let drain_limit = config.batch.fallback_delay() + Duration::from_secs(1);
    while container.pending_len() > 0 && drain_start.elapsed() < drain_limit {
        std::thread::sleep(Duration::from_millis(1));
    }
    let drain_ms = drain_start.elapsed().as_millis() as u64;

    let persist_start = Instant::now();
    let persisted = registry.close_all()?;
    record_persist(
        persist_start.elapsed().as_micros() as u64,
        persisted,
        true,
    );

    let stats = container.stats();
    record_container_metrics(&args.namespace, &stats);

    let elapsed_ms = elapsed.as_millis() as u64;
    let tps = if elapsed_ms > 0 {
        args.ops as f64 / (elapsed_ms as f64 / 1000.0)
    } else {
        0.0
    };

    Ok(BenchResult {
        label: label.to_string(),
        window_ms: config.batch.batch_window_ms,
        ops: args.ops,
        posts,
        reads,
        elapsed_ms,
        tps,
        p50_us: percentile(&latencies, 50.0),
        p95_us: percentile(&latencies, 95.0),
        p99_us: percentile(&latencies, 99.0),
        drain_ms,
        persisted,
        observed: observer.added(),
        stats,
    })
}

fn print_result_text(r: &BenchResult) {
    println!("═══════════════════════════════════════════════");
    println!("  {} (window {} ms)", r.label, r.window_ms);
    println!("═══════════════════════════════════════════════");
    println!("  Operations:        {}", r.ops);
    println!("  Posts / reads:     {} / {}", r.posts, r.reads);
    println!("  Elapsed:           {} ms", r.elapsed_ms);
    println!("  TPS:               {:.1}", r.tps);
    println!("  Submit latency     p50={:>6}  p95={:>6}  p99={:>6} µs", r.p50_us, r.p95_us, r.p99_us);
    println!("  ─── Batching ───");
    println!("  Flushes:           {} ({} empty)", r.stats.batch.flushes, r.stats.batch.empty_flushes);
    println!("  Records flushed:   {}", r.stats.batch.records_flushed);
    println!("  Largest batch:     {}", r.stats.batch.largest_batch);
    println!("  Rejected:          {}", r.stats.batch.rejected);
    println!(
        "  Timers:            armed={} fired={} disarmed={}",
        r.stats.batch.timers_armed, r.stats.batch.timers_fired, r.stats.batch.timers_disarmed
    );
    println!("  Tail drain:        {} ms", r.drain_ms);
    println!("  ─── Store ───");
    println!("  Records:           {}", r.stats.records);
    println!("  Id collisions:     {}", r.stats.id_collisions);
    println!("  Persisted on close:{:>6}", r.persisted);
    println!("  Added events:      {}", r.observed);
    println!();
}

fn print_result_csv(r: &BenchResult) {
    println!("label,window_ms,ops,posts,reads,elapsed_ms,tps,p50_us,p95_us,p99_us,flushes,largest_batch,timers_fired,records,collisions");
    println!(
        "{},{},{},{},{},{},{:.1},{},{},{},{},{},{},{},{}",
        r.label,
        r.window_ms,
        r.ops,
        r.posts,
        r.reads,
        r.elapsed_ms,
        r.tps,
        r.p50_us,
        r.p95_us,
        r.p99_us,
        r.stats.batch.flushes,
        r.stats.batch.largest_batch,
        r.stats.batch.timers_fired,
        r.stats.records,
        r.stats.id_collisions,
    );
}

fn print_result_json(r: &BenchResult) -> anyhow::Result<()> {
    let obj = serde_json::json!({
        "label": r.label,
        "window_ms": r.window_ms,
        "ops": r.ops,
        "posts": r.posts,
        "reads": r.reads,
        "elapsed_ms": r.elapsed_ms,
        "tps": r.tps,
        "latency_us": {
            "p50": r.p50_us,
            "p95": r.p95_us,
            "p99": r.p99_us,
        },
        "drain_ms": r.drain_ms,
        "persisted": r.persisted,
        "observed": r.observed,
        "stats": serde_json::to_value(&r.stats)?,
    });
    println!("{}", serde_json::to_string_pretty(&obj)?);
    Ok(())
}

fn print_result(r: &BenchResult, format: &str) -> anyhow::Result<()> {
    match format {
        "csv" => print_result_csv(r),
        "json" => print_result_json(r)?,
        _ => print_result_text(r),
    }
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<WarblerConfig> {
    let mut config = match &args.config {
        Some(path) => WarblerConfig::load(path)?,
        None => WarblerConfig::default(),
    };
    if let Some(window_ms) = args.window_ms {
        config.batch.batch_window_ms = window_ms;
    }
    if let Some(dir) = &args.data_dir {
        config.journal.enabled = true;
        config.journal.dir = dir.display().to_string();
    }
    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_default_config {
        print!("{}", WarblerConfig::default().to_toml_string()?);
        return Ok(());
    }

    warbler_observability::init_tracing();
    if let Some(addr) = &args.metrics_addr {
        warbler_observability::init_metrics(addr).map_err(|e| anyhow!("metrics exporter: {}", e))?;
    }

    let config = load_config(&args)?;

    if args.compare {
        println!("Running batched vs synchronous comparison...\n");

        let batched = run_workload(&args, &config, "Batched")?;
        let mut sync_config = config.clone();
        sync_config.batch.batch_window_ms = 0;
        let sync = run_workload(&args, &sync_config, "Synchronous")?;

        print_result(&batched, &args.export)?;
        print_result(&sync, &args.export)?;

        if args.export == "text" {
            let tps_ratio = if sync.tps > 0.0 { batched.tps / sync.tps } else { 0.0 };
            let flush_ratio = if batched.stats.batch.flushes > 0 {
                sync.stats.batch.flushes as f64 / batched.stats.batch.flushes as f64
            } else {
                0.0
            };
            println!("═══════════════════════════════════════════════");
            println!("  COMPARISON SUMMARY");
            println!("═══════════════════════════════════════════════");
            println!("  TPS ratio (batched/sync):   {:.2}x", tps_ratio);
            println!("  Commits saved by batching:  {:.1}x fewer flushes", flush_ratio);
        }
    } else {
        let result = run_workload(&args, &config, "Status workload")?;
        print_result(&result, &args.export)?;
    }
    Ok(())
}
