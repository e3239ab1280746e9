// src/bin/api_resilience_bench.rs

use indicatif::{ProgressBar, ProgressStyle};
use prettytable::{row, Table};
use std::sync::Arc;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::sync::{Barrier, Semaphore};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use api_resilience::{EventBus, RateLimitConfig, RateLimiter, StrategyKind, SystemClock};

#[derive(Debug, Clone, StructOpt)]
#[structopt(
    name = "api_resilience_bench",
    about = "A benchmarking tool for the rate limiting strategies"
)]
struct Opt {
    /// Strategy to benchmark
    #[structopt(short, long, possible_values = &["fixed_window", "sliding_window", "token_bucket", "all"], default_value = "all")]
    strategy: String,

    /// Requests allowed per window
    #[structopt(short, long, default_value = "1000")]
    limit: u64,

    /// Window duration in milliseconds
    #[structopt(short, long, default_value = "60000")]
    window_ms: u64,

    /// Number of services hammered concurrently
    #[structopt(short = "u", long, default_value = "10")]
    num_services: usize,

    /// Number of requests per service
    #[structopt(short = "r", long, default_value = "100")]
    requests_per_service: usize,

    /// Number of iterations to run
    #[structopt(short, long, default_value = "3")]
    iterations: usize,

    /// Maximum concurrency level
    #[structopt(short = "c", long, default_value = "100")]
    concurrency: usize,

    /// Verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Disable logs
    #[structopt(long)]
    disable_logs: bool,
}

#[derive(Debug)]
struct BenchResult {
    strategy: StrategyKind,
    allowed: u64,
    denied: u64,
    total_duration: Duration,
    iterations: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();

    let log_level = match (opt.disable_logs, opt.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "api_resilience_bench={},api_resilience={}",
            log_level,
            // Per-check debug lines would drown the benchmark
            if log_level == "info" { "warn" } else { log_level }
        )))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let strategies = if opt.strategy == "all" {
        vec![
            StrategyKind::FixedWindow,
            StrategyKind::SlidingWindow,
            StrategyKind::TokenBucket,
        ]
    } else {
        vec![opt.strategy.parse()?]
    };

    let mut results = Vec::with_capacity(strategies.len());
    for strategy in strategies {
        results.push(run_benchmark(strategy, &opt).await?);
    }

    print_results(&results);
    Ok(())
}

async fn run_benchmark(
    strategy: StrategyKind,
    opt: &Opt,
) -> Result<BenchResult, Box<dyn std::error::Error>> {
    info!(
        %strategy,
        limit = opt.limit,
        window_ms = opt.window_ms,
        "Benchmarking strategy"
    );

    let limiter = Arc::new(RateLimiter::permissive(
        Arc::new(SystemClock),
        EventBus::default(),
    ));
    let services: Vec<String> = (0..opt.num_services)
        .map(|i| format!("service_{}", i))
        .collect();
    for service in &services {
        limiter.configure(RateLimitConfig::new(
            service,
            strategy,
            opt.limit,
            Duration::from_millis(opt.window_ms),
        ))?;
    }

    let progress = ProgressBar::new((opt.iterations * opt.num_services) as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut total_duration = Duration::ZERO;
    let mut allowed_total = 0u64;
    let mut denied_total = 0u64;

    for iteration in 0..opt.iterations {
        progress.set_message(format!("{} iteration {}", strategy, iteration + 1));

        for service in &services {
            limiter.reset(service);
        }

        let start_time = Instant::now();
        let barrier = Arc::new(Barrier::new(opt.num_services));
        let semaphore = Arc::new(Semaphore::new(opt.concurrency.max(1)));
        let mut handles = Vec::with_capacity(opt.num_services);

        for service in &services {
            let limiter = Arc::clone(&limiter);
            let barrier = Arc::clone(&barrier);
            let semaphore = Arc::clone(&semaphore);
            let progress = progress.clone();
            let service = service.clone();
            let requests = opt.requests_per_service;

            handles.push(tokio::spawn(async move {
                barrier.wait().await;

                let mut allowed = 0u64;
                let mut denied = 0u64;
                for _ in 0..requests {
                    let Ok(_permit) = semaphore.acquire().await else {
                        break;
                    };
                    if limiter.check_and_record(&service).can_make_request {
                        allowed += 1;
                    } else {
                        denied += 1;
                    }
                }

                progress.inc(1);
                (allowed, denied)
            }));
        }

        for result in futures::future::join_all(handles).await {
            match result {
                Ok((allowed, denied)) => {
                    allowed_total += allowed;
                    denied_total += denied;
                }
                Err(e) => warn!("Benchmark task failed: {}", e),
            }
        }

        total_duration += start_time.elapsed();
    }

    progress.finish_with_message(format!("{} done", strategy));

    Ok(BenchResult {
        strategy,
        allowed: allowed_total,
        denied: denied_total,
        total_duration,
        iterations: opt.iterations.max(1),
    })
}

fn print_results(results: &[BenchResult]) {
    let mut table = Table::new();
    table.set_titles(row![
        "Strategy",
        "Requests",
        "Allowed",
        "Denied",
        "Avg. iteration",
        "Throughput (req/s)"
    ]);

    for result in results {
        let total = result.allowed + result.denied;
        let throughput = if result.total_duration.is_zero() {
            0.0
        } else {
            total as f64 / result.total_duration.as_secs_f64()
        };

        table.add_row(row![
            result.strategy,
            total,
            format!(
                "{} ({:.1}%)",
                result.allowed,
                100.0 * result.allowed as f64 / total.max(1) as f64
            ),
            result.denied,
            format!("{:?}", result.total_duration / result.iterations as u32),
            format!("{:.2}", throughput)
        ]);
    }

    println!();
    table.printstd();
}
