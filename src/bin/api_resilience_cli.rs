// src/bin/api_resilience_cli.rs

use async_trait::async_trait;
use dotenv::dotenv;
use futures::future::join_all;
use prettytable::{row, Table};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use api_resilience::manager::{ApiResponse, HttpRequest, Transport};
use api_resilience::{
    ApiError, ApiManager, RateLimitConfig, RequestOptions, ResilienceSettings, ServiceConfig,
    StrategyKind, SystemClock,
};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "api_resilience_cli",
    about = "Simulate traffic against a rate limited, circuit protected service"
)]
struct Opt {
    /// Rate limiting strategy to use
    #[structopt(short, long, possible_values = &["fixed_window", "sliding_window", "token_bucket"], default_value = "sliding_window")]
    strategy: String,

    /// Service id to simulate
    #[structopt(long, default_value = "demo")]
    service: String,

    /// Requests allowed per window
    #[structopt(short, long, default_value = "10")]
    limit: u64,

    /// Window duration in milliseconds
    #[structopt(short, long, default_value = "1000")]
    window_ms: u64,

    /// Token bucket capacity (defaults to the limit)
    #[structopt(short, long)]
    burst: Option<u64>,

    /// Traffic pattern
    #[structopt(long, possible_values = &["burst", "steady", "sine_wave"], default_value = "burst")]
    simulation: String,

    /// Number of requests to simulate
    #[structopt(short = "n", long, default_value = "20")]
    num_requests: usize,

    /// Time between requests in milliseconds (steady and sine_wave)
    #[structopt(short = "t", long, default_value = "100")]
    request_interval_ms: u64,

    /// Send requests through the full pipeline instead of only asking the rate limiter
    #[structopt(long)]
    pipeline: bool,

    /// Simulated downstream latency (pipeline mode)
    #[structopt(long, default_value = "20")]
    latency_ms: u64,

    /// Fraction of simulated calls that fail with 503 (pipeline mode)
    #[structopt(long, default_value = "0.0")]
    failure_rate: f64,

    /// Connection pool size (pipeline mode)
    #[structopt(long, default_value = "4")]
    max_concurrent: usize,

    /// Per-request timeout in milliseconds (pipeline mode)
    #[structopt(long, default_value = "2000")]
    timeout_ms: u64,

    /// JSON settings file; falls back to API_RESILIENCE_CONFIG
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Emit logs as JSON
    #[structopt(long)]
    json_logs: bool,

    /// Disable logs
    #[structopt(long)]
    disable_logs: bool,
}

/// Stands in for the network: answers after a fixed latency and fails at random
#[derive(Debug)]
struct SimulatedTransport {
    latency: Duration,
    failure_rate: f64,
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn send(&self, request: HttpRequest) -> api_resilience::Result<ApiResponse> {
        time::sleep(self.latency).await;

        if rand::random::<f64>() < self.failure_rate {
            return Err(ApiError::OperationFailed {
                service_id: request.service_id,
                status: Some(503),
                message: "simulated outage".to_string(),
            });
        }

        Ok(ApiResponse {
            status: 200,
            headers: HashMap::new(),
            body: "{}".to_string(),
            elapsed: self.latency,
        })
    }
}

#[derive(Debug, Default)]
struct Tally {
    allowed: usize,
    denied: usize,
    failed: usize,
    circuit_open: usize,
    timed_out: usize,
}

impl Tally {
    fn record(&mut self, outcome: &api_resilience::Result<ApiResponse>) {
        match outcome {
            Ok(_) => self.allowed += 1,
            Err(ApiError::RateLimitExceeded { .. })
            | Err(ApiError::ConnectionPoolExhausted { .. }) => self.denied += 1,
            Err(ApiError::CircuitOpen { .. }) => self.circuit_open += 1,
            Err(ApiError::RequestTimeout { .. }) => self.timed_out += 1,
            Err(_) => self.failed += 1,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let opt = Opt::from_args();
    init_logging(&opt)?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))?;

    let manager = build_manager(&opt)?;

    info!(
        service = %opt.service,
        simulation = %opt.simulation,
        pipeline = opt.pipeline,
        "Starting simulation"
    );

    let started = Instant::now();
    let tally = match opt.simulation.as_str() {
        "burst" => simulate_burst(&opt, &manager).await,
        "steady" => simulate_paced(&opt, &manager, &running, |_| 1.0).await,
        "sine_wave" => {
            let total = opt.num_requests.max(1) as f64;
            simulate_paced(&opt, &manager, &running, move |i| {
                // Vary the interval between 0.5x and 1.5x the base interval
                let phase = i as f64 * std::f64::consts::PI * 2.0 / total;
                1.0 + 0.5 * phase.sin()
            })
            .await
        }
        other => return Err(format!("Unknown simulation mode: {}", other).into()),
    };

    if !running.load(Ordering::SeqCst) {
        warn!("Simulation interrupted");
    }

    print_summary(&opt, &tally, started.elapsed());
    print_status(&manager);

    Ok(())
}

fn init_logging(opt: &Opt) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = match (opt.disable_logs, opt.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::new(format!(
        "api_resilience_cli={},api_resilience={}",
        log_level, log_level
    ));

    if opt.json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

fn build_manager(opt: &Opt) -> Result<ApiManager, Box<dyn std::error::Error>> {
    let transport = Arc::new(SimulatedTransport {
        latency: Duration::from_millis(opt.latency_ms),
        failure_rate: opt.failure_rate,
    });

    let config_path = opt.config.clone().or_else(|| {
        std::env::var_os("API_RESILIENCE_CONFIG").map(PathBuf::from)
    });
    let settings = match config_path {
        Some(path) => {
            info!(path = %path.display(), "Loading settings");
            ResilienceSettings::from_file(&path)?
        }
        None => ResilienceSettings::default(),
    };

    let manager = ApiManager::from_settings(&settings, transport, Arc::new(SystemClock))?;

    if manager.service_config(&opt.service).is_none() {
        manager.configure_service(ServiceConfig {
            max_concurrent: opt.max_concurrent,
            timeout: Duration::from_millis(opt.timeout_ms),
            ..ServiceConfig::new(&opt.service, "http://simulated.local")
        })?;
    }

    if manager.rate_limiter().config(&opt.service).is_none() {
        let strategy: StrategyKind = opt.strategy.parse()?;
        let mut rate_limit = RateLimitConfig::new(
            &opt.service,
            strategy,
            opt.limit,
            Duration::from_millis(opt.window_ms),
        );
        rate_limit.burst = opt.burst;
        manager.configure_rate_limit(rate_limit)?;
    }

    Ok(manager)
}

/// One request: either a full pipeline call or a bare rate limiter check
async fn fire(opt: &Opt, manager: &ApiManager, index: usize) -> api_resilience::Result<ApiResponse> {
    if opt.pipeline {
        return manager
            .request(RequestOptions::get(&opt.service, &format!("/simulated/{}", index)))
            .await;
    }

    let status = manager.rate_limiter().check_and_record(&opt.service);
    if status.can_make_request {
        info!(request = index + 1, remaining = status.remaining_requests, "ALLOWED");
        Ok(ApiResponse {
            status: 200,
            headers: HashMap::new(),
            body: String::new(),
            elapsed: Duration::ZERO,
        })
    } else {
        let wait_time = manager.rate_limiter().notify_exceeded(&opt.service);
        warn!(request = index + 1, wait_ms = wait_time.as_millis() as u64, "DENIED");
        Err(ApiError::RateLimitExceeded {
            service_id: opt.service.clone(),
            wait_time,
        })
    }
}

// All requests at once
async fn simulate_burst(opt: &Opt, manager: &ApiManager) -> Tally {
    let outcomes = join_all((0..opt.num_requests).map(|i| fire(opt, manager, i))).await;

    let mut tally = Tally::default();
    for outcome in &outcomes {
        tally.record(outcome);
    }
    tally
}

// One request per interval, the interval scaled by `pace(i)`
async fn simulate_paced(
    opt: &Opt,
    manager: &ApiManager,
    running: &AtomicBool,
    pace: impl Fn(usize) -> f64,
) -> Tally {
    let base_interval = Duration::from_millis(opt.request_interval_ms);
    let mut tally = Tally::default();

    for i in 0..opt.num_requests {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let request_time = Instant::now();
        let outcome = fire(opt, manager, i).await;
        tally.record(&outcome);

        let this_interval = base_interval.mul_f64(pace(i));
        let elapsed = request_time.elapsed();
        if elapsed < this_interval {
            time::sleep(this_interval - elapsed).await;
        }
    }

    tally
}

fn print_summary(opt: &Opt, tally: &Tally, elapsed: Duration) {
    let mut table = Table::new();
    table.set_titles(row!["Simulation", "Allowed", "Denied", "Failed", "Circuit open", "Timed out", "Elapsed"]);
    table.add_row(row![
        opt.simulation,
        tally.allowed,
        tally.denied,
        tally.failed,
        tally.circuit_open,
        tally.timed_out,
        format!("{:?}", elapsed)
    ]);
    println!();
    table.printstd();
}

fn print_status(manager: &ApiManager) {
    let mut table = Table::new();
    table.set_titles(row![
        "Service", "Strategy", "Remaining", "Wait (ms)", "Circuit", "Active", "Queued", "Completed",
        "Failed"
    ]);

    for service in manager.configured_services() {
        let status = manager.rate_limiter().status(&service);
        let pool = manager.pool_stats(&service);
        let remaining = if status.remaining_requests == u64::MAX {
            "unlimited".to_string()
        } else {
            status.remaining_requests.to_string()
        };

        table.add_row(row![
            service,
            status.strategy_name,
            remaining,
            status.wait_time.as_millis(),
            format!("{:?}", manager.circuit_breaker().state(&service)),
            pool.active,
            pool.queued,
            pool.completed,
            pool.failed
        ]);
    }

    println!();
    table.printstd();
}
