//! RearView Simulator CLI
//!
//! Run deterministic rear-radar tracking scenarios.

use clap::Parser;
use rearview_core::TrackerConfig;
use rearview_sim::{ScenarioId, ScenarioResult, ScenarioRunner, SimError};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// RearView deterministic simulation CLI
#[derive(Parser, Debug)]
#[command(name = "rearview-sim")]
#[command(about = "Run deterministic rear-radar tracking scenarios", long_about = None)]
struct Args {
    /// Master seed for determinism
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (single_target, overtake, parallel_pair, clutter, dropout, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Radar cycles per scenario
    #[arg(short, long, default_value = "200")]
    cycles: u64,

    /// Track manager configuration as JSON
    #[arg(long)]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

fn load_config(path: Option<&str>) -> Result<TrackerConfig, SimError> {
    let Some(path) = path else {
        return Ok(TrackerConfig::default());
    };
    let text = std::fs::read_to_string(path).map_err(|source| SimError::Io {
        path: path.to_string(),
        source,
    })?;
    Ok(TrackerConfig::from_json(&text)?)
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("RearView Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!("Available scenarios: single_target, overtake, parallel_pair, clutter, dropout, all");
                std::process::exit(1);
            }
        }
    };

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = args.seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed)
            .with_cycles(args.cycles)
            .with_config(config.clone());

        for scenario in &scenarios {
            let result = match runner.run(*scenario) {
                Ok(result) => result,
                Err(e) => {
                    error!("✗ {} (seed={}) aborted: {}", scenario.name(), seed, e);
                    failed_count += 1;
                    continue;
                }
            };

            if !args.json {
                if result.passed {
                    info!(
                        "✓ {} (seed={}) PASSED | tracks={} | rmse={}",
                        scenario.name(),
                        seed,
                        result.metrics.tracks_created,
                        result.rmse.map_or("n/a".to_string(), |r| format!("{:.3}m", r))
                    );
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if !result.passed {
                failed_count += 1;
            }

            all_results.push(result);
        }
    }

    let total = args.seeds * scenarios.len();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to serialize summary: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
