//! CLI comparing sequential and OCC parallel execution of a bank workload.

use anyhow::{bail, Context};
use clap::Parser;
use occ_bench::{
    DeclarationMode, Executor, MessageMix, OccExecutor, SequentialExecutor, Workload,
    WorkloadConfig,
};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "occ-bench", version, about = "OCC parallel execution benchmark")]
struct Args {
    /// Number of funded accounts
    #[arg(long, default_value_t = 1000)]
    accounts: usize,

    /// Transactions per run
    #[arg(long, default_value_t = 1000)]
    transactions: usize,

    /// Conflict factors to run, comma separated
    #[arg(long, value_delimiter = ',', default_value = "0,0.25,0.5,0.75,1")]
    conflicts: Vec<f64>,

    /// Worker threads (0 = one per transaction)
    #[arg(long, short, default_value_t = 4)]
    threads: usize,

    /// Per-transaction invalidation budget (default: block length + 1)
    #[arg(long)]
    max_retries: Option<usize>,

    /// Skip signature verification
    #[arg(long)]
    no_verify: bool,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// How access operations are declared
    #[arg(long, value_enum, default_value_t = DeclarationMode::Accurate)]
    declarations: DeclarationMode,

    /// Share of mint messages
    #[arg(long, default_value_t = 0.0)]
    mint: f64,

    /// Share of memo messages
    #[arg(long, default_value_t = 0.0)]
    memo: f64,

    /// Share of sweep messages
    #[arg(long, default_value_t = 0.0)]
    sweep: f64,

    /// Share of heartbeat messages
    #[arg(long, default_value_t = 0.0)]
    heartbeat: f64,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let verify = !args.no_verify;
    let sequential = SequentialExecutor::new(verify);
    let mut occ = OccExecutor::new(args.threads, verify).with_declarations(args.declarations);
    if let Some(max_retries) = args.max_retries {
        occ = occ.with_max_retries(max_retries);
    }

    println!("=== OCC Parallel Execution Benchmark ===\n");
    println!(
        "Configuration: {} accounts, {} transactions per run, {} threads, {:?} declarations, signatures {}\n",
        args.accounts,
        args.transactions,
        args.threads,
        args.declarations,
        if verify { "verified" } else { "skipped" }
    );
    println!(
        "{:>9} | {:>6} | {:>10} | {:>10} | {:>7} | {:>6} | {:>10} | {:>8}",
        "conflicts", "ok", "seq ms", "occ ms", "speedup", "rounds", "executions", "invalid"
    );

    for &conflict_factor in &args.conflicts {
        let config = WorkloadConfig {
            num_accounts: args.accounts,
            num_transactions: args.transactions,
            conflict_factor,
            seed: args.seed,
            chain_id: 1,
            mix: MessageMix {
                mint: args.mint,
                memo: args.memo,
                sweep: args.sweep,
                heartbeat: args.heartbeat,
            },
        };

        // Generate workload (includes signing).
        let workload = Workload::generate(config).context("signing workload")?;

        let (seq_elapsed, (seq_store, seq_result)) =
            timed(|| sequential.execute(workload.create_store(), &workload))?;
        let (occ_elapsed, (occ_store, occ_result)) =
            timed(|| occ.execute(workload.create_store(), &workload)).with_context(|| {
                format!("OCC execution at conflict factor {conflict_factor}")
            })?;

        if occ_store != seq_store || occ_result.outcomes != seq_result.outcomes {
            bail!(
                "OCC state diverged from sequential execution at conflict factor {conflict_factor}"
            );
        }

        let stats = occ_result.stats.unwrap_or_default();
        println!(
            "{:>9.2} | {:>6} | {:>10.2} | {:>10.2} | {:>6.2}x | {:>6} | {:>10} | {:>8}",
            conflict_factor,
            occ_result.successful,
            seq_elapsed.as_secs_f64() * 1000.0,
            occ_elapsed.as_secs_f64() * 1000.0,
            seq_elapsed.as_secs_f64() / occ_elapsed.as_secs_f64().max(f64::EPSILON),
            stats.rounds,
            stats.total_executions,
            stats.invalidations,
        );
    }

    Ok(())
}

fn timed<T, E>(f: impl FnOnce() -> Result<T, E>) -> Result<(Duration, T), E> {
    let start = Instant::now();
    let value = f()?;
    Ok((start.elapsed(), value))
}

fn init_tracing(verbosity: u8) {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        if let Ok(directive) = level.parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
