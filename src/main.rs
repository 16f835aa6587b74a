//! # Main — CLI Entry Point
//!
//! Fermat PRP testing of k·b^n+c candidates. For the Proth-shaped case
//! (b = 2, c = 1) the exponent N−1 = k·2^n splits into a short raise to the
//! k-th power followed by n Gerbicz-checked squarings; anything else runs
//! the full N−1 exponent through plain binary exponentiation.
//!
//! ## Global Options
//!
//! - `--checkpoint`: prefix for the state files (working and recovery).
//! - `--points`: how many checkpoints to schedule across the squaring run.
//! - `--no-gerbicz`: disable the error-checked path.
//! - `LOG_FORMAT=json`: structured JSON logs for fleet ingestion.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use rug::Integer;
use tracing::{debug, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use deepsquare::checkpoint::StateFile;
use deepsquare::fast::FastExp;
use deepsquare::gerbicz::GerbiczCheckMultipointExp;
use deepsquare::gw::GwState;
use deepsquare::input::InputNum;
use deepsquare::progress::Progress;

#[derive(Parser)]
#[command(
    name = "deepsquare",
    about = "Gerbicz-checked Fermat PRP testing of k*b^n+c candidates"
)]
struct Cli {
    /// Multiplier k
    #[arg(long)]
    k: u64,

    /// Base b of the modulus
    #[arg(long)]
    b: u32,

    /// Exponent n
    #[arg(long)]
    n: u64,

    /// Additive constant c
    #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
    c: i64,

    /// PRP test base
    #[arg(long, default_value_t = 3)]
    base: u32,

    /// Prefix for checkpoint state files
    #[arg(long, default_value = "deepsquare")]
    checkpoint: PathBuf,

    /// Number of scheduled checkpoints across the squaring run
    #[arg(long, default_value_t = 8)]
    points: u64,

    /// Disable the Gerbicz error-checked path
    #[arg(long)]
    no_gerbicz: bool,

    /// Force the per-multiplication roundoff check on
    #[arg(long)]
    force_error_check: bool,
}

/// Evenly spaced checkpoint schedule over `n` iterations, ending at `n`.
fn point_schedule(n: u64, count: u64) -> Vec<u64> {
    let count = count.max(1);
    let mut points: Vec<u64> = (1..=count).map(|i| n * i / count).collect();
    points.dedup();
    points.retain(|&p| p > 0);
    points
}

fn main() -> Result<()> {
    // Structured logging: LOG_FORMAT=json for fleet ingestion, human-readable otherwise
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt().json().with_target(false).init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    let input = InputNum::new(cli.k, cli.b, cli.n, cli.c);
    let modulus = input.value();

    let mut gw = GwState::new();
    input.setup(&mut gw)?;
    info!("testing {} using {}", input, gw.fft_description());

    let abort = Arc::new(AtomicBool::new(false));
    let progress = Progress::new();
    *progress.current.lock().unwrap() = input.display_text();
    let reporter = progress.start_reporter();

    let residue = if cli.b == 2 && cli.c == 1 && cli.n >= 2 && !cli.no_gerbicz {
        // N-1 = k*2^n: short raise to the k-th power, then n checked squarings.
        let start = Integer::from(cli.base)
            .pow_mod(&Integer::from(cli.k), &modulus)
            .map_err(|_| anyhow!("pow_mod rejected exponent {}", cli.k))?;
        let work = StateFile::new(cli.checkpoint.with_extension("work.json"));
        let recovery = StateFile::new(cli.checkpoint.with_extension("recovery.json"));
        let mut task = GerbiczCheckMultipointExp::new(
            input.clone(),
            2,
            point_schedule(cli.n, cli.points),
            start,
            work,
            recovery,
            Arc::clone(&abort),
        );
        task.core_mut().set_error_check(cli.force_error_check, true);
        task.core_mut().attach_progress(Arc::clone(&progress));
        task.set_on_point(Box::new(|i, _| debug!("point {} committed", i)));
        info!(
            cost = format_args!("{:.0}", task.cost()),
            l = task.l(),
            l2 = task.l2(),
            "Gerbicz-checked squaring schedule"
        );
        task.run(&mut gw)?;
        task.state().expect("completed state").x.clone()
    } else {
        let exp = modulus.clone() - 1u32;
        let file = StateFile::new(cli.checkpoint.with_extension("state.json"));
        let mut task = FastExp::new(input.clone(), exp, cli.base, file, Arc::clone(&abort));
        task.core_mut().set_error_check(cli.force_error_check, true);
        task.core_mut().attach_progress(Arc::clone(&progress));
        task.run(&mut gw)?;
        task.state().expect("completed state").x.clone()
    };

    progress.stop();
    drop(reporter);

    if residue == 1u32 {
        info!("{} is a Fermat PRP (base {})", input, cli.base);
    } else {
        let res64 = residue.clone().keep_bits(64).to_u64().unwrap_or(0);
        info!("{} is not prime. RES64: {:016X}", input, res64);
    }
    Ok(())
}
