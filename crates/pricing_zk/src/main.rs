//! Pricing ZK - billing demo
//!
//! `produce` runs one interval and stores one user's record, `verify` runs
//! the user's checks on a stored record.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use pricing_zk::{Aggregate, BillingSession, ProtocolConfig, Result, Scheme, UserId, UserRecord};

/// Verifiable billing over hidden meter readings
#[derive(Parser, Debug)]
#[command(name = "pricing-zk")]
#[command(version)]
#[command(about = "Verifiable billing over hidden meter readings", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one billing interval and save a user's record
    Produce {
        /// Number of users
        #[arg(short = 'n', long, default_value_t = 10)]
        users: usize,

        /// Aggregation scheme
        #[arg(short, long, value_enum, default_value_t = Scheme::Tree)]
        scheme: Scheme,

        /// Readings are drawn from [0, max-reading)
        #[arg(long, default_value_t = 100)]
        max_reading: u64,

        /// User whose record is saved
        #[arg(short, long, default_value_t = 0)]
        user: UserId,

        /// Where to save the record
        #[arg(short, long, default_value = "user.json")]
        out: PathBuf,

        /// Also run the checks of every user
        #[arg(long)]
        check_all: bool,
    },

    /// Run the three checks on a saved record
    Verify {
        #[arg(short, long, default_value = "user.json")]
        record: PathBuf,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let result = match args.command {
        Command::Produce {
            users,
            scheme,
            max_reading,
            user,
            out,
            check_all,
        } => produce(users, scheme, max_reading, user, &out, check_all),
        Command::Verify { record } => verify(&record),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn produce(
    users: usize,
    scheme: Scheme,
    max_reading: u64,
    user: UserId,
    out: &Path,
    check_all: bool,
) -> Result<bool> {
    let config = ProtocolConfig::from_env()?;
    log::info!(
        "Interval with {} users, scheme {}, delta {}, gamma {}",
        users,
        scheme,
        config.delta,
        config.gamma
    );

    let start = Instant::now();
    let mut session = BillingSession::initialize(users, config)?;
    session.draw_readings(max_reading)?;
    session.share_readings();
    let shared = Instant::now();

    let sum = session.process(scheme)?.sum();
    let record = session.record_for(user)?;
    let processed = Instant::now();
    log::info!("sum: {}", sum);

    record.save(out)?;
    log::info!("Saved record of user {} to {}", user, out.display());

    let mut accepted = true;
    if check_all {
        for report in session.verify_all()? {
            println!("{}", report);
            accepted &= report.accepted();
        }
    }
    let checked = Instant::now();

    log::info!("sharing: {:.3} seconds", (shared - start).as_secs_f64());
    log::info!("processing: {:.3} seconds", (processed - shared).as_secs_f64());
    if check_all {
        log::info!("checking: {:.3} seconds", (checked - processed).as_secs_f64());
    }
    log::info!("total time: {:.3} seconds", (checked - start).as_secs_f64());

    Ok(accepted)
}

fn verify(path: &Path) -> Result<bool> {
    let start = Instant::now();
    let record = UserRecord::load(path)?;
    log::info!(
        "Verifying user {} of {} ({} scheme)",
        record.user,
        record.population,
        record.bundle.scheme()
    );

    let report = record.verify();
    println!("{}", report);
    log::info!("checking: {:.3} seconds", start.elapsed().as_secs_f64());

    Ok(report.accepted())
}
