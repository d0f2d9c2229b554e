//! gridtx - runs a concurrent transfer workload against an in-process cluster

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser as ClapParser;
use gridtx::distribution::MemberId;
use gridtx::region::RegionKind;
use gridtx::transaction::TransactionError;
use gridtx::{Cache, Region, TransactionConfig};
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Concurrent account transfers over the transaction engine
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of cluster members
    #[arg(short, long, default_value = "3")]
    members: u32,

    /// Worker threads
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Transfers per worker
    #[arg(short = 'n', long, default_value = "1000")]
    transactions: usize,

    /// Number of accounts
    #[arg(short, long, default_value = "16")]
    accounts: usize,

    /// Opening balance of each account
    #[arg(short, long, default_value = "1000")]
    balance: u64,

    /// Attempts per transfer before giving up
    #[arg(short, long, default_value = "50")]
    retries: usize,

    /// Validate reads at commit time
    #[arg(short, long)]
    strict: bool,

    /// Per-commit replication timeout in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    if args.members == 0 || args.accounts < 2 {
        bail!("need at least one member and two accounts");
    }

    let config = TransactionConfig::new()
        .with_strict_reads(args.strict)
        .with_operation_timeout(Duration::from_millis(args.timeout_ms));
    let members: Vec<MemberId> = (1..=args.members).map(MemberId::new).collect();
    let cache = Cache::in_process(config, members[0], &members);
    let accounts = cache
        .create_region("accounts", RegionKind::Replicated)
        .context("Failed to create accounts region")?;

    for account in 0..args.accounts {
        accounts
            .put(account_key(account), encode(args.balance))
            .context("Failed to seed account")?;
    }
    let expected_total = args.balance * args.accounts as u64;
    log::info!(
        "seeded {} accounts on {} members, total {}",
        args.accounts,
        args.members,
        expected_total
    );

    let started = Instant::now();
    let workers: Vec<_> = (0..args.threads)
        .map(|worker| {
            let accounts = accounts.clone();
            let manager = Arc::clone(cache.transaction_manager());
            let count = args.accounts;
            let transfers = args.transactions;
            let retries = args.retries;
            thread::spawn(move || -> Result<usize> {
                let mut rng = rand::thread_rng();
                let mut gave_up = 0;
                for _ in 0..transfers {
                    let from = rng.gen_range(0..count);
                    let to = (from + rng.gen_range(1..count)) % count;
                    let amount = rng.gen_range(1..=10);
                    if !transfer_with_retry(&manager, &accounts, from, to, amount, retries)? {
                        gave_up += 1;
                    }
                }
                log::debug!("worker {} finished, {} transfers abandoned", worker, gave_up);
                Ok(gave_up)
            })
        })
        .collect();

    let mut abandoned = 0;
    for worker in workers {
        abandoned += worker
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
    }
    let elapsed = started.elapsed();

    let mut total = 0;
    for account in 0..args.accounts {
        total += balance(&accounts, account)?;
    }

    let stats = cache.transaction_manager().stats();
    println!("elapsed:           {:?}", elapsed);
    println!("begun:             {}", stats.begins);
    println!("committed:         {}", stats.commits);
    println!("conflicts:         {}", stats.conflicts);
    println!("not colocated:     {}", stats.not_colocated);
    println!("other failures:    {}", stats.other_failures);
    println!("rolled back:       {}", stats.rollbacks);
    println!("degraded commits:  {}", stats.degraded_commits);
    println!("markers placed:    {}", stats.markers_placed);
    println!("marker timeouts:   {}", stats.reservation_timeouts);
    println!("abandoned:         {}", abandoned);
    println!("total balance:     {} (expected {})", total, expected_total);

    if total != expected_total {
        bail!(
            "balance not conserved: {} != {}",
            total,
            expected_total
        );
    }
    Ok(())
}

/// Runs one transfer, retrying while the failure is retryable. Returns
/// `false` if every attempt failed.
fn transfer_with_retry(
    manager: &gridtx::transaction::TransactionManager,
    accounts: &Region,
    from: usize,
    to: usize,
    amount: u64,
    retries: usize,
) -> Result<bool> {
    for attempt in 1..=retries {
        manager.begin()?;
        let result = transfer(accounts, from, to, amount).and_then(|moved| {
            if moved {
                manager.commit().map(|_| ())
            } else {
                manager.rollback()
            }
        });
        match result {
            Ok(()) => return Ok(true),
            Err(e) if e.is_retryable() => {
                if manager.exists() {
                    manager.rollback()?;
                }
                log::debug!("transfer {} -> {} attempt {} failed: {}", from, to, attempt, e);
                thread::yield_now();
            }
            Err(e) => {
                if manager.exists() {
                    manager.rollback()?;
                }
                return Err(e).context("transfer failed");
            }
        }
    }
    Ok(false)
}

/// Buffers the transfer in the current transaction. Returns `false` when the
/// source cannot cover the amount.
fn transfer(
    accounts: &Region,
    from: usize,
    to: usize,
    amount: u64,
) -> std::result::Result<bool, TransactionError> {
    let source = accounts.get(account_key(from))?.map(decode).unwrap_or(0);
    if source < amount {
        return Ok(false);
    }
    let target = accounts.get(account_key(to))?.map(decode).unwrap_or(0);
    accounts.put(account_key(from), encode(source - amount))?;
    accounts.put(account_key(to), encode(target + amount))?;
    Ok(true)
}

fn balance(accounts: &Region, account: usize) -> Result<u64> {
    let value = accounts
        .get(account_key(account))?
        .with_context(|| format!("account {} is missing", account))?;
    Ok(decode(value))
}

fn account_key(account: usize) -> String {
    format!("account-{:04}", account)
}

fn encode(balance: u64) -> Bytes {
    Bytes::copy_from_slice(&balance.to_be_bytes())
}

fn decode(value: Bytes) -> u64 {
    let mut raw = [0u8; 8];
    let len = value.len().min(8);
    raw[8 - len..].copy_from_slice(&value[value.len() - len..]);
    u64::from_be_bytes(raw)
}
