//! ledger - inspect and resubmit captures recorded by `captured`

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::sync::Arc;

use capture_pipeline::{
    DedupLedger, FilesystemResultStore, Fingerprint, ProcessingState, SystemClock,
};

#[derive(Parser, Debug)]
#[command(name = "ledger", about = "Inspect the capture pipeline ledger")]
struct Args {
    /// Pipeline database
    #[arg(long, env = "CAPTURE_DB_PATH", default_value = "data/pipeline.db", global = true)]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List processing records, oldest first
    List {
        /// Only records in this state (pending, stabilizing, detecting,
        /// succeeded, failed, dead_lettered)
        #[arg(long)]
        state: Option<String>,
    },

    /// Record counts per state
    Stats,

    /// Show one record with its retry task and committed result
    Show { fingerprint: String },

    /// Return a dead-lettered record to the retry path
    Resubmit { fingerprint: String },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    // Attempt limits only matter to the daemon; any value works for inspection.
    let ledger = DedupLedger::open_sqlite(&args.db, Arc::new(SystemClock), u32::MAX)?;

    match args.command {
        Command::List { state } => {
            let state = state.as_deref().map(ProcessingState::parse).transpose()?;
            let records = ledger.records(state)?;
            for record in &records {
                println!(
                    "{}  {:<13} attempts={} last_error={} {}",
                    record.fingerprint,
                    record.state.as_str(),
                    record.attempts,
                    record.last_error.map(|k| k.as_str()).unwrap_or("-"),
                    record.source_path.display()
                );
            }
            eprintln!("{} record(s)", records.len());
        }
        Command::Stats => {
            let mut counts: BTreeMap<&'static str, usize> =
                ProcessingState::ALL.iter().map(|s| (s.as_str(), 0)).collect();
            for record in ledger.records(None)? {
                *counts.entry(record.state.as_str()).or_insert(0) += 1;
            }
            for (state, count) in counts {
                println!("{:<13} {}", state, count);
            }
            println!("{:<13} {}", "retry_tasks", ledger.retry_tasks()?.len());
        }
        Command::Show { fingerprint } => {
            let fingerprint = Fingerprint::from_hex(&fingerprint)?;
            let record = ledger
                .get(&fingerprint)?
                .ok_or_else(|| anyhow!("no record for {}", fingerprint))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            if let Some(task) = ledger.retry_task(&fingerprint)? {
                println!("retry task: {}", serde_json::to_string_pretty(&task)?);
            }
            if let Some(result) = FilesystemResultStore::lookup(&args.db, &fingerprint)? {
                println!("result: {}", serde_json::to_string_pretty(&result)?);
            }
        }
        Command::Resubmit { fingerprint } => {
            let fingerprint = Fingerprint::from_hex(&fingerprint)?;
            let record = ledger.resubmit(&fingerprint)?;
            println!(
                "{} resubmitted; it is retried on the next daemon start or when the file is captured again",
                record.fingerprint
            );
        }
    }
    Ok(())
}
