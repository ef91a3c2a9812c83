use clap::Parser;
use commission_ledger::config::LedgerConfig;
use commission_ledger::domain::ports::LedgerStoreRef;
use commission_ledger::infrastructure::in_memory::InMemoryLedgerStore;
use commission_ledger::interfaces::csv::command_reader::CommandReader;
use commission_ledger::interfaces::csv::snapshot_writer::SnapshotWriter;
use commission_ledger::interfaces::replay::Replay;
use commission_ledger::logging::init_logging;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input commands CSV file
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// JSON ledger configuration (optional). Defaults apply otherwise.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log more (-v info, -vv debug, -vvv trace). Logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[cfg(feature = "storage-rocksdb")]
fn open_store(db_path: Option<PathBuf>) -> Result<LedgerStoreRef> {
    use commission_ledger::infrastructure::rocksdb::RocksDbLedgerStore;

    match db_path {
        Some(path) => Ok(Arc::new(RocksDbLedgerStore::open(path).into_diagnostic()?)),
        None => Ok(Arc::new(InMemoryLedgerStore::new())),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_store(db_path: Option<PathBuf>) -> Result<LedgerStoreRef> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(Arc::new(InMemoryLedgerStore::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose).into_diagnostic()?;

    let config = match &cli.config {
        Some(path) => LedgerConfig::load(path).into_diagnostic()?,
        None => LedgerConfig::default(),
    };
    let store = open_store(cli.db_path)?;
    let mut replay = Replay::new(config, store).into_diagnostic()?;

    // Replay commands; a failing row is reported and skipped
    let file = File::open(cli.input).into_diagnostic()?;
    let reader = CommandReader::new(file);
    for (index, record) in reader.commands().enumerate() {
        // Row 1 is the header
        let row = index + 2;
        match record {
            Ok(record) => {
                if let Err(e) = replay.apply(&record).await {
                    eprintln!("Error processing command on row {row}: {e}");
                }
            }
            Err(e) => {
                eprintln!("Error reading command on row {row}: {e}");
            }
        }
    }

    let agents = replay.ledger().all_agent_snapshots().await.into_diagnostic()?;

    let stdout = io::stdout();
    let mut writer = SnapshotWriter::new(stdout.lock());
    writer.write_agents(agents).into_diagnostic()?;

    Ok(())
}
