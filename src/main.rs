use chrono::Duration;
use clap::{Parser, Subcommand, ValueEnum};
use miette::Result;
use recurbill::application::config::BillingConfig;
use recurbill::application::engine::{BillingEngine, Stores};
use recurbill::application::scheduler::DueBillingScheduler;
use recurbill::application::sweeper::VerificationSweeper;
use recurbill::domain::gateway::Locale;
use recurbill::error::BillingError;
use recurbill::infrastructure::events::TracingEventSink;
use recurbill::infrastructure::in_memory::{
    InMemoryBillableDirectory, InMemoryCardStore, InMemorySubscriptionStore,
    InMemoryTransactionStore,
};
use recurbill::infrastructure::sandbox::SandboxGateway;
use recurbill::interfaces::csv::report_writer::ReportWriter;
use recurbill::interfaces::seed::Seed;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing_subscriber::EnvFilter;

/// One year and a day.
const MAX_GRACE_MINUTES: i64 = 60 * 24 * 366;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// JSON snapshot of customers, cards, subscriptions and transactions to load first
    #[arg(long, global = true)]
    seed: Option<PathBuf>,

    #[arg(long, global = true, env = "BILLING_GATEWAY_TIMEOUT_SECS", default_value_t = 30)]
    gateway_timeout_secs: u64,

    #[arg(long, global = true, env = "BILLING_THREEDS_CALLBACK_URL")]
    threeds_callback_url: Option<String>,

    #[arg(long, global = true, env = "BILLING_BKM_CALLBACK_URL")]
    bkm_callback_url: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = LocaleArg::Tr)]
    locale: LocaleArg,
}

#[derive(Subcommand)]
enum Command {
    /// Charge every subscription whose next charge date has passed
    RunDueBilling,
    /// Void or refund card verification charges
    ReverseStaleVerifications {
        /// Minimum age of a verification before it is reversed
        #[arg(long, value_parser = clap::value_parser!(i64).range(0..=MAX_GRACE_MINUTES))]
        grace_minutes: Option<i64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LocaleArg {
    Tr,
    En,
}

impl From<LocaleArg> for Locale {
    fn from(arg: LocaleArg) -> Self {
        match arg {
            LocaleArg::Tr => Locale::Tr,
            LocaleArg::En => Locale::En,
        }
    }
}

impl Cli {
    fn config(&self) -> BillingConfig {
        let mut config = BillingConfig {
            gateway_timeout: StdDuration::from_secs(self.gateway_timeout_secs),
            locale: self.locale.into(),
            ..BillingConfig::default()
        };
        if let Some(url) = &self.threeds_callback_url {
            config.threeds_callback_url = url.clone();
        }
        if let Some(url) = &self.bkm_callback_url {
            config.bkm_callback_url = url.clone();
        }
        config
    }
}

fn in_memory_stores() -> Stores {
    Stores {
        transactions: Box::new(InMemoryTransactionStore::new()),
        subscriptions: Box::new(InMemorySubscriptionStore::new()),
        cards: Box::new(InMemoryCardStore::new()),
        billables: Box::new(InMemoryBillableDirectory::new()),
    }
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    use recurbill::infrastructure::rocksdb::RocksDBStore;

    let Some(db_path) = db_path else {
        return Ok(in_memory_stores());
    };
    let store = RocksDBStore::open(db_path)?;
    Ok(Stores {
        transactions: Box::new(store.clone()),
        subscriptions: Box::new(store.clone()),
        cards: Box::new(store.clone()),
        billables: Box::new(store),
    })
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(in_memory_stores())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config();
    let stores = open_stores(cli.db_path.clone())?;

    let gateway = SandboxGateway::new();
    if let Some(path) = &cli.seed {
        let seed = Seed::from_path(path)?;
        for tx in &seed.transactions {
            gateway.adopt(tx).await;
        }
        seed.load(&stores).await?;
    }

    let engine = Arc::new(BillingEngine::new(
        stores,
        Box::new(gateway),
        Box::new(TracingEventSink),
        config,
    ));

    let stdout = io::stdout();
    let mut writer = ReportWriter::new(stdout.lock());
    let processed = match cli.command {
        Command::RunDueBilling => {
            let report = DueBillingScheduler::new(engine).run().await?;
            writer.write_due_charges(&report)?;
            report.len()
        }
        Command::ReverseStaleVerifications { grace_minutes } => {
            let mut sweeper = VerificationSweeper::new(engine);
            if let Some(minutes) = grace_minutes {
                let grace = Duration::try_minutes(minutes).ok_or_else(|| {
                    BillingError::InvalidArgument(format!("--grace-minutes {minutes} is out of range"))
                })?;
                sweeper = sweeper.with_grace(grace);
            }
            let report = sweeper.run().await?;
            writer.write_reversals(&report)?;
            report.len()
        }
    };
    eprintln!("processed {processed}");

    Ok(())
}
