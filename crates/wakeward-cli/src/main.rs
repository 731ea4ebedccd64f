use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "wakeward-cli", version, about = "Wakeward alarm engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Alarm management
    Alarm {
        #[command(subcommand)]
        action: commands::alarm::AlarmAction,
    },
    /// Inspect or clear the heartbeat ledger
    Ledger {
        #[command(subcommand)]
        action: commands::ledger::LedgerAction,
    },
    /// Run the startup reconciliation check against the on-disk store
    Reconcile(commands::reconcile::ReconcileArgs),
    /// Show the next fire instant of every enabled alarm
    Next,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("WAKEWARD_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Alarm { action } => commands::alarm::run(action),
        Commands::Ledger { action } => commands::ledger::run(action),
        Commands::Reconcile(args) => commands::reconcile::run(args),
        Commands::Next => commands::next::run(),
        Commands::Config { action } => commands::config::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
