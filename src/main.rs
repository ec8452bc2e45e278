//! # Dripline — lead messaging sequences
//!
//! Usage:
//!   dripline serve                                   # Run the dispatch poll loop
//!   dripline template add -a acct --name Welcome --subject "Hi" --body "Hello {{first_name}}"
//!   dripline enroll -a acct --file run.json          # Create a run (`-` reads stdin)
//!   dripline runs -a acct --limit 10                 # Recent runs with steps
//!   dripline run -a acct <run-id>                    # One run
//!   dripline dispatch -a acct [--run <run-id>]       # Manual dispatch pass

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dripline_core::config::DriplineConfig;
use dripline_core::error::DriplineError;
use dripline_core::traits::AutomationStore;
use dripline_core::types::{AccountId, CreateRunRequest, MessageTemplate};
use dripline_db::SqliteStore;
use dripline_scheduler::{AutomationService, DispatchSettings, spawn_dispatcher};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "dripline",
    version,
    about = "💧 Dripline — time-delayed lead messaging sequences"
)]
struct Cli {
    /// Config file (default: ~/.dripline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Database path, overrides `database.path`
    #[arg(long, global = true)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatch poll loop until Ctrl-C
    Serve,
    /// Manage message templates
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },
    /// Enroll a lead from a JSON create-run request
    Enroll {
        #[arg(short, long)]
        account: String,
        /// Request file, `-` for stdin
        #[arg(short, long)]
        file: String,
    },
    /// List recent runs
    Runs {
        #[arg(short, long)]
        account: String,
        #[arg(short, long)]
        limit: Option<i64>,
    },
    /// Show one run
    Run {
        #[arg(short, long)]
        account: String,
        id: String,
    },
    /// Dispatch due steps now
    Dispatch {
        #[arg(short, long)]
        account: String,
        /// Restrict the pass to one run
        #[arg(long)]
        run: Option<String>,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// Create a template and print its id
    Add {
        #[arg(short, long)]
        account: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
    },
    /// Soft-delete a template
    Remove {
        #[arg(short, long)]
        account: String,
        id: String,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(cli: &Cli) -> Result<DriplineConfig> {
    let mut config = match &cli.config {
        Some(path) => DriplineConfig::load_from(&expand_path(path))?,
        None => DriplineConfig::load()?,
    };
    if let Some(db) = &cli.db {
        config.database.path = db.clone();
    }
    Ok(config)
}

fn read_request(file: &str) -> Result<CreateRunRequest> {
    let raw = if file == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(expand_path(file))
            .with_context(|| format!("Failed to read {file}"))?
    };
    serde_json::from_str(&raw).context("Invalid create-run request")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Process exit code: 2 for rejected input, 1 for everything else.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<DriplineError>() {
        Some(e) if e.is_client_error() => 2,
        _ => 1,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "dripline=debug,dripline_scheduler=debug,dripline_channels=debug,dripline_db=debug"
    } else {
        "dripline=info,dripline_scheduler=info,dripline_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("❌ {e:#}");
        std::process::exit(exit_code(&e));
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let db_path = expand_path(&config.database.path);
    let store: Arc<dyn AutomationStore> = Arc::new(SqliteStore::open(&db_path)?);
    let transport = dripline_channels::transport_from_config(&config.delivery)?;
    let service = Arc::new(AutomationService::new(
        store.clone(),
        transport,
        DispatchSettings::from_config(&config.dispatch),
    ));

    match cli.command {
        Command::Serve => {
            println!("💧 Dripline v{}", env!("CARGO_PKG_VERSION"));
            println!("   🗄️  Database:  {}", db_path.display());
            println!("   📮 Provider:  {}", config.delivery.provider);
            println!("   ⏰ Interval:  {}s", config.dispatch.interval_secs);
            println!();

            let handle = spawn_dispatcher(service, &config.dispatch)?;
            tokio::signal::ctrl_c().await?;
            tracing::info!("🛑 Shutting down dispatcher");
            handle.abort();
        }
        Command::Template { action } => match action {
            TemplateAction::Add {
                account,
                name,
                subject,
                body,
            } => {
                let account = AccountId::parse(&account)?;
                let template = MessageTemplate::new(&account, &name, &subject, &body);
                store.insert_template(&template).await?;
                print_json(&template)?;
            }
            TemplateAction::Remove { account, id } => {
                let account = AccountId::parse(&account)?;
                if !store
                    .soft_delete_template(&account, &id, chrono::Utc::now())
                    .await?
                {
                    return Err(DriplineError::NotFound(format!("template {id}")).into());
                }
                println!("🗑️  Template {id} removed");
            }
        },
        Command::Enroll { account, file } => {
            let account = AccountId::parse(&account)?;
            let request = read_request(&file)?;
            let run = service.create_run(&account, &request).await?;
            print_json(&run)?;
        }
        Command::Runs { account, limit } => {
            let account = AccountId::parse(&account)?;
            print_json(&service.list_runs(&account, limit).await?)?;
        }
        Command::Run { account, id } => {
            let account = AccountId::parse(&account)?;
            print_json(&service.get_run(&account, &id).await?)?;
        }
        Command::Dispatch { account, run } => {
            let account = AccountId::parse(&account)?;
            print_json(&service.dispatch_due(&account, run.as_deref()).await?)?;
        }
    }

    Ok(())
}
