use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use salesbridge_agent::{SessionCoordinator, UiEvent};
use salesbridge_core::config::Config;
use salesbridge_providers::AssistantService;
use salesbridge_providers::assistants::AssistantsClient;
use salesbridge_tools::{QueryStore, ToolRegistry};

mod render;

use render::TerminalRenderer;

#[derive(Parser)]
#[command(
    name = "salesbridge",
    about = "Ask questions about Contoso sales data through a hosted assistant",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the assistant (one-shot or interactive)
    Chat {
        /// Message to send (omit for interactive mode)
        #[arg(short, long)]
        message: Option<String>,

        /// Conversation identifier
        #[arg(long, default_value = "terminal")]
        conversation: String,
    },

    /// Print the database schema given to the assistant
    Schema,

    /// Run a query against the sales database
    Query {
        sql: String,

        /// Also print the machine-readable result
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show configuration status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a config value by dotted path
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

fn init_logging(config: &Config, verbose: bool) {
    let logging = config.logging.clone().unwrap_or_default();
    let level = logging
        .level
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string());
    let directives = std::iter::once(level)
        .chain(logging.filters)
        .collect::<Vec<_>>()
        .join(",");

    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directives)),
        )
        .with_writer(std::io::stderr);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Chat {
            message,
            conversation,
        } => chat(config, message, conversation).await?,
        Commands::Schema => {
            let store = QueryStore::open(config.database_path())?;
            println!("{}", serde_json::to_string_pretty(&store.tables()?)?);
        }
        Commands::Query { sql, json } => {
            let store = QueryStore::open(config.database_path())?;
            let result = store.execute(&sql);
            println!("{}", result.display_format);
            if json {
                println!("\n{}", result.json_format);
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => println!("{key} is not set"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Configuration OK");
            }
        },
        Commands::Status => {
            let service = config.service();
            let db = config.database_path();
            println!("SalesBridge v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Service style: {:?}", service.style);
            println!(
                "Endpoint: {}",
                config.endpoint().as_deref().unwrap_or("(default)")
            );
            println!(
                "Assistant: {}",
                service.assistant_id.as_deref().unwrap_or("(not set)")
            );
            println!(
                "API key: {}",
                if service.resolve_api_key().is_some() { "configured" } else { "missing" }
            );
            println!(
                "Database: {} ({})",
                db.display(),
                if db.exists() { "found" } else { "missing" }
            );
        }
    }

    Ok(())
}

async fn chat(config: Config, message: Option<String>, conversation: String) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let store = Arc::new(QueryStore::open(config.database_path())?);
    let tools = Arc::new(ToolRegistry::new(store));
    let service: Arc<dyn AssistantService> = Arc::new(AssistantsClient::from_config(&config)?);
    let coordinator = SessionCoordinator::new(service, tools, config.clone());

    let downloads = salesbridge_core::config::data_dir().join("downloads");
    let mut renderer = TerminalRenderer::new(std::io::stdout(), downloads);

    let thread_id = coordinator.start_session(&conversation).await?;
    tracing::info!(%conversation, %thread_id, "Session started");

    match message {
        Some(text) => turn(&coordinator, &conversation, &text, &mut renderer).await?,
        None => {
            println!("Ask about sales data. Type 'exit' to quit, Ctrl-C stops a response.");
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                print!("\n> ");
                std::io::Write::flush(&mut std::io::stdout())?;
                let Some(line) = lines.next_line().await? else { break };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if text == "exit" || text == "quit" {
                    break;
                }
                turn(&coordinator, &conversation, text, &mut renderer).await?;
            }
        }
    }

    coordinator.end_session(&conversation).await;
    Ok(())
}

/// Submit one message, rendering events as they arrive. Ctrl-C stops the
/// run instead of exiting.
async fn turn(
    coordinator: &SessionCoordinator,
    conversation: &str,
    text: &str,
    renderer: &mut TerminalRenderer<std::io::Stdout>,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<UiEvent>();
    let submit = coordinator.submit(conversation, text, tx);
    tokio::pin!(submit);

    let result = loop {
        tokio::select! {
            result = &mut submit => break result,
            Some(event) = rx.recv() => renderer.handle(event)?,
            _ = tokio::signal::ctrl_c() => {
                coordinator.stop(conversation).await;
            }
        }
    };

    while let Ok(event) = rx.try_recv() {
        renderer.handle(event)?;
    }

    match result {
        Ok(outcome) => tracing::debug!(?outcome, "Turn complete"),
        Err(e) => tracing::warn!(error = %e, "Message not processed"),
    }
    Ok(())
}
