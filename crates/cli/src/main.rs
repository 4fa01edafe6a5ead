mod admin;
mod config;
mod error;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use catalog::{Catalog, SqliteCatalog, ToolDefinition};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use engine::{EngineApi, Health, WsConnector};
use runtime::model::{Chunk, ChunkKind};
use runtime::{
    Agent, AgentObserver, AnthropicBackend, ContentRef, Message, ToolBinder, ToolOutput,
    ToolRegistry, ToolReporter,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use config::{Config, DEFAULT_CONFIG_FILE};
use error::{Error, Result};

const SYSTEM_PROMPT: &str = "You are Atelier, an assistant that creates images with the \
    workflow tools you are given. Call a tool when the user asks for an image and reply with \
    the links it returns.";

#[derive(Parser)]
#[command(name = "atelier")]
#[command(about = "Expose image-generation workflows as model tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Log filter, e.g. "debug" or "runtime=trace" (overrides RUST_LOG)
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tool server and the admin surface
    Serve,
    /// List tools in the catalog
    Tools,
    /// Probe the generation engine
    Health,
    /// Run one tool and print its results
    Run {
        /// Tool name
        name: String,
        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },
    /// Chat with a model that can call the tools
    Chat,
    /// Import tool definitions from a JSON file
    Import {
        /// File holding one definition or an array of them
        file: PathBuf,
    },
    /// Enable a tool
    Enable {
        /// Tool id
        id: String,
    },
    /// Disable a tool
    Disable {
        /// Tool id
        id: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());
    let config = Config::resolve(&cli.config)?;

    match cli.command {
        Commands::Serve => cmd_serve(&config).await,
        Commands::Tools => cmd_tools(&config),
        Commands::Health => cmd_health(&config).await,
        Commands::Run { name, args } => cmd_run(&config, &name, &args).await,
        Commands::Chat => cmd_chat(&config).await,
        Commands::Import { file } => cmd_import(&config, &file),
        Commands::Enable { id } => cmd_set_enabled(&config, &id, true),
        Commands::Disable { id } => cmd_set_enabled(&config, &id, false),
    }
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn open_catalog(config: &Config) -> Result<SqliteCatalog> {
    Ok(SqliteCatalog::open(&config.catalog.path)?)
}

fn build_registry(config: &Config) -> Result<Arc<ToolRegistry>> {
    let binder = ToolBinder::new(Arc::new(config.engine()?), Arc::new(WsConnector))
        .with_sink(config.sink()?)
        .with_timeout(config.job_timeout());
    let catalog: Arc<dyn Catalog> = Arc::new(open_catalog(config)?);
    let registry = ToolRegistry::new(catalog, binder, config.tool_addr()?);
    Ok(Arc::new(registry))
}

async fn cmd_serve(config: &Config) -> Result<()> {
    let registry = build_registry(config)?;
    let tool_addr = registry.restart().await?;

    let admin_addr = config.admin_addr()?;
    let listener = TcpListener::bind(admin_addr)
        .await
        .map_err(|source| mcp::Error::Bind {
            addr: admin_addr,
            source,
        })?;
    println!("Tool server: http://{tool_addr}/mcp");
    println!("Admin:       http://{admin_addr}");

    axum::serve(listener, admin::router(Arc::clone(&registry)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    registry.stop().await?;
    Ok(())
}

fn cmd_tools(config: &Config) -> Result<()> {
    let tools = open_catalog(config)?.list()?;
    if tools.is_empty() {
        println!("No tools found. Import some with 'atelier import <file>'.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<24}  {:<8}  {:<6}  UPDATED",
        "ID", "NAME", "ENABLED", "PARAMS"
    );
    println!("{}", "-".repeat(96));
    for tool in tools {
        let updated = Local
            .from_utc_datetime(&tool.updated_at.naive_utc())
            .format("%Y-%m-%d %H:%M");
        let enabled = if tool.enabled { "yes" } else { "no" };
        println!(
            "{:<36}  {:<24}  {:<8}  {:<6}  {updated}",
            tool.id, tool.name, enabled, tool.parameter_count
        );
    }
    Ok(())
}

async fn cmd_health(config: &Config) -> Result<()> {
    let engine = config.engine()?;
    let host = engine.endpoint().host().to_string();
    match engine.health().await {
        Health::Healthy => {
            println!("{host}: healthy");
            Ok(())
        }
        Health::Unhealthy(detail) | Health::Unreachable(detail) => {
            Err(Error::Unhealthy(format!("{host}: {detail}")))
        }
    }
}

/// Prints tool progress on stderr.
struct ConsoleReporter;

impl ToolReporter for ConsoleReporter {
    fn progress(&self, current: u64, total: Option<u64>, message: Option<&str>) {
        match (total, message) {
            (Some(total), Some(message)) => eprintln!("[{current}/{total}] {message}"),
            (Some(total), None) => eprintln!("[{current}/{total}]"),
            (None, _) => eprintln!("[{current}]"),
        }
    }
}

async fn cmd_run(config: &Config, name: &str, args: &str) -> Result<()> {
    let input: Value = serde_json::from_str(args)?;
    let registry = build_registry(config)?;
    registry.rebuild()?;

    match registry.call(name, &input, &ConsoleReporter).await? {
        ToolOutput::Text(text) => println!("{text}"),
        ToolOutput::Content(contents) => {
            for ContentRef {
                uri, mime_type, ..
            } in contents
            {
                println!("{uri}  ({mime_type})");
            }
        }
    }
    Ok(())
}

/// Streams model text to stdout and marks tool activity.
struct ConsoleObserver;

impl AgentObserver for ConsoleObserver {
    fn on_segment_end(&mut self, kind: ChunkKind) {
        if kind == ChunkKind::Text {
            println!();
        }
    }

    fn on_chunk(&mut self, chunk: &Chunk) {
        match chunk {
            Chunk::TextDelta(delta) => {
                print!("{delta}");
                let _ = io::stdout().flush();
            }
            Chunk::ToolCall { call, .. } => eprintln!("[calling {}]", call.name),
            Chunk::ToolResult(result) if result.is_error() => {
                eprintln!("[{} failed: {}]", result.call.name, result.output_text());
            }
            _ => {}
        }
    }
}

async fn cmd_chat(config: &Config) -> Result<()> {
    println!("atelier v{}", env!("CARGO_PKG_VERSION"));

    let system = config.agent.system.as_deref().unwrap_or(SYSTEM_PROMPT);
    let backend = AnthropicBackend::builder(config.api_key()?, &config.model.model)
        .max_tokens(config.model.max_tokens)
        .system(system)
        .build();
    let registry = build_registry(config)?;
    let count = registry.rebuild()?;
    let agent = Agent::new(backend, Arc::clone(&registry))
        .with_max_iterations(config.agent.max_iterations);

    println!("Model: {}", config.model.model);
    println!("Tools: {count} (+ engine health check)");
    println!("Type 'quit' or Ctrl+D to exit.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut history: Vec<Message> = Vec::new();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            // EOF
            break;
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            break;
        }

        let mut messages = history.clone();
        messages.push(Message::user(input));
        match agent.execute(messages, &mut ConsoleObserver).await {
            Ok(outcome) => {
                history = outcome.messages;
                println!();
            }
            Err(e) => eprintln!("Error: {e}\n"),
        }
    }

    println!("\nBye.");
    Ok(())
}

fn cmd_import(config: &Config, file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)?;
    let definitions = ToolDefinition::parse_many(&text)?;
    let catalog = open_catalog(config)?;
    for definition in &definitions {
        catalog.upsert(definition)?;
        println!("Imported {} ({})", definition.name, definition.id);
    }
    println!("{} tool(s) imported.", definitions.len());
    Ok(())
}

fn cmd_set_enabled(config: &Config, id: &str, enabled: bool) -> Result<()> {
    open_catalog(config)?.set_enabled(id, enabled)?;
    let state = if enabled { "enabled" } else { "disabled" };
    println!("Tool {id} {state}. Restart a running server with PUT /mcp/restart.");
    Ok(())
}
