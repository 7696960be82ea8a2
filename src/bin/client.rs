//! # Vault Client Binary
//!
//! Line-oriented console over one server connection.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mnemo_vault::config::{self, Config};
use mnemo_vault::{ClientHandler, LayerSuite, Notification, Notifier, ProtocolResult};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const HELP: &str = "\
commands:
  login <login> <password>     log into an existing account
  create <login> <password>    create an account
  config [layers]              send the layer configuration
  add <field>;<field>;...      store an entry, field 0 is its type
  delete <index>               delete an entry
  search [pattern]             list entries containing pattern
  state                        show the protocol state
  quit";

/// Mnemo vault client
#[derive(Parser)]
#[command(name = "mnemo-client")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server address, overrides the configuration
    #[arg(short, long)]
    server: Option<SocketAddr>,
}

fn render(notification: Notification) {
    match notification {
        Notification::Entries(entries) => {
            println!("< {} entries", entries.len());
            for entry in entries {
                println!("  [{}] {}", entry.index, entry.fields.join(" | "));
            }
        }
        Notification::Error(e) => println!("! {}", e),
        other => println!("< {}", other.message()),
    }
}

async fn dispatch(client: &ClientHandler, config: &Config, line: &str) -> ProtocolResult<()> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match command {
        "login" | "create" => {
            let (login, password) = rest.split_once(' ').unwrap_or((rest, ""));
            if command == "login" {
                client.login(login, password.trim()).await
            } else {
                client.create_account(login, password.trim()).await
            }
        }
        "config" => {
            let suite: LayerSuite = if rest.is_empty() {
                config.crypto.layer_suite()?
            } else {
                rest.parse()?
            };
            client.configure(&suite).await
        }
        "add" => {
            let fields: Vec<String> = rest.split(';').map(|f| f.trim().to_string()).collect();
            client.add_data(&fields).await
        }
        "delete" => match rest.parse::<u32>() {
            Ok(index) => client.delete_data(index).await,
            Err(_) => {
                println!("! delete needs an entry index");
                Ok(())
            }
        },
        "search" => client.search_data(rest).await,
        "state" => {
            println!("< {}", client.state().await);
            Ok(())
        }
        _ => {
            println!("{}", HELP);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install logging")?;

    let mut config = match &cli.config {
        Some(path) => config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    if let Some(server) = cli.server {
        config.client.server = server;
    }
    config.validate()?;

    let (notifier, mut notifications) = Notifier::channel();
    let client = ClientHandler::connect(
        config.client.server,
        config.client.connect_timeout(),
        config.crypto.kdf_params(),
        notifier,
    )
    .await
    .with_context(|| format!("Failed to connect to {}", config.client.server))?;
    info!("Connected to {}", config.client.server);

    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            render(notification);
        }
    });

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            break;
        }
        if let Err(e) = dispatch(&client, &config, line).await {
            println!("! {}", e);
        }
    }

    client.close().await;
    info!("Disconnected");
    Ok(())
}
