//! wshub server
//!
//! Run with: cargo run -- serve
//!
//! # Configuration
//!
//! Settings are read from a TOML file (see `wshub config`) and overridden by
//! environment variables:
//! - `WSHUB_HOST`, `WSHUB_PORT`: Address to bind (default: 0.0.0.0:8000)
//! - `WSHUB_ALLOWED_ORIGINS`: Comma-separated hosts allowed to connect
//! - `WSHUB_TOKEN_SECRET`: Secret used to verify subscription tokens
//! - `WSHUB_TOKENIZER`: hmac_sha256 (default) or hmac_sha512
//! - `WSHUB_LOG_LEVEL`, `WSHUB_LOG_FORMAT`: Logging (default: info, pretty)
//! - `RUST_LOG`: Full filter directives, overriding the log level

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use wshub::api::{serve, AppState};
use wshub::config::{generate_default_config, Config};
use wshub::websocket::{Hub, TokenizerKind};

#[derive(Parser)]
#[command(name = "wshub")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "WebSocket publish/subscribe hub")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the hub server
    Serve {
        /// Config file (default: search standard locations)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Host to bind, overriding the config
        #[arg(long)]
        host: Option<String>,
        /// Port to bind, overriding the config
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the subscription token for a username
    Token {
        /// Username to sign
        username: String,
        /// Secret (default: from config or WSHUB_TOKEN_SECRET)
        #[arg(short, long)]
        secret: Option<String>,
        /// hmac_sha256 or hmac_sha512 (default: from config)
        #[arg(short, long)]
        tokenizer: Option<TokenizerKind>,
        /// Config file (default: search standard locations)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, host, port } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            run_server(config).await?;
        }

        Commands::Token {
            username,
            secret,
            tokenizer,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            let kind = tokenizer.unwrap_or(config.auth.tokenizer);
            let secret = secret
                .or(config.auth.secret)
                .filter(|s| !s.is_empty())
                .context("No secret configured (use --secret or WSHUB_TOKEN_SECRET)")?;

            println!("{}", kind.build(secret).tokenize(&username));
        }

        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("Failed to write {:?}", path))?;
                    eprintln!("Wrote default config to {:?}", path);
                }
                None => print!("{}", content),
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    config.validate()?;
    Ok(config)
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    wshub::logging::init(&config.logging)?;

    tracing::info!("Starting wshub v{}", env!("CARGO_PKG_VERSION"));

    let tokenizer = config.auth.tokenizer();
    if tokenizer.is_none() {
        tracing::warn!("No token secret configured, subscriptions will be rejected");
    }
    tracing::info!(
        allowed_origins = ?config.hub.allowed_origins,
        slow_consumer = ?config.hub.slow_consumer,
        "Hub configured"
    );

    let hub = Hub::spawn(config.hub.clone(), tokenizer);
    let addr = config.server.addr();

    serve(AppState::new(hub, config), &addr).await?;

    tracing::info!("wshub stopped");
    Ok(())
}
