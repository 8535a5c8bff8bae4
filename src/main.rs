use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use talky_gateway::config::Config;
use talky_gateway::gateway::{GatewayClient, GatewayKind, TurnOutcome};
use talky_gateway::logging::{self, LogConfig, LogFormat};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Moltis,
    Openclaw,
}

impl From<BackendArg> for GatewayKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Moltis => GatewayKind::Moltis,
            BackendArg::Openclaw => GatewayKind::OpenClaw,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "talky-gateway",
    version,
    about = "Connect to the agent gateway, optionally send one prompt, print the reply"
)]
struct Cli {
    /// Config file (default: ~/.talky/gateway.toml)
    #[arg(long, short, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Gateway backend
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,
    /// Gateway WebSocket URL
    #[arg(long, value_name = "URL")]
    url: Option<String>,
    /// Session key to use
    #[arg(long, value_name = "KEY")]
    session: Option<String>,
    /// Prompt to send after connecting
    #[arg(long, short, value_name = "TEXT")]
    prompt: Option<String>,
    /// List gateway sessions after connecting
    #[arg(long)]
    list_sessions: bool,
    /// Send the prompt without the voice STT tag
    #[arg(long)]
    no_voice_tag: bool,
    /// Verbose logging
    #[arg(long, short)]
    verbose: bool,
    /// JSON log output
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::from_env()
    };
    if cli.json_logs {
        log_config.format = LogFormat::Json;
    }
    logging::init(log_config);

    let mut config = Config::load(cli.config.clone()).context("Failed to load config")?;
    config.apply_env_with_backend(cli.backend.map(GatewayKind::from));
    if let Some(url) = cli.url {
        config.gateway.url = Some(url);
    }
    if let Some(session) = cli.session {
        config.gateway.session_key = Some(session);
    }
    if cli.no_voice_tag {
        config.gateway.voice_tagging = false;
    }

    let client = GatewayClient::from_config(config.gateway);
    println!("Connecting to {} gateway at {}", client.backend(), client.url());
    client
        .ensure_connected()
        .await
        .context("Gateway connection failed")?;
    println!("Connected (session: {})", client.session_key());

    if cli.list_sessions {
        let sessions = client.list_sessions().await.context("sessions.list failed")?;
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    }

    if let Some(prompt) = cli.prompt {
        match client.send_prompt(&prompt).await? {
            TurnOutcome::Completed(reply) => println!("{reply}"),
            TurnOutcome::TimedOut { fallback } => {
                eprintln!("No reply before timeout");
                println!("{fallback}");
            }
            TurnOutcome::Cancelled => eprintln!("Turn cancelled"),
        }
    }

    client.close().await;
    Ok(())
}
