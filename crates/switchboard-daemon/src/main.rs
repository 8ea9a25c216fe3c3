//! Switchboard daemon.
//!
//! Runs the stream manager behind the WebSocket server, with one engine
//! process per session.
//!
//! ```bash
//! switchboard-daemon --engine my-engine --engine-arg --json
//! RUST_LOG=debug switchboard-daemon --engine my-engine --port 9000
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use switchboard_core::config::DEFAULT_MAX_CONCURRENT_STREAMS;
use switchboard_core::paths::{expand_home, get_home_dir};
use switchboard_core::{
    FilePlanWriter, JsonFileStore, ProcessProviderConfig, ProcessSessionProvider, StreamManager,
    StreamManagerConfig, ToolCapability,
};
use switchboard_http::AppState;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "switchboard-daemon", version, about = "Switchboard stream manager daemon")]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, default_value_t = 8787)]
    port: u16,

    /// Conversations and plans are stored here (default: ~/.switchboard)
    #[arg(long, value_name = "DIR")]
    data_dir: Option<String>,

    /// Engine command started for each session
    #[arg(long, value_name = "COMMAND")]
    engine: String,

    /// Argument passed to the engine (repeatable)
    #[arg(long = "engine-arg", value_name = "ARG", allow_hyphen_values = true)]
    engine_args: Vec<String>,

    /// Run the engine through a shell, e.g. "/bin/zsh -l -c"
    #[arg(long, value_name = "PREFIX")]
    shell_prefix: Option<String>,

    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT_STREAMS)]
    max_streams: usize,

    /// Seconds a question waits for an answer while a client is watching
    #[arg(long, default_value_t = 1800)]
    input_timeout_secs: u64,

    /// Write per-conversation and per-engine transcripts here
    #[arg(long, value_name = "DIR")]
    log_dir: Option<String>,

    /// Serve a web client from this directory
    #[arg(long, value_name = "DIR")]
    static_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 10)]
    shutdown_timeout_secs: u64,

    /// Base system message for every session
    #[arg(long)]
    system_message: Option<String>,

    /// Skill directory passed to every session (repeatable)
    #[arg(long = "skill-dir", value_name = "DIR")]
    skill_dirs: Vec<String>,

    /// Built-in tool enabled for every session (repeatable)
    #[arg(long = "tool", value_name = "NAME")]
    tools: Vec<String>,
}

impl Args {
    fn data_dir(&self) -> PathBuf {
        match self.data_dir.as_deref() {
            Some(dir) => expand_home(dir),
            None => get_home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".switchboard"),
        }
    }

    fn log_dir(&self) -> Option<PathBuf> {
        self.log_dir.as_deref().map(expand_home)
    }

    fn manager_config(&self) -> StreamManagerConfig {
        StreamManagerConfig {
            max_concurrent_streams: self.max_streams,
            user_input_timeout: Duration::from_secs(self.input_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            skill_dirs: self.skill_dirs.iter().map(|d| expand_home(d)).collect(),
            tools: self.tools.iter().map(ToolCapability::built_in).collect(),
            system_message: self.system_message.clone(),
            log_dir: self.log_dir(),
        }
    }

    fn provider_config(&self) -> ProcessProviderConfig {
        ProcessProviderConfig {
            program: self.engine.clone(),
            args: self.engine_args.clone(),
            shell_prefix: self.shell_prefix.clone(),
            log_dir: self.log_dir(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let data_dir = args.data_dir();
    let config = args.manager_config();
    let shutdown_timeout = config.shutdown_timeout;

    log::info!("Data directory: {}", data_dir.display());

    let manager = StreamManager::builder(
        Arc::new(ProcessSessionProvider::new(args.provider_config())),
        Arc::new(JsonFileStore::new(data_dir.join("conversations"))),
    )
    .config(config)
    .plan_writer(Arc::new(FilePlanWriter::new(data_dir.join("plans"))))
    .build();

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;

    switchboard_http::serve(
        listener,
        AppState::new(manager.clone()),
        args.static_dir.clone(),
        shutdown_signal(),
    )
    .await?;

    manager.shutdown_all(shutdown_timeout).await;
    log::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    log::info!("Received interrupt, shutting down");
}
