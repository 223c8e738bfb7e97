//! sensorlog: location, cellular signal and battery logger
//!
//! Keeps the latest reading of each sensor and appends it to
//! `<Downloads>/data.csv` whenever the user asks for a reading or a
//! sensor reports a change. Identical consecutive lines are written once.
//!
//! Surfaces:
//! - MCP server over stdio (default): record_reading, get_reading, get_sources
//! - `watch`: headless, one reading at start then every sensor change
//! - `config`: edit the config file

use clap::{Parser, Subcommand};
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    ErrorData as McpError,
    ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// === Modules ===

mod config;
mod csv_log;
mod permissions;
mod reading;
mod recorder;
mod sensors;
mod shared;

use recorder::RecorderHandle;
use shared::{internal_error, json_result};

const CONFIG_TEMPLATE: &str = include_str!("../config.toml.example");

// === CLI ===

#[derive(Parser)]
#[command(name = "sensorlog")]
#[command(about = "Log location, cellular signal and battery readings to CSV")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the config file in your editor
    Config,
    /// Take one reading, then log every sensor change until Ctrl-C
    Watch,
}

// === Common Parameter Types ===

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EmptyParams {}

// === Server ===

#[derive(Debug)]
pub struct SensorLogServer {
    pub tool_router: ToolRouter<Self>,
    recorder: RecorderHandle,
}

impl SensorLogServer {
    pub fn new(recorder: RecorderHandle) -> Self {
        Self {
            tool_router: Self::tool_router(),
            recorder,
        }
    }
}

#[rmcp::tool_router]
impl SensorLogServer {
    #[rmcp::tool(description = "Take a reading: stamp the current date and time, start the location/signal/battery sources if location access is granted, and append the reading to data.csv unless it equals the last line written")]
    pub async fn record_reading(
        &self,
        Parameters(_params): Parameters<EmptyParams>,
    ) -> Result<CallToolResult, McpError> {
        let report = self
            .recorder
            .trigger()
            .await
            .map_err(|e| internal_error(e.to_string()))?;
        json_result(&report)
    }

    #[rmcp::tool(description = "Get the current reading: date/time, signal strength, battery level, location, status message and the last line written to data.csv")]
    pub async fn get_reading(
        &self,
        Parameters(_params): Parameters<EmptyParams>,
    ) -> Result<CallToolResult, McpError> {
        let snapshot = self
            .recorder
            .snapshot()
            .await
            .map_err(|e| internal_error(e.to_string()))?;
        json_result(&snapshot)
    }

    #[rmcp::tool(description = "List the sensor sources (location, signal, battery) and whether each is currently subscribed")]
    pub async fn get_sources(
        &self,
        Parameters(_params): Parameters<EmptyParams>,
    ) -> Result<CallToolResult, McpError> {
        let sources = self
            .recorder
            .sources()
            .await
            .map_err(|e| internal_error(e.to_string()))?;
        json_result(&sources)
    }
}

#[rmcp::tool_handler]
impl ServerHandler for SensorLogServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "sensorlog: records location, cellular signal and battery readings to data.csv.\n\
                 Call record_reading to take a reading; get_reading shows the current values."
                    .to_string(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config) => {
            run_config_command()?;
        }
        Some(Commands::Watch) => {
            run_watch().await?;
        }
        None => {
            run_server().await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Write the commented template to `path` unless a config is already
/// there. Returns true when the file was created.
fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, CONFIG_TEMPLATE)?;
    Ok(true)
}

/// $EDITOR, then $VISUAL, then the platform's stock editor
fn editor_command() -> String {
    ["EDITOR", "VISUAL"]
        .into_iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| {
            if cfg!(target_os = "windows") {
                "notepad".to_string()
            } else {
                "nano".to_string()
            }
        })
}

/// Edit the config file, then report what the edited file grants
fn run_config_command() -> anyhow::Result<()> {
    let config_path = config::Config::path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

    if ensure_config_file(&config_path)? {
        println!("Created config file: {}", config_path.display());
    }

    let editor = editor_command();
    println!("Opening {} with {}", config_path.display(), editor);
    let status = std::process::Command::new(&editor)
        .arg(&config_path)
        .status()?;
    if !status.success() {
        anyhow::bail!("{} exited with {}", editor, status);
    }

    let config = config::Config::load_from(&config_path);
    println!("Readings go to {}", config.output_dir().join(csv_log::CSV_FILE_NAME).display());
    println!(
        "Location access: {}, storage access: {}",
        granted(config.permissions.location),
        granted(config.permissions.storage)
    );
    Ok(())
}

fn granted(allowed: bool) -> &'static str {
    if allowed {
        "granted"
    } else {
        "denied"
    }
}

/// Log headless until interrupted
async fn run_watch() -> anyhow::Result<()> {
    init_tracing();

    let config = config::Config::load();
    let (recorder, task) = RecorderHandle::spawn(&config);

    let report = recorder.trigger().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    tracing::info!("Watching sensors, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    recorder.shutdown().await;
    task.await?;
    Ok(())
}

/// Run the MCP server
async fn run_server() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("Starting sensorlog server");

    let config = config::Config::load();
    let (recorder, task) = RecorderHandle::spawn(&config);

    let server = SensorLogServer::new(recorder.clone());
    let service = server.serve(rmcp::transport::stdio()).await?;
    service.waiting().await?;

    recorder.shutdown().await;
    task.await?;

    tracing::info!("sensorlog server stopped");
    Ok(())
}
