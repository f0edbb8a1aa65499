//! lattice-station - Station Entry Point
//!
//! `serve` runs a station until interrupted. `status`, `agents` and `exec`
//! join the lattice briefly as an observer to inspect it or call an agent.

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde_json::json;
use station_lattice::{
    mesh::ConnectionState, util::short_id, AgentAdvert, AgentSchema, Config, EchoExecutor,
    ExecOptions, InvocationResult, Station, StationRole,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// How long observers wait for presence after asking stations to announce.
const DISCOVERY_WAIT: Duration = Duration::from_millis(1500);

/// Station Lattice - agent discovery and remote invocation across stations
#[derive(Parser, Debug)]
#[command(name = "lattice-station")]
#[command(about = "Run a lattice station or inspect the lattice it belongs to")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run this station until interrupted
    Serve {
        /// Host an agent that echoes its task back (repeatable)
        #[arg(long, value_name = "AGENT")]
        echo: Vec<String>,
    },
    /// Show this station's lattice role and the stations it can see
    Status,
    /// List agents available on the lattice
    Agents {
        /// Only agents with a capability containing this text
        #[arg(long)]
        capability: Option<String>,

        /// Show the full schema of one agent
        #[arg(long, value_name = "AGENT", conflicts_with_all = ["capability", "discover"])]
        schema: Option<String>,

        /// Show capabilities and location for every agent
        #[arg(long)]
        discover: bool,
    },
    /// Run an agent somewhere on the lattice and print its output
    Exec(ExecArgs),
}

#[derive(Args, Debug)]
struct ExecArgs {
    /// Agent to run
    agent: String,

    /// Task text; remaining words are joined with spaces
    #[arg(required = true, num_args = 1..)]
    task: Vec<String>,

    /// Run on this station only
    #[arg(long)]
    station: Option<String>,

    /// Overall deadline in seconds
    #[arg(long, value_name = "SECS", value_parser = parse_timeout)]
    timeout: Option<Duration>,

    /// Let any hosting station pick the request up
    #[arg(long, conflicts_with = "station")]
    any: bool,
}

impl ExecArgs {
    fn task(&self) -> String {
        self.task.join(" ")
    }

    fn options(&self) -> ExecOptions {
        let mut options = ExecOptions::default();
        if let Some(station) = &self.station {
            options = options.on_station(station.clone());
        }
        if let Some(timeout) = self.timeout {
            options = options.with_timeout(timeout);
        }
        if self.any {
            options = options.load_balanced();
        }
        options
    }
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", value))?;
    if secs.is_nan() || secs <= 0.0 {
        return Err("must be a positive number of seconds".to_string());
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("'{}' is out of range: {}", value, e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "station_lattice=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Serve { echo } => serve(config, echo).await,
        Commands::Status => status(config).await,
        Commands::Agents {
            capability,
            schema,
            discover,
        } => match schema {
            Some(name) => agent_schema(config, &name).await,
            None => agents(config, capability, discover).await,
        },
        Commands::Exec(args) => exec(config, &args.agent, &args.task(), args.options()).await,
    }
}

async fn serve(config: Config, echo: Vec<String>) -> anyhow::Result<()> {
    let mut builder = Station::builder(config);
    if !echo.is_empty() {
        builder = builder.executor(Arc::new(EchoExecutor));
        for name in echo {
            builder = builder.agent(
                AgentAdvert::new(name)
                    .with_description("Echoes its task back word by word")
                    .with_input_schema(r#"{"type":"object","properties":{"task":{"type":"string"}},"required":["task"]}"#)
                    .with_output_schema(r#"{"type":"string"}"#),
            )?;
        }
    }
    let station = builder.start().await?;

    let status = station.status().await;
    if let Some(broker) = &status.broker {
        info!(
            "Broker listening on {} (monitor on {})",
            broker.client_addr, broker.monitor_addr
        );
    }
    info!(
        "Station {} is up with {} local agents",
        status.identity.station_id,
        status.local_agents.len()
    );

    shutdown_signal().await;
    station.shutdown().await;
    Ok(())
}

/// Join as a short-lived observer and ask every station to announce itself.
async fn observe(mut config: Config) -> anyhow::Result<Station> {
    if config.orchestration && config.url.is_none() {
        let credentials = config
            .broker
            .token
            .as_deref()
            .map(|token| format!("{}@", token))
            .unwrap_or_default();
        config.url = Some(format!("ws://{}127.0.0.1:{}", credentials, config.broker.port));
    }
    if config.url.is_none() {
        bail!("no lattice configured: set STN_LATTICE_URL or STN_LATTICE_ORCHESTRATION");
    }
    let configured_station = config.station_id.clone();
    config.orchestration = false;
    let id = Uuid::new_v4().to_string();
    config.station_name = format!("cli-{}", short_id(&id));
    config.station_id = config.station_name.clone();
    config.reconnect.max_attempts = Some(0);

    let station = Station::builder(config)
        .observer()
        .local_station(configured_station)
        .start()
        .await?;
    if station.status().await.connection != Some(ConnectionState::Connected) {
        station.shutdown().await;
        bail!("lattice broker is not reachable");
    }
    station.probe()?;
    Ok(station)
}

/// Lines describing the configured role, printed before anything that needs
/// the broker.
fn status_header(config: &Config) -> Vec<String> {
    let station = format!("Station: {} ({})", config.station_name, config.station_id);
    match config.role() {
        StationRole::Standalone => vec![
            "Lattice Status: STANDALONE".to_string(),
            station,
            String::new(),
            "This station is running in standalone mode (no lattice connectivity).".to_string(),
            "To host a lattice, set STN_LATTICE_ORCHESTRATION=true.".to_string(),
            "To join one, set STN_LATTICE_URL=ws://<orchestrator-host>:4222.".to_string(),
        ],
        StationRole::Orchestrator => vec![
            "Lattice Status: ORCHESTRATOR".to_string(),
            station,
            format!(
                "Broker: ws://{}:{} (monitoring on http://{}:{})",
                config.broker.host, config.broker.port, config.broker.host, config.broker.monitor_port
            ),
        ],
        StationRole::Member => vec![
            "Lattice Status: MEMBER".to_string(),
            station,
            format!(
                "Broker: {}",
                config.url.as_deref().map(redact_credentials).unwrap_or_default()
            ),
        ],
    }
}

fn redact_credentials(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) if !parsed.username().is_empty() || parsed.password().is_some() => {
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        _ => raw.to_string(),
    }
}

async fn status(config: Config) -> anyhow::Result<()> {
    for line in status_header(&config) {
        println!("{}", line);
    }
    if config.role() == StationRole::Standalone {
        return Ok(());
    }

    let station = observe(config).await?;
    tokio::time::sleep(DISCOVERY_WAIT).await;
    let status = station.status().await;

    println!("Presence TTL: {}s", status.presence_ttl.as_secs());
    println!();
    if status.stations.is_empty() {
        println!("No stations announced");
    } else {
        println!("Stations ({} online)", status.stations.len());
        println!(
            "{:<38} {:<24} {:<12} {:>6}  LAST SEEN",
            "ID", "NAME", "ROLE", "AGENTS"
        );
    }
    for info in &status.stations {
        println!(
            "{:<38} {:<24} {:<12} {:>6}  {}",
            info.station_id,
            clip(&info.station_name, 24),
            info.role.to_string(),
            info.agent_count,
            info.last_seen_at.format("%H:%M:%S")
        );
    }
    station.shutdown().await;
    Ok(())
}

/// Shorten `value` to at most `width` characters, marking the cut with `...`.
fn clip(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let kept: String = value.chars().take(width.saturating_sub(3)).collect();
    format!("{}...", kept)
}

fn location(is_local: bool, station_name: &str) -> String {
    if is_local {
        "local (this)".to_string()
    } else {
        station_name.to_string()
    }
}

async fn agents(config: Config, capability: Option<String>, discover: bool) -> anyhow::Result<()> {
    let station = observe(config).await?;
    tokio::time::sleep(DISCOVERY_WAIT).await;

    if let Some(capability) = capability {
        let records = station.find_agents(&capability);
        if records.is_empty() {
            println!("No agents found with capability '{}'", capability);
        } else {
            println!("Discovered Agents ({} total)", records.len());
            println!("Filtered by capability: {}", capability);
            println!("{:<24} {:<24} CAPABILITIES", "AGENT", "LOCATION");
            for record in records {
                println!(
                    "{:<24} {:<24} {}",
                    record.agent_name,
                    clip(&location(record.is_local, &record.station_name), 24),
                    clip(&record.capabilities.join(", "), 40)
                );
            }
        }
        station.shutdown().await;
        return Ok(());
    }

    let listings = station.agents();
    if listings.is_empty() {
        println!("No agents found in lattice");
    } else if discover {
        println!("Discovered Agents ({} total)", listings.len());
        println!("{:<24} {:<24} CAPABILITIES", "AGENT", "LOCATION");
        for listing in &listings {
            for placement in &listing.stations {
                println!(
                    "{:<24} {:<24} {}",
                    listing.agent_name,
                    clip(&location(placement.is_local, &placement.station_name), 24),
                    clip(&listing.capabilities.join(", "), 40)
                );
            }
        }
        println!();
        println!("Use --schema <agent> for full schema details");
    } else {
        println!("Agents in Lattice ({} total)", listings.len());
        println!("{:<24} {:<24} LOCAL", "AGENT", "STATION");
        for listing in &listings {
            for placement in &listing.stations {
                println!(
                    "{:<24} {:<24} {}",
                    listing.agent_name,
                    clip(&placement.station_name, 24),
                    if placement.is_local { "(this)" } else { "" }
                );
            }
        }
        println!();
        println!("Tip: use --discover for more details or --capability to filter");
    }
    station.shutdown().await;
    Ok(())
}

fn schema_lines(schema: &AgentSchema) -> Vec<String> {
    let mut lines = vec![
        format!("Agent: {}", schema.agent_name),
        format!("Location: {} ({})", schema.location(), schema.station_id),
        format!("Description: {}", schema.description),
    ];
    if let Some(input) = &schema.input_schema {
        lines.push(String::new());
        lines.push("Input Schema:".to_string());
        lines.push(input.clone());
    }
    if let Some(output) = &schema.output_schema {
        lines.push(String::new());
        lines.push("Output Schema:".to_string());
        lines.push(output.clone());
    }
    if !schema.examples.is_empty() {
        lines.push(String::new());
        lines.push("Examples:".to_string());
        lines.extend(schema.examples.iter().map(|example| format!("  - {}", example)));
    }
    lines
}

async fn agent_schema(config: Config, agent: &str) -> anyhow::Result<()> {
    let station = observe(config).await?;
    let result = station
        .wait_for_agent(agent, DISCOVERY_WAIT * 2)
        .await
        .and_then(|_| station.agent_schema(agent));
    station.shutdown().await;

    for line in schema_lines(&result?) {
        println!("{}", line);
    }
    Ok(())
}

async fn exec(config: Config, agent: &str, task: &str, options: ExecOptions) -> anyhow::Result<()> {
    let station = observe(config).await?;
    let result = run_exec(&station, agent, task, options).await;
    station.shutdown().await;
    result
}

async fn run_exec(
    station: &Station,
    agent: &str,
    task: &str,
    options: ExecOptions,
) -> anyhow::Result<()> {
    station.wait_for_agent(agent, DISCOVERY_WAIT * 2).await?;
    let mut invocation = station.exec(agent, json!({ "task": task }), options)?;
    info!(
        "Invoking {} on {} ({})",
        agent,
        invocation.station_id().unwrap_or("any station"),
        invocation.correlation_id()
    );

    while let Some(item) = invocation.next().await {
        let result = item?;
        let done = result.is_final();
        match result {
            InvocationResult::Partial { chunk, .. } => eprint!("{}", chunk),
            InvocationResult::Final {
                station_id,
                output,
                error,
                ..
            } => {
                eprintln!();
                if let Some(error) = error {
                    bail!("{} failed on {}: {} ({})", agent, station_id, error.message, error.kind);
                }
                println!("{}", output);
            }
        }
        if done {
            return Ok(());
        }
    }
    bail!("invocation ended without a result")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, leaving the lattice...");
}
