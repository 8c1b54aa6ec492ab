/*!
 * Lifeline CLI
 *
 * Operator tool for checking connector configuration and probing the
 * external services behind it.
 */

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use lifeline::{
    config::{CredentialsFile, FrameworkConfig},
    logging, ConnectError, Connector, ConnectorFactory, ConnectorRequest, DecryptedCredential,
    HealthStatus, HttpMethod,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

const EXIT_SUCCESS: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_CONFIG: i32 = 2;

#[derive(Parser)]
#[command(name = "lifeline")]
#[command(version, about = "Probe and exercise Lifeline connectors", long_about = None)]
struct Cli {
    /// Connector configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true, default_value = "lifeline.toml")]
    config: PathBuf,

    /// Credentials file (TOML, `[[credentials]]` entries)
    #[arg(long = "credentials", value_name = "FILE", global = true)]
    credentials: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate the configuration
    Validate,

    /// Connect every connector and report its health
    Health,

    /// Connect every connector and report its metrics
    Metrics,

    /// Send one request through a connector
    Request {
        /// Connector id
        connector: String,

        /// Request path, relative to the connector's base URL
        path: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: HttpMethod,

        /// Query parameter (repeatable)
        #[arg(short = 'q', long = "query", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        query: Vec<(String, String)>,

        /// JSON request body
        #[arg(short = 'd', long = "body", value_name = "JSON")]
        body: Option<String>,
    },
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

fn main() {
    let cli = Cli::parse();

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<ConnectError>() {
        Some(ConnectError::Config(_)) => EXIT_CONFIG,
        _ => EXIT_FAILURE,
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config = FrameworkConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let mut log_config = config.logging.clone();
    log_config.verbose |= cli.verbose;
    logging::init_logging(&log_config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Validate => validate(&config, cli.json),
            Commands::Health => {
                let factory = connect_all(&config, cli.credentials.as_ref()).await?;
                health(&factory, cli.json).await
            }
            Commands::Metrics => {
                let factory = connect_all(&config, cli.credentials.as_ref()).await?;
                metrics(&factory, cli.json).await
            }
            Commands::Request {
                connector,
                path,
                method,
                query,
                body,
            } => {
                let body = body
                    .map(|b| serde_json::from_str::<serde_json::Value>(&b))
                    .transpose()
                    .context("--body is not valid JSON")?;
                let mut request = ConnectorRequest::new(method, path);
                request.query = query;
                request.body = body;
                send(&config, cli.credentials.as_ref(), &connector, request).await
            }
        }
    })
}

fn load_credentials(path: Option<&PathBuf>) -> Result<HashMap<String, DecryptedCredential>> {
    match path {
        Some(path) => Ok(CredentialsFile::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?
            .into_credentials()),
        None => Ok(HashMap::new()),
    }
}

/// Hand over credentials and connect; connect failures are reported, not fatal
async fn connect(connector: &Arc<dyn Connector>, credential: Option<DecryptedCredential>) {
    if let Some(credential) = credential {
        if let Err(e) = connector.set_credentials(credential).await {
            warn!(connector_id = %connector.id(), error = %e, "Rejected credentials");
        }
    }
    match connector.connect().await {
        Ok(()) => info!(connector_id = %connector.id(), "Connected"),
        Err(e) => warn!(connector_id = %connector.id(), error = %e, "Connect failed"),
    }
}

async fn connect_all(
    config: &FrameworkConfig,
    credentials: Option<&PathBuf>,
) -> Result<ConnectorFactory> {
    let mut credentials = load_credentials(credentials)?;
    let factory = ConnectorFactory::new();
    for connector_config in &config.connectors {
        let connector = factory.create(connector_config.clone()).await?;
        connect(&connector, credentials.remove(&connector_config.id)).await;
    }
    Ok(factory)
}

fn create_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            header
                .iter()
                .map(|h| Cell::new(h).fg(Color::Cyan).add_attribute(Attribute::Bold)),
        );
    table
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn validate(config: &FrameworkConfig, json: bool) -> Result<i32> {
    if json {
        print_json(&config.connectors)?;
        return Ok(EXIT_SUCCESS);
    }

    let mut table = create_table(&["Id", "Name", "Base URL", "Auth", "Timeout", "Rate limit", "Cache"]);
    for c in &config.connectors {
        table.add_row(vec![
            Cell::new(&c.id),
            Cell::new(&c.name),
            Cell::new(&c.base_url),
            Cell::new(c.auth_type()),
            Cell::new(format!("{}ms", c.timeout_ms)),
            Cell::new(
                c.rate_limit
                    .as_ref()
                    .map(|r| format!("{}/s", r.max_requests_per_second))
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(
                c.cache
                    .as_ref()
                    .map(|cache| format!("{} entries", cache.max_entries))
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ]);
    }
    println!("{table}");
    println!("Configuration OK: {} connector(s)", config.connectors.len());
    Ok(EXIT_SUCCESS)
}

async fn health(factory: &ConnectorFactory, json: bool) -> Result<i32> {
    let results = factory.check_all_health().await;
    let code = if results.iter().all(|r| r.healthy) {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    };

    if json {
        print_json(&results)?;
        return Ok(code);
    }

    let mut table = create_table(&["Connector", "Status", "Breaker", "Latency", "Message"]);
    for r in &results {
        let color = match r.status {
            HealthStatus::Healthy => Color::Green,
            HealthStatus::Degraded => Color::Yellow,
            HealthStatus::Unhealthy => Color::Red,
        };
        table.add_row(vec![
            Cell::new(&r.connector_id),
            Cell::new(r.status).fg(color),
            Cell::new(r.circuit_breaker_state),
            Cell::new(format!("{}ms", r.response_time_ms)),
            Cell::new(r.message.as_deref().unwrap_or("")),
        ]);
    }
    println!("{table}");
    Ok(code)
}

async fn metrics(factory: &ConnectorFactory, json: bool) -> Result<i32> {
    let metrics = factory.get_all_metrics().await;
    if json {
        print_json(&metrics)?;
        return Ok(EXIT_SUCCESS);
    }

    let mut table = create_table(&[
        "Connector", "Requests", "Succeeded", "Failed", "Avg latency", "Breaker", "Trips",
    ]);
    for m in &metrics {
        table.add_row(vec![
            Cell::new(&m.connector_id),
            Cell::new(m.total_requests),
            Cell::new(m.successful_requests).fg(Color::Green),
            Cell::new(m.failed_requests).fg(if m.failed_requests > 0 {
                Color::Red
            } else {
                Color::Reset
            }),
            Cell::new(format!("{:.1}ms", m.average_response_time_ms)),
            Cell::new(m.circuit_breaker_state),
            Cell::new(m.circuit_breaker_trips),
        ]);
    }
    println!("{table}");
    Ok(EXIT_SUCCESS)
}

async fn send(
    config: &FrameworkConfig,
    credentials: Option<&PathBuf>,
    connector_id: &str,
    request: ConnectorRequest,
) -> Result<i32> {
    let Some(connector_config) = config.connector(connector_id) else {
        bail!(ConnectError::Config(format!(
            "no connector '{}' in configuration",
            connector_id
        )));
    };
    let mut credentials = load_credentials(credentials)?;

    let factory = ConnectorFactory::new();
    let connector = factory.create(connector_config.clone()).await?;
    connect(&connector, credentials.remove(connector_id)).await;

    let response = connector.execute(request).await;
    print_json(&response)?;
    Ok(if response.success {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
