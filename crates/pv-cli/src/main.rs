//! # pv: command line client for the plantview hub
//!
//! - `pv queries`: list enabled stored queries.
//! - `pv run <name> --from <iso> --to <iso>`: execute a stored query.
//! - `pv history|graph|latest ...`: fetch dashboard series.
//!
//! The hub address comes from `--url` or `PV_BASE_URL`.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use tabled::{Table, Tabled};

#[derive(Parser)]
#[command(name = "pv", version, about, long_about = None)]
struct Cli {
    /// Base URL of a running pv-hub.
    #[arg(
        long,
        env = "PV_BASE_URL",
        default_value = "http://127.0.0.1:3000",
        global = true
    )]
    url: String,

    /// Print series as a table instead of JSON.
    #[arg(long, global = true)]
    table: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List enabled stored queries.
    Queries,

    /// Execute a stored query over a UTC range.
    Run {
        name: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },

    /// Full history of one measurand on one terminal (numeric ids).
    History {
        terminal_id: String,
        measurand_id: String,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },

    /// Most recent graph points for a terminal/measurand name pair.
    Graph {
        terminal: String,
        measurand: String,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },

    /// Latest reading of each named measurand.
    Latest {
        terminal: String,
        /// Measurand names.
        #[arg(required = true)]
        measurands: Vec<String>,
    },

    /// Hub uptime and cache statistics.
    Status,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Point {
    timestamp: Value,
    measurand_value: Value,
    measurand_name: Option<String>,
}

#[derive(Tabled)]
struct PointRow {
    #[tabled(rename = "Timestamp")]
    timestamp: String,
    #[tabled(rename = "Measurand")]
    measurand: String,
    #[tabled(rename = "Value")]
    value: String,
}

impl From<Point> for PointRow {
    fn from(p: Point) -> Self {
        Self {
            timestamp: cell(p.timestamp),
            measurand: p.measurand_name.unwrap_or_default(),
            value: cell(p.measurand_value),
        }
    }
}

/// Strings unquoted, everything else as JSON.
fn cell(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let result = match &cli.command {
        Commands::Queries => get(&client, &cli.url, &["queries"], &[]).await,
        Commands::Run { name, from, to } => {
            let payload = serde_json::json!({ "name": name, "fromDate": from, "toDate": to });
            post(&client, &cli.url, &["execute-query"], &payload).await
        }
        Commands::History {
            terminal_id,
            measurand_id,
            from,
            to,
        } => {
            let path = [
                "series",
                "history",
                terminal_id.as_str(),
                measurand_id.as_str(),
            ];
            get(&client, &cli.url, &path, &range_query(from, to)).await
        }
        Commands::Graph {
            terminal,
            measurand,
            from,
            to,
        } => {
            let path = ["series", "graph", terminal.as_str(), measurand.as_str()];
            get(&client, &cli.url, &path, &range_query(from, to)).await
        }
        Commands::Latest {
            terminal,
            measurands,
        } => {
            let path = ["series", "latest", terminal.as_str()];
            let query = [("measurands", measurands.join(","))];
            get(&client, &cli.url, &path, &query).await
        }
        Commands::Status => get(&client, &cli.url, &["status"], &[]).await,
    };

    let json = match result {
        Ok(json) => json,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let is_series = matches!(
        cli.command,
        Commands::History { .. } | Commands::Graph { .. } | Commands::Latest { .. }
    );
    if cli.table && is_series {
        match serde_json::from_value::<Vec<Point>>(json.clone()) {
            Ok(points) => {
                let rows: Vec<PointRow> = points.into_iter().map(PointRow::from).collect();
                println!("{}", Table::new(rows));
                return;
            }
            Err(e) => eprintln!("Cannot tabulate response: {}", e),
        }
    }
    match serde_json::to_string_pretty(&json) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Error: {}", e),
    }
}

fn range_query(from: &Option<String>, to: &Option<String>) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(from) = from {
        query.push(("from", from.clone()));
    }
    if let Some(to) = to {
        query.push(("to", to.clone()));
    }
    query
}

/// `base` with each segment appended and percent-encoded.
fn endpoint(base: &str, segments: &[&str]) -> Result<reqwest::Url, String> {
    let mut url = reqwest::Url::parse(base)
        .map_err(|e| format!("invalid hub url '{}': {}", base, e))?;
    url.path_segments_mut()
        .map_err(|_| format!("hub url '{}' cannot take a path", base))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn get(
    client: &reqwest::Client,
    base: &str,
    segments: &[&str],
    query: &[(&str, String)],
) -> Result<Value, String> {
    let url = endpoint(base, segments)?;
    let resp = client
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    read_json(resp).await
}

async fn post(
    client: &reqwest::Client,
    base: &str,
    segments: &[&str],
    json: &Value,
) -> Result<Value, String> {
    let url = endpoint(base, segments)?;
    let resp = client
        .post(url)
        .json(json)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    read_json(resp).await
}

/// Body as JSON; a non-2xx status becomes the hub's `error` message.
async fn read_json(resp: reqwest::Response) -> Result<Value, String> {
    let status = resp.status();
    let body: Value = resp.json().await.map_err(|e| e.to_string())?;
    if status.is_success() {
        return Ok(body);
    }
    let message = body
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());
    Err(format!("{}: {}", status, message))
}
