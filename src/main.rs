//! tsbridge CLI
//!
//! Compile, run and write through any registered driver:
//! - Compile query text to the backend language
//! - Execute queries and print the series
//! - Write single points
//! - Browse measurements and tag values

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tsbridge::{
    generate_default_config, parse_query, Config, DataPoint, DriverRegistry, FieldValue,
    MetadataQuery, QueryResult, TimeSeriesDriver,
};

#[derive(Parser)]
#[command(name = "tsbridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "One query language for InfluxDB, Graphite, RRDtool and Prometheus")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: user config dir, /etc/tsbridge, ./tsbridge.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Driver name (default: `driver` from the config)
    #[arg(short, long, global = true)]
    driver: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the compiled backend query
    Compile {
        /// Query text, e.g. "SELECT mean(usage) FROM cpu GROUP BY time(5m)"
        query: String,
    },

    /// Execute a query
    Query {
        query: String,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Write one point
    Write {
        measurement: String,
        /// Fields in field=value format (`42i` for integers)
        #[arg(required = true)]
        fields: Vec<String>,
        /// Tags in key=value format
        #[arg(short = 'T', long = "tag")]
        tags: Vec<String>,
        /// Timestamp (default: now). RFC 3339 or Unix seconds
        #[arg(short, long)]
        time: Option<String>,
    },

    /// List measurements
    Measurements,

    /// List the values of a tag
    TagValues { measurement: String, tag: String },

    /// List registered drivers
    Drivers,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    init_logging(&config);

    let registry = DriverRegistry::with_builtin()?;

    match &cli.command {
        Commands::Drivers => {
            for name in registry.names() {
                println!("{}", name);
            }
            return Ok(());
        }
        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &content)?;
                    println!("Config written to {:?}", path);
                }
                None => print!("{}", content),
            }
            return Ok(());
        }
        _ => {}
    }

    let name = cli.driver.clone().unwrap_or_else(|| config.driver.clone());
    let driver = registry.create(&name, &config)?;
    tracing::debug!(driver = %name, "Driver ready");

    let outcome = run(cli.command, driver.as_ref()).await;
    driver.close().await?;
    outcome
}

async fn run(command: Commands, driver: &dyn TimeSeriesDriver) -> anyhow::Result<()> {
    match command {
        Commands::Compile { query } => {
            let query = parse_query(&query)?;
            println!("{}", driver.compile(&query)?);
        }

        Commands::Query { query, format } => {
            let query = parse_query(&query)?;
            let result = driver.query(&query).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
                OutputFormat::Csv => print_csv(&result)?,
                OutputFormat::Table => print_table(&result),
            }
        }

        Commands::Write {
            measurement,
            fields,
            tags,
            time,
        } => {
            let timestamp = parse_timestamp(time.as_deref())?;
            let mut point = DataPoint::with_timestamp(&measurement, timestamp);
            for field in &fields {
                let (key, value) = split_pair(field)?;
                let value: FieldValue = value
                    .parse()
                    .map_err(|e: String| anyhow!("field '{}': {}", key, e))?;
                point = point.add_field(key, value);
            }
            for tag in &tags {
                let (key, value) = split_pair(tag)?;
                point = point.add_tag(key, value);
            }

            driver
                .write(&point)
                .await
                .with_context(|| format!("writing to {}", driver.name()))?;
            println!(
                "Wrote {} ({} fields) at {}",
                measurement,
                point.fields.len(),
                timestamp.to_rfc3339()
            );
        }

        Commands::Measurements => {
            let result = driver.metadata(&MetadataQuery::Measurements).await?;
            print_labels(&result.values);
        }

        Commands::TagValues { measurement, tag } => {
            let result = driver
                .metadata(&MetadataQuery::TagValues { measurement, tag })
                .await?;
            print_labels(&result.values);
        }

        Commands::Drivers | Commands::Config { .. } => {}
    }
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tsbridge={}", config.logging.level)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    }
}

fn split_pair(s: &str) -> anyhow::Result<(&str, &str)> {
    s.split_once('=')
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| anyhow!("expected key=value, got '{}'", s))
}

fn parse_timestamp(time: Option<&str>) -> anyhow::Result<DateTime<Utc>> {
    match time {
        None | Some("now") => Ok(Utc::now()),
        Some(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                Ok(dt.with_timezone(&Utc))
            } else if let Ok(secs) = s.parse::<i64>() {
                DateTime::from_timestamp(secs, 0).ok_or_else(|| anyhow!("timestamp out of range: {}", s))
            } else {
                bail!("Invalid timestamp format: {}", s)
            }
        }
    }
}

fn print_labels(values: &[String]) {
    if values.is_empty() {
        println!("(none)");
    }
    for value in values {
        println!("{}", value);
    }
}

fn format_labels(labels: &std::collections::BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn print_table(result: &QueryResult) {
    let Some(data) = result.as_time_series() else {
        if let QueryResult::Labels(labels) = result {
            print_labels(&labels.values);
        }
        return;
    };

    if data.is_empty() {
        println!("No data for the selected time range");
        return;
    }

    for series in &data.series {
        let labels = format_labels(&series.labels);
        if labels.is_empty() {
            println!("{}", series.metric);
        } else {
            println!("{} {{{}}}", series.metric, labels);
        }
        println!("{}", "-".repeat(40));
        for point in &series.points {
            let value = point
                .value
                .map(|v| format!("{:.3}", v))
                .unwrap_or_else(|| "-".to_string());
            println!("{:<27} {}", point.timestamp.to_rfc3339(), value);
        }
        println!();
    }
}

fn print_csv(result: &QueryResult) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    writer.write_record(["metric", "labels", "timestamp", "value"])?;

    if let Some(data) = result.as_time_series() {
        for series in &data.series {
            let labels = format_labels(&series.labels);
            for point in &series.points {
                let timestamp = point.timestamp.to_rfc3339();
                let value = point.value.map(|v| v.to_string()).unwrap_or_default();
                writer.write_record([
                    series.metric.as_str(),
                    labels.as_str(),
                    timestamp.as_str(),
                    value.as_str(),
                ])?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}
