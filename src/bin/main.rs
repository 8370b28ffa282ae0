use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};

use dragnet::error::ConfigError;
use dragnet::scan::raw_scan_with_capacity;
use dragnet::storage::build_index_with_capacity;
use dragnet::{
    Breakdown, Datasource, Filter, IndexConfig, IndexReader, Interval, LocalScan, Point,
    QueryConfig, Settings,
};

#[derive(Parser)]
#[command(name = "dragnet", about = "Query-driven aggregation over raw event records")]
struct Cli {
    /// Record root directory (overrides configuration).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Published-index directory (overrides configuration).
    #[arg(long, global = true)]
    index_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a query with a raw scan over the records.
    Scan(QueryArgs),

    /// Materialize an index over the records.
    Build {
        /// Index name; also its file name under the index directory.
        name: String,

        /// Columns to store, e.g. "host" or "latency[quantize]".
        #[arg(required = true)]
        columns: Vec<String>,

        /// JSON filter restricting which records enter the index.
        #[arg(long)]
        filter: Option<String>,

        /// Partition interval, "hour" or "day".
        #[arg(long)]
        interval: Option<String>,
    },

    /// Answer a query from a published index.
    Query {
        /// Index name under the index directory.
        name: String,

        #[command(flatten)]
        query: QueryArgs,
    },
}

#[derive(Args)]
struct QueryArgs {
    /// Breakdown specs, e.g. "host" or "latency[lquantize=100]".
    breakdowns: Vec<String>,

    /// JSON filter, e.g. '{"eq": ["host", "a"]}'.
    #[arg(long)]
    filter: Option<String>,

    /// Inclusive lower time bound (RFC 3339).
    #[arg(long)]
    after: Option<String>,

    /// Exclusive upper time bound (RFC 3339).
    #[arg(long)]
    before: Option<String>,
}

fn parse_filter(raw: &str) -> Result<Filter, ConfigError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ConfigError::BadFilter(e.to_string()))?;
    Filter::parse(&value)
}

fn parse_bound(raw: &str) -> Result<DateTime<Utc>, ConfigError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ConfigError::BadTimeBound(raw.to_string()))
}

fn parse_query(args: &QueryArgs, time_field: Option<&str>) -> Result<QueryConfig, ConfigError> {
    let filter = args.filter.as_deref().map(parse_filter).transpose()?;
    let breakdowns = args
        .breakdowns
        .iter()
        .map(|s| Breakdown::parse_str(s))
        .collect::<Result<Vec<_>, _>>()?;
    let bounds = match (&args.after, &args.before) {
        (Some(after), Some(before)) => Some((parse_bound(after)?, parse_bound(before)?)),
        (None, None) => None,
        _ => return Err(ConfigError::HalfOpenTimeBounds),
    };
    QueryConfig::new(filter, breakdowns, bounds, time_field.map(str::to_string))
}

fn local_source(settings: &Settings) -> Result<LocalScan, dragnet::Error> {
    let source = LocalScan::new(&settings.source.root);
    match &settings.source.path_pattern {
        Some(pattern) => Ok(source.with_pattern(pattern)?),
        None => Ok(source),
    }
}

fn print_points(points: &[Point]) {
    for point in points {
        let key = point
            .fields
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(" ");
        if key.is_empty() {
            println!("{}", point.value);
        } else {
            println!("{} {}", key, point.value);
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut overrides = Vec::new();
    if let Some(root) = &cli.root {
        overrides.push(("source.root", root.display().to_string()));
    }
    if let Some(dir) = &cli.index_dir {
        overrides.push(("index.dir", dir.display().to_string()));
    }
    let settings = Settings::with_overrides(&overrides)?;
    let capacity = settings.pipeline.channel_capacity;

    match cli.command {
        Command::Scan(args) => {
            let query = parse_query(&args, settings.source.time_field.as_deref())?;
            let source = local_source(&settings)?;
            let (points, stats) =
                raw_scan_with_capacity(source.scan(&query), &query, capacity).await?;
            print_points(&points);
            eprintln!(
                "{} records scanned, {} dropped by filter, {} errors, {} aggregated",
                stats.records, stats.filter_dropped, stats.errors, stats.aggregated
            );
        }
        Command::Build {
            name,
            columns,
            filter,
            interval,
        } => {
            let columns = columns
                .iter()
                .map(|s| Breakdown::parse_str(s))
                .collect::<Result<Vec<_>, _>>()?;
            let filter = filter.as_deref().map(parse_filter).transpose()?;
            let interval = interval.as_deref().map(Interval::parse).transpose()?;
            let index = IndexConfig::new(
                &name,
                columns,
                filter,
                interval,
                settings.source.time_field.clone(),
            )?;

            tokio::fs::create_dir_all(&settings.index.dir).await?;
            let path = settings.index.dir.join(format!("{}.db", name));
            let source = local_source(&settings)?;
            let scan_query = QueryConfig::new(
                None,
                Vec::new(),
                None,
                settings.source.time_field.clone(),
            )?;
            let stats =
                build_index_with_capacity(source.scan(&scan_query), &index, &path, capacity)
                    .await?;
            println!(
                "published {} ({} points from {} records)",
                path.display(),
                stats.points_written,
                stats.scan.records
            );
        }
        Command::Query { name, query: args } => {
            let query = parse_query(&args, settings.source.time_field.as_deref())?;
            let path = settings.index.dir.join(format!("{}.db", name));
            let reader = IndexReader::open(&path)?;
            print_points(&reader.query(&query)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("dragnet: {}", e);
        std::process::exit(1);
    }
}
