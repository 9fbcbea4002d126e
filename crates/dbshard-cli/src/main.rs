//! shardctl - operator CLI for dbshard topologies.

use clap::{Parser, Subcommand, ValueEnum};
use dbshard::topology::redact_endpoint;
use dbshard::{
    diff, Config, JsonFileHistoryStore, MigrationHistoryStore, MigrationRecord, SchemaSnapshot,
    ShardError, ShardId, ShardKey,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
#[command(name = "shardctl")]
#[command(about = "Inspect shard topologies, schema drift and migration ledgers")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "shards.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print the topology
    Validate,

    /// Print the shard that owns each key
    Route {
        /// Keys to route
        #[arg(required = true)]
        keys: Vec<String>,

        /// How to interpret the keys
        #[arg(long, value_enum, default_value = "text")]
        kind: KeyKind,
    },

    /// Compare two saved schema snapshots
    Diff {
        /// Baseline snapshot (JSON)
        baseline: PathBuf,

        /// Snapshot to compare against the baseline (JSON)
        compared: PathBuf,
    },

    /// Print records from a signed migration ledger file
    Ledger {
        /// Ledger file
        #[arg(long)]
        file: PathBuf,

        /// HMAC key the ledger was signed with
        #[arg(long, env = "DBSHARD_LEDGER_KEY", hide_env_values = true)]
        key: String,

        /// Only show records for this shard
        #[arg(long)]
        shard: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KeyKind {
    Text,
    Int,
    Uuid,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ShardError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(ShardError::Config)?;

    match cli.command {
        Commands::Validate => validate(&cli.config, cli.output_json),
        Commands::Route { keys, kind } => route(&cli.config, &keys, kind, cli.output_json),
        Commands::Diff { baseline, compared } => {
            diff_snapshots(&baseline, &compared, cli.output_json)
        }
        Commands::Ledger { file, key, shard } => {
            ledger(file, key, shard.map(ShardId::from), cli.output_json).await
        }
    }
}

fn validate(path: &Path, output_json: bool) -> Result<(), ShardError> {
    let config = Config::load(path)?;
    let topology = config.build_topology()?;
    info!(
        "Configuration valid: {} shard(s), topology version {}",
        topology.len(),
        topology.version()
    );

    if output_json {
        let shards: Vec<_> = topology
            .shards()
            .iter()
            .map(|s| {
                serde_json::json!({
                    "id": s.id,
                    "endpoint": redact_endpoint(&s.endpoint),
                    "bucket": s.bucket,
                })
            })
            .collect();
        let result = serde_json::json!({
            "valid": true,
            "version": topology.version(),
            "bucketed": topology.is_bucketed(),
            "fingerprint": topology.fingerprint(),
            "config_hash": config.hash(),
            "shards": shards,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Topology version: {}", topology.version());
        println!(
            "Routing:          {}",
            if topology.is_bucketed() {
                "consistent hash"
            } else {
                "modulo"
            }
        );
        println!("Fingerprint:      {}", topology.fingerprint());
        println!("Shards:           {}", topology.len());
        for shard in topology.shards() {
            match shard.bucket {
                Some(bucket) => println!(
                    "  {} (bucket {}): {}",
                    shard.id,
                    bucket,
                    redact_endpoint(&shard.endpoint)
                ),
                None => println!("  {}: {}", shard.id, redact_endpoint(&shard.endpoint)),
            }
        }
    }

    Ok(())
}

fn parse_key(raw: &str, kind: KeyKind) -> Result<ShardKey, ShardError> {
    match kind {
        KeyKind::Text => Ok(ShardKey::Text(raw.to_string())),
        KeyKind::Int => raw
            .parse::<i64>()
            .map(ShardKey::Int)
            .map_err(|e| ShardError::Routing(format!("invalid integer key '{}': {}", raw, e))),
        KeyKind::Uuid => uuid::Uuid::parse_str(raw)
            .map(ShardKey::Uuid)
            .map_err(|e| ShardError::Routing(format!("invalid uuid key '{}': {}", raw, e))),
    }
}

fn route(
    path: &Path,
    raw_keys: &[String],
    kind: KeyKind,
    output_json: bool,
) -> Result<(), ShardError> {
    let config = Config::load(path)?;
    let topology = Arc::new(config.build_topology()?);
    let router = config.build_router(topology)?;

    let keys = raw_keys
        .iter()
        .map(|raw| parse_key(raw, kind))
        .collect::<Result<Vec<_>, _>>()?;

    let mut routes = Vec::with_capacity(keys.len());
    for key in &keys {
        let shard = router.resolve(key)?;
        debug!("Routed {} to {}", key, shard);
        routes.push((key, shard));
    }

    if output_json {
        let result: Vec<_> = routes
            .iter()
            .map(|(key, shard)| serde_json::json!({ "key": key.to_string(), "shard": shard }))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "topology_version": router.topology_version(),
                "routes": result,
            }))?
        );
    } else {
        for (key, shard) in routes {
            println!("{} -> {}", key, shard);
        }
    }

    Ok(())
}

fn diff_snapshots(baseline: &Path, compared: &Path, output_json: bool) -> Result<(), ShardError> {
    let a = SchemaSnapshot::load(baseline)?;
    let b = SchemaSnapshot::load(compared)?;
    let findings = diff(&a, &b);

    if output_json {
        let result = serde_json::json!({
            "baseline": a.shard_id,
            "compared": b.shard_id,
            "consistent": findings.is_empty(),
            "findings": findings,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if findings.is_empty() {
        println!("{} and {} are consistent", a.shard_id, b.shard_id);
    } else {
        println!(
            "{} finding(s) between {} and {}:",
            findings.len(),
            a.shard_id,
            b.shard_id
        );
        for finding in &findings {
            println!("  {}", finding);
        }
    }

    if findings.is_empty() {
        Ok(())
    } else {
        warn!("Schema drift between {} and {}", a.shard_id, b.shard_id);
        Err(ShardError::SchemaDriftDetected { findings })
    }
}

async fn ledger(
    file: PathBuf,
    key: String,
    shard: Option<ShardId>,
    output_json: bool,
) -> Result<(), ShardError> {
    if !file.exists() {
        return Err(ShardError::History(format!(
            "ledger file {} does not exist",
            file.display()
        )));
    }

    let store = JsonFileHistoryStore::new(file, key);
    let records: Vec<MigrationRecord> = match &shard {
        Some(shard) => store.history(shard).await?,
        None => store.load_records()?,
    };
    debug!(
        "Read {} record(s) from {} ledger",
        records.len(),
        store.backend_type()
    );

    if output_json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("No migration records");
    } else {
        for record in &records {
            print!(
                "{:<16} {:<32} {:<12} {}",
                record.shard_id,
                record.migration_id,
                record.status.to_string(),
                record.applied_at_utc.to_rfc3339()
            );
            match &record.error_detail {
                Some(detail) => println!("  ({})", detail),
                None => println!(),
            }
        }
    }

    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so --output-json stays parseable.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}
