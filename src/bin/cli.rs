//! Binary entry point for the Strata administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use strata::{
    Database, DatabaseConfig, DatabaseDriver, DatabaseOptions, DatabaseRegistry, DatabaseStats,
    OpenMode, Schema, SqlValue, SyncMode,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "strata-cli",
    version,
    about = "Administrative CLI for Strata databases",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, global = true, value_name = "FILE", env = "STRATA_CONFIG", help = "TOML file with database options")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Open the database read-only")]
    read_only: bool,

    #[arg(long, global = true, help = "Disable write-ahead logging")]
    no_wal: bool,

    #[arg(long, global = true, value_enum, help = "Synchronous mode override")]
    synchronous: Option<SynchronousArg>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Run SQL and print the resulting rows")]
    Query {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
        #[arg(value_name = "SQL")]
        sql: String,
        #[arg(long = "arg", value_name = "VALUE", help = "Bind argument; NULL, integers and floats are typed")]
        args: Vec<String>,
        #[arg(long, help = "Stop after this many rows")]
        limit: Option<usize>,
    },

    #[command(about = "Show or set the schema version")]
    Version {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
        #[arg(long, help = "Store this version")]
        set: Option<i64>,
    },

    #[command(about = "Run an integrity check on every attached database")]
    Integrity {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },

    #[command(about = "Drop everything and apply a schema file")]
    Reset {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
        #[arg(long, value_name = "FILE", help = "Schema SQL")]
        schema: PathBuf,
        #[arg(long = "schema-version", help = "Version stored after setup")]
        schema_version: i64,
    },

    #[command(about = "Print pool and schema statistics")]
    Stats {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum SynchronousArg {
    Full,
    Normal,
    Off,
}

impl From<SynchronousArg> for SyncMode {
    fn from(mode: SynchronousArg) -> Self {
        match mode {
            SynchronousArg::Full => SyncMode::Full,
            SynchronousArg::Normal => SyncMode::Normal,
            SynchronousArg::Off => SyncMode::Off,
        }
    }
}

#[derive(Serialize)]
struct QueryReport {
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
    total: i64,
}

#[derive(Serialize)]
struct VersionReport {
    version: i64,
}

#[derive(Serialize)]
struct IntegrityReport {
    ok: bool,
    attached: Vec<String>,
}

#[derive(Serialize)]
struct StatsReport {
    version: i64,
    tables: i64,
    databases: Vec<DatabaseStats>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    match &cli.command {
        Command::Query {
            db_path,
            sql,
            args,
            limit,
        } => {
            let db = Database::open(build_config(&cli.open, db_path, None)?)?;
            let args: Vec<SqlValue> = args.iter().map(|arg| parse_arg(arg)).collect();
            let mut cursor = db.raw_query(sql, &args)?;
            let total = cursor.count()?;
            let mut rows = Vec::new();
            while limit.map_or(true, |limit| rows.len() < limit) && cursor.move_to_next()? {
                rows.push(cursor.row_values()?);
            }
            let report = QueryReport {
                columns: cursor.column_names().to_vec(),
                rows,
                total,
            };
            cursor.close();
            emit(&cli.format, &report, |_| print_query_text(&report))?;
        }
        Command::Version { db_path, set } => {
            let db = Database::open(build_config(&cli.open, db_path, None)?)?;
            if let Some(version) = set {
                db.set_version(*version)?;
            }
            let report = VersionReport {
                version: db.version()?,
            };
            emit(&cli.format, &report, |_| println!("user_version={}", report.version))?;
        }
        Command::Integrity { db_path } => {
            let db = Database::open(build_config(&cli.open, db_path, None)?)?;
            let report = IntegrityReport {
                ok: db.is_database_integrity_ok()?,
                attached: db.attached_databases()?.into_iter().map(|(name, _)| name).collect(),
            };
            emit(&cli.format, &report, |_| {
                println!(
                    "integrity: {} ({})",
                    if report.ok { "ok" } else { "FAILED" },
                    report.attached.join(", ")
                )
            })?;
            if !report.ok {
                std::process::exit(2);
            }
        }
        Command::Reset {
            db_path,
            schema,
            schema_version,
        } => {
            let sql = std::fs::read_to_string(schema)?;
            let driver = DatabaseDriver::open_with_schema(
                build_config(&cli.open, db_path, None)?,
                &Schema::new(*schema_version, sql),
            )?;
            let report = VersionReport {
                version: driver.database().version()?,
            };
            emit(&cli.format, &report, |_| {
                println!("reset complete, user_version={}", report.version)
            })?;
        }
        Command::Stats { db_path } => {
            let registry = DatabaseRegistry::new();
            let db = Database::open(build_config(&cli.open, db_path, Some(registry.clone()))?)?;
            let report = StatsReport {
                version: db.version()?,
                tables: db.query_num_entries("sqlite_master", Some("type = 'table'"), &[])?,
                databases: registry.snapshot(),
            };
            emit(&cli.format, &report, |_| print_stats_text(&report))?;
        }
    }
    Ok(())
}

fn build_config(
    open: &OpenArgs,
    db_path: &PathBuf,
    registry: Option<DatabaseRegistry>,
) -> Result<DatabaseConfig, Box<dyn Error>> {
    let mut options = match &open.config {
        Some(path) => DatabaseOptions::load(path)?,
        None => DatabaseOptions::default(),
    };
    if open.no_wal {
        options.write_ahead_logging = false;
    }
    if let Some(mode) = open.synchronous {
        options.synchronous = mode.into();
    }
    let mut config = DatabaseConfig::new(db_path).with_options(options);
    if open.read_only {
        config = config.with_open_mode(OpenMode::ReadOnly);
    }
    if let Some(registry) = registry {
        config = config.with_registry(registry);
    }
    Ok(config)
}

fn parse_arg(raw: &str) -> SqlValue {
    if raw.eq_ignore_ascii_case("null") {
        SqlValue::Null
    } else if let Ok(value) = raw.parse::<i64>() {
        SqlValue::Int(value)
    } else if let Ok(value) = raw.parse::<f64>() {
        SqlValue::Float(value)
    } else {
        SqlValue::String(raw.to_owned())
    }
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

fn print_query_text(report: &QueryReport) {
    println!("{}", report.columns.join("\t"));
    for row in &report.rows {
        let cells: Vec<String> = row.iter().map(ToString::to_string).collect();
        println!("{}", cells.join("\t"));
    }
    println!("({} of {} rows)", report.rows.len(), report.total);
}

fn print_stats_text(report: &StatsReport) {
    println!("Schema: user_version={} tables={}", report.version, report.tables);
    for db in &report.databases {
        println!("Database {} ({})", db.label, db.path);
        match &db.pool {
            Some(pool) => println!(
                "  connections open={} idle={} max={} primary_in_use={} waiting={} generation={} acquired={}",
                pool.open_connections,
                pool.idle_connections,
                pool.max_connections,
                pool.primary_in_use,
                pool.waiting,
                pool.generation,
                pool.total_acquired
            ),
            None => println!("  closed"),
        }
    }
}
