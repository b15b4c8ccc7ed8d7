use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use quarry_core::{Engine, EngineConfig};
use serde_json::{json, Value};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

/// Documents sent per insert command during import.
const IMPORT_BATCH: usize = 1000;

#[derive(Parser)]
#[command(name = "quarry")]
#[command(about = "QuarryDB CLI - run commands against a QuarryDB data directory")]
#[command(version)]
struct Cli {
    /// Data directory (journal and checkpoint). Without it the engine is in-memory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// JSON engine configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a JSON array of commands, printing each reply
    Run {
        /// Script file containing `[{command}, ...]`
        script: PathBuf,
    },
    /// Read one JSON command per line from stdin
    Shell,
    /// Import a JSON array of documents into a collection
    Import {
        /// JSON file to import
        file: PathBuf,
        /// Target namespace (`db.collection`)
        #[arg(long)]
        ns: String,
    },
    /// Export a collection as a JSON array
    Export {
        /// Source namespace (`db.collection`)
        #[arg(long)]
        ns: String,
        /// Output file (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Write a checkpoint and compact the journal
    Checkpoint,
    /// Print recovery statistics and server status
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let engine = open_engine(cli.data_dir.as_deref(), cli.config.as_deref())?;

    match cli.command {
        Commands::Run { script } => run_script(&engine, &script),
        Commands::Shell => shell(&engine),
        Commands::Import { file, ns } => import_data(&engine, &file, &ns),
        Commands::Export { ns, out } => export_data(&engine, &ns, out.as_deref()),
        Commands::Checkpoint => checkpoint(&engine),
        Commands::Status => status(&engine),
    }
}

fn open_engine(data_dir: Option<&Path>, config: Option<&Path>) -> Result<Engine> {
    let mut engine_config = match config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => EngineConfig::in_memory(),
    };
    if let Some(dir) = data_dir {
        engine_config.data_dir = Some(dir.to_path_buf());
    }
    let description = engine_config
        .data_dir
        .as_ref()
        .map(|d| d.display().to_string())
        .unwrap_or_else(|| "in-memory engine".to_string());
    Engine::open(engine_config).with_context(|| format!("Failed to open {}", description))
}

fn split_ns(ns: &str) -> Result<(&str, &str)> {
    match ns.split_once('.') {
        Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok((db, coll)),
        _ => bail!("Namespace must be of the form db.collection, got '{}'", ns),
    }
}

fn succeeded(reply: &Value) -> bool {
    reply["ok"].as_f64() == Some(1.0)
}

/// Execute commands from a script file
fn run_script(engine: &Engine, script: &Path) -> Result<()> {
    let content = fs::read_to_string(script)
        .with_context(|| format!("Failed to read script: {}", script.display()))?;
    let commands: Vec<Value> = serde_json::from_str(&content)
        .with_context(|| format!("Script must be a JSON array of commands: {}", script.display()))?;

    let mut failed = 0;
    for command in &commands {
        let reply = engine.execute(command);
        if !succeeded(&reply) {
            failed += 1;
        }
        println!("{}", reply);
    }
    if failed > 0 {
        eprintln!("{} of {} commands failed", failed, commands.len());
    }
    Ok(())
}

/// One command per stdin line, one reply per stdout line
fn shell(engine: &Engine) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read from stdin")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        let reply = match serde_json::from_str::<Value>(line) {
            Ok(command) => engine.execute(&command),
            Err(err) => json!({"ok": 0.0, "errmsg": format!("invalid JSON: {}", err), "code": 9, "codeName": "FailedToParse"}),
        };
        writeln!(stdout, "{}", reply).context("Failed to write reply")?;
        stdout.flush().context("Failed to write reply")?;
    }
    Ok(())
}

/// Import data from a JSON array file
fn import_data(engine: &Engine, file: &Path, ns: &str) -> Result<()> {
    let (db, coll) = split_ns(ns)?;
    let content = fs::read_to_string(file)
        .with_context(|| format!("Failed to read file: {}", file.display()))?;
    let data: Value = serde_json::from_str(&content)
        .with_context(|| format!("Invalid JSON in file: {}", file.display()))?;
    let documents = data
        .as_array()
        .with_context(|| format!("{} must contain a JSON array of documents", file.display()))?;

    let mut inserted = 0;
    let mut errors = 0;
    for batch in documents.chunks(IMPORT_BATCH) {
        let reply = engine.execute(&json!({
            "insert": coll,
            "documents": batch,
            "ordered": false,
            "$db": db,
        }));
        if !succeeded(&reply) {
            bail!("Import into {} failed: {}", ns, reply["errmsg"]);
        }
        inserted += reply["n"].as_u64().unwrap_or(0);
        if let Some(write_errors) = reply["writeErrors"].as_array() {
            for err in write_errors {
                eprintln!("skipped document {}: {}", err["index"], err["errmsg"]);
            }
            errors += write_errors.len();
        }
    }

    println!("Imported {} documents into '{}' ({} skipped)", inserted, ns, errors);
    Ok(())
}

/// Export a collection through find/getMore
fn export_data(engine: &Engine, ns: &str, out: Option<&Path>) -> Result<()> {
    let (db, coll) = split_ns(ns)?;
    let mut documents: Vec<Value> = Vec::new();
    let mut reply = engine.execute(&json!({"find": coll, "sort": {"_id": 1}, "$db": db}));
    let mut batch_field = "firstBatch";
    loop {
        if !succeeded(&reply) {
            bail!("Export of {} failed: {}", ns, reply["errmsg"]);
        }
        if let Some(batch) = reply["cursor"][batch_field].as_array() {
            documents.extend(batch.iter().cloned());
        }
        let cursor_id = reply["cursor"]["id"].as_i64().unwrap_or(0);
        if cursor_id == 0 {
            break;
        }
        reply = engine.execute(&json!({"getMore": cursor_id, "collection": coll, "$db": db}));
        batch_field = "nextBatch";
    }

    let count = documents.len();
    let json = serde_json::to_string_pretty(&Value::Array(documents)).context("Failed to serialize to JSON")?;
    match out {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("Failed to write to file: {}", path.display()))?;
            eprintln!("Exported {} documents from '{}' to {}", count, ns, path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn checkpoint(engine: &Engine) -> Result<()> {
    let stats = engine.checkpoint().context("Checkpoint failed")?;
    println!(
        "Checkpoint at ts {}: {} collections, {} documents, {} journal records kept",
        stats.ts, stats.collections, stats.documents, stats.journal_records_kept
    );
    Ok(())
}

fn status(engine: &Engine) -> Result<()> {
    let recovery = engine.recovery_stats();
    let mut status = engine.server_status();
    status["recovery"] = json!({
        "checkpointTs": recovery.checkpoint_ts,
        "collectionsLoaded": recovery.collections_loaded,
        "documentsLoaded": recovery.documents_loaded,
        "recordsReplayed": recovery.records_replayed,
        "recordsSkipped": recovery.records_skipped,
        "preparedRestored": recovery.prepared_restored,
    });
    let json = serde_json::to_string_pretty(&status).context("Failed to serialize status")?;
    println!("{}", json);
    Ok(())
}
