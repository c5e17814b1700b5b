//! `nettaskctl` – command-line host for the nettest task engine.
//!
//! Drives the engine exclusively through its handle-table surface, the same
//! way a foreign host does: start, poll for events, interrupt, destroy.

mod config;
mod logging;
mod serve;

use clap::{Parser, Subcommand};
use engine::{EngineContext, HandleTable, TERMINATED};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ===========================================================================
// CLI definition
// ===========================================================================

#[derive(Parser)]
#[command(name = "nettaskctl", version, about = "Run nettests through the task engine")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the registered nettests.
    List {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run a nettest described by a settings file and print its events.
    Run {
        /// Settings document (JSON, or YAML with a .yaml/.yml extension).
        settings: PathBuf,
        /// Print raw event JSON, one per line.
        #[arg(long)]
        json: bool,
    },

    /// Start daemon mode over a Unix socket.
    Serve {
        /// Path for the Unix domain socket.
        #[arg(long)]
        socket: PathBuf,
    },
}

// ===========================================================================
// Main
// ===========================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let cfg = match config::load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: cannot load configuration: {}", e);
            std::process::exit(2);
        }
    };
    logging::init_logging(&cfg.logging);

    let engine = EngineContext::default_platform(cfg.engine);
    match cli.command {
        Commands::List { json } => cmd_list(&engine, json),
        Commands::Run { settings, json } => cmd_run(&settings, json, engine).await,
        Commands::Serve { socket } => {
            serve::run_daemon(socket, Arc::new(HandleTable::new(engine))).await
        }
    }
}

// ===========================================================================
// Subcommand implementations
// ===========================================================================

fn cmd_list(engine: &EngineContext, json: bool) {
    let names = engine.nettests().list();
    if json {
        println!("{}", serde_json::json!({ "nettests": names }));
    } else {
        for name in names {
            println!("{}", name);
        }
    }
}

async fn cmd_run(path: &Path, json: bool, engine: EngineContext) {
    let settings = match load_settings(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(2);
        }
    };

    let table = Arc::new(HandleTable::new(engine));
    let handle = table.start(Some(settings.as_str()));
    if handle == 0 {
        eprintln!("error: cannot start task");
        std::process::exit(2);
    }

    let interrupter = Arc::clone(&table);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupting...");
            interrupter.interrupt(handle);
        }
    });

    let consumer = Arc::clone(&table);
    let failure = tokio::task::spawn_blocking(move || {
        let failure = consume_events(&consumer, handle, json);
        consumer.destroy(handle);
        failure
    })
    .await
    .unwrap_or_else(|e| Some(format!("event loop failed: {}", e)));

    if let Some(failure) = failure {
        if !json {
            eprintln!("error: {}", failure);
        }
        std::process::exit(1);
    }
}

/// Print events until the stream terminates; returns the `status.end` failure.
fn consume_events(table: &HandleTable, handle: u32, json: bool) -> Option<String> {
    let mut failure = None;
    loop {
        let text = table.wait_for_next_event(handle);
        if text == TERMINATED {
            break;
        }
        let event: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "malformed event");
                continue;
            }
        };
        if event["key"] == "status.end" {
            failure = event["value"]["failure"]
                .as_str()
                .filter(|f| !f.is_empty())
                .map(String::from);
        }
        if json {
            println!("{}", text);
        } else if let Some(line) = summarize(&event) {
            println!("{}", line);
        }
    }
    failure
}

/// Settings as JSON text. YAML files are converted; anything else is handed
/// to the engine verbatim so parse errors surface in the event stream.
fn load_settings(path: &Path) -> Result<String, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read settings file {}: {}", path.display(), e))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if !is_yaml {
        return Ok(text);
    }
    let doc: Value = serde_yaml::from_str(&text)
        .map_err(|e| format!("invalid YAML in {}: {}", path.display(), e))?;
    Ok(doc.to_string())
}

// ===========================================================================
// Output helpers
// ===========================================================================

fn summarize(event: &Value) -> Option<String> {
    let key = event["key"].as_str()?;
    let v = &event["value"];
    let s = |field: &str| v[field].as_str().unwrap_or_default().to_string();
    let line = match key {
        "status.queued" => "queued".to_string(),
        "status.started" => "started".to_string(),
        "status.progress" => format!(
            "[{:>3.0}%] {}",
            v["percentage"].as_f64().unwrap_or_default() * 100.0,
            s("message")
        ),
        "status.geoip_lookup" => format!(
            "probe: {} {} ({})",
            s("probe_cc"),
            s("probe_asn"),
            s("probe_network_name")
        ),
        "status.report_create" => format!("report opened: {}", s("report_id")),
        "status.report_close" => format!("report closed: {}", s("report_id")),
        "status.measurement_start" => format!("#{} measuring {:?}", v["idx"], s("input")),
        "status.measurement_submission" => format!("#{} submitted", v["idx"]),
        "status.measurement_done" | "measurement" => return None,
        "log" => format!("[{}] {}", s("log_level"), s("message")),
        "status.end" => format!(
            "done: failure={:?} up={:.2}KB down={:.2}KB",
            s("failure"),
            v["uploaded_kb"].as_f64().unwrap_or_default(),
            v["downloaded_kb"].as_f64().unwrap_or_default()
        ),
        k if k.starts_with("failure.") || k.starts_with("bug.") => match v["idx"].as_u64() {
            Some(idx) => format!("#{} FAIL {}: {}", idx, k, s("failure")),
            None => format!("FAIL {}: {}", k, s("failure")),
        },
        other => other.to_string(),
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_summarize_progress_and_failures() {
        let line = summarize(&json!({
            "key": "status.progress",
            "value": { "message": "open report", "percentage": 0.4 }
        }))
        .unwrap();
        assert_eq!(line, "[ 40%] open report");

        let line = summarize(&json!({
            "key": "failure.measurement_submission",
            "value": { "failure": "unexpected status code: 500", "idx": 1, "input": "b", "json_str": "{}" }
        }))
        .unwrap();
        assert_eq!(line, "#1 FAIL failure.measurement_submission: unexpected status code: 500");

        assert!(summarize(&json!({ "key": "measurement", "value": {} })).is_none());
    }

    #[test]
    fn test_yaml_settings_are_converted() {
        let path = std::env::temp_dir().join(format!("nettaskctl_settings_{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "name: echo-nettest\ninputs: [a, b]\noptions:\n  no_bouncer: true\n",
        )
        .unwrap();
        let text = load_settings(&path).unwrap();
        let parsed = engine::Settings::parse(&text).unwrap();
        assert_eq!(parsed.name, "echo-nettest");
        assert_eq!(parsed.inputs, vec!["a", "b"]);
        assert!(parsed.options.no_bouncer);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_settings_file() {
        assert!(load_settings(Path::new("/nonexistent/settings.json")).is_err());
    }
}
