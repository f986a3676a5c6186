//! FewWord - artifact lifecycle CLI
//!
//! The `fewword` command drives the artifact engine from a shell or a host
//! hook.
//!
//! ## Commands
//!
//! - `capture`: Tier, redact and persist one command output
//! - `cleanup`: Run a retention pass
//! - `correlate` / `cluster`: Find related and repeating failures
//! - `lookup` / `recent`: Find and print stored artifacts
//! - `pin` / `rm` / `save`: Manage artifacts by hand

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{warn, Level};

use fewword_core::{CaptureRequest, Engine, FewwordConfig, ManifestEntry, StoreOutcome};

#[derive(Parser)]
#[command(name = "fewword")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lifecycle engine for large command outputs", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output and JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Workspace root holding the .fewword directory
    #[arg(long, global = true, env = "FEWWORD_ROOT", default_value = ".")]
    root: PathBuf,

    /// TOML config file (built-in defaults when omitted)
    #[arg(long, global = true, env = "FEWWORD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture one completed command output (read from stdin or a file)
    Capture {
        /// The command line that produced the output
        #[arg(long)]
        cmd: String,

        /// Exit code of the command, if known
        #[arg(short, long, allow_hyphen_values = true)]
        exit_code: Option<i32>,

        /// Session identifier recorded with the artifact
        #[arg(long, env = "FEWWORD_SESSION_ID", default_value = "cli")]
        session: String,

        /// Read output from this file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Run a retention pass: orphans, TTL, then the size cap
    Cleanup,

    /// Show past failures similar to the selected one
    Correlate {
        /// Recent number, id, command token or title
        selector: String,
    },

    /// Show groups of repeating failures
    Cluster,

    /// Print the content of a stored artifact
    Lookup {
        /// Recent number, id, command token or title
        selector: String,
    },

    /// List readable artifacts, newest first
    Recent {
        /// Maximum number of entries to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Copy an artifact into durable pinned storage
    Pin {
        /// Recent number, id, command token or title
        selector: String,

        /// Reason recorded with the pin
        #[arg(short, long, default_value = "manual")]
        reason: String,
    },

    /// Delete an artifact's scratch file (pinned copies are kept)
    Rm {
        /// Recent number, id, command token or title
        selector: String,
    },

    /// Save text (stdin or a file) as a manual artifact or export
    Save {
        /// Title used to find it later
        #[arg(short, long)]
        title: String,

        /// Where the text came from
        #[arg(short, long, default_value = "user")]
        source: String,

        /// Write to the exports directory, which cleanup never touches
        #[arg(long)]
        export: bool,

        #[arg(long, env = "FEWWORD_SESSION_ID", default_value = "cli")]
        session: String,

        /// Read text from this file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Rotate the active manifest into a dated segment
    Rotate,

    /// Show disk usage of scratch, pinned and export storage
    Stats,

    /// Redact text from stdin or a file and print it
    Redact {
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// List the matching rules and secret lengths instead of the text
        #[arg(long)]
        matches: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    fewword_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref());
    let engine = Engine::new(&cli.root, config);
    for diagnostic in engine.diagnostics() {
        warn!(diagnostic = %diagnostic, "config diagnostic");
    }

    match cli.command {
        Commands::Capture {
            cmd,
            exit_code,
            session,
            input,
        } => cmd_capture(&engine, cmd, exit_code, session, input.as_deref(), cli.json),
        Commands::Cleanup => emit(&engine.sweep(), cli.json, |r| {
            format!(
                "removed {} (orphans {}, ttl {}, lru {}), failed {}, freed {} bytes; {} files / {} bytes remain",
                r.removed_count(),
                r.orphans_removed.len(),
                r.ttl_removed.len(),
                r.lru_removed.len(),
                r.failed.len(),
                r.bytes_freed,
                r.remaining_files,
                r.remaining_bytes,
            )
        }),
        Commands::Correlate { selector } => cmd_correlate(&engine, &selector, cli.json),
        Commands::Cluster => cmd_cluster(&engine, cli.json),
        Commands::Lookup { selector } => cmd_lookup(&engine, &selector, cli.json),
        Commands::Recent { limit } => cmd_recent(&engine, limit, cli.json),
        Commands::Pin { selector, reason } => {
            let pin = engine
                .pin(&selector, &reason)
                .with_context(|| format!("could not pin '{selector}'"))?;
            emit(&pin, cli.json, |p| format!("pinned {} -> {}", p.id, p.pinned_path))
        }
        Commands::Rm { selector } => {
            let id = engine
                .remove(&selector)
                .with_context(|| format!("could not remove '{selector}'"))?;
            emit(&id, cli.json, |id| format!("removed {id}"))
        }
        Commands::Save {
            title,
            source,
            export,
            session,
            input,
        } => {
            let text = read_input(input.as_deref())?;
            let outcome = if export {
                engine.export(&title, &text, &session)
            } else {
                engine.save_manual(&title, &text, &source, &session)
            };
            if let StoreOutcome::NotStored { notice } = &outcome {
                bail!("{notice}");
            }
            emit(&outcome, cli.json, |o| match o {
                StoreOutcome::Stored { id, path } => format!("saved {id} -> {path}"),
                StoreOutcome::NotStored { notice } => notice.clone(),
            })
        }
        Commands::Rotate => match engine.rotate() {
            Some(report) => emit(&report, cli.json, |r| {
                format!(
                    "rotated {} bytes to {}, pruned {} segment(s)",
                    r.rotated_bytes,
                    r.rotated_to.display(),
                    r.pruned.len()
                )
            }),
            None => {
                println!("nothing to rotate");
                Ok(())
            }
        },
        Commands::Stats => emit(&engine.stats(), cli.json, |s| {
            format!(
                "manifest: {} bytes, {} segment(s)\nscratch:  {} files, {} bytes ({} compressed)\npinned:   {} files, {} bytes\nexports:  {} files",
                s.manifest_bytes,
                s.manifest_segments,
                s.scratch_files,
                s.scratch_bytes,
                s.compressed_files,
                s.pinned_files,
                s.pinned_bytes,
                s.export_files,
            )
        }),
        Commands::Redact { input, matches } => {
            let text = read_input(input.as_deref())?;
            if matches {
                let found = engine.redaction_matches(&text);
                return emit(&found, cli.json, |found| {
                    found
                        .iter()
                        .map(|m| format!("{} ({} chars)", m.rule, m.length))
                        .collect::<Vec<_>>()
                        .join("\n")
                });
            }
            let result = engine.redact_text(&text);
            emit(&result, cli.json, |r| r.text.clone())
        }
    }
}

/// Load the config file, falling back to defaults when it is unusable.
fn load_config(path: Option<&Path>) -> FewwordConfig {
    let Some(path) = path else {
        return FewwordConfig::default();
    };
    match FewwordConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config unusable, using defaults");
            FewwordConfig::default()
        }
    }
}

fn read_input(path: Option<&Path>) -> Result<String> {
    let bytes = match path {
        Some(p) => std::fs::read(p).with_context(|| format!("failed to read {}", p.display()))?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Print `value` as pretty JSON or through `text`.
fn emit<T: Serialize>(value: &T, json: bool, text: impl FnOnce(&T) -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text(value));
    }
    Ok(())
}

fn cmd_capture(
    engine: &Engine,
    command: String,
    exit_code: Option<i32>,
    session_id: String,
    input: Option<&Path>,
    json: bool,
) -> Result<()> {
    let output = read_input(input)?;
    let outcome = engine.capture(&CaptureRequest {
        output,
        exit_code,
        command,
        session_id,
    });
    if json {
        let value = serde_json::json!({
            "id": outcome.id(),
            "text": outcome.render(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", outcome.render());
    }
    Ok(())
}

fn cmd_correlate(engine: &Engine, selector: &str, json: bool) -> Result<()> {
    let target = engine
        .resolve_selector(selector)
        .with_context(|| format!("no artifact matches '{selector}'"))?;
    let Some(offload) = target.as_offload() else {
        bail!("'{selector}' is not a captured command output");
    };
    if !offload.is_failure() {
        bail!("[{}] {} did not fail", offload.id, offload.cmd);
    }

    let found = engine.correlate(offload.id.as_str());
    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }
    if found.is_empty() {
        println!("No similar failures for [{}] {}", offload.id, offload.cmd);
        return Ok(());
    }
    println!("Similar to [{}] {}:", offload.id, offload.cmd);
    for c in &found {
        println!(
            "  [{}] {} {:.2} ({})  {}",
            c.entry.id,
            c.entry.cmd,
            c.score,
            c.reason,
            c.entry.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn cmd_cluster(engine: &Engine, json: bool) -> Result<()> {
    let clusters = engine.clusters();
    if json {
        println!("{}", serde_json::to_string_pretty(&clusters)?);
        return Ok(());
    }
    if clusters.is_empty() {
        println!("No repeating failures.");
        return Ok(());
    }
    for cluster in &clusters {
        println!("{} ({} failures)", cluster.tail_hash, cluster.entries.len());
        for entry in &cluster.entries {
            println!("  [{}] {} e={:?}", entry.id, entry.cmd, entry.exit_code);
        }
    }
    Ok(())
}

fn cmd_lookup(engine: &Engine, selector: &str, json: bool) -> Result<()> {
    let entry = engine
        .resolve_selector(selector)
        .with_context(|| format!("no artifact matches '{selector}'"))?;
    let content = engine
        .read_content(&entry)
        .with_context(|| format!("content of [{}] is no longer available", entry.id()))?;
    if json {
        let value = serde_json::json!({ "entry": entry, "content": content });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print!("{content}");
    }
    Ok(())
}

fn cmd_recent(engine: &Engine, limit: usize, json: bool) -> Result<()> {
    let items = engine.recent(limit);
    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    if items.is_empty() {
        println!("No artifacts.");
        return Ok(());
    }
    for item in &items {
        let detail = match &item.entry {
            ManifestEntry::Offload(o) => format!(
                "{} e={}",
                o.cmd,
                o.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "?".into())
            ),
            other => format!("{} \"{}\"", other.kind(), other.label()),
        };
        let pin = if item.pinned_only {
            " (pinned copy)"
        } else if item.pinned {
            " (pinned)"
        } else {
            ""
        };
        println!(
            "{:>3}. [{}] {:<28} {:>4} ago{}",
            item.number,
            item.entry.id(),
            detail,
            item.age,
            pin
        );
    }
    Ok(())
}
