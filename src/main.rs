use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use snaptest::asserter::format_diffs;
use snaptest::config::Config;
use snaptest::diff::compute_diff;
use snaptest::replayer::Replayer;
use snaptest::reporter::{self, Format};
use snaptest::snapshot::Snapshot;
use snaptest::store::Store;
use snaptest::{db, httpclient, logging, recorder, security};

#[derive(Debug, Parser)]
#[command(
    name = "snaptest",
    about = "Record and replay service interactions for deterministic integration testing"
)]
struct Cli {
    /// Log level: debug, info, warn, error.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the recording proxy to capture snapshots.
    Record {
        /// Path to config TOML.
        #[arg(short, long, default_value = "snaptest.toml")]
        config: PathBuf,
        /// Tags to apply to recorded snapshots.
        #[arg(short, long)]
        tag: Vec<String>,
    },
    /// Replay snapshots against the service and verify behavior.
    Replay {
        #[arg(short, long, default_value = "snaptest.toml")]
        config: PathBuf,
        /// Path to a specific snapshot file.
        #[arg(short, long)]
        snapshot: Option<String>,
        /// Replay snapshots with these tags (comma-separated).
        #[arg(short, long)]
        tag: Option<String>,
        /// CI-friendly output (JUnit XML).
        #[arg(long)]
        ci: bool,
        /// Output format: text, junit, tap, json.
        #[arg(short, long)]
        format: Option<String>,
    },
    /// List all recorded snapshots.
    List {
        #[arg(short, long, default_value = "snaptest.toml")]
        config: PathBuf,
    },
    /// Show the diff for a snapshot replay.
    Diff {
        #[arg(short, long, default_value = "snaptest.toml")]
        config: PathBuf,
        #[arg(short, long)]
        snapshot: String,
    },
    /// Update a snapshot with the current service behavior.
    Update {
        #[arg(short, long, default_value = "snaptest.toml")]
        config: PathBuf,
        #[arg(short, long)]
        snapshot: String,
    },
    /// Start a passthrough proxy without recording snapshots.
    Proxy {
        #[arg(short, long, default_value = "snaptest.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Record { config, tag } => {
            let config = load_config(&config, cli.log_level.as_deref())?;
            let handle = recorder::serve(&config, tag).await?;
            eprintln!("recording proxy listening on {}", handle.listen_addr);
            eprintln!("outgoing capture proxy on {}", handle.outgoing_addr);
            tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
            handle.shutdown().await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Replay {
            config,
            snapshot,
            tag,
            ci,
            format,
        } => {
            let config = load_config(&config, cli.log_level.as_deref())?;
            run_replay(&config, snapshot, tag, ci, format).await
        }
        Command::List { config } => {
            let config = load_config(&config, cli.log_level.as_deref())?;
            let store = store_for(&config);
            let infos = store.list()?;

            if infos.is_empty() {
                println!("No snapshots found.");
                return Ok(ExitCode::SUCCESS);
            }

            println!(
                "{:<12} {:<8} {:<30} {:<6} {}",
                "ID", "METHOD", "URL", "STATUS", "TAGS"
            );
            println!("{}", "-".repeat(80));
            for info in &infos {
                println!(
                    "{:<12} {:<8} {:<30} {:<6} {}",
                    info.id,
                    info.method,
                    info.url,
                    info.status,
                    info.tags.join(", ")
                );
            }
            println!("\nTotal: {} snapshot(s)", infos.len());
            Ok(ExitCode::SUCCESS)
        }
        Command::Diff { config, snapshot } => {
            let config = load_config(&config, cli.log_level.as_deref())?;
            security::validate_snapshot_path(&snapshot, &config.recording.snapshot_dir)
                .context("invalid snapshot path")?;

            let store = store_for(&config);
            let snap = store.load(&snapshot).context("load snapshot")?;

            let replayer = Replayer::new(&config).await?;
            let result = replayer.replay_one(&snap, &snapshot).await;
            replayer.close().await;

            if !result.error.is_empty() {
                println!("ERROR: {}", result.error);
            } else if result.passed {
                println!("No differences found. Snapshot matches current behavior.");
            } else {
                println!("{}", format_diffs(&result.diffs));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Update { config, snapshot } => {
            let config = load_config(&config, cli.log_level.as_deref())?;
            security::validate_snapshot_path(&snapshot, &config.recording.snapshot_dir)
                .context("invalid snapshot path")?;

            let store = store_for(&config);
            let mut snap: Snapshot = store.load(&snapshot).context("load snapshot")?;

            let replayer = Replayer::new(&config).await?;
            let result = replayer.replay_one(&snap, &snapshot).await;
            replayer.close().await;
            if !result.error.is_empty() {
                anyhow::bail!("replay failed: {}", result.error);
            }
            if result.passed {
                println!("Snapshot already matches current behavior. No update needed.");
                return Ok(ExitCode::SUCCESS);
            }

            // Fresh capture of what the service does now.
            let snapshotter =
                db::Snapshotter::connect(&config.database, config.replay_connection_string())
                    .await
                    .context("connect to test database")?;

            snapshotter
                .restore_all(&snap.db_state_before)
                .await
                .context("restore DB state")?;

            let actual_response = httpclient::fire_request(
                &config.service.base_url,
                &snap.request,
                config.replay.timeout_ms,
            )
            .await
            .context("fire request")?;

            let actual_db_after = snapshotter
                .snapshot_all()
                .await
                .context("snapshot DB after request")?;
            snapshotter.close().await;

            snap.db_diff = compute_diff(&snap.db_state_before, &actual_db_after);
            snap.response = actual_response;
            snap.db_state_after = actual_db_after;

            store.update(&snapshot, &snap).context("update snapshot")?;
            println!("Updated snapshot: {snapshot}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Proxy { config } => {
            let config = load_config(&config, cli.log_level.as_deref())?;
            let handle = recorder::serve_passthrough(&config).await?;
            eprintln!("passthrough proxy listening on {}", handle.listen_addr);
            tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
            handle.shutdown().await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_replay(
    config: &Config,
    snapshot: Option<String>,
    tag: Option<String>,
    ci: bool,
    format: Option<String>,
) -> anyhow::Result<ExitCode> {
    let store = store_for(config);

    let (snapshots, paths) = if let Some(snapshot_path) = snapshot {
        security::validate_snapshot_path(&snapshot_path, &config.recording.snapshot_dir)
            .context("invalid snapshot path")?;
        let snap = store.load(&snapshot_path).context("load snapshot")?;
        (vec![snap], vec![PathBuf::from(snapshot_path)])
    } else if let Some(tag_list) = tag {
        let tags: Vec<String> = tag_list.split(',').map(str::to_owned).collect();
        store.load_by_tag(&tags).context("load snapshots by tag")?
    } else {
        store.load_all().context("load snapshots")?
    };

    if snapshots.is_empty() {
        println!("No snapshots found.");
        return Ok(ExitCode::SUCCESS);
    }

    println!("Replaying {} snapshot(s)...\n", snapshots.len());

    let replayer = Arc::new(Replayer::new(config).await?);
    let paths: Vec<String> = paths
        .into_iter()
        .map(|path| path.display().to_string())
        .collect();
    let results = replayer.replay_all(snapshots, paths).await;
    replayer.close().await;

    let output_format = match format.as_deref() {
        Some(raw) => Format::parse(raw).unwrap_or_default(),
        None if ci => Format::Junit,
        None => Format::Text,
    };
    print!("{}", reporter::report(&results, output_format)?);

    let any_failed = results
        .iter()
        .any(|result| !result.passed || !result.error.is_empty());
    if any_failed && config.replay.strict_mode {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn load_config(path: &std::path::Path, log_level: Option<&str>) -> anyhow::Result<Config> {
    let path_str = path.to_string_lossy();
    security::validate_config_path(&path_str).context("invalid config path")?;
    let config = Config::from_path(path).context("load config")?;
    logging::init(&config, log_level)?;
    Ok(config)
}

fn store_for(config: &Config) -> Store {
    Store::new(
        config.recording.snapshot_dir.clone(),
        config.recording.format,
    )
}
