use anyhow::Context;
use clap::{Parser, Subcommand};
use local_notes_lib::{init_tracing, open_context};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "local-notes")]
#[command(about = "Inspect, recover, export and import a local notes store", long_about = None)]
struct Cli {
    /// Directory holding notes.sqlite, local.sqlite, session.sqlite and core.json.
    #[arg(long, value_name = "DIR", default_value = ".")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the whole store as JSON
    Export { file: PathBuf },
    /// Replace the whole store with a JSON export
    Import { file: PathBuf },
    /// Finish interrupted imports and replay orphaned edits
    Recover,
    /// Show folders, note counts and trash
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("failed to create {}", cli.data_dir.display()))?;
    init_tracing(&cli.data_dir)?;

    let (core, notice) = open_context(&cli.data_dir)?;

    match cli.command {
        Commands::Export { file } => {
            let payload = core.export_data().await?;
            let json = serde_json::to_string_pretty(&payload)?;
            std::fs::write(&file, json).with_context(|| format!("failed to write {}", file.display()))?;
            println!(
                "Exported {} folder(s) and {} trashed note(s) to {}",
                payload.folders.len(),
                payload.trash.len(),
                file.display()
            );
        }
        Commands::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let summary = core.run_import(&raw).await?;
            println!(
                "Imported {} folder(s), {} note(s), {} trashed note(s)",
                summary.folders, summary.notes, summary.trashed
            );
            let report = summary.report;
            if report.rekeyed_folders + report.rekeyed_notes > 0 {
                println!(
                    "Re-keyed {} folder id(s) and {} note id(s)",
                    report.rekeyed_folders, report.rekeyed_notes
                );
            }
        }
        Commands::Recover => match &notice {
            Some(notice) => println!("{}", notice),
            None => println!("Nothing to recover."),
        },
        Commands::List => {
            let snapshot = core.snapshot()?;
            for folder in &snapshot.folders {
                println!("{}\t{}\t{} note(s)", folder.id, folder.name, folder.notes.len());
            }
            println!("trash\t{} note(s)", snapshot.trash.len());
            println!("lastSavedTimestamp\t{}", snapshot.last_saved_timestamp);
        }
    }

    core.shutdown().await?;
    Ok(())
}
