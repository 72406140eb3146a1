use std::path::PathBuf;

use clap::{Parser, Subcommand};
use indexsync::{Result, cmd};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the indexsync application
#[derive(Parser)]
#[command(name = "indexsync")]
#[command(about = "Keep a remote code-search index in sync with local git working copies")]
#[command(version)]
struct Cli {
   #[command(subcommand)]
   command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
   #[command(about = "Watch folders and upload changed files until interrupted")]
   Run {
      #[arg(required = true, help = "Workspace folders to keep in sync")]
      folders: Vec<PathBuf>,

      #[arg(
         long,
         default_value = "30",
         env = "INDEXSYNC_STATUS_INTERVAL",
         help = "Seconds between status reports"
      )]
      status_interval: u64,

      #[arg(long, help = "Print status reports as JSON")]
      json: bool,
   },

   #[command(about = "Show how a folder would be set up, without network access")]
   Inspect {
      #[arg(help = "Folder to inspect (default: cwd)")]
      folder: Option<PathBuf>,
   },
}

#[tokio::main]
async fn main() {
   tracing_subscriber::fmt()
      .with_env_filter(
         EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("indexsync=info")),
      )
      .with_writer(std::io::stderr)
      .init();

   let cli = Cli::parse();
   if let Err(err) = run(cli).await {
      eprintln!("{err}");
      std::process::exit(1);
   }
}

async fn run(cli: Cli) -> Result<()> {
   match cli.command {
      Cmd::Run { folders, status_interval, json } => {
         cmd::run::execute(folders, status_interval, json).await
      },
      Cmd::Inspect { folder } => {
         let folder = match folder {
            Some(folder) => folder,
            None => std::env::current_dir()?,
         };
         cmd::inspect::execute(folder).await
      },
   }
}
