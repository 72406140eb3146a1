//! Foreground sync command.
//!
//! Starts the engine for the given folders with the real collaborators,
//! prints a status line per folder on an interval, reloads configuration when
//! the config directory changes, and disposes on Ctrl+C.

use std::{path::PathBuf, sync::Arc, time::Duration};

use console::style;
use notify_debouncer_mini::{
   DebounceEventResult, Debouncer, new_debouncer,
   notify::{RecommendedWatcher, RecursiveMode},
};
use tokio::{signal, time};

use crate::{
   Result,
   collab::Collaborators,
   config::FileConfigSource,
   git::GitInspector,
   indexer::ManagedIndexer,
   remote::HttpClient,
   types::FolderSnapshot,
   watcher::FsWatcherFactory,
};

/// Executes the run command until interrupted.
pub async fn execute(folders: Vec<PathBuf>, status_interval: u64, json: bool) -> Result<()> {
   let source = Arc::new(FileConfigSource::new());
   let settings = source.config();

   let http = HttpClient::shared(&settings)?;
   let collab = Collaborators {
      fetcher:      http.clone(),
      uploader:     http.clone(),
      entitlements: http,
      inspector:    Arc::new(GitInspector::new(Arc::clone(&settings))),
      watchers:     Arc::new(FsWatcherFactory::new(Arc::clone(&settings))),
   };

   let folders = folders
      .into_iter()
      .map(|f| f.canonicalize())
      .collect::<std::io::Result<Vec<_>>>()?;

   let indexer = ManagedIndexer::new(source.clone(), settings, collab, folders);
   indexer.start().await;
   if !indexer.is_active() {
      eprintln!(
         "{}",
         style("indexing is not active; check credentials and organization entitlement").yellow()
      );
   }

   let _config_watch = watch_config(&source);

   let mut status = time::interval(Duration::from_secs(status_interval.max(1)));
   loop {
      tokio::select! {
         _ = signal::ctrl_c() => break,
         _ = status.tick() => print_status(&indexer, json)?,
      }
   }

   println!("{}", style("shutting down").dim());
   indexer.dispose().await;
   Ok(())
}

/// Reloads `source` whenever anything in its directory changes. Returns
/// `None` when the directory cannot be watched.
fn watch_config(source: &Arc<FileConfigSource>) -> Option<Debouncer<RecommendedWatcher>> {
   let dir = source.config_path().parent()?.to_path_buf();
   if !dir.is_dir() {
      tracing::debug!("config directory {} does not exist; not watching", dir.display());
      return None;
   }

   let target = Arc::clone(source);
   let mut debouncer = new_debouncer(Duration::from_millis(300), move |result: DebounceEventResult| {
      match result {
         Ok(events) if !events.is_empty() => target.reload(),
         Ok(_) => {},
         Err(e) => tracing::warn!("config watch error: {e}"),
      }
   })
   .inspect_err(|e| tracing::warn!("cannot watch config: {e}"))
   .ok()?;

   debouncer
      .watcher()
      .watch(&dir, RecursiveMode::NonRecursive)
      .inspect_err(|e| tracing::warn!("cannot watch {}: {e}", dir.display()))
      .ok()?;
   Some(debouncer)
}

fn print_status(indexer: &ManagedIndexer, json: bool) -> Result<()> {
   let folders = indexer.workspace_folder_state_snapshot();
   if json {
      println!("{}", serde_json::to_string(&folders)?);
      return Ok(());
   }

   for folder in &folders {
      print_folder(folder);
   }
   let errors = indexer.errors();
   println!(
      "  {} {} queued, {} errors",
      style("↳").dim(),
      indexer.queue_len(),
      errors.len()
   );
   if let Some(last) = errors.last() {
      println!("    {} {}", style(last.kind.as_str()).red(), last.message);
   }
   Ok(())
}

fn print_folder(folder: &FolderSnapshot) {
   let marker = match (&folder.error, folder.is_indexing) {
      (Some(_), _) => style("●").red(),
      (None, true) => style("●").yellow(),
      (None, false) => style("●").green(),
   };
   let state = if folder.is_indexing { "scanning" } else { "idle" };
   println!(
      "  {} {} {} {} {}",
      marker,
      style(&folder.folder_name).bold(),
      folder.git_branch.as_deref().unwrap_or("-"),
      style(folder.project_id.as_deref().unwrap_or("-")).dim(),
      style(state).dim()
   );
   if let Some(error) = &folder.error {
      println!("    {} {}", style(error.kind.as_str()).red(), error.message);
   }
}
