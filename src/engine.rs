//! Watcher event handling.
//!
//! Each event is handled in two phases. [`EventProcessor::apply`] performs the
//! synchronous transition (folder lookup, indexing flag, branch commit) and
//! hands back whatever must wait on I/O as a detached future. Callers that
//! dispatch many events can therefore run the async tails concurrently while
//! the synchronous parts still happen in delivery order.

use std::{path::PathBuf, sync::Arc};

use futures::{FutureExt, future::BoxFuture};

use crate::{
   collab::RepositoryInspector,
   config::Config,
   error::{ErrorKind, IndexerError},
   manifest::{ManifestRequest, is_file_indexed},
   registry::{FolderUpdate, WorkspaceFolderState},
   store::Store,
   types::{EventKind, FileUpsertTask, WatcherEvent, relative_path},
};

/// Remaining asynchronous work for one event.
pub type PendingWork = BoxFuture<'static, ()>;

#[derive(Clone)]
pub struct EventProcessor {
   store:     Arc<Store>,
   inspector: Arc<dyn RepositoryInspector>,
   settings:  Arc<Config>,
}

impl EventProcessor {
   pub fn new(store: Arc<Store>, inspector: Arc<dyn RepositoryInspector>, settings: Arc<Config>) -> Self {
      Self { store, inspector, settings }
   }

   /// Handles one event to completion.
   pub async fn process_event(&self, event: WatcherEvent) {
      if let Some(work) = self.apply(event) {
         work.await;
      }
   }

   /// Applies the synchronous part of an event and returns the rest.
   pub fn apply(&self, event: WatcherEvent) -> Option<PendingWork> {
      if !self.store.is_active() {
         return None;
      }
      let generation = self.store.generation();

      let Some(folder) = self.store.find_by_watcher(event.watcher) else {
         tracing::warn!("dropping {} event from unknown {}", event.kind.name(), event.watcher);
         return None;
      };

      match event.kind {
         EventKind::ScanStart => {
            tracing::debug!("scan started for {}", folder.folder.display());
            self.store.update_folder(generation, &folder.folder, FolderUpdate {
               is_indexing: Some(true),
               last_error: Some(None),
               ..FolderUpdate::default()
            });
            None
         },
         EventKind::ScanEnd => {
            tracing::debug!("scan finished for {}", folder.folder.display());
            self
               .store
               .update_folder(generation, &folder.folder, FolderUpdate::indexing(false));
            None
         },
         EventKind::FileDeleted { file_path } => {
            tracing::debug!("{} deleted in {}; not propagated", file_path, folder.folder.display());
            None
         },
         EventKind::FileChanged { file_path, file_hash } => self.on_file_changed(
            generation,
            folder,
            FileChange {
               file_path,
               file_hash,
               branch: event.branch,
               is_base_branch: event.is_base_branch,
            },
         ),
         EventKind::BranchChanged { previous_branch, new_branch } => {
            self.on_branch_changed(generation, folder, previous_branch, new_branch)
         },
      }
   }

   fn on_file_changed(
      &self,
      generation: u64,
      folder: WorkspaceFolderState,
      change: FileChange,
   ) -> Option<PendingWork> {
      let file_path = relative_path(&folder.folder, &change.file_path);
      if !self.settings.is_supported_file(&file_path) {
         tracing::debug!("ignoring unsupported file {file_path}");
         return None;
      }

      let config = self.store.config();
      if config.credentials().is_none() {
         tracing::debug!("ignoring {file_path}: credentials not configured");
         return None;
      }
      let Some(project_id) = folder.project_id.clone() else {
         tracing::debug!("ignoring {file_path}: no project for {}", folder.folder.display());
         return None;
      };

      let store = Arc::clone(&self.store);
      let workspace_path = folder.folder;
      Some(
         async move {
            let Some((token, organization_id)) = config.credentials() else {
               return;
            };
            let request = ManifestRequest {
               organization_id,
               project_id: &project_id,
               branch: &change.branch,
               token,
            };

            let fetched = store.cache().get_or_fetch(request).await;
            let manifest = match fetched {
               Ok(manifest) => manifest,
               Err(e) => {
                  let error = IndexerError::from_error(ErrorKind::Manifest, &e)
                     .with_file(file_path)
                     .with_branch(change.branch)
                     .with_operation("file-changed");
                  store.update_folder(generation, &workspace_path, FolderUpdate::error(error));
                  return;
               },
            };

            if is_file_indexed(&manifest, &file_path, &change.file_hash) {
               tracing::debug!("{file_path} already indexed on {}", change.branch);
               return;
            }
            // The folder may have been disposed while the manifest was loading.
            if !store.is_current(generation) || store.folder(&workspace_path).is_none() {
               return;
            }

            tracing::debug!("queueing {file_path} for upload ({})", change.branch);
            store.queue().enqueue(FileUpsertTask {
               file_path,
               file_hash: change.file_hash,
               branch: change.branch,
               is_base_branch: change.is_base_branch,
               project_id,
               workspace_path,
            });
         }
         .boxed(),
      )
   }

   fn on_branch_changed(
      &self,
      generation: u64,
      folder: WorkspaceFolderState,
      previous_branch: String,
      new_branch: String,
   ) -> Option<PendingWork> {
      tracing::info!(
         "{}: branch changed {previous_branch} -> {new_branch}",
         folder.folder.display()
      );
      // The branch always commits, whatever happens below.
      self.store.update_folder(generation, &folder.folder, FolderUpdate {
         git_branch: Some(Some(new_branch.clone())),
         ..FolderUpdate::default()
      });

      let store = Arc::clone(&self.store);
      let inspector = Arc::clone(&self.inspector);
      Some(
         async move {
            let path: PathBuf = folder.folder.clone();
            let old_project = folder.project_id.clone();

            let resolved = inspector
               .project_config(&path, folder.repository_url.as_deref())
               .await;
            let project_id = match resolved {
               Ok(Some(cfg)) => Some(cfg.project.id),
               Ok(None) => {
                  let error = IndexerError::new(
                     ErrorKind::Config,
                     format!("no project configured for branch {new_branch}"),
                  )
                  .with_branch(new_branch.clone())
                  .with_operation("branch-changed");
                  store.update_folder(generation, &path, FolderUpdate {
                     project_id: Some(None),
                     last_error: Some(Some(error)),
                     ..FolderUpdate::default()
                  });
                  None
               },
               Err(e) => {
                  let error = IndexerError::from_error(ErrorKind::Config, &e)
                     .with_branch(new_branch.clone())
                     .with_operation("branch-changed");
                  store.update_folder(generation, &path, FolderUpdate::error(error));
                  None
               },
            };

            if let Some(old) = &old_project {
               store.cache().invalidate_for_branch(old, &previous_branch);
            }
            let Some(project_id) = project_id else {
               return;
            };
            // Project resolved: errors left over from the previous branch no
            // longer apply.
            store.update_folder(generation, &path, FolderUpdate {
               project_id: Some(Some(project_id.clone())),
               last_error: Some(None),
               ..FolderUpdate::default()
            });

            let config = store.config();
            let Some((token, organization_id)) = config.credentials() else {
               tracing::debug!("no credentials; manifest for {new_branch} fetched on first change");
               return;
            };
            let request = ManifestRequest {
               organization_id,
               project_id: &project_id,
               branch: &new_branch,
               token,
            };
            let fetched = store.cache().get_or_fetch(request).await;
            let update = match fetched {
               Ok(_) => FolderUpdate::clear_error(),
               Err(e) => FolderUpdate::error(
                  IndexerError::from_error(ErrorKind::Manifest, &e)
                     .with_branch(new_branch.clone())
                     .with_operation("branch-changed"),
               ),
            };
            store.update_folder(generation, &path, update);
         }
         .boxed(),
      )
   }
}

struct FileChange {
   file_path:      String,
   file_hash:      String,
   branch:         String,
   is_base_branch: bool,
}
