//! Per-folder state keyed by absolute workspace folder path.

use std::{
   collections::BTreeMap,
   fmt,
   path::{Path, PathBuf},
   sync::Arc,
};

use crate::{
   collab::Watcher,
   error::IndexerError,
   listeners::Subscription,
   types::{FolderSnapshot, WatcherId},
};

/// A live watcher attached to a folder, plus the subscription that routes its
/// events into the engine.
#[derive(Clone)]
pub struct WatcherHandle {
   pub watcher:      Arc<dyn Watcher>,
   pub subscription: Arc<Subscription>,
}

impl WatcherHandle {
   pub fn id(&self) -> WatcherId {
      self.watcher.id()
   }
}

impl fmt::Debug for WatcherHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("WatcherHandle").field("id", &self.id()).finish()
   }
}

#[derive(Debug, Clone)]
pub struct WorkspaceFolderState {
   pub folder:         PathBuf,
   pub git_branch:     Option<String>,
   pub project_id:     Option<String>,
   pub repository_url: Option<String>,
   pub is_indexing:    bool,
   pub watcher:        Option<WatcherHandle>,
   pub last_error:     Option<IndexerError>,
}

impl WorkspaceFolderState {
   pub fn new(folder: PathBuf) -> Self {
      Self {
         folder,
         git_branch: None,
         project_id: None,
         repository_url: None,
         is_indexing: false,
         watcher: None,
         last_error: None,
      }
   }

   pub fn watcher_id(&self) -> Option<WatcherId> {
      self.watcher.as_ref().map(WatcherHandle::id)
   }

   pub fn snapshot(&self) -> FolderSnapshot {
      FolderSnapshot {
         folder_path: self.folder.clone(),
         folder_name: self
            .folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
         git_branch:  self.git_branch.clone(),
         project_id:  self.project_id.clone(),
         is_indexing: self.is_indexing,
         has_watcher: self.watcher.is_some(),
         error:       self.last_error.clone(),
      }
   }
}

/// Shallow update: `None` fields are left as they are. Nested options set the
/// field to the inner value, so `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct FolderUpdate {
   pub git_branch:  Option<Option<String>>,
   pub project_id:  Option<Option<String>>,
   pub is_indexing: Option<bool>,
   pub last_error:  Option<Option<IndexerError>>,
}

impl FolderUpdate {
   pub fn indexing(is_indexing: bool) -> Self {
      Self { is_indexing: Some(is_indexing), ..Self::default() }
   }

   pub fn error(error: IndexerError) -> Self {
      Self { last_error: Some(Some(error)), ..Self::default() }
   }

   pub fn clear_error() -> Self {
      Self { last_error: Some(None), ..Self::default() }
   }

   fn apply(self, state: &mut WorkspaceFolderState) {
      if let Some(v) = self.git_branch {
         state.git_branch = v;
      }
      if let Some(v) = self.project_id {
         state.project_id = v;
      }
      if let Some(v) = self.is_indexing {
         state.is_indexing = v;
      }
      if let Some(v) = self.last_error {
         state.last_error = v;
      }
   }
}

#[derive(Debug, Default, Clone)]
pub struct FolderRegistry {
   folders: BTreeMap<PathBuf, WorkspaceFolderState>,
}

impl FolderRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn insert(&mut self, state: WorkspaceFolderState) {
      self.folders.insert(state.folder.clone(), state);
   }

   pub fn get(&self, folder: &Path) -> Option<&WorkspaceFolderState> {
      self.folders.get(folder)
   }

   /// Merges `update` into an existing folder. Returns false (and does
   /// nothing) when the folder is not registered.
   pub fn update(&mut self, folder: &Path, update: FolderUpdate) -> bool {
      match self.folders.get_mut(folder) {
         Some(state) => {
            update.apply(state);
            true
         },
         None => false,
      }
   }

   /// Linear scan; folder counts stay small.
   pub fn find_by_watcher(&self, id: WatcherId) -> Option<&WorkspaceFolderState> {
      self.folders.values().find(|s| s.watcher_id() == Some(id))
   }

   pub fn len(&self) -> usize {
      self.folders.len()
   }

   pub fn is_empty(&self) -> bool {
      self.folders.is_empty()
   }

   /// Empties the registry, handing back the watchers that were attached.
   pub fn drain_watchers(&mut self) -> Vec<WatcherHandle> {
      std::mem::take(&mut self.folders)
         .into_values()
         .filter_map(|s| s.watcher)
         .collect()
   }

   pub fn snapshot(&self) -> Vec<FolderSnapshot> {
      self.folders.values().map(WorkspaceFolderState::snapshot).collect()
   }
}
