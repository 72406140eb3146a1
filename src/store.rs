//! The engine's single shared store.
//!
//! Every slice (config snapshot, folder registry, manifest cache, upload
//! queue, error log) is mutated through short synchronous critical sections;
//! no lock is held across an await. A generation counter, bumped on each
//! dispose, lets work started in an earlier session detect that its results
//! must be dropped.

use std::{
   collections::VecDeque,
   path::Path,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
};

use parking_lot::{Mutex, RwLock};

use crate::{
   config::ConfigState,
   error::IndexerError,
   manifest::ManifestCache,
   queue::UploadQueue,
   registry::{FolderRegistry, FolderUpdate, WatcherHandle, WorkspaceFolderState},
   types::{FolderSnapshot, WatcherId},
};

pub struct Store {
   active:     AtomicBool,
   generation: AtomicU64,
   config:     RwLock<Arc<ConfigState>>,
   registry:   Mutex<FolderRegistry>,
   errors:     Mutex<VecDeque<IndexerError>>,
   max_errors: usize,
   cache:      ManifestCache,
   queue:      UploadQueue,
}

impl Store {
   pub fn new(cache: ManifestCache, max_errors: usize) -> Self {
      Self {
         active: AtomicBool::new(false),
         generation: AtomicU64::new(0),
         config: RwLock::new(Arc::new(ConfigState::default())),
         registry: Mutex::new(FolderRegistry::new()),
         errors: Mutex::new(VecDeque::new()),
         max_errors: max_errors.max(1),
         cache,
         queue: UploadQueue::new(),
      }
   }

   pub fn is_active(&self) -> bool {
      self.active.load(Ordering::SeqCst)
   }

   pub fn generation(&self) -> u64 {
      self.generation.load(Ordering::SeqCst)
   }

   /// True while the session that observed `generation` is still running.
   pub fn is_current(&self, generation: u64) -> bool {
      self.is_active() && self.generation() == generation
   }

   /// Marks the store active and returns the session's generation.
   pub fn activate(&self) -> u64 {
      self.active.store(true, Ordering::SeqCst);
      self.generation()
   }

   /// Activates only if no `deactivate` happened since `generation` was
   /// observed. Returns false, leaving the store inactive, otherwise.
   pub fn activate_from(&self, generation: u64) -> bool {
      self.active.store(true, Ordering::SeqCst);
      if self.generation() == generation {
         return true;
      }
      self.active.store(false, Ordering::SeqCst);
      false
   }

   /// Ends the current session. Anything still holding its generation
   /// becomes stale.
   pub fn deactivate(&self) {
      // Bump first so a concurrent `activate_from` sees the new generation.
      self.generation.fetch_add(1, Ordering::SeqCst);
      self.active.store(false, Ordering::SeqCst);
   }

   pub fn config(&self) -> Arc<ConfigState> {
      Arc::clone(&self.config.read())
   }

   pub fn set_config(&self, config: ConfigState) {
      *self.config.write() = Arc::new(config);
   }

   pub fn cache(&self) -> &ManifestCache {
      &self.cache
   }

   pub fn queue(&self) -> &UploadQueue {
      &self.queue
   }

   pub fn insert_folders(&self, folders: impl IntoIterator<Item = WorkspaceFolderState>) {
      let mut registry = self.registry.lock();
      for folder in folders {
         registry.insert(folder);
      }
   }

   pub fn folder(&self, path: &Path) -> Option<WorkspaceFolderState> {
      self.registry.lock().get(path).cloned()
   }

   pub fn find_by_watcher(&self, id: WatcherId) -> Option<WorkspaceFolderState> {
      self.registry.lock().find_by_watcher(id).cloned()
   }

   /// Applies `update` if the folder is registered and `generation` is still
   /// current.
   pub fn update_folder(&self, generation: u64, path: &Path, update: FolderUpdate) -> bool {
      if !self.is_current(generation) {
         return false;
      }
      self.registry.lock().update(path, update)
   }

   pub fn folder_count(&self) -> usize {
      self.registry.lock().len()
   }

   pub fn snapshot(&self) -> Vec<FolderSnapshot> {
      self.registry.lock().snapshot()
   }

   /// Appends to the global error log, evicting the oldest entry at capacity.
   pub fn record_error(&self, generation: u64, error: IndexerError) -> bool {
      if self.generation() != generation {
         return false;
      }
      tracing::warn!("{} error: {}", error.kind.as_str(), error.message);
      let mut errors = self.errors.lock();
      while errors.len() >= self.max_errors {
         errors.pop_front();
      }
      errors.push_back(error);
      true
   }

   pub fn errors(&self) -> Vec<IndexerError> {
      self.errors.lock().iter().cloned().collect()
   }

   /// Clears every slice and returns the watchers that were attached so the
   /// caller can dispose them.
   pub fn reset(&self) -> Vec<WatcherHandle> {
      let watchers = self.registry.lock().drain_watchers();
      self.queue.clear();
      self.errors.lock().clear();
      self.cache.clear();
      watchers
   }
}
