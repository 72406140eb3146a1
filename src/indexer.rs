//! Lifecycle orchestration: `start`, `dispose`, `restart`.
//!
//! [`ManagedIndexer`] owns the [`Store`] and everything that feeds it: the
//! watchers attached to each folder, the dispatcher task forwarding their
//! events to the [`EventProcessor`], the upload worker, and the config-change
//! subscription. Lifecycle transitions are serialized by an async lock so a
//! restart triggered by a config change cannot interleave with a dispose
//! requested by the host.

use std::{
   path::{Path, PathBuf},
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
};

use futures::{
   FutureExt,
   future::{BoxFuture, join_all},
};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
   Result,
   collab::{Collaborators, Watcher},
   config::{Config, ConfigSource, ConfigState},
   engine::EventProcessor,
   error::{ErrorKind, IndexerError},
   listeners::Subscription,
   manifest::{ManifestCache, ManifestRequest},
   queue::{UploadWorker, WorkerSettings},
   registry::{FolderUpdate, WatcherHandle, WorkspaceFolderState},
   store::Store,
   types::{FolderSnapshot, WatcherEvent, WatcherId},
};

/// Resources owned by one active session.
#[derive(Default)]
struct Session {
   worker:        Option<UploadWorker>,
   dispatcher:    Option<CancellationToken>,
   config_change: Option<Subscription>,
}

pub struct ManagedIndexer {
   source:       Arc<dyn ConfigSource>,
   settings:     Arc<Config>,
   collab:       Collaborators,
   store:        Arc<Store>,
   processor:    EventProcessor,
   folders:      Mutex<Vec<PathBuf>>,
   lifecycle:    AsyncMutex<Session>,
   starting:     Mutex<CancellationToken>,
   next_watcher: AtomicU64,
}

impl ManagedIndexer {
   pub fn new(
      source: Arc<dyn ConfigSource>,
      settings: Arc<Config>,
      collab: Collaborators,
      folders: Vec<PathBuf>,
   ) -> Arc<Self> {
      let cache = ManifestCache::new(Arc::clone(&collab.fetcher), settings.manifest_ttl());
      let store = Arc::new(Store::new(cache, settings.effective_max_errors()));
      let processor =
         EventProcessor::new(Arc::clone(&store), Arc::clone(&collab.inspector), Arc::clone(&settings));
      Arc::new(Self {
         source,
         settings,
         collab,
         store,
         processor,
         folders: Mutex::new(folders),
         lifecycle: AsyncMutex::new(Session::default()),
         starting: Mutex::new(CancellationToken::new()),
         next_watcher: AtomicU64::new(1),
      })
   }

   pub fn is_active(&self) -> bool {
      self.store.is_active()
   }

   pub fn workspace_folder_state_snapshot(&self) -> Vec<FolderSnapshot> {
      self.store.snapshot()
   }

   /// Errors not tied to a single folder, oldest first.
   pub fn errors(&self) -> Vec<IndexerError> {
      self.store.errors()
   }

   pub fn queue_len(&self) -> usize {
      self.store.queue().len()
   }

   pub fn workspace_folders(&self) -> Vec<PathBuf> {
      self.folders.lock().clone()
   }

   /// Replaces the tracked folders and restarts.
   pub async fn set_workspace_folders(self: &Arc<Self>, folders: Vec<PathBuf>) {
      *self.folders.lock() = folders;
      self.restart().await;
   }

   /// Handles one event to completion. A no-op while inactive.
   pub async fn process_event(&self, event: WatcherEvent) {
      self.processor.process_event(event).await;
   }

   /// Forwards an event as if a watcher emitted it. The async part runs on a
   /// spawned task.
   pub fn on_event(&self, event: WatcherEvent) {
      if let Some(work) = self.processor.apply(event) {
         tokio::spawn(work);
      }
   }

   pub async fn start(self: &Arc<Self>) {
      let mut session = self.lifecycle.lock().await;
      self.start_locked(&mut session).await;
   }

   /// Deactivates immediately, even while a `start` is suspended on the
   /// network, then tears the session down once the lifecycle lock is free.
   pub async fn dispose(&self) {
      let was_active = self.interrupt();
      let mut session = self.lifecycle.lock().await;
      self.dispose_locked(&mut session);
      if was_active {
         tracing::info!("indexer disposed");
      }
   }

   pub fn restart(self: &Arc<Self>) -> BoxFuture<'static, ()> {
      let this = Arc::clone(self);
      async move {
         this.interrupt();
         let mut session = this.lifecycle.lock().await;
         tracing::info!("restarting indexer");
         this.dispose_locked(&mut session);
         this.start_locked(&mut session).await;
      }
      .boxed()
   }

   /// Flips the store inactive and aborts a `start` in progress.
   fn interrupt(&self) -> bool {
      let was_active = self.store.is_active();
      self.store.deactivate();
      self.starting.lock().cancel();
      was_active
   }

   async fn start_locked(self: &Arc<Self>, session: &mut Session) {
      if self.store.is_active() {
         tracing::debug!("indexer already active");
         return;
      }
      let generation = self.store.generation();
      let cancel = CancellationToken::new();
      *self.starting.lock() = cancel.clone();

      if session.config_change.is_none() {
         session.config_change = Some(self.subscribe_config_change());
      }

      let config = ConfigState::load(self.source.as_ref());
      self.store.set_config(config.clone());

      let folders = self.workspace_folders();
      if folders.is_empty() {
         tracing::info!("no workspace folders; indexing stays off");
         return;
      }
      let Some((token, organization_id)) = config.credentials() else {
         tracing::info!("token or organization id not configured; indexing stays off");
         return;
      };
      let entitled = tokio::select! {
         biased;
         () = cancel.cancelled() => false,
         entitled = self.is_entitled(&config, token, organization_id) => entitled,
      };
      if !entitled {
         return;
      }
      if !self.store.activate_from(generation) {
         tracing::debug!("start abandoned: disposed during entitlement check");
         return;
      }

      let (tx, rx) = mpsc::unbounded_channel();
      let request = SetupRequest { generation, token, organization_id, events: &tx };
      let init = join_all(folders.iter().map(|folder| self.init_folder(folder, request)));
      let states: Vec<WorkspaceFolderState> = tokio::select! {
         biased;
         () = cancel.cancelled() => {
            tracing::debug!("start abandoned: disposed during folder setup");
            return;
         },
         states = init => states.into_iter().flatten().collect(),
      };
      if !self.store.is_current(generation) {
         for state in states {
            if let Some(handle) = state.watcher {
               handle.watcher.dispose();
            }
         }
         return;
      }
      session.dispatcher = Some(self.spawn_dispatcher(rx));

      tracing::info!("indexing {} of {} workspace folders", states.len(), folders.len());
      let watchers: Vec<(PathBuf, Arc<dyn Watcher>)> = states
         .iter()
         .filter_map(|s| Some((s.folder.clone(), Arc::clone(&s.watcher.as_ref()?.watcher))))
         .collect();
      self.store.insert_folders(states);

      for (folder, watcher) in watchers {
         self.launch_watcher(generation, folder, watcher);
      }

      session.worker = Some(UploadWorker::spawn(
         Arc::clone(&self.store),
         Arc::clone(&self.collab.uploader),
         WorkerSettings::from(self.settings.as_ref()),
      ));
   }

   fn dispose_locked(&self, session: &mut Session) {
      self.store.deactivate();

      if let Some(mut worker) = session.worker.take() {
         worker.stop();
      }
      if let Some(dispatcher) = session.dispatcher.take() {
         dispatcher.cancel();
      }
      for handle in self.store.reset() {
         tracing::debug!("disposing {}", handle.id());
         handle.watcher.dispose();
      }
      session.config_change = None;
   }

   async fn is_entitled(&self, config: &ConfigState, token: &str, organization_id: &str) -> bool {
      let organization = self
         .collab
         .entitlements
         .fetch_organization(token, organization_id, config.tester_warnings_disabled_until)
         .await;
      match organization {
         Ok(Some(org)) if self.collab.entitlements.is_indexing_enabled(&org) => true,
         Ok(Some(_)) => {
            tracing::info!("indexing is not enabled for organization {organization_id}");
            false
         },
         Ok(None) => {
            tracing::warn!("organization {organization_id} not found");
            false
         },
         Err(e) => {
            tracing::warn!("entitlement check failed: {e}");
            false
         },
      }
   }

   /// Resolves one folder. `None` excludes it from the registry: it is not a
   /// git repository, its branch cannot be read, or it has no project. Later
   /// failures keep the folder with `last_error` set.
   async fn init_folder(&self, folder: &Path, request: SetupRequest<'_>) -> Option<WorkspaceFolderState> {
      let inspector = &self.collab.inspector;
      if !inspector.is_git_repository(folder).await {
         tracing::debug!("{} is not a git repository; skipping", folder.display());
         return None;
      }

      let branch = match inspector.current_branch(folder).await {
         Ok(branch) => branch,
         Err(e) => {
            self.store.record_error(
               request.generation,
               IndexerError::from_error(ErrorKind::Git, &e).with_operation("current-branch"),
            );
            return None;
         },
      };

      let repository_url = match inspector.repository_info(folder).await {
         Ok(info) => info.repository_url,
         Err(e) => {
            tracing::debug!("no repository info for {}: {e}", folder.display());
            None
         },
      };

      let project_id = match inspector.project_config(folder, repository_url.as_deref()).await {
         Ok(Some(cfg)) => cfg.project.id,
         Ok(None) => {
            tracing::debug!("{} has no project configured; skipping", folder.display());
            return None;
         },
         Err(e) => {
            self.store.record_error(
               request.generation,
               IndexerError::from_error(ErrorKind::Config, &e)
                  .with_branch(branch)
                  .with_operation("project-config"),
            );
            return None;
         },
      };

      let mut state = WorkspaceFolderState::new(folder.to_path_buf());
      state.git_branch = Some(branch.clone());
      state.project_id = Some(project_id.clone());
      state.repository_url = repository_url;

      let fetched = self
         .store
         .cache()
         .get_or_fetch(ManifestRequest {
            organization_id: request.organization_id,
            project_id: &project_id,
            branch: &branch,
            token: request.token,
         })
         .await;
      if let Err(e) = fetched {
         state.last_error = Some(
            IndexerError::from_error(ErrorKind::Manifest, &e)
               .with_branch(branch)
               .with_operation("initial-manifest"),
         );
         return Some(state);
      }

      let id = WatcherId(self.next_watcher.fetch_add(1, Ordering::Relaxed));
      match self.collab.watchers.create(id, folder, &branch) {
         Ok(watcher) => state.watcher = Some(attach(watcher, request.events.clone())),
         Err(e) => {
            state.last_error = Some(
               IndexerError::from_error(ErrorKind::Setup, &e)
                  .with_branch(branch)
                  .with_operation("create-watcher"),
            );
         },
      }
      Some(state)
   }

   fn launch_watcher(&self, generation: u64, folder: PathBuf, watcher: Arc<dyn Watcher>) {
      let store = Arc::clone(&self.store);
      tokio::spawn(async move {
         let result: Result<()> = async {
            watcher.scan().await?;
            watcher.start().await
         }
         .await;
         if let Err(e) = result {
            let error = IndexerError::from_error(ErrorKind::Setup, &e).with_operation("watch");
            store.update_folder(generation, &folder, FolderUpdate {
               is_indexing: Some(false),
               last_error: Some(Some(error)),
               ..FolderUpdate::default()
            });
         }
      });
   }

   /// Runs the synchronous part of each event in arrival order and spawns
   /// the rest.
   fn spawn_dispatcher(&self, mut rx: mpsc::UnboundedReceiver<WatcherEvent>) -> CancellationToken {
      let token = CancellationToken::new();
      let cancel = token.clone();
      let processor = self.processor.clone();
      tokio::spawn(async move {
         loop {
            tokio::select! {
               biased;
               () = cancel.cancelled() => break,
               event = rx.recv() => {
                  let Some(event) = event else { break };
                  if let Some(work) = processor.apply(event) {
                     tokio::spawn(work);
                  }
               }
            }
         }
      });
      token
   }

   fn subscribe_config_change(self: &Arc<Self>) -> Subscription {
      let this = Arc::downgrade(self);
      let runtime = tokio::runtime::Handle::current();
      self.source.on_config_change(Box::new(move || {
         if let Some(indexer) = this.upgrade() {
            tracing::info!("configuration changed");
            runtime.spawn(indexer.restart());
         }
      }))
   }
}

#[derive(Clone, Copy)]
struct SetupRequest<'a> {
   generation:      u64,
   token:           &'a str,
   organization_id: &'a str,
   events:          &'a mpsc::UnboundedSender<WatcherEvent>,
}

fn attach(watcher: Arc<dyn Watcher>, events: mpsc::UnboundedSender<WatcherEvent>) -> WatcherHandle {
   let subscription = watcher.on_event(Box::new(move |event| {
      let _ = events.send(event.clone());
   }));
   WatcherHandle { watcher, subscription: Arc::new(subscription) }
}
