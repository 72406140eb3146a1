#![allow(dead_code)]

use std::{
   collections::{HashMap, HashSet},
   path::{Path, PathBuf},
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicUsize, Ordering},
   },
   time::Duration,
};

use indexsync::{
   Error, Result,
   collab::{
      Collaborators, Entitlements, EventHandler, FileUploader, ManifestFetcher, RepositoryInspector,
      UploadRequest, Watcher, WatcherFactory,
   },
   config::{Config, ConfigSource, ConfigState, SECRET_TOKEN, VALUE_ORGANIZATION_ID},
   engine::EventProcessor,
   error::HttpError,
   indexer::ManagedIndexer,
   listeners::{Listeners, Subscription},
   manifest::ManifestCache,
   registry::{WatcherHandle, WorkspaceFolderState},
   store::Store,
   types::{
      EventKind, Manifest, Organization, ProjectConfig, ProjectRef, RepositoryInfo, WatcherEvent,
      WatcherId,
   },
};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// Manifest server double. Unknown keys return an empty manifest.
#[derive(Default)]
pub struct FakeFetcher {
   manifests: Mutex<HashMap<String, Manifest>>,
   failing:   Mutex<HashSet<String>>,
   gate:      Mutex<Option<Arc<Semaphore>>>,
   calls:     AtomicUsize,
}

impl FakeFetcher {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn set_manifest(&self, project: &str, branch: &str, files: &[(&str, &str)]) {
      let manifest =
         Manifest::new(files.iter().map(|(p, h)| ((*p).to_string(), (*h).to_string())));
      self.manifests.lock().insert(format!("{project}:{branch}"), manifest);
   }

   pub fn fail_branch(&self, branch: &str) {
      self.failing.lock().insert(branch.to_string());
   }

   pub fn heal_branch(&self, branch: &str) {
      self.failing.lock().remove(branch);
   }

   /// Makes every fetch wait until the returned semaphore receives permits.
   pub fn hold(&self) -> Arc<Semaphore> {
      let gate = Arc::new(Semaphore::new(0));
      *self.gate.lock() = Some(Arc::clone(&gate));
      gate
   }

   pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
   }
}

#[async_trait::async_trait]
impl ManifestFetcher for FakeFetcher {
   async fn fetch(&self, _org: &str, project: &str, branch: &str, _token: &str) -> Result<Manifest> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let gate = self.gate.lock().clone();
      if let Some(gate) = gate {
         let _permit = gate.acquire().await;
      }
      if self.failing.lock().contains(branch) {
         return Err(HttpError::StatusCode(503).into());
      }
      Ok(self
         .manifests
         .lock()
         .get(&format!("{project}:{branch}"))
         .cloned()
         .unwrap_or_default())
   }
}

/// Records uploads and tracks peak concurrency.
#[derive(Default)]
pub struct RecordingUploader {
   pub uploads:   Mutex<Vec<UploadRequest>>,
   attempts:      AtomicUsize,
   in_flight:     AtomicUsize,
   max_in_flight: AtomicUsize,
   fail:          AtomicBool,
   delay:         Mutex<Duration>,
}

impl RecordingUploader {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn with_delay(delay: Duration) -> Arc<Self> {
      let this = Self::default();
      *this.delay.lock() = delay;
      Arc::new(this)
   }

   pub fn fail_all(&self) {
      self.fail.store(true, Ordering::SeqCst);
   }

   pub fn attempts(&self) -> usize {
      self.attempts.load(Ordering::SeqCst)
   }

   pub fn max_in_flight(&self) -> usize {
      self.max_in_flight.load(Ordering::SeqCst)
   }

   pub fn uploaded_paths(&self) -> Vec<String> {
      let mut paths: Vec<String> = self.uploads.lock().iter().map(|u| u.file_path.clone()).collect();
      paths.sort();
      paths
   }
}

#[async_trait::async_trait]
impl FileUploader for RecordingUploader {
   async fn upload(&self, request: UploadRequest) -> Result<()> {
      self.attempts.fetch_add(1, Ordering::SeqCst);
      let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      self.max_in_flight.fetch_max(now, Ordering::SeqCst);

      let delay = *self.delay.lock();
      if !delay.is_zero() {
         tokio::time::sleep(delay).await;
      }
      self.in_flight.fetch_sub(1, Ordering::SeqCst);

      if self.fail.load(Ordering::SeqCst) {
         return Err(HttpError::StatusCode(500).into());
      }
      self.uploads.lock().push(request);
      Ok(())
   }
}

pub struct FakeEntitlements {
   pub found:   bool,
   pub enabled: bool,
   calls:       AtomicUsize,
}

impl FakeEntitlements {
   pub fn new(found: bool, enabled: bool) -> Arc<Self> {
      Arc::new(Self { found, enabled, calls: AtomicUsize::new(0) })
   }

   pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
   }
}

#[async_trait::async_trait]
impl Entitlements for FakeEntitlements {
   async fn fetch_organization(
      &self,
      _token: &str,
      organization_id: &str,
      _until: Option<i64>,
   ) -> Result<Option<Organization>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(self.found.then(|| Organization {
         id:               organization_id.to_string(),
         name:             None,
         indexing_enabled: self.enabled,
      }))
   }
}

#[derive(Debug, Clone)]
pub struct FakeRepo {
   pub branch:        String,
   pub project_id:    Option<String>,
   pub branch_error:  bool,
   pub project_error: bool,
}

impl FakeRepo {
   pub fn new(branch: &str, project_id: &str) -> Self {
      Self {
         branch:        branch.to_string(),
         project_id:    Some(project_id.to_string()),
         branch_error:  false,
         project_error: false,
      }
   }
}

/// Repository inspection over a fixed table; unknown paths are not repos.
#[derive(Default)]
pub struct FakeInspector {
   repos: Mutex<HashMap<PathBuf, FakeRepo>>,
}

impl FakeInspector {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn add(&self, path: impl Into<PathBuf>, repo: FakeRepo) {
      self.repos.lock().insert(path.into(), repo);
   }

   pub fn set_project(&self, path: &Path, project_id: Option<&str>) {
      if let Some(repo) = self.repos.lock().get_mut(path) {
         repo.project_id = project_id.map(str::to_string);
      }
   }

   pub fn fail_project(&self, path: &Path) {
      if let Some(repo) = self.repos.lock().get_mut(path) {
         repo.project_error = true;
      }
   }

   fn repo(&self, path: &Path) -> Option<FakeRepo> {
      self.repos.lock().get(path).cloned()
   }
}

#[async_trait::async_trait]
impl RepositoryInspector for FakeInspector {
   async fn is_git_repository(&self, path: &Path) -> bool {
      self.repo(path).is_some()
   }

   async fn current_branch(&self, path: &Path) -> Result<String> {
      match self.repo(path) {
         Some(repo) if !repo.branch_error => Ok(repo.branch),
         _ => Err(Error::NotAGitRepository(path.to_path_buf())),
      }
   }

   async fn repository_info(&self, _path: &Path) -> Result<RepositoryInfo> {
      Ok(RepositoryInfo { repository_url: Some("https://example.com/acme/repo.git".to_string()) })
   }

   async fn project_config(&self, path: &Path, _url: Option<&str>) -> Result<Option<ProjectConfig>> {
      let Some(repo) = self.repo(path) else {
         return Ok(None);
      };
      if repo.project_error {
         return Err(Error::Server { op: "project-config", reason: "unreadable".to_string() });
      }
      Ok(repo.project_id.map(|id| ProjectConfig { project: ProjectRef { id } }))
   }
}

/// Watcher double: `scan` replays a fixed list of files, `push` injects live
/// events.
pub struct ScriptedWatcher {
   id:           WatcherId,
   pub folder:   PathBuf,
   pub branch:   String,
   files:        Vec<(String, String)>,
   listeners:    Listeners<WatcherEvent>,
   pub disposed: AtomicBool,
   pub started:  AtomicBool,
}

impl ScriptedWatcher {
   pub fn new(id: WatcherId, folder: PathBuf, branch: &str, files: Vec<(String, String)>) -> Arc<Self> {
      Arc::new(Self {
         id,
         folder,
         branch: branch.to_string(),
         files,
         listeners: Listeners::new(),
         disposed: AtomicBool::new(false),
         started: AtomicBool::new(false),
      })
   }

   pub fn push(&self, kind: EventKind) {
      if self.disposed.load(Ordering::SeqCst) {
         return;
      }
      self.listeners.emit(&event(self.id, &self.branch, kind));
   }

   pub fn is_disposed(&self) -> bool {
      self.disposed.load(Ordering::SeqCst)
   }
}

#[async_trait::async_trait]
impl Watcher for ScriptedWatcher {
   fn id(&self) -> WatcherId {
      self.id
   }

   async fn scan(&self) -> Result<()> {
      self.push(EventKind::ScanStart);
      for (file_path, file_hash) in &self.files {
         self.push(EventKind::FileChanged {
            file_path: file_path.clone(),
            file_hash: file_hash.clone(),
         });
      }
      self.push(EventKind::ScanEnd);
      Ok(())
   }

   async fn start(&self) -> Result<()> {
      self.started.store(true, Ordering::SeqCst);
      Ok(())
   }

   fn dispose(&self) {
      self.disposed.store(true, Ordering::SeqCst);
      self.listeners.clear();
   }

   fn on_event(&self, handler: EventHandler) -> Subscription {
      self.listeners.subscribe(move |e| handler(e))
   }
}

/// Creates [`ScriptedWatcher`]s and keeps them for inspection.
#[derive(Default)]
pub struct ScriptedFactory {
   files:       Mutex<HashMap<PathBuf, Vec<(String, String)>>>,
   pub created: Mutex<Vec<Arc<ScriptedWatcher>>>,
}

impl ScriptedFactory {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn script(&self, folder: &Path, files: &[(&str, &str)]) {
      self.files.lock().insert(
         folder.to_path_buf(),
         files.iter().map(|(p, h)| ((*p).to_string(), (*h).to_string())).collect(),
      );
   }

   pub fn created(&self) -> Vec<Arc<ScriptedWatcher>> {
      self.created.lock().clone()
   }

   pub fn for_folder(&self, folder: &Path) -> Option<Arc<ScriptedWatcher>> {
      self.created.lock().iter().rev().find(|w| w.folder == folder).cloned()
   }
}

impl WatcherFactory for ScriptedFactory {
   fn create(&self, id: WatcherId, folder: &Path, branch: &str) -> Result<Arc<dyn Watcher>> {
      let files = self.files.lock().get(folder).cloned().unwrap_or_default();
      let watcher = ScriptedWatcher::new(id, folder.to_path_buf(), branch, files);
      self.created.lock().push(Arc::clone(&watcher));
      Ok(watcher)
   }
}

/// In-memory [`ConfigSource`].
#[derive(Default)]
pub struct MemoryConfig {
   secrets:   Mutex<HashMap<String, String>>,
   values:    Mutex<HashMap<String, serde_json::Value>>,
   listeners: Listeners<()>,
}

impl MemoryConfig {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn with_credentials(token: &str, organization_id: &str) -> Arc<Self> {
      let this = Self::new();
      this.set_secret(SECRET_TOKEN, token);
      this.set_value(VALUE_ORGANIZATION_ID, serde_json::json!(organization_id));
      this
   }

   pub fn set_secret(&self, name: &str, value: &str) {
      self.secrets.lock().insert(name.to_string(), value.to_string());
   }

   pub fn set_value(&self, name: &str, value: serde_json::Value) {
      self.values.lock().insert(name.to_string(), value);
   }

   pub fn changed(&self) {
      self.listeners.emit(&());
   }

   pub fn subscribers(&self) -> usize {
      self.listeners.len()
   }
}

impl ConfigSource for MemoryConfig {
   fn get_secret(&self, name: &str) -> Option<String> {
      self.secrets.lock().get(name).cloned()
   }

   fn get_value(&self, name: &str) -> Option<serde_json::Value> {
      self.values.lock().get(name).cloned()
   }

   fn on_config_change(&self, handler: Box<dyn Fn() + Send + Sync>) -> Subscription {
      self.listeners.subscribe(move |()| handler())
   }
}

pub fn event(watcher: WatcherId, branch: &str, kind: EventKind) -> WatcherEvent {
   WatcherEvent {
      watcher,
      branch: branch.to_string(),
      is_base_branch: branch == "main" || branch == "master",
      kind,
   }
}

pub fn file_changed(path: &str, hash: &str) -> EventKind {
   EventKind::FileChanged { file_path: path.to_string(), file_hash: hash.to_string() }
}

/// Settings with a fast worker tick for tests.
pub fn test_settings() -> Config {
   Config { queue_tick_ms: 5, upload_concurrency: 2, ..Config::default() }
}

/// Polls `cond` until it holds or a generous deadline passes.
pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
   for _ in 0..500 {
      if cond() {
         return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
   }
   cond()
}

/// Store and event processor without an orchestrator around them.
pub struct EngineFixture {
   pub store:      Arc<Store>,
   pub processor:  EventProcessor,
   pub fetcher:    Arc<FakeFetcher>,
   pub inspector:  Arc<FakeInspector>,
   pub generation: u64,
}

impl EngineFixture {
   pub fn new() -> Self {
      let fetcher = FakeFetcher::new();
      let inspector = FakeInspector::new();
      let cache = ManifestCache::new(fetcher.clone(), Duration::from_secs(300));
      let store = Arc::new(Store::new(cache, 100));
      store.set_config(ConfigState {
         token: Some("t".to_string()),
         organization_id: Some("org".to_string()),
         tester_warnings_disabled_until: None,
      });
      let generation = store.activate();
      let processor =
         EventProcessor::new(Arc::clone(&store), inspector.clone(), Arc::new(Config::default()));
      Self { store, processor, fetcher, inspector, generation }
   }

   /// Registers a folder with an attached watcher.
   pub fn add_folder(&self, path: &str, watcher: u64, branch: &str, project_id: &str) -> PathBuf {
      let folder = PathBuf::from(path);
      self.inspector.add(folder.clone(), FakeRepo::new(branch, project_id));
      let mut state = WorkspaceFolderState::new(folder.clone());
      state.git_branch = Some(branch.to_string());
      state.project_id = Some(project_id.to_string());
      state.watcher = Some(WatcherHandle {
         watcher:      ScriptedWatcher::new(WatcherId(watcher), folder.clone(), branch, Vec::new()),
         subscription: Arc::new(Subscription::empty()),
      });
      self.store.insert_folders([state]);
      folder
   }

   pub fn folder(&self, path: &Path) -> WorkspaceFolderState {
      self.store.folder(path).expect("folder registered")
   }

   pub async fn process(&self, watcher: u64, branch: &str, kind: EventKind) {
      self
         .processor
         .process_event(event(WatcherId(watcher), branch, kind))
         .await;
   }
}

/// A fully wired [`ManagedIndexer`] over fakes.
pub struct Harness {
   pub config:       Arc<MemoryConfig>,
   pub fetcher:      Arc<FakeFetcher>,
   pub uploader:     Arc<RecordingUploader>,
   pub entitlements: Arc<FakeEntitlements>,
   pub inspector:    Arc<FakeInspector>,
   pub watchers:     Arc<ScriptedFactory>,
   pub indexer:      Arc<ManagedIndexer>,
}

impl Harness {
   pub fn new(folders: Vec<PathBuf>) -> Self {
      Self::build(MemoryConfig::with_credentials("t", "org"), FakeEntitlements::new(true, true), folders)
   }

   pub fn build(
      config: Arc<MemoryConfig>,
      entitlements: Arc<FakeEntitlements>,
      folders: Vec<PathBuf>,
   ) -> Self {
      let fetcher = FakeFetcher::new();
      let uploader = RecordingUploader::new();
      let inspector = FakeInspector::new();
      let watchers = ScriptedFactory::new();
      let collab = Collaborators {
         fetcher:      fetcher.clone(),
         uploader:     uploader.clone(),
         entitlements: entitlements.clone(),
         inspector:    inspector.clone(),
         watchers:     watchers.clone(),
      };
      let indexer =
         ManagedIndexer::new(config.clone(), Arc::new(test_settings()), collab, folders);
      Self { config, fetcher, uploader, entitlements, inspector, watchers, indexer }
   }
}
