//! Filesystem watcher for one workspace folder.
//!
//! `scan()` walks the working tree honouring gitignore rules and reports every
//! file with its SHA-256. `start()` installs a debounced recursive watch; each
//! batch of changed paths is classified into `file-changed`, `file-deleted`,
//! and, when something under `.git` moved, a `branch-changed` if HEAD now
//! names a different branch. Both paths consult the same [`IgnoreRules`], so a
//! file skipped by the scan is never reported by a live edit either.

use std::{
   collections::{BTreeSet, HashMap},
   fs::File,
   io,
   path::{Path, PathBuf},
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
};

use async_trait::async_trait;
use ignore::{
   WalkBuilder,
   gitignore::{Gitignore, GitignoreBuilder},
};
use notify_debouncer_mini::{
   DebounceEventResult, Debouncer, new_debouncer,
   notify::{RecommendedWatcher, RecursiveMode},
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::{
   collab::{EventHandler, Watcher, WatcherFactory},
   config::Config,
   error::{Error, Result},
   git,
   listeners::{Listeners, Subscription},
   types::{EventKind, WatcherEvent, WatcherId, relative_path},
};

/// SHA-256 of a file's contents, hex encoded.
pub fn hash_file(path: &Path) -> io::Result<String> {
   let mut file = File::open(path)?;
   let mut hasher = Sha256::new();
   io::copy(&mut file, &mut hasher)?;
   Ok(hex::encode(hasher.finalize()))
}

const IGNORE_FILES: [&str; 2] = [".gitignore", ".ignore"];

/// Ignore rules for one working tree: `.gitignore` and `.ignore` in every
/// directory, `.git/info/exclude`, and the user's global excludes. The
/// deepest directory with a matching rule decides, so `!pattern` in a nested
/// file can re-include what a parent excluded.
struct IgnoreRules {
   root:   PathBuf,
   global: Gitignore,
   dirs:   Mutex<HashMap<PathBuf, Arc<Gitignore>>>,
}

impl IgnoreRules {
   fn new(root: PathBuf) -> Self {
      let (global, err) = Gitignore::global();
      if let Some(e) = err {
         tracing::debug!("global excludes unavailable: {e}");
      }
      Self { root, global, dirs: Mutex::new(HashMap::new()) }
   }

   fn dir_rules(&self, dir: &Path) -> Arc<Gitignore> {
      if let Some(rules) = self.dirs.lock().get(dir) {
         return Arc::clone(rules);
      }
      let mut builder = GitignoreBuilder::new(dir);
      let mut files: Vec<PathBuf> = IGNORE_FILES.iter().map(|name| dir.join(name)).collect();
      if dir == self.root {
         files.push(dir.join(".git/info/exclude"));
      }
      for file in files.into_iter().filter(|f| f.is_file()) {
         if let Some(e) = builder.add(&file) {
            tracing::debug!("skipping unreadable {}: {e}", file.display());
         }
      }
      let rules = Arc::new(builder.build().unwrap_or_else(|e| {
         tracing::warn!("invalid ignore rules in {}: {e}", dir.display());
         Gitignore::empty()
      }));
      self.dirs.lock().insert(dir.to_path_buf(), Arc::clone(&rules));
      rules
   }

   fn matches(&self, path: &Path, is_dir: bool) -> bool {
      let mut dir = path.parent();
      while let Some(current) = dir {
         let rules = self.dir_rules(current);
         let matched = rules.matched(path, is_dir);
         if !matched.is_none() {
            return matched.is_ignore();
         }
         if current == self.root {
            break;
         }
         dir = current.parent();
      }
      self.global.matched(path, is_dir).is_ignore()
   }

   /// True when `path` or any directory between it and the root is ignored.
   fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
      let Ok(rel) = path.strip_prefix(&self.root) else {
         return false;
      };
      let components: Vec<_> = rel.components().collect();
      let mut current = self.root.clone();
      for (i, component) in components.iter().enumerate() {
         current.push(component);
         let last = i + 1 == components.len();
         if self.matches(&current, !last || is_dir) {
            return true;
         }
      }
      false
   }

   /// Forgets cached rules for `dir` after one of its ignore files changed.
   fn invalidate(&self, dir: &Path) {
      self.dirs.lock().remove(dir);
   }
}

struct Shared {
   id:        WatcherId,
   root:      PathBuf,
   settings:  Arc<Config>,
   branch:    Mutex<String>,
   ignore:    IgnoreRules,
   listeners: Listeners<WatcherEvent>,
   disposed:  AtomicBool,
}

impl Shared {
   fn emit(&self, kind: EventKind) {
      if self.disposed.load(Ordering::SeqCst) {
         return;
      }
      let branch = self.branch.lock().clone();
      let event = WatcherEvent {
         watcher: self.id,
         is_base_branch: self.settings.is_base_branch(&branch),
         branch,
         kind,
      };
      self.listeners.emit(&event);
   }

   fn is_git_path(&self, path: &Path) -> bool {
      path
         .strip_prefix(&self.root)
         .is_ok_and(|rel| rel.components().next().is_some_and(|c| c.as_os_str() == ".git"))
   }

   fn emit_file(&self, path: &Path) {
      let rel = relative_path(&self.root, &path.to_string_lossy());
      match hash_file(path) {
         Ok(file_hash) => self.emit(EventKind::FileChanged { file_path: rel, file_hash }),
         Err(e) => tracing::debug!("cannot hash {}: {e}", path.display()),
      }
   }

   fn scan(self: &Arc<Self>) {
      self.emit(EventKind::ScanStart);
      let shared = Arc::clone(self);
      let walker = WalkBuilder::new(&self.root)
         .standard_filters(false)
         .filter_entry(move |entry| {
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            entry.file_name() != ".git" && !shared.ignore.is_ignored(entry.path(), is_dir)
         })
         .build();
      let mut files = 0usize;
      for entry in walker {
         if self.disposed.load(Ordering::SeqCst) {
            break;
         }
         let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
               tracing::debug!("walk error in {}: {e}", self.root.display());
               continue;
            },
         };
         if entry.file_type().is_some_and(|t| t.is_file()) {
            self.emit_file(entry.path());
            files += 1;
         }
      }
      tracing::debug!("scanned {files} files in {}", self.root.display());
      self.emit(EventKind::ScanEnd);
   }

   fn check_branch(&self) {
      let new_branch = match git::current_branch(&self.root) {
         Ok(branch) => branch,
         Err(e) => {
            tracing::debug!("cannot read HEAD in {}: {e}", self.root.display());
            return;
         },
      };
      let previous_branch = {
         let mut branch = self.branch.lock();
         if *branch == new_branch {
            return;
         }
         std::mem::replace(&mut *branch, new_branch.clone())
      };
      self.emit(EventKind::BranchChanged { previous_branch, new_branch });
   }

   /// Classifies one debounced batch of changed paths.
   fn handle_batch(&self, paths: impl IntoIterator<Item = PathBuf>) {
      if self.disposed.load(Ordering::SeqCst) {
         return;
      }
      let mut git_touched = false;
      let mut changed = BTreeSet::new();
      for path in paths {
         if self.is_git_path(&path) {
            git_touched = true;
         } else {
            changed.insert(path);
         }
      }
      if git_touched {
         self.ignore.invalidate(&self.root);
         self.check_branch();
      }
      for path in &changed {
         let is_ignore_file =
            path.file_name().is_some_and(|name| IGNORE_FILES.iter().any(|f| name == *f));
         if is_ignore_file && let Some(dir) = path.parent() {
            self.ignore.invalidate(dir);
         }
      }

      for path in changed {
         let is_dir = path.is_dir();
         if self.ignore.is_ignored(&path, is_dir) {
            continue;
         }
         if path.is_file() {
            self.emit_file(&path);
         } else if !path.exists() {
            let file_path = relative_path(&self.root, &path.to_string_lossy());
            self.emit(EventKind::FileDeleted { file_path });
         }
      }
   }
}

pub struct FsWatcher {
   shared:    Arc<Shared>,
   debouncer: Mutex<Option<Debouncer<RecommendedWatcher>>>,
}

impl FsWatcher {
   pub fn new(id: WatcherId, root: PathBuf, branch: String, settings: Arc<Config>) -> Self {
      Self {
         shared:    Arc::new(Shared {
            id,
            ignore: IgnoreRules::new(root.clone()),
            root,
            settings,
            branch: Mutex::new(branch),
            listeners: Listeners::new(),
            disposed: AtomicBool::new(false),
         }),
         debouncer: Mutex::new(None),
      }
   }

   pub fn branch(&self) -> String {
      self.shared.branch.lock().clone()
   }

   fn is_disposed(&self) -> bool {
      self.shared.disposed.load(Ordering::SeqCst)
   }
}

#[async_trait]
impl Watcher for FsWatcher {
   fn id(&self) -> WatcherId {
      self.shared.id
   }

   async fn scan(&self) -> Result<()> {
      if self.is_disposed() {
         return Ok(());
      }
      let shared = Arc::clone(&self.shared);
      tokio::task::spawn_blocking(move || shared.scan())
         .await
         .map_err(|e| Error::Io(io::Error::other(e)))
   }

   async fn start(&self) -> Result<()> {
      if self.is_disposed() || self.debouncer.lock().is_some() {
         return Ok(());
      }
      let shared = Arc::clone(&self.shared);
      let mut debouncer = new_debouncer(
         shared.settings.watch_debounce(),
         move |result: DebounceEventResult| match result {
            Ok(events) => shared.handle_batch(events.into_iter().map(|e| e.path)),
            Err(e) => tracing::warn!("watch error in {}: {e}", shared.root.display()),
         },
      )?;
      debouncer
         .watcher()
         .watch(&self.shared.root, RecursiveMode::Recursive)?;
      tracing::debug!("{} watching {}", self.shared.id, self.shared.root.display());

      let mut slot = self.debouncer.lock();
      if self.is_disposed() {
         return Ok(());
      }
      *slot = Some(debouncer);
      Ok(())
   }

   fn dispose(&self) {
      self.shared.disposed.store(true, Ordering::SeqCst);
      self.debouncer.lock().take();
      self.shared.listeners.clear();
   }

   fn on_event(&self, handler: EventHandler) -> Subscription {
      self.shared.listeners.subscribe(move |event| handler(event))
   }
}

/// Creates an [`FsWatcher`] per folder.
pub struct FsWatcherFactory {
   settings: Arc<Config>,
}

impl FsWatcherFactory {
   pub fn new(settings: Arc<Config>) -> Self {
      Self { settings }
   }
}

impl WatcherFactory for FsWatcherFactory {
   fn create(&self, id: WatcherId, folder: &Path, branch: &str) -> Result<Arc<dyn Watcher>> {
      if !folder.is_dir() {
         return Err(Error::NoWorkingDirectory(folder.to_path_buf()));
      }
      Ok(Arc::new(FsWatcher::new(
         id,
         folder.to_path_buf(),
         branch.to_string(),
         Arc::clone(&self.settings),
      )))
   }
}
