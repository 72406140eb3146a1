//! Seams to the systems the engine drives but does not implement.
//!
//! The binary wires these to git2, reqwest, and notify; tests wire in-memory
//! fakes.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;

use crate::{
   Result,
   listeners::Subscription,
   types::{Manifest, Organization, ProjectConfig, RepositoryInfo, WatcherEvent, WatcherId},
};

/// Retrieves the server-held manifest for a project branch.
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
   async fn fetch(
      &self,
      organization_id: &str,
      project_id: &str,
      branch: &str,
      token: &str,
   ) -> Result<Manifest>;
}

/// Everything the server needs to index one file.
#[derive(Debug, Clone)]
pub struct UploadRequest {
   pub file_bytes:      Vec<u8>,
   pub file_hash:       String,
   pub file_path:       String,
   pub git_branch:      String,
   pub is_base_branch:  bool,
   pub organization_id: String,
   pub project_id:      String,
   pub token:           String,
}

#[async_trait]
pub trait FileUploader: Send + Sync {
   async fn upload(&self, request: UploadRequest) -> Result<()>;
}

#[async_trait]
pub trait Entitlements: Send + Sync {
   async fn fetch_organization(
      &self,
      token: &str,
      organization_id: &str,
      tester_warnings_disabled_until: Option<i64>,
   ) -> Result<Option<Organization>>;

   fn is_indexing_enabled(&self, organization: &Organization) -> bool {
      organization.indexing_enabled
   }
}

#[async_trait]
pub trait RepositoryInspector: Send + Sync {
   async fn is_git_repository(&self, path: &Path) -> bool;

   async fn current_branch(&self, path: &Path) -> Result<String>;

   async fn repository_info(&self, path: &Path) -> Result<RepositoryInfo>;

   /// `Ok(None)` when the folder has no project configured.
   async fn project_config(
      &self,
      path: &Path,
      repository_url: Option<&str>,
   ) -> Result<Option<ProjectConfig>>;
}

/// Callback receiving a watcher's events.
pub type EventHandler = Box<dyn Fn(&WatcherEvent) + Send + Sync>;

/// Change notifier for one workspace folder.
///
/// Implementations deliver events for a folder in order and stamp each with
/// [`Watcher::id`].
#[async_trait]
pub trait Watcher: Send + Sync {
   fn id(&self) -> WatcherId;

   /// Emits `scan-start`, a `file-changed` per tracked file, then `scan-end`.
   async fn scan(&self) -> Result<()>;

   /// Begins streaming live changes.
   async fn start(&self) -> Result<()>;

   fn dispose(&self);

   fn on_event(&self, handler: EventHandler) -> Subscription;
}

pub trait WatcherFactory: Send + Sync {
   fn create(&self, id: WatcherId, folder: &Path, branch: &str) -> Result<Arc<dyn Watcher>>;
}

/// The full set of collaborators an indexer is constructed with.
#[derive(Clone)]
pub struct Collaborators {
   pub fetcher:      Arc<dyn ManifestFetcher>,
   pub uploader:     Arc<dyn FileUploader>,
   pub entitlements: Arc<dyn Entitlements>,
   pub inspector:    Arc<dyn RepositoryInspector>,
   pub watchers:     Arc<dyn WatcherFactory>,
}
