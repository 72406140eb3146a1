use std::{
   fmt,
   path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// One indexed file as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
   pub file_path: String,
   pub file_hash: String,
}

/// Files already indexed for a `(project, branch)` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
   #[serde(default)]
   pub files: Vec<ManifestFile>,
}

impl Manifest {
   pub fn new(files: impl IntoIterator<Item = (String, String)>) -> Self {
      Self {
         files: files
            .into_iter()
            .map(|(file_path, file_hash)| ManifestFile { file_path, file_hash })
            .collect(),
      }
   }

   /// True iff an entry with exactly this path and hash exists.
   pub fn contains(&self, file_path: &str, file_hash: &str) -> bool {
      self
         .files
         .iter()
         .any(|f| f.file_path == file_path && f.file_hash == file_hash)
   }
}

/// A file that must be (re-)uploaded. Produced by the event processor and
/// consumed once by the upload worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpsertTask {
   pub file_path:      String,
   pub file_hash:      String,
   pub branch:         String,
   pub is_base_branch: bool,
   pub project_id:     String,
   pub workspace_path: PathBuf,
}

impl FileUpsertTask {
   /// Absolute location of the file on disk.
   pub fn absolute_path(&self) -> PathBuf {
      let path = Path::new(&self.file_path);
      if path.is_absolute() { path.to_path_buf() } else { self.workspace_path.join(path) }
   }

   /// Workspace-relative path with `/` separators, as the server expects.
   pub fn relative_path(&self) -> String {
      relative_path(&self.workspace_path, &self.file_path)
   }
}

/// Normalizes an event path to the workspace-relative form used in manifests.
pub fn relative_path(workspace: &Path, file_path: &str) -> String {
   let path = Path::new(file_path);
   let rel = path.strip_prefix(workspace).unwrap_or(path);
   let parts: Vec<String> = rel
      .components()
      .filter_map(|c| match c {
         std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
         _ => None,
      })
      .collect();
   parts.join("/")
}

/// Identity of a watcher; events carry it back to their folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(pub u64);

impl fmt::Display for WatcherId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "watcher-{}", self.0)
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
   ScanStart,
   ScanEnd,
   FileChanged { file_path: String, file_hash: String },
   FileDeleted { file_path: String },
   BranchChanged { previous_branch: String, new_branch: String },
}

impl EventKind {
   pub const fn name(&self) -> &'static str {
      match self {
         Self::ScanStart => "scan-start",
         Self::ScanEnd => "scan-end",
         Self::FileChanged { .. } => "file-changed",
         Self::FileDeleted { .. } => "file-deleted",
         Self::BranchChanged { .. } => "branch-changed",
      }
   }
}

/// A repository change notification emitted by a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
   pub watcher:        WatcherId,
   pub branch:         String,
   pub is_base_branch: bool,
   pub kind:           EventKind,
}

/// Server-side organization record used for the entitlement check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
   pub id:               String,
   #[serde(default)]
   pub name:             Option<String>,
   #[serde(default)]
   pub indexing_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryInfo {
   pub repository_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
   pub project: ProjectRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
   pub id: String,
}

/// Read-only view of one workspace folder, safe to log or display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderSnapshot {
   pub folder_path: PathBuf,
   pub folder_name: String,
   pub git_branch:  Option<String>,
   pub project_id:  Option<String>,
   pub is_indexing: bool,
   pub has_watcher: bool,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub error:       Option<IndexerError>,
}
