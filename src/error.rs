use std::{error::Error as StdError, io, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the indexsync engine.
///
/// Collaborator failures (git inspection, HTTP, file reads, config parsing)
/// are funnelled through this enum. Errors that surface to the host are
/// converted into [`IndexerError`] records instead of being returned.
#[derive(Debug, Error)]
pub enum Error {
   /// I/O error occurred during file or network operations.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// Git operation failed.
   #[error("git error: {0}")]
   Git(#[from] git2::Error),

   /// Configuration-related error occurred.
   #[error("config error: {0}")]
   Config(#[from] ConfigError),

   /// HTTP request or response error occurred.
   #[error("http error: {0}")]
   Http(#[from] HttpError),

   /// JSON serialization or deserialization error occurred.
   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),

   /// TOML deserialization error occurred.
   #[error("toml error: {0}")]
   Toml(#[from] toml::de::Error),

   /// Manifest fetch failed. The source is shared by every caller that joined
   /// the same in-flight fetch.
   #[error("manifest fetch failed for {key}: {source}")]
   ManifestFetch {
      key:    String,
      #[source]
      source: Arc<Error>,
   },

   /// The directory is not a git working copy.
   #[error("not a git repository: {path}", path = _0.display())]
   NotAGitRepository(PathBuf),

   /// Failed to get the working directory of a git repository.
   #[error("failed to get working directory: {path}", path = _0.display())]
   NoWorkingDirectory(PathBuf),

   /// Token or organization id is not configured.
   #[error("missing credentials: token and organization id are required")]
   MissingCredentials,

   /// Server error occurred during a specific operation.
   #[error("server error during {op}: {reason}")]
   Server { op: &'static str, reason: String },
}

impl Error {
   /// Whether retrying the same operation later may succeed.
   pub fn is_transient(&self) -> bool {
      match self {
         Self::Io(_) | Self::Http(_) => true,
         Self::ManifestFetch { source, .. } => source.is_transient(),
         _ => false,
      }
   }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
   /// Repo-local project config is malformed.
   #[error("invalid project config {path}: {reason}", path = path.display())]
   InvalidProjectConfig { path: PathBuf, reason: String },
}

/// Errors that can occur during HTTP operations.
#[derive(Debug, Error)]
pub enum HttpError {
   /// HTTP request failed (network error, timeout, etc.).
   #[error("request failed: {0}")]
   Request(#[from] reqwest::Error),

   /// Received an invalid or unexpected HTTP status code.
   #[error("invalid status code: {0}")]
   StatusCode(u16),
}

impl From<notify::Error> for Error {
   fn from(e: notify::Error) -> Self {
      Self::Io(io::Error::other(e))
   }
}

/// Standard result type using [`enum@Error`] as the default error type
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Category of an error surfaced to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
   /// Folder initialization failed.
   Setup,
   /// Reserved for scan failures reported by the watcher.
   Scan,
   /// Upload of a single file failed.
   FileUpsert,
   /// Repository inspection failed.
   Git,
   /// Manifest retrieval failed.
   Manifest,
   /// Branch or project resolution failed.
   Config,
}

impl ErrorKind {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Setup => "setup",
         Self::Scan => "scan",
         Self::FileUpsert => "file-upsert",
         Self::Git => "git",
         Self::Manifest => "manifest",
         Self::Config => "config",
      }
   }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
   #[serde(skip_serializing_if = "Option::is_none")]
   pub file_path: Option<String>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub branch:    Option<String>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub operation: Option<String>,
}

/// Serializable error record attached to a folder or kept in the global log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerError {
   #[serde(rename = "type")]
   pub kind:      ErrorKind,
   pub message:   String,
   pub timestamp: DateTime<Utc>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub context:   Option<ErrorContext>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub details:   Option<String>,
}

impl IndexerError {
   pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
      Self { kind, message: message.into(), timestamp: Utc::now(), context: None, details: None }
   }

   /// Builds a record from an engine error, keeping its cause chain as details.
   pub fn from_error(kind: ErrorKind, err: &Error) -> Self {
      let mut record = Self::new(kind, err.to_string());
      record.details = source_chain(err);
      record
   }

   pub fn with_file(mut self, file_path: impl Into<String>) -> Self {
      self.context_mut().file_path = Some(file_path.into());
      self
   }

   pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
      self.context_mut().branch = Some(branch.into());
      self
   }

   pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
      self.context_mut().operation = Some(operation.into());
      self
   }

   /// Whether the condition is expected to clear on its own (network blips,
   /// files changing underneath an upload) rather than needing user action.
   pub const fn is_recoverable(&self) -> bool {
      matches!(self.kind, ErrorKind::FileUpsert | ErrorKind::Manifest | ErrorKind::Scan)
   }

   fn context_mut(&mut self) -> &mut ErrorContext {
      self.context.get_or_insert_with(ErrorContext::default)
   }
}

fn source_chain(err: &Error) -> Option<String> {
   let mut lines = Vec::new();
   let mut current = err.source();
   while let Some(cause) = current {
      lines.push(format!("caused by: {cause}"));
      current = cause.source();
   }
   if lines.is_empty() { None } else { Some(lines.join("\n")) }
}
