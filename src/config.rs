//! Engine settings, credential snapshot, and the config source seam.

use std::{
   fs,
   path::{Path, PathBuf},
   sync::{Arc, OnceLock},
   time::Duration,
};

use directories::BaseDirs;
use figment::{
   Figment,
   providers::{Env, Format, Serialized, Toml},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::listeners::{Listeners, Subscription};

pub const MAX_UPLOAD_CONCURRENCY: usize = 32;

pub const SECRET_TOKEN: &str = "token";
pub const VALUE_ORGANIZATION_ID: &str = "organization_id";
pub const VALUE_TESTER_WARNINGS_DISABLED_UNTIL: &str = "tester_warnings_disabled_until";

const DEFAULT_EXTENSIONS: &[&str] = &[
   "rs", "ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "go", "java", "kt", "kts", "scala", "rb",
   "php", "c", "h", "cc", "cpp", "hpp", "cs", "swift", "m", "mm", "lua", "sh", "bash", "zsh",
   "sql", "vue", "svelte", "html", "css", "scss", "json", "yaml", "yml", "toml", "md", "proto",
   "graphql", "dart", "ex", "exs", "erl", "hs", "ml", "clj", "zig", "nim", "r",
];

/// Engine settings loaded from the global config file and environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   pub api_url:         String,
   pub http_timeout_ms: u64,

   pub manifest_ttl_ms:            u64,
   pub manifest_stale_ms:          u64,
   pub manifest_prune_interval_ms: u64,

   pub upload_concurrency: usize,
   pub queue_tick_ms:      u64,
   pub max_errors:         usize,

   pub supported_extensions: Vec<String>,
   pub base_branches:        Vec<String>,
   pub watch_debounce_ms:    u64,
   pub project_config_file:  String,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         api_url: "http://127.0.0.1:4455".to_string(),
         http_timeout_ms: 30_000,
         manifest_ttl_ms: 5 * 60 * 1000,
         manifest_stale_ms: 30 * 60 * 1000,
         manifest_prune_interval_ms: 60_000,
         upload_concurrency: 4,
         queue_tick_ms: 100,
         max_errors: 100,
         supported_extensions: DEFAULT_EXTENSIONS.iter().map(|e| (*e).to_string()).collect(),
         base_branches: vec!["main".to_string(), "master".to_string()],
         watch_debounce_ms: 500,
         project_config_file: ".indexsync.toml".to_string(),
      }
   }
}

impl Config {
   pub fn load() -> Self {
      Self::load_from(config_file_path())
   }

   pub fn load_from(path: &Path) -> Self {
      Figment::from(Serialized::defaults(Self::default()))
         .merge(Toml::file(path))
         .merge(Env::prefixed("INDEXSYNC_").ignore(&["token"]).lowercase(true))
         .extract()
         .inspect_err(|e| tracing::warn!("failed to parse config: {e}"))
         .unwrap_or_default()
   }

   pub fn manifest_ttl(&self) -> Duration {
      Duration::from_millis(self.manifest_ttl_ms)
   }

   pub fn manifest_stale(&self) -> Duration {
      Duration::from_millis(self.manifest_stale_ms.max(self.manifest_ttl_ms))
   }

   pub fn manifest_prune_interval(&self) -> Duration {
      Duration::from_millis(self.manifest_prune_interval_ms.max(1))
   }

   pub fn queue_tick(&self) -> Duration {
      Duration::from_millis(self.queue_tick_ms.max(1))
   }

   pub fn http_timeout(&self) -> Duration {
      Duration::from_millis(self.http_timeout_ms)
   }

   pub fn watch_debounce(&self) -> Duration {
      Duration::from_millis(self.watch_debounce_ms)
   }

   pub fn effective_upload_concurrency(&self) -> usize {
      self.upload_concurrency.clamp(1, MAX_UPLOAD_CONCURRENCY)
   }

   pub fn effective_max_errors(&self) -> usize {
      self.max_errors.max(1)
   }

   /// Case-insensitive check of a path's extension against the allow-list.
   pub fn is_supported_file(&self, path: &str) -> bool {
      let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) else {
         return false;
      };
      self
         .supported_extensions
         .iter()
         .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
   }

   pub fn is_base_branch(&self, branch: &str) -> bool {
      self.base_branches.iter().any(|b| b == branch)
   }
}

/// Credentials snapshot. Always replaced as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigState {
   pub token:                          Option<String>,
   pub organization_id:                Option<String>,
   pub tester_warnings_disabled_until: Option<i64>,
}

impl ConfigState {
   pub fn load(source: &dyn ConfigSource) -> Self {
      Self {
         token:                          source.get_secret(SECRET_TOKEN).filter(|t| !t.is_empty()),
         organization_id:                source
            .get_value(VALUE_ORGANIZATION_ID)
            .and_then(|v| value_as_string(&v))
            .filter(|o| !o.is_empty()),
         tester_warnings_disabled_until: source
            .get_value(VALUE_TESTER_WARNINGS_DISABLED_UNTIL)
            .and_then(|v| v.as_i64()),
      }
   }

   /// Token and organization id, if both are present.
   pub fn credentials(&self) -> Option<(&str, &str)> {
      Some((self.token.as_deref()?, self.organization_id.as_deref()?))
   }
}

fn value_as_string(value: &serde_json::Value) -> Option<String> {
   match value {
      serde_json::Value::String(s) => Some(s.clone()),
      serde_json::Value::Number(n) => Some(n.to_string()),
      _ => None,
   }
}

/// Where credentials and settings come from.
pub trait ConfigSource: Send + Sync {
   fn get_secret(&self, name: &str) -> Option<String>;

   fn get_value(&self, name: &str) -> Option<serde_json::Value>;

   /// Registers a handler called after the source's contents change.
   fn on_config_change(&self, handler: Box<dyn Fn() + Send + Sync>) -> Subscription;
}

#[derive(Debug, Default, Deserialize)]
struct Credentials {
   token: Option<String>,
}

/// [`ConfigSource`] backed by `~/.indexsync/config.toml`,
/// `~/.indexsync/credentials.toml`, and `INDEXSYNC_*` env vars.
pub struct FileConfigSource {
   config_path:      PathBuf,
   credentials_path: PathBuf,
   values:           RwLock<serde_json::Value>,
   config:           RwLock<Arc<Config>>,
   listeners:        Listeners<()>,
}

impl FileConfigSource {
   pub fn new() -> Self {
      Self::with_paths(config_file_path().clone(), credentials_file_path().clone())
   }

   pub fn with_paths(config_path: PathBuf, credentials_path: PathBuf) -> Self {
      let this = Self {
         config_path,
         credentials_path,
         values: RwLock::new(serde_json::Value::Null),
         config: RwLock::new(Arc::new(Config::default())),
         listeners: Listeners::new(),
      };
      this.load_values();
      this
   }

   pub fn config_path(&self) -> &Path {
      &self.config_path
   }

   /// Current engine settings.
   pub fn config(&self) -> Arc<Config> {
      Arc::clone(&self.config.read())
   }

   /// Re-reads the files and notifies subscribers.
   pub fn reload(&self) {
      self.load_values();
      tracing::info!("configuration reloaded from {}", self.config_path.display());
      self.listeners.emit(&());
   }

   fn load_values(&self) {
      let values: serde_json::Value = Figment::new()
         .merge(Toml::file(&self.config_path))
         .merge(Env::prefixed("INDEXSYNC_").ignore(&["token"]).lowercase(true))
         .extract()
         .inspect_err(|e| tracing::warn!("failed to parse config values: {e}"))
         .unwrap_or(serde_json::Value::Null);
      *self.values.write() = values;
      *self.config.write() = Arc::new(Config::load_from(&self.config_path));
   }

   fn read_credentials(&self) -> Credentials {
      match fs::read_to_string(&self.credentials_path) {
         Ok(raw) => toml::from_str(&raw)
            .inspect_err(|e| tracing::warn!("failed to parse credentials: {e}"))
            .unwrap_or_default(),
         Err(_) => Credentials::default(),
      }
   }
}

impl Default for FileConfigSource {
   fn default() -> Self {
      Self::new()
   }
}

impl ConfigSource for FileConfigSource {
   fn get_secret(&self, name: &str) -> Option<String> {
      let env_key = format!("INDEXSYNC_{}", name.to_uppercase());
      if let Ok(value) = std::env::var(env_key) {
         return Some(value);
      }
      if name == SECRET_TOKEN {
         return self.read_credentials().token;
      }
      None
   }

   fn get_value(&self, name: &str) -> Option<serde_json::Value> {
      self.values.read().get(name).filter(|v| !v.is_null()).cloned()
   }

   fn on_config_change(&self, handler: Box<dyn Fn() + Send + Sync>) -> Subscription {
      self.listeners.subscribe(move |()| handler())
   }
}

/// Returns the base directory for indexsync data and configuration
pub fn base_dir() -> &'static PathBuf {
   static ONCE: OnceLock<PathBuf> = OnceLock::new();
   ONCE.get_or_init(|| resolve_base_dir(".indexsync"))
}

fn resolve_base_dir(dir_name: &str) -> PathBuf {
   BaseDirs::new()
      .map(|d| d.home_dir().join(dir_name))
      .or_else(|| {
         std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(dir_name))
      })
      .unwrap_or_else(|| {
         std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(dir_name)
      })
}

macro_rules! define_paths {
   ($($fn_name:ident: $path:literal),* $(,)?) => {
      $(
         pub fn $fn_name() -> &'static PathBuf {
            static ONCE: OnceLock<PathBuf> = OnceLock::new();
            ONCE.get_or_init(|| base_dir().join($path))
         }
      )*
   };
}

define_paths! {
   config_file_path: "config.toml",
   credentials_file_path: "credentials.toml",
}
