//! Repository inspection backed by libgit2.

use std::{
   io,
   path::{Path, PathBuf},
   sync::Arc,
};

use async_trait::async_trait;
use git2::{ErrorCode, Repository};

use crate::{
   collab::RepositoryInspector,
   config::Config,
   error::{ConfigError, Error, Result},
   types::{ProjectConfig, RepositoryInfo},
};

/// Checks if a path is the root of a git working copy
pub fn is_git_repo(path: &Path) -> bool {
   Repository::open(path).is_ok_and(|repo| repo.workdir().is_some())
}

/// Returns the checked-out branch name. A detached HEAD yields the short
/// commit id; a repository without commits yields the branch HEAD points to.
pub fn current_branch(path: &Path) -> Result<String> {
   let repo = Repository::open(path)?;
   let head = match repo.head() {
      Ok(head) => head,
      Err(e) if e.code() == ErrorCode::UnbornBranch => {
         let head = repo.find_reference("HEAD")?;
         let target = head.symbolic_target().unwrap_or_default();
         return Ok(target.trim_start_matches("refs/heads/").to_string());
      },
      Err(e) => return Err(e.into()),
   };

   if head.is_branch()
      && let Some(name) = head.shorthand()
   {
      return Ok(name.to_string());
   }
   let commit = head.peel_to_commit()?;
   let short = commit.as_object().short_id()?;
   Ok(short.as_str().unwrap_or_default().to_string())
}

/// Returns the URL of the origin remote, or of the first remote that has one
pub fn get_remote_url(repo: &Repository) -> Option<String> {
   let url_of = |name: &str| {
      repo
         .find_remote(name)
         .ok()
         .and_then(|remote| remote.url().map(|s| s.to_string()))
   };
   url_of("origin").or_else(|| {
      let names = repo.remotes().ok()?;
      names.iter().flatten().find_map(url_of)
   })
}

/// Reads the repo-local project file. A missing file means "no project".
pub fn read_project_config(path: &Path, file_name: &str) -> Result<Option<ProjectConfig>> {
   let config_path = path.join(file_name);
   let raw = match std::fs::read_to_string(&config_path) {
      Ok(raw) => raw,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(e.into()),
   };
   let config: ProjectConfig = toml::from_str(&raw).map_err(|e| ConfigError::InvalidProjectConfig {
      path:   config_path.clone(),
      reason: e.message().to_string(),
   })?;
   if config.project.id.trim().is_empty() {
      return Ok(None);
   }
   Ok(Some(config))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
   T: Send + 'static,
   F: FnOnce() -> Result<T> + Send + 'static,
{
   tokio::task::spawn_blocking(f)
      .await
      .map_err(|e| Error::Io(io::Error::other(e)))?
}

/// [`RepositoryInspector`] over local working copies.
pub struct GitInspector {
   settings: Arc<Config>,
}

impl GitInspector {
   pub fn new(settings: Arc<Config>) -> Self {
      Self { settings }
   }
}

#[async_trait]
impl RepositoryInspector for GitInspector {
   async fn is_git_repository(&self, path: &Path) -> bool {
      let path = path.to_path_buf();
      blocking(move || Ok(is_git_repo(&path))).await.unwrap_or(false)
   }

   async fn current_branch(&self, path: &Path) -> Result<String> {
      let path = path.to_path_buf();
      blocking(move || current_branch(&path)).await
   }

   async fn repository_info(&self, path: &Path) -> Result<RepositoryInfo> {
      let path: PathBuf = path.to_path_buf();
      blocking(move || {
         let repo = Repository::open(&path)?;
         Ok(RepositoryInfo { repository_url: get_remote_url(&repo) })
      })
      .await
   }

   async fn project_config(
      &self,
      path: &Path,
      repository_url: Option<&str>,
   ) -> Result<Option<ProjectConfig>> {
      let dir = path.to_path_buf();
      let file_name = self.settings.project_config_file.clone();
      let config = blocking(move || read_project_config(&dir, &file_name)).await?;
      if config.is_none() {
         tracing::debug!(
            "no {} in {} (remote: {})",
            self.settings.project_config_file,
            path.display(),
            repository_url.unwrap_or("none")
         );
      }
      Ok(config)
   }
}
