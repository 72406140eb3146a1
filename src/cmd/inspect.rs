//! Offline folder inspection.
//!
//! Prints what `run` would decide for a folder during setup without
//! contacting the server.

use std::path::PathBuf;

use console::style;

use crate::{
   Result,
   collab::RepositoryInspector,
   config::{ConfigState, FileConfigSource},
   git::GitInspector,
};

pub async fn execute(folder: PathBuf) -> Result<()> {
   let source = FileConfigSource::new();
   let settings = source.config();
   let inspector = GitInspector::new(settings.clone());
   let folder = folder.canonicalize()?;

   println!("{}", style(folder.display()).bold());

   let credentials = ConfigState::load(&source);
   let configured = if credentials.credentials().is_some() {
      style("configured").green()
   } else {
      style("missing").red()
   };
   println!("  credentials: {configured}");

   if !inspector.is_git_repository(&folder).await {
      println!("  {} not a git repository; would be skipped", style("✗").red());
      return Ok(());
   }

   let branch = inspector.current_branch(&folder).await?;
   let base = if settings.is_base_branch(&branch) { " (base)" } else { "" };
   println!("  branch:      {branch}{base}");

   let info = inspector.repository_info(&folder).await.unwrap_or_default();
   println!("  remote:      {}", info.repository_url.as_deref().unwrap_or("-"));

   match inspector
      .project_config(&folder, info.repository_url.as_deref())
      .await?
   {
      Some(cfg) => println!("  project:     {}", style(cfg.project.id).cyan()),
      None => println!(
         "  {} no {} found; would be skipped",
         style("✗").red(),
         settings.project_config_file
      ),
   }
   Ok(())
}
