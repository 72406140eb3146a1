//! Upload queue and its bounded-concurrency consumer.
//!
//! The queue itself is an unbounded FIFO. The worker wakes on a fixed tick,
//! takes at most one task per tick, and only when an upload permit is free,
//! so the number of in-flight uploads never exceeds the configured limit and
//! producers are never blocked.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
   sync::Semaphore,
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
   collab::{FileUploader, UploadRequest},
   config::Config,
   error::{Error, ErrorKind, IndexerError, Result},
   store::Store,
   types::FileUpsertTask,
};

#[derive(Debug, Default)]
pub struct UploadQueue {
   tasks: Mutex<VecDeque<FileUpsertTask>>,
}

impl UploadQueue {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn enqueue(&self, task: FileUpsertTask) {
      self.tasks.lock().push_back(task);
   }

   pub fn dequeue_one(&self) -> Option<FileUpsertTask> {
      self.tasks.lock().pop_front()
   }

   pub fn len(&self) -> usize {
      self.tasks.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.tasks.lock().is_empty()
   }

   pub fn clear(&self) {
      self.tasks.lock().clear();
   }

   /// Copy of the pending tasks in queue order.
   pub fn pending(&self) -> Vec<FileUpsertTask> {
      self.tasks.lock().iter().cloned().collect()
   }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
   pub tick:           Duration,
   pub concurrency:    usize,
   pub prune_interval: Duration,
   pub stale_after:    Duration,
}

impl From<&Config> for WorkerSettings {
   fn from(cfg: &Config) -> Self {
      Self {
         tick:           cfg.queue_tick(),
         concurrency:    cfg.effective_upload_concurrency(),
         prune_interval: cfg.manifest_prune_interval(),
         stale_after:    cfg.manifest_stale(),
      }
   }
}

/// Background consumer draining the store's upload queue.
pub struct UploadWorker {
   token:  CancellationToken,
   handle: Option<JoinHandle<()>>,
}

impl UploadWorker {
   /// Spawns the consumer for the store's current session.
   pub fn spawn(
      store: Arc<Store>,
      uploader: Arc<dyn FileUploader>,
      settings: WorkerSettings,
   ) -> Self {
      let token = CancellationToken::new();
      let token_clone = token.clone();
      let generation = store.generation();
      let permits = Arc::new(Semaphore::new(settings.concurrency.max(1)));

      let handle = tokio::spawn(async move {
         let mut tick = time::interval(settings.tick);
         tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
         let mut prune = time::interval(settings.prune_interval);
         prune.set_missed_tick_behavior(MissedTickBehavior::Skip);

         loop {
            tokio::select! {
               biased;
               () = token_clone.cancelled() => break,
               _ = tick.tick() => {
                  let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                     continue;
                  };
                  let Some(task) = store.queue().dequeue_one() else {
                     continue;
                  };
                  let store = Arc::clone(&store);
                  let uploader = Arc::clone(&uploader);
                  tokio::spawn(async move {
                     let _permit = permit;
                     upload_task(&store, uploader.as_ref(), generation, task).await;
                  });
               }
               _ = prune.tick() => {
                  let pruned = store.cache().prune(settings.stale_after);
                  if pruned > 0 {
                     tracing::debug!("pruned {pruned} stale manifest entries");
                  }
               }
            }
         }
         tracing::debug!("upload worker stopped");
      });

      Self { token, handle: Some(handle) }
   }

   /// Stops taking new tasks. Uploads already running finish on their own.
   pub fn stop(&mut self) {
      self.token.cancel();
      self.handle.take();
   }
}

impl Drop for UploadWorker {
   fn drop(&mut self) {
      self.token.cancel();
   }
}

/// Uploads one task, recording any failure as a `file-upsert` error. The task
/// is never re-queued. Returns whether the upload succeeded.
pub async fn upload_task(
   store: &Store,
   uploader: &dyn FileUploader,
   generation: u64,
   task: FileUpsertTask,
) -> bool {
   let relative = task.relative_path();
   let branch = task.branch.clone();
   match try_upload(store, uploader, task).await {
      Ok(()) => {
         tracing::debug!("uploaded {relative} ({branch})");
         true
      },
      Err(e) => {
         let error = IndexerError::from_error(ErrorKind::FileUpsert, &e)
            .with_file(relative)
            .with_branch(branch)
            .with_operation("upload");
         store.record_error(generation, error);
         false
      },
   }
}

async fn try_upload(store: &Store, uploader: &dyn FileUploader, task: FileUpsertTask) -> Result<()> {
   let config = store.config();
   let (token, organization_id) = config.credentials().ok_or(Error::MissingCredentials)?;
   let file_bytes = tokio::fs::read(task.absolute_path()).await?;

   uploader
      .upload(UploadRequest {
         file_bytes,
         file_path: task.relative_path(),
         file_hash: task.file_hash,
         git_branch: task.branch,
         is_base_branch: task.is_base_branch,
         organization_id: organization_id.to_string(),
         project_id: task.project_id,
         token: token.to_string(),
      })
      .await
}
