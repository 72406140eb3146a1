//! Per-branch manifest cache with TTL expiry and in-flight fetch sharing.
//!
//! Each `projectId:branch` key holds either a fetched manifest with its
//! timestamp or a shared handle to the fetch currently in flight. Concurrent
//! callers for the same key join that handle, so at most one request per key
//! reaches the server at a time. Failures evict the key; nothing negative is
//! cached.

use std::{
   collections::HashMap,
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
   time::Duration,
};

use futures::{
   FutureExt,
   future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{
   collab::ManifestFetcher,
   error::{Error, Result},
   types::Manifest,
};

type FetchOutcome = std::result::Result<Arc<Manifest>, Arc<Error>>;
type PendingFetch = Shared<BoxFuture<'static, FetchOutcome>>;

struct Entry {
   manifest:   Option<Arc<Manifest>>,
   fetched_at: Instant,
   pending:    Option<PendingFetch>,
   generation: u64,
}

struct Inner {
   entries:         Mutex<HashMap<String, Entry>>,
   next_generation: AtomicU64,
}

impl Inner {
   fn complete(&self, key: &str, generation: u64, outcome: &FetchOutcome) {
      let mut entries = self.entries.lock();
      // The key may have been invalidated or refetched while we were waiting.
      if entries.get(key).is_none_or(|e| e.generation != generation) {
         return;
      }
      match outcome {
         Ok(manifest) => {
            entries.insert(key.to_string(), Entry {
               manifest: Some(Arc::clone(manifest)),
               fetched_at: Instant::now(),
               pending: None,
               generation,
            });
         },
         Err(_) => {
            entries.remove(key);
         },
      }
   }
}

/// Parameters identifying one manifest and the credentials to fetch it.
#[derive(Debug, Clone, Copy)]
pub struct ManifestRequest<'a> {
   pub organization_id: &'a str,
   pub project_id:      &'a str,
   pub branch:          &'a str,
   pub token:           &'a str,
}

#[derive(Clone)]
pub struct ManifestCache {
   inner:   Arc<Inner>,
   fetcher: Arc<dyn ManifestFetcher>,
   ttl:     Duration,
}

impl ManifestCache {
   pub fn new(fetcher: Arc<dyn ManifestFetcher>, ttl: Duration) -> Self {
      Self {
         inner: Arc::new(Inner {
            entries:         Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
         }),
         fetcher,
         ttl,
      }
   }

   /// Returns the cached manifest if fresh, joins an in-flight fetch if one
   /// exists, and otherwise starts a new fetch.
   pub async fn get_or_fetch(&self, request: ManifestRequest<'_>) -> Result<Arc<Manifest>> {
      let key = cache_key(request.project_id, request.branch);
      let pending = {
         let mut entries = self.inner.entries.lock();
         match entries.get(&key) {
            Some(Entry { pending: Some(pending), .. }) => {
               tracing::debug!("joining in-flight manifest fetch for {key}");
               pending.clone()
            },
            Some(Entry { manifest: Some(manifest), fetched_at, .. })
               if fetched_at.elapsed() < self.ttl =>
            {
               return Ok(Arc::clone(manifest));
            },
            _ => {
               let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
               let pending = self.start_fetch(key.clone(), generation, request);
               entries.insert(key.clone(), Entry {
                  manifest: None,
                  fetched_at: Instant::now(),
                  pending: Some(pending.clone()),
                  generation,
               });
               pending
            },
         }
      };

      pending
         .await
         .map_err(|source| Error::ManifestFetch { key, source })
   }

   fn start_fetch(&self, key: String, generation: u64, request: ManifestRequest<'_>) -> PendingFetch {
      let fetcher = Arc::clone(&self.fetcher);
      let inner = Arc::clone(&self.inner);
      let organization_id = request.organization_id.to_string();
      let project_id = request.project_id.to_string();
      let branch = request.branch.to_string();
      let token = request.token.to_string();

      async move {
         tracing::debug!("fetching manifest for {key}");
         let outcome: FetchOutcome = fetcher
            .fetch(&organization_id, &project_id, &branch, &token)
            .await
            .map(Arc::new)
            .map_err(Arc::new);
         if let Err(e) = &outcome {
            tracing::warn!("manifest fetch for {key} failed: {e}");
         }
         inner.complete(&key, generation, &outcome);
         outcome
      }
      .boxed()
      .shared()
   }

   /// Drops the entry for a branch that was switched away from. The new
   /// branch is fetched lazily by whoever needs it next.
   pub fn invalidate_for_branch(&self, project_id: &str, old_branch: &str) {
      let key = cache_key(project_id, old_branch);
      if self.inner.entries.lock().remove(&key).is_some() {
         tracing::debug!("invalidated manifest cache entry {key}");
      }
   }

   /// Removes settled entries older than `max_age`. Returns how many were
   /// removed.
   pub fn prune(&self, max_age: Duration) -> usize {
      let mut entries = self.inner.entries.lock();
      let before = entries.len();
      entries.retain(|_, e| e.pending.is_some() || e.fetched_at.elapsed() <= max_age);
      before - entries.len()
   }

   pub fn clear(&self) {
      self.inner.entries.lock().clear();
   }

   pub fn len(&self) -> usize {
      self.inner.entries.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}

/// A file is indexed iff the manifest lists the same path with the same hash.
pub fn is_file_indexed(manifest: &Manifest, file_path: &str, file_hash: &str) -> bool {
   manifest.contains(file_path, file_hash)
}

pub fn cache_key(project_id: &str, branch: &str) -> String {
   format!("{project_id}:{branch}")
}
