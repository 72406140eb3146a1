mod support;

use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use indexsync::{
   collab::Watcher,
   config::SECRET_TOKEN,
   error::ErrorKind,
   types::{EventKind, WatcherId},
};
use support::{
   FakeEntitlements, FakeRepo, Harness, MemoryConfig, event, file_changed, wait_for,
};
use tempfile::TempDir;

fn ws(name: &str) -> PathBuf {
   PathBuf::from("/ws").join(name)
}

#[tokio::test]
async fn non_git_folder_is_excluded_but_manifest_failure_is_kept() {
   let h = Harness::new(vec![ws("plain"), ws("down"), ws("ok")]);
   h.inspector.add(ws("down"), FakeRepo::new("offline", "p2"));
   h.inspector.add(ws("ok"), FakeRepo::new("main", "p3"));
   h.fetcher.fail_branch("offline");

   h.indexer.start().await;
   assert!(h.indexer.is_active());

   let snapshot = h.indexer.workspace_folder_state_snapshot();
   assert_eq!(snapshot.len(), 2);
   assert!(snapshot.iter().all(|f| f.folder_path != ws("plain")));

   let down = snapshot.iter().find(|f| f.folder_path == ws("down")).unwrap();
   assert!(!down.has_watcher);
   assert_eq!(down.error.as_ref().unwrap().kind, ErrorKind::Manifest);
   assert_eq!(down.project_id.as_deref(), Some("p2"));

   let ok = snapshot.iter().find(|f| f.folder_path == ws("ok")).unwrap();
   assert!(ok.has_watcher);
   assert!(ok.error.is_none());
   assert_eq!(h.watchers.created().len(), 1);
}

#[tokio::test]
async fn single_non_git_folder_yields_empty_state() {
   let h = Harness::new(vec![ws("plain")]);

   h.indexer.start().await;

   assert!(h.indexer.workspace_folder_state_snapshot().is_empty());
   assert!(h.indexer.errors().is_empty(), "exclusion is silent");
}

#[tokio::test]
async fn folder_without_project_is_excluded() {
   let h = Harness::new(vec![ws("a")]);
   let mut repo = FakeRepo::new("main", "unused");
   repo.project_id = None;
   h.inspector.add(ws("a"), repo);

   h.indexer.start().await;

   assert!(h.indexer.workspace_folder_state_snapshot().is_empty());
}

#[tokio::test]
async fn branch_and_project_errors_are_logged_globally() {
   let h = Harness::new(vec![ws("a"), ws("b")]);
   let mut broken = FakeRepo::new("main", "p1");
   broken.branch_error = true;
   h.inspector.add(ws("a"), broken);
   h.inspector.add(ws("b"), FakeRepo::new("main", "p2"));
   h.inspector.fail_project(&ws("b"));

   h.indexer.start().await;

   assert!(h.indexer.workspace_folder_state_snapshot().is_empty());
   let mut kinds: Vec<ErrorKind> = h.indexer.errors().into_iter().map(|e| e.kind).collect();
   kinds.sort_by_key(|k| k.as_str());
   assert_eq!(kinds, vec![ErrorKind::Config, ErrorKind::Git]);
}

#[tokio::test]
async fn start_without_folders_stays_inactive() {
   let h = Harness::new(Vec::new());
   h.indexer.start().await;
   assert!(!h.indexer.is_active());
   assert_eq!(h.entitlements.calls(), 0);
}

#[tokio::test]
async fn start_without_credentials_stays_inactive() {
   let h = Harness::build(MemoryConfig::new(), FakeEntitlements::new(true, true), vec![ws("a")]);
   h.inspector.add(ws("a"), FakeRepo::new("main", "p1"));

   h.indexer.start().await;

   assert!(!h.indexer.is_active());
   assert_eq!(h.entitlements.calls(), 0);
   assert!(h.watchers.created().is_empty());
}

#[tokio::test]
async fn start_without_entitlement_stays_inactive() {
   for entitlements in [FakeEntitlements::new(true, false), FakeEntitlements::new(false, false)] {
      let h = Harness::build(MemoryConfig::with_credentials("t", "org"), entitlements, vec![ws("a")]);
      h.inspector.add(ws("a"), FakeRepo::new("main", "p1"));

      h.indexer.start().await;

      assert!(!h.indexer.is_active());
      assert_eq!(h.entitlements.calls(), 1);
      assert!(h.indexer.workspace_folder_state_snapshot().is_empty());
   }
}

#[tokio::test]
async fn scan_results_flow_to_uploads() {
   let dir = TempDir::new().unwrap();
   let root = dir.path().to_path_buf();
   fs::write(root.join("a.rs"), "fn a() {}").unwrap();
   fs::write(root.join("b.rs"), "fn b() {}").unwrap();

   let h = Harness::new(vec![root.clone()]);
   h.inspector.add(root.clone(), FakeRepo::new("main", "p1"));
   h.fetcher.set_manifest("p1", "main", &[("b.rs", "hb")]);
   h.watchers.script(&root, &[("a.rs", "ha"), ("b.rs", "hb"), ("notes.bin", "hn")]);

   h.indexer.start().await;

   assert!(wait_for(|| h.uploader.uploads.lock().len() == 1).await);
   let upload = h.uploader.uploads.lock()[0].clone();
   assert_eq!(upload.file_path, "a.rs");
   assert_eq!(upload.file_hash, "ha");
   assert_eq!(upload.file_bytes, b"fn a() {}");
   assert_eq!(upload.git_branch, "main");
   assert!(upload.is_base_branch);
   assert_eq!(upload.project_id, "p1");

   let watcher = h.watchers.for_folder(&root).unwrap();
   assert!(wait_for(|| watcher.started.load(std::sync::atomic::Ordering::SeqCst)).await);
   assert!(wait_for(|| !h.indexer.workspace_folder_state_snapshot()[0].is_indexing).await);
   assert_eq!(h.fetcher.calls(), 1, "initial fetch warms the cache for the scan");
}

#[tokio::test]
async fn live_events_from_watcher_are_dispatched() {
   let h = Harness::new(vec![ws("a")]);
   h.inspector.add(ws("a"), FakeRepo::new("main", "p1"));
   h.indexer.start().await;
   let watcher = h.watchers.for_folder(&ws("a")).unwrap();

   watcher.push(EventKind::BranchChanged {
      previous_branch: "main".to_string(),
      new_branch:      "feature".to_string(),
   });

   assert!(
      wait_for(|| {
         h.indexer.workspace_folder_state_snapshot()[0].git_branch.as_deref() == Some("feature")
      })
      .await
   );
}

#[tokio::test]
async fn dispose_clears_everything_and_silences_events() {
   let h = Harness::new(vec![ws("a")]);
   h.inspector.add(ws("a"), FakeRepo::new("main", "p1"));
   h.indexer.start().await;
   let watcher = h.watchers.for_folder(&ws("a")).unwrap();
   let id = watcher.id();

   h.indexer.dispose().await;

   assert!(!h.indexer.is_active());
   assert!(h.indexer.workspace_folder_state_snapshot().is_empty());
   assert!(h.indexer.errors().is_empty());
   assert_eq!(h.indexer.queue_len(), 0);
   assert!(watcher.is_disposed());
   assert_eq!(h.config.subscribers(), 0);

   h.indexer.process_event(event(id, "main", EventKind::ScanStart)).await;
   h.indexer.process_event(event(id, "main", file_changed("a.ts", "h1"))).await;
   h.indexer.on_event(event(id, "main", file_changed("b.ts", "h2")));
   assert!(h.indexer.workspace_folder_state_snapshot().is_empty());
   assert_eq!(h.indexer.queue_len(), 0);
}

#[tokio::test]
async fn dispose_during_slow_start_deactivates_immediately() {
   let h = Harness::new(vec![ws("a")]);
   h.inspector.add(ws("a"), FakeRepo::new("main", "p1"));
   let gate = h.fetcher.hold();

   let indexer = Arc::clone(&h.indexer);
   let starting = tokio::spawn(async move { indexer.start().await });
   assert!(wait_for(|| h.indexer.is_active() && h.fetcher.calls() == 1).await);

   let indexer = Arc::clone(&h.indexer);
   let disposing = tokio::spawn(async move { indexer.dispose().await });
   assert!(wait_for(|| !h.indexer.is_active()).await);
   tokio::time::timeout(Duration::from_secs(2), disposing)
      .await
      .expect("dispose waited on the held fetch")
      .unwrap();
   starting.await.unwrap();

   assert!(h.indexer.workspace_folder_state_snapshot().is_empty());
   assert!(h.watchers.created().is_empty());
   assert_eq!(h.config.subscribers(), 0);

   gate.add_permits(1);
   tokio::time::sleep(Duration::from_millis(20)).await;
   assert!(!h.indexer.is_active());
   assert!(h.indexer.workspace_folder_state_snapshot().is_empty());
}

#[tokio::test]
async fn restart_during_slow_start_runs_a_fresh_session() {
   let h = Harness::new(vec![ws("a")]);
   h.inspector.add(ws("a"), FakeRepo::new("main", "p1"));
   let gate = h.fetcher.hold();

   let indexer = Arc::clone(&h.indexer);
   let starting = tokio::spawn(async move { indexer.start().await });
   assert!(wait_for(|| h.fetcher.calls() == 1).await);

   let restarting = tokio::spawn(h.indexer.restart());
   starting.await.unwrap();
   assert!(wait_for(|| h.fetcher.calls() == 2).await);
   gate.add_permits(10);
   restarting.await.unwrap();

   assert!(h.indexer.is_active());
   assert_eq!(h.watchers.created().len(), 1);
   assert_eq!(h.indexer.workspace_folder_state_snapshot().len(), 1);
}

#[tokio::test]
async fn dispose_is_idempotent() {
   let h = Harness::new(vec![ws("a")]);
   h.indexer.dispose().await;
   h.indexer.dispose().await;
   assert!(!h.indexer.is_active());
}

#[tokio::test]
async fn config_change_restarts_with_fresh_watchers() {
   let h = Harness::new(vec![ws("a")]);
   h.inspector.add(ws("a"), FakeRepo::new("main", "p1"));
   h.indexer.start().await;
   let first = h.watchers.for_folder(&ws("a")).unwrap();

   h.config.changed();

   assert!(wait_for(|| h.watchers.created().len() == 2).await);
   assert!(first.is_disposed());
   assert!(wait_for(|| h.indexer.is_active()).await);
   assert_eq!(h.config.subscribers(), 1);
}

#[tokio::test]
async fn credentials_arriving_later_activate_the_engine() {
   let config = MemoryConfig::new();
   let h = Harness::build(config.clone(), FakeEntitlements::new(true, true), vec![ws("a")]);
   h.inspector.add(ws("a"), FakeRepo::new("main", "p1"));
   h.indexer.start().await;
   assert!(!h.indexer.is_active());

   config.set_secret(SECRET_TOKEN, "t");
   config.set_value("organization_id", serde_json::json!("org"));
   config.changed();

   assert!(wait_for(|| h.indexer.is_active()).await);
   assert!(wait_for(|| h.indexer.workspace_folder_state_snapshot().len() == 1).await);
}

#[tokio::test]
async fn changing_workspace_folders_restarts() {
   let h = Harness::new(vec![ws("a")]);
   h.inspector.add(ws("a"), FakeRepo::new("main", "p1"));
   h.inspector.add(ws("b"), FakeRepo::new("main", "p2"));
   h.indexer.start().await;

   h.indexer.set_workspace_folders(vec![ws("b")]).await;

   let snapshot = h.indexer.workspace_folder_state_snapshot();
   assert_eq!(snapshot.len(), 1);
   assert_eq!(snapshot[0].folder_path, ws("b"));
   assert!(h.watchers.for_folder(&ws("a")).unwrap().is_disposed());
}

#[tokio::test]
async fn watcher_ids_are_unique_across_restarts() {
   let h = Harness::new(vec![ws("a")]);
   h.inspector.add(ws("a"), FakeRepo::new("main", "p1"));
   h.indexer.start().await;
   h.indexer.restart().await;

   let ids: Vec<WatcherId> = h.watchers.created().iter().map(|w| w.id()).collect();
   assert_eq!(ids.len(), 2);
   assert_ne!(ids[0], ids[1]);
}
