//! End-to-end scenarios against in-memory log servers and a temporary store.

use logfetch_core::config::{EndpointConfig, LogFetchConfig};
use logfetch_core::SyncState;
use logfetch_endpoint::{EndpointAddr, EndpointRegistry, OperatorFactory, Timeouts};
use logfetch_sync::{AlwaysConfirm, DownloadOrchestrator, DownloaderEvent, ListingPhase};
use opendal::Operator;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn memory_op() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish()
}

struct Harness {
    servers: HashMap<String, Operator>,
    tmp: TempDir,
    orch: DownloadOrchestrator,
}

impl Harness {
    fn new(keys: &[&str], ignore_active_log: bool) -> Self {
        let servers: HashMap<String, Operator> =
            keys.iter().map(|k| (k.to_string(), memory_op())).collect();
        let tmp = TempDir::new().unwrap();

        let mut config = LogFetchConfig::default();
        config.storage.base_dir = tmp.path().to_path_buf();
        config.storage.label = "lauv".into();
        config.listing.ignore_active_log = ignore_active_log;
        config.download.chunk_size = 256;
        config.endpoints = keys
            .iter()
            .map(|k| EndpointConfig {
                key: k.to_string(),
                host: Some("127.0.0.1".into()),
                ..Default::default()
            })
            .collect();

        let lookup = servers.clone();
        let factory: Arc<dyn OperatorFactory> = Arc::new(move |addr: &EndpointAddr| {
            lookup
                .get(&addr.key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no server for {}", addr.key))
        });
        let registry =
            EndpointRegistry::with_factory(&config.endpoints, Timeouts::default(), factory).unwrap();
        let orch = DownloadOrchestrator::with_registry(config, Arc::new(registry));
        Self { servers, tmp, orch }
    }

    fn server(&self, key: &str) -> &Operator {
        &self.servers[key]
    }

    fn local(&self, remote: &str) -> PathBuf {
        self.tmp.path().join("lauv").join(remote)
    }

    fn seed_local(&self, remote: &str, data: &[u8]) {
        let path = self.local(remote);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    fn folder_state(&self, folder: &str) -> Option<SyncState> {
        self.orch.folder_states(&[folder.to_string()]).get(folder).copied()
    }

    fn file_state(&self, folder: &str, file: &str) -> Option<SyncState> {
        self.orch.file_states(folder)?.get(file).copied()
    }

    async fn wait_folder(&self, folder: &str, want: SyncState) {
        for _ in 0..500 {
            if self.folder_state(folder) == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "folder {folder} never reached {want}, stuck at {:?}",
            self.folder_state(folder)
        );
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn new_folder_downloads_to_sync() {
    let h = Harness::new(&["main"], true);
    let data = payload(1000);
    h.server("main").write("20240101/a.log", data.clone()).await.unwrap();
    h.server("main").write("20240102/Data.lsf", vec![1u8; 10]).await.unwrap();

    let report = h.orch.sync_listing().await.unwrap();
    assert_eq!(report.active.as_deref(), Some("20240102"));
    assert_eq!(h.orch.list_folders(), vec!["20240101"]);
    assert_eq!(h.folder_state("20240101"), Some(SyncState::New));
    assert_eq!(h.file_state("20240101", "20240101/a.log"), Some(SyncState::New));

    assert_eq!(h.orch.download(&["20240101".to_string()]), 1);
    h.wait_folder("20240101", SyncState::Sync).await;

    assert_eq!(h.file_state("20240101", "20240101/a.log"), Some(SyncState::Sync));
    assert_eq!(std::fs::read(h.local("20240101/a.log")).unwrap(), data);
    assert_eq!(h.orch.summary(), Some(SyncState::Sync));
}

#[tokio::test]
async fn partial_local_copy_resumes() {
    let h = Harness::new(&["main"], false);
    let data = payload(1000);
    h.server("main").write("20240101/a.log", data.clone()).await.unwrap();
    h.seed_local("20240101/a.log", &data[..400]);

    h.orch.sync_listing().await.unwrap();
    assert_eq!(
        h.file_state("20240101", "20240101/a.log"),
        Some(SyncState::Incomplete)
    );

    h.orch.download(&["20240101".to_string()]);
    h.wait_folder("20240101", SyncState::Sync).await;

    let local = std::fs::read(h.local("20240101/a.log")).unwrap();
    assert_eq!(local.len(), 1000);
    assert_eq!(local, data);
}

#[tokio::test]
async fn matching_local_copy_is_sync_without_transfer() {
    let h = Harness::new(&["main"], false);
    let data = payload(64);
    h.server("main").write("20240101/a.log", data.clone()).await.unwrap();
    h.seed_local("20240101/a.log", &data);

    let mut events = h.orch.subscribe();
    h.orch.sync_listing().await.unwrap();

    assert_eq!(h.file_state("20240101", "20240101/a.log"), Some(SyncState::Sync));
    assert_eq!(h.folder_state("20240101"), Some(SyncState::Sync));
    assert_eq!(h.orch.download(&["20240101".to_string()]), 0);
    assert!(h.orch.transfer("20240101/a.log").is_none());

    let mut saw_done = false;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, DownloaderEvent::Transfer { .. }));
        if matches!(event, DownloaderEvent::Listing(ListingPhase::Done)) {
            saw_done = true;
        }
    }
    assert!(saw_done);
}

#[tokio::test]
async fn vanished_folder_becomes_local() {
    let h = Harness::new(&["main"], false);
    h.server("main").write("20240101/a.log", vec![3u8; 8]).await.unwrap();
    h.server("main").write("20240102/a.log", vec![3u8; 8]).await.unwrap();
    h.orch.sync_listing().await.unwrap();
    assert_eq!(h.orch.list_folders().len(), 2);

    h.server("main").delete("20240101/a.log").await.unwrap();
    h.server("main").delete("20240101/").await.unwrap();
    h.orch.sync_listing().await.unwrap();

    assert_eq!(h.folder_state("20240101"), Some(SyncState::Local));
    assert_eq!(
        h.file_state("20240101", "20240101/a.log"),
        Some(SyncState::Local)
    );
    assert_eq!(h.folder_state("20240102"), Some(SyncState::New));
    assert!(h.orch.folder("20240101").unwrap().endpoints.is_empty());
}

#[tokio::test]
async fn presence_spans_endpoints_and_files_keep_their_source() {
    let h = Harness::new(&["main", "cam"], false);
    h.server("main").write("20240101/Data.lsf", vec![1u8; 30]).await.unwrap();
    h.server("cam").write("20240101/photos/1.jpg", vec![2u8; 50]).await.unwrap();
    h.server("cam").write("20240101/photos/2.jpg", vec![3u8; 70]).await.unwrap();

    h.orch.sync_listing().await.unwrap();
    let folder = h.orch.folder("20240101").unwrap();
    assert_eq!(folder.presence(), "cam main");

    let photos = folder.file("20240101/photos").unwrap();
    assert!(photos.is_dir);
    assert_eq!(photos.endpoint, "cam");
    assert_eq!(photos.size, Some(120));
    assert_eq!(folder.file("20240101/Data.lsf").unwrap().endpoint, "main");

    h.orch.download(&["20240101".to_string()]);
    h.wait_folder("20240101", SyncState::Sync).await;
    assert_eq!(
        std::fs::read(h.local("20240101/photos/2.jpg")).unwrap(),
        vec![3u8; 70]
    );
}

#[tokio::test]
async fn deep_directories_are_flagged() {
    let h = Harness::new(&["main"], false);
    h.server("main").write("20240101/photos/1.jpg", vec![0u8; 5]).await.unwrap();
    h.server("main")
        .write("20240101/photos/raw/1.dng", vec![0u8; 9])
        .await
        .unwrap();

    let mut events = h.orch.subscribe();
    h.orch.sync_listing().await.unwrap();

    let folder = h.orch.folder("20240101").unwrap();
    let photos = folder.file("20240101/photos").unwrap();
    assert_eq!(photos.children.len(), 1);
    assert_eq!(photos.size, Some(5));

    let mut flagged = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DownloaderEvent::DepthLimited { path, .. } = event {
            flagged.push(path);
        }
    }
    assert_eq!(flagged, vec!["20240101/photos/raw".to_string()]);
}

#[tokio::test]
async fn delete_folder_removes_remote_and_forgets_entry() {
    let h = Harness::new(&["main"], false);
    h.server("main").write("20240101/a.log", vec![0u8; 8]).await.unwrap();
    h.server("main").write("20240101/sub/b.log", vec![0u8; 8]).await.unwrap();
    h.server("main").write("20240102/a.log", vec![0u8; 8]).await.unwrap();
    h.seed_local("20240102/a.log", &[0u8; 8]);
    h.orch.sync_listing().await.unwrap();

    let ok = h
        .orch
        .delete_folders(&["20240101".to_string(), "20240102".to_string()], &AlwaysConfirm)
        .await;
    assert!(ok);

    assert!(!h.server("main").exists("20240101/a.log").await.unwrap());
    assert!(!h.server("main").exists("20240101/sub/b.log").await.unwrap());
    // no local copy: forgotten; local copy: kept as Local
    assert_eq!(h.orch.list_folders(), vec!["20240102"]);
    assert_eq!(h.folder_state("20240102"), Some(SyncState::Local));
}

#[tokio::test]
async fn delete_single_file() {
    let h = Harness::new(&["main"], false);
    h.server("main").write("20240101/a.log", vec![0u8; 8]).await.unwrap();
    h.server("main").write("20240101/b.log", vec![0u8; 8]).await.unwrap();
    h.orch.sync_listing().await.unwrap();

    assert!(
        h.orch
            .delete_files("20240101", &["a.log".to_string()], &AlwaysConfirm)
            .await
    );
    assert!(!h.server("main").exists("20240101/a.log").await.unwrap());
    assert_eq!(
        h.orch.list_files("20240101").unwrap(),
        vec!["20240101/b.log".to_string()]
    );
}

#[tokio::test]
async fn full_reset_forgets_everything() {
    let h = Harness::new(&["main"], false);
    h.server("main").write("20240101/a.log", vec![0u8; 8]).await.unwrap();
    h.orch.sync_listing().await.unwrap();
    h.orch.download(&["20240101".to_string()]);

    assert!(h.orch.reset(false).await);
    assert!(h.orch.list_folders().is_empty());
    assert_eq!(h.orch.summary(), None);
    assert!(h.orch.transfer("20240101/a.log").is_none());

    // the engine stays usable
    h.orch.sync_listing().await.unwrap();
    assert_eq!(h.orch.list_folders(), vec!["20240101"]);
}

#[tokio::test]
async fn stop_only_reset_keeps_inventory() {
    let h = Harness::new(&["main"], false);
    h.server("main").write("20240101/a.log", vec![0u8; 8]).await.unwrap();
    h.orch.sync_listing().await.unwrap();

    assert!(h.orch.reset(true).await);
    assert_eq!(h.orch.list_folders(), vec!["20240101"]);
    assert!(h.orch.active_transfers().is_empty());
}
