//! Children-first remote directory removal

use logfetch_core::{LogFetchResult, RemoteEntry};
use tracing::{debug, warn};

/// The three remote calls a recursive delete needs
pub(crate) trait RemoteTree {
    async fn children(&self, dir: &str) -> LogFetchResult<Vec<RemoteEntry>>;
    async fn remove_file(&self, path: &str) -> bool;
    async fn remove_dir(&self, path: &str) -> bool;
}

/// Walk `root`, delete every file, then every directory deepest-first with
/// `root` last. Fails closed: a listing error or a failed file delete leaves
/// the directories in place and returns false.
pub(crate) async fn delete_tree<T: RemoteTree>(tree: &T, root: &str) -> bool {
    let root = root.trim_matches('/').to_string();
    let mut dirs = vec![root.clone()];
    let mut files = Vec::new();

    let mut cursor = 0;
    while cursor < dirs.len() {
        let dir = dirs[cursor].clone();
        cursor += 1;
        match tree.children(&dir).await {
            Ok(entries) => {
                for entry in entries {
                    if entry.is_dir {
                        dirs.push(entry.path);
                    } else {
                        files.push(entry.path);
                    }
                }
            }
            Err(e) => {
                warn!(dir = %dir, error = %e, "cannot list directory for delete");
                return false;
            }
        }
    }

    let mut failed = 0usize;
    for file in &files {
        if !tree.remove_file(file).await {
            failed += 1;
        }
    }
    if failed > 0 {
        warn!(root = %root, failed, total = files.len(), "nested deletes failed, keeping directory");
        return false;
    }

    let mut ok = true;
    for dir in dirs.iter().rev() {
        ok &= tree.remove_dir(dir).await;
    }
    debug!(root = %root, files = files.len(), dirs = dirs.len(), ok, "recursive delete");
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use logfetch_core::LogFetchError;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;

    /// In-process tree that records every call
    #[derive(Default)]
    struct FakeTree {
        dirs: BTreeMap<String, Vec<RemoteEntry>>,
        failing: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeTree {
        fn with_dir(mut self, dir: &str, files: &[&str], subdirs: &[&str]) -> Self {
            let mut entries: Vec<RemoteEntry> = files
                .iter()
                .map(|f| RemoteEntry {
                    name: f.to_string(),
                    path: format!("{dir}/{f}"),
                    size: 1,
                    is_dir: false,
                })
                .collect();
            entries.extend(subdirs.iter().map(|d| RemoteEntry {
                name: d.to_string(),
                path: format!("{dir}/{d}"),
                size: 0,
                is_dir: true,
            }));
            self.dirs.insert(dir.to_string(), entries);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RemoteTree for FakeTree {
        async fn children(&self, dir: &str) -> LogFetchResult<Vec<RemoteEntry>> {
            self.dirs
                .get(dir)
                .cloned()
                .ok_or_else(|| LogFetchError::Transfer {
                    path: dir.to_string(),
                    reason: "no such directory".into(),
                })
        }

        async fn remove_file(&self, path: &str) -> bool {
            self.calls.lock().unwrap().push(format!("file:{path}"));
            !self.failing.contains(path)
        }

        async fn remove_dir(&self, path: &str) -> bool {
            self.calls.lock().unwrap().push(format!("dir:{path}"));
            true
        }
    }

    #[tokio::test]
    async fn flat_directory_deletes_files_then_itself() {
        let tree = FakeTree::default().with_dir("20240101", &["a.log", "b.log", "c.log"], &[]);
        assert!(delete_tree(&tree, "/20240101/").await);

        let calls = tree.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[..3].iter().all(|c| c.starts_with("file:")));
        assert_eq!(calls[3], "dir:20240101");
    }

    #[tokio::test]
    async fn nested_directories_removed_deepest_first() {
        let tree = FakeTree::default()
            .with_dir("run", &["Data.lsf"], &["photos"])
            .with_dir("run/photos", &["1.jpg", "2.jpg"], &[]);
        assert!(delete_tree(&tree, "run").await);

        let calls = tree.calls();
        let dirs: Vec<_> = calls.iter().filter(|c| c.starts_with("dir:")).collect();
        assert_eq!(dirs, vec!["dir:run/photos", "dir:run"]);
        assert_eq!(calls.iter().filter(|c| c.starts_with("file:")).count(), 3);
    }

    #[tokio::test]
    async fn failed_file_delete_fails_closed() {
        let mut tree = FakeTree::default().with_dir("run", &["a", "b"], &[]);
        tree.failing.insert("run/a".into());
        assert!(!delete_tree(&tree, "run").await);
        assert!(tree.calls().iter().all(|c| c.starts_with("file:")));
    }

    #[tokio::test]
    async fn unlistable_directory_returns_false() {
        let tree = FakeTree::default();
        assert!(!delete_tree(&tree, "missing").await);
        assert!(tree.calls().is_empty());
    }

    proptest! {
        /// N files below one directory: N file deletes then exactly one
        /// directory delete, or no directory delete once any file fails.
        #[test]
        fn file_and_dir_delete_counts(n in 0usize..40, fail_at in proptest::option::of(0usize..40)) {
            let names: Vec<String> = (0..n).map(|i| format!("f{i:03}.log")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut tree = FakeTree::default().with_dir("d", &refs, &[]);
            let failing = fail_at.filter(|i| *i < n);
            if let Some(i) = failing {
                tree.failing.insert(format!("d/{}", names[i]));
            }

            let ok = tokio_test::block_on(delete_tree(&tree, "d"));
            let calls = tree.calls();
            let file_calls = calls.iter().filter(|c| c.starts_with("file:")).count();
            let dir_calls = calls.iter().filter(|c| c.starts_with("dir:")).count();

            prop_assert_eq!(file_calls, n);
            if failing.is_some() {
                prop_assert!(!ok);
                prop_assert_eq!(dir_calls, 0);
            } else {
                prop_assert!(ok);
                prop_assert_eq!(dir_calls, 1);
                prop_assert_eq!(calls.last().map(String::as_str), Some("dir:d"));
            }
        }
    }
}
