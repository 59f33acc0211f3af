//!
//! # Folder traversal
//! What a single worker process does: walk the shared folder depth-first in
//! its strategy's order, fetch what is missing locally and publish its
//! counters after every listing and every file.
//!

use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use log::{error, info, warn};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::download::progress::{Counters, FileProgressStore, ProgressStore, WorkerKey};
use crate::download::strategy::Strategy;
use crate::download::util::local_file_size;
use crate::remote::{
    join_path, list_all, DropboxClient, Entry, EntryKind, RemoteError, RemoteStorage, SharedFolder,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraversalReport {
    pub counters: Counters,
    pub fetched: u64,
    pub skipped: u64,
    pub errors: u64,
}

pub struct Traversal<'a> {
    remote: &'a dyn RemoteStorage,
    store: &'a dyn ProgressStore,
    strategy: Strategy,
    key: WorkerKey,
    report: TraversalReport,
}

impl<'a> Traversal<'a> {
    pub fn new(
        remote: &'a dyn RemoteStorage,
        store: &'a dyn ProgressStore,
        strategy: Strategy,
        pid: u32,
    ) -> Self {
        Self {
            remote,
            store,
            strategy,
            key: WorkerKey::new(strategy, pid),
            report: TraversalReport::default(),
        }
    }

    /// Walk the whole shared folder into `destination`. Only a failure of the
    /// root folder is an error; everything below it is reported and skipped.
    pub async fn run(mut self, destination: &Path) -> Result<TraversalReport, RemoteError> {
        self.publish();
        self.walk(String::new(), destination.to_path_buf(), true).await?;
        self.publish();

        info!(
            "{} traversal done: {}/{} files ({} fetched, {} skipped, {} errors)",
            self.strategy,
            self.report.counters.downloaded,
            self.report.counters.total,
            self.report.fetched,
            self.report.skipped,
            self.report.errors
        );
        Ok(self.report)
    }

    fn walk(&mut self, remote_path: String, local: PathBuf, root: bool) -> BoxFuture<'_, Result<(), RemoteError>> {
        async move {
            if let Err(err) = fs::create_dir_all(&local).await {
                if root {
                    return Err(err.into());
                }
                self.fail(&remote_path, &err);
                return Ok(());
            }

            info!("Listing folder contents at path: '{}'", remote_path);
            let mut entries = match list_all(self.remote, &remote_path).await {
                Ok(entries) => entries,
                Err(err) if root => return Err(err),
                Err(err) => {
                    self.fail(&remote_path, &err);
                    return Ok(());
                }
            };

            self.report.counters.total += entries.iter().filter(|e| e.is_file()).count() as u64;
            self.publish();

            self.strategy.arrange(&mut entries);

            for entry in entries {
                let child_path = join_path(&remote_path, &entry.name);
                if !is_plain_name(&entry.name) {
                    self.fail(&child_path, &"refusing unsafe entry name");
                    continue;
                }
                let child_local = local.join(&entry.name);

                match entry.kind {
                    EntryKind::Folder => self.walk(child_path, child_local, false).await?,
                    EntryKind::File => {
                        self.visit_file(&entry, &child_path, &child_local).await;
                        self.publish();
                    }
                }
            }

            Ok(())
        }
        .boxed()
    }

    async fn visit_file(&mut self, entry: &Entry, remote_path: &str, local: &Path) {
        let expected = entry.size.unwrap_or(0);
        if local_file_size(local) == Some(expected) {
            info!("Skipping existing file: {}", remote_path);
            self.report.skipped += 1;
            self.report.counters.downloaded += 1;
            return;
        }

        info!("Downloading file: {} to {:?}", remote_path, local);
        match self.fetch(remote_path, local).await {
            // A short file stays on disk and is fetched again next run.
            Ok(written) if entry.size.is_some_and(|size| size != written) => {
                self.fail(remote_path, &format!("transfer incomplete: expected {expected} bytes, got {written}"));
            }
            Ok(_) => {
                self.report.fetched += 1;
                self.report.counters.downloaded += 1;
            }
            Err(err) => self.fail(remote_path, &err),
        }
    }

    async fn fetch(&self, remote_path: &str, local: &Path) -> Result<u64, RemoteError> {
        let mut stream = self.remote.fetch_file(remote_path).await?;
        let mut file = fs::File::create(local).await?;
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }

    fn fail(&mut self, path: &str, err: &dyn std::fmt::Display) {
        // Error records are the worker's stderr protocol.
        error!("{}: {}", path, err);
        self.report.errors += 1;
    }

    fn publish(&self) {
        if let Err(err) = self.store.write(&self.key, self.report.counters) {
            warn!("Failed to publish progress: {}", err);
        }
    }
}

/// Worker process body: traverse `link` into `destination` under this
/// process's pid.
pub async fn run_worker(
    token: &str,
    link: &str,
    destination: &Path,
    strategy: Strategy,
    progress_dir: &Path,
) -> Result<TraversalReport, RemoteError> {
    let remote = SharedFolder::new(DropboxClient::new(token)?, link);
    let store = FileProgressStore::new(progress_dir);
    let pid = std::process::id();

    info!("Starting {} worker pid={} for {}", strategy, pid, link);
    Traversal::new(&remote, &store, strategy, pid).run(destination).await
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{ByteStream, ListPage};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, BTreeSet, HashSet};
    use tempfile::TempDir;

    const PAGE_SIZE: usize = 3;

    /// In-memory shared folder keyed by full remote path.
    struct MemoryRemote {
        files: BTreeMap<String, Vec<u8>>,
        broken: HashSet<String>,
        truncated: HashSet<String>,
        fetched: Mutex<Vec<String>>,
    }

    impl MemoryRemote {
        fn new(files: &[(&str, &str)]) -> Self {
            Self {
                files: files
                    .iter()
                    .map(|(path, body)| (path.to_string(), body.as_bytes().to_vec()))
                    .collect(),
                broken: HashSet::new(),
                truncated: HashSet::new(),
                fetched: Mutex::new(Vec::new()),
            }
        }

        fn children(&self, folder: &str) -> Option<Vec<Entry>> {
            let prefix = format!("{}/", folder);
            let mut folders = BTreeSet::new();
            let mut entries = Vec::new();
            let mut found = folder.is_empty();

            for (path, body) in &self.files {
                let Some(rest) = path.strip_prefix(&prefix) else { continue };
                found = true;
                match rest.split_once('/') {
                    Some((dir, _)) => {
                        if folders.insert(dir.to_string()) {
                            entries.push(Entry::folder(dir));
                        }
                    }
                    None => entries.push(Entry::file(rest, body.len() as u64)),
                }
            }
            found.then_some(entries)
        }

        fn page(entries: &[Entry], folder: &str, offset: usize) -> ListPage {
            let end = (offset + PAGE_SIZE).min(entries.len());
            ListPage {
                entries: entries[offset..end].to_vec(),
                cursor: format!("{}|{}", folder, end),
                has_more: end < entries.len(),
            }
        }

        fn fetched(&self) -> Vec<String> {
            self.fetched.lock().clone()
        }
    }

    #[async_trait]
    impl RemoteStorage for MemoryRemote {
        async fn list_folder(&self, path: &str) -> Result<ListPage, RemoteError> {
            let entries = self.children(path).ok_or_else(|| RemoteError::Status {
                status: 409,
                body: "path/not_found/".to_string(),
            })?;
            Ok(Self::page(&entries, path, 0))
        }

        async fn list_folder_continue(&self, cursor: &str) -> Result<ListPage, RemoteError> {
            let (folder, offset) = cursor.rsplit_once('|').unwrap_or((cursor, "0"));
            let entries = self.children(folder).unwrap_or_default();
            Ok(Self::page(&entries, folder, offset.parse().unwrap_or(0)))
        }

        async fn fetch_file(&self, path: &str) -> Result<ByteStream, RemoteError> {
            self.fetched.lock().push(path.to_string());
            if self.broken.contains(path) {
                return Err(RemoteError::Status { status: 500, body: "boom".to_string() });
            }
            let body = self.files.get(path).cloned().unwrap_or_default();
            let (head, tail) = body.split_at(body.len() / 2);
            let mut chunks = vec![Ok(Bytes::copy_from_slice(head))];
            if !self.truncated.contains(path) {
                chunks.push(Ok(Bytes::copy_from_slice(tail)));
            }
            Ok(futures_util::stream::iter(chunks).boxed())
        }
    }

    fn ten_files() -> MemoryRemote {
        MemoryRemote::new(&[
            ("/a.txt", "alpha"),
            ("/b.txt", "bravo"),
            ("/c.txt", "charlie"),
            ("/docs/d.txt", "delta"),
            ("/docs/e.txt", "echo"),
            ("/docs/deep/f.txt", "foxtrot"),
            ("/docs/deep/g.txt", "golf"),
            ("/media/h.bin", "hotel"),
            ("/media/i.bin", "india"),
            ("/media/j.bin", "juliett"),
        ])
    }

    async fn traverse(
        remote: &MemoryRemote,
        store: &FileProgressStore,
        strategy: Strategy,
        dest: &Path,
    ) -> TraversalReport {
        Traversal::new(remote, store, strategy, 77).run(dest).await.unwrap()
    }

    #[tokio::test]
    async fn should_download_whole_tree() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("dest");
        let store = FileProgressStore::new(temp.path().join("progress"));
        let remote = ten_files();

        let report = traverse(&remote, &store, Strategy::Random, &dest).await;

        assert_eq!(report.counters, Counters::new(10, 10));
        assert_eq!(report.fetched, 10);
        assert_eq!(std::fs::read_to_string(dest.join("docs/deep/f.txt")).unwrap(), "foxtrot");
        assert_eq!(std::fs::read_to_string(dest.join("media/j.bin")).unwrap(), "juliett");
        assert_eq!(
            store.read(&WorkerKey::new(Strategy::Random, 77)),
            Some(Counters::new(10, 10))
        );
    }

    #[tokio::test]
    async fn should_skip_everything_on_rerun() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("dest");
        let store = FileProgressStore::new(temp.path().join("progress"));
        let remote = ten_files();

        traverse(&remote, &store, Strategy::Forward, &dest).await;
        let first_fetches = remote.fetched().len();
        let report = traverse(&remote, &store, Strategy::Forward, &dest).await;

        assert_eq!(remote.fetched().len(), first_fetches);
        assert_eq!(report.skipped, 10);
        assert_eq!(report.counters, Counters::new(10, 10));
    }

    #[tokio::test]
    async fn should_fetch_only_missing_files_after_pause() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("dest");
        let store = FileProgressStore::new(temp.path().join("progress"));
        let remote = ten_files();

        // Half the tree made it to disk before the pause, one file cut short.
        for (path, body) in remote.files.iter().take(5) {
            let local = dest.join(path.trim_start_matches('/'));
            std::fs::create_dir_all(local.parent().unwrap()).unwrap();
            std::fs::write(local, body).unwrap();
        }
        std::fs::write(dest.join("a.txt"), "alp").unwrap();

        let report = traverse(&remote, &store, Strategy::Reverse, &dest).await;

        let mut fetched = remote.fetched();
        fetched.sort();
        let mut expected: Vec<String> = remote.files.keys().skip(5).cloned().collect();
        expected.push("/a.txt".to_string());
        expected.sort();
        assert_eq!(fetched, expected);
        assert_eq!(report.skipped, 4);
        assert_eq!(report.counters, Counters::new(10, 10));
        assert_eq!(std::fs::read_to_string(dest.join("a.txt")).unwrap(), "alpha");
    }

    #[tokio::test]
    async fn should_walk_reverse_opposite_to_forward() {
        let temp = TempDir::new().unwrap();
        let store = FileProgressStore::new(temp.path().join("progress"));

        let forward = ten_files();
        traverse(&forward, &store, Strategy::Forward, &temp.path().join("f")).await;
        let reverse = ten_files();
        traverse(&reverse, &store, Strategy::Reverse, &temp.path().join("r")).await;

        let mut reversed = reverse.fetched();
        reversed.reverse();
        assert_eq!(forward.fetched(), reversed);
        assert_eq!(forward.fetched()[0], "/a.txt");
    }

    #[tokio::test]
    async fn should_continue_past_failed_files() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("dest");
        let store = FileProgressStore::new(temp.path().join("progress"));
        let mut remote = ten_files();
        remote.broken.insert("/docs/e.txt".to_string());

        let report = traverse(&remote, &store, Strategy::Forward, &dest).await;

        assert_eq!(report.errors, 1);
        assert_eq!(report.counters, Counters::new(10, 9));
        assert!(dest.join("media/j.bin").exists());
    }

    #[tokio::test]
    async fn should_not_count_short_transfers() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("dest");
        let store = FileProgressStore::new(temp.path().join("progress"));
        let mut remote = ten_files();
        remote.truncated.insert("/c.txt".to_string());

        let report = traverse(&remote, &store, Strategy::Forward, &dest).await;

        assert_eq!(report.errors, 1);
        assert_eq!(report.fetched, 9);
        assert_eq!(report.counters, Counters::new(10, 9));
        assert_eq!(local_file_size(&dest.join("c.txt")), Some(3));

        remote.truncated.clear();
        let report = traverse(&remote, &store, Strategy::Forward, &dest).await;
        assert_eq!(report.fetched, 1);
        assert_eq!(report.counters, Counters::new(10, 10));
        assert_eq!(std::fs::read_to_string(dest.join("c.txt")).unwrap(), "charlie");
    }

    #[tokio::test]
    async fn should_fail_when_root_is_unlistable() {
        let temp = TempDir::new().unwrap();
        let store = FileProgressStore::new(temp.path().join("progress"));

        struct Unreachable;

        #[async_trait]
        impl RemoteStorage for Unreachable {
            async fn list_folder(&self, _path: &str) -> Result<ListPage, RemoteError> {
                Err(RemoteError::Status { status: 401, body: "invalid_access_token".to_string() })
            }

            async fn list_folder_continue(&self, _cursor: &str) -> Result<ListPage, RemoteError> {
                unreachable!()
            }

            async fn fetch_file(&self, _path: &str) -> Result<ByteStream, RemoteError> {
                unreachable!()
            }
        }

        let result = Traversal::new(&Unreachable, &store, Strategy::Forward, 1)
            .run(&temp.path().join("dest"))
            .await;
        assert!(matches!(result, Err(RemoteError::Status { status: 401, .. })));
    }

    #[test]
    fn should_reject_path_escapes() {
        assert!(is_plain_name("report.pdf"));
        assert!(!is_plain_name(".."));
        assert!(!is_plain_name("a/b"));
        assert!(!is_plain_name(""));
    }
}
