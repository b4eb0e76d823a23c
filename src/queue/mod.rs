//! Offline Queue (C3): durable FIFO for pending drafts, outbox messages and
//! compose backups (spec §4.3). Each sub-queue is a directory of files named
//! by a monotonic numeric prefix; draining is atomic via a rename into a
//! sentinel directory so a crash mid-drain never loses or duplicates an
//! entry.

use crate::types::{OfflineMessage, OfflineMessageKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tracing::warn;

struct SubQueue {
    dir: PathBuf,
    next: AtomicU64,
}

impl SubQueue {
    async fn open(dir: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&dir).await?;
        let mut max_seen = 0u64;
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(n) = parse_index(&entry.file_name().to_string_lossy()) {
                max_seen = max_seen.max(n + 1);
            }
        }
        Ok(SubQueue { dir, next: AtomicU64::new(max_seen) })
    }

    async fn push(&self, blob: &[u8]) -> std::io::Result<()> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("{n:020}.eml"));
        fs::write(&path, blob).await
    }

    /// Atomically drains all entries: renames the live directory aside,
    /// recreates an empty one in its place, then reads the aside copy at
    /// leisure and removes it. Entries are returned oldest-first.
    async fn drain(&self) -> std::io::Result<Vec<Vec<u8>>> {
        let sentinel = self.dir.with_extension("draining");
        if fs::metadata(&sentinel).await.is_ok() {
            // a previous drain was interrupted before cleanup; finish it
            // rather than losing those entries.
            return self.drain_from(&sentinel).await;
        }
        if fs::rename(&self.dir, &sentinel).await.is_err() {
            // nothing to drain
            fs::create_dir_all(&self.dir).await?;
            return Ok(Vec::new());
        }
        fs::create_dir_all(&self.dir).await?;
        self.drain_from(&sentinel).await
    }

    async fn drain_from(&self, sentinel: &Path) -> std::io::Result<Vec<Vec<u8>>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(sentinel).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(n) = parse_index(&entry.file_name().to_string_lossy()) {
                names.push((n, entry.path()));
            }
        }
        names.sort_by_key(|(n, _)| *n);

        let mut blobs = Vec::with_capacity(names.len());
        for (_, path) in &names {
            match fs::read(path).await {
                Ok(b) => blobs.push(b),
                Err(e) => warn!(path = %path.display(), error = %e, "offline queue entry unreadable during drain"),
            }
        }
        fs::remove_dir_all(sentinel).await.ok();
        Ok(blobs)
    }
}

fn parse_index(filename: &str) -> Option<u64> {
    filename.strip_suffix(".eml")?.parse().ok()
}

pub struct OfflineQueue {
    drafts: Arc<SubQueue>,
    outbox: Arc<SubQueue>,
    compose: Arc<SubQueue>,
}

impl OfflineQueue {
    pub async fn open(app_dir: &Path) -> std::io::Result<Self> {
        let base = app_dir.join("queue");
        Ok(OfflineQueue {
            drafts: Arc::new(SubQueue::open(base.join("drafts")).await?),
            outbox: Arc::new(SubQueue::open(base.join("outbox")).await?),
            compose: Arc::new(SubQueue::open(base.join("compose")).await?),
        })
    }

    fn queue_for(&self, kind: OfflineMessageKind) -> &SubQueue {
        match kind {
            OfflineMessageKind::Draft => &self.drafts,
            OfflineMessageKind::Outbox => &self.outbox,
            OfflineMessageKind::ComposeBackup => &self.compose,
        }
    }

    pub async fn push(&self, msg: OfflineMessage) -> std::io::Result<()> {
        self.queue_for(msg.kind).push(&msg.blob).await
    }

    pub async fn push_draft(&self, blob: Vec<u8>) -> std::io::Result<()> {
        self.drafts.push(&blob).await
    }

    pub async fn push_outbox(&self, blob: Vec<u8>) -> std::io::Result<()> {
        self.outbox.push(&blob).await
    }

    pub async fn push_compose_backup(&self, blob: Vec<u8>) -> std::io::Result<()> {
        self.compose.push(&blob).await
    }

    pub async fn pop_drafts(&self) -> std::io::Result<Vec<Vec<u8>>> {
        self.drafts.drain().await
    }

    pub async fn pop_outbox(&self) -> std::io::Result<Vec<Vec<u8>>> {
        self.outbox.drain().await
    }

    pub async fn pop_compose_backups(&self) -> std::io::Result<Vec<Vec<u8>>> {
        self.compose.drain().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drains_in_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let q = OfflineQueue::open(dir.path()).await.unwrap();
        q.push_draft(b"a".to_vec()).await.unwrap();
        q.push_draft(b"b".to_vec()).await.unwrap();
        let drained = q.pop_drafts().await.unwrap();
        assert_eq!(drained, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn drain_is_destructive_and_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let q = OfflineQueue::open(dir.path()).await.unwrap();
        q.push_outbox(b"only".to_vec()).await.unwrap();
        assert_eq!(q.pop_outbox().await.unwrap(), vec![b"only".to_vec()]);
        assert!(q.pop_outbox().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sub_queues_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let q = OfflineQueue::open(dir.path()).await.unwrap();
        q.push_draft(b"d".to_vec()).await.unwrap();
        q.push_outbox(b"o".to_vec()).await.unwrap();
        assert_eq!(q.pop_drafts().await.unwrap(), vec![b"d".to_vec()]);
        assert_eq!(q.pop_outbox().await.unwrap(), vec![b"o".to_vec()]);
    }

    #[tokio::test]
    async fn reopening_preserves_monotonic_ordering() {
        let dir = tempfile::tempdir().unwrap();
        {
            let q = OfflineQueue::open(dir.path()).await.unwrap();
            q.push_draft(b"first".to_vec()).await.unwrap();
        }
        let q = OfflineQueue::open(dir.path()).await.unwrap();
        q.push_draft(b"second".to_vec()).await.unwrap();
        let drained = q.pop_drafts().await.unwrap();
        assert_eq!(drained, vec![b"first".to_vec(), b"second".to_vec()]);
    }
}
