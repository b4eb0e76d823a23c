//! Cache Store (C1): per-folder on-disk key/value store for uids, headers,
//! flags and bodies, with optional at-rest encryption.
//!
//! Layout on disk, rooted at the application data directory, follows the
//! external interface contract directly:
//!
//! ```text
//! cache/<sha256(folder)>/uids
//! cache/<sha256(folder)>/headers/<uid>
//! cache/<sha256(folder)>/bodies/<uid>
//! cache/<sha256(folder)>/flags
//! ```
//!
//! Reads that fail for any reason (missing file, decode error, decrypt/
//! integrity failure) degrade to a miss; writes that fail are logged but
//! never fail the enclosing action, since the server remains the source of
//! truth (spec §4.1, §7).

pub mod crypto;

use crate::types::{Body, Flags, Folder, Header, Uid};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

#[derive(Clone)]
pub struct CacheConfig {
    pub root: PathBuf,
    pub encryption_password: Option<String>,
}

/// Filesystem-backed cache store, single-writer-per-folder by convention:
/// only the IMAP worker that owns a folder's active operation writes to it.
pub struct Cache {
    config: CacheConfig,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Cache { config }
    }

    fn folder_dir(&self, folder: &Folder) -> PathBuf {
        self.config
            .root
            .join("cache")
            .join(crypto::folder_hash(folder.as_str()))
    }

    async fn read_blob(&self, path: &Path) -> Option<Vec<u8>> {
        let raw = match fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cache read failed, treating as miss");
                return None;
            }
        };
        match &self.config.encryption_password {
            Some(pw) => match crypto::open(pw, &raw) {
                Ok(plain) => Some(plain),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cache decrypt/integrity failed, treating as miss");
                    None
                }
            },
            None => Some(raw),
        }
    }

    async fn write_blob(&self, path: &Path, plain: &[u8]) {
        let payload = match &self.config.encryption_password {
            Some(pw) => crypto::seal(pw, plain),
            None => plain.to_vec(),
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                warn!(path = %parent.display(), error = %e, "cache write: could not create directory");
                return;
            }
        }
        if let Err(e) = fs::write(path, payload).await {
            warn!(path = %path.display(), error = %e, "cache write failed");
        }
    }

    pub async fn get_uids(&self, folder: &Folder) -> Option<BTreeSet<Uid>> {
        let path = self.folder_dir(folder).join("uids");
        let blob = self.read_blob(&path).await?;
        serde_json::from_slice(&blob).ok()
    }

    pub async fn put_uids(&self, folder: &Folder, uids: &BTreeSet<Uid>) {
        let path = self.folder_dir(folder).join("uids");
        let blob = serde_json::to_vec(uids).expect("uid set is always serializable");
        self.write_blob(&path, &blob).await;
    }

    pub async fn get_header(&self, folder: &Folder, uid: Uid) -> Option<Header> {
        let path = self.folder_dir(folder).join("headers").join(uid.to_string());
        let blob = self.read_blob(&path).await?;
        serde_json::from_slice(&blob).ok()
    }

    pub async fn put_header(&self, folder: &Folder, header: &Header) {
        let path = self
            .folder_dir(folder)
            .join("headers")
            .join(header.uid.to_string());
        let blob = serde_json::to_vec(header).expect("header is always serializable");
        self.write_blob(&path, &blob).await;
    }

    async fn load_flags_table(&self, folder: &Folder) -> BTreeMap<Uid, Flags> {
        let path = self.folder_dir(folder).join("flags");
        match self.read_blob(&path).await {
            Some(blob) => serde_json::from_slice(&blob).unwrap_or_default(),
            None => BTreeMap::new(),
        }
    }

    async fn store_flags_table(&self, folder: &Folder, table: &BTreeMap<Uid, Flags>) {
        let path = self.folder_dir(folder).join("flags");
        let blob = serde_json::to_vec(table).expect("flags table is always serializable");
        self.write_blob(&path, &blob).await;
    }

    pub async fn get_flags(&self, folder: &Folder, uid: Uid) -> Option<Flags> {
        self.load_flags_table(folder).await.get(&uid).copied()
    }

    pub async fn put_flags(&self, folder: &Folder, uid: Uid, flags: Flags) {
        let mut table = self.load_flags_table(folder).await;
        table.insert(uid, flags);
        self.store_flags_table(folder, &table).await;
    }

    pub async fn get_body(&self, folder: &Folder, uid: Uid) -> Option<Body> {
        let path = self.folder_dir(folder).join("bodies").join(uid.to_string());
        let blob = self.read_blob(&path).await?;
        serde_json::from_slice(&blob).ok()
    }

    pub async fn put_body(&self, folder: &Folder, body: &Body) {
        let path = self
            .folder_dir(folder)
            .join("bodies")
            .join(body.uid.to_string());
        let blob = serde_json::to_vec(body).expect("body is always serializable");
        self.write_blob(&path, &blob).await;
    }

    /// Removes one uid's header, flags entry and body from the cache. Used
    /// when the server confirms a uid no longer exists in a folder (expunge,
    /// move-away) so stale entries do not linger as phantom hits.
    pub async fn remove_uid(&self, folder: &Folder, uid: Uid) {
        let dir = self.folder_dir(folder);
        let _ = fs::remove_file(dir.join("headers").join(uid.to_string())).await;
        let _ = fs::remove_file(dir.join("bodies").join(uid.to_string())).await;
        let mut table = self.load_flags_table(folder).await;
        if table.remove(&uid).is_some() {
            self.store_flags_table(folder, &table).await;
        }
    }

    /// Renames a folder's cache directory. No-op if the source is absent,
    /// matching the contract's stated noop-on-missing behavior.
    pub async fn rename(&self, old: &Folder, new: &Folder) {
        let old_dir = self.folder_dir(old);
        if fs::metadata(&old_dir).await.is_err() {
            return;
        }
        let new_dir = self.folder_dir(new);
        if let Some(parent) = new_dir.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        if let Err(e) = fs::rename(&old_dir, &new_dir).await {
            warn!(from = %old, to = %new, error = %e, "cache folder rename failed");
        }
    }

    /// Heals legacy duplicate rows that might exist under an earlier id
    /// scheme by removing every uid in `folder` whose stored body raw bytes
    /// hash to a value already seen once. wrenmail ships with UID as its
    /// only identity scheme, so nothing on the sync path calls this; it
    /// exists so a future migration has somewhere to hook in, exercised by
    /// its own test.
    pub async fn dedupe_by_raw_hash(&self, folder: &Folder) -> usize {
        use sha2::{Digest, Sha256};
        let Some(uids) = self.get_uids(folder).await else {
            return 0;
        };
        let mut seen = std::collections::HashSet::new();
        let mut removed = 0;
        for uid in uids {
            let Some(body) = self.get_body(folder, uid).await else {
                continue;
            };
            let hash = Sha256::digest(&body.raw);
            if !seen.insert(hash) {
                self.remove_uid(folder, uid).await;
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_ts, Address};

    fn header(uid: Uid) -> Header {
        Header {
            uid,
            message_id: Some(format!("<{uid}@x.test>")),
            in_reply_to: None,
            references: vec![],
            date: Some(chrono::DateTime::from_timestamp(now_ts(), 0).unwrap()),
            date_raw: None,
            from: vec![Address { display_name: None, mailbox: "a@x.test".into() }],
            reply_to: vec![],
            to: vec![],
            cc: vec![],
            bcc: vec![],
            subject: Some("hi".into()),
            has_attachments: false,
            raw_header_text: String::new(),
        }
    }

    fn cache(dir: &tempfile::TempDir, encrypted: bool) -> Cache {
        Cache::new(CacheConfig {
            root: dir.path().to_path_buf(),
            encryption_password: encrypted.then(|| "s3cret".to_string()),
        })
    }

    #[tokio::test]
    async fn header_round_trips_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, false);
        let folder = Folder::from("INBOX");
        cache.put_header(&folder, &header(1)).await;
        let got = cache.get_header(&folder, 1).await.unwrap();
        assert_eq!(got.subject, Some("hi".to_string()));
    }

    #[tokio::test]
    async fn header_round_trips_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, true);
        let folder = Folder::from("INBOX");
        cache.put_header(&folder, &header(7)).await;
        let got = cache.get_header(&folder, 7).await.unwrap();
        assert_eq!(got.uid, 7);
    }

    #[tokio::test]
    async fn missing_uid_is_a_miss_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, false);
        let folder = Folder::from("INBOX");
        assert!(cache.get_header(&folder, 404).await.is_none());
    }

    #[tokio::test]
    async fn flags_put_get_roundtrip_and_isolated_per_uid() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, false);
        let folder = Folder::from("INBOX");
        cache.put_flags(&folder, 1, Flags::SEEN).await;
        cache.put_flags(&folder, 2, Flags::FLAGGED).await;
        assert_eq!(cache.get_flags(&folder, 1).await, Some(Flags::SEEN));
        assert_eq!(cache.get_flags(&folder, 2).await, Some(Flags::FLAGGED));
    }

    #[tokio::test]
    async fn remove_uid_clears_header_flags_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, false);
        let folder = Folder::from("INBOX");
        cache.put_header(&folder, &header(9)).await;
        cache.put_flags(&folder, 9, Flags::SEEN).await;
        cache.remove_uid(&folder, 9).await;
        assert!(cache.get_header(&folder, 9).await.is_none());
        assert!(cache.get_flags(&folder, 9).await.is_none());
    }

    #[tokio::test]
    async fn rename_is_noop_when_source_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, false);
        cache.rename(&Folder::from("Ghost"), &Folder::from("Ghost2")).await;
    }

    #[tokio::test]
    async fn uids_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, false);
        let folder = Folder::from("INBOX");
        let uids: BTreeSet<Uid> = [1, 2, 3].into_iter().collect();
        cache.put_uids(&folder, &uids).await;
        assert_eq!(cache.get_uids(&folder).await, Some(uids));
    }

    #[tokio::test]
    async fn dedupe_removes_repeated_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, false);
        let folder = Folder::from("INBOX");
        let uids: BTreeSet<Uid> = [1, 2].into_iter().collect();
        cache.put_uids(&folder, &uids).await;
        let mut b1 = body_for(1);
        let mut b2 = body_for(2);
        b1.raw = b"same bytes".to_vec();
        b2.raw = b"same bytes".to_vec();
        cache.put_body(&folder, &b1).await;
        cache.put_body(&folder, &b2).await;
        let removed = cache.dedupe_by_raw_hash(&folder).await;
        assert_eq!(removed, 1);
    }

    fn body_for(uid: Uid) -> Body {
        Body {
            uid,
            raw: vec![],
            plain_text: None,
            html: None,
            parts: vec![],
            format_flowed: false,
            html_parsed: false,
        }
    }

    #[tokio::test]
    async fn rename_moves_folder_contents() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, false);
        let old = Folder::from("Drafts");
        cache.put_header(&old, &header(1)).await;
        let new = Folder::from("Drafts2");
        cache.rename(&old, &new).await;
        assert!(cache.get_header(&new, 1).await.is_some());
        assert!(cache.get_header(&old, 1).await.is_none());
    }
}
