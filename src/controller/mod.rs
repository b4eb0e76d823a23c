//! Controller (C9): owns view state (current folder, selection, sort/filter,
//! compose draft, search query) and translates user intents into exactly
//! one [`Request`] or [`Action`] against the IMAP Manager, reconciling
//! selection after every mutation (spec §4.9).

use crate::cache::Cache;
use crate::errors::AppResult;
use crate::imap::worker::ImapManagerHandle;
use crate::queue::OfflineQueue;
use crate::smtp::{ComposeRequest, SmtpManager};
use crate::types::{Action, ActionKind, Address, Flags, Folder, Header, PrefetchLevel, Request, Uid};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Per-folder sort/filter mode (spec §4.9): orthogonal to cache state, kept
/// as one field on [`ViewState`] the way the spec describes it, even though
/// it splits into an ordering key (`SortMode`) and a display predicate
/// (`FilterMode`) here for clarity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortMode {
    DateDesc,
    DateAsc,
    NameAsc,
    NameDesc,
    SubjectAsc,
    SubjectDesc,
    UnseenAsc,
    UnseenDesc,
    AttachmentAsc,
    AttachmentDesc,
}

impl Default for SortMode {
    fn default() -> Self {
        SortMode::DateDesc
    }
}

impl SortMode {
    fn is_descending(self) -> bool {
        matches!(
            self,
            SortMode::DateDesc | SortMode::NameDesc | SortMode::SubjectDesc | SortMode::UnseenDesc | SortMode::AttachmentDesc
        )
    }
}

/// A single comparable projection of whatever field the active `SortMode`
/// orders by. Every key built during one `display_uids` pass comes from the
/// same mode, so only same-variant comparisons ever happen.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    Date(i64),
    Text(String),
    Bool(bool),
}

fn sort_key(sort: SortMode, uid: Uid, header: Option<&Header>, unseen: bool) -> (SortKey, Uid) {
    let key = match sort {
        SortMode::DateAsc | SortMode::DateDesc => {
            SortKey::Date(header.and_then(|h| h.date).map(|d| d.timestamp()).unwrap_or(i64::MIN))
        }
        SortMode::NameAsc | SortMode::NameDesc => SortKey::Text(
            header
                .and_then(|h| h.from.first())
                .map(|a| a.display_name.clone().unwrap_or_else(|| a.mailbox.clone()))
                .unwrap_or_default()
                .to_ascii_lowercase(),
        ),
        SortMode::SubjectAsc | SortMode::SubjectDesc => {
            SortKey::Text(header.and_then(|h| h.subject.clone()).unwrap_or_default().to_ascii_lowercase())
        }
        SortMode::UnseenAsc | SortMode::UnseenDesc => SortKey::Bool(!unseen),
        SortMode::AttachmentAsc | SortMode::AttachmentDesc => {
            SortKey::Bool(header.map(|h| h.has_attachments).unwrap_or(false))
        }
    };
    (key, uid)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FilterMode {
    #[default]
    None,
    UnseenOnly,
    AttachmentOnly,
    /// Only uids sharing the currently selected message's calendar date.
    CurrentDateOnly,
    /// Only uids sharing the currently selected message's sender.
    CurrentNameOnly,
    /// Only uids sharing the currently selected message's subject.
    CurrentSubjectOnly,
}

/// A monotonic counter bumped on every mutation to a version-tracked input.
/// `displayUids` recomputation is keyed on these so the controller never
/// recomputes the list unless something it depends on actually changed
/// (spec §3 invariant on `displayUids` purity).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Versions {
    uids: u64,
    flags: u64,
    filter: u64,
}

pub struct ComposeDraft {
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub subject: String,
    pub body: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

struct ViewState {
    folder: Folder,
    selection: Option<Uid>,
    sort: SortMode,
    filter: FilterMode,
    header_uids: BTreeSet<Uid>,
    header_cache: std::collections::HashMap<Uid, Header>,
    versions: Versions,
    compose: Option<ComposeDraft>,
}

pub struct Controller {
    state: Mutex<ViewState>,
    imap: ImapManagerHandle,
    smtp: Arc<SmtpManager>,
    queue: Arc<OfflineQueue>,
    cache: Arc<Cache>,
    from_address: Address,
    sent_folder: Folder,
    trash_folder: Folder,
    client_store_sent: bool,
    /// The configured aggressiveness of background fetching (spec §4.5
    /// prefetch policy). `select()` consults this to decide whether to
    /// prefetch neighbouring bodies; `run_full_sync` is only ever spawned
    /// by the caller when this is `FullSync`.
    prefetch_level: PrefetchLevel,
}

impl Controller {
    pub fn new(
        imap: ImapManagerHandle,
        smtp: Arc<SmtpManager>,
        queue: Arc<OfflineQueue>,
        cache: Arc<Cache>,
        from_address: Address,
        inbox: Folder,
        sent_folder: Folder,
        trash_folder: Folder,
        client_store_sent: bool,
        prefetch_level: PrefetchLevel,
    ) -> Self {
        Controller {
            state: Mutex::new(ViewState {
                folder: inbox,
                selection: None,
                sort: SortMode::default(),
                filter: FilterMode::default(),
                header_uids: BTreeSet::new(),
                header_cache: std::collections::HashMap::new(),
                versions: Versions::default(),
                compose: None,
            }),
            imap,
            smtp,
            queue,
            cache,
            from_address,
            sent_folder,
            trash_folder,
            client_store_sent,
            prefetch_level,
        }
    }

    pub async fn switch_folder(&self, folder: Folder) {
        let mut state = self.state.lock().await;
        state.folder = folder.clone();
        state.selection = None;
        state.header_uids.clear();
        state.header_cache.clear();
        state.versions.uids += 1;
        drop(state);
        self.imap.async_request(Request {
            folder: Some(folder),
            prefetch_level: PrefetchLevel::CurrentView,
            get_folders: false,
            get_uids: true,
            get_headers: BTreeSet::new(),
            get_flags: BTreeSet::new(),
            get_bodies: BTreeSet::new(),
            process_html: false,
        });
    }

    pub async fn set_filter(&self, filter: FilterMode) {
        let mut state = self.state.lock().await;
        state.filter = filter;
        state.versions.filter += 1;
    }

    pub async fn ingest_uids(&self, uids: BTreeSet<Uid>) {
        let mut state = self.state.lock().await;
        state.header_uids = uids;
        state.versions.uids += 1;
        self.reconcile_selection(&mut state);
    }

    pub async fn ingest_headers(&self, headers: Vec<Header>) {
        let mut state = self.state.lock().await;
        for h in headers {
            state.header_cache.insert(h.uid, h);
        }
        state.versions.flags += 1;
    }

    /// The ordered, filtered uid list the UI should render (spec §4.9, §8
    /// `displayUids` testable property). Unseen filtering reads from the
    /// Flags cache rather than `ViewState`, since the Cache Store (C1), not
    /// the controller, is the source of truth for flags (spec §4.1); the
    /// sort key itself is read from the header cache so the order actually
    /// reflects date/name/subject rather than raw uid order.
    pub async fn display_uids(&self) -> Vec<Uid> {
        let (folder, candidates, sort, filter, selected_header) = {
            let state = self.state.lock().await;
            let selected_header = state.selection.and_then(|uid| state.header_cache.get(&uid).cloned());
            (
                state.folder.clone(),
                state.header_uids.iter().copied().collect::<Vec<_>>(),
                state.sort,
                state.filter,
                selected_header,
            )
        };

        let mut uids = Vec::with_capacity(candidates.len());
        for uid in candidates {
            if !self.passes_filter(&folder, uid, filter, selected_header.as_ref()).await {
                continue;
            }
            uids.push(uid);
        }

        let mut keyed = Vec::with_capacity(uids.len());
        for uid in uids {
            let header = self.state.lock().await.header_cache.get(&uid).cloned();
            let unseen = !self.cache.get_flags(&folder, uid).await.unwrap_or_default().contains(Flags::SEEN);
            keyed.push((uid, header, unseen));
        }

        keyed.sort_by(|(uid_a, header_a, unseen_a), (uid_b, header_b, unseen_b)| {
            sort_key(sort, *uid_a, header_a.as_ref(), *unseen_a)
                .cmp(&sort_key(sort, *uid_b, header_b.as_ref(), *unseen_b))
        });
        let mut result: Vec<Uid> = keyed.into_iter().map(|(uid, _, _)| uid).collect();
        if sort.is_descending() {
            result.reverse();
        }
        result
    }

    async fn passes_filter(
        &self,
        folder: &Folder,
        uid: Uid,
        filter: FilterMode,
        selected_header: Option<&Header>,
    ) -> bool {
        match filter {
            FilterMode::None => true,
            FilterMode::UnseenOnly => {
                let flags = self.cache.get_flags(folder, uid).await.unwrap_or_default();
                !flags.contains(Flags::SEEN)
            }
            FilterMode::AttachmentOnly => {
                let header = self.state.lock().await.header_cache.get(&uid).cloned();
                header.map(|h| h.has_attachments).unwrap_or(false)
            }
            FilterMode::CurrentDateOnly => {
                let Some(selected) = selected_header else { return true };
                let Some(selected_date) = selected.date else { return true };
                let header = self.state.lock().await.header_cache.get(&uid).cloned();
                header.and_then(|h| h.date).map(|d| d.date_naive() == selected_date.date_naive()).unwrap_or(false)
            }
            FilterMode::CurrentNameOnly => {
                let Some(selected) = selected_header else { return true };
                let Some(selected_from) = selected.from.first() else { return true };
                let header = self.state.lock().await.header_cache.get(&uid).cloned();
                header
                    .and_then(|h| h.from.first().cloned())
                    .map(|a| a.mailbox.eq_ignore_ascii_case(&selected_from.mailbox))
                    .unwrap_or(false)
            }
            FilterMode::CurrentSubjectOnly => {
                let Some(selected) = selected_header else { return true };
                let Some(selected_subject) = &selected.subject else { return true };
                let header = self.state.lock().await.header_cache.get(&uid).cloned();
                header.and_then(|h| h.subject).map(|s| s == *selected_subject).unwrap_or(false)
            }
        }
    }

    fn reconcile_selection(&self, state: &mut ViewState) {
        if let Some(sel) = state.selection {
            if !state.header_uids.contains(&sel) {
                state.selection = state.header_uids.iter().next_back().copied();
            }
        }
    }

    pub async fn select(&self, uid: Option<Uid>) {
        let mut state = self.state.lock().await;
        if let Some(uid) = uid {
            if !state.header_uids.contains(&uid) {
                return;
            }
        }
        state.selection = uid;
        if let Some(uid) = uid {
            let folder = state.folder.clone();
            drop(state);
            self.imap.async_request(Request {
                folder: Some(folder.clone()),
                prefetch_level: PrefetchLevel::CurrentMessage,
                get_folders: false,
                get_uids: false,
                get_headers: BTreeSet::new(),
                get_flags: BTreeSet::new(),
                get_bodies: BTreeSet::from([uid]),
                process_html: true,
            });

            if self.prefetch_level >= PrefetchLevel::CurrentView {
                self.prefetch_neighbours(&folder, uid).await;
            }
        }
    }

    /// `CurrentView` prefetch policy (spec §4.5): the uids immediately
    /// before and after the selection in display order, skipping any whose
    /// body is already cached.
    async fn prefetch_neighbours(&self, folder: &Folder, uid: Uid) {
        let ordered = self.display_uids().await;
        let neighbours = neighbour_uids(&ordered, uid);

        let mut missing = BTreeSet::new();
        for n in neighbours {
            if self.cache.get_body(folder, n).await.is_none() {
                missing.insert(n);
            }
        }
        if missing.is_empty() {
            return;
        }

        self.imap.async_request(Request {
            folder: Some(folder.clone()),
            prefetch_level: PrefetchLevel::CurrentView,
            get_folders: false,
            get_uids: false,
            get_headers: BTreeSet::new(),
            get_flags: BTreeSet::new(),
            get_bodies: missing,
            process_html: true,
        });
    }

    pub async fn mark_seen(&self, uid: Uid, seen: bool) -> AppResult<()> {
        let folder = self.state.lock().await.folder.clone();
        let kind = if seen { ActionKind::SetSeen } else { ActionKind::SetUnseen };
        self.imap
            .sync_action(Action { folder, uids: BTreeSet::from([uid]), kind })
            .await
            .map(|_| ())
    }

    pub async fn move_message(&self, uid: Uid, destination: Folder) -> AppResult<()> {
        let folder = self.state.lock().await.folder.clone();
        self.imap
            .sync_action(Action {
                folder,
                uids: BTreeSet::from([uid]),
                kind: ActionKind::Move { destination },
            })
            .await
            .map(|_| ())
    }

    pub async fn delete_permanently(&self, uid: Uid) -> AppResult<()> {
        let folder = self.state.lock().await.folder.clone();
        self.imap
            .sync_action(Action { folder, uids: BTreeSet::from([uid]), kind: ActionKind::DeletePermanently })
            .await
            .map(|_| ())
    }

    /// The user-facing "delete" intent: a move to Trash from any other
    /// folder, a true permanent delete already inside Trash (spec §4.9
    /// scenarios #2/#3).
    pub async fn delete(&self, uid: Uid) -> AppResult<()> {
        let folder = self.state.lock().await.folder.clone();
        if folder == self.trash_folder {
            self.delete_permanently(uid).await
        } else {
            self.move_message(uid, self.trash_folder.clone()).await
        }
    }

    pub async fn begin_compose(&self, draft: ComposeDraft) {
        self.state.lock().await.compose = Some(draft);
    }

    pub async fn begin_reply(&self, original: &Header, reply_all: bool) {
        let mut to = original.reply_to.clone();
        if to.is_empty() {
            to = original.from.clone();
        }
        let mut cc = Vec::new();
        if reply_all {
            cc.extend(original.to.iter().cloned());
            cc.extend(original.cc.iter().cloned());
        }
        let mut references = original.references.clone();
        if let Some(mid) = &original.message_id {
            references.push(mid.clone());
        }
        let subject = original
            .subject
            .clone()
            .map(|s| if s.to_ascii_lowercase().starts_with("re:") { s } else { format!("Re: {s}") })
            .unwrap_or_else(|| "Re:".to_string());

        self.begin_compose(ComposeDraft {
            to,
            cc,
            bcc: vec![],
            subject,
            body: String::new(),
            in_reply_to: original.message_id.clone(),
            references,
        })
        .await;
    }

    /// Sends the active compose draft, uploading a copy to the Sent folder
    /// on success and leaving the draft queued on failure so no content is
    /// lost (spec §4.9).
    pub async fn send_compose(&self) -> AppResult<()> {
        let draft = self.state.lock().await.compose.take();
        let Some(draft) = draft else {
            return Ok(());
        };

        let req = ComposeRequest {
            from: self.from_address.clone(),
            to: draft.to,
            cc: draft.cc,
            bcc: draft.bcc,
            subject: draft.subject,
            plain_text: draft.body,
            html: None,
            in_reply_to: draft.in_reply_to,
            references: draft.references,
        };
        let raw = crate::smtp::build_message(&req)?;
        self.smtp.send(req).await?;

        if self.client_store_sent {
            self.imap.async_action(Action {
                folder: self.sent_folder.clone(),
                uids: BTreeSet::new(),
                kind: ActionKind::UploadMessage { blob: raw },
            });
        }
        Ok(())
    }

    /// Persists the in-progress compose draft to the offline compose-backup
    /// queue. Intended to be called on a periodic timer by the caller.
    pub async fn backup_compose(&self) -> AppResult<()> {
        let state = self.state.lock().await;
        let Some(draft) = &state.compose else {
            return Ok(());
        };
        let req = ComposeRequest {
            from: self.from_address.clone(),
            to: draft.to.clone(),
            cc: draft.cc.clone(),
            bcc: draft.bcc.clone(),
            subject: draft.subject.clone(),
            plain_text: draft.body.clone(),
            html: None,
            in_reply_to: draft.in_reply_to.clone(),
            references: draft.references.clone(),
        };
        drop(state);
        let raw = crate::smtp::build_message(&req)?;
        self.queue.push_compose_backup(raw).await.map_err(|e| crate::errors::AppError::Cache(e.to_string()))
    }

    /// `FullSync` prefetch policy (spec §4.5): walk every folder and every
    /// uid, fetching whatever is missing from cache in bounded batches.
    /// Each batch is its own `Request` round trip against the prefetch
    /// worker's own queue, so a `CurrentView` neighbour-prefetch enqueued
    /// mid-walk gets serviced between batches rather than waiting behind
    /// one giant request; the foreground worker is never touched, since it
    /// runs on its own connection. Intended to run once at startup, and
    /// again whenever the caller wants a full resync.
    pub async fn run_full_sync(&self) -> AppResult<()> {
        let folders = self
            .imap
            .sync_request(Request { prefetch_level: PrefetchLevel::FullSync, get_folders: true, ..Default::default() })
            .await?
            .folders;

        for folder in folders {
            let Some(uids) = self
                .imap
                .sync_request(Request {
                    folder: Some(folder.clone()),
                    prefetch_level: PrefetchLevel::FullSync,
                    get_uids: true,
                    ..Default::default()
                })
                .await?
                .uids
            else {
                continue;
            };

            let mut missing_headers = BTreeSet::new();
            let mut missing_flags = BTreeSet::new();
            let mut missing_bodies = Vec::new();
            for uid in &uids {
                if self.cache.get_header(&folder, *uid).await.is_none() {
                    missing_headers.insert(*uid);
                }
                if self.cache.get_flags(&folder, *uid).await.is_none() {
                    missing_flags.insert(*uid);
                }
                if self.cache.get_body(&folder, *uid).await.is_none() {
                    missing_bodies.push(*uid);
                }
            }

            for chunk in batches(&missing_headers, FULL_SYNC_HEADER_BATCH) {
                self.imap
                    .sync_request(Request {
                        folder: Some(folder.clone()),
                        prefetch_level: PrefetchLevel::FullSync,
                        get_headers: chunk,
                        ..Default::default()
                    })
                    .await?;
                tokio::task::yield_now().await;
            }

            for chunk in batches(&missing_flags, FULL_SYNC_FLAGS_BATCH) {
                self.imap
                    .sync_request(Request {
                        folder: Some(folder.clone()),
                        prefetch_level: PrefetchLevel::FullSync,
                        get_flags: chunk,
                        ..Default::default()
                    })
                    .await?;
                tokio::task::yield_now().await;
            }

            // Bodies are always fetched one uid per FETCH by the worker, so
            // batch the Requests themselves rather than the uid set, to keep
            // each round trip short.
            for chunk in missing_bodies.chunks(FULL_SYNC_BODY_BATCH) {
                self.imap
                    .sync_request(Request {
                        folder: Some(folder.clone()),
                        prefetch_level: PrefetchLevel::FullSync,
                        get_bodies: chunk.iter().copied().collect(),
                        ..Default::default()
                    })
                    .await?;
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }
}

const FULL_SYNC_HEADER_BATCH: usize = 25;
const FULL_SYNC_FLAGS_BATCH: usize = 1000;
const FULL_SYNC_BODY_BATCH: usize = 10;

fn batches(uids: &BTreeSet<Uid>, size: usize) -> Vec<BTreeSet<Uid>> {
    let all: Vec<Uid> = uids.iter().copied().collect();
    all.chunks(size).map(|c| c.iter().copied().collect()).collect()
}

/// The uids immediately before and after `uid` in `ordered` display order.
/// Returns at most two uids; fewer at either end of the list.
fn neighbour_uids(ordered: &[Uid], uid: Uid) -> BTreeSet<Uid> {
    let Some(pos) = ordered.iter().position(|&u| u == uid) else {
        return BTreeSet::new();
    };
    let mut out = BTreeSet::new();
    if pos > 0 {
        out.insert(ordered[pos - 1]);
    }
    if pos + 1 < ordered.len() {
        out.insert(ordered[pos + 1]);
    }
    out
}

pub fn log_startup(account: &str) {
    info!(account, "controller ready");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(uid: Uid) -> Header {
        Header {
            uid,
            message_id: Some(format!("<{uid}@x.test>")),
            in_reply_to: None,
            references: vec![],
            date: None,
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

    #[test]
    fn reply_subject_is_not_double_prefixed() {
        let h = Header { subject: Some("Re: hi".into()), ..header(1) };
        let subject = h
            .subject
            .clone()
            .map(|s| if s.to_ascii_lowercase().starts_with("re:") { s } else { format!("Re: {s}") })
            .unwrap();
        assert_eq!(subject, "Re: hi");
    }

    #[test]
    fn reply_subject_gets_prefixed_once() {
        let h = header(1);
        let subject = h
            .subject
            .clone()
            .map(|s| if s.to_ascii_lowercase().starts_with("re:") { s } else { format!("Re: {s}") })
            .unwrap();
        assert_eq!(subject, "Re: hi");
    }

    fn dated(uid: Uid, subject: &str, ts: i64) -> Header {
        Header {
            subject: Some(subject.into()),
            date: Some(chrono::DateTime::from_timestamp(ts, 0).unwrap()),
            ..header(uid)
        }
    }

    #[test]
    fn date_desc_orders_newest_first() {
        let a = dated(1, "a", 100);
        let b = dated(2, "b", 200);
        let mut keys = [
            sort_key(SortMode::DateDesc, 1, Some(&a), false),
            sort_key(SortMode::DateDesc, 2, Some(&b), false),
        ];
        keys.sort();
        let mut uids: Vec<Uid> = keys.into_iter().map(|(_, uid)| uid).collect();
        uids.reverse();
        assert_eq!(uids, vec![2, 1]);
    }

    #[test]
    fn subject_asc_orders_lexicographically() {
        let a = dated(1, "zeta", 0);
        let b = dated(2, "alpha", 0);
        let mut keys = vec![
            sort_key(SortMode::SubjectAsc, 1, Some(&a), false),
            sort_key(SortMode::SubjectAsc, 2, Some(&b), false),
        ];
        keys.sort();
        let uids: Vec<Uid> = keys.into_iter().map(|(_, uid)| uid).collect();
        assert_eq!(uids, vec![2, 1]);
    }

    #[test]
    fn unseen_asc_puts_unseen_before_seen() {
        let h = header(1);
        let mut keys = vec![
            sort_key(SortMode::UnseenAsc, 1, Some(&h), false),
            sort_key(SortMode::UnseenAsc, 2, Some(&h), true),
        ];
        keys.sort();
        let uids: Vec<Uid> = keys.into_iter().map(|(_, uid)| uid).collect();
        assert_eq!(uids, vec![2, 1]);
    }

    #[test]
    fn neighbour_uids_are_adjacent_in_display_order() {
        let ordered = [10, 20, 30, 40];
        assert_eq!(neighbour_uids(&ordered, 30), BTreeSet::from([20, 40]));
    }

    #[test]
    fn neighbour_uids_at_either_end_are_one_sided() {
        let ordered = [10, 20, 30];
        assert_eq!(neighbour_uids(&ordered, 10), BTreeSet::from([20]));
        assert_eq!(neighbour_uids(&ordered, 30), BTreeSet::from([20]));
    }

    #[test]
    fn neighbour_uids_of_uid_not_displayed_is_empty() {
        let ordered = [10, 20, 30];
        assert!(neighbour_uids(&ordered, 999).is_empty());
    }

    #[test]
    fn batches_splits_into_bounded_chunks() {
        let uids: BTreeSet<Uid> = (1..=7).collect();
        let chunks = batches(&uids, 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], BTreeSet::from([1, 2, 3]));
        assert_eq!(chunks[2], BTreeSet::from([7]));
    }
}
