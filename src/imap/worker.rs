//! IMAP Manager (C5): the two-worker-thread core (spec §4.5).
//!
//! A foreground worker and a prefetch worker each own one long-lived
//! [`ImapSession`](super::ImapSession). Both dequeue [`Request`]s; only the
//! foreground worker dequeues [`Action`]s, preserving causal ordering
//! between a user's view and mutations. Work items for one worker are kept
//! on a single ordered channel rather than a true priority pair, since that
//! is what actually gives the enqueue-order guarantees the spec requires
//! (see DESIGN.md).

use crate::cache::Cache;
use crate::errors::{AppError, AppResult};
use crate::imap::{self, Credentials, ImapSession};
use crate::search::SearchIndex;
use crate::status::{StatusFlags, StatusHandle};
use crate::types::{Action, ActionKind, Folder, Header, PrefetchLevel, Request, Response, ResponseStatus, Uid};
use async_imap::types::Fetch;
use futures::StreamExt;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const FETCH_HEADER_BATCH: usize = 25;
const FETCH_FLAGS_BATCH: usize = 1000;
const IDLE_THRESHOLD: Duration = Duration::from_secs(20);
const IDLE_REFRESH: Duration = Duration::from_secs(29 * 60);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Authenticating,
    Selecting,
    Idle,
    Busy,
    Idling,
    Disconnecting,
}

struct QueuedRequest {
    request: Request,
    reply: Option<oneshot::Sender<Response>>,
}

struct QueuedAction {
    action: Action,
    reply: Option<oneshot::Sender<Response>>,
}

enum WorkItem {
    Request(QueuedRequest),
    Action(QueuedAction),
}

/// Uids claimed by the foreground worker so the prefetch worker can skip
/// them if it reaches them first (spec §4.5 prefetch policy). Claimed at
/// enqueue time, not when the foreground worker starts the fetch, so a uid
/// sitting in the foreground queue is already off-limits to the prefetch
/// worker (scenario: prefetch reaches a uid the user just selected, before
/// the foreground worker has dequeued it). A plain std mutex keeps claim()
/// callable from the handle's non-async `async_request`.
#[derive(Default)]
struct Claims {
    claimed: std::sync::Mutex<HashSet<(String, Uid)>>,
}

impl Claims {
    fn claim(&self, folder: &Folder, uid: Uid) {
        self.claimed.lock().unwrap().insert((folder.as_str().to_string(), uid));
    }

    fn is_claimed(&self, folder: &Folder, uid: Uid) -> bool {
        self.claimed.lock().unwrap().contains(&(folder.as_str().to_string(), uid))
    }

    fn release(&self, folder: &Folder, uid: Uid) {
        self.claimed.lock().unwrap().remove(&(folder.as_str().to_string(), uid));
    }
}

#[derive(Clone)]
pub struct ImapManagerHandle {
    fg_tx: mpsc::UnboundedSender<WorkItem>,
    prefetch_tx: mpsc::UnboundedSender<WorkItem>,
    shutdown: Arc<AtomicBool>,
    wakeup_fg: mpsc::UnboundedSender<()>,
    wakeup_prefetch: mpsc::UnboundedSender<()>,
    claims: Arc<Claims>,
}

impl ImapManagerHandle {
    /// Picks the destination channel for a request and, for anything routed
    /// to the foreground worker, claims its requested bodies immediately
    /// (spec §4.5: a uid merely queued for the foreground worker must
    /// already be off-limits to the prefetch worker, not just one it has
    /// started fetching).
    fn route(&self, request: &Request) -> &mpsc::UnboundedSender<WorkItem> {
        if request.prefetch_level >= PrefetchLevel::CurrentView {
            &self.prefetch_tx
        } else {
            if let Some(folder) = &request.folder {
                for uid in &request.get_bodies {
                    self.claims.claim(folder, *uid);
                }
            }
            &self.fg_tx
        }
    }

    pub fn async_request(&self, request: Request) {
        let tx = self.route(&request);
        let _ = tx.send(WorkItem::Request(QueuedRequest { request, reply: None }));
    }

    /// Blocking counterpart to [`Self::async_request`], used by the full
    /// sync walker to drive a multi-step protocol (folder list, then uids,
    /// then missing headers/flags/bodies per folder) one round trip at a
    /// time.
    pub async fn sync_request(&self, request: Request) -> AppResult<Response> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let tx = self.route(&request);
        tx.send(WorkItem::Request(QueuedRequest { request, reply: Some(reply_tx) }))
            .map_err(|_| AppError::Unexpected("imap manager shut down".into()))?;
        reply_rx.await.map_err(|_| AppError::Unexpected("imap worker dropped reply".into()))
    }

    pub fn async_action(&self, action: Action) {
        let _ = self.fg_tx.send(WorkItem::Action(QueuedAction { action, reply: None }));
    }

    pub async fn sync_action(&self, action: Action) -> AppResult<Response> {
        let (tx, rx) = oneshot::channel();
        self.fg_tx
            .send(WorkItem::Action(QueuedAction { action, reply: Some(tx) }))
            .map_err(|_| AppError::Unexpected("imap manager shut down".into()))?;
        rx.await.map_err(|_| AppError::Unexpected("imap worker dropped reply".into()))
    }

    /// Forces both workers out of IDLE. Called by the Sleep Detector (C8)
    /// on a resume-from-sleep jump.
    pub fn force_wakeup(&self) {
        let _ = self.wakeup_fg.send(());
        let _ = self.wakeup_prefetch.send(());
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.wakeup_fg.send(());
        let _ = self.wakeup_prefetch.send(());
    }
}

pub struct ImapManagerConfig {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub inbox: Folder,
    /// Spec §6 `offline` flag: hold at `Disconnected` until a wake-up
    /// (manual reconnect or sleep-detector jolt) rather than auto-connecting.
    pub start_offline: bool,
}

/// Spawns the foreground and prefetch workers and returns a handle plus the
/// response stream the controller should drain.
pub fn spawn(
    config: ImapManagerConfig,
    cache: Arc<Cache>,
    search: Arc<SearchIndex>,
    status: StatusHandle,
) -> (ImapManagerHandle, mpsc::UnboundedReceiver<Response>) {
    let (fg_tx, fg_rx) = mpsc::unbounded_channel();
    let (prefetch_tx, prefetch_rx) = mpsc::unbounded_channel();
    let (responses_tx, responses_rx) = mpsc::unbounded_channel();
    let (wakeup_fg_tx, wakeup_fg_rx) = mpsc::unbounded_channel();
    let (wakeup_prefetch_tx, wakeup_prefetch_rx) = mpsc::unbounded_channel();
    let shutdown = Arc::new(AtomicBool::new(false));
    let claims = Arc::new(Claims::default());

    let fg_config = ImapManagerConfig {
        host: config.host.clone(),
        port: config.port,
        credentials: clone_credentials(&config.credentials),
        inbox: config.inbox.clone(),
        start_offline: config.start_offline,
    };

    let fg_worker = Worker {
        is_foreground: true,
        config: fg_config,
        cache: cache.clone(),
        search: search.clone(),
        status: status.clone(),
        claims: claims.clone(),
        shutdown: shutdown.clone(),
        responses: responses_tx.clone(),
        rx: fg_rx,
        wakeup: wakeup_fg_rx,
    };
    let prefetch_worker = Worker {
        is_foreground: false,
        config,
        cache,
        search,
        status,
        claims: claims.clone(),
        shutdown: shutdown.clone(),
        responses: responses_tx,
        rx: prefetch_rx,
        wakeup: wakeup_prefetch_rx,
    };

    tokio::spawn(fg_worker.run());
    tokio::spawn(prefetch_worker.run());

    (
        ImapManagerHandle {
            fg_tx,
            prefetch_tx,
            shutdown,
            claims,
            wakeup_fg: wakeup_fg_tx,
            wakeup_prefetch: wakeup_prefetch_tx,
        },
        responses_rx,
    )
}

fn clone_credentials(c: &Credentials) -> Credentials {
    match c {
        Credentials::Plain { user, password } => {
            Credentials::Plain { user: user.clone(), password: password.clone() }
        }
        Credentials::Login { user, password } => {
            Credentials::Login { user: user.clone(), password: password.clone() }
        }
        Credentials::XOAuth2 { user, access_token } => {
            Credentials::XOAuth2 { user: user.clone(), access_token: access_token.clone() }
        }
    }
}

struct Worker {
    is_foreground: bool,
    config: ImapManagerConfig,
    cache: Arc<Cache>,
    search: Arc<SearchIndex>,
    status: StatusHandle,
    claims: Arc<Claims>,
    shutdown: Arc<AtomicBool>,
    responses: mpsc::UnboundedSender<Response>,
    rx: mpsc::UnboundedReceiver<WorkItem>,
    wakeup: mpsc::UnboundedReceiver<()>,
}

impl Worker {
    fn worker_name(&self) -> &'static str {
        if self.is_foreground {
            "foreground"
        } else {
            "prefetch"
        }
    }

    async fn run(mut self) {
        let mut state = ConnState::Disconnected;
        let mut session: Option<ImapSession> = None;
        let mut selected_folder: Option<Folder> = None;
        let mut backoff = BACKOFF_BASE;
        let mut waiting_offline = self.config.start_offline;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                if let Some(mut s) = session.take() {
                    let _ = s.logout().await;
                }
                debug!(worker = self.worker_name(), "shut down");
                return;
            }

            match state {
                ConnState::Disconnected => {
                    if waiting_offline {
                        tokio::select! {
                            _ = self.wakeup.recv() => { waiting_offline = false; }
                        }
                    } else {
                        state = ConnState::Connecting;
                    }
                }
                ConnState::Connecting => {
                    self.status.apply(StatusFlags::CONNECTING, StatusFlags::empty(), None).await;
                    match imap::connect(&self.config.host, self.config.port, &self.config.credentials).await
                    {
                        Ok(s) => {
                            session = Some(s);
                            state = ConnState::Authenticating;
                            backoff = BACKOFF_BASE;
                        }
                        Err(e) => {
                            warn!(worker = self.worker_name(), error = %e, "connect failed, backing off");
                            self.status.apply(StatusFlags::empty(), StatusFlags::CONNECTING, None).await;
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(BACKOFF_CAP);
                        }
                    }
                }
                ConnState::Authenticating => {
                    // connect() already authenticates; this state exists to
                    // mirror the documented transition table for the
                    // LoginFailed status bit.
                    state = ConnState::Selecting;
                }
                ConnState::Selecting => {
                    if let Some(s) = session.as_mut() {
                        match s.select(self.config.inbox.as_str()).await {
                            Ok(_) => {
                                selected_folder = Some(self.config.inbox.clone());
                                self.status.apply(
                                    StatusFlags::CONNECTED,
                                    StatusFlags::CONNECTING,
                                    None,
                                ).await;
                                state = ConnState::Idle;
                            }
                            Err(e) => {
                                warn!(worker = self.worker_name(), error = %e, "SELECT failed");
                                self.status.apply(StatusFlags::empty(), StatusFlags::empty(), None).await;
                                state = ConnState::Disconnecting;
                            }
                        }
                    } else {
                        state = ConnState::Disconnecting;
                    }
                }
                ConnState::Idle => {
                    tokio::select! {
                        item = self.rx.recv() => {
                            match item {
                                Some(item) => {
                                    state = ConnState::Busy;
                                    self.status.apply(StatusFlags::FETCHING, StatusFlags::empty(), None).await;
                                    if let Some(s) = session.as_mut() {
                                        self.handle_item(s, &mut selected_folder, item).await;
                                    }
                                    self.status.apply(StatusFlags::empty(), StatusFlags::FETCHING, None).await;
                                    state = ConnState::Idle;
                                }
                                None => { state = ConnState::Disconnecting; }
                            }
                        }
                        _ = self.wakeup.recv() => {
                            // sleep-detector jolt while already idle: nothing
                            // to exit, but worth a defensive reconnect probe.
                        }
                        _ = tokio::time::sleep(IDLE_THRESHOLD) => {
                            if selected_folder.as_ref() == Some(&self.config.inbox) {
                                state = ConnState::Idling;
                            }
                        }
                    }
                }
                ConnState::Idling => {
                    self.status.apply(StatusFlags::IDLE, StatusFlags::empty(), None).await;
                    let idled = self.run_idle(&mut session).await;
                    self.status.apply(StatusFlags::empty(), StatusFlags::IDLE, None).await;
                    match idled {
                        IdleOutcome::ServerNotified | IdleOutcome::ForcedWakeup => {
                            state = ConnState::Busy;
                            if let Some(folder) = selected_folder.clone() {
                                if let Some(s) = session.as_mut() {
                                    self.refresh_uids(s, &folder).await;
                                }
                            }
                            state = ConnState::Idle;
                        }
                        IdleOutcome::Timeout => {
                            state = ConnState::Idle;
                        }
                        IdleOutcome::Error(e) => {
                            warn!(worker = self.worker_name(), error = %e, "IDLE failed");
                            state = ConnState::Disconnecting;
                        }
                    }
                }
                ConnState::Busy => {
                    state = ConnState::Idle;
                }
                ConnState::Disconnecting => {
                    if let Some(mut s) = session.take() {
                        let _ = s.logout().await;
                    }
                    selected_folder = None;
                    self.status.apply(StatusFlags::empty(), StatusFlags::CONNECTED, None).await;
                    state = ConnState::Disconnected;
                }
            }
        }
    }

    async fn run_idle(&mut self, session: &mut Option<ImapSession>) -> IdleOutcome {
        let Some(s) = session.take() else {
            return IdleOutcome::Error(AppError::Transport("no session".into()));
        };

        let mut idle_handle = s.idle();
        if let Err(e) = idle_handle.init().await {
            return IdleOutcome::Error(e.into());
        }

        let outcome = {
            let (idle_wait, interrupt) = idle_handle.wait_with_timeout(IDLE_REFRESH);
            tokio::select! {
                result = idle_wait => {
                    match result {
                        Ok(_) => IdleOutcome::ServerNotified,
                        Err(e) => IdleOutcome::Error(e.into()),
                    }
                }
                _ = self.wakeup.recv() => {
                    drop(interrupt);
                    IdleOutcome::ForcedWakeup
                }
            }
        };

        // Every exit path, including a failed/interrupted IDLE, must return
        // the session via `done()` or the connection is lost for good.
        match idle_handle.done().await {
            Ok(s) => {
                *session = Some(s);
                outcome
            }
            Err(e) => IdleOutcome::Error(e.into()),
        }
    }

    async fn handle_item(
        &self,
        session: &mut ImapSession,
        selected_folder: &mut Option<Folder>,
        item: WorkItem,
    ) {
        match item {
            WorkItem::Request(queued) => {
                let response = self.handle_request(session, selected_folder, queued.request).await;
                if let Some(reply) = queued.reply {
                    let _ = reply.send(response);
                } else {
                    let _ = self.responses.send(response);
                }
            }
            WorkItem::Action(queued) => {
                let response = self.handle_action(session, selected_folder, queued.action).await;
                if let Some(reply) = queued.reply {
                    let _ = reply.send(response);
                } else {
                    let _ = self.responses.send(response);
                }
            }
        }
    }

    async fn ensure_selected(
        &self,
        session: &mut ImapSession,
        selected_folder: &mut Option<Folder>,
        folder: &Folder,
    ) -> AppResult<()> {
        if selected_folder.as_ref() == Some(folder) {
            return Ok(());
        }
        session.select(folder.as_str()).await.map_err(AppError::from)?;
        *selected_folder = Some(folder.clone());
        Ok(())
    }

    async fn handle_request(
        &self,
        session: &mut ImapSession,
        selected_folder: &mut Option<Folder>,
        request: Request,
    ) -> Response {
        let mut response = Response { folder: request.folder.clone(), ..Default::default() };

        if request.get_folders {
            match self.fetch_folder_list(session).await {
                Ok(folders) => response.folders = folders,
                Err(e) => {
                    warn!(error = %e, "LIST failed");
                    response.status |= ResponseStatus::GET_FOLDERS_FAILED;
                }
            }
        }

        let Some(folder) = request.folder.clone() else {
            return response;
        };

        if let Err(e) = self.ensure_selected(session, selected_folder, &folder).await {
            warn!(folder = %folder, error = %e, "SELECT failed for request");
            response.status |= ResponseStatus::GET_UIDS_FAILED
                | ResponseStatus::GET_HEADERS_FAILED
                | ResponseStatus::GET_FLAGS_FAILED
                | ResponseStatus::GET_BODIES_FAILED;
            return response;
        }

        if request.get_uids {
            match self.fetch_uids(session).await {
                Ok(uids) => {
                    let cached = self.cache.get_uids(&folder).await.unwrap_or_default();
                    let removed: Vec<Uid> = cached.difference(&uids).copied().collect();
                    for uid in removed {
                        self.cache.remove_uid(&folder, uid).await;
                        let _ = self.search.remove(&folder, uid).await;
                    }
                    self.cache.put_uids(&folder, &uids).await;
                    response.uids = Some(uids);
                }
                Err(e) => {
                    warn!(folder = %folder, error = %e, "UID SEARCH ALL failed");
                    response.status |= ResponseStatus::GET_UIDS_FAILED;
                }
            }
        }

        if !request.get_headers.is_empty() {
            match self.fetch_headers(session, &folder, &request.get_headers).await {
                Ok(headers) => response.headers = headers,
                Err(e) => {
                    warn!(folder = %folder, error = %e, "header fetch failed");
                    response.status |= ResponseStatus::GET_HEADERS_FAILED;
                }
            }
        }

        if !request.get_flags.is_empty() {
            match self.fetch_flags(session, &folder, &request.get_flags).await {
                Ok(flags) => response.flags = flags,
                Err(e) => {
                    warn!(folder = %folder, error = %e, "flags fetch failed");
                    response.status |= ResponseStatus::GET_FLAGS_FAILED;
                }
            }
        }

        for uid in &request.get_bodies {
            if !self.is_foreground && self.claims.is_claimed(&folder, *uid) {
                // claimed by the foreground worker (queued or in flight); skip it here.
                continue;
            }
            if self.is_foreground {
                // already claimed at enqueue time by ImapManagerHandle::route;
                // re-claiming here is a harmless no-op and keeps this call
                // correct even for a request built directly against the worker.
                self.claims.claim(&folder, *uid);
            }
            match self.fetch_body(session, &folder, *uid, request.process_html).await {
                Ok(body) => {
                    self.cache.put_body(&folder, &body).await;
                    if let Some(header) = self.cache.get_header(&folder, *uid).await {
                        let _ = self
                            .search
                            .index(&folder, *uid, &header, body.plain_text.as_deref())
                            .await;
                    }
                    response.bodies.push(body);
                }
                Err(e) => {
                    warn!(folder = %folder, uid = *uid, error = %e, "body fetch failed");
                    response.status |= ResponseStatus::GET_BODIES_FAILED;
                }
            }
            if self.is_foreground {
                self.claims.release(&folder, *uid);
            }
        }

        response
    }

    async fn fetch_folder_list(&self, session: &mut ImapSession) -> AppResult<Vec<Folder>> {
        let mut stream = session.list(Some(""), Some("*")).await.map_err(AppError::from)?;
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            let item = item.map_err(AppError::from)?;
            out.push(Folder::from(item.name().to_string()));
        }
        Ok(out)
    }

    async fn fetch_uids(&self, session: &mut ImapSession) -> AppResult<BTreeSet<Uid>> {
        let uids = session.uid_search("ALL").await.map_err(AppError::from)?;
        Ok(uids.into_iter().collect())
    }

    async fn fetch_headers(
        &self,
        session: &mut ImapSession,
        folder: &Folder,
        uids: &BTreeSet<Uid>,
    ) -> AppResult<Vec<Header>> {
        let mut out = Vec::new();
        let all: Vec<Uid> = uids.iter().copied().collect();
        for chunk in all.chunks(FETCH_HEADER_BATCH) {
            let seq = build_uid_sequence(chunk);
            let mut stream = session
                .uid_fetch(&seq, "(UID ENVELOPE BODYSTRUCTURE RFC822.HEADER)")
                .await
                .map_err(AppError::from)?;
            while let Some(fetch) = stream.next().await {
                let fetch = fetch.map_err(AppError::from)?;
                if let Some(header) = header_from_fetch(&fetch) {
                    self.cache.put_header(folder, &header).await;
                    out.push(header);
                }
            }
        }
        Ok(out)
    }

    async fn fetch_flags(
        &self,
        session: &mut ImapSession,
        folder: &Folder,
        uids: &BTreeSet<Uid>,
    ) -> AppResult<Vec<(Uid, crate::types::Flags)>> {
        let mut out = Vec::new();
        let all: Vec<Uid> = uids.iter().copied().collect();
        for chunk in all.chunks(FETCH_FLAGS_BATCH) {
            let seq = build_uid_sequence(chunk);
            let mut stream = session.uid_fetch(&seq, "(UID FLAGS)").await.map_err(AppError::from)?;
            while let Some(fetch) = stream.next().await {
                let fetch = fetch.map_err(AppError::from)?;
                if let Some(uid) = fetch.uid {
                    let flags = flags_from_fetch(&fetch);
                    self.cache.put_flags(folder, uid, flags).await;
                    out.push((uid, flags));
                }
            }
        }
        Ok(out)
    }

    async fn fetch_body(
        &self,
        session: &mut ImapSession,
        _folder: &Folder,
        uid: Uid,
        process_html: bool,
    ) -> AppResult<crate::types::Body> {
        let seq = uid.to_string();
        let mut stream = session
            .uid_fetch(&seq, "(UID BODY.PEEK[])")
            .await
            .map_err(AppError::from)?;
        let fetch = stream
            .next()
            .await
            .ok_or_else(|| AppError::Protocol("no FETCH response for body".into()))?
            .map_err(AppError::from)?;
        let raw = fetch.body().map(|b| b.to_vec()).unwrap_or_default();
        Ok(crate::sanitize::body_from_raw(uid, raw, process_html))
    }

    async fn refresh_uids(&self, session: &mut ImapSession, folder: &Folder) {
        if let Ok(uids) = self.fetch_uids(session).await {
            self.cache.put_uids(folder, &uids).await;
        }
    }

    async fn handle_action(
        &self,
        session: &mut ImapSession,
        selected_folder: &mut Option<Folder>,
        action: Action,
    ) -> Response {
        let mut response = Response { folder: Some(action.folder.clone()), ..Default::default() };

        if let Err(e) = self.ensure_selected(session, selected_folder, &action.folder).await {
            warn!(folder = %action.folder, error = %e, "SELECT failed for action");
            response.status |= ResponseStatus::GET_UIDS_FAILED;
            return response;
        }

        let seq = build_uid_sequence(&action.uids.iter().copied().collect::<Vec<_>>());

        let result: AppResult<()> = match &action.kind {
            ActionKind::SetSeen => {
                for uid in &action.uids {
                    let mut flags = self.cache.get_flags(&action.folder, *uid).await.unwrap_or_default();
                    flags |= crate::types::Flags::SEEN;
                    self.cache.put_flags(&action.folder, *uid, flags).await;
                }
                session
                    .uid_store(&seq, "+FLAGS (\\Seen)")
                    .await
                    .map(|_| ())
                    .map_err(AppError::from)
            }
            ActionKind::SetUnseen => {
                for uid in &action.uids {
                    let mut flags = self.cache.get_flags(&action.folder, *uid).await.unwrap_or_default();
                    flags.remove(crate::types::Flags::SEEN);
                    self.cache.put_flags(&action.folder, *uid, flags).await;
                }
                session
                    .uid_store(&seq, "-FLAGS (\\Seen)")
                    .await
                    .map(|_| ())
                    .map_err(AppError::from)
            }
            ActionKind::DeletePermanently => {
                for uid in &action.uids {
                    self.cache.remove_uid(&action.folder, *uid).await;
                    let _ = self.search.remove(&action.folder, *uid).await;
                }
                self.delete_permanently(session, &seq).await
            }
            ActionKind::Move { destination } => {
                for uid in &action.uids {
                    self.cache.remove_uid(&action.folder, *uid).await;
                    let _ = self.search.remove(&action.folder, *uid).await;
                }
                let moved = self.move_uids(session, &seq, destination).await;
                if moved.is_ok() {
                    self.cache.put_uids(destination, &BTreeSet::new()).await;
                    // hasRequestedUids equivalent: clearing the cached uid
                    // set for the destination forces a re-fetch on next read.
                }
                moved
            }
            ActionKind::UploadDraft { blob } | ActionKind::UploadMessage { blob } => {
                session
                    .append(action.folder.as_str(), None, None, blob)
                    .await
                    .map(|_| ())
                    .map_err(AppError::from)
            }
            ActionKind::UpdateCacheOnly => Ok(()),
        };

        if let Err(e) = result {
            warn!(folder = %action.folder, error = %e, "action failed");
            response.status |= ResponseStatus::GET_UIDS_FAILED;
        }

        response
    }

    async fn delete_permanently(&self, session: &mut ImapSession, seq: &str) -> AppResult<()> {
        session.uid_store(seq, "+FLAGS (\\Deleted)").await.map_err(AppError::from)?;
        session.uid_expunge(seq).await.map(|_| ()).map_err(AppError::from)
    }

    /// Uses `UID MOVE` when the server advertised it, falling back to
    /// `UID COPY` + `UID STORE \Deleted` + `UID EXPUNGE` otherwise. The spec
    /// leaves this choice to the implementer (design note, §9); wrenmail
    /// prefers `UID MOVE` whenever the capability is present.
    async fn move_uids(
        &self,
        session: &mut ImapSession,
        seq: &str,
        destination: &Folder,
    ) -> AppResult<()> {
        let supports_move = session
            .capabilities()
            .await
            .map(|caps| caps.has_str("MOVE"))
            .unwrap_or(false);

        if supports_move {
            session
                .uid_mv(seq, destination.as_str())
                .await
                .map(|_| ())
                .map_err(AppError::from)
        } else {
            session.uid_copy(seq, destination.as_str()).await.map_err(AppError::from)?;
            self.delete_permanently(session, seq).await
        }
    }
}

enum IdleOutcome {
    ServerNotified,
    ForcedWakeup,
    Timeout,
    Error(AppError),
}

/// Builds a comma-separated UID sequence set for batch `UID FETCH`/`UID
/// STORE` commands.
fn build_uid_sequence(uids: &[Uid]) -> String {
    uids.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(",")
}

/// Converts async-imap's per-message flag iterator into our bitset,
/// ignoring keyword flags (`Flag::Custom`) the core never reads or writes.
fn flags_from_fetch(fetch: &Fetch) -> crate::types::Flags {
    use async_imap::types::Flag;
    let mut out = crate::types::Flags::empty();
    for flag in fetch.flags() {
        match flag {
            Flag::Seen => out |= crate::types::Flags::SEEN,
            Flag::Answered => out |= crate::types::Flags::ANSWERED,
            Flag::Flagged => out |= crate::types::Flags::FLAGGED,
            Flag::Deleted => out |= crate::types::Flags::DELETED,
            Flag::Draft => out |= crate::types::Flags::DRAFT,
            _ => {}
        }
    }
    out
}

fn header_from_fetch(fetch: &Fetch) -> Option<Header> {
    let uid = fetch.uid?;
    let envelope = fetch.envelope()?;
    let subject = envelope
        .subject
        .as_ref()
        .map(|s| decode_mime_header(&String::from_utf8_lossy(s)));
    let from = envelope.from.as_ref().map(addresses_from_envelope).unwrap_or_default();
    let to = envelope.to.as_ref().map(addresses_from_envelope).unwrap_or_default();
    let cc = envelope.cc.as_ref().map(addresses_from_envelope).unwrap_or_default();
    let bcc = envelope.bcc.as_ref().map(addresses_from_envelope).unwrap_or_default();
    let reply_to = envelope.reply_to.as_ref().map(addresses_from_envelope).unwrap_or_default();
    let message_id = envelope
        .message_id
        .as_ref()
        .map(|m| String::from_utf8_lossy(m).to_string());
    let in_reply_to = envelope
        .in_reply_to
        .as_ref()
        .map(|m| String::from_utf8_lossy(m).to_string());
    let raw_header_text = fetch
        .header()
        .map(|h| String::from_utf8_lossy(h).to_string())
        .unwrap_or_default();

    Some(Header {
        uid,
        message_id,
        in_reply_to,
        references: Vec::new(),
        date: None,
        date_raw: envelope.date.as_ref().map(|d| String::from_utf8_lossy(d).to_string()),
        from,
        reply_to,
        to,
        cc,
        bcc,
        subject,
        has_attachments: false,
        raw_header_text,
    })
}

fn addresses_from_envelope(addrs: &Vec<async_imap::imap_proto::types::Address<'_>>) -> Vec<crate::types::Address> {
    addrs
        .iter()
        .filter_map(|a| {
            let mailbox = a.mailbox.as_ref()?;
            let host = a.host.as_ref()?;
            Some(crate::types::Address {
                display_name: a.name.as_ref().map(|n| decode_mime_header(&String::from_utf8_lossy(n))),
                mailbox: format!(
                    "{}@{}",
                    String::from_utf8_lossy(mailbox),
                    String::from_utf8_lossy(host)
                ),
            })
        })
        .collect()
}

fn decode_mime_header(raw: &str) -> String {
    crate::sanitize::decode_header_value(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_uid_sequence_comma_joins() {
        assert_eq!(build_uid_sequence(&[1, 2, 3]), "1,2,3");
        assert_eq!(build_uid_sequence(&[]), "");
    }

    #[test]
    fn claims_prevent_double_claim_race() {
        let claims = Claims::default();
        let folder = Folder::from("INBOX");
        claims.claim(&folder, 1);
        assert!(claims.is_claimed(&folder, 1));
        claims.release(&folder, 1);
        assert!(!claims.is_claimed(&folder, 1));
    }

    #[test]
    fn claim_at_enqueue_blocks_prefetch_before_foreground_starts() {
        let claims = Claims::default();
        let folder = Folder::from("INBOX");
        // Simulates ImapManagerHandle::route claiming a uid the moment a
        // foreground request is enqueued, before the foreground worker has
        // dequeued and started fetching it.
        claims.claim(&folder, 500);
        assert!(claims.is_claimed(&folder, 500));
    }
}
