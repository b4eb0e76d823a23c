use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

bitflags::bitflags! {
    /// Message flags, mirroring the IMAP system flags the core actually
    /// mutates. Keyword flags are not represented here; the core never
    /// sets or reads them.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Flags: u8 {
        const SEEN     = 0b00001;
        const ANSWERED = 0b00010;
        const FLAGGED  = 0b00100;
        const DELETED  = 0b01000;
        const DRAFT    = 0b10000;
    }
}

impl Flags {
    pub fn as_imap_strs(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.contains(Flags::SEEN) {
            out.push("\\Seen");
        }
        if self.contains(Flags::ANSWERED) {
            out.push("\\Answered");
        }
        if self.contains(Flags::FLAGGED) {
            out.push("\\Flagged");
        }
        if self.contains(Flags::DELETED) {
            out.push("\\Deleted");
        }
        if self.contains(Flags::DRAFT) {
            out.push("\\Draft");
        }
        out
    }

    pub fn from_imap_strs<I: IntoIterator<Item = S>, S: AsRef<str>>(flags: I) -> Self {
        let mut out = Flags::empty();
        for f in flags {
            match f.as_ref() {
                "\\Seen" => out |= Flags::SEEN,
                "\\Answered" => out |= Flags::ANSWERED,
                "\\Flagged" => out |= Flags::FLAGGED,
                "\\Deleted" => out |= Flags::DELETED,
                "\\Draft" => out |= Flags::DRAFT,
                _ => {}
            }
        }
        out
    }
}

/// An opaque server-assigned per-folder message id, stable within one
/// UIDVALIDITY epoch.
pub type Uid = u32;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Folder(pub String);

impl Folder {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Folder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Folder {
    fn from(s: &str) -> Self {
        Folder(s.to_string())
    }
}

impl From<String> for Folder {
    fn from(s: String) -> Self {
        Folder(s)
    }
}

/// Parsed envelope for one UID.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Header {
    pub uid: Uid,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    pub date_raw: Option<String>,
    pub from: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub subject: Option<String>,
    pub has_attachments: bool,
    pub raw_header_text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub display_name: Option<String>,
    pub mailbox: String,
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.display_name {
            Some(n) if !n.is_empty() => write!(f, "{} <{}>", n, self.mailbox),
            _ => write!(f, "{}", self.mailbox),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BodyPart {
    pub index: String,
    pub mime_type: String,
    pub filename: Option<String>,
    pub content_id: Option<String>,
    pub size: usize,
    pub encoded_bytes: Vec<u8>,
}

/// Raw RFC-822 payload plus derived rendering fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Body {
    pub uid: Uid,
    pub raw: Vec<u8>,
    pub plain_text: Option<String>,
    pub html: Option<String>,
    pub parts: Vec<BodyPart>,
    pub format_flowed: bool,
    pub html_parsed: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrefetchLevel {
    #[default]
    None,
    CurrentMessage,
    CurrentView,
    FullSync,
}

/// A read-only query against the IMAP Manager.
#[derive(Clone, Debug, Default)]
pub struct Request {
    pub folder: Option<Folder>,
    pub prefetch_level: PrefetchLevel,
    pub get_folders: bool,
    pub get_uids: bool,
    pub get_headers: BTreeSet<Uid>,
    pub get_flags: BTreeSet<Uid>,
    pub get_bodies: BTreeSet<Uid>,
    pub process_html: bool,
}

#[derive(Clone, Debug)]
pub enum ActionKind {
    Move { destination: Folder },
    SetSeen,
    SetUnseen,
    UploadDraft { blob: Vec<u8> },
    UploadMessage { blob: Vec<u8> },
    DeletePermanently,
    UpdateCacheOnly,
}

/// A mutation against the IMAP Manager.
#[derive(Clone, Debug)]
pub struct Action {
    pub folder: Folder,
    pub uids: BTreeSet<Uid>,
    pub kind: ActionKind,
}

bitflags::bitflags! {
    /// Per-field failure bitset for a [`Response`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ResponseStatus: u16 {
        const GET_FOLDERS_FAILED = 0b00000001;
        const GET_UIDS_FAILED    = 0b00000010;
        const GET_HEADERS_FAILED = 0b00000100;
        const GET_FLAGS_FAILED   = 0b00001000;
        const GET_BODIES_FAILED  = 0b00010000;
        const LOGIN_FAILED       = 0b00100000;
    }
}

#[derive(Clone, Debug, Default)]
pub struct Response {
    pub folder: Option<Folder>,
    pub folders: Vec<Folder>,
    pub uids: Option<BTreeSet<Uid>>,
    pub headers: Vec<Header>,
    pub flags: Vec<(Uid, Flags)>,
    pub bodies: Vec<Body>,
    pub status: ResponseStatus,
    pub cached: bool,
}

#[derive(Clone, Debug)]
pub struct SearchQuery {
    pub query_string: String,
    pub offset: usize,
    pub max: usize,
}

#[derive(Clone, Debug)]
pub struct SearchHit {
    pub folder: Folder,
    pub uid: Uid,
    pub header: Option<Header>,
}

#[derive(Clone, Debug)]
pub struct SearchResult {
    pub hits: Vec<SearchHit>,
    pub has_more: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfflineMessageKind {
    Draft,
    Outbox,
    ComposeBackup,
}

#[derive(Clone, Debug)]
pub struct OfflineMessage {
    pub kind: OfflineMessageKind,
    pub blob: Vec<u8>,
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip_imap_strs() {
        let f = Flags::SEEN | Flags::FLAGGED;
        let strs = f.as_imap_strs();
        assert_eq!(strs, vec!["\\Seen", "\\Flagged"]);
        assert_eq!(Flags::from_imap_strs(strs), f);
    }

    #[test]
    fn unknown_imap_str_is_ignored() {
        let f = Flags::from_imap_strs(["\\Seen", "$Important"]);
        assert_eq!(f, Flags::SEEN);
    }

    #[test]
    fn prefetch_level_orders_none_lowest() {
        assert!(PrefetchLevel::None < PrefetchLevel::CurrentMessage);
        assert!(PrefetchLevel::CurrentView < PrefetchLevel::FullSync);
    }

    #[test]
    fn address_display_prefers_name() {
        let a = Address { display_name: Some("Jo".into()), mailbox: "jo@x.test".into() };
        assert_eq!(a.to_string(), "Jo <jo@x.test>");
        let b = Address { display_name: None, mailbox: "jo@x.test".into() };
        assert_eq!(b.to_string(), "jo@x.test");
    }
}
