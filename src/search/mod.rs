//! Search Index (C2): full-text index over cached headers and decoded
//! plain-text bodies, backed by [`tantivy`] (attested for exactly this
//! concern in the retrieval pack's `rustmailer-bichon`).

pub mod query;

use crate::errors::{AppError, AppResult};
use crate::types::{Address, Folder, Header, SearchHit, SearchQuery, SearchResult, Uid};
use std::collections::HashMap;
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::schema::{Field, Schema, Value, FAST, INDEXED, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};

struct Fields {
    doc_key: Field,
    folder: Field,
    uid: Field,
    subject: Field,
    from: Field,
    to: Field,
    body: Field,
    date_ts: Field,
}

pub struct SearchIndex {
    index: Index,
    writer: tokio::sync::Mutex<IndexWriter>,
    reader: IndexReader,
    fields: Fields,
    field_map: HashMap<String, Field>,
}

fn doc_key(folder: &str, uid: Uid) -> String {
    format!("{folder}\u{1f}{uid}")
}

fn addresses_to_text(addrs: &[Address]) -> String {
    addrs
        .iter()
        .map(|a| format!("{} {}", a.display_name.clone().unwrap_or_default(), a.mailbox))
        .collect::<Vec<_>>()
        .join(" ")
}

impl SearchIndex {
    pub fn open_or_create(dir: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(dir)?;

        let mut builder = Schema::builder();
        let doc_key = builder.add_text_field("doc_key", STRING | STORED);
        let folder = builder.add_text_field("folder", STRING | STORED);
        let uid = builder.add_u64_field("uid", STORED | FAST | INDEXED);
        let subject = builder.add_text_field("subject", TEXT);
        let from = builder.add_text_field("from", TEXT);
        let to = builder.add_text_field("to", TEXT);
        let body = builder.add_text_field("body", TEXT);
        let date_ts = builder.add_i64_field("date_ts", STORED | FAST | INDEXED);
        let schema = builder.build();

        let index = match Index::open_in_dir(dir) {
            Ok(idx) => idx,
            Err(_) => Index::create_in_dir(dir, schema.clone())
                .map_err(|e| AppError::Unexpected(format!("creating search index: {e}")))?,
        };

        let writer = index
            .writer(50_000_000)
            .map_err(|e| AppError::Unexpected(format!("opening index writer: {e}")))?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .map_err(|e| AppError::Unexpected(format!("opening index reader: {e}")))?;

        let field_map = HashMap::from([
            ("subject".to_string(), subject),
            ("from".to_string(), from),
            ("to".to_string(), to),
            ("body".to_string(), body),
            ("folder".to_string(), folder),
        ]);

        Ok(SearchIndex {
            index,
            writer: tokio::sync::Mutex::new(writer),
            reader,
            fields: Fields { doc_key, folder, uid, subject, from, to, body, date_ts },
            field_map,
        })
    }

    /// Indexes one message. Idempotent: an existing document for the same
    /// (folder, uid) is deleted before the new one is added.
    pub async fn index(
        &self,
        folder: &Folder,
        uid: Uid,
        header: &Header,
        body_plain: Option<&str>,
    ) -> AppResult<()> {
        let key = doc_key(folder.as_str(), uid);
        let mut writer = self.writer.lock().await;
        writer.delete_term(tantivy::Term::from_field_text(self.fields.doc_key, &key));

        let date_ts = header.date.map(|d| d.timestamp()).unwrap_or(0);
        writer
            .add_document(doc!(
                self.fields.doc_key => key,
                self.fields.folder => folder.as_str(),
                self.fields.uid => uid as u64,
                self.fields.subject => header.subject.clone().unwrap_or_default(),
                self.fields.from => addresses_to_text(&header.from),
                self.fields.to => addresses_to_text(&header.to),
                self.fields.body => body_plain.unwrap_or_default(),
                self.fields.date_ts => date_ts,
            ))
            .map_err(|e| AppError::Unexpected(format!("indexing document: {e}")))?;
        writer
            .commit()
            .map_err(|e| AppError::Unexpected(format!("committing index: {e}")))?;
        Ok(())
    }

    /// Removes one message's document. Idempotent.
    pub async fn remove(&self, folder: &Folder, uid: Uid) -> AppResult<()> {
        let key = doc_key(folder.as_str(), uid);
        let mut writer = self.writer.lock().await;
        writer.delete_term(tantivy::Term::from_field_text(self.fields.doc_key, &key));
        writer
            .commit()
            .map_err(|e| AppError::Unexpected(format!("committing index: {e}")))?;
        Ok(())
    }

    /// Executes a query string against the index, ordered by message
    /// wall-clock descending. Hits whose uid is no longer in the cache are
    /// the controller's responsibility to filter; the index itself is
    /// eventually consistent with the cache.
    pub fn search(&self, q: &SearchQuery) -> AppResult<SearchResult> {
        let expr = query::parse(&q.query_string).map_err(AppError::ClientInvariant)?;
        let compiler = query::Compiler { fields: &self.field_map, tokenizers: self.index.tokenizers() };
        let compiled = compiler.compile(&expr).map_err(AppError::ClientInvariant)?;

        let searcher = self.reader.searcher();
        let want = q.offset + q.max + 1;
        let top_docs = searcher
            .search(&compiled, &TopDocs::with_limit(want).order_by_fast_field::<i64>("date_ts", tantivy::Order::Desc))
            .map_err(|e| AppError::Unexpected(format!("search failed: {e}")))?;

        let mut hits = Vec::new();
        for (_score, addr) in top_docs.iter().skip(q.offset).take(q.max) {
            let retrieved: TantivyDocument = searcher
                .doc(*addr)
                .map_err(|e| AppError::Unexpected(format!("fetching doc: {e}")))?;
            let folder = retrieved
                .get_first(self.fields.folder)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let uid = retrieved
                .get_first(self.fields.uid)
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as Uid;
            hits.push(SearchHit { folder: Folder::from(folder), uid, header: None });
        }
        let has_more = top_docs.len() > q.offset + q.max;
        Ok(SearchResult { hits, has_more })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_ts;
    use chrono::DateTime;

    fn header(subject: &str, days_ago_from_epoch: i64) -> Header {
        Header {
            uid: 0,
            message_id: None,
            in_reply_to: None,
            references: vec![],
            date: Some(DateTime::from_timestamp(days_ago_from_epoch, 0).unwrap()),
            date_raw: None,
            from: vec![],
            reply_to: vec![],
            to: vec![],
            cc: vec![],
            bcc: vec![],
            subject: Some(subject.to_string()),
            has_attachments: false,
            raw_header_text: String::new(),
        }
    }

    #[tokio::test]
    async fn search_orders_by_date_descending() {
        let dir = tempfile::tempdir().unwrap();
        let idx = SearchIndex::open_or_create(dir.path()).unwrap();
        let folder = Folder::from("INBOX");

        idx.index(&folder, 1, &header("invoice jan", 1704067200), Some("invoice")).await.unwrap();
        idx.index(&folder, 2, &header("invoice feb", 1706745600), Some("invoice")).await.unwrap();
        idx.index(&folder, 3, &header("invoice mar", 1709251200), Some("invoice")).await.unwrap();

        let result = idx
            .search(&SearchQuery { query_string: r#"subject:"invoice""#.into(), offset: 0, max: 10 })
            .unwrap();
        let uids: Vec<Uid> = result.hits.iter().map(|h| h.uid).collect();
        assert_eq!(uids, vec![3, 2, 1]);
        assert!(!result.has_more);
    }

    #[tokio::test]
    async fn removed_document_no_longer_matches() {
        let dir = tempfile::tempdir().unwrap();
        let idx = SearchIndex::open_or_create(dir.path()).unwrap();
        let folder = Folder::from("INBOX");
        idx.index(&folder, 1, &header("unique-term-xyz", now_ts()), None).await.unwrap();
        idx.remove(&folder, 1).await.unwrap();
        let result = idx
            .search(&SearchQuery { query_string: "unique-term-xyz".into(), offset: 0, max: 10 })
            .unwrap();
        assert!(result.hits.is_empty());
    }

    #[tokio::test]
    async fn reindexing_same_uid_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let idx = SearchIndex::open_or_create(dir.path()).unwrap();
        let folder = Folder::from("INBOX");
        idx.index(&folder, 1, &header("dup-term", now_ts()), None).await.unwrap();
        idx.index(&folder, 1, &header("dup-term", now_ts()), None).await.unwrap();
        let result = idx
            .search(&SearchQuery { query_string: "dup-term".into(), offset: 0, max: 10 })
            .unwrap();
        assert_eq!(result.hits.len(), 1);
    }

    #[tokio::test]
    async fn must_not_excludes_matches() {
        let dir = tempfile::tempdir().unwrap();
        let idx = SearchIndex::open_or_create(dir.path()).unwrap();
        let folder = Folder::from("INBOX");
        idx.index(&folder, 1, &header("invoice", now_ts()), Some("please pay")).await.unwrap();
        idx.index(&folder, 2, &header("invoice spam", now_ts()), Some("spam")).await.unwrap();
        let result = idx
            .search(&SearchQuery { query_string: "invoice -spam".into(), offset: 0, max: 10 })
            .unwrap();
        let uids: Vec<Uid> = result.hits.iter().map(|h| h.uid).collect();
        assert_eq!(uids, vec![1]);
    }
}
