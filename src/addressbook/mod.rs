//! Address Book (C4): a persistent mapping from message-id to the addresses
//! it contributed, plus a persistent multiset of observed `From:` addresses
//! used to rank lookup results (spec §4.4).
//!
//! Backed by `sqlx`/sqlite following the same migration and query style as
//! the teacher's `storage/db.rs`. Lives at `addressbook.db` under the
//! application directory, per the on-disk layout in spec §6.

use crate::cache::crypto;
use crate::errors::AppResult;
use crate::types::Address;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::path::Path;

pub struct AddressBook {
    pool: SqlitePool,
    /// When set, `mailbox`/`display_name` columns are sealed with the at-rest
    /// cache encryption scheme rather than stored in the clear.
    password: Option<String>,
}

impl AddressBook {
    pub async fn open(app_dir: &Path, password: Option<String>) -> AppResult<Self> {
        std::fs::create_dir_all(app_dir)?;
        let db_path = app_dir.join("addressbook.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&url).await?;
        let book = AddressBook { pool, password };
        book.migrate().await?;
        Ok(book)
    }

    async fn migrate(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_addresses (
                message_id TEXT NOT NULL,
                mailbox BLOB NOT NULL,
                display_name BLOB,
                PRIMARY KEY (message_id, mailbox)
            );

            CREATE TABLE IF NOT EXISTS from_counts (
                mailbox_plain TEXT PRIMARY KEY,
                mailbox BLOB NOT NULL,
                display_name BLOB,
                count INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn seal(&self, plain: &str) -> Vec<u8> {
        match &self.password {
            Some(pw) => crypto::seal(pw, plain.as_bytes()),
            None => plain.as_bytes().to_vec(),
        }
    }

    fn open_blob(&self, blob: &[u8]) -> Option<String> {
        match &self.password {
            Some(pw) => crypto::open(pw, blob).ok().and_then(|b| String::from_utf8(b).ok()),
            None => String::from_utf8(blob.to_vec()).ok(),
        }
    }

    /// Records which addresses a message contributed. Idempotent per
    /// (message_id, mailbox) pair.
    pub async fn record_message_addresses(
        &self,
        message_id: &str,
        addresses: &[Address],
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        for addr in addresses {
            let mailbox = self.seal(&addr.mailbox);
            let display_name = addr.display_name.as_deref().map(|n| self.seal(n));
            sqlx::query(
                "INSERT OR IGNORE INTO message_addresses (message_id, mailbox, display_name) VALUES (?, ?, ?)",
            )
            .bind(message_id)
            .bind(mailbox)
            .bind(display_name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Bumps the `From:` frequency multiset for one address.
    pub async fn observe_from_address(&self, addr: &Address) -> AppResult<()> {
        let mailbox = self.seal(&addr.mailbox);
        let display_name = addr.display_name.as_deref().map(|n| self.seal(n));
        sqlx::query(
            r#"
            INSERT INTO from_counts (mailbox_plain, mailbox, display_name, count)
            VALUES (?, ?, ?, 1)
            ON CONFLICT(mailbox_plain) DO UPDATE SET count = count + 1
            "#,
        )
        .bind(&addr.mailbox)
        .bind(mailbox)
        .bind(display_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns addresses whose mailbox or display name contains `filter`
    /// (case-insensitive), ordered by observed frequency descending.
    pub async fn lookup(&self, filter: &str) -> AppResult<Vec<Address>> {
        let rows = sqlx::query("SELECT mailbox, display_name, count FROM from_counts ORDER BY count DESC")
            .fetch_all(&self.pool)
            .await?;

        let needle = filter.to_lowercase();
        let mut out = Vec::new();
        for row in rows {
            let mailbox_blob: Vec<u8> = row.try_get("mailbox")?;
            let display_blob: Option<Vec<u8>> = row.try_get("display_name")?;
            let Some(mailbox) = self.open_blob(&mailbox_blob) else { continue };
            let display_name = display_blob.and_then(|b| self.open_blob(&b));

            let hay = format!(
                "{} {}",
                display_name.as_deref().unwrap_or(""),
                mailbox
            )
            .to_lowercase();
            if hay.contains(&needle) {
                out.push(Address { display_name, mailbox });
            }
        }
        Ok(out)
    }

    /// Re-keys every encrypted column from `old_password` to `new_password`.
    /// Passing `None` for either side reads/writes plaintext.
    pub async fn rekey(&mut self, new_password: Option<String>) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        let msg_rows = sqlx::query("SELECT rowid, mailbox, display_name FROM message_addresses")
            .fetch_all(&mut *tx)
            .await?;
        for row in msg_rows {
            let rowid: i64 = row.try_get("rowid")?;
            let mailbox_blob: Vec<u8> = row.try_get("mailbox")?;
            let display_blob: Option<Vec<u8>> = row.try_get("display_name")?;
            let mailbox = self.open_blob(&mailbox_blob).unwrap_or_default();
            let display = display_blob.and_then(|b| self.open_blob(&b));

            let new_mailbox = reseal(&new_password, &mailbox);
            let new_display = display.as_deref().map(|d| reseal(&new_password, d));
            sqlx::query("UPDATE message_addresses SET mailbox = ?, display_name = ? WHERE rowid = ?")
                .bind(new_mailbox)
                .bind(new_display)
                .bind(rowid)
                .execute(&mut *tx)
                .await?;
        }

        let from_rows = sqlx::query("SELECT rowid, mailbox, display_name FROM from_counts")
            .fetch_all(&mut *tx)
            .await?;
        for row in from_rows {
            let rowid: i64 = row.try_get("rowid")?;
            let mailbox_blob: Vec<u8> = row.try_get("mailbox")?;
            let display_blob: Option<Vec<u8>> = row.try_get("display_name")?;
            let mailbox = self.open_blob(&mailbox_blob).unwrap_or_default();
            let display = display_blob.and_then(|b| self.open_blob(&b));

            let new_mailbox = reseal(&new_password, &mailbox);
            let new_display = display.as_deref().map(|d| reseal(&new_password, d));
            sqlx::query("UPDATE from_counts SET mailbox = ?, display_name = ? WHERE rowid = ?")
                .bind(new_mailbox)
                .bind(new_display)
                .bind(rowid)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        self.password = new_password;
        Ok(())
    }
}

fn reseal(password: &Option<String>, plain: &str) -> Vec<u8> {
    match password {
        Some(pw) => crypto::seal(pw, plain.as_bytes()),
        None => plain.as_bytes().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(name: &str, mailbox: &str) -> Address {
        Address { display_name: Some(name.to_string()), mailbox: mailbox.to_string() }
    }

    #[tokio::test]
    async fn lookup_orders_by_frequency_descending() {
        let dir = tempfile::tempdir().unwrap();
        let book = AddressBook::open(dir.path(), None).await.unwrap();
        book.observe_from_address(&addr("Alice", "alice@x.test")).await.unwrap();
        book.observe_from_address(&addr("Bob", "bob@x.test")).await.unwrap();
        book.observe_from_address(&addr("Bob", "bob@x.test")).await.unwrap();

        let hits = book.lookup("x.test").await.unwrap();
        assert_eq!(hits[0].mailbox, "bob@x.test");
        assert_eq!(hits[1].mailbox, "alice@x.test");
    }

    #[tokio::test]
    async fn lookup_is_substring_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let book = AddressBook::open(dir.path(), None).await.unwrap();
        book.observe_from_address(&addr("Alice", "alice@EXAMPLE.test")).await.unwrap();
        let hits = book.lookup("example").await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn record_message_addresses_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let book = AddressBook::open(dir.path(), None).await.unwrap();
        let addrs = vec![addr("Alice", "alice@x.test")];
        book.record_message_addresses("<m1@x.test>", &addrs).await.unwrap();
        book.record_message_addresses("<m1@x.test>", &addrs).await.unwrap();
        let row = sqlx::query("SELECT COUNT(*) as c FROM message_addresses")
            .fetch_one(&book.pool)
            .await
            .unwrap();
        let count: i64 = row.try_get("c").unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn rekey_preserves_readability_under_new_password() {
        let dir = tempfile::tempdir().unwrap();
        let mut book = AddressBook::open(dir.path(), Some("old-pw".into())).await.unwrap();
        book.observe_from_address(&addr("Alice", "alice@x.test")).await.unwrap();

        book.rekey(Some("new-pw".into())).await.unwrap();
        let hits = book.lookup("alice").await.unwrap();
        assert_eq!(hits[0].mailbox, "alice@x.test");
    }
}
