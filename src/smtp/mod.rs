//! SMTP Manager (C6): composes RFC-822 messages and attempts delivery via
//! `lettre`, falling back to the offline outbox queue on transient failure
//! (spec §4.6). Permanent failures (5xx) surface to the caller instead of
//! being queued, since retrying them would never succeed.

use crate::addressbook::AddressBook;
use crate::errors::{AppError, AppResult, SmtpFailureKind};
use crate::queue::OfflineQueue;
use crate::types::Address;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::transport::smtp::response::Response as SmtpResponse;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use tracing::{info, warn};

pub struct ComposeRequest {
    pub from: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub subject: String,
    pub plain_text: String,
    pub html: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

fn to_mailbox(addr: &Address) -> AppResult<Mailbox> {
    let raw = match &addr.display_name {
        Some(name) if !name.is_empty() => format!("{name} <{}>", addr.mailbox),
        _ => addr.mailbox.clone(),
    };
    raw.parse().map_err(|e| AppError::ClientInvariant(format!("invalid address {raw}: {e}")))
}

/// Builds the RFC-822 message bytes for a composed message. Kept separate
/// from sending so drafts and offline-queue entries share the same encoder.
pub fn build_message(req: &ComposeRequest) -> AppResult<Vec<u8>> {
    let mut builder = Message::builder()
        .from(to_mailbox(&req.from)?)
        .subject(&req.subject);

    for addr in &req.to {
        builder = builder.to(to_mailbox(addr)?);
    }
    for addr in &req.cc {
        builder = builder.cc(to_mailbox(addr)?);
    }
    for addr in &req.bcc {
        builder = builder.bcc(to_mailbox(addr)?);
    }
    if let Some(in_reply_to) = &req.in_reply_to {
        builder = builder.in_reply_to(in_reply_to.clone());
    }
    if !req.references.is_empty() {
        builder = builder.references(req.references.join(" "));
    }

    let message = match &req.html {
        Some(html) => builder
            .multipart(
                MultiPart::alternative()
                    .singlepart(SinglePart::builder().header(ContentType::TEXT_PLAIN).body(req.plain_text.clone()))
                    .singlepart(SinglePart::builder().header(ContentType::TEXT_HTML).body(html.clone())),
            )
            .map_err(|e| AppError::ClientInvariant(format!("building message: {e}")))?,
        None => builder
            .header(ContentType::TEXT_PLAIN)
            .body(req.plain_text.clone())
            .map_err(|e| AppError::ClientInvariant(format!("building message: {e}")))?,
    };

    Ok(message.formatted())
}

pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

pub struct SmtpManager {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    queue: Arc<OfflineQueue>,
    addressbook: Arc<AddressBook>,
}

impl SmtpManager {
    pub fn new(config: SmtpConfig, queue: Arc<OfflineQueue>, addressbook: Arc<AddressBook>) -> AppResult<Self> {
        let creds = SmtpCredentials::new(config.user, config.password);
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|e| AppError::Config(format!("smtp relay config for {}: {e}", config.host)))?
            .port(config.port)
            .credentials(creds)
            .build();
        Ok(SmtpManager { transport, queue, addressbook })
    }

    /// Sends one composed message. On transient failure the raw bytes are
    /// queued to the outbox for a later retry; on permanent failure the
    /// caller is expected to offer the user a draft instead (spec §4.6).
    pub async fn send(&self, req: ComposeRequest) -> AppResult<()> {
        let raw = build_message(&req)?;
        let from = req.from.clone();
        let to_all: Vec<Address> = req.to.iter().chain(req.cc.iter()).chain(req.bcc.iter()).cloned().collect();

        let message: Message = raw
            .as_slice()
            .try_into()
            .map_err(|e| AppError::ClientInvariant(format!("re-parsing built message: {e}")))?;

        match self.transport.send(message).await {
            Ok(_resp) => {
                info!(to = to_all.len(), "message sent");
                let _ = self.addressbook.observe_from_address(&from).await;
                Ok(())
            }
            Err(e) => match classify(&e) {
                SmtpFailureKind::Transient => {
                    warn!(error = %e, "smtp send failed transiently, queuing to outbox");
                    self.queue
                        .push_outbox(raw)
                        .await
                        .map_err(|io_err| AppError::Cache(io_err.to_string()))?;
                    Ok(())
                }
                SmtpFailureKind::Permanent => {
                    warn!(error = %e, "smtp send failed permanently");
                    Err(AppError::Smtp(e.to_string()))
                }
            },
        }
    }

    /// Retries everything sitting in the outbox, re-queuing anything that
    /// fails transiently again.
    pub async fn flush_outbox(&self) -> AppResult<usize> {
        let pending = self.queue.pop_outbox().await.map_err(|e| AppError::Cache(e.to_string()))?;
        let mut sent = 0;
        for raw in pending {
            let message: Message = match raw.as_slice().try_into() {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "dropping unparsable outbox entry");
                    continue;
                }
            };
            match self.transport.send(message).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    warn!(error = %e, "outbox retry failed, re-queuing");
                    let _ = self.queue.push_outbox(raw).await;
                }
            }
        }
        Ok(sent)
    }
}

fn classify(err: &lettre::transport::smtp::Error) -> SmtpFailureKind {
    if let Some(code) = err.status() {
        if code.severity == lettre::transport::smtp::response::Severity::PermanentNegativeCompletion {
            return SmtpFailureKind::Permanent;
        }
    }
    SmtpFailureKind::Transient
}

#[allow(dead_code)]
fn response_is_positive(resp: &SmtpResponse) -> bool {
    resp.is_positive()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(name: &str, mailbox: &str) -> Address {
        Address { display_name: Some(name.to_string()), mailbox: mailbox.to_string() }
    }

    #[test]
    fn build_message_plain_text_only() {
        let req = ComposeRequest {
            from: addr("Alice", "alice@x.test"),
            to: vec![addr("Bob", "bob@x.test")],
            cc: vec![],
            bcc: vec![],
            subject: "hi".into(),
            plain_text: "hello".into(),
            html: None,
            in_reply_to: None,
            references: vec![],
        };
        let bytes = build_message(&req).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("Subject: hi"));
        assert!(text.contains("hello"));
    }

    #[test]
    fn build_message_with_html_is_multipart() {
        let req = ComposeRequest {
            from: addr("Alice", "alice@x.test"),
            to: vec![addr("Bob", "bob@x.test")],
            cc: vec![],
            bcc: vec![],
            subject: "hi".into(),
            plain_text: "hello".into(),
            html: Some("<p>hello</p>".into()),
            in_reply_to: None,
            references: vec![],
        };
        let bytes = build_message(&req).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("multipart/alternative"));
    }

    #[test]
    fn invalid_address_is_rejected() {
        let req = ComposeRequest {
            from: addr("Alice", "not-an-address"),
            to: vec![],
            cc: vec![],
            bcc: vec![],
            subject: "hi".into(),
            plain_text: "hello".into(),
            html: None,
            in_reply_to: None,
            references: vec![],
        };
        assert!(build_message(&req).is_err());
    }
}
