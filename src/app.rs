//! Wiring: turns a parsed [`Cli`] + [`Config`] into a running engine
//! (Cache, Address Book, Search Index, Offline Queue, IMAP Manager, SMTP
//! Manager, Sleep Detector, Status Aggregator, Controller) and drives the
//! IMAP Manager's response stream into the controller's cache.
//!
//! This crate implements the mail engine core only; it has no terminal UI
//! of its own to drive. `run()` is the headless event loop a UI layer would
//! sit on top of.

use crate::addressbook::AddressBook;
use crate::cache::{Cache, CacheConfig};
use crate::cli::{Cli, Command};
use crate::config::{AuthMechanism, Config};
use crate::controller::Controller;
use crate::errors::{AppError, AppResult};
use crate::imap::worker::{spawn, ImapManagerConfig};
use crate::imap::Credentials;
use crate::oauth::SecretStore;
use crate::queue::OfflineQueue;
use crate::search::SearchIndex;
use crate::sleep::{self, SleepDetectorConfig};
use crate::smtp::{SmtpConfig, SmtpManager};
use crate::status::StatusHandle;
use crate::types::{Address, Folder, PrefetchLevel};
use std::sync::Arc;
use tracing::info;

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::ExportMaildir { folder, destination } => {
            let cache = open_cache(&config).await?;
            let count = crate::export::export_folder(&cache, &Folder::from(folder), &destination).await?;
            info!(count, destination = %destination.display(), "export complete");
            Ok(())
        }
        Command::ChangePassword => {
            change_password(&config).await
        }
        Command::Run => run_engine(config).await,
    }
}

async fn open_cache(config: &Config) -> AppResult<Cache> {
    let password = load_cache_password(config)?;
    Ok(Cache::new(CacheConfig { root: config.cache_dir.clone(), encryption_password: password }))
}

fn load_cache_password(config: &Config) -> AppResult<Option<String>> {
    if !config.cache_encryption {
        return Ok(None);
    }
    SecretStore::new(&config.email).load("cache_password")
}

async fn change_password(config: &Config) -> anyhow::Result<()> {
    let store = SecretStore::new(&config.email);
    let old = store.load("cache_password")?;
    let new = std::env::var("WRENMAIL_NEW_PASSWORD")
        .map_err(|_| AppError::Config("WRENMAIL_NEW_PASSWORD not set".into()))?;

    let mut book = AddressBook::open(&config.cache_dir, old).await?;
    book.rekey(Some(new.clone())).await?;
    store.save("cache_password", &new)?;
    info!("address book re-keyed under new password");
    Ok(())
}

fn resolve_credentials(config: &Config) -> AppResult<Credentials> {
    let store = SecretStore::new(&config.email);
    let secret = store
        .load("imap_password")?
        .ok_or_else(|| AppError::Config("no imap credential stored for this account".into()))?;
    Ok(match config.auth_mechanism {
        AuthMechanism::Plain => Credentials::Plain { user: config.email.clone(), password: secret },
        AuthMechanism::Login => Credentials::Login { user: config.email.clone(), password: secret },
        AuthMechanism::XOAuth2 => Credentials::XOAuth2 { user: config.email.clone(), access_token: secret },
    })
}

async fn run_engine(config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.cache_dir)?;

    let cache = Arc::new(open_cache(&config).await?);
    let search = Arc::new(SearchIndex::open_or_create(&config.cache_dir.join("search"))?);
    let addressbook = Arc::new(AddressBook::open(&config.cache_dir, load_cache_password(&config)?).await?);
    let queue = Arc::new(OfflineQueue::open(&config.cache_dir).await?);
    let (status, mut redraw_rx) = StatusHandle::new();

    let credentials = resolve_credentials(&config)?;
    let (imap, mut responses) = spawn(
        ImapManagerConfig {
            host: config.imap_host.clone(),
            port: config.imap_port,
            credentials,
            inbox: Folder::from(config.inbox.clone()),
            start_offline: config.offline,
        },
        cache.clone(),
        search.clone(),
        status.clone(),
    );

    let smtp_secret = SecretStore::new(&config.email)
        .load("smtp_password")?
        .ok_or_else(|| AppError::Config("no smtp credential stored for this account".into()))?;
    let smtp = Arc::new(SmtpManager::new(
        SmtpConfig {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            user: config.email.clone(),
            password: smtp_secret,
        },
        queue.clone(),
        addressbook.clone(),
    )?);

    let controller = Arc::new(Controller::new(
        imap.clone(),
        smtp.clone(),
        queue.clone(),
        cache.clone(),
        Address { display_name: None, mailbox: config.email.clone() },
        Folder::from(config.inbox.clone()),
        Folder::from(config.sent_folder.clone()),
        Folder::from(config.trash_folder.clone()),
        config.client_store_sent,
        config.prefetch_level,
    ));

    if config.prefetch_level == PrefetchLevel::FullSync {
        let sync_controller = controller.clone();
        tokio::spawn(async move {
            if let Err(e) = sync_controller.run_full_sync().await {
                tracing::warn!(error = %e, "full sync failed");
            }
        });
    }

    let mut sleep_wakeups = sleep::spawn(SleepDetectorConfig::default());
    let wakeup_imap = imap.clone();
    tokio::spawn(async move {
        while sleep_wakeups.recv().await.is_some() {
            wakeup_imap.force_wakeup();
        }
    });

    if let Err(e) = smtp.flush_outbox().await {
        tracing::warn!(error = %e, "outbox flush on startup failed");
    }

    if config.compose_backup_interval_secs > 0 {
        let backup_controller = controller.clone();
        let interval = std::time::Duration::from_secs(config.compose_backup_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = backup_controller.backup_compose().await {
                    tracing::warn!(error = %e, "compose backup failed");
                }
            }
        });
    }

    controller.switch_folder(Folder::from(config.inbox.clone())).await;

    loop {
        tokio::select! {
            response = responses.recv() => {
                match response {
                    Some(resp) => {
                        if let Some(uids) = resp.uids {
                            controller.ingest_uids(uids).await;
                        }
                        if !resp.headers.is_empty() {
                            controller.ingest_headers(resp.headers).await;
                        }
                    }
                    None => break,
                }
            }
            _ = redraw_rx.changed() => {
                // a UI layer would repaint here; the headless engine has
                // nothing further to do on a redraw signal.
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                imap.shutdown();
                break;
            }
        }
    }

    Ok(())
}
