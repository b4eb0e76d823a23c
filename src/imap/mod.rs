//! IMAP connection establishment: TCP + TLS (rustls, native root store) +
//! greeting + SASL authentication, adapted from the teacher's XOAUTH2-only
//! `ImapClient::connect`. The manager itself lives in [`worker`].

pub mod worker;

use crate::errors::{AppError, AppResult};
use async_imap::{Authenticator, Client, Session};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::{Arc, Once};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

pub type ImapSession = Session<Compat<TlsStream<TcpStream>>>;

static INSTALL_CRYPTO_PROVIDER: Once = Once::new();

fn ensure_crypto_provider() {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Credentials accepted by [`connect`], covering the three SASL mechanisms
/// the spec requires (§6): `PLAIN`, `LOGIN`, `XOAUTH2`.
pub enum Credentials {
    Plain { user: String, password: String },
    Login { user: String, password: String },
    XOAuth2 { user: String, access_token: String },
}

pub async fn connect(host: &str, port: u16, creds: &Credentials) -> AppResult<ImapSession> {
    ensure_crypto_provider();

    let mut root_store = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs()
        .map_err(|e| AppError::Transport(format!("loading native certs: {e}")))?
    {
        root_store
            .add(cert)
            .map_err(|e| AppError::Transport(format!("adding root cert: {e}")))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| AppError::Transport(format!("connecting to {host}:{port}: {e}")))?;

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| AppError::Transport(format!("invalid server name {host}: {e}")))?;
    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| AppError::Transport(format!("TLS handshake: {e}")))?;

    let compat_stream = tls_stream.compat();
    let mut client = Client::new(compat_stream);
    let _greeting = client
        .read_response()
        .await
        .map_err(|e| AppError::Transport(format!("reading IMAP greeting: {e}")))?
        .ok_or_else(|| AppError::Transport("connection closed before greeting".into()))?;

    let session = match creds {
        Credentials::Plain { user, password } => client
            .login(user, password)
            .await
            .map_err(|(e, _)| AppError::Auth(e.to_string()))?,
        Credentials::Login { user, password } => client
            .authenticate("LOGIN", LoginAuth { user: user.clone(), password: password.clone() })
            .await
            .map_err(|(e, _)| AppError::Auth(e.to_string()))?,
        Credentials::XOAuth2 { user, access_token } => client
            .authenticate(
                "XOAUTH2",
                Xoauth2 { user: user.clone(), access_token: access_token.clone() },
            )
            .await
            .map_err(|(e, _)| AppError::Auth(e.to_string()))?,
    };

    Ok(session)
}

struct Xoauth2 {
    user: String,
    access_token: String,
}

impl Authenticator for Xoauth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> String {
        format!("user={}\x01auth=Bearer {}\x01\x01", self.user, self.access_token)
    }
}

/// SASL LOGIN mechanism, a simple two-step username/password exchange.
struct LoginAuth {
    user: String,
    password: String,
}

impl Authenticator for LoginAuth {
    type Response = String;

    fn process(&mut self, challenge: &[u8]) -> String {
        match challenge {
            b"Username:" => self.user.clone(),
            _ => self.password.clone(),
        }
    }
}
