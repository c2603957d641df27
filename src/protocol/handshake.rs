//! # Connection Handshake
//!
//! Drives the connect/auth exchange from `Idle` to `Connected`.
//!
//! ```text
//! Idle -> SentConnect -> Authenticating -> Connected
//!                \______________________/       |
//!                 (remote connects directly)  Failed
//! ```
//!
//! Authentication tries every stored credential in order, one signature per
//! challenge; when all are rejected it generates a fresh key pair, offers its
//! public key for bootstrap trust, and waits for the device-side approval
//! connect. The credential is persisted only after the public key was
//! actually sent.
//!
//! The phase transitions are explicit rather than nested control flow so that
//! cancellation (dropping the future) and "give up after exhausting all
//! keys" are single, observable transitions. Timeouts are a caller concern:
//! wrap [`establish`] in `tokio::time::timeout` as needed.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, instrument, warn};

use crate::auth::{Credential, KeyStore};
use crate::config::{BridgeConfig, VERSION, VERSION_MIN, VERSION_SKIP_CHECKSUM};
use crate::core::banner::{local_banner, Banner, FeatureSet};
use crate::core::packet::{
    Command, Packet, AUTH_RSA_PUBLIC_KEY, AUTH_SIGNATURE, AUTH_TOKEN,
};
use crate::error::{constants, BridgeError, Result};
use crate::transport::Connection;

/// Everything pinned at the instant the handshake reaches `Connected`.
/// Immutable for the life of the session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// The remote's parsed identity banner.
    pub banner: Banner,
    /// Locally-understood ∩ remotely-declared capabilities.
    pub features: FeatureSet,
    /// Effective maximum payload size for the session.
    pub max_payload: usize,
    /// Effective protocol version, `min(local, remote)`.
    pub version: u32,
}

impl SessionInfo {
    /// Whether the legacy payload checksum is validated on receipt. Newer
    /// negotiated versions always send zero and skip validation.
    pub fn validate_checksum(&self) -> bool {
        self.version < VERSION_SKIP_CHECKSUM
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SentConnect,
    Authenticating,
}

/// Credential progression within one handshake attempt.
struct AuthAttempt {
    remaining: std::vec::IntoIter<Credential>,
    offered_public_key: bool,
}

impl AuthAttempt {
    fn new(store: &KeyStore) -> Result<Self> {
        Ok(Self {
            remaining: store.iterate()?.into_iter(),
            offered_public_key: false,
        })
    }
}

/// Drive the handshake over a fresh connection until `Connected`, returning
/// the pinned session parameters.
///
/// # Errors
/// - [`BridgeError::ProtocolViolation`] for any command other than
///   connect/auth before the session is established (terminal)
/// - [`BridgeError::UnsupportedVersion`] when the remote declares a version
///   below [`VERSION_MIN`]
/// - [`BridgeError::AuthExhausted`] when no credential was accepted and the
///   bootstrap offer was declined
/// - connection-level errors from the transport
#[instrument(skip_all, fields(features = config.features.len()))]
pub async fn establish<T>(
    conn: &mut Connection<T>,
    config: &BridgeConfig,
    store: &KeyStore,
) -> Result<SessionInfo>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let offered_max = config.transport.offered_max_payload();

    conn.send(Packet::new(
        Command::Connect,
        VERSION,
        offered_max as u32,
        local_banner(&config.features),
    ))
    .await?;

    let mut phase = Phase::SentConnect;
    let mut attempt: Option<AuthAttempt> = None;

    loop {
        let packet = conn.recv().await?;
        match packet.command {
            Command::Connect => {
                // Nonzero remote versions below the interop floor cannot be
                // negotiated down to.
                if packet.arg0 != 0 && packet.arg0 < VERSION_MIN {
                    warn!(
                        version = format_args!("{:#010x}", packet.arg0),
                        "remote protocol version below supported floor"
                    );
                    return Err(BridgeError::UnsupportedVersion(packet.arg0));
                }
                return Ok(finish(config, offered_max, &packet));
            }
            Command::Auth if packet.arg0 == AUTH_TOKEN => {
                phase = Phase::Authenticating;
                if attempt.is_none() {
                    attempt = Some(AuthAttempt::new(store)?);
                }
                if let Some(attempt) = attempt.as_mut() {
                    respond_to_challenge(conn, store, attempt, &packet.payload).await?;
                }
            }
            Command::Auth => {
                // The client side only ever receives token challenges.
                return Err(BridgeError::ProtocolViolation {
                    command: "AUTH",
                    state: phase_name(phase),
                });
            }
            other => {
                return Err(BridgeError::ProtocolViolation {
                    command: other.mnemonic(),
                    state: phase_name(phase),
                });
            }
        }
    }
}

/// Answer one authentication challenge: next stored credential if any,
/// otherwise generate a key pair and offer its public half.
async fn respond_to_challenge<T>(
    conn: &mut Connection<T>,
    store: &KeyStore,
    attempt: &mut AuthAttempt,
    challenge: &[u8],
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if attempt.offered_public_key {
        // A further challenge after the bootstrap offer means the device
        // (or its user) declined the new key.
        warn!("public key offer was declined");
        return Err(BridgeError::AuthExhausted(constants::ERR_AUTH_EXHAUSTED));
    }

    if let Some(credential) = attempt.remaining.next() {
        debug!(name = %credential.name(), "signing challenge with stored credential");
        let signature = credential.sign(challenge)?;
        return conn
            .send(Packet::new(Command::Auth, AUTH_SIGNATURE, 0, signature))
            .await;
    }

    info!("stored credentials exhausted, offering a freshly generated key");
    let credential = Credential::generate(store.key_name())?;
    conn.send(Packet::new(
        Command::Auth,
        AUTH_RSA_PUBLIC_KEY,
        0,
        credential.public_key_payload()?,
    ))
    .await?;
    // Persist only after the offer went out; a failed send must not grow
    // the store.
    store.persist(&credential)?;
    attempt.offered_public_key = true;
    Ok(())
}

/// Pin banner, features, version, and payload ceiling from the remote's
/// connect packet.
fn finish(config: &BridgeConfig, offered_max: usize, packet: &Packet) -> SessionInfo {
    let banner = Banner::parse(&packet.payload);
    if packet.payload.is_empty() {
        warn!("{}", constants::ERR_EMPTY_BANNER);
    }

    let remote_version = packet.arg0;
    let version = if remote_version == 0 {
        VERSION
    } else {
        VERSION.min(remote_version)
    };

    let remote_max = packet.arg1 as usize;
    let max_payload = if remote_max == 0 {
        offered_max
    } else {
        offered_max.min(remote_max)
    };

    let features = FeatureSet::negotiate(&banner.features, &config.features);
    info!(
        product = %banner.product,
        version = format_args!("{version:#010x}"),
        max_payload,
        delayed_ack = features.delayed_ack(),
        "session established"
    );

    SessionInfo {
        banner,
        features,
        max_payload,
        version,
    }
}

fn phase_name(phase: Phase) -> &'static str {
    match phase {
        Phase::SentConnect => "sent-connect",
        Phase::Authenticating => "authenticating",
    }
}
