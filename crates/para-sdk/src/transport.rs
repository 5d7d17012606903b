//! Publish/subscribe transport for device telemetry.
//!
//! [`Publish`] is the seam the emulator publishes through; [`Connector`]
//! creates handles. The production pair is [`MqttConnector`] /
//! [`MqttTransport`], an authenticated MQTT session over TLS.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::backoff::Backoff;

const RECONNECT_BASE_MS: u64 = 500;
const RECONNECT_MAX_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to read TLS material {}: {source}", .path.display())]
    TlsMaterial {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("timed out connecting to broker after {0:?}")]
    ConnectTimeout(Duration),
    #[error("broker connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("publish failed: {0}")]
    Publish(#[from] rumqttc::ClientError),
    #[error("invalid TLS configuration: {0}")]
    TlsConfig(String),
    #[error("outgoing queue full, message dropped")]
    Backpressure,
    #[error("transport closed")]
    Closed,
}

/// A handle that can publish concurrently from many tasks.
pub trait Publish: Send + Sync + 'static {
    /// Publish with at-least-once delivery.
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Disconnect. Publishing afterwards fails.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Factory for authenticated transport handles.
pub trait Connector: Send + Sync + 'static {
    type Transport: Publish;

    fn connect(
        &self,
        client_id: &str,
        auth: &BrokerAuth,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

/// Broker username/password.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerAuth {
    pub username: String,
    pub password: String,
}

impl BrokerAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for BrokerAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How the broker connection is secured.
#[derive(Clone)]
pub enum TlsSettings {
    /// Verify the broker against `ca` and present a client certificate.
    /// With `check_hostname` off the chain is still verified but the
    /// certificate may name a different host.
    Verified {
        ca: Vec<u8>,
        client_cert: Vec<u8>,
        client_key: Vec<u8>,
        check_hostname: bool,
    },
    /// Encrypt without verifying the broker. Operator opt-in only.
    Insecure,
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsSettings::Verified { check_hostname, .. } => f
                .debug_struct("TlsSettings::Verified")
                .field("check_hostname", check_hostname)
                .finish_non_exhaustive(),
            TlsSettings::Insecure => f.write_str("TlsSettings::Insecure"),
        }
    }
}

impl TlsSettings {
    /// Load PEM material from disk.
    pub fn from_files(ca: &Path, client_cert: &Path, client_key: &Path) -> Result<Self, TransportError> {
        Ok(TlsSettings::Verified {
            ca: read_pem(ca)?,
            client_cert: read_pem(client_cert)?,
            client_key: read_pem(client_key)?,
            check_hostname: true,
        })
    }

    /// Keep chain verification but accept a broker certificate issued for
    /// another host name.
    pub fn without_hostname_check(self) -> Self {
        match self {
            TlsSettings::Verified {
                ca,
                client_cert,
                client_key,
                ..
            } => TlsSettings::Verified {
                ca,
                client_cert,
                client_key,
                check_hostname: false,
            },
            TlsSettings::Insecure => TlsSettings::Insecure,
        }
    }

    fn transport(&self) -> Result<Transport, TransportError> {
        match self {
            TlsSettings::Verified {
                ca,
                client_cert,
                client_key,
                check_hostname: true,
            } => Ok(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: ca.clone(),
                alpn: None,
                client_auth: Some((client_cert.clone(), client_key.clone())),
            })),
            TlsSettings::Verified {
                ca,
                client_cert,
                client_key,
                check_hostname: false,
            } => {
                let config = chain_only_config(ca, client_cert, client_key)?;
                Ok(Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(config))))
            }
            TlsSettings::Insecure => {
                let config = rustls::ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoServerVerification))
                    .with_no_client_auth();
                Ok(Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(config))))
            }
        }
    }
}

fn tls_config_err(err: impl fmt::Display) -> TransportError {
    TransportError::TlsConfig(err.to_string())
}

/// Client config that verifies the chain against `ca` and ignores the name.
fn chain_only_config(ca: &[u8], client_cert: &[u8], client_key: &[u8]) -> Result<rustls::ClientConfig, TransportError> {
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(ca) {
        roots.add(cert.map_err(tls_config_err)?).map_err(tls_config_err)?;
    }
    let chain = CertificateDer::pem_slice_iter(client_cert)
        .collect::<Result<Vec<_>, _>>()
        .map_err(tls_config_err)?;
    let key = PrivateKeyDer::from_pem_slice(client_key).map_err(tls_config_err)?;
    let verifier = WebPkiServerVerifier::builder(Arc::new(roots))
        .build()
        .map_err(tls_config_err)?;

    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(ChainOnlyVerification(verifier)))
        .with_client_auth_cert(chain, key)
        .map_err(tls_config_err)
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TransportError> {
    std::fs::read(path).map_err(|source| TransportError::TlsMaterial {
        path: path.to_path_buf(),
        source,
    })
}

/// Full WebPKI verification, except that a name mismatch is accepted.
#[derive(Debug)]
struct ChainOnlyVerification(Arc<WebPkiServerVerifier>);

/// The chain is checked before the name, so a name mismatch means the chain
/// itself was trusted.
fn tolerate_name_mismatch(
    result: Result<ServerCertVerified, rustls::Error>,
) -> Result<ServerCertVerified, rustls::Error> {
    match result {
        Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
            Ok(ServerCertVerified::assertion())
        }
        other => other,
    }
}

impl ServerCertVerifier for ChainOnlyVerification {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        tolerate_name_mismatch(self.0.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}

/// Accepts any server certificate.
#[derive(Debug)]
struct NoServerVerification;

impl ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

/// Broker endpoint and session parameters.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Outgoing request queue depth per connection
    pub capacity: usize,
    pub tls: TlsSettings,
}

/// Opens MQTT sessions and waits for the broker's CONNACK.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    settings: MqttSettings,
}

impl MqttConnector {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }
}

impl Connector for MqttConnector {
    type Transport = MqttTransport;

    async fn connect(&self, client_id: &str, auth: &BrokerAuth) -> Result<MqttTransport, TransportError> {
        let mut options = MqttOptions::new(client_id, self.settings.host.clone(), self.settings.port);
        options.set_keep_alive(self.settings.keep_alive);
        options.set_credentials(auth.username.clone(), auth.password.clone());
        options.set_transport(self.settings.tls.transport()?);

        let (client, mut eventloop) = AsyncClient::new(options, self.settings.capacity);

        let handshake = async {
            loop {
                if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
                    return Ok::<(), rumqttc::ConnectionError>(());
                }
            }
        };
        match tokio::time::timeout(self.settings.connect_timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(TransportError::Connection(err)),
            Err(_) => return Err(TransportError::ConnectTimeout(self.settings.connect_timeout)),
        }

        tracing::debug!("MQTT session {} established", client_id);
        let driver = tokio::spawn(drive(eventloop, client_id.to_string()));
        Ok(MqttTransport { client, driver })
    }
}

/// Keeps the session alive: flushes queued publishes, handles acks and
/// reconnects with backoff after connection loss.
async fn drive(mut eventloop: EventLoop, client_id: String) {
    let mut rng = StdRng::from_os_rng();
    let mut backoff = Backoff::new(
        Duration::from_millis(RECONNECT_BASE_MS),
        Duration::from_secs(RECONNECT_MAX_SECS),
    );
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => break,
            Ok(_) => backoff.reset(),
            Err(err) => {
                let delay = backoff.fail(&mut rng);
                tracing::warn!(
                    "MQTT session {} lost: {} (reconnecting in {:?})",
                    client_id,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// One authenticated MQTT session. Safe to publish from many tasks at once.
pub struct MqttTransport {
    client: AsyncClient,
    driver: JoinHandle<()>,
}

impl Publish for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.driver.is_finished() {
            return Err(TransportError::Closed);
        }
        // Never wait for queue space: a stalled session must not stall the
        // devices sharing it.
        match self.client.try_publish(topic, QoS::AtLeastOnce, false, payload) {
            Ok(()) => Ok(()),
            Err(rumqttc::ClientError::TryRequest(_)) => Err(TransportError::Backpressure),
            Err(err) => Err(err.into()),
        }
    }

    async fn close(&self) {
        if let Err(err) = self.client.try_disconnect() {
            tracing::debug!("MQTT disconnect not queued: {}", err);
        }
        // Give the driver a moment to flush the DISCONNECT before tearing it down.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.driver.abort();
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
