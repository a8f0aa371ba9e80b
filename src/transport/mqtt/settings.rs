//! Transport configuration for both broker connections
//!
//! This module turns the resolved broker address, certificate paths and proxy
//! address into a validated [`TransportSettings`]. Everything here is pure
//! except [`TlsMaterial::load`], which reads the PEM files when the client is
//! initialised.

use super::connection::{ConnectionRole, MqttTuning};
use crate::config::ConfigError;
use rumqttc::{MqttOptions, Proxy, ProxyAuth, ProxyType, Transport as RumqttcTransport};
use std::path::{Path, PathBuf};

/// Default broker port for plaintext connections
pub const DEFAULT_PLAIN_PORT: u16 = 1883;
/// Default broker port for TLS connections
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Broker address. The port is optional; the transport default applies when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub hostname: String,
    pub port: Option<u16>,
}

impl BrokerEndpoint {
    pub fn new(hostname: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

/// Paths of the CA certificate, client certificate and client key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub ca_cert_path: PathBuf,
    pub client_cert_path: PathBuf,
    pub client_key_path: PathBuf,
}

impl TlsMaterial {
    /// Build TLS material from optionally-resolved paths.
    ///
    /// All absent means plaintext (`Ok(None)`); any other partial set is an
    /// error. Empty paths count as absent.
    pub fn from_parts(
        ca_cert: Option<PathBuf>,
        client_cert: Option<PathBuf>,
        client_key: Option<PathBuf>,
    ) -> Result<Option<Self>, ConfigError> {
        let present = |path: Option<PathBuf>| path.filter(|p| !p.as_os_str().is_empty());
        let (ca_cert, client_cert, client_key) =
            (present(ca_cert), present(client_cert), present(client_key));

        match (ca_cert, client_cert, client_key) {
            (None, None, None) => Ok(None),
            (Some(ca_cert_path), Some(client_cert_path), Some(client_key_path)) => Ok(Some(Self {
                ca_cert_path,
                client_cert_path,
                client_key_path,
            })),
            (ca, cert, key) => {
                let missing = [
                    ("ca_cert_path", ca.is_none()),
                    ("client_cert_path", cert.is_none()),
                    ("client_key_path", key.is_none()),
                ]
                .into_iter()
                .filter_map(|(name, absent)| absent.then_some(name))
                .collect();
                Err(ConfigError::IncompleteTls { missing })
            }
        }
    }

    /// Read the three PEM files
    pub async fn load(&self) -> Result<TlsIdentity, ConfigError> {
        Ok(TlsIdentity {
            ca_cert: read_pem(&self.ca_cert_path).await?,
            client_cert: read_pem(&self.client_cert_path).await?,
            client_key: read_pem(&self.client_key_path).await?,
        })
    }
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| ConfigError::CertificateRead {
            path: path.to_path_buf(),
            source,
        })
}

/// PEM bytes loaded from [`TlsMaterial`]
#[derive(Clone, PartialEq, Eq)]
pub struct TlsIdentity {
    pub ca_cert: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

// Key material stays out of logs.
impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("ca_cert", &format_args!("{} bytes", self.ca_cert.len()))
            .field("client_cert", &format_args!("{} bytes", self.client_cert.len()))
            .field("client_key", &"***")
            .finish()
    }
}

/// HTTP proxy used to tunnel the TLS connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub hostname: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

/// How a connection reaches the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSecurity {
    Plaintext,
    Tls(TlsMaterial),
    TlsViaProxy {
        tls: TlsMaterial,
        proxy: ProxyEndpoint,
    },
}

impl TransportSecurity {
    pub fn tls_material(&self) -> Option<&TlsMaterial> {
        match self {
            TransportSecurity::Plaintext => None,
            TransportSecurity::Tls(tls) | TransportSecurity::TlsViaProxy { tls, .. } => Some(tls),
        }
    }

    pub fn proxy(&self) -> Option<&ProxyEndpoint> {
        match self {
            TransportSecurity::TlsViaProxy { proxy, .. } => Some(proxy),
            _ => None,
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            TransportSecurity::Plaintext => DEFAULT_PLAIN_PORT,
            _ => DEFAULT_TLS_PORT,
        }
    }
}

/// Validated transport configuration shared by both connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    endpoint: BrokerEndpoint,
    security: TransportSecurity,
}

impl TransportSettings {
    pub fn new(
        endpoint: BrokerEndpoint,
        tls: Option<TlsMaterial>,
        proxy: Option<ProxyEndpoint>,
    ) -> Result<Self, ConfigError> {
        if endpoint.hostname.trim().is_empty() {
            return Err(ConfigError::MissingHostname);
        }

        let security = match (tls, proxy) {
            (None, None) => TransportSecurity::Plaintext,
            (Some(tls), None) => TransportSecurity::Tls(tls),
            (Some(tls), Some(proxy)) => {
                if proxy.hostname.trim().is_empty() {
                    return Err(ConfigError::InvalidConfig(
                        "proxy hostname must not be empty".to_string(),
                    ));
                }
                TransportSecurity::TlsViaProxy { tls, proxy }
            }
            (None, Some(_)) => return Err(ConfigError::ProxyWithoutTls),
        };

        Ok(Self { endpoint, security })
    }

    /// Plaintext settings for `hostname`, mostly useful in tests and tools
    pub fn plaintext(hostname: impl Into<String>, port: Option<u16>) -> Result<Self, ConfigError> {
        Self::new(BrokerEndpoint::new(hostname, port), None, None)
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn security(&self) -> &TransportSecurity {
        &self.security
    }

    /// Port actually dialled: the configured one or the transport default
    pub fn effective_port(&self) -> u16 {
        self.endpoint
            .port
            .unwrap_or_else(|| self.security.default_port())
    }

    /// Parameters for one connection. Both roles get the same host, port and
    /// security; only the client id differs.
    pub fn connection_parameters(
        &self,
        role: ConnectionRole,
        client_id_prefix: &str,
    ) -> ConnectionParameters {
        ConnectionParameters {
            client_id: format!(
                "{client_id_prefix}-{}-{}",
                role.short_name(),
                uuid::Uuid::new_v4().simple()
            ),
            role,
            host: self.endpoint.hostname.clone(),
            port: self.effective_port(),
            security: self.security.clone(),
        }
    }
}

/// Everything needed to open one broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub client_id: String,
    pub role: ConnectionRole,
    pub host: String,
    pub port: u16,
    pub security: TransportSecurity,
}

impl ConnectionParameters {
    /// Build rumqttc options for these parameters.
    ///
    /// `tls` must be the identity loaded from `security.tls_material()`;
    /// TLS is not applied without it.
    pub fn mqtt_options(&self, tls: Option<&TlsIdentity>, tuning: &MqttTuning) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(&self.client_id, &self.host, self.port);
        mqtt_options.set_keep_alive(tuning.keep_alive);
        mqtt_options.set_clean_session(true);

        if let Some(identity) = tls {
            let transport = RumqttcTransport::tls(
                identity.ca_cert.clone(),
                Some((identity.client_cert.clone(), identity.client_key.clone())),
                None,
            );
            mqtt_options.set_transport(transport);
        }

        if let Some(proxy) = self.security.proxy() {
            mqtt_options.set_proxy(Proxy {
                ty: ProxyType::Http,
                auth: ProxyAuth::None,
                addr: proxy.hostname.clone(),
                port: proxy.port,
            });
        }

        mqtt_options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material() -> TlsMaterial {
        TlsMaterial {
            ca_cert_path: PathBuf::from("/certs/ca.pem"),
            client_cert_path: PathBuf::from("/certs/device.pem"),
            client_key_path: PathBuf::from("/certs/device.key"),
        }
    }

    #[test]
    fn test_plaintext_without_tls() {
        let settings =
            TransportSettings::new(BrokerEndpoint::new("localhost", None), None, None).unwrap();
        assert_eq!(settings.security(), &TransportSecurity::Plaintext);
        assert_eq!(settings.effective_port(), DEFAULT_PLAIN_PORT);
    }

    #[test]
    fn test_tls_without_proxy() {
        let settings = TransportSettings::new(
            BrokerEndpoint::new("broker.example", None),
            Some(material()),
            None,
        )
        .unwrap();
        assert_eq!(settings.security(), &TransportSecurity::Tls(material()));
        assert_eq!(settings.effective_port(), DEFAULT_TLS_PORT);
    }

    #[test]
    fn test_tls_with_proxy() {
        let settings = TransportSettings::new(
            BrokerEndpoint::new("broker.example", Some(9000)),
            Some(material()),
            Some(ProxyEndpoint::new("proxy.local", 8080)),
        )
        .unwrap();
        assert_eq!(
            settings.security().proxy(),
            Some(&ProxyEndpoint::new("proxy.local", 8080))
        );
        assert_eq!(settings.effective_port(), 9000);
    }

    #[test]
    fn test_missing_hostname_rejected() {
        let result = TransportSettings::new(BrokerEndpoint::new("", Some(1883)), None, None);
        assert!(matches!(result, Err(ConfigError::MissingHostname)));

        let result = TransportSettings::new(BrokerEndpoint::new("   ", None), None, None);
        assert!(matches!(result, Err(ConfigError::MissingHostname)));
    }

    #[test]
    fn test_proxy_without_tls_rejected() {
        let result = TransportSettings::new(
            BrokerEndpoint::new("broker.example", None),
            None,
            Some(ProxyEndpoint::new("proxy.local", 8080)),
        );
        assert!(matches!(result, Err(ConfigError::ProxyWithoutTls)));
    }

    #[test]
    fn test_tls_material_all_absent_is_plaintext() {
        assert_eq!(TlsMaterial::from_parts(None, None, None).unwrap(), None);
    }

    #[test]
    fn test_tls_material_partial_sets_rejected() {
        let ca = Some(PathBuf::from("/certs/ca.pem"));
        let cert = Some(PathBuf::from("/certs/device.pem"));
        let key = Some(PathBuf::from("/certs/device.key"));

        let cases = [
            (None, cert.clone(), key.clone(), vec!["ca_cert_path"]),
            (ca.clone(), None, key.clone(), vec!["client_cert_path"]),
            (ca.clone(), cert.clone(), None, vec!["client_key_path"]),
            (
                ca.clone(),
                None,
                None,
                vec!["client_cert_path", "client_key_path"],
            ),
        ];

        for (ca, cert, key, expected) in cases {
            match TlsMaterial::from_parts(ca, cert, key) {
                Err(ConfigError::IncompleteTls { missing }) => assert_eq!(missing, expected),
                other => panic!("expected IncompleteTls, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_tls_material_empty_path_counts_as_missing() {
        let result = TlsMaterial::from_parts(
            Some(PathBuf::from("/certs/ca.pem")),
            Some(PathBuf::new()),
            Some(PathBuf::from("/certs/device.key")),
        );
        assert!(matches!(result, Err(ConfigError::IncompleteTls { .. })));
    }

    #[test]
    fn test_connection_parameters_symmetric() {
        let settings = TransportSettings::new(
            BrokerEndpoint::new("broker.example", None),
            Some(material()),
            Some(ProxyEndpoint::new("proxy.local", 8080)),
        )
        .unwrap();

        let publisher = settings.connection_parameters(ConnectionRole::Publisher, "test");
        let subscriber = settings.connection_parameters(ConnectionRole::Subscriber, "test");

        assert_eq!(publisher.host, subscriber.host);
        assert_eq!(publisher.port, subscriber.port);
        assert_eq!(publisher.security, subscriber.security);
        assert_ne!(publisher.client_id, subscriber.client_id);
        assert!(publisher.client_id.starts_with("test-pub-"));
        assert!(subscriber.client_id.starts_with("test-sub-"));
    }

    #[test]
    fn test_mqtt_options_use_broker_address() {
        let settings = TransportSettings::plaintext("broker.example", Some(1884)).unwrap();
        let params = settings.connection_parameters(ConnectionRole::Publisher, "test");
        let options = params.mqtt_options(None, &MqttTuning::default());
        assert_eq!(
            options.broker_address(),
            ("broker.example".to_string(), 1884)
        );
        assert_eq!(options.client_id(), params.client_id);
    }

    #[test]
    fn test_tls_identity_debug_hides_key() {
        let identity = TlsIdentity {
            ca_cert: b"ca".to_vec(),
            client_cert: b"cert".to_vec(),
            client_key: b"super-secret".to_vec(),
        };
        let rendered = format!("{identity:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("***"));
    }

    #[tokio::test]
    async fn test_load_missing_certificate_fails() {
        let result = material().load().await;
        assert!(matches!(result, Err(ConfigError::CertificateRead { .. })));
    }
}
