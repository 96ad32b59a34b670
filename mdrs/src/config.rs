//! Client configuration. This is the typed record an external
//! connection-string parser produces; once handed to a
//! [`Cluster`](crate::cluster::Cluster) it is read-only.
use std::time::Duration;

/// How long a node may sit idle before the cluster re-checks its liveness.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Default bound on one server-selection attempt.
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Default bound on establishing one connection (TCP + handshake + auth).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Authentication mechanism, when pinned explicitly instead of negotiated.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AuthMechanism {
    ScramSha1,
    ScramSha256,
    MongoDbX509,
}

/// A credential set. `source` is the database the credential is defined on.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    username: String,
    password: Option<String>,
    source: String,
    mechanism: Option<AuthMechanism>,
}

impl Credential {
    pub fn new(username: String, password: Option<String>) -> Self {
        Credential {
            username,
            password,
            source: "admin".into(),
            mechanism: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: String) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_mechanism(mut self, mechanism: AuthMechanism) -> Self {
        self.mechanism = Some(mechanism);
        self
    }

    #[inline]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[inline]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    #[inline]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[inline]
    pub fn mechanism(&self) -> Option<AuthMechanism> {
        self.mechanism
    }
}

/// Raw TLS parameters as they arrive from the connection string. The
/// effective per-connection record is derived by
/// [`TlsOptions::from_config`](crate::tls::TlsOptions::from_config).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TlsParams {
    pub ca_file: Option<String>,
    pub certificate_key_file: Option<String>,
    pub certificate_key_file_password: Option<String>,
    pub allow_invalid_certificates: bool,
    pub allow_invalid_hostnames: bool,
    pub disable_certificate_revocation_check: bool,
    pub disable_ocsp_endpoint_check: bool,
}

/// Immutable client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    hosts: Vec<String>,
    credential: Option<Credential>,
    connect_timeout: Duration,
    socket_timeout: Option<Duration>,
    check_interval: Duration,
    server_selection_timeout: Duration,
    tls: Option<TlsParams>,
    app_name: Option<String>,
}

impl ClientConfig {
    #[inline]
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    #[inline]
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Per-operation socket timeout; `None` means block indefinitely.
    #[inline]
    pub fn socket_timeout(&self) -> Option<Duration> {
        self.socket_timeout
    }

    #[inline]
    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    #[inline]
    pub fn server_selection_timeout(&self) -> Duration {
        self.server_selection_timeout
    }

    #[inline]
    pub fn tls(&self) -> Option<&TlsParams> {
        self.tls.as_ref()
    }

    #[inline]
    pub fn app_name(&self) -> Option<&str> {
        self.app_name.as_deref()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    hosts: Vec<String>,
    credential: Option<Credential>,
    connect_timeout: Option<Duration>,
    socket_timeout: Option<Duration>,
    check_interval: Option<Duration>,
    server_selection_timeout: Option<Duration>,
    tls: Option<TlsParams>,
    app_name: Option<String>,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    #[must_use]
    pub fn with_host(mut self, host: String) -> Self {
        self.hosts.push(host);
        self
    }

    #[must_use]
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_server_selection_timeout(mut self, timeout: Duration) -> Self {
        self.server_selection_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsParams) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn with_app_name(mut self, app_name: String) -> Self {
        self.app_name = Some(app_name);
        self
    }

    pub fn build(self) -> ClientConfig {
        ClientConfig {
            hosts: self.hosts,
            credential: self.credential,
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            socket_timeout: self.socket_timeout,
            check_interval: self.check_interval.unwrap_or(DEFAULT_CHECK_INTERVAL),
            server_selection_timeout: self
                .server_selection_timeout
                .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT),
            tls: self.tls,
            app_name: self.app_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_defaults() {
        let config = ClientConfigBuilder::new().build();
        assert_eq!(config.check_interval(), DEFAULT_CHECK_INTERVAL);
        assert_eq!(
            config.server_selection_timeout(),
            DEFAULT_SERVER_SELECTION_TIMEOUT
        );
        assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
        assert!(config.socket_timeout().is_none());
        assert!(config.credential().is_none());
    }

    #[test]
    fn credential_defaults_to_admin_source() {
        let credential = Credential::new("app".into(), Some("secret".into()));
        assert_eq!(credential.source(), "admin");

        let external = credential.clone().with_source("$external".into());
        assert_eq!(external.source(), "$external");
        assert_eq!(external.username(), "app");
    }
}
