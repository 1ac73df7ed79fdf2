//! Connection settings and login credentials.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Error, Result};

/// Default bound on a single call, in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;

fn default_verify_tls() -> bool {
    true
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS)
}

/// Where and how to connect.
///
/// Stored on disk as camelCase JSON:
///
/// ```json
/// { "url": "wss://nas.local/websocket", "verifyTls": false, "callTimeoutSecs": 30 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    #[serde(
        default = "default_call_timeout",
        rename = "callTimeoutSecs",
        with = "duration_secs"
    )]
    pub call_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            verify_tls: default_verify_tls(),
            call_timeout: default_call_timeout(),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_verify_tls(mut self, verify_tls: bool) -> Self {
        self.verify_tls = verify_tls;
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Read a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the path if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// Check that the URL names a WebSocket endpoint.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an empty URL or a non-`ws`/`wss` scheme.
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(Error::Config("no server URL configured".to_string()));
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "URL must start with ws:// or wss://, got {}",
                self.url
            )));
        }
        if self.call_timeout.is_zero() {
            return Err(Error::Config("call timeout must be positive".to_string()));
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// How to authenticate after connecting.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    ApiKey(String),
    Password { username: String, password: String },
}

impl Credentials {
    /// Pick credentials from optional parts. An API key wins over a
    /// username/password pair; empty strings count as absent.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingCredentials` if neither an API key nor a complete
    /// username/password pair is given.
    pub fn from_parts(
        username: Option<&str>,
        password: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<Self> {
        let present = |s: Option<&str>| s.filter(|s| !s.is_empty()).map(str::to_string);

        if let Some(key) = present(api_key) {
            return Ok(Self::ApiKey(key));
        }
        match (present(username), present(password)) {
            (Some(username), Some(password)) => Ok(Self::Password { username, password }),
            _ => Err(Error::MissingCredentials),
        }
    }

    /// Method and params of the login call.
    #[must_use]
    pub fn login_call(&self) -> (&'static str, Value) {
        match self {
            Self::ApiKey(key) => ("auth.login_with_api_key", json!([key])),
            Self::Password { username, password } => ("auth.login", json!([username, password])),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => f.debug_tuple("ApiKey").field(&"<redacted>").finish(),
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config: ClientConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert!(config.verify_tls);
        assert_eq!(config.call_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_camel_case_fields() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"url": "wss://nas.local/websocket", "verifyTls": false, "callTimeoutSecs": 30}"#,
        )
        .unwrap();
        assert_eq!(config.url, "wss://nas.local/websocket");
        assert!(!config.verify_tls);
        assert_eq!(config.call_timeout, Duration::from_secs(30));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["callTimeoutSecs"], 30);
        assert_eq!(json["verifyTls"], false);
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::new("ws://localhost:6000")
            .with_verify_tls(false)
            .with_call_timeout(Duration::from_secs(3));
        assert_eq!(config.url, "ws://localhost:6000");
        assert!(!config.verify_tls);
        assert_eq!(config.call_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_validate() {
        assert!(ClientConfig::new("wss://nas/websocket").validate().is_ok());
        assert!(ClientConfig::new("ws://127.0.0.1:80").validate().is_ok());
        assert!(matches!(
            ClientConfig::default().validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ClientConfig::new("https://nas").validate(),
            Err(Error::Config(_))
        ));
        assert!(
            ClientConfig::new("ws://nas")
                .with_call_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("truenas-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(br#"{"url": "ws://nas:6000", "callTimeoutSecs": 5}"#)
            .unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.url, "ws://nas:6000");
        assert!(config.verify_tls);
        assert_eq!(config.call_timeout, Duration::from_secs(5));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let path = Path::new("/nonexistent/truenas/config.json");
        let err = ClientConfig::load(path).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/truenas/config.json"));
    }

    #[test]
    fn test_credentials_prefer_api_key() {
        let creds = Credentials::from_parts(Some("root"), Some("secret"), Some("1-abc")).unwrap();
        assert_eq!(creds, Credentials::ApiKey("1-abc".to_string()));

        let (method, params) = creds.login_call();
        assert_eq!(method, "auth.login_with_api_key");
        assert_eq!(params, json!(["1-abc"]));
    }

    #[test]
    fn test_credentials_password() {
        let creds = Credentials::from_parts(Some("root"), Some("secret"), Some("")).unwrap();
        let (method, params) = creds.login_call();
        assert_eq!(method, "auth.login");
        assert_eq!(params, json!(["root", "secret"]));
    }

    #[test]
    fn test_credentials_missing() {
        assert!(matches!(
            Credentials::from_parts(None, None, None),
            Err(Error::MissingCredentials)
        ));
        assert!(matches!(
            Credentials::from_parts(Some("root"), None, None),
            Err(Error::MissingCredentials)
        ));
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::Password {
            username: "root".to_string(),
            password: "hunter2".to_string(),
        };
        let debug = format!("{creds:?}");
        assert!(debug.contains("root"));
        assert!(!debug.contains("hunter2"));
        assert!(!format!("{:?}", Credentials::ApiKey("1-abc".into())).contains("1-abc"));
    }
}
