use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Heartbeat period of the signaling channel; just under typical
/// load-balancer idle-timeout windows.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(42_125);

/// Fixed frame budget of the periodic emitters.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(50);

const AUTH_PATH: &str = "/handler/oauth/access_token";
const SIGNALING_PATH: &str = "/handler/signaling/connection";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Endpoints and timing knobs for one session client.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    origin: Url,
    auth_base: Url,
    role: String,
    heartbeat_interval: Duration,
    frame_interval: Duration,
}

impl RealtimeConfig {
    /// `origin` is the deployment the signaling service lives on;
    /// `auth_base` is the public authorization endpoint. When `origin`
    /// points at a local host, authorization goes through the origin too,
    /// so same-origin development deployments need no extra routing.
    pub fn new(
        origin: impl AsRef<str>,
        auth_base: impl AsRef<str>,
        role: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let origin = parse_base(origin.as_ref())?;
        let auth_base = parse_base(auth_base.as_ref())?;
        let role = role.into();
        if role.is_empty() {
            return Err(ConfigError::Invalid("role cannot be empty".into()));
        }
        Ok(Self {
            origin,
            auth_base,
            role,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            frame_interval: DEFAULT_FRAME_INTERVAL,
        })
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn frame_interval(&self) -> Duration {
        self.frame_interval
    }

    /// Authorization endpoint, relative to the origin for local deployments.
    pub fn auth_endpoint(&self) -> Result<Url, ConfigError> {
        let base = if is_local_host(&self.origin) {
            &self.origin
        } else {
            &self.auth_base
        };
        base.join(AUTH_PATH)
            .map_err(|err| ConfigError::Invalid(format!("invalid auth path: {err}")))
    }

    /// WebSocket endpoint of the signaling service, scoped by `token`.
    pub fn signaling_endpoint(&self, token: &str) -> Result<Url, ConfigError> {
        let mut url = self
            .origin
            .join(SIGNALING_PATH)
            .map_err(|err| ConfigError::Invalid(format!("invalid signaling path: {err}")))?;
        let scheme = if self.origin.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::Invalid("invalid websocket scheme".into()))?;
        url.set_query(Some(&format!("token={token}")));
        Ok(url)
    }
}

fn parse_base(raw: &str) -> Result<Url, ConfigError> {
    let mut base = raw.trim().to_string();
    if base.is_empty() {
        return Err(ConfigError::Invalid("base url cannot be empty".into()));
    }
    if !base.contains("://") {
        base = format!("https://{base}");
    }
    Url::parse(&base).map_err(|err| ConfigError::Invalid(format!("invalid base url {raw}: {err}")))
}

fn is_local_host(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    if host == "localhost" || host == "127.0.0.1" || host == "::1" || host == "[::1]" {
        return true;
    }
    let octets: Vec<u8> = host
        .split('.')
        .filter_map(|part| part.parse::<u8>().ok())
        .collect();
    if octets.len() != 4 {
        return false;
    }
    match octets[0] {
        10 => true,
        192 => octets[1] == 168,
        172 => (16..=31).contains(&octets[1]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(origin: &str) -> RealtimeConfig {
        RealtimeConfig::new(origin, "https://auth.example.com", "browser").unwrap()
    }

    #[test]
    fn auth_endpoint_uses_public_base_for_remote_origins() {
        let endpoint = config("https://app.example.com").auth_endpoint().unwrap();
        assert_eq!(
            endpoint.as_str(),
            "https://auth.example.com/handler/oauth/access_token"
        );
    }

    #[test]
    fn auth_endpoint_switches_to_origin_for_local_hosts() {
        for origin in [
            "http://localhost:8080",
            "http://127.0.0.1:8080",
            "http://10.1.2.3",
            "http://192.168.0.10",
            "http://172.16.5.5",
        ] {
            let endpoint = config(origin).auth_endpoint().unwrap();
            assert!(
                endpoint.as_str().starts_with(origin),
                "{origin} should serve its own auth endpoint, got {endpoint}"
            );
        }
    }

    #[test]
    fn public_172_range_is_not_local() {
        let endpoint = config("http://172.32.0.1").auth_endpoint().unwrap();
        assert!(endpoint.as_str().starts_with("https://auth.example.com"));
    }

    #[test]
    fn signaling_endpoint_derives_ws_scheme() {
        let url = config("https://app.example.com")
            .signaling_endpoint("abc")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "wss://app.example.com/handler/signaling/connection?token=abc"
        );

        let url = config("http://localhost:8080")
            .signaling_endpoint("abc")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:8080/handler/signaling/connection?token=abc"
        );
    }

    #[test]
    fn bare_host_infers_https() {
        let cfg = RealtimeConfig::new("app.example.com", "auth.example.com", "human").unwrap();
        assert_eq!(
            cfg.signaling_endpoint("t").unwrap().scheme(),
            "wss",
            "bare hosts default to tls"
        );
    }

    #[test]
    fn empty_role_rejected() {
        assert!(RealtimeConfig::new("https://a.example.com", "https://b.example.com", "").is_err());
    }
}
