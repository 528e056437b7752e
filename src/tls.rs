//! TLS material loading and per-SNI certificate resolution
//!
//! Listeners with static `cert`/`key` paths load their material once at
//! bind time. Listeners with `cert_template`/`key_template` patterns
//! resolve material per handshake through [`SniResolver`]: the first
//! handshake for a hostname reads the templated cert/key pair from disk,
//! every concurrent handshake for the same hostname waits on that read,
//! and the outcome (success or failure) is cached for the lifetime of the
//! resolver.

use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Token replaced with the SNI hostname in templated cert/key paths
pub const HOSTNAME_TOKEN: &str = ":hostname";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Per-hostname cache entry. Transitions once from `Pending` to a
/// terminal state and is then immutable for the resolver's lifetime.
enum CacheEntry {
    /// A read is in flight; queued handshakes wait here in arrival order
    Pending(Vec<oneshot::Sender<Option<Arc<ServerConfig>>>>),
    Resolved(Arc<ServerConfig>),
    Failed,
}

/// Resolves TLS server configurations per SNI hostname with single-flight
/// reads and a permanent cache.
pub struct SniResolver {
    cert_template: String,
    key_template: String,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl SniResolver {
    pub fn new(cert_template: impl Into<String>, key_template: impl Into<String>) -> Self {
        Self {
            cert_template: cert_template.into(),
            key_template: key_template.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the server configuration for a hostname.
    ///
    /// Returns `None` for hostnames whose material cannot be loaded; the
    /// negative result is cached and the hostname is never retried.
    pub async fn resolve(&self, hostname: &str) -> Option<Arc<ServerConfig>> {
        let hostname = hostname.to_ascii_lowercase();
        if !valid_sni_hostname(&hostname) {
            warn!(hostname, "Rejecting invalid SNI hostname");
            return None;
        }

        // Fast path and single-flight enrollment under one lock
        let waiter = {
            let mut cache = self.cache.lock();
            match cache.get_mut(&hostname) {
                Some(CacheEntry::Resolved(config)) => return Some(Arc::clone(config)),
                Some(CacheEntry::Failed) => return None,
                Some(CacheEntry::Pending(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    cache.insert(hostname.clone(), CacheEntry::Pending(Vec::new()));
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            // Another handshake owns the read; wait for its outcome
            return rx.await.unwrap_or(None);
        }

        let result = self.load(&hostname).await;

        // Store the terminal entry, then release queued waiters in
        // enqueue order
        let waiters = {
            let mut cache = self.cache.lock();
            let entry = match &result {
                Some(config) => CacheEntry::Resolved(Arc::clone(config)),
                None => CacheEntry::Failed,
            };
            match cache.insert(hostname.clone(), entry) {
                Some(CacheEntry::Pending(waiters)) => waiters,
                _ => Vec::new(),
            }
        };
        for tx in waiters {
            let _ = tx.send(result.clone());
        }

        result
    }

    /// Read and assemble the cert/key pair for a hostname (one read pair
    /// per hostname, guarded by the Pending entry)
    async fn load(&self, hostname: &str) -> Option<Arc<ServerConfig>> {
        let cert_path = self.cert_template.replace(HOSTNAME_TOKEN, hostname);
        let key_path = self.key_template.replace(HOSTNAME_TOKEN, hostname);

        debug!(hostname, cert = %cert_path, key = %key_path, "Resolving certificate");

        let read_pair = tokio::try_join!(
            tokio::fs::read(&cert_path),
            tokio::fs::read(&key_path)
        );

        let (cert_pem, key_pem) = match read_pair {
            Ok(pair) => pair,
            Err(e) => {
                error!(hostname, error = %e, "Failed to read certificate material");
                return None;
            }
        };

        let assembled = parse_certs(&cert_pem)
            .and_then(|certs| parse_private_key(&key_pem).map(|key| (certs, key)))
            .and_then(|(certs, key)| build_server_config(certs, key));

        match assembled {
            Ok(config) => {
                debug!(hostname, "Certificate resolved");
                Some(config)
            }
            Err(e) => {
                error!(hostname, error = %e, "Failed to build TLS context");
                None
            }
        }
    }
}

/// Validate an SNI hostname before it is substituted into a filesystem
/// path: DNS length limit, DNS charset, no empty or dot-led names.
fn valid_sni_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    if hostname.starts_with('.') || hostname.contains("..") {
        return false;
    }
    hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Parse a PEM certificate chain
pub fn parse_certs(pem: &[u8]) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates: {}", e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found");
    }

    Ok(certs)
}

/// Parse the first PEM private key (PKCS#1, PKCS#8 or SEC1)
pub fn parse_private_key(pem: &[u8]) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key: {}", e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found")
}

/// Load a PEM certificate chain from a file (static listeners)
pub fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("Failed to read certificate file {}: {}", path, e))?;
    parse_certs(&pem).map_err(|e| anyhow::anyhow!("{} in {}", e, path))
}

/// Load a PEM private key from a file (static listeners)
pub fn load_private_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("Failed to read key file {}: {}", path, e))?;
    parse_private_key(&pem).map_err(|e| anyhow::anyhow!("{} in {}", e, path))
}

/// Assemble a rustls server configuration from parsed material
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
    Ok(Arc::new(config))
}
