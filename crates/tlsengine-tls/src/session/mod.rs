//! Resumable sessions and the session cache collaborator.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypt::Secret;
use crate::extensions::ExtensionsMap;
use crate::{CipherSuite, ProtocolVersion};

/// Seconds since the UNIX epoch.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Everything needed to resume a session. The secrets are wiped on drop.
#[derive(Clone)]
pub struct SessionParameters {
    pub session_id: Vec<u8>,
    pub cipher_suite: CipherSuite,
    pub version: ProtocolVersion,
    /// Legacy master secret. Empty for TLS 1.3 sessions.
    pub master_secret: Secret,
    pub peer_certificates: Vec<Vec<u8>>,
    pub extended_master_secret: bool,
    pub alpn: Option<Vec<u8>>,
    /// The server's hello extensions when the session was established.
    pub server_extensions: ExtensionsMap,
    pub server_name: Option<String>,
    pub created_at: u64,
    /// TLS 1.3: PSK derived from the resumption master secret.
    pub psk: Option<Secret>,
    /// Opaque ticket naming this session on the server (TLS 1.3 or RFC 5077).
    pub ticket: Option<Vec<u8>>,
    pub ticket_lifetime: u32,
    pub ticket_age_add: u32,
}

impl std::fmt::Debug for SessionParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionParameters")
            .field("session_id_len", &self.session_id.len())
            .field("cipher_suite", &self.cipher_suite)
            .field("version", &self.version)
            .field("extended_master_secret", &self.extended_master_secret)
            .field("has_ticket", &self.ticket.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionParameters {
    /// Whether the session is older than `lifetime` seconds. Zero never expires.
    pub fn is_expired(&self, lifetime: u64) -> bool {
        lifetime != 0 && now_secs().saturating_sub(self.created_at) > lifetime
    }

    /// Ticket age in milliseconds, obfuscated with `ticket_age_add`.
    pub fn obfuscated_ticket_age(&self) -> u32 {
        let age_ms = now_secs().saturating_sub(self.created_at).saturating_mul(1000);
        (age_ms as u32).wrapping_add(self.ticket_age_add)
    }
}

/// A session as held by a connection.
#[derive(Debug, Clone, Default)]
pub struct Session {
    params: Option<SessionParameters>,
    resumable: bool,
}

impl Session {
    pub fn new(params: SessionParameters) -> Self {
        Self {
            params: Some(params),
            resumable: true,
        }
    }

    /// A completed session that may not be resumed.
    pub fn not_resumable(params: SessionParameters) -> Self {
        Self {
            params: Some(params),
            resumable: false,
        }
    }

    pub fn parameters(&self) -> Option<&SessionParameters> {
        self.params.as_ref()
    }

    pub fn is_resumable(&self) -> bool {
        self.resumable && self.params.is_some()
    }

    pub fn session_id(&self) -> &[u8] {
        self.params.as_ref().map_or(&[], |p| p.session_id.as_slice())
    }

    /// Drop the parameters, wiping the master secret, and refuse resumption.
    pub fn invalidate(&mut self) {
        self.params = None;
        self.resumable = false;
    }
}

/// Storage for sessions, keyed by session id, ticket or server name.
pub trait SessionCache: Send + Sync {
    fn put(&self, key: &[u8], params: SessionParameters);
    fn get(&self, key: &[u8]) -> Option<SessionParameters>;
    fn remove(&self, key: &[u8]);
}

/// Bounded in-memory cache with lazy expiry.
pub struct InMemorySessionCache {
    sessions: Mutex<HashMap<Vec<u8>, SessionParameters>>,
    max_size: usize,
    /// Seconds; 0 means sessions never expire.
    lifetime: u64,
}

impl InMemorySessionCache {
    /// Sessions live for two hours by default.
    pub fn new(max_size: usize) -> Self {
        Self::with_lifetime(max_size, 7200)
    }

    pub fn with_lifetime(max_size: usize, lifetime: u64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_size,
            lifetime,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Vec<u8>, SessionParameters>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove every expired entry.
    pub fn cleanup(&self) {
        let lifetime = self.lifetime;
        self.lock().retain(|_, p| !p.is_expired(lifetime));
    }
}

impl std::fmt::Debug for InMemorySessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySessionCache")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl SessionCache for InMemorySessionCache {
    fn put(&self, key: &[u8], params: SessionParameters) {
        if self.max_size == 0 {
            return;
        }
        let mut sessions = self.lock();
        if sessions.len() >= self.max_size && !sessions.contains_key(key) {
            // Evict the oldest entry.
            if let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, p)| p.created_at)
                .map(|(k, _)| k.clone())
            {
                sessions.remove(&oldest);
            }
        }
        sessions.insert(key.to_vec(), params);
    }

    fn get(&self, key: &[u8]) -> Option<SessionParameters> {
        let mut sessions = self.lock();
        let expired = sessions.get(key)?.is_expired(self.lifetime);
        if expired {
            sessions.remove(key);
            return None;
        }
        sessions.get(key).cloned()
    }

    fn remove(&self, key: &[u8]) {
        self.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::secret;

    fn params(id: u8, created_at: u64) -> SessionParameters {
        SessionParameters {
            session_id: vec![id; 32],
            cipher_suite: CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            version: ProtocolVersion::Tls12,
            master_secret: secret(vec![0x42; 48]),
            peer_certificates: vec![],
            extended_master_secret: true,
            alpn: None,
            server_extensions: ExtensionsMap::new(),
            server_name: None,
            created_at,
            psk: None,
            ticket: None,
            ticket_lifetime: 0,
            ticket_age_add: 0,
        }
    }

    #[test]
    fn test_invalidate_drops_secret() {
        let mut s = Session::new(params(1, now_secs()));
        assert!(s.is_resumable());
        assert_eq!(s.session_id(), &[1; 32]);
        s.invalidate();
        assert!(!s.is_resumable());
        assert!(s.parameters().is_none());
        assert!(s.session_id().is_empty());
    }

    #[test]
    fn test_cache_put_get_remove() {
        let cache = InMemorySessionCache::new(4);
        cache.put(&[1; 32], params(1, now_secs()));
        let got = cache.get(&[1; 32]).unwrap();
        assert_eq!(&got.master_secret[..], &[0x42; 48]);
        cache.remove(&[1; 32]);
        assert!(cache.get(&[1; 32]).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_evicts_oldest() {
        let cache = InMemorySessionCache::new(2);
        let now = now_secs();
        cache.put(&[1], params(1, now - 10));
        cache.put(&[2], params(2, now - 5));
        cache.put(&[3], params(3, now));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&[1]).is_none());
        assert!(cache.get(&[3]).is_some());
    }

    #[test]
    fn test_cache_expiry() {
        let cache = InMemorySessionCache::with_lifetime(8, 60);
        cache.put(&[1], params(1, now_secs() - 120));
        cache.put(&[2], params(2, now_secs()));
        assert!(cache.get(&[1]).is_none());
        cache.cleanup();
        assert_eq!(cache.len(), 1);
    }
}
