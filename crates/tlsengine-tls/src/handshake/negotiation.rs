//! Version, cipher suite, group and ALPN negotiation, plus the Finished
//! verify-data check.

use subtle::ConstantTimeEq;
use tlsengine_types::{AlertDescription, NamedGroup, TlsError};

use super::codec::{DOWNGRADE_TLS11, DOWNGRADE_TLS12};
use crate::crypt::{lookup_suite, CipherSuiteInfo};
use crate::extensions::codec::KeyShareEntry;
use crate::{CipherSuite, ProtocolVersion};

/// Highest version in `local` (highest first) that the peer also offered.
pub fn select_version(
    local: &[ProtocolVersion],
    offered: &[u16],
) -> Result<ProtocolVersion, TlsError> {
    local
        .iter()
        .copied()
        .filter(|v| *v != ProtocolVersion::Ssl3)
        .find(|v| offered.contains(&v.wire()))
        .ok_or_else(|| {
            TlsError::fatal(
                AlertDescription::ProtocolVersion,
                format!("no common protocol version in {offered:04x?}"),
            )
        })
}

/// Versions a ClientHello without `supported_versions` implies: everything
/// from TLS 1.0 up to its legacy_version, capped at TLS 1.2.
pub fn versions_from_legacy(legacy_version: u16) -> Vec<u16> {
    let top = legacy_version.min(ProtocolVersion::Tls12.wire());
    (ProtocolVersion::Tls10.wire()..=top).rev().collect()
}

/// Check a server-selected suite against the client's offer.
pub fn validate_selected_suite(
    selected: CipherSuite,
    offered: &[CipherSuite],
    version: ProtocolVersion,
) -> Result<&'static CipherSuiteInfo, TlsError> {
    let illegal = |why: &str| {
        TlsError::fatal(
            AlertDescription::IllegalParameter,
            format!("server selected cipher suite 0x{:04x}: {why}", selected.0),
        )
    };
    if selected.is_signalling() {
        return Err(illegal("signalling value"));
    }
    if !offered.contains(&selected) {
        return Err(illegal("not offered"));
    }
    let info = lookup_suite(selected).ok_or_else(|| illegal("unknown"))?;
    if !info.usable_at(version) {
        return Err(illegal("not valid for the negotiated version"));
    }
    Ok(info)
}

/// Server-side suite choice in local preference order.
///
/// `acceptable` filters suites the server cannot serve with its current
/// credentials or configuration.
pub fn select_cipher_suite(
    local: &[CipherSuite],
    offered: &[CipherSuite],
    version: ProtocolVersion,
    acceptable: impl Fn(&CipherSuiteInfo) -> bool,
) -> Result<&'static CipherSuiteInfo, TlsError> {
    local
        .iter()
        .filter(|s| offered.contains(s))
        .filter_map(|s| lookup_suite(*s))
        .filter(|info| info.usable_at(version))
        .find(|info| acceptable(info))
        .ok_or(TlsError::NoSharedCipherSuite)
}

/// Write the RFC 8446 downgrade sentinel into a server random when
/// negotiating below the server's maximum.
pub fn apply_downgrade_sentinel(
    random: &mut [u8; 32],
    server_max: ProtocolVersion,
    negotiated: ProtocolVersion,
) {
    if server_max.is_tls13() && negotiated == ProtocolVersion::Tls12 {
        random[24..].copy_from_slice(&DOWNGRADE_TLS12);
    } else if server_max >= ProtocolVersion::Tls12 && negotiated < ProtocolVersion::Tls12 {
        random[24..].copy_from_slice(&DOWNGRADE_TLS11);
    }
}

/// Client check for a downgrade sentinel the server should not have needed.
pub fn check_downgrade(
    server_random: &[u8; 32],
    client_max: ProtocolVersion,
    negotiated: ProtocolVersion,
) -> Result<(), TlsError> {
    let tail = &server_random[24..];
    let downgraded = (client_max.is_tls13() && negotiated <= ProtocolVersion::Tls12 && tail == DOWNGRADE_TLS12)
        || (client_max >= ProtocolVersion::Tls12 && negotiated < ProtocolVersion::Tls12 && tail == DOWNGRADE_TLS11);
    if downgraded {
        return Err(TlsError::fatal(
            AlertDescription::IllegalParameter,
            "downgrade sentinel in server random",
        ));
    }
    Ok(())
}

/// Outcome of matching the client's key shares against local groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyShareChoice {
    /// Use the client's share at this index.
    Share(usize),
    /// No usable share; ask for this group with a HelloRetryRequest.
    Retry(NamedGroup),
}

/// Pick a key share in server preference order, or the group to retry with.
pub fn select_key_share(
    local_groups: &[NamedGroup],
    client_groups: &[NamedGroup],
    client_shares: &[KeyShareEntry],
) -> Result<KeyShareChoice, TlsError> {
    for group in local_groups {
        if let Some(idx) = client_shares.iter().position(|e| e.group == *group) {
            return Ok(KeyShareChoice::Share(idx));
        }
    }
    local_groups
        .iter()
        .find(|g| client_groups.contains(g))
        .map(|g| KeyShareChoice::Retry(*g))
        .ok_or_else(|| {
            TlsError::fatal(AlertDescription::HandshakeFailure, "no common key exchange group")
        })
}

/// First group in local order that the peer also supports.
pub fn select_group(local: &[NamedGroup], peer: &[NamedGroup]) -> Option<NamedGroup> {
    local.iter().copied().find(|g| peer.contains(g))
}

/// Server ALPN choice in local preference order.
///
/// Both sides configured but disjoint is `no_application_protocol`.
pub fn select_alpn(
    local: &[Vec<u8>],
    offered: &[Vec<u8>],
) -> Result<Option<Vec<u8>>, TlsError> {
    if local.is_empty() || offered.is_empty() {
        return Ok(None);
    }
    local
        .iter()
        .find(|p| offered.contains(p))
        .cloned()
        .map(Some)
        .ok_or_else(|| {
            TlsError::fatal(AlertDescription::NoApplicationProtocol, "no common ALPN protocol")
        })
}

/// Constant-time comparison of Finished verify-data.
pub fn check_verify_data(expected: &[u8], received: &[u8]) -> Result<(), TlsError> {
    if expected.ct_eq(received).unwrap_u8() != 1 {
        return Err(TlsError::fatal(
            AlertDescription::DecryptError,
            "Finished verify_data mismatch",
        ));
    }
    Ok(())
}
