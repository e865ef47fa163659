//! Payload codecs for the individual extensions.
//!
//! `build_*` functions return the extension_data bytes; `parse_*` functions
//! take them back apart and reject trailing garbage.

use tlsengine_types::{AlertDescription, NamedGroup, SignatureScheme, TlsError};
use tlsengine_utils::{put_len16_with, put_opaque16, put_opaque8, put_u16, put_u16_list, put_u32, put_u8, Reader};

use crate::ProtocolVersion;

fn illegal(msg: impl Into<String>) -> TlsError {
    TlsError::fatal(AlertDescription::IllegalParameter, msg)
}

fn decode(msg: impl Into<String>) -> TlsError {
    TlsError::fatal(AlertDescription::DecodeError, msg)
}

/// Extensions that carry no payload (EMS, EtM, early_data and server echoes).
pub fn parse_empty(data: &[u8], name: &str) -> Result<(), TlsError> {
    if data.is_empty() {
        Ok(())
    } else {
        Err(decode(format!("{name}: payload must be empty")))
    }
}

// ---------------------------------------------------------------------------
// server_name (RFC 6066 §3)
// ---------------------------------------------------------------------------

pub fn build_server_name(host: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + host.len());
    put_len16_with(&mut out, |buf| {
        put_u8(buf, 0); // host_name
        put_opaque16(buf, host.as_bytes());
    });
    out
}

/// Returns the host_name entry, if any.
pub fn parse_server_name(data: &[u8]) -> Result<Option<String>, TlsError> {
    let mut r = Reader::new(data, "server_name");
    let list = r.read_opaque16()?;
    r.expect_end()?;
    if list.is_empty() {
        return Err(decode("server_name: empty list"));
    }
    let mut entries = Reader::new(list, "server_name");
    let mut host = None;
    while !entries.is_empty() {
        let name_type = entries.read_u8()?;
        let name = entries.read_opaque16()?;
        if name_type == 0 {
            if host.is_some() {
                return Err(illegal("server_name: two host names"));
            }
            let s = std::str::from_utf8(name).map_err(|_| decode("server_name: not ASCII"))?;
            host = Some(s.to_owned());
        }
    }
    Ok(host)
}

// ---------------------------------------------------------------------------
// supported_groups, ec_point_formats, signature_algorithms
// ---------------------------------------------------------------------------

pub fn build_supported_groups(groups: &[NamedGroup]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u16_list(&mut out, groups.iter().map(|g| g.0));
    out
}

pub fn parse_supported_groups(data: &[u8]) -> Result<Vec<NamedGroup>, TlsError> {
    let mut r = Reader::new(data, "supported_groups");
    let list = r.read_u16_list()?;
    r.expect_end()?;
    Ok(list.into_iter().map(NamedGroup).collect())
}

/// Uncompressed points only.
pub fn build_ec_point_formats() -> Vec<u8> {
    vec![1, 0]
}

pub fn parse_ec_point_formats(data: &[u8]) -> Result<(), TlsError> {
    let mut r = Reader::new(data, "ec_point_formats");
    let formats = r.read_opaque8()?;
    r.expect_end()?;
    if !formats.contains(&0) {
        return Err(illegal("ec_point_formats: uncompressed not offered"));
    }
    Ok(())
}

pub fn build_signature_algorithms(schemes: &[SignatureScheme]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u16_list(&mut out, schemes.iter().map(|s| s.0));
    out
}

pub fn parse_signature_algorithms(data: &[u8]) -> Result<Vec<SignatureScheme>, TlsError> {
    let mut r = Reader::new(data, "signature_algorithms");
    let list = r.read_u16_list()?;
    r.expect_end()?;
    Ok(list.into_iter().map(SignatureScheme).collect())
}

// ---------------------------------------------------------------------------
// ALPN (RFC 7301)
// ---------------------------------------------------------------------------

pub fn build_alpn(protocols: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    put_len16_with(&mut out, |buf| {
        for p in protocols {
            put_opaque8(buf, p);
        }
    });
    out
}

pub fn parse_alpn(data: &[u8]) -> Result<Vec<Vec<u8>>, TlsError> {
    let mut r = Reader::new(data, "alpn");
    let list = r.read_opaque16()?;
    r.expect_end()?;
    let mut names = Reader::new(list, "alpn");
    let mut out = Vec::new();
    while !names.is_empty() {
        let name = names.read_opaque8()?;
        if name.is_empty() {
            return Err(decode("alpn: empty protocol name"));
        }
        out.push(name.to_vec());
    }
    if out.is_empty() {
        return Err(decode("alpn: empty list"));
    }
    Ok(out)
}

/// A server's ALPN answer must name exactly one protocol.
pub fn parse_alpn_selected(data: &[u8]) -> Result<Vec<u8>, TlsError> {
    let mut list = parse_alpn(data)?;
    if list.len() != 1 {
        return Err(decode("alpn: server must select one protocol"));
    }
    Ok(list.remove(0))
}

// ---------------------------------------------------------------------------
// max_fragment_length, status_request, renegotiation_info
// ---------------------------------------------------------------------------

pub fn parse_max_fragment_length(data: &[u8]) -> Result<u8, TlsError> {
    let mut r = Reader::new(data, "max_fragment_length");
    let code = r.read_u8()?;
    r.expect_end()?;
    if !(1..=4).contains(&code) {
        return Err(illegal(format!("max_fragment_length: bad code {code}")));
    }
    Ok(code)
}

/// OCSP status request with no responder ids and no request extensions.
pub fn build_status_request() -> Vec<u8> {
    vec![1, 0, 0, 0, 0]
}

/// Returns true if the request is for OCSP.
pub fn parse_status_request(data: &[u8]) -> Result<bool, TlsError> {
    let mut r = Reader::new(data, "status_request");
    let status_type = r.read_u8()?;
    if status_type != 1 {
        return Ok(false);
    }
    r.read_opaque16()?;
    r.read_opaque16()?;
    r.expect_end()?;
    Ok(true)
}

/// renegotiation_info for an initial handshake: an empty renegotiated_connection.
pub fn build_renegotiation_info() -> Vec<u8> {
    vec![0]
}

pub fn parse_renegotiation_info(data: &[u8]) -> Result<(), TlsError> {
    let mut r = Reader::new(data, "renegotiation_info");
    let conn = r.read_opaque8()?;
    r.expect_end()?;
    if !conn.is_empty() {
        return Err(TlsError::fatal(
            AlertDescription::HandshakeFailure,
            "renegotiation_info: non-empty on initial handshake",
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// supported_versions (RFC 8446 §4.2.1)
// ---------------------------------------------------------------------------

pub fn build_supported_versions_ch(versions: &[ProtocolVersion]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + versions.len() * 2);
    put_u8(&mut out, (versions.len() * 2) as u8);
    for v in versions {
        put_u16(&mut out, v.wire());
    }
    out
}

/// Raw wire values, unknown ones included.
pub fn parse_supported_versions_ch(data: &[u8]) -> Result<Vec<u16>, TlsError> {
    let mut r = Reader::new(data, "supported_versions");
    let list = r.read_opaque8()?;
    r.expect_end()?;
    if list.is_empty() || list.len() % 2 != 0 {
        return Err(decode("supported_versions: bad list length"));
    }
    Ok(list
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

pub fn build_supported_versions_sh(version: ProtocolVersion) -> Vec<u8> {
    version.wire().to_be_bytes().to_vec()
}

pub fn parse_supported_versions_sh(data: &[u8]) -> Result<u16, TlsError> {
    let mut r = Reader::new(data, "supported_versions");
    let v = r.read_u16()?;
    r.expect_end()?;
    Ok(v)
}

// ---------------------------------------------------------------------------
// key_share (RFC 8446 §4.2.8)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyShareEntry {
    pub group: NamedGroup,
    pub key_exchange: Vec<u8>,
}

fn put_key_share_entry(out: &mut Vec<u8>, e: &KeyShareEntry) {
    put_u16(out, e.group.0);
    put_opaque16(out, &e.key_exchange);
}

fn read_key_share_entry(r: &mut Reader<'_>) -> Result<KeyShareEntry, TlsError> {
    let group = NamedGroup(r.read_u16()?);
    let key_exchange = r.read_opaque16()?;
    if key_exchange.is_empty() {
        return Err(decode("key_share: empty key_exchange"));
    }
    Ok(KeyShareEntry {
        group,
        key_exchange: key_exchange.to_vec(),
    })
}

pub fn build_key_share_ch(entries: &[KeyShareEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    put_len16_with(&mut out, |buf| {
        for e in entries {
            put_key_share_entry(buf, e);
        }
    });
    out
}

/// The client's shares. A group appearing twice is `illegal_parameter`.
pub fn parse_key_share_ch(data: &[u8]) -> Result<Vec<KeyShareEntry>, TlsError> {
    let mut r = Reader::new(data, "key_share");
    let list = r.read_opaque16()?;
    r.expect_end()?;
    let mut entries_r = Reader::new(list, "key_share");
    let mut entries: Vec<KeyShareEntry> = Vec::new();
    while !entries_r.is_empty() {
        let e = read_key_share_entry(&mut entries_r)?;
        if entries.iter().any(|x| x.group == e.group) {
            return Err(illegal("key_share: duplicate group"));
        }
        entries.push(e);
    }
    Ok(entries)
}

pub fn build_key_share_sh(entry: &KeyShareEntry) -> Vec<u8> {
    let mut out = Vec::new();
    put_key_share_entry(&mut out, entry);
    out
}

pub fn parse_key_share_sh(data: &[u8]) -> Result<KeyShareEntry, TlsError> {
    let mut r = Reader::new(data, "key_share");
    let e = read_key_share_entry(&mut r)?;
    r.expect_end()?;
    Ok(e)
}

pub fn build_key_share_hrr(group: NamedGroup) -> Vec<u8> {
    group.0.to_be_bytes().to_vec()
}

pub fn parse_key_share_hrr(data: &[u8]) -> Result<NamedGroup, TlsError> {
    let mut r = Reader::new(data, "key_share");
    let g = r.read_u16()?;
    r.expect_end()?;
    Ok(NamedGroup(g))
}

// ---------------------------------------------------------------------------
// cookie, psk_key_exchange_modes
// ---------------------------------------------------------------------------

pub fn build_cookie(cookie: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + cookie.len());
    put_opaque16(&mut out, cookie);
    out
}

pub fn parse_cookie(data: &[u8]) -> Result<Vec<u8>, TlsError> {
    let mut r = Reader::new(data, "cookie");
    let c = r.read_opaque16()?;
    r.expect_end()?;
    if c.is_empty() {
        return Err(decode("cookie: empty"));
    }
    Ok(c.to_vec())
}

/// PSK key exchange mode codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PskKeyExchangeMode {
    PskKe = 0,
    PskDheKe = 1,
}

pub fn build_psk_key_exchange_modes(modes: &[PskKeyExchangeMode]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + modes.len());
    put_u8(&mut out, modes.len() as u8);
    out.extend(modes.iter().map(|m| *m as u8));
    out
}

/// Raw mode codes; unknown values are kept and ignored by the caller.
pub fn parse_psk_key_exchange_modes(data: &[u8]) -> Result<Vec<u8>, TlsError> {
    let mut r = Reader::new(data, "psk_key_exchange_modes");
    let modes = r.read_opaque8()?;
    r.expect_end()?;
    if modes.is_empty() {
        return Err(decode("psk_key_exchange_modes: empty"));
    }
    Ok(modes.to_vec())
}

// ---------------------------------------------------------------------------
// pre_shared_key (RFC 8446 §4.2.11)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PskIdentity {
    pub identity: Vec<u8>,
    pub obfuscated_ticket_age: u32,
}

/// The client's OfferedPsks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedPsks {
    pub identities: Vec<PskIdentity>,
    pub binders: Vec<Vec<u8>>,
}

impl OfferedPsks {
    /// Size of the encoded binders list, which trails the extension and is
    /// excluded from the binder transcript.
    pub fn binders_len(&self) -> usize {
        2 + self.binders.iter().map(|b| 1 + b.len()).sum::<usize>()
    }
}

pub fn build_pre_shared_key_ch(offer: &OfferedPsks) -> Vec<u8> {
    let mut out = Vec::new();
    put_len16_with(&mut out, |buf| {
        for id in &offer.identities {
            put_opaque16(buf, &id.identity);
            put_u32(buf, id.obfuscated_ticket_age);
        }
    });
    put_len16_with(&mut out, |buf| {
        for b in &offer.binders {
            put_opaque8(buf, b);
        }
    });
    out
}

pub fn parse_pre_shared_key_ch(data: &[u8]) -> Result<OfferedPsks, TlsError> {
    let mut r = Reader::new(data, "pre_shared_key");
    let ids = r.read_opaque16()?;
    let binders = r.read_opaque16()?;
    r.expect_end()?;

    let mut ids_r = Reader::new(ids, "pre_shared_key");
    let mut identities = Vec::new();
    while !ids_r.is_empty() {
        let identity = ids_r.read_opaque16()?;
        if identity.is_empty() {
            return Err(decode("pre_shared_key: empty identity"));
        }
        identities.push(PskIdentity {
            identity: identity.to_vec(),
            obfuscated_ticket_age: ids_r.read_u32()?,
        });
    }
    let mut binders_r = Reader::new(binders, "pre_shared_key");
    let mut binder_list = Vec::new();
    while !binders_r.is_empty() {
        let b = binders_r.read_opaque8()?;
        if b.len() < 32 {
            return Err(decode("pre_shared_key: binder too short"));
        }
        binder_list.push(b.to_vec());
    }
    if identities.is_empty() || identities.len() != binder_list.len() {
        return Err(illegal("pre_shared_key: identity and binder counts differ"));
    }
    Ok(OfferedPsks {
        identities,
        binders: binder_list,
    })
}

pub fn build_pre_shared_key_sh(selected: u16) -> Vec<u8> {
    selected.to_be_bytes().to_vec()
}

pub fn parse_pre_shared_key_sh(data: &[u8]) -> Result<u16, TlsError> {
    let mut r = Reader::new(data, "pre_shared_key");
    let idx = r.read_u16()?;
    r.expect_end()?;
    Ok(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name() {
        let data = build_server_name("example.com");
        assert_eq!(parse_server_name(&data).unwrap().as_deref(), Some("example.com"));
        assert!(parse_server_name(&[0, 0]).is_err());
    }

    #[test]
    fn test_alpn_selected_requires_single() {
        let two = build_alpn(&[b"h2".to_vec(), b"http/1.1".to_vec()]);
        assert_eq!(parse_alpn(&two).unwrap().len(), 2);
        assert!(parse_alpn_selected(&two).is_err());
        let one = build_alpn(&[b"h2".to_vec()]);
        assert_eq!(parse_alpn_selected(&one).unwrap(), b"h2");
    }

    #[test]
    fn test_max_fragment_length_codes() {
        assert_eq!(parse_max_fragment_length(&[2]).unwrap(), 2);
        let err = parse_max_fragment_length(&[5]).unwrap_err();
        assert_eq!(err.alert(), Some(AlertDescription::IllegalParameter));
    }

    #[test]
    fn test_renegotiation_info_must_be_empty() {
        assert!(parse_renegotiation_info(&build_renegotiation_info()).is_ok());
        let err = parse_renegotiation_info(&[1, 0xAA]).unwrap_err();
        assert_eq!(err.alert(), Some(AlertDescription::HandshakeFailure));
    }

    #[test]
    fn test_supported_versions() {
        let data = build_supported_versions_ch(&[ProtocolVersion::Tls13, ProtocolVersion::Tls12]);
        assert_eq!(data, vec![4, 0x03, 0x04, 0x03, 0x03]);
        assert_eq!(parse_supported_versions_ch(&data).unwrap(), vec![0x0304, 0x0303]);
        assert!(parse_supported_versions_ch(&[3, 3, 4, 3]).is_err());
    }

    #[test]
    fn test_key_share_duplicate_group() {
        let e = KeyShareEntry {
            group: NamedGroup::X25519,
            key_exchange: vec![7; 32],
        };
        let data = build_key_share_ch(&[e.clone(), e]);
        let err = parse_key_share_ch(&data).unwrap_err();
        assert_eq!(err.alert(), Some(AlertDescription::IllegalParameter));
    }

    #[test]
    fn test_pre_shared_key_binders_len() {
        let offer = OfferedPsks {
            identities: vec![PskIdentity {
                identity: b"client".to_vec(),
                obfuscated_ticket_age: 0,
            }],
            binders: vec![vec![0; 32]],
        };
        let data = build_pre_shared_key_ch(&offer);
        assert_eq!(offer.binders_len(), 35);
        // identities(2 + 2 + 6 + 4) + binders(35)
        assert_eq!(data.len(), 14 + 35);
        assert_eq!(parse_pre_shared_key_ch(&data).unwrap(), offer);
    }

    #[test]
    fn test_pre_shared_key_count_mismatch() {
        let offer = OfferedPsks {
            identities: vec![PskIdentity {
                identity: b"a".to_vec(),
                obfuscated_ticket_age: 0,
            }],
            binders: vec![vec![0; 32], vec![1; 32]],
        };
        let err = parse_pre_shared_key_ch(&build_pre_shared_key_ch(&offer)).unwrap_err();
        assert_eq!(err.alert(), Some(AlertDescription::IllegalParameter));
    }
}
