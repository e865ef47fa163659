//! Handshake message encoding/decoding (RFC 5246 §7.4, RFC 8446 §4).
//!
//! Encoders return the message body; the connection core adds the 4-byte
//! header. Decoders take the body and fail with `decode_error` on malformed
//! input.

use tlsengine_types::{AlertDescription, SignatureScheme, TlsError};
use tlsengine_utils::{put_len16_with, put_len24_with, put_opaque16, put_opaque24, put_opaque8, put_u16, put_u16_list, put_u32, put_u8, Reader};

use crate::extensions::{ExtensionType, ExtensionsMap};
use crate::CipherSuite;

/// ServerHello.random of a HelloRetryRequest (RFC 8446 §4.1.3).
pub const HELLO_RETRY_REQUEST_RANDOM: [u8; 32] = [
    0xCF, 0x21, 0xAD, 0x74, 0xE5, 0x9A, 0x61, 0x11, 0xBE, 0x1D, 0x8C, 0x02, 0x1E, 0x65, 0xB8, 0x91,
    0xC2, 0xA2, 0x11, 0x16, 0x7A, 0xBB, 0x8C, 0x5E, 0x07, 0x9E, 0x09, 0xE2, 0xC8, 0xA8, 0x33, 0x9C,
];

/// Last 8 bytes of a ServerHello.random when a TLS 1.3 server negotiates
/// TLS 1.2.
pub const DOWNGRADE_TLS12: [u8; 8] = *b"DOWNGRD\x01";
/// Same, for TLS 1.1 and below.
pub const DOWNGRADE_TLS11: [u8; 8] = *b"DOWNGRD\x00";

fn decode_err(msg: String) -> TlsError {
    TlsError::fatal(AlertDescription::DecodeError, msg)
}

// ---------------------------------------------------------------------------
// SignatureAndHashAlgorithm / DigitallySigned
// ---------------------------------------------------------------------------

/// TLS 1.2 `SignatureAndHashAlgorithm`; the same two bytes as a TLS 1.3
/// `SignatureScheme`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignatureAndHashAlgorithm {
    pub hash: u8,
    pub signature: u8,
}

impl SignatureAndHashAlgorithm {
    pub fn from_scheme(s: SignatureScheme) -> Self {
        Self {
            hash: (s.0 >> 8) as u8,
            signature: s.0 as u8,
        }
    }

    pub fn scheme(self) -> SignatureScheme {
        SignatureScheme(u16::from(self.hash) << 8 | u16::from(self.signature))
    }

    pub fn encode(self, out: &mut Vec<u8>) {
        put_u8(out, self.hash);
        put_u8(out, self.signature);
    }

    /// The anonymous signature algorithm is never a valid entry.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, TlsError> {
        let hash = r.read_u8()?;
        let signature = r.read_u8()?;
        if signature == 0 {
            return Err(TlsError::fatal(
                AlertDescription::IllegalParameter,
                "anonymous signature algorithm",
            ));
        }
        Ok(Self { hash, signature })
    }
}

/// A signature, with its algorithm in TLS 1.2 and later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigitallySigned {
    pub algorithm: Option<SignatureScheme>,
    pub signature: Vec<u8>,
}

impl DigitallySigned {
    pub fn encode(&self, out: &mut Vec<u8>) {
        if let Some(alg) = self.algorithm {
            SignatureAndHashAlgorithm::from_scheme(alg).encode(out);
        }
        put_opaque16(out, &self.signature);
    }

    pub fn decode(r: &mut Reader<'_>, with_algorithm: bool) -> Result<Self, TlsError> {
        let algorithm = if with_algorithm {
            Some(SignatureAndHashAlgorithm::decode(r)?.scheme())
        } else {
            None
        };
        let signature = r.read_opaque16()?;
        if signature.is_empty() {
            return Err(decode_err("DigitallySigned: empty signature".into()));
        }
        Ok(Self {
            algorithm,
            signature: signature.to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// ClientHello / ServerHello
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub legacy_version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<CipherSuite>,
    pub compression_methods: Vec<u8>,
    pub extensions: ExtensionsMap,
}

impl ClientHello {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(256);
        put_u16(&mut body, self.legacy_version);
        body.extend_from_slice(&self.random);
        put_opaque8(&mut body, &self.session_id);
        put_u16_list(&mut body, self.cipher_suites.iter().map(|s| s.0));
        put_opaque8(&mut body, &self.compression_methods);
        self.extensions.encode(&mut body);
        body
    }

    pub fn decode(body: &[u8]) -> Result<Self, TlsError> {
        let mut r = Reader::new(body, "ClientHello");
        let legacy_version = r.read_u16()?;
        let random = r.read_array::<32>()?;
        let session_id = r.read_opaque8()?;
        if session_id.len() > 32 {
            return Err(decode_err("ClientHello: session_id too long".into()));
        }
        let cipher_suites = r.read_u16_list()?.into_iter().map(CipherSuite).collect();
        let compression_methods = r.read_opaque8()?;
        if compression_methods.is_empty() {
            return Err(decode_err("ClientHello: no compression methods".into()));
        }
        let extensions = ExtensionsMap::decode_optional(&mut r)?;
        r.expect_end()?;
        if extensions.contains(ExtensionType::PRE_SHARED_KEY)
            && !extensions.is_last(ExtensionType::PRE_SHARED_KEY)
        {
            return Err(TlsError::fatal(
                AlertDescription::IllegalParameter,
                "ClientHello: pre_shared_key is not the last extension",
            ));
        }
        Ok(Self {
            legacy_version,
            random,
            session_id: session_id.to_vec(),
            cipher_suites,
            compression_methods: compression_methods.to_vec(),
            extensions,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub legacy_version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suite: CipherSuite,
    pub compression_method: u8,
    pub extensions: ExtensionsMap,
}

impl ServerHello {
    pub fn is_hello_retry_request(&self) -> bool {
        self.random == HELLO_RETRY_REQUEST_RANDOM
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(128);
        put_u16(&mut body, self.legacy_version);
        body.extend_from_slice(&self.random);
        put_opaque8(&mut body, &self.session_id);
        put_u16(&mut body, self.cipher_suite.0);
        put_u8(&mut body, self.compression_method);
        self.extensions.encode(&mut body);
        body
    }

    pub fn decode(body: &[u8]) -> Result<Self, TlsError> {
        let mut r = Reader::new(body, "ServerHello");
        let legacy_version = r.read_u16()?;
        let random = r.read_array::<32>()?;
        let session_id = r.read_opaque8()?;
        if session_id.len() > 32 {
            return Err(decode_err("ServerHello: session_id too long".into()));
        }
        let cipher_suite = CipherSuite(r.read_u16()?);
        let compression_method = r.read_u8()?;
        let extensions = ExtensionsMap::decode_optional(&mut r)?;
        r.expect_end()?;
        Ok(Self {
            legacy_version,
            random,
            session_id: session_id.to_vec(),
            cipher_suite,
            compression_method,
            extensions,
        })
    }
}

// ---------------------------------------------------------------------------
// EncryptedExtensions
// ---------------------------------------------------------------------------

pub fn encode_encrypted_extensions(ext: &ExtensionsMap) -> Vec<u8> {
    let mut body = Vec::new();
    ext.encode_block(&mut body);
    body
}

pub fn decode_encrypted_extensions(body: &[u8]) -> Result<ExtensionsMap, TlsError> {
    let mut r = Reader::new(body, "EncryptedExtensions");
    let ext = ExtensionsMap::decode(&mut r)?;
    r.expect_end()?;
    Ok(ext)
}

// ---------------------------------------------------------------------------
// Certificate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateEntry {
    pub data: Vec<u8>,
    /// TLS 1.3 only.
    pub extensions: ExtensionsMap,
}

/// Certificate message. `context` is present exactly in TLS 1.3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateMsg {
    pub context: Option<Vec<u8>>,
    pub entries: Vec<CertificateEntry>,
}

impl CertificateMsg {
    pub fn from_chain(chain: &[Vec<u8>], tls13: bool) -> Self {
        Self {
            context: tls13.then(Vec::new),
            entries: chain
                .iter()
                .map(|c| CertificateEntry {
                    data: c.clone(),
                    extensions: ExtensionsMap::new(),
                })
                .collect(),
        }
    }

    pub fn chain(&self) -> Vec<Vec<u8>> {
        self.entries.iter().map(|e| e.data.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        if let Some(ctx) = &self.context {
            put_opaque8(&mut body, ctx);
        }
        let tls13 = self.context.is_some();
        put_len24_with(&mut body, |buf| {
            for e in &self.entries {
                put_opaque24(buf, &e.data);
                if tls13 {
                    e.extensions.encode_block(buf);
                }
            }
        });
        body
    }

    pub fn decode(body: &[u8], tls13: bool) -> Result<Self, TlsError> {
        let mut r = Reader::new(body, "Certificate");
        let context = if tls13 {
            Some(r.read_opaque8()?.to_vec())
        } else {
            None
        };
        let list = r.read_opaque24()?;
        r.expect_end()?;
        let mut lr = Reader::new(list, "Certificate");
        let mut entries = Vec::new();
        while !lr.is_empty() {
            let data = lr.read_opaque24()?;
            if data.is_empty() {
                return Err(decode_err("Certificate: empty certificate".into()));
            }
            let extensions = if tls13 {
                ExtensionsMap::decode(&mut lr)?
            } else {
                ExtensionsMap::new()
            };
            entries.push(CertificateEntry {
                data: data.to_vec(),
                extensions,
            });
        }
        Ok(Self { context, entries })
    }
}

// ---------------------------------------------------------------------------
// CertificateStatus (RFC 6066 §8)
// ---------------------------------------------------------------------------

pub fn encode_certificate_status(ocsp_response: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + ocsp_response.len());
    put_u8(&mut body, 1);
    put_opaque24(&mut body, ocsp_response);
    body
}

pub fn decode_certificate_status(body: &[u8]) -> Result<Vec<u8>, TlsError> {
    let mut r = Reader::new(body, "CertificateStatus");
    let status_type = r.read_u8()?;
    if status_type != 1 {
        return Err(decode_err(format!("CertificateStatus: type {status_type}")));
    }
    let resp = r.read_opaque24()?;
    r.expect_end()?;
    if resp.is_empty() {
        return Err(decode_err("CertificateStatus: empty response".into()));
    }
    Ok(resp.to_vec())
}

// ---------------------------------------------------------------------------
// CertificateRequest
// ---------------------------------------------------------------------------

/// ClientCertificateType codes.
pub const CERT_TYPE_RSA_SIGN: u8 = 1;
pub const CERT_TYPE_ECDSA_SIGN: u8 = 64;

/// Legacy CertificateRequest (RFC 5246 §7.4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest12 {
    pub certificate_types: Vec<u8>,
    /// Present in TLS 1.2 only.
    pub signature_algorithms: Option<Vec<SignatureScheme>>,
    pub authorities: Vec<Vec<u8>>,
}

impl CertificateRequest12 {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        put_opaque8(&mut body, &self.certificate_types);
        if let Some(algs) = &self.signature_algorithms {
            put_u16_list(&mut body, algs.iter().map(|s| s.0));
        }
        put_len16_with(&mut body, |buf| {
            for dn in &self.authorities {
                put_opaque16(buf, dn);
            }
        });
        body
    }

    pub fn decode(body: &[u8], with_algorithms: bool) -> Result<Self, TlsError> {
        let mut r = Reader::new(body, "CertificateRequest");
        let types = r.read_opaque8()?;
        if types.is_empty() {
            return Err(decode_err("CertificateRequest: no certificate types".into()));
        }
        let signature_algorithms = if with_algorithms {
            Some(
                r.read_u16_list()?
                    .into_iter()
                    .map(SignatureScheme)
                    .collect(),
            )
        } else {
            None
        };
        let dns = r.read_opaque16()?;
        r.expect_end()?;
        let mut dr = Reader::new(dns, "CertificateRequest");
        let mut authorities = Vec::new();
        while !dr.is_empty() {
            authorities.push(dr.read_opaque16()?.to_vec());
        }
        Ok(Self {
            certificate_types: types.to_vec(),
            signature_algorithms,
            authorities,
        })
    }
}

/// TLS 1.3 CertificateRequest (RFC 8446 §4.3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest13 {
    pub context: Vec<u8>,
    pub extensions: ExtensionsMap,
}

impl CertificateRequest13 {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        put_opaque8(&mut body, &self.context);
        self.extensions.encode_block(&mut body);
        body
    }

    pub fn decode(body: &[u8]) -> Result<Self, TlsError> {
        let mut r = Reader::new(body, "CertificateRequest");
        let context = r.read_opaque8()?.to_vec();
        let extensions = ExtensionsMap::decode(&mut r)?;
        r.expect_end()?;
        Ok(Self {
            context,
            extensions,
        })
    }
}

// ---------------------------------------------------------------------------
// CertificateVerify, Finished, NewSessionTicket, KeyUpdate
// ---------------------------------------------------------------------------

pub fn encode_certificate_verify(signed: &DigitallySigned) -> Vec<u8> {
    let mut body = Vec::new();
    signed.encode(&mut body);
    body
}

pub fn decode_certificate_verify(body: &[u8], with_algorithm: bool) -> Result<DigitallySigned, TlsError> {
    let mut r = Reader::new(body, "CertificateVerify");
    let signed = DigitallySigned::decode(&mut r, with_algorithm)?;
    r.expect_end()?;
    Ok(signed)
}

pub fn decode_finished(body: &[u8], expected_len: usize) -> Result<&[u8], TlsError> {
    if body.len() != expected_len {
        return Err(decode_err(format!(
            "Finished: {} bytes, expected {expected_len}",
            body.len()
        )));
    }
    Ok(body)
}

/// TLS 1.3 NewSessionTicket (RFC 8446 §4.6.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSessionTicket13 {
    pub lifetime: u32,
    pub age_add: u32,
    pub nonce: Vec<u8>,
    pub ticket: Vec<u8>,
    pub extensions: ExtensionsMap,
}

/// Seven days, the largest lifetime a ticket may advertise.
pub const MAX_TICKET_LIFETIME: u32 = 604_800;

impl NewSessionTicket13 {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        put_u32(&mut body, self.lifetime);
        put_u32(&mut body, self.age_add);
        put_opaque8(&mut body, &self.nonce);
        put_opaque16(&mut body, &self.ticket);
        self.extensions.encode_block(&mut body);
        body
    }

    pub fn decode(body: &[u8]) -> Result<Self, TlsError> {
        let mut r = Reader::new(body, "NewSessionTicket");
        let lifetime = r.read_u32()?;
        let age_add = r.read_u32()?;
        let nonce = r.read_opaque8()?.to_vec();
        let ticket = r.read_opaque16()?;
        if ticket.is_empty() {
            return Err(decode_err("NewSessionTicket: empty ticket".into()));
        }
        let extensions = ExtensionsMap::decode(&mut r)?;
        r.expect_end()?;
        if lifetime > MAX_TICKET_LIFETIME {
            return Err(TlsError::fatal(
                AlertDescription::IllegalParameter,
                "NewSessionTicket: lifetime over seven days",
            ));
        }
        Ok(Self {
            lifetime,
            age_add,
            nonce,
            ticket: ticket.to_vec(),
            extensions,
        })
    }
}

/// TLS 1.2 NewSessionTicket (RFC 5077 §3.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSessionTicket12 {
    pub lifetime_hint: u32,
    pub ticket: Vec<u8>,
}

impl NewSessionTicket12 {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(6 + self.ticket.len());
        put_u32(&mut body, self.lifetime_hint);
        put_opaque16(&mut body, &self.ticket);
        body
    }

    /// An empty ticket is legal: the server chose not to issue one.
    pub fn decode(body: &[u8]) -> Result<Self, TlsError> {
        let mut r = Reader::new(body, "NewSessionTicket");
        let lifetime_hint = r.read_u32()?;
        let ticket = r.read_opaque16()?.to_vec();
        r.expect_end()?;
        Ok(Self {
            lifetime_hint,
            ticket,
        })
    }
}

// ---------------------------------------------------------------------------
// SupplementalData (RFC 4680)
// ---------------------------------------------------------------------------

/// One `SupplementalDataEntry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupplementalDataEntry {
    pub data_type: u16,
    pub data: Vec<u8>,
}

pub fn encode_supplemental_data(entries: &[SupplementalDataEntry]) -> Vec<u8> {
    let mut body = Vec::new();
    put_len24_with(&mut body, |out| {
        for entry in entries {
            put_u16(out, entry.data_type);
            put_opaque16(out, &entry.data);
        }
    });
    body
}

/// Entries in wire order. A type may appear once.
pub fn decode_supplemental_data(body: &[u8]) -> Result<Vec<SupplementalDataEntry>, TlsError> {
    let mut r = Reader::new(body, "SupplementalData");
    let mut list = Reader::new(r.read_opaque24()?, "SupplementalData");
    r.expect_end()?;
    if list.is_empty() {
        return Err(decode_err("SupplementalData: no entries".into()));
    }
    let mut entries: Vec<SupplementalDataEntry> = Vec::new();
    while !list.is_empty() {
        let data_type = list.read_u16()?;
        let data = list.read_opaque16()?.to_vec();
        if entries.iter().any(|e| e.data_type == data_type) {
            return Err(TlsError::fatal(
                AlertDescription::IllegalParameter,
                format!("SupplementalData: duplicate type {data_type}"),
            ));
        }
        entries.push(SupplementalDataEntry { data_type, data });
    }
    Ok(entries)
}

/// KeyUpdateRequest values.
pub const UPDATE_NOT_REQUESTED: u8 = 0;
pub const UPDATE_REQUESTED: u8 = 1;

/// Returns true if the peer asked for an update in return.
pub fn decode_key_update(body: &[u8]) -> Result<bool, TlsError> {
    let mut r = Reader::new(body, "KeyUpdate");
    let request = r.read_u8()?;
    r.expect_end()?;
    match request {
        UPDATE_NOT_REQUESTED => Ok(false),
        UPDATE_REQUESTED => Ok(true),
        other => Err(TlsError::fatal(
            AlertDescription::IllegalParameter,
            format!("KeyUpdate: bad request value {other}"),
        )),
    }
}
