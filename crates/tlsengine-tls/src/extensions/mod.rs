//! TLS extensions: the per-message extensions map and the TLS 1.3
//! permission table.

pub mod codec;

use tlsengine_types::{AlertDescription, TlsError};
use tlsengine_utils::{put_opaque16, put_u16, Reader};

/// TLS extension type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExtensionType(pub u16);

impl ExtensionType {
    pub const SERVER_NAME: Self = Self(0);
    pub const MAX_FRAGMENT_LENGTH: Self = Self(1);
    pub const STATUS_REQUEST: Self = Self(5);
    pub const SUPPORTED_GROUPS: Self = Self(10);
    pub const EC_POINT_FORMATS: Self = Self(11);
    pub const SIGNATURE_ALGORITHMS: Self = Self(13);
    pub const USE_SRTP: Self = Self(14);
    pub const HEARTBEAT: Self = Self(15);
    pub const APPLICATION_LAYER_PROTOCOL_NEGOTIATION: Self = Self(16);
    pub const SIGNED_CERTIFICATE_TIMESTAMP: Self = Self(18);
    pub const CLIENT_CERTIFICATE_TYPE: Self = Self(19);
    pub const SERVER_CERTIFICATE_TYPE: Self = Self(20);
    pub const PADDING: Self = Self(21);
    pub const ENCRYPT_THEN_MAC: Self = Self(22);
    pub const EXTENDED_MASTER_SECRET: Self = Self(23);
    pub const COMPRESS_CERTIFICATE: Self = Self(27);
    pub const RECORD_SIZE_LIMIT: Self = Self(28);
    pub const SESSION_TICKET: Self = Self(35);
    pub const PRE_SHARED_KEY: Self = Self(41);
    pub const EARLY_DATA: Self = Self(42);
    pub const SUPPORTED_VERSIONS: Self = Self(43);
    pub const COOKIE: Self = Self(44);
    pub const PSK_KEY_EXCHANGE_MODES: Self = Self(45);
    pub const CERTIFICATE_AUTHORITIES: Self = Self(47);
    pub const OID_FILTERS: Self = Self(48);
    pub const POST_HANDSHAKE_AUTH: Self = Self(49);
    pub const SIGNATURE_ALGORITHMS_CERT: Self = Self(50);
    pub const KEY_SHARE: Self = Self(51);
    pub const RENEGOTIATION_INFO: Self = Self(0xFF01);

    const RECOGNIZED: [Self; 29] = [
        Self::SERVER_NAME,
        Self::MAX_FRAGMENT_LENGTH,
        Self::STATUS_REQUEST,
        Self::SUPPORTED_GROUPS,
        Self::EC_POINT_FORMATS,
        Self::SIGNATURE_ALGORITHMS,
        Self::USE_SRTP,
        Self::HEARTBEAT,
        Self::APPLICATION_LAYER_PROTOCOL_NEGOTIATION,
        Self::SIGNED_CERTIFICATE_TIMESTAMP,
        Self::CLIENT_CERTIFICATE_TYPE,
        Self::SERVER_CERTIFICATE_TYPE,
        Self::PADDING,
        Self::ENCRYPT_THEN_MAC,
        Self::EXTENDED_MASTER_SECRET,
        Self::COMPRESS_CERTIFICATE,
        Self::RECORD_SIZE_LIMIT,
        Self::SESSION_TICKET,
        Self::PRE_SHARED_KEY,
        Self::EARLY_DATA,
        Self::SUPPORTED_VERSIONS,
        Self::COOKIE,
        Self::PSK_KEY_EXCHANGE_MODES,
        Self::CERTIFICATE_AUTHORITIES,
        Self::OID_FILTERS,
        Self::POST_HANDSHAKE_AUTH,
        Self::SIGNATURE_ALGORITHMS_CERT,
        Self::KEY_SHARE,
        Self::RENEGOTIATION_INFO,
    ];

    pub fn is_recognized(self) -> bool {
        Self::RECOGNIZED.contains(&self)
    }
}

// ---------------------------------------------------------------------------
// Extensions map
// ---------------------------------------------------------------------------

/// Extensions of one handshake message. At most one entry per type;
/// insertion order is kept so encodings are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionsMap {
    entries: Vec<(ExtensionType, Vec<u8>)>,
}

impl ExtensionsMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an extension; a second entry of the same type is `illegal_parameter`.
    pub fn insert(&mut self, ext_type: ExtensionType, data: Vec<u8>) -> Result<(), TlsError> {
        if self.contains(ext_type) {
            return Err(TlsError::fatal(
                AlertDescription::IllegalParameter,
                format!("duplicate extension {}", ext_type.0),
            ));
        }
        self.entries.push((ext_type, data));
        Ok(())
    }

    /// Add or overwrite.
    pub fn set(&mut self, ext_type: ExtensionType, data: Vec<u8>) {
        match self.entries.iter_mut().find(|(t, _)| *t == ext_type) {
            Some(entry) => entry.1 = data,
            None => self.entries.push((ext_type, data)),
        }
    }

    pub fn get(&self, ext_type: ExtensionType) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(t, _)| *t == ext_type)
            .map(|(_, d)| d.as_slice())
    }

    pub fn contains(&self, ext_type: ExtensionType) -> bool {
        self.entries.iter().any(|(t, _)| *t == ext_type)
    }

    pub fn remove(&mut self, ext_type: ExtensionType) -> Option<Vec<u8>> {
        let idx = self.entries.iter().position(|(t, _)| *t == ext_type)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn types(&self) -> impl Iterator<Item = ExtensionType> + '_ {
        self.entries.iter().map(|(t, _)| *t)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ExtensionType, &[u8])> {
        self.entries.iter().map(|(t, d)| (*t, d.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the extensions block: empty-payload entries first, then the rest,
    /// then `pre_shared_key`. Nothing is written for an empty map.
    pub fn encode(&self, out: &mut Vec<u8>) {
        if self.entries.is_empty() {
            return;
        }
        tlsengine_utils::put_len16_with(out, |buf| {
            for select_empty in [true, false] {
                for (t, d) in &self.entries {
                    if *t != ExtensionType::PRE_SHARED_KEY && d.is_empty() == select_empty {
                        put_u16(buf, t.0);
                        put_opaque16(buf, d);
                    }
                }
            }
            if let Some(psk) = self.get(ExtensionType::PRE_SHARED_KEY) {
                put_u16(buf, ExtensionType::PRE_SHARED_KEY.0);
                put_opaque16(buf, psk);
            }
        });
    }

    /// Like [`encode`](Self::encode) but writes a zero length for an empty
    /// map, for messages where the block is mandatory.
    pub fn encode_block(&self, out: &mut Vec<u8>) {
        if self.entries.is_empty() {
            put_u16(out, 0);
        } else {
            self.encode(out);
        }
    }

    /// Read an optional extensions block from the end of a hello message.
    pub fn decode_optional(r: &mut Reader<'_>) -> Result<Self, TlsError> {
        if r.is_empty() {
            return Ok(Self::new());
        }
        Self::decode(r)
    }

    /// Read a mandatory, length-prefixed extensions block.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, TlsError> {
        let block = r.read_opaque16()?;
        let mut inner = Reader::new(block, "extensions");
        let mut map = Self::new();
        while !inner.is_empty() {
            let ext_type = ExtensionType(inner.read_u16()?);
            let data = inner.read_opaque16()?;
            map.insert(ext_type, data.to_vec())?;
        }
        Ok(map)
    }

    /// True if the last entry is of `ext_type`.
    pub fn is_last(&self, ext_type: ExtensionType) -> bool {
        self.entries.last().is_some_and(|(t, _)| *t == ext_type)
    }
}

// ---------------------------------------------------------------------------
// TLS 1.3 permission table (RFC 8446 §4.2)
// ---------------------------------------------------------------------------

/// Handshake messages that carry extensions in TLS 1.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionContext {
    ClientHello,
    ServerHello,
    HelloRetryRequest,
    EncryptedExtensions,
    Certificate,
    CertificateRequest,
    NewSessionTicket,
}

use ExtensionContext as Ctx;

const CH_EE: &[Ctx] = &[Ctx::ClientHello, Ctx::EncryptedExtensions];
const CH_CR_CT: &[Ctx] = &[Ctx::ClientHello, Ctx::CertificateRequest, Ctx::Certificate];
const CH_CR: &[Ctx] = &[Ctx::ClientHello, Ctx::CertificateRequest];
const CH: &[Ctx] = &[Ctx::ClientHello];
const CH_SH_HRR: &[Ctx] = &[Ctx::ClientHello, Ctx::ServerHello, Ctx::HelloRetryRequest];
const CH_SH: &[Ctx] = &[Ctx::ClientHello, Ctx::ServerHello];
const CH_EE_NST: &[Ctx] = &[
    Ctx::ClientHello,
    Ctx::EncryptedExtensions,
    Ctx::NewSessionTicket,
];
const CH_HRR: &[Ctx] = &[Ctx::ClientHello, Ctx::HelloRetryRequest];
const CR: &[Ctx] = &[Ctx::CertificateRequest];

static PERMITTED_13: &[(ExtensionType, &[Ctx])] = &[
    (ExtensionType::SERVER_NAME, CH_EE),
    (ExtensionType::MAX_FRAGMENT_LENGTH, CH_EE),
    (ExtensionType::SUPPORTED_GROUPS, CH_EE),
    (ExtensionType::USE_SRTP, CH_EE),
    (ExtensionType::HEARTBEAT, CH_EE),
    (ExtensionType::APPLICATION_LAYER_PROTOCOL_NEGOTIATION, CH_EE),
    (ExtensionType::CLIENT_CERTIFICATE_TYPE, CH_EE),
    (ExtensionType::SERVER_CERTIFICATE_TYPE, CH_EE),
    (ExtensionType::STATUS_REQUEST, CH_CR_CT),
    (ExtensionType::SIGNED_CERTIFICATE_TIMESTAMP, CH_CR_CT),
    (ExtensionType::SIGNATURE_ALGORITHMS, CH_CR),
    (ExtensionType::COMPRESS_CERTIFICATE, CH_CR),
    (ExtensionType::CERTIFICATE_AUTHORITIES, CH_CR),
    (ExtensionType::SIGNATURE_ALGORITHMS_CERT, CH_CR),
    (ExtensionType::PADDING, CH),
    (ExtensionType::PSK_KEY_EXCHANGE_MODES, CH),
    (ExtensionType::POST_HANDSHAKE_AUTH, CH),
    (ExtensionType::KEY_SHARE, CH_SH_HRR),
    (ExtensionType::SUPPORTED_VERSIONS, CH_SH_HRR),
    (ExtensionType::PRE_SHARED_KEY, CH_SH),
    (ExtensionType::EARLY_DATA, CH_EE_NST),
    (ExtensionType::COOKIE, CH_HRR),
    (ExtensionType::OID_FILTERS, CR),
];

/// Whether `ext_type` may appear in a TLS 1.3 message of kind `ctx`.
/// Unrecognised types are always allowed; recognised ones missing from the
/// table are never allowed.
pub fn is_permitted_13(ctx: ExtensionContext, ext_type: ExtensionType) -> bool {
    match PERMITTED_13.iter().find(|(t, _)| *t == ext_type) {
        Some((_, allowed)) => allowed.contains(&ctx),
        None => !ext_type.is_recognized(),
    }
}

/// Reject any extension not permitted in `ctx`.
pub fn check_permitted_13(map: &ExtensionsMap, ctx: ExtensionContext) -> Result<(), TlsError> {
    match map.types().find(|t| !is_permitted_13(ctx, *t)) {
        Some(t) => Err(TlsError::fatal(
            AlertDescription::IllegalParameter,
            format!("extension {} not permitted in {ctx:?}", t.0),
        )),
        None => Ok(()),
    }
}

/// Reject any extension in a server message that the client did not offer.
/// `allowed_unsolicited` names the exceptions for this message.
pub fn check_solicited(
    received: &ExtensionsMap,
    offered: &ExtensionsMap,
    allowed_unsolicited: &[ExtensionType],
) -> Result<(), TlsError> {
    for t in received.types() {
        if !offered.contains(t) && !allowed_unsolicited.contains(&t) {
            return Err(TlsError::fatal(
                AlertDescription::UnsupportedExtension,
                format!("unsolicited extension {}", t.0),
            ));
        }
    }
    Ok(())
}
