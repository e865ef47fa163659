//! TLS record layer: framing, header preview and per-direction protection.

pub mod protection;

use tlsengine_types::{AlertDescription, TlsError};

use protection::RecordProtection;

/// Maximum TLS plaintext fragment size (2^14 bytes).
pub const MAX_PLAINTEXT_LENGTH: usize = 16384;

/// Largest record body accepted from the wire (2^14 + 2048).
pub const MAX_CIPHERTEXT_LENGTH: usize = MAX_PLAINTEXT_LENGTH + 2048;

/// TLS record header size: content_type(1) + version(2) + length(2).
pub const RECORD_HEADER_LEN: usize = 5;

/// Record version carried by every TLS 1.3 record.
pub const TLS13_RECORD_VERSION: u16 = 0x0303;

/// TLS record content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl ContentType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            20 => Some(ContentType::ChangeCipherSpec),
            21 => Some(ContentType::Alert),
            22 => Some(ContentType::Handshake),
            23 => Some(ContentType::ApplicationData),
            _ => None,
        }
    }
}

/// A decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: ContentType,
    pub version: u16,
    /// Length of the record body.
    pub length: usize,
}

impl RecordHeader {
    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let v = self.version.to_be_bytes();
        let l = (self.length as u16).to_be_bytes();
        [self.content_type as u8, v[0], v[1], l[0], l[1]]
    }

    /// Header plus body length.
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_LEN + self.length
    }
}

/// Inspect the first record header in `data`.
///
/// Returns `Ok(None)` until five bytes are available.
pub fn preview_record_header(data: &[u8]) -> Result<Option<RecordHeader>, TlsError> {
    if data.len() < RECORD_HEADER_LEN {
        return Ok(None);
    }
    let content_type = ContentType::from_u8(data[0]).ok_or_else(|| {
        TlsError::fatal(
            AlertDescription::UnexpectedMessage,
            format!("unknown record type {}", data[0]),
        )
    })?;
    if data[1] != 3 {
        return Err(TlsError::fatal(
            AlertDescription::DecodeError,
            format!("record major version {}", data[1]),
        ));
    }
    let version = u16::from_be_bytes([data[1], data[2]]);
    let length = usize::from(u16::from_be_bytes([data[3], data[4]]));
    if length > MAX_CIPHERTEXT_LENGTH {
        return Err(TlsError::fatal(
            AlertDescription::RecordOverflow,
            format!("record length {length}"),
        ));
    }
    Ok(Some(RecordHeader {
        content_type,
        version,
        length,
    }))
}

/// Record layer state for one connection.
///
/// Read and write protection are activated independently. The legacy flow
/// stages the next cipher state as pending until ChangeCipherSpec.
pub struct RecordLayer {
    read: RecordProtection,
    write: RecordProtection,
    pending_read: Option<RecordProtection>,
    pending_write: Option<RecordProtection>,
    write_version: u16,
    /// Once set, every incoming record must carry this version.
    read_version: Option<u16>,
    plaintext_limit: usize,
}

impl Default for RecordLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordLayer {
    pub fn new() -> Self {
        Self {
            read: RecordProtection::Null,
            write: RecordProtection::Null,
            pending_read: None,
            pending_write: None,
            write_version: 0x0301,
            read_version: None,
            plaintext_limit: MAX_PLAINTEXT_LENGTH,
        }
    }

    pub fn set_write_version(&mut self, version: u16) {
        self.write_version = version;
    }

    pub fn set_read_version(&mut self, version: u16) {
        self.read_version = Some(version);
    }

    pub fn plaintext_limit(&self) -> usize {
        self.plaintext_limit
    }

    pub fn set_plaintext_limit(&mut self, limit: usize) {
        self.plaintext_limit = limit.min(MAX_PLAINTEXT_LENGTH);
    }

    pub fn is_encrypting(&self) -> bool {
        !self.write.is_null()
    }

    pub fn is_decrypting(&self) -> bool {
        !self.read.is_null()
    }

    /// Records written under the current write key.
    pub fn write_sequence(&self) -> u64 {
        self.write.sequence_number()
    }

    pub fn set_write(&mut self, protection: RecordProtection) {
        self.write = protection;
    }

    pub fn set_read(&mut self, protection: RecordProtection) {
        self.read = protection;
    }

    /// Stage cipher states for the next ChangeCipherSpec in each direction.
    pub fn set_pending(&mut self, read: RecordProtection, write: RecordProtection) {
        self.pending_read = Some(read);
        self.pending_write = Some(write);
    }

    pub fn has_pending_read(&self) -> bool {
        self.pending_read.is_some()
    }

    pub fn activate_pending_write(&mut self) -> Result<(), TlsError> {
        self.write = self.pending_write.take().ok_or_else(|| {
            TlsError::fatal(AlertDescription::InternalError, "no pending write cipher")
        })?;
        Ok(())
    }

    pub fn activate_pending_read(&mut self) -> Result<(), TlsError> {
        self.read = self.pending_read.take().ok_or_else(|| {
            TlsError::fatal(AlertDescription::UnexpectedMessage, "ChangeCipherSpec without keys")
        })?;
        Ok(())
    }

    /// Drop every cipher state.
    pub fn clear(&mut self) {
        self.read = RecordProtection::Null;
        self.write = RecordProtection::Null;
        self.pending_read = None;
        self.pending_write = None;
    }

    /// Protect and frame one fragment.
    pub fn seal_record(
        &mut self,
        content_type: ContentType,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, TlsError> {
        if plaintext.len() > self.plaintext_limit {
            return Err(TlsError::fatal(
                AlertDescription::InternalError,
                "fragment exceeds plaintext limit",
            ));
        }
        let (outer, body) = self.write.seal(content_type, self.write_version, plaintext)?;
        let header = RecordHeader {
            content_type: outer,
            version: self.write_version,
            length: body.len(),
        };
        let mut out = Vec::with_capacity(header.record_len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Open one complete record. `data` must hold exactly one record.
    pub fn open_record(&mut self, data: &[u8]) -> Result<(ContentType, Vec<u8>), TlsError> {
        let header = preview_record_header(data)?.ok_or_else(|| {
            TlsError::fatal(AlertDescription::DecodeError, "truncated record header")
        })?;
        if data.len() != header.record_len() {
            return Err(TlsError::fatal(AlertDescription::DecodeError, "record length mismatch"));
        }
        if let Some(expected) = self.read_version {
            if header.version != expected {
                return Err(TlsError::fatal(
                    AlertDescription::IllegalParameter,
                    format!("record version 0x{:04x}", header.version),
                ));
            }
        }
        let body = &data[RECORD_HEADER_LEN..];
        let (content_type, plaintext) = self.read.open(&header, body)?;
        if plaintext.len() > self.plaintext_limit {
            return Err(TlsError::fatal(
                AlertDescription::RecordOverflow,
                "plaintext exceeds negotiated limit",
            ));
        }
        Ok((content_type, plaintext))
    }

    /// Pass an unprotected record through, for the TLS 1.3 compatibility
    /// ChangeCipherSpec that arrives after read keys are active.
    pub fn open_plaintext(data: &[u8]) -> Result<(ContentType, Vec<u8>), TlsError> {
        let header = preview_record_header(data)?.ok_or_else(|| {
            TlsError::fatal(AlertDescription::DecodeError, "truncated record header")
        })?;
        Ok((header.content_type, data[RECORD_HEADER_LEN..].to_vec()))
    }
}
