//! Alert description registry (RFC 5246 §7.2, RFC 8446 §6).

use std::fmt;

/// Alert description codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AlertDescription {
    CloseNotify = 0,
    UnexpectedMessage = 10,
    BadRecordMac = 20,
    DecryptionFailed = 21,
    RecordOverflow = 22,
    DecompressionFailure = 30,
    HandshakeFailure = 40,
    /// SSLv3 only; a TLS peer must never send it.
    NoCertificate = 41,
    BadCertificate = 42,
    UnsupportedCertificate = 43,
    CertificateRevoked = 44,
    CertificateExpired = 45,
    CertificateUnknown = 46,
    IllegalParameter = 47,
    UnknownCa = 48,
    AccessDenied = 49,
    DecodeError = 50,
    DecryptError = 51,
    ProtocolVersion = 70,
    InsufficientSecurity = 71,
    InternalError = 80,
    InappropriateFallback = 86,
    UserCanceled = 90,
    NoRenegotiation = 100,
    MissingExtension = 109,
    UnsupportedExtension = 110,
    UnrecognizedName = 112,
    BadCertificateStatusResponse = 113,
    UnknownPskIdentity = 115,
    CertificateRequired = 116,
    NoApplicationProtocol = 120,
}

impl AlertDescription {
    const ALL: [AlertDescription; 31] = [
        Self::CloseNotify,
        Self::UnexpectedMessage,
        Self::BadRecordMac,
        Self::DecryptionFailed,
        Self::RecordOverflow,
        Self::DecompressionFailure,
        Self::HandshakeFailure,
        Self::NoCertificate,
        Self::BadCertificate,
        Self::UnsupportedCertificate,
        Self::CertificateRevoked,
        Self::CertificateExpired,
        Self::CertificateUnknown,
        Self::IllegalParameter,
        Self::UnknownCa,
        Self::AccessDenied,
        Self::DecodeError,
        Self::DecryptError,
        Self::ProtocolVersion,
        Self::InsufficientSecurity,
        Self::InternalError,
        Self::InappropriateFallback,
        Self::UserCanceled,
        Self::NoRenegotiation,
        Self::MissingExtension,
        Self::UnsupportedExtension,
        Self::UnrecognizedName,
        Self::BadCertificateStatusResponse,
        Self::UnknownPskIdentity,
        Self::CertificateRequired,
        Self::NoApplicationProtocol,
    ];

    /// Look up a description by its wire code. Unknown codes are returned as `Err`.
    pub fn from_u8(v: u8) -> Result<Self, u8> {
        Self::ALL
            .iter()
            .copied()
            .find(|d| *d as u8 == v)
            .ok_or(v)
    }

    /// The registry name, e.g. `unexpected_message`.
    pub fn name(self) -> &'static str {
        match self {
            Self::CloseNotify => "close_notify",
            Self::UnexpectedMessage => "unexpected_message",
            Self::BadRecordMac => "bad_record_mac",
            Self::DecryptionFailed => "decryption_failed",
            Self::RecordOverflow => "record_overflow",
            Self::DecompressionFailure => "decompression_failure",
            Self::HandshakeFailure => "handshake_failure",
            Self::NoCertificate => "no_certificate",
            Self::BadCertificate => "bad_certificate",
            Self::UnsupportedCertificate => "unsupported_certificate",
            Self::CertificateRevoked => "certificate_revoked",
            Self::CertificateExpired => "certificate_expired",
            Self::CertificateUnknown => "certificate_unknown",
            Self::IllegalParameter => "illegal_parameter",
            Self::UnknownCa => "unknown_ca",
            Self::AccessDenied => "access_denied",
            Self::DecodeError => "decode_error",
            Self::DecryptError => "decrypt_error",
            Self::ProtocolVersion => "protocol_version",
            Self::InsufficientSecurity => "insufficient_security",
            Self::InternalError => "internal_error",
            Self::InappropriateFallback => "inappropriate_fallback",
            Self::UserCanceled => "user_canceled",
            Self::NoRenegotiation => "no_renegotiation",
            Self::MissingExtension => "missing_extension",
            Self::UnsupportedExtension => "unsupported_extension",
            Self::UnrecognizedName => "unrecognized_name",
            Self::BadCertificateStatusResponse => "bad_certificate_status_response",
            Self::UnknownPskIdentity => "unknown_psk_identity",
            Self::CertificateRequired => "certificate_required",
            Self::NoApplicationProtocol => "no_application_protocol",
        }
    }
}

impl fmt::Display for AlertDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_covers_registry() {
        for d in AlertDescription::ALL {
            assert_eq!(AlertDescription::from_u8(d as u8), Ok(d));
        }
        assert_eq!(AlertDescription::from_u8(255), Err(255));
        assert_eq!(AlertDescription::from_u8(41), Ok(AlertDescription::NoCertificate));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            AlertDescription::UnexpectedMessage.to_string(),
            "unexpected_message(10)"
        );
    }
}
