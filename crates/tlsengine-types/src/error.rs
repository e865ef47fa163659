use crate::alert::AlertDescription;

/// Cryptographic operation errors.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("null or empty input")]
    NullInput,
    #[error("invalid argument")]
    InvalidArg,
    #[error("operation not supported")]
    NotSupported,
    #[error("invalid key")]
    InvalidKey,

    // Buffer errors
    #[error("buffer length not enough: need {need}, got {got}")]
    BufferTooSmall { need: usize, got: usize },

    // Symmetric cipher errors
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid iv length")]
    InvalidIvLength,
    #[error("aead: tag verification failed")]
    AeadTagVerifyFail,
    #[error("invalid padding")]
    InvalidPadding,

    // Asymmetric errors
    #[error("ecc: invalid public key")]
    EccInvalidPublicKey,
    #[error("signature: malformed encoding")]
    SignatureMalformed,

    #[error("random generation failed")]
    RandomFail,

    // KDF errors
    #[error("kdf: derived key length overflow")]
    KdfDkLenOverflow,
}

impl CryptoError {
    /// True when the error means authenticated data failed to verify.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, CryptoError::AeadTagVerifyFail | CryptoError::InvalidPadding)
    }
}

/// TLS protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// A protocol violation; the alert is sent to the peer before closing.
    #[error("fatal alert {alert}: {reason}")]
    Fatal {
        alert: AlertDescription,
        reason: String,
    },
    #[error("alert received: {0}")]
    AlertReceived(AlertDescription),
    /// Caller misuse. Never visible to the peer.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("no shared cipher suite")]
    NoSharedCipherSuite,
    #[error("certificate verification failed: {0}")]
    CertVerifyFailed(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

impl TlsError {
    pub fn fatal(alert: AlertDescription, reason: impl Into<String>) -> Self {
        TlsError::Fatal {
            alert,
            reason: reason.into(),
        }
    }

    /// The alert to raise for this error, or `None` when nothing should be
    /// sent to the peer.
    pub fn alert(&self) -> Option<AlertDescription> {
        match self {
            TlsError::Fatal { alert, .. } => Some(*alert),
            TlsError::UnsupportedVersion => Some(AlertDescription::ProtocolVersion),
            TlsError::NoSharedCipherSuite => Some(AlertDescription::HandshakeFailure),
            TlsError::CertVerifyFailed(_) => Some(AlertDescription::BadCertificate),
            TlsError::CryptoError(e) if e.is_authentication_failure() => {
                Some(AlertDescription::BadRecordMac)
            }
            TlsError::CryptoError(_) => Some(AlertDescription::InternalError),
            TlsError::AlertReceived(_)
            | TlsError::InvalidOperation(_)
            | TlsError::ConnectionClosed
            | TlsError::IoError(_) => None,
        }
    }

    /// True for caller-contract violations, which leave the connection usable.
    pub fn is_local(&self) -> bool {
        matches!(self, TlsError::InvalidOperation(_))
    }
}
