//! TLS alert protocol.

pub use tlsengine_types::AlertDescription;
use tlsengine_types::TlsError;

/// Alert severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertLevel {
    Warning = 1,
    Fatal = 2,
}

impl AlertLevel {
    /// Convert from u8 to AlertLevel.
    pub fn from_u8(v: u8) -> Result<Self, u8> {
        match v {
            1 => Ok(AlertLevel::Warning),
            2 => Ok(AlertLevel::Fatal),
            _ => Err(v),
        }
    }
}

/// A TLS alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    pub level: AlertLevel,
    pub description: AlertDescription,
}

impl Alert {
    pub fn fatal(description: AlertDescription) -> Self {
        Self {
            level: AlertLevel::Fatal,
            description,
        }
    }

    pub fn warning(description: AlertDescription) -> Self {
        Self {
            level: AlertLevel::Warning,
            description,
        }
    }

    pub fn encode(&self) -> [u8; 2] {
        [self.level as u8, self.description as u8]
    }

    /// Parse one two-byte alert.
    pub fn decode(data: [u8; 2]) -> Result<Self, TlsError> {
        let level = AlertLevel::from_u8(data[0]).map_err(|v| {
            TlsError::fatal(
                AlertDescription::IllegalParameter,
                format!("unknown alert level {v}"),
            )
        })?;
        let description = AlertDescription::from_u8(data[1]).map_err(|v| {
            TlsError::fatal(
                AlertDescription::IllegalParameter,
                format!("unknown alert description {v}"),
            )
        })?;
        Ok(Self { level, description })
    }
}
