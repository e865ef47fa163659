//! Legacy-flow key exchange: ServerKeyExchange / ClientKeyExchange payloads
//! and the pre-master secret, one variant per algorithm family.
//!
//! The TLS 1.3 key share lives in the orchestrators; it is a single
//! [`KeyAgreement`] and needs none of this bookkeeping.

use tlsengine_crypto::{CryptoProvider, KeyAgreement};
use tlsengine_types::{AlertDescription, NamedGroup, TlsError};
use tlsengine_utils::{put_opaque16, put_opaque8, put_u16, put_u8, Reader};
use zeroize::Zeroizing;

use crate::config::PskConfig;
use crate::crypt::{secret, KeyExchangeAlg, Secret};
use crate::handshake::negotiation::select_group;

/// ECCurveType.named_curve (RFC 8422 §5.4).
const NAMED_CURVE: u8 = 3;

fn unexpected(what: &str) -> TlsError {
    TlsError::fatal(AlertDescription::UnexpectedMessage, what.to_string())
}

fn unsupported() -> TlsError {
    TlsError::fatal(
        AlertDescription::HandshakeFailure,
        "key exchange not supported by the crypto provider",
    )
}

fn internal(what: &str) -> TlsError {
    TlsError::fatal(AlertDescription::InternalError, format!("key exchange: {what}"))
}

/// Ephemeral ECDH half of an exchange.
#[derive(Default)]
pub struct EcdheState {
    local: Option<Box<dyn KeyAgreement>>,
    group: Option<NamedGroup>,
    peer_point: Option<Vec<u8>>,
}

impl EcdheState {
    pub fn group(&self) -> Option<NamedGroup> {
        self.group
    }

    /// ServerECDHParams: curve_type || named_curve || opaque8 point.
    fn server_params(
        &mut self,
        provider: &dyn CryptoProvider,
        local_groups: &[NamedGroup],
        peer_groups: &[NamedGroup],
        out: &mut Vec<u8>,
    ) -> Result<(), TlsError> {
        let group = if peer_groups.is_empty() {
            local_groups.first().copied()
        } else {
            select_group(local_groups, peer_groups)
        }
        .ok_or_else(|| {
            TlsError::fatal(AlertDescription::HandshakeFailure, "no common ECDHE group")
        })?;
        let agreement = provider.generate_key_agreement(group)?;
        put_u8(out, NAMED_CURVE);
        put_u16(out, group.0);
        put_opaque8(out, &agreement.public_key());
        self.group = Some(group);
        self.local = Some(agreement);
        Ok(())
    }

    fn parse_server_params(
        &mut self,
        r: &mut Reader<'_>,
        local_groups: &[NamedGroup],
    ) -> Result<(), TlsError> {
        if r.read_u8()? != NAMED_CURVE {
            return Err(TlsError::fatal(
                AlertDescription::IllegalParameter,
                "only named curves are supported",
            ));
        }
        let group = NamedGroup(r.read_u16()?);
        if !local_groups.contains(&group) {
            return Err(TlsError::fatal(
                AlertDescription::IllegalParameter,
                format!("server chose unoffered group 0x{:04x}", group.0),
            ));
        }
        let point = r.read_opaque8()?;
        if point.is_empty() {
            return Err(TlsError::fatal(AlertDescription::DecodeError, "empty ECDH point"));
        }
        self.group = Some(group);
        self.peer_point = Some(point.to_vec());
        Ok(())
    }

    /// Client: generate the local share on the server's group.
    fn client_share(&mut self, provider: &dyn CryptoProvider) -> Result<Vec<u8>, TlsError> {
        let group = self.group.ok_or_else(|| internal("no server params"))?;
        let agreement = provider.generate_key_agreement(group)?;
        let public = agreement.public_key();
        self.local = Some(agreement);
        Ok(public)
    }

    fn shared_secret(&self) -> Result<Zeroizing<Vec<u8>>, TlsError> {
        let local = self.local.as_ref().ok_or_else(|| internal("no local share"))?;
        let peer = self.peer_point.as_deref().ok_or_else(|| internal("no peer share"))?;
        local.compute_shared_secret(peer).map_err(|_| {
            TlsError::fatal(AlertDescription::IllegalParameter, "invalid peer ECDH share")
        })
    }
}

/// Pre-shared key half of an exchange.
pub struct PskState {
    identity: Vec<u8>,
    key: Secret,
    hint: Option<Vec<u8>>,
    /// Server: the client's identity matched.
    resolved: bool,
}

impl PskState {
    fn from_config(psk: Option<&PskConfig>, hint: Option<&[u8]>) -> Result<Self, TlsError> {
        let psk = psk.ok_or_else(|| {
            TlsError::fatal(AlertDescription::HandshakeFailure, "PSK suite without a PSK")
        })?;
        Ok(Self {
            identity: psk.identity.clone(),
            key: psk.key.clone(),
            hint: hint.map(<[u8]>::to_vec),
            resolved: false,
        })
    }

    /// The hint the server sent, if any.
    pub fn hint(&self) -> Option<&[u8]> {
        self.hint.as_deref()
    }

    fn check_identity(&mut self, identity: &[u8]) -> Result<(), TlsError> {
        if identity != self.identity.as_slice() {
            return Err(TlsError::fatal(
                AlertDescription::UnknownPskIdentity,
                "unknown PSK identity",
            ));
        }
        self.resolved = true;
        Ok(())
    }
}

/// `uint16 len || other_secret || uint16 len || psk` (RFC 4279 §2).
fn psk_premaster(other_secret: &[u8], psk: &[u8]) -> Secret {
    let mut out = Vec::with_capacity(4 + other_secret.len() + psk.len());
    put_opaque16(&mut out, other_secret);
    put_opaque16(&mut out, psk);
    secret(out)
}

/// Key exchange for one legacy handshake.
pub enum KeyExchange {
    /// Signed ephemeral ECDH.
    Ecdhe(EcdheState),
    /// Unsigned ephemeral ECDH.
    EcdhAnon(EcdheState),
    Psk(PskState),
    EcdhePsk(EcdheState, PskState),
    /// Static RSA key transport. Not provided by the crypto backend.
    Rsa,
    /// Finite-field DH. Not provided by the crypto backend.
    Dhe,
}

impl KeyExchange {
    /// Set up the exchange for a negotiated suite.
    pub fn new(
        alg: KeyExchangeAlg,
        psk: Option<&PskConfig>,
        psk_identity_hint: Option<&[u8]>,
    ) -> Result<Self, TlsError> {
        Ok(match alg {
            KeyExchangeAlg::Ecdhe => KeyExchange::Ecdhe(EcdheState::default()),
            KeyExchangeAlg::EcdhAnon => KeyExchange::EcdhAnon(EcdheState::default()),
            KeyExchangeAlg::Psk => KeyExchange::Psk(PskState::from_config(psk, psk_identity_hint)?),
            KeyExchangeAlg::EcdhePsk => KeyExchange::EcdhePsk(
                EcdheState::default(),
                PskState::from_config(psk, psk_identity_hint)?,
            ),
            KeyExchangeAlg::Rsa => KeyExchange::Rsa,
            KeyExchangeAlg::Dhe => KeyExchange::Dhe,
            KeyExchangeAlg::Tls13 => return Err(internal("TLS 1.3 suite in legacy flow")),
        })
    }

    /// True when the server's parameters are signed.
    pub fn is_signed(&self) -> bool {
        matches!(self, KeyExchange::Ecdhe(_) | KeyExchange::Dhe)
    }

    /// The ECDH group, once one has been chosen or received.
    pub fn group(&self) -> Option<NamedGroup> {
        match self {
            KeyExchange::Ecdhe(ec) | KeyExchange::EcdhAnon(ec) | KeyExchange::EcdhePsk(ec, _) => {
                ec.group()
            }
            KeyExchange::Psk(_) | KeyExchange::Rsa | KeyExchange::Dhe => None,
        }
    }

    /// Server: ServerKeyExchange params, or `None` when the message is omitted.
    pub fn generate_server_key_exchange(
        &mut self,
        provider: &dyn CryptoProvider,
        local_groups: &[NamedGroup],
        peer_groups: &[NamedGroup],
    ) -> Result<Option<Vec<u8>>, TlsError> {
        let mut out = Vec::new();
        match self {
            KeyExchange::Ecdhe(ec) | KeyExchange::EcdhAnon(ec) => {
                ec.server_params(provider, local_groups, peer_groups, &mut out)?;
            }
            KeyExchange::Psk(psk) => match &psk.hint {
                Some(hint) => put_opaque16(&mut out, hint),
                None => return Ok(None),
            },
            KeyExchange::EcdhePsk(ec, psk) => {
                put_opaque16(&mut out, psk.hint.as_deref().unwrap_or_default());
                ec.server_params(provider, local_groups, peer_groups, &mut out)?;
            }
            KeyExchange::Rsa => return Ok(None),
            KeyExchange::Dhe => return Err(unsupported()),
        }
        Ok(Some(out))
    }

    /// Client: parse the params at the front of a ServerKeyExchange body.
    /// Returns the params length so the caller can split off the signature.
    pub fn process_server_key_exchange(
        &mut self,
        body: &[u8],
        local_groups: &[NamedGroup],
    ) -> Result<usize, TlsError> {
        let mut r = Reader::new(body, "ServerKeyExchange");
        match self {
            KeyExchange::Ecdhe(ec) | KeyExchange::EcdhAnon(ec) => {
                ec.parse_server_params(&mut r, local_groups)?;
            }
            KeyExchange::Psk(psk) => {
                psk.hint = Some(r.read_opaque16()?.to_vec());
            }
            KeyExchange::EcdhePsk(ec, psk) => {
                psk.hint = Some(r.read_opaque16()?.to_vec());
                ec.parse_server_params(&mut r, local_groups)?;
            }
            KeyExchange::Rsa => return Err(unexpected("ServerKeyExchange for RSA key exchange")),
            KeyExchange::Dhe => return Err(unsupported()),
        }
        Ok(r.position())
    }

    /// Client: ServerKeyExchange was not sent.
    pub fn skip_server_key_exchange(&mut self) -> Result<(), TlsError> {
        match self {
            KeyExchange::Psk(_) => Ok(()),
            KeyExchange::Rsa => Err(unsupported()),
            _ => Err(unexpected("ServerKeyExchange missing")),
        }
    }

    /// Client: ClientKeyExchange body. Fixes the pre-master secret inputs.
    pub fn generate_client_key_exchange(
        &mut self,
        provider: &dyn CryptoProvider,
    ) -> Result<Vec<u8>, TlsError> {
        let mut out = Vec::new();
        match self {
            KeyExchange::Ecdhe(ec) | KeyExchange::EcdhAnon(ec) => {
                let share = ec.client_share(provider)?;
                put_opaque8(&mut out, &share);
            }
            KeyExchange::Psk(psk) => {
                put_opaque16(&mut out, &psk.identity);
                psk.resolved = true;
            }
            KeyExchange::EcdhePsk(ec, psk) => {
                put_opaque16(&mut out, &psk.identity);
                let share = ec.client_share(provider)?;
                put_opaque8(&mut out, &share);
                psk.resolved = true;
            }
            KeyExchange::Rsa | KeyExchange::Dhe => return Err(unsupported()),
        }
        Ok(out)
    }

    /// Server: parse the ClientKeyExchange body.
    pub fn process_client_key_exchange(&mut self, body: &[u8]) -> Result<(), TlsError> {
        let mut r = Reader::new(body, "ClientKeyExchange");
        match self {
            KeyExchange::Ecdhe(ec) | KeyExchange::EcdhAnon(ec) => {
                ec.peer_point = Some(r.read_opaque8()?.to_vec());
            }
            KeyExchange::Psk(psk) => {
                psk.check_identity(r.read_opaque16()?)?;
            }
            KeyExchange::EcdhePsk(ec, psk) => {
                psk.check_identity(r.read_opaque16()?)?;
                ec.peer_point = Some(r.read_opaque8()?.to_vec());
            }
            KeyExchange::Rsa | KeyExchange::Dhe => return Err(unsupported()),
        }
        r.expect_end()
    }

    /// Consume the exchange and produce the pre-master secret.
    pub fn into_premaster_secret(self) -> Result<Secret, TlsError> {
        match self {
            KeyExchange::Ecdhe(ec) | KeyExchange::EcdhAnon(ec) => {
                let shared = ec.shared_secret()?;
                Ok(secret(shared.to_vec()))
            }
            KeyExchange::Psk(psk) => {
                if !psk.resolved {
                    return Err(internal("PSK identity not exchanged"));
                }
                let zeros = Zeroizing::new(vec![0u8; psk.key.len()]);
                Ok(psk_premaster(&zeros, &psk.key))
            }
            KeyExchange::EcdhePsk(ec, psk) => {
                if !psk.resolved {
                    return Err(internal("PSK identity not exchanged"));
                }
                let shared = ec.shared_secret()?;
                Ok(psk_premaster(&shared, &psk.key))
            }
            KeyExchange::Rsa | KeyExchange::Dhe => Err(unsupported()),
        }
    }
}
