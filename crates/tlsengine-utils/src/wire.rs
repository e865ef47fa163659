//! TLS presentation-language primitives (RFC 8446 §3).
//!
//! `Reader` is a cursor over a borrowed buffer. Every short read or
//! overlong length prefix is reported as a fatal `decode_error`, tagged with
//! the caller's context string so failures read like "ServerHello: truncated".

use tlsengine_types::{AlertDescription, TlsError};

/// A bounds-checked cursor over TLS wire data.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    ctx: &'static str,
}

impl<'a> Reader<'a> {
    /// Create a reader; `ctx` prefixes every error message.
    pub fn new(data: &'a [u8], ctx: &'static str) -> Self {
        Self { data, pos: 0, ctx }
    }

    fn err(&self, msg: &str) -> TlsError {
        TlsError::fatal(AlertDescription::DecodeError, format!("{}: {msg}", self.ctx))
    }

    /// Returns the remaining unread bytes.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn remaining_len(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], TlsError> {
        if self.remaining_len() < n {
            return Err(self.err("truncated"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], TlsError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, TlsError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, TlsError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u24(&mut self) -> Result<u32, TlsError> {
        let b = self.take(3)?;
        Ok(((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32)
    }

    pub fn read_u32(&mut self) -> Result<u32, TlsError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// opaque<0..2^8-1>
    pub fn read_opaque8(&mut self) -> Result<&'a [u8], TlsError> {
        let len = self.read_u8()? as usize;
        self.take(len)
    }

    /// opaque<0..2^16-1>
    pub fn read_opaque16(&mut self) -> Result<&'a [u8], TlsError> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    /// opaque<0..2^24-1>
    pub fn read_opaque24(&mut self) -> Result<&'a [u8], TlsError> {
        let len = self.read_u24()? as usize;
        self.take(len)
    }

    /// A length-prefixed vector of big-endian u16 values (suites, groups,
    /// signature schemes). Odd or empty vectors are rejected.
    pub fn read_u16_list(&mut self) -> Result<Vec<u16>, TlsError> {
        let body = self.read_opaque16()?;
        if body.is_empty() || body.len() % 2 != 0 {
            return Err(self.err("bad u16 list length"));
        }
        Ok(body
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }

    /// Fails unless every byte has been consumed.
    pub fn expect_end(&self) -> Result<(), TlsError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self.err("trailing bytes"))
        }
    }
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

pub fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn put_u24(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes()[1..]);
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Write `data` with a one-byte length prefix.
pub fn put_opaque8(out: &mut Vec<u8>, data: &[u8]) {
    debug_assert!(data.len() <= 0xFF);
    out.push(data.len() as u8);
    out.extend_from_slice(data);
}

/// Write `data` with a two-byte length prefix.
pub fn put_opaque16(out: &mut Vec<u8>, data: &[u8]) {
    debug_assert!(data.len() <= 0xFFFF);
    put_u16(out, data.len() as u16);
    out.extend_from_slice(data);
}

/// Write `data` with a three-byte length prefix.
pub fn put_opaque24(out: &mut Vec<u8>, data: &[u8]) {
    debug_assert!(data.len() <= 0xFF_FFFF);
    put_u24(out, data.len() as u32);
    out.extend_from_slice(data);
}

/// Write a vector of u16 values with a two-byte length prefix.
pub fn put_u16_list(out: &mut Vec<u8>, values: impl IntoIterator<Item = u16>) {
    let start = out.len();
    out.extend_from_slice(&[0, 0]);
    for v in values {
        put_u16(out, v);
    }
    let len = (out.len() - start - 2) as u16;
    out[start..start + 2].copy_from_slice(&len.to_be_bytes());
}

/// Run `f` against `out`, then back-patch a two-byte length prefix over
/// whatever it wrote.
pub fn put_len16_with(out: &mut Vec<u8>, f: impl FnOnce(&mut Vec<u8>)) {
    let start = out.len();
    out.extend_from_slice(&[0, 0]);
    f(out);
    let len = (out.len() - start - 2) as u16;
    out[start..start + 2].copy_from_slice(&len.to_be_bytes());
}

/// Three-byte variant of [`put_len16_with`].
pub fn put_len24_with(out: &mut Vec<u8>, f: impl FnOnce(&mut Vec<u8>)) {
    let start = out.len();
    out.extend_from_slice(&[0, 0, 0]);
    f(out);
    let len = (out.len() - start - 3) as u32;
    out[start..start + 3].copy_from_slice(&len.to_be_bytes()[1..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_integers() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A];
        let mut r = Reader::new(&data, "test");
        assert_eq!(r.read_u8().unwrap(), 0x01);
        assert_eq!(r.read_u16().unwrap(), 0x0203);
        assert_eq!(r.read_u24().unwrap(), 0x040506);
        assert_eq!(r.read_u32().unwrap(), 0x0708090A);
        assert!(r.is_empty());
        r.expect_end().unwrap();
    }

    #[test]
    fn test_reader_truncated_is_decode_error() {
        let data = [0x00, 0x05, 0xAA];
        let mut r = Reader::new(&data, "ClientHello");
        let err = r.read_opaque16().unwrap_err();
        assert_eq!(err.alert(), Some(AlertDescription::DecodeError));
        assert!(err.to_string().contains("ClientHello"));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let data = [0x01, 0x00];
        let mut r = Reader::new(&data, "Finished");
        r.read_u8().unwrap();
        assert!(r.expect_end().is_err());
    }

    #[test]
    fn test_u16_list() {
        let mut out = Vec::new();
        put_u16_list(&mut out, [0x1301, 0x1302]);
        assert_eq!(out, [0x00, 0x04, 0x13, 0x01, 0x13, 0x02]);
        let mut r = Reader::new(&out, "suites");
        assert_eq!(r.read_u16_list().unwrap(), vec![0x1301, 0x1302]);

        let odd = [0x00, 0x03, 0x13, 0x01, 0x13];
        assert!(Reader::new(&odd, "suites").read_u16_list().is_err());
    }

    #[test]
    fn test_len_backpatch() {
        let mut out = vec![0xFF];
        put_len24_with(&mut out, |o| {
            put_opaque8(o, b"ab");
            put_u16(o, 7);
        });
        assert_eq!(out, [0xFF, 0x00, 0x00, 0x05, 0x02, b'a', b'b', 0x00, 0x07]);
    }
}
