//! Transport drivers around [`ConnectionCore`].
//!
//! [`NonBlockingConnection`] leaves all I/O to the caller: bytes are offered
//! in and drained out explicitly. [`TlsStream`] owns a blocking
//! `Read + Write` stream and pumps records itself.

use std::io::{self, Read, Write};
use std::sync::Arc;

use log::{debug, trace};
use tlsengine_types::TlsError;

use super::ConnectionCore;
use crate::config::TlsConfig;
use crate::{CipherSuite, ProtocolVersion, TlsConnection, TlsRole};

/// Stream read chunk; one maximum-size record plus header and expansion.
const READ_CHUNK: usize = 16 * 1024 + 2048;

/// Shared record pumping for drivers that own their transport.
pub trait RecordTransport {
    fn core(&self) -> &ConnectionCore;

    fn core_mut(&mut self) -> &mut ConnectionCore;

    /// Push every queued output record to the transport.
    fn flush_records(&mut self) -> Result<(), TlsError>;

    /// Move more input into the core. Returns false at end of stream.
    fn fill_records(&mut self) -> Result<bool, TlsError>;

    /// Flush whatever `result` left queued, then return it. Records queued
    /// by a failure carry its fatal alert; a failed send of those is ignored.
    fn flushed<T>(&mut self, result: Result<T, TlsError>) -> Result<T, TlsError> {
        match result {
            Ok(value) => {
                self.flush_records()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(send) = self.flush_records() {
                    debug!("alert not delivered: {send}");
                }
                Err(err)
            }
        }
    }

    /// Pump records until the handshake completes or fails.
    fn drive_handshake(&mut self) -> Result<(), TlsError> {
        loop {
            self.flush_records()?;
            if !self.core().is_handshaking() {
                break;
            }
            let more = self.fill_records();
            if !self.flushed(more)? {
                let closed = self.core_mut().close_input();
                self.flushed(closed)?;
            }
        }
        if self.core().is_handshake_complete() {
            Ok(())
        } else {
            Err(TlsError::ConnectionClosed)
        }
    }
}

/// A connection whose transport is driven by the caller.
///
/// ```ignore
/// let mut client = NonBlockingConnection::new(client_config);
/// client.connect()?;
/// loop {
///     server.offer_input(&client.drain_output())?;
///     client.offer_input(&server.drain_output())?;
///     if client.is_handshake_complete() { break; }
/// }
/// ```
#[derive(Debug)]
pub struct NonBlockingConnection {
    core: ConnectionCore,
}

impl NonBlockingConnection {
    pub fn new(config: Arc<TlsConfig>) -> Self {
        Self {
            core: ConnectionCore::new(config),
        }
    }

    /// Start a client handshake; the ClientHello is queued as output.
    pub fn connect(&mut self) -> Result<(), TlsError> {
        self.core.begin_handshake(TlsRole::Client)
    }

    /// Start a server handshake and wait for a ClientHello.
    pub fn accept(&mut self) -> Result<(), TlsError> {
        self.core.begin_handshake(TlsRole::Server)
    }

    pub fn connection(&self) -> &ConnectionCore {
        &self.core
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.core.is_handshake_complete()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Feed bytes received from the peer.
    pub fn offer_input(&mut self, data: &[u8]) -> Result<(), TlsError> {
        self.core.offer_input(data)
    }

    /// The peer's side of the transport reached end of stream.
    pub fn close_input(&mut self) -> Result<(), TlsError> {
        self.core.close_input()
    }

    /// Bytes buffered but not yet forming a whole record.
    pub fn available_input_bytes(&self) -> usize {
        self.core.buffered_input()
    }

    /// Length of the partially buffered record at the head of the input, if
    /// its header has arrived.
    pub fn preview_input_record(&self) -> Result<Option<usize>, TlsError> {
        self.core.preview_input_record()
    }

    /// Length of the next whole record waiting to be sent, or zero.
    pub fn preview_output_record(&self) -> usize {
        self.core.preview_output_record()
    }

    pub fn available_output_bytes(&self) -> usize {
        self.core.available_output()
    }

    /// Copy pending output into `buf`, consuming it.
    pub fn read_output(&mut self, buf: &mut [u8]) -> usize {
        self.core.read_output(buf)
    }

    /// Take all pending output.
    pub fn drain_output(&mut self) -> Vec<u8> {
        self.core.take_output()
    }

    pub fn available_application_bytes(&self) -> usize {
        self.core.available_app_data()
    }

    pub fn read_application_data(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        self.core.read_app_data(buf)
    }

    pub fn write_application_data(&mut self, data: &[u8]) -> Result<usize, TlsError> {
        self.core.write_app_data(data)
    }

    /// Queue close_notify (or cancel an unfinished handshake).
    pub fn close(&mut self) -> Result<(), TlsError> {
        self.core.close()
    }
}

/// Output stays queued for [`NonBlockingConnection::drain_output`], and
/// input only arrives through `offer_input`, so driving the handshake
/// reports `WouldBlock` until the peer's bytes have been offered.
impl RecordTransport for NonBlockingConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ConnectionCore {
        &mut self.core
    }

    fn flush_records(&mut self) -> Result<(), TlsError> {
        Ok(())
    }

    fn fill_records(&mut self) -> Result<bool, TlsError> {
        Err(io::Error::from(io::ErrorKind::WouldBlock).into())
    }
}

/// A connection over a blocking stream.
pub struct TlsStream<S: Read + Write> {
    stream: S,
    core: ConnectionCore,
}

impl<S: Read + Write> RecordTransport for TlsStream<S> {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ConnectionCore {
        &mut self.core
    }

    fn flush_records(&mut self) -> Result<(), TlsError> {
        let out = self.core.take_output();
        if out.is_empty() {
            return Ok(());
        }
        trace!("writing {} bytes", out.len());
        self.stream.write_all(&out)?;
        self.stream.flush()?;
        Ok(())
    }

    fn fill_records(&mut self) -> Result<bool, TlsError> {
        let mut buf = vec![0u8; READ_CHUNK];
        let n = self.stream.read(&mut buf)?;
        if n == 0 {
            return Ok(false);
        }
        self.core.offer_input(&buf[..n])?;
        Ok(true)
    }
}

impl<S: Read + Write> TlsStream<S> {
    /// Wrap `stream` without starting a handshake.
    pub fn new(stream: S, config: Arc<TlsConfig>) -> Self {
        Self {
            stream,
            core: ConnectionCore::new(config),
        }
    }

    /// Run a client handshake over `stream`.
    pub fn connect(stream: S, config: Arc<TlsConfig>) -> Result<Self, TlsError> {
        let mut conn = Self::new(stream, config);
        conn.core.begin_handshake(TlsRole::Client)?;
        conn.drive_handshake()?;
        Ok(conn)
    }

    /// Run a server handshake over `stream`.
    pub fn accept(stream: S, config: Arc<TlsConfig>) -> Result<Self, TlsError> {
        let mut conn = Self::new(stream, config);
        conn.core.begin_handshake(TlsRole::Server)?;
        conn.drive_handshake()?;
        Ok(conn)
    }

    pub fn connection(&self) -> &ConnectionCore {
        &self.core
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Send close_notify and flush it.
    pub fn close(&mut self) -> Result<(), TlsError> {
        let closed = self.core.close();
        self.flushed(closed)
    }
}

impl<S: Read + Write> TlsConnection for TlsStream<S> {
    fn handshake(&mut self) -> Result<(), TlsError> {
        let role = self.core.role();
        self.core.begin_handshake(role)?;
        self.drive_handshake()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        loop {
            if self.core.available_app_data() > 0 || self.core.is_closed() {
                let n = self.core.read_app_data(buf);
                // Post-handshake replies (KeyUpdate, alerts) may be queued.
                return self.flushed(n);
            }
            if !self.core.is_handshake_complete() {
                return self.core.read_app_data(buf);
            }
            let more = self.fill_records();
            if !self.flushed(more)? {
                debug!("stream ended");
                let closed = self.core.close_input();
                self.flushed(closed)?;
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TlsError> {
        let n = self.core.write_app_data(buf);
        self.flushed(n)
    }

    fn shutdown(&mut self) -> Result<(), TlsError> {
        self.close()
    }

    fn version(&self) -> Option<ProtocolVersion> {
        self.core.version()
    }

    fn cipher_suite(&self) -> Option<CipherSuite> {
        self.core.cipher_suite()
    }
}
