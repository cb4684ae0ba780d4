//! UDP transport and wire format
//!
//! One datagram per encoded frame: a 4-byte little-endian sequence number
//! followed by the payload bytes. The datagram length delimits the payload;
//! there is no length prefix, magic number or checksum. Datagrams shorter
//! than the sequence number are malformed and counted.
//!
//! The same endpoint serves three roles chosen at start: a listener that
//! learns its peer from incoming datagrams, an initiator that knows the
//! peer up front, and a symmetric peer with both ports fixed.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::codec::EncodedPacket;
use crate::constants::MAX_PACKET_SIZE;
use crate::error::NetworkError;

/// Wire header: the sequence number
const HEADER_LEN: usize = 4;

/// Largest payload that still fits one datagram
pub const MAX_PAYLOAD: usize = MAX_PACKET_SIZE - HEADER_LEN;

/// Receive scratch buffer size
const RECV_BUFFER_LEN: usize = 2048;

/// Poll interval for observing shutdown while blocked in recv
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Serialize a packet to its datagram form
pub fn encode_wire(packet: &EncodedPacket) -> Vec<u8> {
    let mut wire = Vec::with_capacity(HEADER_LEN + packet.payload.len());
    wire.extend_from_slice(&packet.sequence.to_le_bytes());
    wire.extend_from_slice(&packet.payload);
    wire
}

/// Parse a datagram; `None` when it is too short to carry a header
pub fn decode_wire(data: &[u8]) -> Option<(u32, Bytes)> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let sequence = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    Some((sequence, Bytes::copy_from_slice(&data[HEADER_LEN..])))
}

/// Transport counters
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub sent: u64,
    pub received: u64,
    pub failed_sends: u64,
    pub malformed: u64,
}

pub struct UdpTransport {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    running: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    sent: AtomicU64,
    received: Arc<AtomicU64>,
    failed_sends: AtomicU64,
    malformed: Arc<AtomicU64>,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self {
            socket: Mutex::new(None),
            remote: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
            sent: AtomicU64::new(0),
            received: Arc::new(AtomicU64::new(0)),
            failed_sends: AtomicU64::new(0),
            malformed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bind a local port and learn the remote address from incoming traffic
    pub fn start_listener(
        &self,
        local_port: u16,
        handler: impl Fn(EncodedPacket, SocketAddr) + Send + 'static,
    ) -> Result<(), NetworkError> {
        self.start(("0.0.0.0", local_port), None, true, handler)
    }

    /// Bind an ephemeral port and target a fixed remote address
    pub fn start_initiator(
        &self,
        remote: SocketAddr,
        handler: impl Fn(EncodedPacket, SocketAddr) + Send + 'static,
    ) -> Result<(), NetworkError> {
        self.start(("0.0.0.0", 0), Some(remote), false, handler)
    }

    /// Bind a known local port and target a known remote address
    pub fn start_peer(
        &self,
        remote_ip: IpAddr,
        local_port: u16,
        remote_port: u16,
        handler: impl Fn(EncodedPacket, SocketAddr) + Send + 'static,
    ) -> Result<(), NetworkError> {
        let remote = SocketAddr::new(remote_ip, remote_port);
        self.start(("0.0.0.0", local_port), Some(remote), false, handler)
    }

    fn start(
        &self,
        bind: (&str, u16),
        remote: Option<SocketAddr>,
        learn_remote: bool,
        handler: impl Fn(EncodedPacket, SocketAddr) + Send + 'static,
    ) -> Result<(), NetworkError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let socket = UdpSocket::bind(bind).map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        let socket = Arc::new(socket);

        *self.remote.lock() = remote;
        *self.socket.lock() = Some(socket.clone());
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let remote_slot = self.remote.clone();
        let received = self.received.clone();
        let malformed = self.malformed.clone();

        let handle = thread::Builder::new()
            .name("udp-receive".to_string())
            .spawn(move || {
                receive_loop(
                    socket,
                    running,
                    remote_slot,
                    learn_remote,
                    received,
                    malformed,
                    handler,
                );
            })
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        *self.receiver.lock() = Some(handle);

        tracing::info!(
            local = %self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            remote = ?remote,
            learn_remote,
            "udp transport started"
        );
        Ok(())
    }

    /// Update the send target; allowed while running
    pub fn set_remote(&self, addr: SocketAddr) -> Result<(), NetworkError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(NetworkError::NotRunning);
        }
        *self.remote.lock() = Some(addr);
        tracing::info!(remote = %addr, "remote address updated");
        Ok(())
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().as_ref()?.local_addr().ok()
    }

    /// Serialize and send one frame as a single datagram
    ///
    /// Failures are counted and never retried; the caller moves on to the
    /// next frame.
    pub fn send_frame(&self, packet: &EncodedPacket) -> Result<(), NetworkError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(NetworkError::NotRunning);
        }
        if packet.payload.len() > MAX_PAYLOAD {
            self.failed_sends.fetch_add(1, Ordering::Relaxed);
            return Err(NetworkError::PacketTooLarge(packet.payload.len()));
        }

        let socket = self
            .socket
            .lock()
            .clone()
            .ok_or(NetworkError::NotRunning)?;
        let remote = (*self.remote.lock()).ok_or(NetworkError::NoRemote)?;

        let wire = encode_wire(packet);
        match socket.send_to(&wire, remote) {
            Ok(sent) if sent == wire.len() => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(sent) => {
                self.failed_sends.fetch_add(1, Ordering::Relaxed);
                Err(NetworkError::PartialSend {
                    sent,
                    len: wire.len(),
                })
            }
            Err(e) => {
                self.failed_sends.fetch_add(1, Ordering::Relaxed);
                Err(NetworkError::SendFailed(e.to_string()))
            }
        }
    }

    /// Close the socket and join the receive loop
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.socket.lock() = None;
        if let Some(handle) = self.receiver.lock().take() {
            let _ = handle.join();
        }
        tracing::info!("udp transport stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            failed_sends: self.failed_sends.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    socket: Arc<UdpSocket>,
    running: Arc<AtomicBool>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    learn_remote: bool,
    received: Arc<AtomicU64>,
    malformed: Arc<AtomicU64>,
    handler: impl Fn(EncodedPacket, SocketAddr),
) {
    let mut buffer = [0u8; RECV_BUFFER_LEN];

    while running.load(Ordering::Relaxed) {
        let (len, from) = match socket.recv_from(&mut buffer) {
            Ok(result) => result,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                if running.load(Ordering::Relaxed) {
                    tracing::warn!("receive failed: {e}");
                }
                break;
            }
        };

        // A listener keeps following its peer so the reply path survives
        // address changes.
        if learn_remote {
            *remote.lock() = Some(from);
        }

        match decode_wire(&buffer[..len]) {
            Some((sequence, payload)) => {
                received.fetch_add(1, Ordering::Relaxed);
                // The encode-time bitrate is not carried on the wire.
                handler(EncodedPacket::new(payload, sequence, 0), from);
            }
            None => {
                malformed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(len, %from, "malformed datagram discarded");
            }
        }
    }
}
