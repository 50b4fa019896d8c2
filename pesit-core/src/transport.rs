//! Transport channels: 2-byte big-endian length framing over a blocking
//! socket, plain TCP or TLS-wrapped.
//!
//! One transport write carries at most 65535 payload bytes, which is why
//! larger logical transfers are chunked above this layer.

use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConnection, StreamOwned};
use tracing::{debug, info, warn};

use crate::error::TransportError;

/// Largest payload one transport frame can carry.
pub const MAX_TRANSPORT_PAYLOAD: usize = 65_535;
/// Default socket receive timeout.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// A length-framed byte channel between two partners.
pub trait TransportChannel: Send {
    fn connect(&mut self) -> Result<(), TransportError>;
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;
    fn receive(&mut self) -> Result<Vec<u8>, TransportError>;
    fn close(&mut self) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
    fn set_receive_timeout(&mut self, timeout: Duration) -> Result<(), TransportError>;
    fn remote_address(&self) -> String;

    fn is_secure(&self) -> bool {
        false
    }
}

fn write_frame(w: &mut impl Write, data: &[u8]) -> Result<(), TransportError> {
    if data.len() > MAX_TRANSPORT_PAYLOAD {
        return Err(TransportError::FrameTooLarge(data.len()));
    }
    w.write_all(&(data.len() as u16).to_be_bytes())
        .and_then(|_| w.write_all(data))
        .and_then(|_| w.flush())
        .map_err(map_io)
}

fn read_frame(r: &mut impl Read) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf).map_err(map_io)?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).map_err(map_io)?;
    Ok(payload)
}

/// Classify socket failures: a read timeout calls for a different retry
/// policy than a peer close or a reset.
fn map_io(err: std::io::Error) -> TransportError {
    use std::io::ErrorKind::*;
    match err.kind() {
        WouldBlock | TimedOut => TransportError::Timeout,
        UnexpectedEof => TransportError::Closed,
        ConnectionReset | ConnectionAborted | BrokenPipe => TransportError::Reset,
        _ => TransportError::Io(err),
    }
}

fn tune(stream: &TcpStream, timeout: Duration) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    Ok(())
}

/// Plain TCP channel.
pub struct TcpTransportChannel {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    timeout: Duration,
}

impl TcpTransportChannel {
    pub fn new(host: &str, port: u16) -> Self {
        TcpTransportChannel {
            host: host.into(),
            port,
            stream: None,
            timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }

    /// Wrap an already-accepted server-side socket.
    pub fn accepted(stream: TcpStream) -> Result<Self, TransportError> {
        tune(&stream, DEFAULT_RECEIVE_TIMEOUT)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        let (host, port) = split_addr(&peer);
        Ok(TcpTransportChannel {
            host,
            port,
            stream: Some(stream),
            timeout: DEFAULT_RECEIVE_TIMEOUT,
        })
    }
}

fn split_addr(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().unwrap_or(0)),
        None => (addr.to_string(), 0),
    }
}

impl TransportChannel for TcpTransportChannel {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.is_connected() {
            warn!(host = %self.host, port = self.port, "already connected");
            return Ok(());
        }
        info!(host = %self.host, port = self.port, "connecting");
        let stream = TcpStream::connect((self.host.as_str(), self.port))?;
        tune(&stream, self.timeout)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        write_frame(stream, data)?;
        debug!(bytes = data.len(), "sent");
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let payload = read_frame(stream)?;
        debug!(bytes = payload.len(), "received");
        Ok(payload)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn set_receive_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.timeout = timeout;
        if let Some(stream) = &self.stream {
            stream.set_read_timeout(Some(timeout))?;
        }
        Ok(())
    }

    fn remote_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Client-side TLS channel. The handshake is driven to completion during
/// `connect` so certificate failures surface as connection errors rather
/// than surfacing later as protocol errors.
pub struct TlsTransportChannel {
    host: String,
    port: u16,
    config: Arc<rustls::ClientConfig>,
    stream: Option<StreamOwned<ClientConnection, TcpStream>>,
    timeout: Duration,
}

impl TlsTransportChannel {
    pub fn new(host: &str, port: u16, config: Arc<rustls::ClientConfig>) -> Self {
        TlsTransportChannel {
            host: host.into(),
            port,
            config,
            stream: None,
            timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }
}

impl TransportChannel for TlsTransportChannel {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        info!(host = %self.host, port = self.port, "connecting (TLS)");
        let tcp = TcpStream::connect((self.host.as_str(), self.port))?;
        tune(&tcp, self.timeout)?;
        let name = ServerName::try_from(self.host.clone())
            .map_err(|_| TransportError::InvalidServerName(self.host.clone()))?;
        let mut conn = ClientConnection::new(self.config.clone(), name)?;
        let mut tcp = tcp;
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp).map_err(map_io)?;
        }
        debug!("TLS handshake completed");
        self.stream = Some(StreamOwned::new(conn, tcp));
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        write_frame(stream, data)
    }

    fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        read_frame(stream)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.conn.send_close_notify();
            let _ = stream.flush();
            let _ = stream.sock.shutdown(std::net::Shutdown::Both);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn set_receive_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.timeout = timeout;
        if let Some(stream) = &self.stream {
            stream.sock.set_read_timeout(Some(timeout))?;
        }
        Ok(())
    }

    fn remote_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn is_secure(&self) -> bool {
        true
    }
}

/// Server-side TLS channel over an accepted socket.
pub struct TlsServerChannel {
    peer: String,
    stream: Option<StreamOwned<ServerConnection, TcpStream>>,
}

impl TlsServerChannel {
    /// Complete the handshake on an accepted socket before the first
    /// protocol read.
    pub fn accept(
        tcp: TcpStream,
        config: Arc<rustls::ServerConfig>,
    ) -> Result<Self, TransportError> {
        tune(&tcp, DEFAULT_RECEIVE_TIMEOUT)?;
        let peer = tcp
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        let mut conn = ServerConnection::new(config)?;
        let mut tcp = tcp;
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp).map_err(map_io)?;
        }
        debug!(peer = %peer, "TLS handshake completed");
        Ok(TlsServerChannel {
            peer,
            stream: Some(StreamOwned::new(conn, tcp)),
        })
    }
}

impl TransportChannel for TlsServerChannel {
    fn connect(&mut self) -> Result<(), TransportError> {
        // The handshake already ran in accept.
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        write_frame(stream, data)
    }

    fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        read_frame(stream)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.conn.send_close_notify();
            let _ = stream.flush();
            let _ = stream.sock.shutdown(std::net::Shutdown::Both);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn set_receive_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if let Some(stream) = &self.stream {
            stream.sock.set_read_timeout(Some(timeout))?;
        }
        Ok(())
    }

    fn remote_address(&self) -> String {
        self.peer.clone()
    }

    fn is_secure(&self) -> bool {
        true
    }
}

/// Client TLS configuration trusting the given PEM CA bundle.
pub fn client_tls_config(ca_pem: &Path) -> Result<Arc<rustls::ClientConfig>, TransportError> {
    let mut reader = BufReader::new(std::fs::File::open(ca_pem)?);
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        roots
            .add(cert?)
            .map_err(TransportError::Tls)?;
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Server TLS configuration from PEM certificate chain and private key.
pub fn server_tls_config(
    cert_pem: &Path,
    key_pem: &Path,
) -> Result<Arc<rustls::ServerConfig>, TransportError> {
    let mut cert_reader = BufReader::new(std::fs::File::open(cert_pem)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    let mut key_reader = BufReader::new(std::fs::File::open(key_pem)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| {
        TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "no private key in PEM file",
        ))
    })?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(TransportError::Tls)?;
    Ok(Arc::new(config))
}


#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn frame_layout_is_length_prefixed() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"abc").unwrap();
        assert_eq!(buf, vec![0x00, 0x03, b'a', b'b', b'c']);
        let decoded = read_frame(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, b"abc");
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut buf = Vec::new();
        let err = write_frame(&mut buf, &vec![0u8; MAX_TRANSPORT_PAYLOAD + 1]).unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge(_)));
    }

    #[test]
    fn short_read_maps_to_closed() {
        let partial = [0x00u8, 0x10, 1, 2, 3];
        let err = read_frame(&mut partial.as_slice()).unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[test]
    fn tcp_roundtrip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let mut chan = TcpTransportChannel::accepted(sock).unwrap();
            let got = chan.receive().unwrap();
            chan.send(&got).unwrap();
        });

        let mut client = TcpTransportChannel::new("127.0.0.1", addr.port());
        client.connect().unwrap();
        client.send(b"ping").unwrap();
        assert_eq!(client.receive().unwrap(), b"ping");
        client.close().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn receive_timeout_is_distinct() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _keep = std::thread::spawn(move || {
            let (_sock, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_millis(500));
        });

        let mut client = TcpTransportChannel::new("127.0.0.1", addr.port());
        client.connect().unwrap();
        client
            .set_receive_timeout(Duration::from_millis(50))
            .unwrap();
        assert!(matches!(
            client.receive().unwrap_err(),
            TransportError::Timeout
        ));
    }

    #[test]
    fn not_connected_is_reported() {
        let mut chan = TcpTransportChannel::new("127.0.0.1", 1);
        assert!(matches!(
            chan.send(b"x").unwrap_err(),
            TransportError::NotConnected
        ));
    }
}
