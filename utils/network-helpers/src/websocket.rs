//! WebSocket termination for the engineer-side TCP port.
//!
//! An accepted engineer connection may be plain MAVLink-over-TCP, a WebSocket
//! upgrade, or a TLS-wrapped WebSocket. [`sniff`] classifies the stream by
//! peeking its first bytes; [`WsConnection`] then terminates the optional TLS
//! layer and the RFC 6455 framing, handing decoded payload bytes to the
//! caller as if the socket were a plain byte stream.

use std::{fmt, fs::File, io, io::BufReader, path::Path, sync::Arc};

use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{rustls, server::TlsStream, TlsAcceptor};
use tracing::debug;

/// RFC 6455 handshake GUID.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Certificate chain and private key file names, looked up in the configured
/// certificate directory.
pub const CERT_FILE: &str = "fullchain.pem";
pub const KEY_FILE: &str = "privkey.pem";

const SNIFF_LEN: usize = 14;
const READ_CHUNK: usize = 4096;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Tls(rustls::Error),
    /// Peer closed the stream.
    Closed,
    /// The HTTP upgrade request was complete but unusable.
    Handshake(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "websocket I/O error: {e}"),
            Error::Tls(e) => write!(f, "TLS error: {e}"),
            Error::Closed => write!(f, "websocket closed by peer"),
            Error::Handshake(msg) => write!(f, "websocket handshake failed: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e)
    }
}

/// What the first bytes of an engineer TCP stream announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Plain,
    WebSocket,
    TlsWebSocket,
}

/// Classify a freshly accepted stream without consuming any bytes.
///
/// `16 03 01` is a TLS 1.x ClientHello record; a literal `GET / HTTP/1.1`
/// opens a plain-text upgrade. Anything else is treated as raw MAVLink.
pub async fn sniff(stream: &TcpStream) -> io::Result<Transport> {
    let mut buf = [0u8; SNIFF_LEN];
    let n = stream.peek(&mut buf).await?;
    if n >= 3 && buf[..3] == [0x16, 0x03, 0x01] {
        return Ok(Transport::TlsWebSocket);
    }
    if n >= SNIFF_LEN && buf == *b"GET / HTTP/1.1" {
        return Ok(Transport::WebSocket);
    }
    Ok(Transport::Plain)
}

/// Build a TLS acceptor from `fullchain.pem` / `privkey.pem` in `cert_dir`.
pub fn tls_acceptor(cert_dir: &Path) -> Result<TlsAcceptor> {
    let cert_path = cert_dir.join(CERT_FILE);
    let key_path = cert_dir.join(KEY_FILE);
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<io::Result<Vec<_>>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| Error::Handshake(format!("no private key in {KEY_FILE}")))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(sec_websocket_key: &str) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    let mut hasher = Sha1::new();
    hasher.update(sec_websocket_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

fn upgrade_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    )
}

enum UpgradeParse {
    /// Headers are not terminated yet; keep reading.
    Incomplete,
    NoKey,
    /// The client key plus how many bytes the request head occupies, so the
    /// caller can drop exactly the head and nothing after it.
    Key { key: String, head_end: usize },
}

/// Look for a complete HTTP request head and extract `Sec-WebSocket-Key`.
fn parse_upgrade(pending: &[u8]) -> UpgradeParse {
    let head_end = match pending.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => pos + 4,
        None => return UpgradeParse::Incomplete,
    };
    let head = String::from_utf8_lossy(&pending[..head_end]);
    const MARKER: &str = "Sec-WebSocket-Key: ";
    let key_pos = match head.find(MARKER) {
        Some(pos) => pos + MARKER.len(),
        None => return UpgradeParse::NoKey,
    };
    match head[key_pos..].find("\r\n") {
        Some(end) => UpgradeParse::Key {
            key: head[key_pos..key_pos + end].to_string(),
            head_end,
        },
        None => UpgradeParse::NoKey,
    }
}

/// Decode the first frame in `buf`, unmasking (or moving) the payload to the
/// start of the buffer. Returns the payload length and how many input bytes
/// the frame occupied, or `None` while the frame is still incomplete.
pub fn decode_frame(buf: &mut [u8]) -> Option<(usize, usize)> {
    let n = buf.len();
    if n < 2 {
        return None;
    }
    // byte 0 carries FIN and the opcode; neither changes relaying
    let masked = buf[1] & 0x80 != 0;
    let mut payload_len = (buf[1] & 0x7f) as usize;
    let mut pos = 2;

    if payload_len == 126 {
        if n < 4 {
            return None;
        }
        payload_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        pos += 2;
    } else if payload_len == 127 {
        if n < 10 {
            return None;
        }
        payload_len = u64::from_be_bytes(buf[2..10].try_into().unwrap()) as usize;
        pos += 8;
    }

    if masked {
        if n < pos + 4 + payload_len {
            return None;
        }
        let mask = [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]];
        pos += 4;
        for i in 0..payload_len {
            buf[i] = buf[pos + i] ^ mask[i % 4];
        }
    } else {
        if n < pos + payload_len {
            return None;
        }
        buf.copy_within(pos..pos + payload_len, 0);
    }

    Some((payload_len, pos + payload_len))
}

/// Wrap a payload in a single FIN + binary frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let n = payload.len();
    let mut out = Vec::with_capacity(n + 10);
    out.push(0x82); // FIN + binary opcode
    if n <= 125 {
        out.push(n as u8);
    } else if n <= 65535 {
        out.push(126);
        out.extend_from_slice(&(n as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(n as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// The transport under the WebSocket framing.
enum WsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl WsStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            WsStream::Plain(s) => s.read(buf).await,
            WsStream::Tls(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            WsStream::Plain(s) => s.write_all(buf).await,
            WsStream::Tls(s) => s.write_all(buf).await,
        }
    }
}

/// A terminated WebSocket: byte-stream reads and writes on the outside,
/// framed and optionally TLS-wrapped on the wire.
pub struct WsConnection {
    io: WsStream,
    pending: Vec<u8>,
    handshaken: bool,
}

impl WsConnection {
    /// Terminate a plain-text WebSocket.
    pub async fn accept(stream: TcpStream) -> Result<Self> {
        Self::new(WsStream::Plain(stream)).await
    }

    /// Terminate TLS first, then the WebSocket inside it.
    pub async fn accept_tls(stream: TcpStream, acceptor: &TlsAcceptor) -> Result<Self> {
        let tls = acceptor.accept(stream).await?;
        Self::new(WsStream::Tls(Box::new(tls))).await
    }

    async fn new(io: WsStream) -> Result<Self> {
        let mut conn = WsConnection {
            io,
            pending: Vec::new(),
            handshaken: false,
        };
        conn.fill_pending().await?;
        conn.try_handshake().await?;
        Ok(conn)
    }

    async fn fill_pending(&mut self) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.io.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Closed);
        }
        self.pending.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn try_handshake(&mut self) -> Result<()> {
        if self.handshaken {
            return Ok(());
        }
        match parse_upgrade(&self.pending) {
            UpgradeParse::Incomplete => Ok(()),
            UpgradeParse::NoKey => Err(Error::Handshake("missing Sec-WebSocket-Key".into())),
            UpgradeParse::Key { key, head_end } => {
                let response = upgrade_response(&accept_key(&key));
                self.io.write_all(response.as_bytes()).await?;
                // drop the request head only: bytes coalesced after it are
                // the first frame and stay pending for recv
                self.pending.drain(..head_end);
                self.handshaken = true;
                debug!("websocket handshake complete");
                Ok(())
            }
        }
    }

    /// Receive one frame's payload into `buf` (truncating to its length).
    /// Waits until a complete frame is buffered; `Err(Closed)` on EOF.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.handshaken {
                if let Some((payload_len, used)) = decode_frame(&mut self.pending) {
                    let n = payload_len.min(buf.len());
                    buf[..n].copy_from_slice(&self.pending[..n]);
                    self.pending.drain(..used);
                    return Ok(n);
                }
            }
            self.fill_pending().await?;
            self.try_handshake().await?;
        }
    }

    /// Send one payload as a single binary frame. Any write failure is
    /// terminal for the connection.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(payload);
        self.io.write_all(&frame).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn accept_key_vector() {
        // the RFC 6455 worked example
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn decode_masked_frame() {
        let payload = b"mavlink";
        let mask = [0x11, 0x22, 0x33, 0x44];
        let mut wire = vec![0x82, 0x80 | payload.len() as u8];
        wire.extend_from_slice(&mask);
        for (i, b) in payload.iter().enumerate() {
            wire.push(b ^ mask[i % 4]);
        }
        let total = wire.len();
        let (len, used) = decode_frame(&mut wire).unwrap();
        assert_eq!(len, payload.len());
        assert_eq!(used, total);
        assert_eq!(&wire[..len], payload);
    }

    #[test]
    fn decode_unmasked_frame_moves_payload() {
        let mut wire = vec![0x82, 0x03, 0xaa, 0xbb, 0xcc];
        let (len, used) = decode_frame(&mut wire).unwrap();
        assert_eq!((len, used), (3, 5));
        assert_eq!(&wire[..3], &[0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn decode_incomplete_returns_none() {
        let mut wire = vec![0x82, 0x05, 0x01, 0x02];
        assert!(decode_frame(&mut wire).is_none());
        let mut header_only = vec![0x82];
        assert!(decode_frame(&mut header_only).is_none());
    }

    #[test]
    fn encode_length_forms() {
        assert_eq!(encode_frame(&[0u8; 125])[1], 125);

        let f = encode_frame(&[0u8; 126]);
        assert_eq!(f[1], 126);
        assert_eq!(u16::from_be_bytes([f[2], f[3]]), 126);

        let f = encode_frame(&[0u8; 65535]);
        assert_eq!(f[1], 126);
        assert_eq!(u16::from_be_bytes([f[2], f[3]]), 65535);

        let f = encode_frame(&[0u8; 65536]);
        assert_eq!(f[1], 127);
        assert_eq!(u64::from_be_bytes(f[2..10].try_into().unwrap()), 65536);
    }

    #[test]
    fn encode_decode_roundtrip() {
        for size in [0usize, 1, 125, 126, 300, 65535, 70000] {
            let payload = vec![0x5a; size];
            let mut wire = encode_frame(&payload);
            let (len, used) = decode_frame(&mut wire).unwrap();
            assert_eq!(len, size);
            assert_eq!(used, wire.len());
            assert_eq!(&wire[..len], &payload[..]);
        }
    }

    #[test]
    fn two_frames_in_buffer_compact_correctly() {
        let mut wire = encode_frame(b"one");
        wire.extend(encode_frame(b"second"));
        let (len, used) = decode_frame(&mut wire).unwrap();
        assert_eq!(&wire[..len], b"one");
        wire.drain(..used);
        let (len, _) = decode_frame(&mut wire).unwrap();
        assert_eq!(&wire[..len], b"second");
    }

    #[test]
    fn parse_upgrade_cases() {
        let req = b"GET / HTTP/1.1\r\nHost: x\r\nSec-WebSocket-Key: abc123==\r\n\r\n";
        match parse_upgrade(req) {
            UpgradeParse::Key { key, head_end } => {
                assert_eq!(key, "abc123==");
                assert_eq!(head_end, req.len());
            }
            _ => panic!("expected key"),
        }
        // bytes after the head do not move head_end
        let mut pipelined = req.to_vec();
        pipelined.extend_from_slice(&[0x82, 0x01, 0xfd]);
        match parse_upgrade(&pipelined) {
            UpgradeParse::Key { head_end, .. } => assert_eq!(head_end, req.len()),
            _ => panic!("expected key"),
        }
        assert!(matches!(
            parse_upgrade(b"GET / HTTP/1.1\r\nHost: x\r\n"),
            UpgradeParse::Incomplete
        ));
        assert!(matches!(
            parse_upgrade(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"),
            UpgradeParse::NoKey
        ));
    }

    #[tokio::test]
    async fn sniff_classifies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        for (first_bytes, expected) in [
            (&b"\x16\x03\x01\x02\x00"[..], Transport::TlsWebSocket),
            (&b"GET / HTTP/1.1\r\n"[..], Transport::WebSocket),
            (&b"\xfd\x09\x00\x00\x00\x01\x01\x00\x00\x00\x00\x00\x00\x00"[..], Transport::Plain),
        ] {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let (server, _) = listener.accept().await.unwrap();
            client.write_all(first_bytes).await.unwrap();
            // wait until the bytes are peekable
            let mut probe = [0u8; 1];
            while server.peek(&mut probe).await.unwrap() == 0 {}
            assert_eq!(sniff(&server).await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn upgrade_and_frame_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(
                    b"GET / HTTP/1.1\r\nHost: relay\r\n\
                      Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
                )
                .await
                .unwrap();
            let mut response = vec![0u8; 256];
            let n = stream.read(&mut response).await.unwrap();
            let response = String::from_utf8_lossy(&response[..n]).into_owned();

            // masked binary frame carrying three bytes
            let mask = [1u8, 2, 3, 4];
            let payload = [0xfd, 0x00, 0xff];
            let mut frame = vec![0x82, 0x80 | 3];
            frame.extend_from_slice(&mask);
            for (i, b) in payload.iter().enumerate() {
                frame.push(b ^ mask[i % 4]);
            }
            stream.write_all(&frame).await.unwrap();

            // echo comes back unmasked
            let mut echo = [0u8; 16];
            let n = stream.read(&mut echo).await.unwrap();
            (response, echo[..n].to_vec())
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = WsConnection::accept(stream).await.unwrap();
        let mut buf = [0u8; 64];
        let n = conn.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0xfd, 0x00, 0xff]);
        conn.send(&buf[..n]).await.unwrap();

        let (response, echo) = client.await.unwrap();
        assert!(response.contains("101 Switching Protocols"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert_eq!(echo, vec![0x82, 0x03, 0xfd, 0x00, 0xff]);
    }

    /// A client that pipelines its first frame right behind the upgrade
    /// request, in one write, must not lose that frame when the handshake
    /// trims the pending buffer.
    #[tokio::test]
    async fn coalesced_upgrade_and_first_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut bytes = b"GET / HTTP/1.1\r\nHost: relay\r\n\
                              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
                .to_vec();
            let mask = [9u8, 8, 7, 6];
            let payload = b"abc";
            bytes.push(0x82);
            bytes.push(0x80 | payload.len() as u8);
            bytes.extend_from_slice(&mask);
            for (i, b) in payload.iter().enumerate() {
                bytes.push(b ^ mask[i % 4]);
            }
            stream.write_all(&bytes).await.unwrap();

            let mut response = vec![0u8; 256];
            let n = stream.read(&mut response).await.unwrap();
            String::from_utf8_lossy(&response[..n]).into_owned()
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = WsConnection::accept(stream).await.unwrap();
        let mut buf = [0u8; 16];
        let n = conn.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");

        let response = client.await.unwrap();
        assert!(response.contains("101 Switching Protocols"));
    }
}
