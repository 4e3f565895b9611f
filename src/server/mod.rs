use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::config;
use crate::connections::{ConnectionRegistry, DeliveryError, OutboundEvent};
use crate::wire::codec::{FrameBuffer, WireCodec};
use crate::wire::envelope::WireEnvelope;

const READ_CHUNK_SIZE: usize = 8 * 1024;
const WRITE_RETRY_PAUSE: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub enum ServerError {
    Bind { address: String, source: io::Error },
    SetNonBlocking { source: io::Error },
    TlsNotSupportedYet,
    Accept { source: io::Error },
    ConfigureAcceptedStream { source: io::Error },
    StreamClone { source: io::Error },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::TlsNotSupportedYet => {
                write!(f, "TLS is enabled in config but TLS transport is not implemented yet")
            }
            Self::Accept { source } => write!(f, "failed to accept TCP connection: {source}"),
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::StreamClone { source } => {
                write!(f, "failed to clone accepted TCP stream for full duplex IO: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One frame read from a client: a parsed envelope or the reason it was unusable.
#[derive(Debug, PartialEq)]
pub enum InboundFrame {
    Envelope(WireEnvelope),
    Invalid { reason: String },
}

#[derive(Debug, Default)]
pub struct ReadBatch {
    pub frames: Vec<InboundFrame>,
    pub closed: bool,
}

pub struct PersistentConnection {
    id: u64,
    peer_addr: SocketAddr,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    frames: Mutex<FrameBuffer>,
    write_timeout: Duration,
    broken: AtomicBool,
}

impl PersistentConnection {
    fn new(
        id: u64,
        stream: TcpStream,
        peer_addr: SocketAddr,
        codec: WireCodec,
        write_timeout: Duration,
    ) -> Result<Self, ServerError> {
        stream
            .set_nodelay(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        stream
            .set_nonblocking(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;

        let writer = stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;

        Ok(Self {
            id,
            peer_addr,
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
            frames: Mutex::new(FrameBuffer::new(codec)),
            write_timeout,
            broken: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Drains whatever the socket has buffered without blocking.
    pub fn read_available(&self) -> ReadBatch {
        let mut batch = ReadBatch::default();
        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        let mut frames = lock(&self.frames);

        loop {
            let read = lock(&self.reader).read(&mut chunk);
            match read {
                Ok(0) => {
                    batch.closed = true;
                    break;
                }
                Ok(count) => frames.extend(&chunk[..count]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    batch.closed = true;
                    break;
                }
            }
        }

        loop {
            match frames.next_envelope() {
                Ok(Some(raw)) => batch.frames.push(match WireEnvelope::from_raw(&raw) {
                    Ok(envelope) => InboundFrame::Envelope(envelope),
                    Err(error) => InboundFrame::Invalid {
                        reason: error.to_string(),
                    },
                }),
                Ok(None) => break,
                Err(error) => {
                    // Frame boundaries are lost; the stream cannot be resynchronized.
                    batch.frames.push(InboundFrame::Invalid {
                        reason: error.to_string(),
                    });
                    batch.closed = true;
                    break;
                }
            }
        }
        batch
    }

    /// True once a write failed; the outbound stream may end mid-frame and takes no more frames.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Writes one whole frame. Any failure marks the connection broken and shuts the
    /// socket down, so the next read reports it closed.
    pub fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if self.is_broken() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let result = self.write_whole_frame(frame);
        if result.is_err() {
            self.broken.store(true, Ordering::SeqCst);
            let _ = self.shutdown();
        }
        result
    }

    fn write_whole_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = lock(&self.writer);
        let deadline = Instant::now() + self.write_timeout;
        let mut written = 0;

        while written < frame.len() {
            match writer.write(&frame[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(count) => written += count,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::from(io::ErrorKind::TimedOut));
                    }
                    thread::sleep(WRITE_RETRY_PAUSE);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }
        writer.flush()
    }

    pub fn shutdown(&self) -> io::Result<()> {
        let _ = lock(&self.reader).shutdown(Shutdown::Both);
        lock(&self.writer).shutdown(Shutdown::Both)
    }
}

/// Nonblocking TCP listener and the table of live client connections.
pub struct TcpServer {
    listener: TcpListener,
    codec: WireCodec,
    write_timeout: Duration,
    next_connection_id: AtomicU64,
    active_connections: Mutex<HashMap<u64, Arc<PersistentConnection>>>,
}

impl TcpServer {
    pub fn bind(config: &config::ServerConfig, codec: WireCodec) -> Result<Self, ServerError> {
        if config.tls_enabled {
            return Err(ServerError::TlsNotSupportedYet);
        }

        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            codec,
            write_timeout: Duration::from_millis(config.write_timeout_ms.max(1)),
            next_connection_id: AtomicU64::new(1),
            active_connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_app_config(app_config: &config::AppConfig) -> Result<Self, ServerError> {
        Self::bind(
            &app_config.server,
            WireCodec::new(app_config.wire.max_envelope_size_bytes),
        )
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn try_accept_persistent(&self) -> Result<Option<Arc<PersistentConnection>>, ServerError> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                let connection = Arc::new(PersistentConnection::new(
                    id,
                    stream,
                    peer_addr,
                    self.codec,
                    self.write_timeout,
                )?);
                lock(&self.active_connections).insert(id, Arc::clone(&connection));
                Ok(Some(connection))
            }
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(ServerError::Accept { source }),
        }
    }

    pub fn connections(&self) -> Vec<Arc<PersistentConnection>> {
        lock(&self.active_connections).values().cloned().collect()
    }

    pub fn drop_connection(&self, id: u64) {
        if let Some(connection) = lock(&self.active_connections).remove(&id) {
            let _ = connection.shutdown();
        }
    }

    pub fn shutdown_all_connections(&self) {
        let mut connections = lock(&self.active_connections);
        for connection in connections.values() {
            let _ = connection.shutdown();
        }
        connections.clear();
    }
}

impl ConnectionRegistry for TcpServer {
    fn is_live(&self, connection_id: u64) -> bool {
        lock(&self.active_connections)
            .get(&connection_id)
            .is_some_and(|connection| !connection.is_broken())
    }

    fn send(&self, connection_id: u64, event: OutboundEvent) -> Result<(), DeliveryError> {
        let connection = lock(&self.active_connections)
            .get(&connection_id)
            .filter(|connection| !connection.is_broken())
            .cloned()
            .ok_or(DeliveryError::NotConnected { connection_id })?;

        let frame = self
            .codec
            .encode_frame(&event.into_envelope().into_raw())
            .map_err(DeliveryError::Encode)?;
        connection
            .write_frame(&frame)
            .map_err(|source| DeliveryError::Io {
                connection_id,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::io::{ErrorKind, Read, Write};
    use std::net::TcpStream;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use serde_json::json;

    use crate::config::{AppConfig, ServerConfig};
    use crate::connections::{ConnectionRegistry, DeliveryError, OutboundEvent};
    use crate::wire::codec::WireCodec;
    use crate::wire::envelope::{PayloadMap, WireEnvelope, FAILURE_REPLY_TYPE, MESSAGE_EVENT_TYPE};

    use super::{InboundFrame, PersistentConnection, ServerError, TcpServer};

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
            tls_enabled: false,
            write_timeout_ms: 5_000,
        }
    }

    fn accept(server: &TcpServer) -> Arc<PersistentConnection> {
        for _ in 0..100 {
            if let Some(conn) = server
                .try_accept_persistent()
                .expect("accept poll should not fail")
            {
                return conn;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("server should accept connection");
    }

    fn read_until_frames(conn: &PersistentConnection, count: usize) -> super::ReadBatch {
        let mut merged = super::ReadBatch::default();
        for _ in 0..100 {
            let batch = conn.read_available();
            merged.frames.extend(batch.frames);
            merged.closed |= batch.closed;
            if merged.frames.len() >= count || merged.closed {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        merged
    }

    #[test]
    fn rejects_tls_until_implemented() {
        let cfg = ServerConfig {
            tls_enabled: true,
            ..local_config()
        };
        assert!(matches!(
            TcpServer::bind(&cfg, WireCodec::default()),
            Err(ServerError::TlsNotSupportedYet)
        ));
    }

    #[test]
    fn builds_server_from_app_config() {
        let app_config = AppConfig {
            server: local_config(),
            ..AppConfig::default()
        };
        let server = TcpServer::from_app_config(&app_config).expect("server should build");
        assert_eq!(
            server.local_addr().expect("bound address").ip().to_string(),
            "127.0.0.1"
        );
        assert!(server.try_accept_persistent().expect("poll").is_none());
    }

    #[test]
    fn reads_client_envelopes_and_delivers_replies() {
        let server = TcpServer::bind(&local_config(), WireCodec::default()).expect("server should bind");
        let mut client =
            TcpStream::connect(server.local_addr().expect("local addr")).expect("client should connect");
        let conn = accept(&server);
        assert!(server.is_live(conn.id()));
        assert_eq!(server.connections().len(), 1);

        let codec = WireCodec::default();
        let request = WireEnvelope::from_json(
            MESSAGE_EVENT_TYPE,
            "rid-1",
            &json!({"platform": "echo", "verb": "send"}),
        );
        let frame = codec
            .encode_frame(&request.clone().into_raw())
            .expect("frame should encode");
        client.write_all(&frame[..5]).expect("client write");
        client.write_all(&frame[5..]).expect("client write");

        let batch = read_until_frames(&conn, 1);
        assert_eq!(batch.frames, vec![InboundFrame::Envelope(request)]);
        assert!(!batch.closed);

        server
            .send(conn.id(), OutboundEvent::failure_reply("rid-1", json!({"error": "nope"})))
            .expect("send should work");
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout should apply");
        let mut header = [0_u8; 4];
        client.read_exact(&mut header).expect("reply header");
        let mut body = vec![0_u8; u32::from_be_bytes(header) as usize];
        client.read_exact(&mut body).expect("reply body");
        let reply = WireEnvelope::from_raw(&codec.decode_payload(&body).expect("reply decodes"))
            .expect("reply parses");
        assert_eq!(reply.message_type, FAILURE_REPLY_TYPE);
        assert_eq!(reply.request_id, "rid-1");
        assert_eq!(reply.payload_json().expect("json"), json!({"error": "nope"}));
    }

    #[test]
    fn bad_version_is_reported_and_garbage_closes_stream() {
        let server = TcpServer::bind(&local_config(), WireCodec::default()).expect("server should bind");
        let mut client =
            TcpStream::connect(server.local_addr().expect("local addr")).expect("client should connect");
        let conn = accept(&server);

        let mut stale = WireEnvelope::new(MESSAGE_EVENT_TYPE, "r", PayloadMap::new());
        stale.version = 9;
        let frame = WireCodec::default()
            .encode_frame(&stale.into_raw())
            .expect("frame should encode");
        client.write_all(&frame).expect("client write");
        let batch = read_until_frames(&conn, 1);
        assert!(matches!(batch.frames.as_slice(), [InboundFrame::Invalid { .. }]));
        assert!(!batch.closed);

        client.write_all(&[0, 0, 0, 0]).expect("client write");
        let batch = read_until_frames(&conn, 1);
        assert!(batch.closed);
    }

    #[test]
    fn dropped_connection_is_no_longer_live() {
        let server = TcpServer::bind(&local_config(), WireCodec::default()).expect("server should bind");
        let client =
            TcpStream::connect(server.local_addr().expect("local addr")).expect("client should connect");
        let conn = accept(&server);

        server.drop_connection(conn.id());
        assert!(!server.is_live(conn.id()));
        assert!(matches!(
            server.send(conn.id(), OutboundEvent::message_push(json!({}))),
            Err(DeliveryError::NotConnected { .. })
        ));

        let mut client = client;
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout should apply");
        let mut buf = [0_u8; 1];
        let read = client.read(&mut buf);
        assert!(matches!(read, Ok(0)) || read.map_err(|e| e.kind()) == Err(ErrorKind::ConnectionReset));
    }

    #[test]
    fn stalled_write_breaks_the_connection_instead_of_resuming_mid_frame() {
        let cfg = ServerConfig {
            write_timeout_ms: 200,
            ..local_config()
        };
        let server = TcpServer::bind(&cfg, WireCodec::default()).expect("server should bind");
        let _silent_client =
            TcpStream::connect(server.local_addr().expect("local addr")).expect("client should connect");
        let conn = accept(&server);

        let bulky = OutboundEvent::message_push(json!({"blob": "x".repeat(64 * 1024)}));
        let mut failure = None;
        for _ in 0..4096 {
            if let Err(error) = server.send(conn.id(), bulky.clone()) {
                failure = Some(error);
                break;
            }
        }
        assert!(matches!(failure, Some(DeliveryError::Io { .. })));

        assert!(conn.is_broken());
        assert!(!server.is_live(conn.id()));
        assert!(matches!(
            server.send(conn.id(), OutboundEvent::message_push(json!({}))),
            Err(DeliveryError::NotConnected { .. })
        ));
        assert!(read_until_frames(&conn, 1).closed);
    }
}
