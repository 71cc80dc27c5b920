//! Connection pipeline for the canvas server.
//!
//! Every accepted socket runs on its own task. The task reads bytes into the
//! connection's adapter, drains every decoded frame in arrival order before
//! reading again, and writes whatever the adapter has queued. Frames reach the
//! business logic only after the version handshake succeeded.

use crate::adapter::FrameAdapter;
use crate::error::{SessionError, TransferError};
use crate::handshake::{Handshake, HandshakeOutcome};
use crate::registry::{AdapterRegistry, ConnectionId};
use crate::settings::{ServerSettings, SettingsHandle};
use crate::transfer::{ChunkedTransfer, TransferSet};
use anyhow::Context;
use bytes::BytesMut;
use canvas_wire::Frame;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Configuration for connection handling
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Close connections that stay silent this long
    pub idle_timeout: Duration,
    /// Initial capacity of the per-connection read buffer
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            read_buffer_size: 64 * 1024,
        }
    }
}

/// View of an authorized session handed to the [`Dispatcher`]
pub struct SessionContext<'a> {
    connection: ConnectionId,
    session_id: u32,
    adapter: &'a Arc<FrameAdapter>,
    settings: &'a Arc<ServerSettings>,
    transfers: &'a mut TransferSet,
}

impl SessionContext<'_> {
    /// Connection this session runs on
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Negotiated session ID
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// The connection's adapter
    pub fn adapter(&self) -> &Arc<FrameAdapter> {
        self.adapter
    }

    /// Settings snapshot taken when the session was authorized
    pub fn settings(&self) -> &ServerSettings {
        self.settings
    }

    /// Queue a frame for this session
    pub fn send(&self, frame: Frame) {
        self.adapter.enqueue(frame);
    }

    /// Offer a payload to the client; it moves as the client syncs
    pub fn start_transfer(&mut self, transfer: ChunkedTransfer) -> Result<(), TransferError> {
        self.transfers.add(transfer)
    }

    /// IDs of this session's transfers still in progress
    pub fn active_transfers(&self) -> Vec<u32> {
        self.transfers.ids()
    }

    /// Close the connection after the current frame
    pub fn disconnect(&self) {
        self.adapter.disconnect();
    }
}

/// Business logic driven by authorized traffic
///
/// `TransferSync` frames are routed to the session's transfers by the
/// pipeline and never reach `on_frame`.
pub trait Dispatcher: Send + Sync {
    /// Called once, right after the handshake succeeded
    fn on_authorized(&self, ctx: &mut SessionContext<'_>) {
        let _ = ctx;
    }

    /// Called for each authorized frame, in arrival order
    fn on_frame(&self, ctx: &mut SessionContext<'_>, frame: Frame);

    /// Called after the connection was torn down
    fn on_closed(&self, connection: ConnectionId, session_id: Option<u32>) {
        let _ = (connection, session_id);
    }
}

/// Dispatcher that only logs what it receives
#[derive(Debug, Default)]
pub struct LoggingDispatcher;

impl Dispatcher for LoggingDispatcher {
    fn on_authorized(&self, ctx: &mut SessionContext<'_>) {
        info!("Session {} ready on {}", ctx.session_id(), ctx.connection());
    }

    fn on_frame(&self, ctx: &mut SessionContext<'_>, frame: Frame) {
        match frame {
            Frame::Nop => {}
            other => debug!(
                "Session {} sent {:?} with no handler attached",
                ctx.session_id(),
                other.frame_type()
            ),
        }
    }
}

/// Pipeline state of one connection
struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    adapter: Arc<FrameAdapter>,
    handshake: Handshake,
    transfers: TransferSet,
    authorized: Option<(u32, Arc<ServerSettings>)>,
}

impl Connection {
    fn new(id: ConnectionId, peer: SocketAddr, adapter: Arc<FrameAdapter>) -> Self {
        Self {
            id,
            peer,
            adapter,
            handshake: Handshake::new(),
            transfers: TransferSet::new(),
            authorized: None,
        }
    }

    fn context(&mut self) -> Option<SessionContext<'_>> {
        let (session_id, settings) = self.authorized.as_ref()?;
        Some(SessionContext {
            connection: self.id,
            session_id: *session_id,
            adapter: &self.adapter,
            settings,
            transfers: &mut self.transfers,
        })
    }
}

/// Accepts connections and runs one pipeline per connection
pub struct Server {
    config: ServerConfig,
    registry: Arc<AdapterRegistry>,
    settings: Arc<SettingsHandle>,
    dispatcher: Arc<dyn Dispatcher>,
    next_connection: AtomicU64,
}

impl Server {
    /// Create a server
    pub fn new(
        config: ServerConfig,
        registry: Arc<AdapterRegistry>,
        settings: Arc<SettingsHandle>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            config,
            registry,
            settings,
            dispatcher,
            next_connection: AtomicU64::new(1),
        }
    }

    /// Registry of live connections
    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    /// Settings handle; swapping it affects sessions authorized afterwards
    pub fn settings(&self) -> &Arc<SettingsHandle> {
        &self.settings
    }

    /// Session IDs of all connected, authorized clients
    pub fn sessions(&self) -> Vec<u32> {
        self.registry.sessions()
    }

    /// Accept connections forever, one task per connection
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("Accepting connections on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await.context("accept failed")?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not disable Nagle for {}: {}", peer, e);
            }

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run_connection(stream, peer).await {
                    warn!("Connection from {} ended with error: {:#}", peer, e);
                }
            });
        }
    }

    /// Run the pipeline of one connection until it closes
    pub async fn run_connection<S>(&self, mut stream: S, peer: SocketAddr) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let adapter = match self.registry.get_or_create(id) {
            Ok(adapter) => adapter,
            Err(e) => {
                error!("Refusing connection from {}: {}", peer, e);
                stream.shutdown().await.ok();
                return Err(e.into());
            }
        };
        info!(
            "New connection {} from {} (session candidate {})",
            id,
            peer,
            adapter.assigned_id()
        );

        let mut connection = Connection::new(id, peer, adapter);
        let result = self.drive(&mut connection, &mut stream).await;

        let session_id = connection.adapter.session_id();
        self.registry.destroy(id);
        self.dispatcher.on_closed(id, session_id);

        if let Err(e) = stream.shutdown().await {
            debug!("Shutdown of {} failed: {}", peer, e);
        }
        info!("Connection {} from {} closed (session {:?})", id, peer, session_id);

        result
    }

    async fn drive<S>(&self, conn: &mut Connection, stream: &mut S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut read_buf = BytesMut::with_capacity(self.config.read_buffer_size);
        let mut last_activity = Instant::now();

        loop {
            if conn.adapter.is_closed() {
                debug!("Adapter for {} closed; ending pipeline", conn.id);
                return Ok(());
            }

            tokio::select! {
                biased;

                // Frames queued from outside this task, or a disconnect
                _ = conn.adapter.flushed() => {
                    write_pending(&conn.adapter, stream).await?;
                }

                read = stream.read_buf(&mut read_buf) => {
                    let bytes_read = read.with_context(|| format!("read from {} failed", conn.peer))?;
                    if bytes_read == 0 {
                        debug!("{} closed by peer", conn.id);
                        return Ok(());
                    }
                    last_activity = Instant::now();
                    trace!("Read {} bytes from {}", bytes_read, conn.peer);

                    let decoded = conn.adapter.decode(&read_buf);
                    read_buf.clear();
                    if let Err(e) = decoded {
                        warn!("Protocol error from {}: {}; disconnecting", conn.peer, e);
                        conn.adapter.disconnect();
                        return Err(SessionError::from(e).into());
                    }

                    self.dispatch(conn)?;
                    write_pending(&conn.adapter, stream).await?;
                }

                _ = tokio::time::sleep_until(last_activity + self.config.idle_timeout) => {
                    warn!("Idle timeout reached for {}; closing connection", conn.peer);
                    return Ok(());
                }
            }
        }
    }

    /// Drain the incoming queue in arrival order
    fn dispatch(&self, conn: &mut Connection) -> Result<(), SessionError> {
        for frame in conn.adapter.take_incoming() {
            match conn.handshake.on_frame(&conn.adapter, frame) {
                HandshakeOutcome::Authorized(session_id) => {
                    conn.authorized = Some((session_id, self.settings.current()));
                    if let Some(mut ctx) = conn.context() {
                        self.dispatcher.on_authorized(&mut ctx);
                    }
                }
                HandshakeOutcome::Forward(Frame::TransferSync(target)) => {
                    if conn.transfers.on_sync(&conn.adapter, target).is_none() {
                        debug!("Ignoring sync {:?} from {}: no matching transfer", target, conn.id);
                    }
                }
                HandshakeOutcome::Forward(frame) => {
                    if let Some(mut ctx) = conn.context() {
                        self.dispatcher.on_frame(&mut ctx, frame);
                    }
                }
                HandshakeOutcome::Rejected(error) => return Err(error),
                HandshakeOutcome::Closed => break,
            }
        }

        Ok(())
    }
}

async fn write_pending<S>(adapter: &FrameAdapter, stream: &mut S) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes = adapter.flush();
    if bytes.is_empty() {
        return Ok(());
    }

    stream.write_all(&bytes).await.context("write failed")?;
    stream.flush().await.context("flush failed")?;
    trace!("Wrote {} bytes", bytes.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AdapterEvent;
    use crate::transfer::{Assembly, PayloadSource, TransferAssembler, CHUNK_SIZE};
    use crate::transport::{connect_tcp, listen_tcp};
    use bytes::Bytes;
    use canvas_wire::{ProtocolVersion, SyncTarget, CURRENT_VERSION};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;

    const IMAGE_ID: u32 = 21;

    fn image() -> Bytes {
        (0..25_000u32).map(|i| (i % 253) as u8).collect::<Vec<_>>().into()
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    /// Offers one image to every new session and records closures
    #[derive(Default)]
    struct ImageDispatcher {
        images: HashMap<u32, Bytes>,
        frames: Mutex<Vec<Frame>>,
        closed: Mutex<Vec<Option<u32>>>,
        credentials_seen: Mutex<Vec<usize>>,
    }

    impl ImageDispatcher {
        fn with_image() -> Self {
            Self {
                images: HashMap::from([(IMAGE_ID, image())]),
                ..Self::default()
            }
        }
    }

    impl PayloadSource for ImageDispatcher {
        fn encode(&self, id: u32) -> Result<Bytes, TransferError> {
            self.images
                .get(&id)
                .cloned()
                .ok_or_else(|| TransferError::PayloadUnavailable {
                    id,
                    reason: "unknown image".to_string(),
                })
        }
    }

    impl Dispatcher for ImageDispatcher {
        fn on_authorized(&self, ctx: &mut SessionContext<'_>) {
            self.credentials_seen
                .lock()
                .unwrap()
                .push(ctx.settings().credentials.len());
            if let Ok(transfer) = ChunkedTransfer::from_source(self, IMAGE_ID) {
                ctx.start_transfer(transfer).unwrap();
            }
        }

        fn on_frame(&self, _ctx: &mut SessionContext<'_>, frame: Frame) {
            self.frames.lock().unwrap().push(frame);
        }

        fn on_closed(&self, _connection: ConnectionId, session_id: Option<u32>) {
            self.closed.lock().unwrap().push(session_id);
        }
    }

    /// Minimal client speaking the protocol through its own adapter
    struct Client<S> {
        stream: S,
        codec: FrameAdapter,
        received: VecDeque<Frame>,
    }

    impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
        fn new(stream: S) -> Self {
            Self {
                stream,
                codec: FrameAdapter::new(0),
                received: VecDeque::new(),
            }
        }

        async fn send(&mut self, frame: Frame) {
            self.stream.write_all(&frame.to_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Frame> {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(frame) = self.received.pop_front() {
                    return Some(frame);
                }
                let n = self.stream.read(&mut buf).await.ok()?;
                if n == 0 {
                    return None;
                }
                self.codec.decode(&buf[..n]).unwrap();
                self.received.extend(self.codec.take_incoming());
            }
        }

        async fn recv_timeout(&mut self) -> Option<Frame> {
            timeout(Duration::from_secs(5), self.recv()).await.unwrap()
        }
    }

    fn server_with(dispatcher: Arc<dyn Dispatcher>) -> Arc<Server> {
        Arc::new(Server::new(
            ServerConfig::default(),
            Arc::new(AdapterRegistry::new()),
            Arc::new(SettingsHandle::default()),
            dispatcher,
        ))
    }

    fn spawn_connection(
        server: &Arc<Server>,
    ) -> (Client<DuplexStream>, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = server.clone();
        let task = tokio::spawn(async move { server.run_connection(server_io, peer()).await });
        (Client::new(client_io), task)
    }

    #[tokio::test]
    async fn test_handshake_then_pull_transfer() {
        let dispatcher = Arc::new(ImageDispatcher::with_image());
        let server = server_with(dispatcher.clone());
        let (mut client, task) = spawn_connection(&server);

        client.send(Frame::Version(CURRENT_VERSION)).await;
        assert_eq!(client.recv_timeout().await, Some(Frame::SessionId(1)));

        let mut assembler = TransferAssembler::new();
        let mut emissions = 0;
        let payload = loop {
            client.send(Frame::TransferSync(SyncTarget::Any)).await;
            let frame = client.recv_timeout().await.unwrap();
            emissions += 1;
            if let Assembly::Complete {
                transfer_id,
                payload,
            } = assembler.on_frame(&frame).unwrap()
            {
                assert_eq!(transfer_id, IMAGE_ID);
                break payload;
            }
        };
        assert_eq!(payload, image());
        assert_eq!(emissions, 2 + image().len().div_ceil(CHUNK_SIZE));

        // Completed transfer: further syncs produce nothing
        client.send(Frame::TransferSync(SyncTarget::Transfer(IMAGE_ID))).await;
        assert!(timeout(Duration::from_millis(100), client.recv()).await.is_err());

        // Business frames still reach the dispatcher
        client.send(Frame::Nop).await;
        drop(client);
        task.await.unwrap().unwrap();

        assert_eq!(*dispatcher.frames.lock().unwrap(), vec![Frame::Nop]);
        assert_eq!(*dispatcher.closed.lock().unwrap(), vec![Some(1)]);
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_incompatible_version_closes_without_reply() {
        let dispatcher = Arc::new(ImageDispatcher::with_image());
        let server = server_with(dispatcher.clone());
        let (mut client, task) = spawn_connection(&server);

        client
            .send(Frame::Version(ProtocolVersion::new(CURRENT_VERSION.major + 1, 0, 0)))
            .await;
        assert_eq!(client.recv_timeout().await, None);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::VersionIncompatible { .. })
        ));
        assert_eq!(*dispatcher.closed.lock().unwrap(), vec![None]);
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_frames_before_version_are_never_dispatched() {
        let dispatcher = Arc::new(ImageDispatcher::with_image());
        let server = server_with(dispatcher.clone());
        let (mut client, task) = spawn_connection(&server);

        // Both frames arrive in one read; the version must not rescue it
        let mut bytes = BytesMut::new();
        Frame::Nop.encode(&mut bytes);
        Frame::Version(CURRENT_VERSION).encode(&mut bytes);
        client.stream.write_all(&bytes).await.unwrap();

        assert_eq!(client.recv_timeout().await, None);
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::UnexpectedFrame(_))
        ));
        assert!(dispatcher.frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_bytes_disconnect() {
        let server = server_with(Arc::new(LoggingDispatcher));
        let (mut client, task) = spawn_connection(&server);

        client.send(Frame::Version(CURRENT_VERSION)).await;
        assert_eq!(client.recv_timeout().await, Some(Frame::SessionId(1)));

        client.stream.write_all(&[0xAB, 0, 0, 0, 0]).await.unwrap();
        assert_eq!(client.recv_timeout().await, None);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Wire(_))
        ));
    }

    #[tokio::test]
    async fn test_external_disconnect_ends_pipeline() {
        let server = server_with(Arc::new(LoggingDispatcher));
        let (mut client, task) = spawn_connection(&server);

        client.send(Frame::Version(CURRENT_VERSION)).await;
        assert_eq!(client.recv_timeout().await, Some(Frame::SessionId(1)));

        let adapter = server.registry().get(ConnectionId(1)).unwrap();
        adapter.disconnect();

        assert_eq!(client.recv_timeout().await, None);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_times_out() {
        let server = server_with(Arc::new(LoggingDispatcher));
        let (_client, task) = spawn_connection(&server);

        task.await.unwrap().unwrap();
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_settings_snapshot_taken_at_authorization() {
        let dispatcher = Arc::new(ImageDispatcher::default());
        let server = server_with(dispatcher.clone());

        let (mut first, _first_task) = spawn_connection(&server);
        first.send(Frame::Version(CURRENT_VERSION)).await;
        assert_eq!(first.recv_timeout().await, Some(Frame::SessionId(1)));

        server.settings().swap(ServerSettings::with_credentials(HashMap::from([(
            "alice".to_string(),
            "secret".to_string(),
        )])));

        let (mut second, _second_task) = spawn_connection(&server);
        second.send(Frame::Version(CURRENT_VERSION)).await;
        assert_eq!(second.recv_timeout().await, Some(Frame::SessionId(2)));

        assert_eq!(*dispatcher.credentials_seen.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let server = server_with(Arc::new(ImageDispatcher::with_image()));
        let mut events = server.registry().subscribe();

        let listener = listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.clone().serve(listener));

        let mut clients = Vec::new();
        let mut session_ids = Vec::new();
        for _ in 0..2 {
            let mut client = Client::new(connect_tcp(addr).await.unwrap());
            client.send(Frame::Version(CURRENT_VERSION)).await;
            match client.recv_timeout().await {
                Some(Frame::SessionId(id)) => session_ids.push(id),
                other => panic!("Expected session id, got {:?}", other),
            }
            clients.push(client);
        }
        session_ids.sort_unstable();
        assert_eq!(server.sessions(), session_ids);
        assert_ne!(session_ids[0], session_ids[1]);

        // Each session pulls its own copy of the image
        for client in &mut clients {
            client.send(Frame::TransferSync(SyncTarget::Transfer(IMAGE_ID))).await;
            assert_eq!(
                client.recv_timeout().await,
                Some(Frame::TransferStart {
                    transfer_id: IMAGE_ID,
                    total_size: 25_000
                })
            );
        }

        drop(clients);

        let mut created = 0;
        let mut destroyed = 0;
        while destroyed < 2 {
            match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
                Some(AdapterEvent::Created { .. }) => created += 1,
                Some(AdapterEvent::Destroyed { .. }) => destroyed += 1,
                None => panic!("registry dropped"),
            }
        }
        assert_eq!(created, 2);
        assert!(server.sessions().is_empty());
    }
}
