//! Multiplexed connections for two-party protocols.
//!
//! A [`Connection`] carries any number of independent streams between two
//! parties. Protocols open streams via [`Connection::byte_stream`] or
//! [`Connection::stream`] and group them with [`Connection::sub_connection`],
//! so that sub-protocols running on sub-connections never see each other's
//! messages. Streams are matched across the parties by the order of creation,
//! which means both parties must create sub-connections and streams in the
//! same order.
//!
//! The transport is either a QUIC connection ([`Connection::new_quic`]) or a
//! pair of in-memory pipes ([`Connection::new_in_memory_pair`]).
use std::{
    collections::{HashMap, hash_map::Entry},
    fmt,
    future::Future,
    io::{Error, IoSlice},
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    task::{Context, Poll},
};

use pin_project_lite::pin_project;
use s2n_quic::connection::{Handle, StreamAcceptor as QuicStreamAcceptor};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf},
    select,
    sync::{mpsc, oneshot},
};
use tokio_serde::{SymmetricallyFramed, formats::SymmetricalBincode};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{Level, debug, error, event};

#[cfg(feature = "metrics")]
pub mod metrics;

#[doc(hidden)]
#[cfg(any(test, feature = "__testing"))]
pub mod testing;

/// Capacity of a single in-memory pipe in bytes.
const PIPE_CAPACITY: usize = 1 << 20;
/// Maximum frame size of serialized streams.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

type RawSend = Pin<Box<dyn AsyncWrite + Send + Sync>>;
type RawRecv = Pin<Box<dyn AsyncRead + Send + Sync>>;

/// Explicit Id provided by the user for a stream of a specific [`Connection`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Id(u64);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
enum StreamId {
    Implicit(u64),
    Explicit(u64),
}

/// Unique id of a stream: the path of sub-connection ids from the root
/// connection plus the stream id within the innermost connection.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct UniqueId {
    cids: Vec<u32>,
    id: StreamId,
}

type StreamSend = oneshot::Sender<(RawRecv, usize)>;
type StreamRecv = oneshot::Receiver<(RawRecv, usize)>;

/// Opens outgoing streams on the underlying transport.
#[derive(Clone)]
enum Opener {
    Quic(Handle),
    Memory(mpsc::UnboundedSender<DuplexStream>),
}

/// Accepts incoming streams from the underlying transport.
enum Acceptor {
    Quic(QuicStreamAcceptor),
    Memory(mpsc::UnboundedReceiver<DuplexStream>),
}

/// Matches incoming streams with the local stream requests.
///
/// [`StreamManager::start`] must be polled (usually by spawning it) for the
/// connection to make progress.
pub struct StreamManager {
    acceptor: Acceptor,
    cmd_send: mpsc::UnboundedSender<Cmd>,
    cmd_recv: mpsc::UnboundedReceiver<Cmd>,
    pending: HashMap<UniqueId, StreamSend>,
    accepted: HashMap<UniqueId, (RawRecv, usize)>,
}

/// Used to create grouped streams.
///
/// Streams created with the same [`Id`] on different sub-connections do not
/// conflict with each other.
pub struct Connection {
    cids: Vec<u32>,
    next_cid: Arc<AtomicU32>,
    opener: Opener,
    cmd: mpsc::UnboundedSender<Cmd>,
    next_implicit_id: u64,
}

pin_project! {
    /// Send part of a byte stream.
    pub struct SendStreamBytes {
        #[pin]
        inner: RawSend,
    }
}

pin_project! {
    /// Receive part of a byte stream.
    pub struct ReceiveStreamBytes {
        #[pin]
        inner: ReceiveStreamWrapper,
    }
}

/// Send part of a serialized stream.
pub type SendStream<T> = SymmetricallyFramed<
    FramedWrite<SendStreamBytes, LengthDelimitedCodec>,
    T,
    SymmetricalBincode<T>,
>;

/// Receive part of a serialized stream.
pub type ReceiveStream<T> = SymmetricallyFramed<
    FramedRead<ReceiveStreamBytes, LengthDelimitedCodec>,
    T,
    SymmetricalBincode<T>,
>;

/// Serialized view of a borrowed [`SendStreamBytes`].
pub type TempSendStream<'a, T> = SymmetricallyFramed<
    FramedWrite<&'a mut SendStreamBytes, LengthDelimitedCodec>,
    T,
    SymmetricalBincode<T>,
>;

/// Serialized view of a borrowed [`ReceiveStreamBytes`].
pub type TempReceiveStream<'a, T> = SymmetricallyFramed<
    FramedRead<&'a mut ReceiveStreamBytes, LengthDelimitedCodec>,
    T,
    SymmetricalBincode<T>,
>;

pin_project! {
    #[project = ReceiveStreamWrapperProj]
    enum ReceiveStreamWrapper {
        Channel { #[pin] stream_recv: StreamRecv },
        Stream { #[pin] recv_stream: RawRecv },
    }
}

enum Cmd {
    NewStream {
        uid: UniqueId,
        stream_return: StreamSend,
    },
    AcceptedStream {
        uid: UniqueId,
        stream: RawRecv,
        bytes_read: usize,
    },
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cmd::NewStream { uid, .. } => f.debug_struct("NewStream").field("uid", uid).finish(),
            Cmd::AcceptedStream {
                uid, bytes_read, ..
            } => f
                .debug_struct("AcceptedStream")
                .field("uid", uid)
                .field("bytes_read", bytes_read)
                .finish(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("unable to open QUIC stream")]
    OpenStream(#[source] s2n_quic::connection::Error),
    #[error("io error during stream establishment")]
    IoError(#[source] io::Error),
    #[error("StreamManager is dropped and not accepting streams")]
    StreamManagerDropped,
    #[error("remote party closed the connection")]
    RemoteClosed,
}

impl Acceptor {
    async fn accept(&mut self) -> Result<Option<RawRecv>, s2n_quic::connection::Error> {
        match self {
            Acceptor::Quic(acceptor) => Ok(acceptor
                .accept_receive_stream()
                .await?
                .map(|s| Box::pin(s) as RawRecv)),
            Acceptor::Memory(recv) => Ok(recv.recv().await.map(|s| Box::pin(s) as RawRecv)),
        }
    }
}

impl Opener {
    async fn open(&self) -> Result<RawSend, ConnectionError> {
        match self {
            Opener::Quic(handle) => {
                let mut handle = handle.clone();
                let stream = handle
                    .open_send_stream()
                    .await
                    .map_err(ConnectionError::OpenStream)?;
                Ok(Box::pin(stream))
            }
            Opener::Memory(remote) => {
                let (local, peer) = io::duplex(PIPE_CAPACITY);
                remote
                    .send(peer)
                    .map_err(|_| ConnectionError::RemoteClosed)?;
                Ok(Box::pin(local))
            }
        }
    }
}

impl StreamManager {
    fn new(acceptor: Acceptor) -> Self {
        let (cmd_send, cmd_recv) = mpsc::unbounded_channel();
        Self {
            acceptor,
            cmd_send,
            cmd_recv,
            pending: Default::default(),
            accepted: Default::default(),
        }
    }

    /// Accept streams until the remote closes the connection.
    #[tracing::instrument(skip_all)]
    pub async fn start(mut self) {
        loop {
            select! {
                res = self.acceptor.accept() => {
                    match res {
                        Ok(Some(stream)) => {
                            debug!("accepted stream");
                            tokio::spawn(read_header(stream, self.cmd_send.clone()));
                        }
                        Ok(None) => {
                            debug!("remote closed");
                            return;
                        }
                        Err(err) => {
                            error!(%err, "unable to accept stream");
                            return;
                        }
                    }
                }
                Some(cmd) = self.cmd_recv.recv() => {
                    debug!(?cmd, "received cmd");
                    self.handle_cmd(cmd);
                }
            }
        }
    }

    fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::NewStream { uid, stream_return } => {
                if let Some(accepted) = self.accepted.remove(&uid) {
                    if stream_return.send(accepted).is_err() {
                        debug!("accepted remote stream but local receiver is closed");
                    }
                    return;
                }
                match self.pending.entry(uid) {
                    Entry::Occupied(occupied) => {
                        panic!("Duplicate unique id: {:?}", occupied.key())
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(stream_return);
                    }
                }
            }
            Cmd::AcceptedStream {
                uid,
                stream,
                bytes_read,
            } => {
                if let Some(stream_ret) = self.pending.remove(&uid) {
                    if stream_ret.send((stream, bytes_read)).is_err() {
                        debug!("accepted remote stream but local receiver is closed");
                    }
                } else {
                    self.accepted.insert(uid, (stream, bytes_read));
                }
            }
        }
    }
}

/// Read the [`UniqueId`] header of a newly accepted stream and hand the stream
/// to the [`StreamManager`].
async fn read_header(mut stream: RawRecv, cmd_send: mpsc::UnboundedSender<Cmd>) {
    let mut len = [0; 2];
    if let Err(err) = stream.read_exact(&mut len).await {
        error!(%err, "reading unique id size");
        return;
    }
    let mut buf = vec![0; u16::from_be_bytes(len) as usize];
    if let Err(err) = stream.read_exact(&mut buf).await {
        error!(%err, "reading unique id");
        return;
    }
    let uid = match UniqueId::from_bytes(&buf) {
        Ok(uid) => uid,
        Err(err) => {
            error!(%err, "parsing unique id");
            return;
        }
    };
    let cmd = Cmd::AcceptedStream {
        uid,
        stream,
        bytes_read: 2 + buf.len(),
    };
    if cmd_send.send(cmd).is_err() {
        debug!("StreamManager dropped before stream was accepted");
    }
}

impl Connection {
    /// Create a connection over an established QUIC connection. The returned
    /// [`StreamManager`] must be spawned.
    pub fn new_quic(quic_conn: s2n_quic::Connection) -> (Self, StreamManager) {
        let (handle, acceptor) = quic_conn.split();
        Self::with_transport(Opener::Quic(handle), Acceptor::Quic(acceptor))
    }

    /// Create two connected parties communicating over in-memory pipes. Both
    /// returned [`StreamManager`]s must be spawned.
    pub fn new_in_memory_pair() -> ((Self, StreamManager), (Self, StreamManager)) {
        let (to_b, from_a) = mpsc::unbounded_channel();
        let (to_a, from_b) = mpsc::unbounded_channel();
        (
            Self::with_transport(Opener::Memory(to_b), Acceptor::Memory(from_b)),
            Self::with_transport(Opener::Memory(to_a), Acceptor::Memory(from_a)),
        )
    }

    fn with_transport(opener: Opener, acceptor: Acceptor) -> (Self, StreamManager) {
        let stream_manager = StreamManager::new(acceptor);
        let conn = Self {
            cids: vec![],
            next_cid: Arc::new(AtomicU32::new(0)),
            opener,
            cmd: stream_manager.cmd_send.clone(),
            next_implicit_id: 0,
        };
        (conn, stream_manager)
    }

    /// Create a sub-connection. The n'th call to `sub_connection` is paired
    /// with the n'th call on the [`Connection`] of the other party. This is a
    /// fast synchronous operation without communication.
    #[tracing::instrument(level = Level::DEBUG, skip(self), fields(cids = ?self.cids))]
    pub fn sub_connection(&mut self) -> Self {
        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);
        let mut cids = self.cids.clone();
        cids.push(cid);
        Self {
            cids,
            next_cid: Arc::new(AtomicU32::new(0)),
            opener: self.opener.clone(),
            cmd: self.cmd.clone(),
            next_implicit_id: 0,
        }
    }

    async fn internal_byte_stream(
        &mut self,
        stream_id: StreamId,
    ) -> Result<(SendStreamBytes, ReceiveStreamBytes), ConnectionError> {
        let uid = UniqueId {
            cids: self.cids.clone(),
            id: stream_id,
        };
        let mut snd = self.opener.open().await?;
        let uid_bytes = uid.to_bytes();
        snd.write_all(&(uid_bytes.len() as u16).to_be_bytes())
            .await
            .map_err(ConnectionError::IoError)?;
        snd.write_all(&uid_bytes)
            .await
            .map_err(ConnectionError::IoError)?;
        event!(target: "silentot_metrics", Level::TRACE, bytes_written = 2 + uid_bytes.len());
        let (stream_return, stream_recv) = oneshot::channel();
        self.cmd
            .send(Cmd::NewStream { uid, stream_return })
            .map_err(|_| ConnectionError::StreamManagerDropped)?;
        Ok((
            SendStreamBytes { inner: snd },
            ReceiveStreamBytes {
                inner: ReceiveStreamWrapper::Channel { stream_recv },
            },
        ))
    }

    /// Establish a byte stream over this connection.
    pub async fn byte_stream(
        &mut self,
    ) -> Result<(SendStreamBytes, ReceiveStreamBytes), ConnectionError> {
        self.next_implicit_id += 1;
        self.internal_byte_stream(StreamId::Implicit(self.next_implicit_id - 1))
            .await
    }

    /// Establish a byte stream over this connection with the provided Id.
    pub async fn byte_stream_with_id(
        &mut self,
        id: Id,
    ) -> Result<(SendStreamBytes, ReceiveStreamBytes), ConnectionError> {
        self.internal_byte_stream(StreamId::Explicit(id.0)).await
    }

    async fn internal_stream<T: Serialize, S: DeserializeOwned>(
        &mut self,
        id: StreamId,
    ) -> Result<(SendStream<T>, ReceiveStream<S>), ConnectionError> {
        let (send_bytes, recv_bytes) = self.internal_byte_stream(id).await?;
        let ld_codec = length_delimited();
        let framed_send = ld_codec.new_write(send_bytes);
        let framed_read = ld_codec.new_read(recv_bytes);
        Ok((
            SymmetricallyFramed::new(framed_send, SymmetricalBincode::default()),
            SymmetricallyFramed::new(framed_read, SymmetricalBincode::default()),
        ))
    }

    /// Establish a typed stream over this connection.
    pub async fn stream<T: Serialize + DeserializeOwned>(
        &mut self,
    ) -> Result<(SendStream<T>, ReceiveStream<T>), ConnectionError> {
        self.next_implicit_id += 1;
        self.internal_stream(StreamId::Implicit(self.next_implicit_id - 1))
            .await
    }

    /// Establish a typed stream over this connection with the provided Id.
    pub async fn stream_with_id<T: Serialize + DeserializeOwned>(
        &mut self,
        id: Id,
    ) -> Result<(SendStream<T>, ReceiveStream<T>), ConnectionError> {
        self.internal_stream(StreamId::Explicit(id.0)).await
    }

    /// Establish a stream with differing types for sent and received messages.
    pub async fn request_response_stream<T: Serialize, S: DeserializeOwned>(
        &mut self,
    ) -> Result<(SendStream<T>, ReceiveStream<S>), ConnectionError> {
        self.next_implicit_id += 1;
        self.internal_stream(StreamId::Implicit(self.next_implicit_id - 1))
            .await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transport = match self.opener {
            Opener::Quic(_) => "quic",
            Opener::Memory(_) => "memory",
        };
        f.debug_struct("Connection")
            .field("cids", &self.cids)
            .field("transport", &transport)
            .field("next_implicit_id", &self.next_implicit_id)
            .finish()
    }
}

fn length_delimited() -> tokio_util::codec::length_delimited::Builder {
    let mut ld_codec = LengthDelimitedCodec::builder();
    ld_codec.max_frame_length(MAX_FRAME_LEN);
    ld_codec
}

impl Id {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl StreamId {
    const SERIALIZED_SIZE: usize = 9;

    fn from_bytes(bytes: [u8; Self::SERIALIZED_SIZE]) -> Self {
        let mut id = [0; 8];
        id.copy_from_slice(&bytes[1..]);
        let id = u64::from_be_bytes(id);
        match bytes[0] {
            0 => Self::Explicit(id),
            _ => Self::Implicit(id),
        }
    }

    fn to_bytes(self) -> [u8; Self::SERIALIZED_SIZE] {
        let mut ret = [0; Self::SERIALIZED_SIZE];
        let id = match self {
            Self::Explicit(id) => id,
            Self::Implicit(id) => {
                ret[0] = 1;
                id
            }
        };
        ret[1..].copy_from_slice(&id.to_be_bytes());
        ret
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ParseUniqueIdError {
    #[error("insufficient data to parse UniqueId")]
    InsufficientData,
    #[error("unused remaining data. Remaining bytes: {0}")]
    RemainingData(usize),
}

impl UniqueId {
    fn from_bytes(bytes: &[u8]) -> Result<Self, ParseUniqueIdError> {
        let Some((id, rest)) = bytes.split_first_chunk::<{ StreamId::SERIALIZED_SIZE }>() else {
            return Err(ParseUniqueIdError::InsufficientData);
        };
        let mut chunks = rest.chunks_exact(4);
        let cids = chunks
            .by_ref()
            .map(|chunk| {
                let mut cid = [0; 4];
                cid.copy_from_slice(chunk);
                u32::from_be_bytes(cid)
            })
            .collect();
        if !chunks.remainder().is_empty() {
            return Err(ParseUniqueIdError::RemainingData(chunks.remainder().len()));
        }
        Ok(Self {
            cids,
            id: StreamId::from_bytes(*id),
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(StreamId::SERIALIZED_SIZE + self.cids.len() * 4);
        ret.extend_from_slice(&self.id.to_bytes());
        for cid in &self.cids {
            ret.extend_from_slice(&cid.to_be_bytes());
        }
        ret
    }
}

impl SendStreamBytes {
    /// Temporarily use this byte stream as a serialized stream.
    pub fn as_stream<T: Serialize>(&mut self) -> TempSendStream<'_, T> {
        let framed_send = length_delimited().new_write(self);
        SymmetricallyFramed::new(framed_send, SymmetricalBincode::default())
    }
}

impl AsyncWrite for SendStreamBytes {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, Error>> {
        trace_poll(self.project().inner.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<Result<usize, Error>> {
        trace_poll(self.project().inner.poll_write_vectored(cx, bufs))
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

fn trace_poll(p: Poll<io::Result<usize>>) -> Poll<io::Result<usize>> {
    if let Poll::Ready(Ok(bytes)) = p {
        event!(target: "silentot_metrics", Level::TRACE, bytes_written = bytes);
    }
    p
}

impl ReceiveStreamBytes {
    /// Temporarily use this byte stream as a serialized stream.
    ///
    /// The returned stream buffers reads. Frames that were read into its
    /// buffer but not yet returned are lost when it is dropped, so the peer
    /// must not send ahead of what is consumed through a single instance.
    pub fn as_stream<T: DeserializeOwned>(&mut self) -> TempReceiveStream<'_, T> {
        let framed_read = length_delimited().new_read(self);
        SymmetricallyFramed::new(framed_read, SymmetricalBincode::default())
    }
}

// The remote stream is only known once the StreamManager matched it, so the
// first reads poll the oneshot channel and then switch to the stream.
impl AsyncRead for ReceiveStreamBytes {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let mut this = self.as_mut().project();
        match this.inner.as_mut().project() {
            ReceiveStreamWrapperProj::Channel { stream_recv } => match stream_recv.poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok((recv_stream, bytes_read))) => {
                    // the header was read by the StreamManager, account for it
                    // in the span of the reader
                    event!(target: "silentot_metrics", Level::TRACE, bytes_read);
                    this.inner.set(ReceiveStreamWrapper::Stream { recv_stream });
                    self.poll_read(cx, buf)
                }
                Poll::Ready(Err(err)) => Poll::Ready(Err(std::io::Error::other(err))),
            },
            ReceiveStreamWrapperProj::Stream { recv_stream } => {
                let len = buf.filled().len();
                let poll = recv_stream.poll_read(cx, buf);
                if let Poll::Ready(Ok(())) = poll {
                    let bytes = buf.filled().len() - len;
                    if bytes > 0 {
                        event!(target: "silentot_metrics", Level::TRACE, bytes_read = bytes);
                    }
                }
                poll
            }
        }
    }
}
