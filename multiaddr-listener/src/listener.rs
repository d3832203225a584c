//! Socket-style listener over libp2p streams
//!
//! A [`Listener`] registers one protocol on a [`crate::Host`] and hands out
//! every inbound stream for it as a [`P2pStream`], which reads and writes like
//! a TCP connection. HTTP servers can therefore run on a host unchanged.

use futures_util::StreamExt;

/// Protocol id HTTP is served under
pub const HTTP_PROTOCOL: libp2p::StreamProtocol = libp2p::StreamProtocol::new("/http/1.1");

/// The accept/close/address surface HTTP servers expect from a listener
#[async_trait::async_trait]
pub trait StreamListener: Send + Sync {
    type Stream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static;
    type Addr: std::fmt::Display + Send;

    /// Wait for the next inbound connection
    async fn accept(&self) -> Result<Self::Stream, crate::ListenerError>;

    /// Stop accepting; pending and later `accept` calls fail with [`crate::ListenerError::Closed`]
    fn close(&self);

    fn local_addr(&self) -> Self::Addr;
}

/// Address of a [`Listener`]: the host's peer id and the protocol it accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerAddr {
    pub peer_id: libp2p::PeerId,
    pub protocol: libp2p::StreamProtocol,
}

impl std::fmt::Display for ListenerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/p2p/{}{}", self.peer_id, self.protocol)
    }
}

/// Accepts inbound streams of one protocol on a host.
///
/// Closing the listener leaves the host running; hosts are torn down by the
/// app that built them.
pub struct Listener {
    host: crate::Host,
    protocol: libp2p::StreamProtocol,
    incoming: tokio::sync::Mutex<Option<libp2p_stream::IncomingStreams>>,
    closed: tokio_util::sync::CancellationToken,
    ignore_eof: bool,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("peer_id", &self.host.peer_id())
            .field("protocol", &self.protocol)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl Listener {
    /// Start accepting `protocol` on `host`
    pub fn new(
        host: &crate::Host,
        protocol: libp2p::StreamProtocol,
    ) -> Result<Self, crate::ListenerError> {
        let incoming = host
            .stream_control()
            .accept(protocol.clone())
            .map_err(|_| crate::ListenerError::AlreadyRegistered {
                protocol: protocol.clone(),
            })?;

        tracing::debug!("Accepting {protocol} on {}", host.peer_id());

        Ok(Self {
            host: host.clone(),
            protocol,
            incoming: tokio::sync::Mutex::new(Some(incoming)),
            closed: tokio_util::sync::CancellationToken::new(),
            ignore_eof: false,
        })
    }

    /// Report a peer that vanished mid-stream as a clean end of stream on
    /// every accepted stream, instead of an I/O error
    pub fn with_ignore_eof(mut self, ignore_eof: bool) -> Self {
        self.ignore_eof = ignore_eof;
        self
    }

    pub fn host(&self) -> &crate::Host {
        &self.host
    }

    pub fn protocol(&self) -> &libp2p::StreamProtocol {
        &self.protocol
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn accept(&self) -> Result<P2pStream, crate::ListenerError> {
        let mut incoming = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(crate::ListenerError::Closed),
            guard = self.incoming.lock() => guard,
        };
        let Some(streams) = incoming.as_mut() else {
            return Err(crate::ListenerError::Closed);
        };

        let next = tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            next = streams.next() => next,
        };

        match next {
            Some((remote_peer, stream)) => {
                tracing::trace!("Accepted {} stream from {remote_peer}", self.protocol);
                Ok(P2pStream {
                    inner: tokio_util::compat::FuturesAsyncReadCompatExt::compat(stream),
                    local_peer: self.host.peer_id(),
                    remote_peer,
                    protocol: self.protocol.clone(),
                    ignore_eof: self.ignore_eof,
                })
            }
            None => {
                // Dropping the receiver unregisters the protocol from the host
                *incoming = None;
                Err(crate::ListenerError::Closed)
            }
        }
    }

    /// Stop accepting. Idempotent.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        // An accept in flight holds the lock and drops the receiver itself
        if let Ok(mut incoming) = self.incoming.try_lock() {
            incoming.take();
        }
        tracing::debug!("Stopped accepting {} on {}", self.protocol, self.host.peer_id());
    }

    pub fn local_addr(&self) -> ListenerAddr {
        ListenerAddr {
            peer_id: self.host.peer_id(),
            protocol: self.protocol.clone(),
        }
    }
}

#[async_trait::async_trait]
impl StreamListener for Listener {
    type Stream = P2pStream;
    type Addr = ListenerAddr;

    async fn accept(&self) -> Result<P2pStream, crate::ListenerError> {
        Listener::accept(self).await
    }

    fn close(&self) {
        Listener::close(self)
    }

    fn local_addr(&self) -> ListenerAddr {
        Listener::local_addr(self)
    }
}

/// An accepted libp2p stream with tokio's I/O traits
pub struct P2pStream {
    inner: tokio_util::compat::Compat<libp2p::Stream>,
    local_peer: libp2p::PeerId,
    remote_peer: libp2p::PeerId,
    protocol: libp2p::StreamProtocol,
    ignore_eof: bool,
}

impl std::fmt::Debug for P2pStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2pStream")
            .field("local_peer", &self.local_peer)
            .field("remote_peer", &self.remote_peer)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl P2pStream {
    pub fn local_peer(&self) -> libp2p::PeerId {
        self.local_peer
    }

    pub fn remote_peer(&self) -> libp2p::PeerId {
        self.remote_peer
    }

    pub fn protocol(&self) -> &libp2p::StreamProtocol {
        &self.protocol
    }
}

/// Errors a stream reports once the remote peer or its connection is gone.
///
/// Yamux fails writes with `WriteZero` after a reset or a closed connection,
/// QUIC fails both directions with `ConnectionReset`, and a half-read frame
/// surfaces as `UnexpectedEof`.
fn is_peer_gone(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::WriteZero
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
    )
}

/// With `ignore_eof`, turn a peer-gone error into `closed`, the value a
/// cleanly closed stream would have produced.
fn settle<T>(
    ignore_eof: bool,
    poll: std::task::Poll<std::io::Result<T>>,
    closed: T,
) -> std::task::Poll<std::io::Result<T>> {
    match poll {
        std::task::Poll::Ready(Err(e)) if ignore_eof && is_peer_gone(e.kind()) => {
            tracing::trace!("Treating stream error as end of stream: {e}");
            std::task::Poll::Ready(Ok(closed))
        }
        other => other,
    }
}

impl tokio::io::AsyncRead for P2pStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let poll = tokio::io::AsyncRead::poll_read(std::pin::Pin::new(&mut this.inner), cx, buf);
        settle(this.ignore_eof, poll, ())
    }
}

impl tokio::io::AsyncWrite for P2pStream {
    // Bytes written after the peer left are dropped, like a write racing a close
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let poll = tokio::io::AsyncWrite::poll_write(std::pin::Pin::new(&mut this.inner), cx, buf);
        settle(this.ignore_eof, poll, buf.len())
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let poll = tokio::io::AsyncWrite::poll_flush(std::pin::Pin::new(&mut this.inner), cx);
        settle(this.ignore_eof, poll, ())
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let poll = tokio::io::AsyncWrite::poll_shutdown(std::pin::Pin::new(&mut this.inner), cx);
        settle(this.ignore_eof, poll, ())
    }
}
