//! # Transport Layer
//!
//! Async TCP transport carrying framed messages. A connection is split into
//! a reader driven by the protocol task and a writer task fed through an
//! unbounded channel, so state handlers queue replies without awaiting the
//! socket.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{encode_frame, FrameDecoder};

/// Default read buffer size
const READ_BUFFER_SIZE: usize = 8192;

/// Write timeout
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Queue of outbound payloads, drained by the writer task
pub type Outbound = mpsc::UnboundedSender<Bytes>;

/// Transport connection wrapping a TCP stream
pub struct Transport {
    stream: TcpStream,
    decoder: FrameDecoder,
    read_buffer: Vec<u8>,
    peer_addr: SocketAddr,
    read_timeout: Option<Duration>,
}

impl Transport {
    /// Create a transport from an existing TCP stream
    pub fn new(stream: TcpStream) -> ProtocolResult<Self> {
        let peer_addr = stream.peer_addr()?;

        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            read_buffer: vec![0u8; READ_BUFFER_SIZE],
            peer_addr,
            read_timeout: None,
        })
    }

    /// Connect to a remote address
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> ProtocolResult<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(connect_timeout.as_secs()))?
            .map_err(ProtocolError::IoError)?;

        stream.set_nodelay(true)?;

        Self::new(stream)
    }

    /// Fail reads that wait longer than `read_timeout`
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Get the peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send one payload as a frame
    pub async fn send(&mut self, payload: Bytes) -> ProtocolResult<()> {
        write_frame(&mut self.stream, payload).await
    }

    /// Receive the next frame's payload
    pub async fn recv(&mut self) -> ProtocolResult<Bytes> {
        read_frame(
            &mut self.stream,
            &mut self.decoder,
            &mut self.read_buffer,
            self.read_timeout,
        )
        .await
    }

    /// Split into read and write halves
    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            TransportReader {
                stream: read_half,
                decoder: self.decoder,
                read_buffer: self.read_buffer,
                read_timeout: self.read_timeout,
            },
            TransportWriter { stream: write_half },
        )
    }
}

async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    decoder: &mut FrameDecoder,
    read_buffer: &mut [u8],
    read_timeout: Option<Duration>,
) -> ProtocolResult<Bytes> {
    loop {
        if let Some(message) = decoder.decode()? {
            return Ok(message);
        }

        let n = match read_timeout {
            Some(limit) => timeout(limit, stream.read(read_buffer))
                .await
                .map_err(|_| ProtocolError::Timeout(limit.as_secs()))?,
            None => stream.read(read_buffer).await,
        }
        .map_err(ProtocolError::IoError)?;

        if n == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }

        decoder.push(&read_buffer[..n]);
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, payload: Bytes) -> ProtocolResult<()> {
    let bytes = encode_frame(&payload)?;

    timeout(WRITE_TIMEOUT, stream.write_all(&bytes))
        .await
        .map_err(|_| ProtocolError::Timeout(WRITE_TIMEOUT.as_secs()))?
        .map_err(ProtocolError::IoError)
}

/// Read half of a split transport
pub struct TransportReader {
    stream: OwnedReadHalf,
    decoder: FrameDecoder,
    read_buffer: Vec<u8>,
    read_timeout: Option<Duration>,
}

impl TransportReader {
    /// Receive the next frame's payload
    pub async fn recv(&mut self) -> ProtocolResult<Bytes> {
        read_frame(
            &mut self.stream,
            &mut self.decoder,
            &mut self.read_buffer,
            self.read_timeout,
        )
        .await
    }
}

/// Write half of a split transport
pub struct TransportWriter {
    stream: OwnedWriteHalf,
}

impl TransportWriter {
    /// Send one payload as a frame
    pub async fn send(&mut self, payload: Bytes) -> ProtocolResult<()> {
        write_frame(&mut self.stream, payload).await
    }

    /// Close the write direction
    pub async fn shutdown(&mut self) -> ProtocolResult<()> {
        self.stream.shutdown().await.map_err(ProtocolError::IoError)
    }

    /// Drain `outbound` into the socket until every sender is gone
    ///
    /// Payloads go out in the order they were queued.
    pub fn spawn(mut self) -> (Outbound, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let handle = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if let Err(e) = self.send(payload).await {
                    tracing::warn!("Write failed: {}", e);
                    break;
                }
            }
            let _ = self.shutdown().await;
        });
        (tx, handle)
    }
}

/// TCP listener wrapper
pub struct TransportListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TransportListener {
    /// Bind to an address
    pub async fn bind(addr: SocketAddr) -> ProtocolResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Get the local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept a new connection
    pub async fn accept(&self) -> ProtocolResult<(Transport, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let transport = Transport::new(stream)?;
        Ok((transport, addr))
    }
}
