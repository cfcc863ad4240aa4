//! Docker multiplexed stream framing.
//!
//! Every frame is an 8-byte header followed by the payload:
//!
//! ```text
//! [stream:1][0,0,0][length: u32 big-endian][payload: length bytes]
//! ```
//!
//! Stream tags are 0 (stdin), 1 (stdout) and 2 (stderr). The codec never
//! interprets payload bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::StreamExt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, FramedRead};

/// Length of a frame header.
pub const HEADER_LEN: usize = 8;

/// Content type for non-TTY (framed) streams.
pub const RAW_STREAM_CONTENT_TYPE: &str = "application/vnd.docker.raw-stream";

/// Alternative content type accepted for framed streams.
pub const MULTIPLEXED_STREAM_CONTENT_TYPE: &str = "application/vnd.docker.multiplexed-stream";

/// Stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamKind {
    /// Standard input.
    Stdin = 0,
    /// Standard output.
    Stdout = 1,
    /// Standard error.
    Stderr = 2,
}

impl StreamKind {
    /// Maps a header tag to a stream, if known.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }

    /// The header tag byte.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

/// One decoded frame.
///
/// The raw tag is kept so unknown tags survive decoding; [`demux`] drops them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw stream tag from byte 0 of the header.
    pub tag: u8,
    /// Frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a frame for a known stream.
    #[must_use]
    pub fn new(stream: StreamKind, payload: impl Into<Bytes>) -> Self {
        Self {
            tag: stream.tag(),
            payload: payload.into(),
        }
    }

    /// The stream this frame belongs to, if the tag is known.
    #[must_use]
    pub const fn stream(&self) -> Option<StreamKind> {
        StreamKind::from_tag(self.tag)
    }
}

/// Encodes one frame into a contiguous buffer.
///
/// Payloads longer than `u32::MAX` are truncated to the header limit.
#[must_use]
pub fn encode_frame(stream: StreamKind, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    put_frame(&mut buf, stream.tag(), payload);
    buf.freeze()
}

fn put_frame(buf: &mut BytesMut, tag: u8, payload: &[u8]) {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    buf.reserve(HEADER_LEN + len as usize);
    buf.put_u8(tag);
    buf.put_slice(&[0, 0, 0]);
    buf.put_u32(len);
    buf.put_slice(&payload[..len as usize]);
}

/// `tokio_util` codec for the multiplex format.
#[derive(Debug, Default, Clone, Copy)]
pub struct MuxCodec;

impl Decoder for MuxCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        let tag = src[0];
        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { tag, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("truncated frame: {} trailing bytes", src.len()),
            )),
        }
    }
}

impl Encoder<Frame> for MuxCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> io::Result<()> {
        if frame.payload.len() > u32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame payload exceeds u32 length",
            ));
        }
        put_frame(dst, frame.tag, &frame.payload);
        Ok(())
    }
}

/// Reads frames one at a time from a byte source.
pub struct FrameReader<R> {
    inner: FramedRead<R, MuxCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps a reader.
    pub fn new(reader: R) -> Self {
        Self {
            inner: FramedRead::new(reader, MuxCodec),
        }
    }

    /// Reads the next frame. `Ok(None)` is a clean end on a header boundary.
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedEof` when the source ends inside a frame.
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        self.inner.next().await.transpose()
    }
}

/// Splits a framed stream into stdout and stderr sinks.
///
/// Stdin frames and unknown tags are dropped. Returns the number of payload
/// bytes written to each sink.
///
/// # Errors
///
/// Returns an error if the source is truncated or a sink write fails.
pub async fn demux<R, O, E>(reader: R, stdout: &mut O, stderr: &mut E) -> io::Result<(u64, u64)>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut frames = FrameReader::new(reader);
    let (mut out, mut err) = (0u64, 0u64);
    while let Some(frame) = frames.next_frame().await? {
        match frame.stream() {
            Some(StreamKind::Stdout) => {
                stdout.write_all(&frame.payload).await?;
                out += frame.payload.len() as u64;
            }
            Some(StreamKind::Stderr) => {
                stderr.write_all(&frame.payload).await?;
                err += frame.payload.len() as u64;
            }
            _ => {}
        }
    }
    stdout.flush().await?;
    stderr.flush().await?;
    Ok((out, err))
}

/// Sending half of a response stream.
///
/// Frames and raw chunks are pushed as whole messages, so concurrent writers
/// sharing one sink never interleave inside a frame.
pub type OutputSink = mpsc::UnboundedSender<Bytes>;

/// Creates a connected sink and receiver for a response stream.
#[must_use]
pub fn output_channel() -> (OutputSink, mpsc::UnboundedReceiver<Bytes>) {
    mpsc::unbounded_channel()
}

/// `AsyncWrite` that frames every write for a fixed stream.
///
/// Zero-length writes are no-ops and emit nothing.
#[derive(Debug, Clone)]
pub struct FrameWriter {
    sink: OutputSink,
    stream: StreamKind,
}

impl FrameWriter {
    /// Creates a writer tagging every frame with `stream`.
    #[must_use]
    pub const fn new(sink: OutputSink, stream: StreamKind) -> Self {
        Self { sink, stream }
    }

    /// The stream this writer is keyed to.
    #[must_use]
    pub const fn stream(&self) -> StreamKind {
        self.stream
    }
}

impl AsyncWrite for FrameWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let chunk = &buf[..buf.len().min(u32::MAX as usize)];
        Poll::Ready(
            self.sink
                .send(encode_frame(self.stream, chunk))
                .map(|()| chunk.len())
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe)),
        )
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// `AsyncWrite` that forwards bytes unframed, for TTY streams.
#[derive(Debug, Clone)]
pub struct RawWriter {
    sink: OutputSink,
}

impl RawWriter {
    /// Creates a raw writer.
    #[must_use]
    pub const fn new(sink: OutputSink) -> Self {
        Self { sink }
    }
}

impl AsyncWrite for RawWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        Poll::Ready(
            self.sink
                .send(Bytes::copy_from_slice(buf))
                .map(|()| buf.len())
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe)),
        )
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
