//! Length prefixed frames: a big endian `u64` byte count followed by the encoded message.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type FrameLen = u64;
const FRAME_LEN_SIZE: usize = size_of::<FrameLen>();

/// The largest frame a receiver accepts by default, 1 GiB.
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Words a receive buffer is made of. Their alignment of at least 4 bytes lets a decoded
/// message borrow its `f32` payload straight from the buffer.
pub trait FrameWord: bytemuck::Pod {}

impl FrameWord for u32 {}
impl FrameWord for u64 {}
impl FrameWord for f32 {}
impl FrameWord for f64 {}

/// Messages that can be written into a frame.
pub trait Encode<'a> {
    /// Writes the leading part of `self` into `buf`.
    ///
    /// # Returns
    /// An optional tail written right after `buf` without being copied.
    fn encode(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}

/// Messages that can be read back from a frame, borrowing from it.
pub trait Decode<'a>: Sized {
    /// Parses an instance out of `buf`, the frame without its length prefix.
    ///
    /// # Returns
    /// The message or an `io::Error` of kind `InvalidData`.
    fn decode(buf: &'a mut [u8]) -> io::Result<Self>;
}

/// Creates both ends of a framed connection.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
pub fn channel<R, W>(rx: R, tx: W) -> (FrameReceiver<R>, FrameSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (FrameReceiver::new(rx), FrameSender::new(tx))
}

/// The sending end of a framed connection.
pub struct FrameSender<W: AsyncWrite + Unpin> {
    tx: W,
    head: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    fn new(tx: W) -> Self {
        Self {
            tx,
            head: Vec::new(),
        }
    }

    /// Writes `msg` as one frame and flushes it.
    pub async fn send<'a, T: Encode<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self { tx, head } = self;

        head.clear();
        head.extend_from_slice(&[0; FRAME_LEN_SIZE]);
        let tail = msg.encode(head);

        let len = head.len() - FRAME_LEN_SIZE + tail.map_or(0, <[u8]>::len);
        head[..FRAME_LEN_SIZE].copy_from_slice(&(len as FrameLen).to_be_bytes());

        tx.write_all(head).await?;
        if let Some(tail) = tail {
            tx.write_all(tail).await?;
        }

        tx.flush().await
    }
}

/// The receiving end of a framed connection.
pub struct FrameReceiver<R: AsyncRead + Unpin> {
    rx: R,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReceiver<R> {
    fn new(rx: R) -> Self {
        Self {
            rx,
            max_len: MAX_FRAME_LEN,
        }
    }

    /// Sets the largest frame accepted, larger frames fail with `InvalidData`.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Waits for the next frame and decodes it.
    ///
    /// # Arguments
    /// * `buf` - The buffer the frame is read into, the returned message borrows from it.
    ///
    /// # Returns
    /// The message, `ConnectionAborted` if the peer closed the connection between frames, or
    /// `InvalidData` if the frame is too large or malformed.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Decode<'buf>,
        B: FrameWord,
    {
        let mut prefix = [0; FRAME_LEN_SIZE];
        if let Err(e) = self.rx.read_exact(&mut prefix).await {
            return Err(match e.kind() {
                io::ErrorKind::UnexpectedEof => {
                    io::Error::new(io::ErrorKind::ConnectionAborted, "peer closed the connection")
                }
                _ => e,
            });
        }

        let len = FrameLen::from_be_bytes(prefix) as usize;
        if len > self.max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds the limit of {} bytes", self.max_len),
            ));
        }

        buf.clear();
        buf.resize(len.div_ceil(size_of::<B>()), B::zeroed());

        let bytes: &mut [u8] = bytemuck::cast_slice_mut(buf.as_mut_slice());
        let frame = &mut bytes[..len];
        self.rx.read_exact(frame).await?;

        T::decode(frame)
    }
}
