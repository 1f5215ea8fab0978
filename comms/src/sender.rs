//! The sending end of the framing: a big endian length header followed by the body.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN, Serialize, frame_too_large};

/// The sending end handle of the communication.
pub struct WireSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    head: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> WireSender<W> {
    /// Creates a new `WireSender` instance.
    ///
    /// # Arguments
    /// * `tx` - The underlying writer.
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            head: Vec::new(),
        }
    }

    /// Sends `msg` as a single frame.
    ///
    /// The serialized head is buffered, the tensor tail is written straight from the
    /// caller's memory.
    ///
    /// # Arguments
    /// * `msg` - A serializable object.
    ///
    /// # Returns
    /// An `io::Error` if writing fails or the frame is larger than `MAX_FRAME_LEN`.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self { head, tx } = self;

        head.clear();
        head.resize(LEN_TYPE_SIZE, 0);

        let tail = msg.serialize(head)?;
        let len = head.len() - LEN_TYPE_SIZE + tail.map_or(0, <[u8]>::len);
        if len > MAX_FRAME_LEN {
            return Err(frame_too_large(len));
        }

        head[..LEN_TYPE_SIZE].copy_from_slice(&(len as LenType).to_be_bytes());
        tx.write_all(head).await?;

        if let Some(tail) = tail {
            tx.write_all(tail).await?;
        }

        tx.flush().await
    }
}
