use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Align4, Deserialize, LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN, frame_too_large};

/// The receiving end handle of the communication.
pub struct WireReceiver<R: AsyncRead + Unpin> {
    rx: R,
}

impl<R: AsyncRead + Unpin> WireReceiver<R> {
    /// Creates a new `WireReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self { rx }
    }

    /// Waits for the next frame and parses it.
    ///
    /// # Arguments
    /// * `buf` - The buffer the frame body is read into, the returned `T` borrows from
    ///   it. Its element type keeps tensor payloads aligned for `f32` views.
    ///
    /// # Returns
    /// The parsed message, or an `io::Error` on end of file, on a frame larger than
    /// `MAX_FRAME_LEN` or on a malformed body.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align4,
    {
        let mut header = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut header).await?;

        let len = usize::try_from(LenType::from_be_bytes(header)).unwrap_or(usize::MAX);
        if len > MAX_FRAME_LEN {
            return Err(frame_too_large(len));
        }

        buf.clear();
        buf.resize(len.div_ceil(size_of::<B>()), B::zeroed());

        let body: &'buf mut [u8] = bytemuck::cast_slice_mut(buf.as_mut_slice());
        self.rx.read_exact(&mut body[..len]).await?;

        let body: &'buf [u8] = body;
        T::deserialize(&body[..len])
    }
}
