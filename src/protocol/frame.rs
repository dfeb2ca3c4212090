//! Frames: a header plus an opaque body.
//!
//! [`Message`] is the transport's atomic unit. Uses `bytes::Bytes` for the
//! body so a frame can be handed between the reader task, per-call channels
//! and consumers without copying.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::wire_format::{Header, HEADER_SIZE};
use crate::error::{Error, Result};

/// A complete protocol frame: one header and `header.size` body bytes.
#[derive(Debug, Default, Clone)]
pub struct Message {
    /// Frame header.
    pub header: Header,
    /// Opaque body bytes.
    pub body: Bytes,
}

impl Message {
    /// Create a new message from a header and body.
    pub fn new(header: Header, body: Bytes) -> Self {
        Self { header, body }
    }

    /// Read one message from `r`.
    ///
    /// Returns [`Error::Eof`] on a clean end of stream at a frame boundary.
    /// A short read inside the header or body is an I/O error
    /// (`UnexpectedEof`).
    pub async fn read<R>(r: &mut R) -> Result<Message>
    where
        R: AsyncRead + Unpin,
    {
        let header = read_header(r).await?;
        let mut body = vec![0u8; header.size as usize];
        r.read_exact(&mut body).await?;
        Ok(Message {
            header,
            body: Bytes::from(body),
        })
    }

    /// Write this message to `w` and flush.
    ///
    /// The header's `size` field on the wire is always taken from the
    /// actual body length; whatever the caller stored there is ignored.
    pub async fn write<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut header = self.header;
        header.size = self.body.len() as u32;
        w.write_all(&header.encode()).await?;
        w.write_all(&self.body).await?;
        w.flush().await?;
        Ok(())
    }
}

/// Read a full header, distinguishing clean EOF from a short read.
async fn read_header<R>(r: &mut R) -> Result<Header>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Err(Error::Eof);
            }
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }
    // The buffer is exactly HEADER_SIZE bytes.
    Ok(Header::decode(&buf).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::status;
    use std::io::Cursor;

    async fn roundtrip(msg: &Message) -> Message {
        let mut buf = Cursor::new(Vec::new());
        msg.write(&mut buf).await.unwrap();
        let mut cursor = Cursor::new(buf.into_inner());
        Message::read(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let msg = Message::new(
            Header::new(42, 3, status::CONTINUE),
            Bytes::from_static(b"hello"),
        );
        let read = roundtrip(&msg).await;
        assert_eq!(read.header.id, 42);
        assert_eq!(read.header.version, 3);
        assert_eq!(read.header.status, status::CONTINUE);
        assert_eq!(read.header.size, 5);
        assert_eq!(&read.body[..], b"hello");
    }

    #[tokio::test]
    async fn test_write_overwrites_size() {
        let mut msg = Message::new(Header::new(1, 1, status::OK), Bytes::from_static(b"abcd"));
        msg.header.size = 9999;
        let read = roundtrip(&msg).await;
        assert_eq!(read.header.size, 4);
        assert_eq!(&read.body[..], b"abcd");
    }

    #[tokio::test]
    async fn test_empty_body() {
        let msg = Message::new(Header::new(1, 1, status::OK), Bytes::new());
        let read = roundtrip(&msg).await;
        assert_eq!(read.header.size, 0);
        assert!(read.body.is_empty());
    }

    #[tokio::test]
    async fn test_clean_eof_at_frame_boundary() {
        let mut cursor = Cursor::new(Vec::new());
        let err = Message::read(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::Eof));
    }

    #[tokio::test]
    async fn test_short_header_is_unexpected_eof() {
        let mut cursor = Cursor::new(vec![0u8; HEADER_SIZE - 3]);
        let err = Message::read(&mut cursor).await.unwrap_err();
        match err {
            Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_short_body_is_unexpected_eof() {
        let mut header = Header::new(1, 1, status::OK);
        header.size = 10;
        let mut buf = header.encode().to_vec();
        buf.extend_from_slice(b"abc"); // 3 of 10 body bytes
        let mut cursor = Cursor::new(buf);
        let err = Message::read(&mut cursor).await.unwrap_err();
        match err {
            Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_messages_back_to_back() {
        let mut buf = Cursor::new(Vec::new());
        for i in 1u32..=3 {
            let msg = Message::new(
                Header::new(i, 1, status::CONTINUE),
                Bytes::from(format!("body-{i}")),
            );
            msg.write(&mut buf).await.unwrap();
        }
        let mut cursor = Cursor::new(buf.into_inner());
        for i in 1u32..=3 {
            let msg = Message::read(&mut cursor).await.unwrap();
            assert_eq!(msg.header.id, i);
            assert_eq!(&msg.body[..], format!("body-{i}").as_bytes());
        }
        assert!(matches!(
            Message::read(&mut cursor).await.unwrap_err(),
            Error::Eof
        ));
    }
}
