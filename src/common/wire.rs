//! Length-prefixed wire framing
//!
//! Every message on every socket is `length (4 bytes, big-endian, unsigned)
//! || payload`, where the payload is a bincode-encoded message enum. Reads
//! loop until the full frame is consumed; EOF inside a frame is a framing
//! error, EOF between frames ends the connection cleanly.

use crate::common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Read one frame. `Ok(None)` means the peer closed the connection cleanly
/// before sending another frame.
pub async fn read_frame<S>(stream: &mut S) -> Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = stream.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Framing("connection closed inside length prefix".into()));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Framing(format!("connection closed inside {}-byte frame", len))
        } else {
            Error::Io(e)
        }
    })?;
    Ok(Some(payload))
}

/// Write one frame.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Framing(format!("payload too large: {} bytes", payload.len())))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Serialize and send one message.
pub async fn send<S, T>(stream: &mut S, message: &T) -> Result<()>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message)
        .map_err(|e| Error::Internal(format!("serialize error: {}", e)))?;
    write_frame(stream, &payload).await
}

/// Receive and decode one message; `Ok(None)` on clean EOF.
pub async fn recv<S, T>(stream: &mut S) -> Result<Option<T>>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame(stream).await? {
        Some(payload) => {
            let message = bincode::deserialize(&payload)
                .map_err(|e| Error::Framing(format!("decode error: {}", e)))?;
            Ok(Some(message))
        }
        None => Ok(None),
    }
}

/// One request/response exchange against `addr`, bounded by `deadline`.
/// A timeout is reported as a failure; the caller rolls back or retries.
pub async fn call<Req, Resp>(addr: &str, request: &Req, deadline: Duration) -> Result<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let exchange = async {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", addr, e)))?;
        send(&mut stream, request).await?;
        recv(&mut stream)
            .await?
            .ok_or_else(|| Error::Framing(format!("{} closed before responding", addr)))
    };

    match tokio::time::timeout(deadline, exchange).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!("rpc to {}", addr))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        let frame = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(frame, b"hello");
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"").await.unwrap();
        let frame = read_frame(&mut b).await.unwrap().unwrap();
        assert!(frame.is_empty());
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_framing_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Announce 100 bytes but deliver only 3.
        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        match read_frame(&mut b).await {
            Err(Error::Framing(_)) => {}
            other => panic!("expected framing error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_message_round_trip() {
        use crate::common::message::{CoordRequest, Location};

        let (mut a, mut b) = tokio::io::duplex(1024);
        let req = CoordRequest::RegisterClient {
            id: "cli-1".into(),
            location: Location::new(5.0, 5.0),
        };
        send(&mut a, &req).await.unwrap();
        let got: CoordRequest = recv(&mut b).await.unwrap().unwrap();
        match got {
            CoordRequest::RegisterClient { id, location } => {
                assert_eq!(id, "cli-1");
                assert_eq!(location.x, 5.0);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
