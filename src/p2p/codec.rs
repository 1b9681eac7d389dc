//! Length-prefixed MessagePack codec for the replication protocol

use async_trait::async_trait;
use futures::prelude::*;
use libp2p::request_response;

use crate::replication::protocol::{ReplicationRequest, ReplicationResponse};

/// Protocol identifier negotiated on each substream.
pub const REPLICATION_PROTOCOL_ID: &str = "/tapecast/replicate/1.0.0";

/// Requests carry at most one pushed block.
const MAX_REQUEST_SIZE: usize = 16 * 1024 * 1024;
/// Responses carry up to a full `Want` batch.
const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ReplicationProtocol;

impl AsRef<str> for ReplicationProtocol {
    fn as_ref(&self) -> &str {
        REPLICATION_PROTOCOL_ID
    }
}

/// Frames are a 4-byte big-endian length followed by MessagePack.
#[derive(Debug, Clone, Default)]
pub struct ReplicationCodec;

#[async_trait]
impl request_response::Codec for ReplicationCodec {
    type Protocol = ReplicationProtocol;
    type Request = ReplicationRequest;
    type Response = ReplicationResponse;

    async fn read_request<T>(
        &mut self,
        _: &ReplicationProtocol,
        io: &mut T,
    ) -> std::io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut len_bytes = [0u8; 4];
        io.read_exact(&mut len_bytes).await?;
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > MAX_REQUEST_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Request too large",
            ));
        }

        let mut buffer = vec![0u8; len];
        io.read_exact(&mut buffer).await?;

        rmp_serde::from_slice(&buffer)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    async fn read_response<T>(
        &mut self,
        _: &ReplicationProtocol,
        io: &mut T,
    ) -> std::io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut len_bytes = [0u8; 4];
        io.read_exact(&mut len_bytes).await?;
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > MAX_RESPONSE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Response too large",
            ));
        }

        let mut buffer = vec![0u8; len];
        io.read_exact(&mut buffer).await?;

        rmp_serde::from_slice(&buffer)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    async fn write_request<T>(
        &mut self,
        _: &ReplicationProtocol,
        io: &mut T,
        request: Self::Request,
    ) -> std::io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let bytes = rmp_serde::to_vec(&request)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        io.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
        io.write_all(&bytes).await?;
        io.flush().await?;
        Ok(())
    }

    async fn write_response<T>(
        &mut self,
        _: &ReplicationProtocol,
        io: &mut T,
        response: Self::Response,
    ) -> std::io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let bytes = rmp_serde::to_vec(&response)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        io.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
        io.write_all(&bytes).await?;
        io.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;
    use libp2p::request_response::Codec;

    #[tokio::test]
    async fn test_request_frame_roundtrip() {
        let mut codec = ReplicationCodec;
        let request = ReplicationRequest::Want { start: 4, max: 64 };

        let mut buffer = Cursor::new(Vec::new());
        codec
            .write_request(&ReplicationProtocol, &mut buffer, request)
            .await
            .unwrap();

        let mut buffer = Cursor::new(buffer.into_inner());
        let decoded = codec
            .read_request(&ReplicationProtocol, &mut buffer)
            .await
            .unwrap();
        match decoded {
            ReplicationRequest::Want { start, max } => {
                assert_eq!(start, 4);
                assert_eq!(max, 64);
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[tokio::test]
    async fn test_response_frame_roundtrip() {
        let mut codec = ReplicationCodec;
        let response = ReplicationResponse::Ack { length: 12 };

        let mut buffer = Cursor::new(Vec::new());
        codec
            .write_response(&ReplicationProtocol, &mut buffer, response)
            .await
            .unwrap();

        let mut buffer = Cursor::new(buffer.into_inner());
        let decoded = codec
            .read_response(&ReplicationProtocol, &mut buffer)
            .await
            .unwrap();
        match decoded {
            ReplicationResponse::Ack { length } => assert_eq!(length, 12),
            _ => panic!("Wrong variant"),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut codec = ReplicationCodec;
        let mut buffer = Cursor::new(Vec::new());
        buffer
            .write_all(&((MAX_REQUEST_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        let mut buffer = Cursor::new(buffer.into_inner());
        let err = codec
            .read_request(&ReplicationProtocol, &mut buffer)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
