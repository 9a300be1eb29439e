//! Length-framed records over any reliable byte stream.
//!
//! A record is `[4-byte big-endian length n][n bytes of data]`. Everything
//! above this layer (handshake messages, encrypted frames, control records)
//! is one record on the wire.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single record. Anything larger is a framing error, not
/// a resize hint.
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Read one length-prefixed record.
///
/// Returns `UnexpectedEof` if the stream ends mid-record and `InvalidData`
/// for an oversized length prefix.
pub async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_RECORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("record length {len} exceeds {MAX_RECORD_LEN}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

/// Write one length-prefixed record, fully or not at all.
pub async fn write_record<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("record length {} exceeds {MAX_RECORD_LEN}", data.len()),
        ));
    }

    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_record(&mut a, b"hello").await.unwrap();
        write_record(&mut a, b"").await.unwrap();

        assert_eq!(read_record(&mut b).await.unwrap(), b"hello");
        assert_eq!(read_record(&mut b).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);

        // Length prefix claiming 4 GiB - 1.
        tokio::io::AsyncWriteExt::write_all(&mut a, &u32::MAX.to_be_bytes())
            .await
            .unwrap();

        let err = read_record(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_record_is_eof() {
        let (mut a, mut b) = tokio::io::duplex(64);

        tokio::io::AsyncWriteExt::write_all(&mut a, &8u32.to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, b"hal")
            .await
            .unwrap();
        drop(a);

        let err = read_record(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
