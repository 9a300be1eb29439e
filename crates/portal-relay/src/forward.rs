//! Bidirectional relaying between a client stream and a lease stream.
//!
//! Two tasks, one per direction, both metered through the lease's bucket.
//! Each direction propagates completion by shutting down its write side,
//! which unblocks the opposite copy; both streams are torn down before
//! return.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use portal_core::limiter::{copy, TokenBucket};

/// Relay until both directions finish. Returns
/// `(client_to_lease, lease_to_client)` byte counts; errors terminate the
/// affected direction and are treated as teardown, not failures.
pub async fn relay_streams<C, L>(
    client: C,
    lease: L,
    bucket: Option<Arc<TokenBucket>>,
) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    L: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut lease_read, mut lease_write) = tokio::io::split(lease);

    let up_bucket = bucket.clone();
    let up = tokio::spawn(async move {
        let copied = copy(&mut lease_write, &mut client_read, up_bucket.as_deref()).await;
        // Half-close: the backend sees EOF and finishes its side.
        let _ = lease_write.shutdown().await;
        copied
    });

    let down = tokio::spawn(async move {
        let copied = copy(&mut client_write, &mut lease_read, bucket.as_deref()).await;
        let _ = client_write.shutdown().await;
        copied
    });

    let up_bytes = match up.await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            trace!("client-to-lease copy ended: {e}");
            0
        }
        Err(_) => 0,
    };
    let down_bytes = match down.await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            trace!("lease-to-client copy ended: {e}");
            0
        }
        Err(_) => 0,
    };

    debug!(up_bytes, down_bytes, "relay finished");
    (up_bytes, down_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn relays_both_directions_until_close() {
        let (client_near, client_far) = tokio::io::duplex(64 * 1024);
        let (lease_near, lease_far) = tokio::io::duplex(64 * 1024);

        let relay = tokio::spawn(relay_streams(client_far, lease_far, None));

        // "Backend": echo everything back uppercased.
        let backend = tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(lease_near);
            let mut collected = Vec::new();
            read.read_to_end(&mut collected).await.unwrap();
            let upper: Vec<u8> = collected.iter().map(|b| b.to_ascii_uppercase()).collect();
            write.write_all(&upper).await.unwrap();
            write.shutdown().await.unwrap();
        });

        let (mut client_read, mut client_write) = tokio::io::split(client_near);
        client_write.write_all(b"hello relay").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut response = Vec::new();
        client_read.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HELLO RELAY");

        backend.await.unwrap();
        let (up, down) = relay.await.unwrap();
        assert_eq!(up, 11);
        assert_eq!(down, 11);
    }

    #[tokio::test]
    async fn metered_relay_counts_both_directions() {
        let (client_near, client_far) = tokio::io::duplex(64 * 1024);
        let (lease_near, lease_far) = tokio::io::duplex(64 * 1024);
        let bucket = TokenBucket::new(10_000_000, 10_000_000).unwrap();

        let relay = tokio::spawn(relay_streams(client_far, lease_far, Some(bucket.clone())));

        let backend = tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(lease_near);
            let mut buf = [0u8; 4];
            read.read_exact(&mut buf).await.unwrap();
            write.write_all(&buf).await.unwrap();
            write.shutdown().await.unwrap();
            let _ = read.read_to_end(&mut Vec::new()).await;
        });

        let (mut client_read, mut client_write) = tokio::io::split(client_near);
        client_write.write_all(b"ping").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut response = Vec::new();
        client_read.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"ping");

        backend.await.unwrap();
        relay.await.unwrap();
        // Both directions drew from the shared bucket.
        assert_eq!(bucket.stats().total_bytes, 8);
    }
}
