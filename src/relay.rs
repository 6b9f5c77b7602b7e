//! Per-connection relay between a tunnel stream and the local service

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("could not connect to upstream {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("relay IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dial `upstream` and copy bytes both ways until either direction ends
///
/// When one direction finishes (EOF or error) the other is cancelled and
/// both connections are dropped.
pub async fn relay<S>(downstream: S, upstream: &str) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let local = TcpStream::connect(upstream)
        .await
        .map_err(|source| RelayError::Dial {
            addr: upstream.to_string(),
            source,
        })?;
    local.set_nodelay(true).ok();

    let (mut remote_read, mut remote_write) = tokio::io::split(downstream);
    let (mut local_read, mut local_write) = local.into_split();

    let mut to_local = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut remote_read, &mut local_write).await;
        local_write.shutdown().await.ok();
        copied
    });

    let mut to_remote = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut local_read, &mut remote_write).await;
        remote_write.shutdown().await.ok();
        copied
    });

    // Wait for either direction to complete
    let result = tokio::select! {
        res = &mut to_local => {
            to_remote.abort();
            let _ = to_remote.await;
            res
        }
        res = &mut to_remote => {
            to_local.abort();
            let _ = to_local.await;
            res
        }
    };

    match result {
        Ok(Ok(bytes)) => {
            debug!("relay to {} finished after {} bytes in one direction", upstream, bytes);
            Ok(())
        }
        Ok(Err(e)) => Err(RelayError::Io(e)),
        // Neither task panics or is aborted before this point
        Err(e) => Err(RelayError::Io(std::io::Error::other(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_relay_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            socket.write_all(b"pong").await.unwrap();
        });

        let (downstream, mut peer) = tokio::io::duplex(1024);
        let relay_task = tokio::spawn(async move { relay(downstream, &upstream).await });

        peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        server.await.unwrap();

        // Upstream closed: relay ends and the peer sees EOF
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        relay_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_relay_dial_failure() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (downstream, _peer) = tokio::io::duplex(64);
        let result = relay(downstream, &upstream).await;
        assert!(matches!(result, Err(RelayError::Dial { .. })));
    }
}
