//! Bidirectional byte relay

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const BUFFER_SIZE: usize = 32 * 1024;

/// Relay bytes between `a` and `b` until both directions are done
///
/// Returns `(a_to_b, b_to_a)` byte counts. Each direction half-closes its
/// writer when its reader hits EOF or an error, so the peer sees the end of
/// the stream while the opposite direction keeps flowing.
pub async fn pipe<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    tokio::join!(copy_half(a_read, b_write), copy_half(b_read, a_write))
}

async fn copy_half<R, W>(mut reader: R, mut writer: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Relay read error");
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            debug!(error = %e, "Relay write error");
            break;
        }
        total += n as u64;
    }

    let _ = writer.shutdown().await;
    total
}
