//! Bidirectional byte relay.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use burrow_protocol::pool;

/// A duplex byte stream usable across task boundaries.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

pub type BoxedStream = Box<dyn AsyncReadWrite>;

/// Copies bytes in both directions until either side finishes.
///
/// A clean half-close is not an error; the first I/O failure wins.
pub async fn relay<A, B>(a: A, b: B) -> std::io::Result<()>
where
    A: AsyncReadWrite,
    B: AsyncReadWrite,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    tokio::select! {
        r = copy_half(&mut ar, &mut bw) => r,
        r = copy_half(&mut br, &mut aw) => r,
    }
}

async fn copy_half<R, W>(r: &mut R, w: &mut W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool::large();
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            let _ = w.shutdown().await;
            return Ok(());
        }
        w.write_all(&buf[..n]).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn relay_moves_bytes_both_ways() {
        let (client, relay_a) = tokio::io::duplex(1024);
        let (server, relay_b) = tokio::io::duplex(1024);

        let task = tokio::spawn(relay(relay_a, relay_b));

        let (mut cr, mut cw) = tokio::io::split(client);
        let (mut sr, mut sw) = tokio::io::split(server);

        cw.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        sr.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        sw.write_all(b"pong").await.unwrap();
        cr.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // closing one side ends the relay cleanly
        drop(cr);
        drop(cw);
        assert!(task.await.unwrap().is_ok());
    }
}
