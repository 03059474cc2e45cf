//! A one-shot TCP server that hands a single file to a single client.
//!
//! The control host pulls the compressed image from here with `nc`. The
//! listener is closed as soon as the first client is accepted, so nothing
//! else can connect for the rest of the run.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Size of each read from the image file.
pub const CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// A bound listener with its transfer task running in the background.
/// Dropping the session tears the task (and listener) down.
#[derive(Debug)]
pub struct TransferSession {
    port: u16,
    task: JoinHandle<Result<u64>>,
}

impl TransferSession {
    /// The OS-assigned port the client should connect to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the transfer to finish, returning the bytes sent. If it
    /// does not finish within `timeout`, the task is torn down.
    pub async fn finish(mut self, timeout: Duration) -> Result<u64> {
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(r) => r.context("Image transfer task failed")?,
            Err(_) => anyhow::bail!("Image transfer did not complete within {timeout:?}"),
        }
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Bind an ephemeral port on all interfaces and start serving `path` to
/// the first client that connects.
#[context("Serving {path}")]
pub async fn serve(path: &Utf8Path) -> Result<TransferSession> {
    let file = tokio::fs::File::open(path).await?;
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    let port = listener.local_addr()?.port();
    tracing::debug!("Listening on port {port} for {path}");
    let task = tokio::spawn(send_once(listener, file));
    Ok(TransferSession { port, task })
}

async fn send_once(listener: TcpListener, mut file: tokio::fs::File) -> Result<u64> {
    let (mut client, peer) = listener.accept().await.context("Accepting")?;
    drop(listener);
    tracing::info!("Sending image to {peer}");
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = file.read(&mut buf).await.context("Reading image")?;
        if n == 0 {
            break;
        }
        client
            .write_all(&buf[..n])
            .await
            .with_context(|| format!("Sending to {peer}"))?;
        sent += n as u64;
    }
    client.shutdown().await.context("Closing connection")?;
    tracing::debug!("Sent {sent} bytes to {peer}");
    Ok(sent)
}
