//! Stdio transport loop.
//!
//! Reads byte chunks from stdin into the capped line buffer, dispatches
//! complete lines, and writes every outbound line (responses and
//! stream notifications alike) through one writer task so stdout stays
//! a clean sequence of JSON documents.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::encoding::{FramingError, LineBuffer};
use super::handler::RpcHandler;
use crate::Runtime;

const READ_CHUNK: usize = 16 * 1024;

/// Run the stdio server until stdin closes or a shutdown RPC lands.
pub async fn run_stdio(
    runtime: Arc<Runtime>,
    line_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> std::io::Result<()> {
    let writer = tokio::spawn(write_loop(line_rx, runtime.outbound().pool().clone()));

    let handler = RpcHandler::new(runtime.clone());
    let mut stdin = tokio::io::stdin();
    let mut framer = LineBuffer::new(runtime.config.bridge.max_buffer_size);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let read = stdin.read(&mut chunk).await?;
        if read == 0 {
            tracing::info!("stdin closed, shutting down");
            break;
        }

        let lines = match framer.feed(&chunk[..read]) {
            Ok(lines) => lines,
            Err(FramingError::BufferOverflow { size, max }) => {
                tracing::warn!(size, max, "input line exceeded buffer cap");
                runtime
                    .outbound()
                    .send(&RpcHandler::overflow_response(size, max));
                continue;
            }
        };

        for line in lines {
            if let Some(response) = handler.handle_line(&line).await {
                runtime.outbound().send(&response);
            }
        }
    }

    runtime.shutdown().await;

    // The writer exits once every Outbound clone is gone; give queued
    // notifications a moment to flush, then cut it loose.
    drop(handler);
    drop(runtime);
    let mut writer = writer;
    if tokio::time::timeout(std::time::Duration::from_secs(1), &mut writer)
        .await
        .is_err()
    {
        tracing::debug!("writer still draining at exit, aborting");
        writer.abort();
    }
    Ok(())
}

/// Single writer: drains outbound buffers to stdout, one line each, and
/// recycles them.
async fn write_loop(
    mut line_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pool: Arc<super::bridge::BufferPool>,
) {
    let mut stdout = tokio::io::stdout();
    while let Some(buffer) = line_rx.recv().await {
        if stdout.write_all(&buffer).await.is_err() {
            break;
        }
        if stdout.write_all(b"\n").await.is_err() {
            break;
        }
        if stdout.flush().await.is_err() {
            break;
        }
        pool.release(buffer);
    }
}
