//! TCP accept loop. Each device connection carries one batch of records and
//! is handled on its own task.

use crate::config::ListenerConfig;
use crate::frame_decoder::{ChunkStatus, FrameBuffer, FrameError};
use crate::pipeline::IngestPipeline;
use osp_storage::oplog::OpLog;
use parking_lot::RwLock;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Errors that discard a connection's batch before processing.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Read failed: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Listener statistics.
#[derive(Debug, Clone, Default)]
pub struct ListenerStats {
    pub connections_accepted: u64,
    pub connections_discarded: u64,
    pub bytes_received: u64,
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub ticks_processed: u64,
}

/// Accepts device connections and feeds their payloads to the pipeline.
#[derive(Clone)]
pub struct IngestListener {
    pipeline: IngestPipeline,
    oplog: OpLog,
    read_buffer_bytes: usize,
    max_payload_bytes: usize,
    stats: Arc<RwLock<ListenerStats>>,
}

impl IngestListener {
    pub fn new(pipeline: IngestPipeline, oplog: OpLog, config: &ListenerConfig) -> Self {
        Self {
            pipeline,
            oplog,
            read_buffer_bytes: config.read_buffer_bytes.max(1),
            max_payload_bytes: config.max_payload_bytes,
            stats: Arc::new(RwLock::new(ListenerStats::default())),
        }
    }

    /// Get current statistics.
    pub fn stats(&self) -> ListenerStats {
        self.stats.read().clone()
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(&self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, "Accepting sensor connections");
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    self.stats.write().connections_accepted += 1;
                    metrics::counter!("ingest.connections.accepted").increment(1);

                    let handler = self.clone();
                    tokio::spawn(async move {
                        handler.handle_connection(stream, peer).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection<R>(&self, reader: R, peer: SocketAddr)
    where
        R: AsyncRead + Unpin,
    {
        let payload = match self.read_batch(reader).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Discarding batch");
                self.stats.write().connections_discarded += 1;
                return;
            }
        };

        // Every completed transmission is logged, blank ones included
        let oplog = self.oplog.clone();
        let entry = payload.clone();
        tokio::spawn(async move {
            if let Err(e) = oplog.record(&entry).await {
                warn!(error = %e, "Failed to record payload in operational log");
            }
        });

        if payload.trim().is_empty() {
            debug!(peer = %peer, "Connection closed without records");
            return;
        }

        let started = Instant::now();
        match self.pipeline.process(&payload).await {
            Ok(count) => {
                let elapsed = started.elapsed();
                metrics::histogram!("ingest.batch.duration_seconds").record(elapsed.as_secs_f64());
                {
                    let mut stats = self.stats.write();
                    stats.batches_processed += 1;
                    stats.ticks_processed += count as u64;
                }
                info!(
                    peer = %peer,
                    ticks = count,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Batch processed"
                );
            }
            Err(e) => {
                self.stats.write().batches_failed += 1;
                error!(peer = %peer, error = %e, "Batch failed");
            }
        }
    }

    /// Read one transmission: until EOF or an end-of-transmission chunk.
    async fn read_batch<R>(&self, mut reader: R) -> Result<String, ConnectionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut frame = FrameBuffer::new(self.max_payload_bytes);
        let mut chunk = vec![0u8; self.read_buffer_bytes];

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }

            self.stats.write().bytes_received += n as u64;
            if frame.push(&chunk[..n])? == ChunkStatus::EndOfTransmission {
                break;
            }
        }

        Ok(frame.payload().into_owned())
    }
}

/// Bind the configured listen address.
pub async fn bind(config: &ListenerConfig) -> io::Result<TcpListener> {
    TcpListener::bind((config.host.as_str(), config.port)).await
}
