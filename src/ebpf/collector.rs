//! Reads the EVENTS ring buffer and feeds the records to an [`EventPipeline`].

use std::time::Duration;

use aya::maps::{MapData, RingBuf};
use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::ProbeError;
use crate::config::{AgentConfig, RingMode};
use crate::erpc::ErpcTransport;
use crate::pipeline::EventPipeline;

/// Records in flight between the reader and the pipeline.
const CHANNEL_DEPTH: usize = 4096;

pub struct EventCollector {
    ring: RingBuf<MapData>,
    mode: RingMode,
    poll_interval: Duration,
}

fn drain(ring: &mut RingBuf<MapData>, batch: &mut Vec<Bytes>) {
    while let Some(item) = ring.next() {
        batch.push(Bytes::copy_from_slice(&item));
    }
}

impl EventCollector {
    pub fn new(ring: RingBuf<MapData>, config: &AgentConfig) -> Self {
        Self {
            ring,
            mode: config.ring_mode,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Reads until the pipeline goes away. Records are decoded, joined,
    /// resolved and logged on a separate task so a slow path lookup never
    /// stalls the reader.
    pub async fn run<T>(self, pipeline: EventPipeline<T>) -> Result<(), ProbeError>
    where
        T: ErpcTransport + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let consumer = tokio::spawn(pipeline.consume(rx));
        info!(mode = ?self.mode, "reading events");

        let result = match self.mode {
            RingMode::Notify => Self::read_notified(self.ring, tx).await,
            RingMode::Poll => Self::read_polled(self.ring, self.poll_interval, tx).await,
        };
        if let Err(e) = consumer.await {
            debug!(error = %e, "event consumer ended abnormally");
        }
        result
    }

    async fn read_notified(ring: RingBuf<MapData>, tx: mpsc::Sender<Bytes>) -> Result<(), ProbeError> {
        let mut fd = AsyncFd::with_interest(ring, Interest::READABLE)?;
        let mut batch = Vec::new();
        loop {
            {
                let mut guard = fd.readable_mut().await?;
                drain(guard.get_inner_mut(), &mut batch);
                guard.clear_ready();
            }
            if !forward(&tx, &mut batch).await {
                return Ok(());
            }
        }
    }

    async fn read_polled(
        mut ring: RingBuf<MapData>,
        every: Duration,
        tx: mpsc::Sender<Bytes>,
    ) -> Result<(), ProbeError> {
        let mut ticker = tokio::time::interval(every);
        let mut batch = Vec::new();
        loop {
            ticker.tick().await;
            drain(&mut ring, &mut batch);
            if !forward(&tx, &mut batch).await {
                return Ok(());
            }
        }
    }
}

/// False once the consumer is gone.
async fn forward(tx: &mpsc::Sender<Bytes>, batch: &mut Vec<Bytes>) -> bool {
    for record in batch.drain(..) {
        if tx.send(record).await.is_err() {
            return false;
        }
    }
    true
}
