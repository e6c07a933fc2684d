//! From ring buffer records to logged events.
//!
//! ```text
//! ring buffer ─► decode ─► ARGS_ENVS join ─► path fill ─► JSON log line
//! ```

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::erpc::ErpcTransport;
use crate::events::{decode, ArgsEnvsJoiner, DecodeError, SecurityEvent};
use crate::metrics;
use crate::resolver::PathResolver;

/// Argument streams waiting for their EXEC.
const PENDING_ARGS_ENVS: usize = 1024;

pub struct EventPipeline<T> {
    joiner: ArgsEnvsJoiner,
    resolver: Option<PathResolver<T>>,
}

impl<T: ErpcTransport> EventPipeline<T> {
    /// Without a resolver, file events go out with their keys only.
    pub fn new(resolver: Option<PathResolver<T>>) -> Self {
        Self {
            joiner: ArgsEnvsJoiner::new(PENDING_ARGS_ENVS),
            resolver,
        }
    }

    pub fn resolver(&self) -> Option<&PathResolver<T>> {
        self.resolver.as_ref()
    }

    /// Turns one record into an event ready for output.
    ///
    /// # Arguments
    /// * `record` - One ring buffer record, header included
    ///
    /// # Returns
    /// `None` when there is nothing to output yet:
    /// - the record does not decode (counted in `DECODE_ERRORS`)
    /// - it is an argument chunk, held back until its EXEC arrives
    ///
    /// Otherwise the event, with pending arguments joined into an EXEC and
    /// path keys resolved when a resolver is attached.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let resolver = PathResolver::new(ErpcClient::new(IoctlTransport::open()?), 4096);
    /// let mut pipeline = EventPipeline::new(Some(resolver));
    ///
    /// if let Some(event) = pipeline.process(&record) {
    ///     emit(&event);
    /// }
    /// ```
    pub fn process(&mut self, record: &[u8]) -> Option<SecurityEvent> {
        let mut event = match decode(record) {
            Ok(event) => event,
            Err(e) => {
                metrics::DECODE_ERRORS.with_label_values(&[decode_reason(&e)]).inc();
                debug!(len = record.len(), error = %e, "dropping record");
                return None;
            }
        };
        metrics::EVENTS_RECEIVED
            .with_label_values(&[event.event_type().name()])
            .inc();

        if self.joiner.absorb(&event) {
            return None;
        }
        self.joiner.complete(&mut event);
        if let Some(resolver) = &mut self.resolver {
            resolver.fill(&mut event);
        }
        Some(event)
    }

    /// Processes records until every sender is gone.
    pub async fn consume(mut self, mut records: mpsc::Receiver<Bytes>) {
        while let Some(record) = records.recv().await {
            if let Some(event) = self.process(&record) {
                emit(&event);
            }
        }
        debug!("event stream closed");
    }
}

/// Logs an event as one JSON document.
pub fn emit(event: &SecurityEvent) {
    info!(
        target: "secwatch::events",
        event_type = event.event_type().name(),
        event = %event.to_json(),
        "security event"
    );
}

fn decode_reason(e: &DecodeError) -> &'static str {
    match e {
        DecodeError::Truncated { .. } => "truncated",
        DecodeError::UnknownType(_) => "unknown_type",
        DecodeError::ShortRecord { .. } => "short_record",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erpc::{ErpcClient, SimTransport};
    use crate::events::Payload;
    use secwatch_common::event::{EventType, OpenEvent};
    use secwatch_common::kernel::bytes_of;
    use secwatch_common::sim::SimKernel;

    fn open_record(key: secwatch_common::path::PathKey) -> Vec<u8> {
        let mut ev = OpenEvent::default();
        ev.base.header.event_type = EventType::Open as u32;
        ev.file.path_key = key;
        bytes_of(&ev).to_vec()
    }

    #[test]
    fn open_gets_its_path() {
        let k = SimKernel::new();
        let root = k.root_dentry(2);
        let tmp = k.add_dentry(root, "tmp", 10);
        let file = k.add_dentry(tmp, "x", 11);
        let key = k.resolve_dentry(file, 1);

        let resolver = PathResolver::new(ErpcClient::new(SimTransport::new(&k)), 16);
        let mut pipeline = EventPipeline::new(Some(resolver));
        let event = pipeline.process(&open_record(key)).unwrap();

        let Payload::Open(open) = &event.payload else {
            panic!("not an open");
        };
        assert_eq!(open.file.path.as_deref(), Some("/tmp/x"));
    }

    #[test]
    fn garbage_is_counted_not_emitted() {
        let mut pipeline: EventPipeline<SimTransport<'_>> = EventPipeline::new(None);
        let before = metrics::DECODE_ERRORS.with_label_values(&["truncated"]).get();
        assert!(pipeline.process(&[1, 2, 3]).is_none());
        assert_eq!(
            metrics::DECODE_ERRORS.with_label_values(&["truncated"]).get(),
            before + 1
        );
    }
}
