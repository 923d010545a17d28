//! Broker engine boundary
//!
//! The MQTT protocol itself is handled by an external engine implementing
//! [BrokerEngine]. The engine reports what happens on its own task through
//! an [EventSink]: control events are queued for the [MqttClient](crate::MqttClient)
//! to apply under its lock, data chunks are converted to
//! [ReassemblyItem]s and pushed into the bounded reassembly queue.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::{
    mpsc::{self, error::SendTimeoutError},
    Notify,
};
use tracing::{debug, error, trace};

use crate::{
    config::{MqttConfig, QoS},
    reassembly::{ChunkTracker, ReassemblyItem},
    ClientError,
};

/// Longest wait for a free reassembly queue slot
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(10);

/// Broker engine failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("{0} rejected by engine")]
    Rejected(&'static str),

    #[error("engine failure: {0}")]
    Failed(String),
}

/// One inbound data event.
///
/// Messages larger than the engine chunk capacity arrive as several
/// chunks; continuation chunks may carry an empty topic.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataChunk {
    pub topic: Bytes,
    pub data: Bytes,
    /// Length of the whole message
    pub total_data_len: usize,
    /// Offset of `data` within the whole message
    pub current_data_offset: usize,
}

impl DataChunk {
    /// Splits `payload` the way an engine with `capacity` sized buffers would
    pub fn split(topic: &str, payload: &[u8], capacity: usize) -> Vec<DataChunk> {
        let payload = Bytes::copy_from_slice(payload);
        let total = payload.len();
        let capacity = capacity.max(1);

        (0..total.max(1))
            .step_by(capacity)
            .map(|offset| DataChunk {
                topic: if offset == 0 {
                    Bytes::copy_from_slice(topic.as_bytes())
                } else {
                    Bytes::new()
                },
                data: payload.slice(offset.min(total)..(offset + capacity).min(total)),
                total_data_len: total,
                current_data_offset: offset,
            })
            .collect()
    }
}

/// Events emitted by a [BrokerEngine]
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Connected,
    Disconnected,
    Subscribed { msg_id: u16 },
    Unsubscribed { msg_id: u16 },
    Published { msg_id: u16 },
    Data(DataChunk),
    Error(String),
}

/// MQTT engine driven by an [MqttClient](crate::MqttClient).
///
/// Calls are expected to return promptly; connection progress is reported
/// through the [EventSink] handed over in [BrokerEngine::register_events].
pub trait BrokerEngine: Send {
    /// Applies the broker configuration, including the inbound chunk capacity
    fn init(&mut self, config: &MqttConfig) -> Result<(), EngineError>;

    fn register_events(&mut self, sink: EventSink) -> Result<(), EngineError>;

    /// Starts the engine, which connects to the broker
    fn start(&mut self) -> Result<(), EngineError>;

    fn reconnect(&mut self) -> Result<(), EngineError>;

    fn disconnect(&mut self) -> Result<(), EngineError>;

    fn stop(&mut self) -> Result<(), EngineError>;

    /// Releases engine resources; the engine is dropped afterwards
    fn destroy(&mut self) -> Result<(), EngineError>;

    /// Returns the message id of the SUBSCRIBE
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<u16, EngineError>;

    fn unsubscribe(&mut self, topic: &str) -> Result<u16, EngineError>;

    /// Queues a publish. With `store` set the message is queued even at
    /// QoS 0 instead of being dropped when the outbox is busy.
    fn enqueue(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        store: bool,
    ) -> Result<u16, EngineError>;
}

/// Handle given to the engine for reporting events
#[derive(Clone)]
pub struct EventSink {
    events: mpsc::UnboundedSender<EngineEvent>,
    items: mpsc::Sender<ReassemblyItem>,
    tracker: Arc<Mutex<ChunkTracker>>,
    notify: Arc<Notify>,
}

impl EventSink {
    pub(crate) fn new(
        events: mpsc::UnboundedSender<EngineEvent>,
        items: mpsc::Sender<ReassemblyItem>,
        chunk_capacity: usize,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            events,
            items,
            tracker: Arc::new(Mutex::new(ChunkTracker::new(chunk_capacity))),
            notify,
        }
    }

    /// Reports an engine event.
    ///
    /// Data chunks wait at most [ENQUEUE_TIMEOUT] for a queue slot and fail
    /// with [ClientError::QueueFull] otherwise; the client stays usable.
    pub async fn deliver(&self, event: EngineEvent) -> Result<(), ClientError> {
        match event {
            EngineEvent::Data(chunk) => {
                let item = self
                    .tracker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .ingest(&chunk)
                    .inspect_err(|e| error!("Dropping inbound chunk: {}", e))?;

                trace!(
                    "Queueing part {}/{} of {} ({} bytes)",
                    item.part_index,
                    item.total_parts,
                    item.topic,
                    item.data_len
                );

                match self.items.send_timeout(item, ENQUEUE_TIMEOUT).await {
                    Ok(()) => {},
                    Err(SendTimeoutError::Timeout(item)) => {
                        error!(
                            "Reassembly queue full, dropped part {} of {}",
                            item.part_index, item.topic
                        );
                        return Err(ClientError::QueueFull);
                    },
                    Err(SendTimeoutError::Closed(_)) => return Err(ClientError::NotInitialized),
                }
            },
            event => {
                debug!("Engine event {:?}", event);
                self.events
                    .send(event)
                    .map_err(|_| ClientError::NotInitialized)?;
            },
        }

        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_marks_offsets_and_continuations() {
        let chunks = DataChunk::split("t/1", &[7u8; 2500], 1024);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].topic.as_ref(), b"t/1");
        assert!(chunks[1].topic.is_empty());
        assert_eq!(
            chunks
                .iter()
                .map(|c| c.current_data_offset)
                .collect::<Vec<_>>(),
            vec![0, 1024, 2048]
        );
        assert_eq!(chunks[2].data.len(), 452);
        assert!(chunks.iter().all(|c| c.total_data_len == 2500));
    }

    #[tokio::test]
    async fn control_events_are_queued() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (items_tx, _items_rx) = mpsc::channel(1);
        let sink = EventSink::new(events_tx, items_tx, 1024, Arc::new(Notify::new()));

        sink.deliver(EngineEvent::Connected).await.unwrap();
        assert_eq!(events_rx.try_recv().unwrap(), EngineEvent::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_is_reported() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (items_tx, mut items_rx) = mpsc::channel(1);
        let sink = EventSink::new(events_tx, items_tx, 1024, Arc::new(Notify::new()));

        let mut chunks = DataChunk::split("t", b"abc", 1024);
        let chunk = chunks.remove(0);

        sink.deliver(EngineEvent::Data(chunk.clone())).await.unwrap();
        assert!(matches!(
            sink.deliver(EngineEvent::Data(chunk.clone())).await,
            Err(ClientError::QueueFull)
        ));

        // Draining the queue makes room again
        assert_eq!(items_rx.recv().await.unwrap().payload.as_ref(), b"abc");
        sink.deliver(EngineEvent::Data(chunk)).await.unwrap();
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (items_tx, _items_rx) = mpsc::channel(4);
        let sink = EventSink::new(events_tx, items_tx, 4, Arc::new(Notify::new()));

        let chunk = DataChunk {
            topic: Bytes::from_static(b"t"),
            data: Bytes::from_static(b"too long"),
            total_data_len: 8,
            current_data_offset: 0,
        };
        assert!(matches!(
            sink.deliver(EngineEvent::Data(chunk)).await,
            Err(ClientError::Reassembly(_))
        ));
    }
}
