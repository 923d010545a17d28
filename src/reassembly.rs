//! Segmented MQTT message reassembly
//!
//! Inbound messages larger than the engine chunk capacity arrive as
//! several [DataChunk]s. Each chunk is turned into a [ReassemblyItem]
//! numbered `1..=total_parts`; the consumer side stitches consecutive
//! items back into one [MqttPayload].

use bytes::Bytes;
use tracing::{debug, warn};

use crate::engine::DataChunk;

/// Maximum topic length in bytes
pub const MAX_TOPIC_LEN: usize = 127;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("topic of {0} bytes exceeds {MAX_TOPIC_LEN}")]
    TopicTooLong(usize),

    #[error("topic is not valid UTF-8")]
    InvalidTopic,

    #[error("continuation chunk without a preceding topic")]
    MissingTopic,

    #[error("chunk of {len} bytes exceeds capacity {capacity}")]
    ChunkTooLarge { len: usize, capacity: usize },
}

/// One part of a possibly segmented message
#[derive(Debug, Clone, PartialEq)]
pub struct ReassemblyItem {
    pub topic: String,
    pub data_len: usize,
    pub total_data_len: usize,
    /// 1-based position of this part
    pub part_index: usize,
    pub total_parts: usize,
    pub payload: Bytes,
}

/// Producer side: numbers chunks as they arrive from the engine
#[derive(Debug, Clone)]
pub struct ChunkTracker {
    chunk_capacity: usize,
    last_topic: Option<String>,
    last_part: usize,
}

impl ChunkTracker {
    pub fn new(chunk_capacity: usize) -> Self {
        Self {
            chunk_capacity: chunk_capacity.max(1),
            last_topic: None,
            last_part: 0,
        }
    }

    /// Converts one chunk into a [ReassemblyItem].
    ///
    /// Chunks with an empty topic continue the previous topic. Part numbers
    /// restart at 1 on offset 0 and otherwise follow the previous chunk.
    pub fn ingest(&mut self, chunk: &DataChunk) -> Result<ReassemblyItem, ReassemblyError> {
        if chunk.topic.len() > MAX_TOPIC_LEN {
            return Err(ReassemblyError::TopicTooLong(chunk.topic.len()));
        }

        if chunk.data.len() > self.chunk_capacity {
            return Err(ReassemblyError::ChunkTooLarge {
                len: chunk.data.len(),
                capacity: self.chunk_capacity,
            });
        }

        let topic = if chunk.topic.is_empty() {
            self.last_topic
                .clone()
                .ok_or(ReassemblyError::MissingTopic)?
        } else {
            std::str::from_utf8(&chunk.topic)
                .map_err(|_| ReassemblyError::InvalidTopic)?
                .to_string()
        };

        let total_parts = chunk.total_data_len.div_ceil(self.chunk_capacity).max(1);

        let part_index = if total_parts > 1 && chunk.current_data_offset > 0 {
            self.last_part + 1
        } else {
            1
        };

        self.last_topic = Some(topic.clone());
        self.last_part = part_index;

        Ok(ReassemblyItem {
            topic,
            data_len: chunk.data.len(),
            total_data_len: chunk.total_data_len,
            part_index,
            total_parts,
            payload: chunk.data.clone(),
        })
    }
}

/// Result of feeding one item to the [Reassembler]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    /// Nothing was queued
    NoItem,
    /// A part was accepted, the message is incomplete
    Fetching,
    /// The output holds a complete message
    Ok,
    /// The item was rejected; any partial output was discarded
    Error,
}

/// Caller owned output buffer for reassembled messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttPayload {
    pub topic: String,
    data: Vec<u8>,
    max_len: usize,
}

impl MqttPayload {
    pub fn with_capacity(max_len: usize) -> Self {
        Self {
            topic: String::new(),
            data: Vec::with_capacity(max_len),
            max_len,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    fn fits(&self, extra: usize) -> bool {
        self.data.len() + extra <= self.max_len
    }
}

#[derive(Debug, Clone)]
struct PendingMessage {
    topic: String,
    part_index: usize,
}

/// Consumer side: stitches consecutive items into an [MqttPayload]
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: Option<PendingMessage>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a multi-part message is being collected
    pub fn is_fetching(&self) -> bool {
        self.pending.is_some()
    }

    pub fn stitch(&mut self, item: ReassemblyItem, reply: &mut MqttPayload) -> ItemStatus {
        if item.total_parts <= 1 || item.part_index == 1 {
            return self.begin(item, reply);
        }

        let continues = self
            .pending
            .as_ref()
            .is_some_and(|p| p.topic == item.topic && item.part_index == p.part_index + 1);

        if !continues {
            warn!(
                "Out of order part {}/{} on {}, discarding message",
                item.part_index, item.total_parts, item.topic
            );
            return self.discard(reply);
        }

        if !reply.fits(item.data_len) {
            warn!(
                "Reply buffer of {} bytes too small for {}",
                reply.max_len, item.topic
            );
            self.pending = None;
            return ItemStatus::Error;
        }

        reply.data.extend_from_slice(&item.payload);

        if item.part_index < item.total_parts {
            self.pending = Some(PendingMessage {
                topic: item.topic,
                part_index: item.part_index,
            });
            return ItemStatus::Fetching;
        }

        self.pending = None;

        if reply.data.len() != item.total_data_len {
            warn!(
                "Reassembled {} bytes on {}, expected {}",
                reply.data.len(),
                item.topic,
                item.total_data_len
            );
            reply.data.clear();
            return ItemStatus::Error;
        }

        debug!(
            "Reassembled {} bytes from {} parts on {}",
            reply.data.len(),
            item.total_parts,
            item.topic
        );
        ItemStatus::Ok
    }

    fn begin(&mut self, item: ReassemblyItem, reply: &mut MqttPayload) -> ItemStatus {
        if item.data_len > reply.max_len {
            warn!(
                "Reply buffer of {} bytes too small for {}",
                reply.max_len, item.topic
            );
            self.pending = None;
            return ItemStatus::Error;
        }

        reply.topic.clone_from(&item.topic);
        reply.data.clear();
        reply.data.extend_from_slice(&item.payload);

        if item.total_parts <= 1 {
            self.pending = None;
            return ItemStatus::Ok;
        }

        self.pending = Some(PendingMessage {
            topic: item.topic,
            part_index: 1,
        });
        ItemStatus::Fetching
    }

    fn discard(&mut self, reply: &mut MqttPayload) -> ItemStatus {
        reply.data.clear();
        self.pending = None;
        ItemStatus::Error
    }
}
