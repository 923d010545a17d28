//! Correction data consumers
//!
//! Received corrections usually end up in a GNSS receiver. [CorrectionSink]
//! abstracts that destination; [forward_ntrip] and [forward_mqtt] move one
//! unit of data from a client into a sink.

use std::io::Write;

use tracing::trace;

use crate::{
    engine::BrokerEngine,
    reassembly::{ItemStatus, MqttPayload},
    ClientError, MqttClient, NtripClient,
};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink rejected data: {0}")]
    Rejected(String),
}

/// Destination for correction data
pub trait CorrectionSink {
    fn push(&mut self, data: &[u8]) -> Result<(), SinkError>;
}

impl CorrectionSink for Vec<u8> {
    fn push(&mut self, data: &[u8]) -> Result<(), SinkError> {
        self.extend_from_slice(data);
        Ok(())
    }
}

impl<S: CorrectionSink + ?Sized> CorrectionSink for Box<S> {
    fn push(&mut self, data: &[u8]) -> Result<(), SinkError> {
        (**self).push(data)
    }
}

/// [CorrectionSink] over any [Write]r, such as a serial port or stdout
#[derive(Debug)]
pub struct WriterSink<W>(pub W);

impl<W: Write> CorrectionSink for WriterSink<W> {
    fn push(&mut self, data: &[u8]) -> Result<(), SinkError> {
        self.0.write_all(data)?;
        self.0.flush()?;
        Ok(())
    }
}

/// Moves pending NTRIP correction data into `sink`.
///
/// Returns the number of bytes forwarded, 0 when nothing was pending.
pub async fn forward_ntrip(
    client: &NtripClient,
    buf: &mut [u8],
    sink: &mut impl CorrectionSink,
) -> Result<usize, ClientError> {
    let n = match client.get_correction_data(buf).await {
        Ok(n) => n,
        Err(ClientError::NoCorrectionData) => return Ok(0),
        Err(e) => return Err(e),
    };

    trace!("Forwarding {} NTRIP bytes", n);
    sink.push(&buf[..n])?;
    Ok(n)
}

/// Stitches one queued MQTT item and forwards `payload` once complete
pub fn forward_mqtt<E: BrokerEngine>(
    client: &MqttClient<E>,
    payload: &mut MqttPayload,
    sink: &mut impl CorrectionSink,
) -> Result<ItemStatus, ClientError> {
    let status = client.receive_item(payload);

    if status == ItemStatus::Ok {
        trace!("Forwarding {} bytes from {}", payload.len(), payload.topic);
        sink.push(payload.data())?;
    }

    Ok(status)
}
