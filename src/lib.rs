//! GNSS correction client library
//!
//! Retrieves RTCM / SPARTN correction data for high precision GNSS either
//! from an NTRIP caster ([NtripClient]) or from an MQTT broker
//! ([MqttClient]), and forwards it to a [CorrectionSink].

pub mod config;
pub use config::*;

pub mod credentials;
pub use credentials::NtripCredentials;

mod error;
pub use error::{ClientError, Result};

pub mod transport;

pub mod session;
pub use session::{NtripDetailedError, NtripState, Snapshot};

mod client;
pub use client::NtripClient;

pub mod sourcetable;
pub use sourcetable::{fetch_sourcetable, SourceTable};

pub mod gga;
pub use gga::GgaSentence;

pub mod engine;
pub use engine::{BrokerEngine, EngineEvent, EventSink};

pub mod reassembly;
pub use reassembly::{ItemStatus, MqttPayload};

mod mqtt;
pub use mqtt::{MqttClient, MqttState, Transition};

pub mod registry;
pub use registry::{Registry, SessionId};

pub mod sink;
pub use sink::{forward_mqtt, forward_ntrip, CorrectionSink};
