use reqwest::header::{InvalidHeaderValue, ToStrError};
use rustls::pki_types::InvalidDnsNameError;

use crate::{
    engine::EngineError, reassembly::ReassemblyError, session::NtripState, sink::SinkError,
};

/// Correction client error types
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Invalid header value {0}")]
    InvalidHeaderValue(#[from] InvalidHeaderValue),

    #[error("Invalid DNS name {0}")]
    InvalidDnsName(#[from] InvalidDnsNameError),

    #[error("Header ToStrError error {0}")]
    ToStrError(#[from] ToStrError),

    #[error("Invalid URL")]
    InvalidUrl,

    #[error("Invalid port number")]
    InvalidPort,

    #[error("Configuration not set")]
    ConfigNotSet,

    #[error("Credentials not set")]
    CredentialsNotSet,

    #[error("Configuration is locked while a session is active")]
    ConfigLocked,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("Caster returned a source table, check the mountpoint")]
    SourceTable,

    #[error("Unexpected caster response: {0}")]
    UnexpectedResponse(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Buffer too small: {required} bytes required, {available} available")]
    BufferTooSmall { required: usize, available: usize },

    #[error("No correction data available")]
    NoCorrectionData,

    #[error("Invalid QoS level {0}")]
    InvalidQos(u8),

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Broker engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Reassembly queue full")]
    QueueFull,

    #[error("Reassembly error: {0}")]
    Reassembly(#[from] ReassemblyError),

    #[error("Failed to create NTRIP task: {0}")]
    TaskCreateFailed(String),

    #[error("Client not initialized")]
    NotInitialized,

    #[error("Operation not allowed in state {0}")]
    InvalidState(NtripState),

    #[error("Session registry full ({0} slots)")]
    RegistryFull(usize),

    #[error("Correction sink error: {0}")]
    Sink(#[from] SinkError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
