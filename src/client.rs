//! NTRIP Client implementation

use std::{io, str::FromStr, sync::Arc, time::Duration};

use http::{uri::PathAndQuery, HeaderValue};
use tokio::{
    io::{split, AsyncReadExt as _, AsyncWriteExt, ReadHalf, WriteHalf},
    select,
    sync::{watch, Mutex, Notify},
    task::JoinHandle,
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::NtripConfig,
    credentials::NtripCredentials,
    session::{
        NtripDetailedError, NtripSession, NtripState, PollAction, ReadOutcome, Snapshot,
        TakeOutcome, RECEIVE_DATA_SIZE,
    },
    transport::{BoxedStream, Connector, TcpConnector},
    ClientError,
};

/// Correction data response
const RESPONSE_ICY: &[u8] = b"ICY 200 OK\r\n";

/// Source table response, the mountpoint is probably wrong
const RESPONSE_SOURCETABLE: &[u8] = b"SOURCETABLE 200 OK\r\n";

/// Lock wait for [NtripClient::state]
const STATE_LOCK_WAIT: Duration = Duration::from_millis(200);

/// Lock wait for [NtripClient::detailed_error]
const ERROR_LOCK_WAIT: Duration = Duration::from_secs(1);

/// Wait for the first caster response
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on a GGA write, the session lock is held meanwhile
const GGA_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Classification of the first caster response
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum CasterResponse {
    Icy,
    SourceTable,
    Other,
}

impl CasterResponse {
    pub(crate) fn classify(response: &[u8]) -> Self {
        let contains = |needle: &[u8]| response.windows(needle.len()).any(|w| w == needle);

        if contains(RESPONSE_SOURCETABLE) {
            CasterResponse::SourceTable
        } else if contains(RESPONSE_ICY) {
            CasterResponse::Icy
        } else {
            CasterResponse::Other
        }
    }
}

/// Formats the NTRIP v1 request for `config.mountpoint`
pub(crate) fn format_request(
    config: &NtripConfig,
    creds: &NtripCredentials,
) -> Result<String, ClientError> {
    let path = PathAndQuery::from_str(&format!("/{}", config.mountpoint))
        .map_err(|_| ClientError::InvalidConfig("invalid mountpoint"))?;

    // Header values are checked so CR/LF cannot leak into the request
    let user_agent = HeaderValue::from_str(&creds.user_agent)?;

    let mut request = format!("GET {} HTTP/1.0\r\n", path.as_str());
    request.push_str(&format!("User-Agent: {}\r\n", user_agent.to_str()?));
    request.push_str("Accept: */*\r\n");

    if let Some(auth) = creds.basic_auth() {
        let auth = HeaderValue::from_str(&auth)?;
        request.push_str(&format!("Authorization: {}\r\n", auth.to_str()?));
    }

    request.push_str("Connection: close\r\n\r\n");
    Ok(request)
}

/// Lock protected part of an [NtripClient]
struct Inner {
    session: Option<NtripSession>,
    writer: Option<WriteHalf<BoxedStream>>,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Wakes the poller after the application changed the session
    wake: Notify,
}

/// Background poller handle
struct Poller {
    handle: JoinHandle<ReadHalf<BoxedStream>>,
    shutdown: watch::Sender<bool>,
}

/// NTRIP Client, used to retrieve correction data from an NTRIP caster.
///
/// After [NtripClient::init] a background task watches the caster stream
/// and the session timers. The application polls [NtripClient::state],
/// hands GGA reports over with [NtripClient::send_gga] when asked to and
/// drains corrections with [NtripClient::get_correction_data].
pub struct NtripClient {
    config: Option<NtripConfig>,
    creds: Option<NtripCredentials>,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    poller: Option<Poller>,
}

impl Default for NtripClient {
    fn default() -> Self {
        Self::with_connector(TcpConnector)
    }
}

impl NtripClient {
    /// Creates a client ready for [NtripClient::init]
    pub fn new(config: NtripConfig, creds: NtripCredentials) -> Self {
        let mut s = Self::default();
        s.config = Some(config);
        s.creds = Some(creds);
        s
    }

    /// Creates an unconfigured client using a custom [Connector]
    pub fn with_connector(connector: impl Connector + 'static) -> Self {
        Self {
            config: None,
            creds: None,
            connector: Arc::new(connector),
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    session: None,
                    writer: None,
                }),
                wake: Notify::new(),
            }),
            poller: None,
        }
    }

    /// Sets the caster configuration, rejected while a session is active
    pub fn set_config(&mut self, config: NtripConfig) -> Result<(), ClientError> {
        if self.poller.is_some() {
            return Err(ClientError::ConfigLocked);
        }
        if self.config.is_some() {
            warn!("Configuration has already been set, overwriting with new one");
        }
        self.config = Some(config);
        Ok(())
    }

    /// Sets the caster credentials, rejected while a session is active
    pub fn set_credentials(&mut self, creds: NtripCredentials) -> Result<(), ClientError> {
        if self.poller.is_some() {
            return Err(ClientError::ConfigLocked);
        }
        if self.creds.is_some() {
            warn!("Credentials have already been set, overwriting with new ones");
        }
        self.creds = Some(creds);
        Ok(())
    }

    pub fn config(&self) -> Option<&NtripConfig> {
        self.config.as_ref()
    }

    /// Connects to the caster and starts the background poller.
    ///
    /// Any existing session is torn down first. On failure the stream is
    /// shut down before the error is returned.
    pub async fn init(&mut self) -> Result<(), ClientError> {
        let config = self.config.clone().ok_or(ClientError::ConfigNotSet)?;
        let creds = self.creds.clone().ok_or(ClientError::CredentialsNotSet)?;
        config.validate()?;

        if self.poller.is_some() {
            debug!("Closing previous session");
            if let Err(e) = self.teardown().await {
                warn!("Previous session did not close cleanly: {}", e);
            }
        }

        let request = format_request(&config, &creds)?;

        debug!(
            "Connecting to NTRIP caster {}/{}",
            config.url(),
            config.mountpoint
        );

        let mut stream = self.connector.connect(&config).await?;

        if let Err(e) = Self::handshake(&mut stream, &request).await {
            error!("NTRIP failed to initialize: {}", e);
            debug!("Running cleanup");
            if let Err(e) = stream.shutdown().await {
                warn!("Error closing socket: {}", e);
            }
            return Err(e);
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Failed to create NTRIP task: {}", e);
                if let Err(e) = stream.shutdown().await {
                    warn!("Error closing socket: {}", e);
                }
                let now = Instant::now();
                let mut session = NtripSession::new(config.gga_necessary, now);
                session.invalidate_socket();
                session.fail(NtripDetailedError::TaskCreateFailed, now);
                self.shared.inner.lock().await.session = Some(session);
                return Err(ClientError::TaskCreateFailed(e.to_string()));
            },
        };

        let (reader, writer) = split(stream);
        {
            let mut inner = self.shared.inner.lock().await;
            inner.session = Some(NtripSession::new(config.gga_necessary, Instant::now()));
            inner.writer = Some(writer);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = runtime.spawn(poll_loop(self.shared.clone(), reader, shutdown_rx));
        self.poller = Some(Poller { handle, shutdown });

        info!("NTRIP client initialization successful");
        Ok(())
    }

    /// Sends the request and classifies the first response
    async fn handshake(stream: &mut BoxedStream, request: &str) -> Result<(), ClientError> {
        trace!("Request: {:?}", request);
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;
        debug!("Request sent [{}] bytes", request.len());

        let mut response = [0u8; 256];
        let n = match timeout(HANDSHAKE_TIMEOUT, stream.read(&mut response)).await {
            Ok(r) => r?,
            Err(_) => {
                return Err(ClientError::UnexpectedResponse(
                    "no response from caster".into(),
                ))
            },
        };

        if n == 0 {
            return Err(ClientError::UnexpectedResponse("empty response".into()));
        }

        match CasterResponse::classify(&response[..n]) {
            CasterResponse::Icy => {
                info!("Connected to caster");
                Ok(())
            },
            CasterResponse::SourceTable => {
                warn!("Got source table, please provide a valid mountpoint");
                Err(ClientError::SourceTable)
            },
            CasterResponse::Other => {
                let r = String::from_utf8_lossy(&response[..n]);
                let status = r.lines().next().unwrap_or_default().to_string();
                error!("NTRIP caster returned: {}", status);
                Err(ClientError::UnexpectedResponse(status))
            },
        }
    }

    /// Writes a GGA report to the caster and returns to [NtripState::Ready].
    ///
    /// Only accepted in [NtripState::RequestGga] or [NtripState::Ready]; a
    /// failed session stays failed until the next [Self::init].
    pub async fn send_gga(&self, gga: &[u8]) -> Result<(), ClientError> {
        if gga.is_empty() {
            return Err(ClientError::InvalidArgument("empty GGA message"));
        }

        let mut inner = self.shared.inner.lock().await;
        let Inner { session, writer } = &mut *inner;
        let (Some(session), Some(writer)) = (session.as_mut(), writer.as_mut()) else {
            return Err(ClientError::NotInitialized);
        };

        match session.state() {
            NtripState::RequestGga | NtripState::Ready => {},
            state => {
                warn!("Not sending GGA in state {}", state);
                return Err(ClientError::InvalidState(state));
            },
        }

        let write = async {
            let n = writer.write(gga).await?;
            writer.flush().await?;
            Ok::<_, io::Error>(n)
        };
        let written = match timeout(GGA_WRITE_TIMEOUT, write).await {
            Ok(r) => r,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "GGA write timed out")),
        };

        let result = match &written {
            Ok(n) if *n == gga.len() => Ok(()),
            Ok(n) => Err(ClientError::Socket(format!(
                "partial GGA write, {} of {} bytes",
                n,
                gga.len()
            ))),
            Err(e) => Err(ClientError::Socket(e.to_string())),
        };

        session.on_gga_written(written, gga.len(), Instant::now());
        drop(inner);

        self.shared.wake.notify_one();
        result
    }

    /// Copies the pending correction chunk into `out`, returning its size.
    ///
    /// Fails with [ClientError::BufferTooSmall] without copying anything
    /// when `out` cannot hold the whole chunk.
    pub async fn get_correction_data(&self, out: &mut [u8]) -> Result<usize, ClientError> {
        let mut inner = self.shared.inner.lock().await;
        let session = inner.session.as_mut().ok_or(ClientError::NotInitialized)?;

        match session.take_correction(out, Instant::now()) {
            TakeOutcome::Copied(n) => {
                drop(inner);
                self.shared.wake.notify_one();
                Ok(n)
            },
            TakeOutcome::TooSmall(required) => Err(ClientError::BufferTooSmall {
                required,
                available: out.len(),
            }),
            TakeOutcome::Empty => Err(ClientError::NoCorrectionData),
        }
    }

    async fn read_snapshot(&self, wait: Duration) -> Snapshot {
        match timeout(wait, self.shared.inner.lock()).await {
            Ok(inner) => inner
                .session
                .as_ref()
                .map(NtripSession::snapshot)
                .unwrap_or(Snapshot::UNINIT),
            Err(_) => {
                warn!("Failed to get session lock");
                Snapshot::BUSY
            },
        }
    }

    /// Current state, or [NtripState::Busy] if the lock is contended
    pub async fn state(&self) -> NtripState {
        self.read_snapshot(STATE_LOCK_WAIT).await.state
    }

    /// Detailed error, or [NtripDetailedError::Busy] if the lock is contended
    pub async fn detailed_error(&self) -> NtripDetailedError {
        let error = self.read_snapshot(ERROR_LOCK_WAIT).await.error;
        if error != NtripDetailedError::None {
            debug!("Detailed error -> {}", error);
        }
        error
    }

    /// State and detailed error read together
    pub async fn snapshot(&self) -> Snapshot {
        self.read_snapshot(STATE_LOCK_WAIT).await
    }

    /// True while a connected caster stream is held
    pub async fn is_socket_valid(&self) -> bool {
        let inner = self.shared.inner.lock().await;
        inner.session.as_ref().is_some_and(NtripSession::socket_valid)
    }

    /// Stops the poller, closes the socket and clears configuration.
    ///
    /// The state reads [NtripState::Uninit] afterwards.
    pub async fn deinit(&mut self) -> Result<(), ClientError> {
        let closed = self.teardown().await;
        self.config = None;
        self.creds = None;
        closed
    }

    async fn teardown(&mut self) -> Result<(), ClientError> {
        let reader = match self.poller.take() {
            Some(poller) => {
                let _ = poller.shutdown.send(true);
                self.shared.wake.notify_one();
                match poller.handle.await {
                    Ok(reader) => Some(reader),
                    Err(e) => {
                        error!("NTRIP task ended abnormally: {}", e);
                        None
                    },
                }
            },
            None => None,
        };

        let mut inner = self.shared.inner.lock().await;
        inner.session = None;

        match (reader, inner.writer.take()) {
            (Some(reader), Some(writer)) => {
                let mut stream = reader.unsplit(writer);
                stream.shutdown().await.map_err(|e| {
                    warn!("Error closing socket: {}", e);
                    ClientError::Io(e)
                })
            },
            _ => Ok(()),
        }
    }
}

impl Drop for NtripClient {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            let _ = poller.shutdown.send(true);
            poller.handle.abort();
        }
    }
}

/// Background task: reads the caster while [NtripState::Ready] and enforces
/// the session deadlines, sleeping until something can change.
async fn poll_loop(
    shared: Arc<Shared>,
    mut reader: ReadHalf<BoxedStream>,
    mut shutdown: watch::Receiver<bool>,
) -> ReadHalf<BoxedStream> {
    let mut buff = vec![0u8; RECEIVE_DATA_SIZE];

    loop {
        if *shutdown.borrow() {
            break;
        }

        let (action, deadline) = {
            let mut inner = shared.inner.lock().await;
            match inner.session.as_mut() {
                Some(session) => {
                    let action = session.poll_timers(Instant::now());
                    (action, session.next_deadline())
                },
                None => break,
            }
        };

        let sleep = async {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        match action {
            PollAction::Read => {
                select! {
                    r = reader.read(&mut buff) => {
                        let outcome = ReadOutcome::from(r);
                        if let ReadOutcome::Data(n) = outcome {
                            trace!("Read {} bytes", n);
                        }
                        let mut inner = shared.inner.lock().await;
                        if let Some(session) = inner.session.as_mut() {
                            session.on_read(outcome, &buff, Instant::now());
                        }
                    },
                    _ = sleep => {},
                    _ = shared.wake.notified() => {},
                    _ = shutdown.changed() => break,
                }
            },
            PollAction::Wait => {
                select! {
                    _ = sleep => {},
                    _ = shared.wake.notified() => {},
                    _ = shutdown.changed() => break,
                }
            },
        }
    }

    debug!("NTRIP poll loop exiting");
    reader
}
