//! NTRIP session state machine
//!
//! [NtripSession] holds everything the background poller and the
//! application task share: current state, detailed error, timestamps and
//! the last captured correction chunk. It performs no I/O; the
//! [NtripClient](crate::NtripClient) feeds it read/write outcomes and the
//! current time, always while holding the session lock.

use std::{io, time::Duration};

use strum::{Display, EnumString};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A state waiting on an external actor fails after this long
pub const FSM_TIMEOUT: Duration = Duration::from_secs(30);

/// Period between GGA requests, for casters that need them
pub const GGA_INTERVAL: Duration = Duration::from_secs(20);

/// Largest correction chunk captured per read
pub const RECEIVE_DATA_SIZE: usize = 2 * 1024;

/// NTRIP client states
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, EnumString)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NtripState {
    /// No session has been initialised
    Uninit,
    /// Connected, waiting for correction data
    Ready,
    /// The caster expects a GGA report, see [NtripClient::send_gga](crate::NtripClient::send_gga)
    RequestGga,
    /// A correction chunk is waiting to be fetched
    CorrectionDataAvailable,
    /// The caster closed or reset the connection
    ConnectionReset,
    /// Terminal until the client is initialised again
    Error,
    /// The session lock was contended; never stored
    Busy,
}

/// Detailed NTRIP client errors
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, EnumString)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NtripDetailedError {
    None,
    Unknown,
    Busy,
    ConnectionReset,
    BufferTooSmall,
    NoGgaTimeout,
    CorrDataTimeout,
    SocketError,
    TaskCreateFailed,
    LockError,
}

/// `(state, error)` pair read under a single lock acquisition
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Snapshot {
    pub state: NtripState,
    pub error: NtripDetailedError,
}

impl Snapshot {
    pub(crate) const BUSY: Snapshot = Snapshot {
        state: NtripState::Busy,
        error: NtripDetailedError::Busy,
    };

    pub(crate) const UNINIT: Snapshot = Snapshot {
        state: NtripState::Uninit,
        error: NtripDetailedError::None,
    };
}

/// What the poller should do next
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PollAction {
    /// Read from the caster
    Read,
    /// Wait for the next deadline or a wake up
    Wait,
}

/// Result of a read attempt on the caster stream
#[derive(Debug)]
pub enum ReadOutcome {
    /// Bytes were read into the supplied buffer
    Data(usize),
    /// Nothing to read yet
    Idle,
    /// The caster closed the stream (zero-length read)
    Closed,
    Failed(io::Error),
}

impl From<io::Result<usize>> for ReadOutcome {
    fn from(r: io::Result<usize>) -> Self {
        match r {
            Ok(0) => ReadOutcome::Closed,
            Ok(n) => ReadOutcome::Data(n),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                ReadOutcome::Idle
            },
            Err(e) => ReadOutcome::Failed(e),
        }
    }
}

/// Shared NTRIP session state
#[derive(Debug)]
pub struct NtripSession {
    state: NtripState,
    error: NtripDetailedError,
    gga_necessary: bool,
    /// Last GGA sent (or session start)
    last_gga: Instant,
    /// Entry time of the current waiting state
    entered: Instant,
    socket_valid: bool,
    chunk: Vec<u8>,
}

impl NtripSession {
    /// Session for a freshly completed handshake
    pub fn new(gga_necessary: bool, now: Instant) -> Self {
        let state = if gga_necessary {
            NtripState::RequestGga
        } else {
            NtripState::Ready
        };

        Self {
            state,
            error: NtripDetailedError::None,
            gga_necessary,
            last_gga: now,
            entered: now,
            socket_valid: true,
            chunk: Vec::with_capacity(RECEIVE_DATA_SIZE),
        }
    }

    pub fn state(&self) -> NtripState {
        self.state
    }

    pub fn error(&self) -> NtripDetailedError {
        self.error
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state,
            error: self.error,
        }
    }

    pub fn socket_valid(&self) -> bool {
        self.socket_valid
    }

    pub(crate) fn invalidate_socket(&mut self) {
        self.socket_valid = false;
    }

    /// Size of the captured correction chunk, if any is pending
    pub fn pending_len(&self) -> Option<usize> {
        (self.state == NtripState::CorrectionDataAvailable).then_some(self.chunk.len())
    }

    fn enter(&mut self, state: NtripState, now: Instant) {
        if self.state != state {
            debug!("NTRIP state {} -> {}", self.state, state);
        }
        self.state = state;
        self.entered = now;
    }

    pub(crate) fn fail(&mut self, error: NtripDetailedError, now: Instant) {
        error!("NTRIP session error: {}", error);
        self.enter(NtripState::Error, now);
        self.error = error;
    }

    /// Timer driven part of the poller tick
    pub fn poll_timers(&mut self, now: Instant) -> PollAction {
        match self.state {
            NtripState::Ready => {
                self.error = NtripDetailedError::None;

                if self.gga_necessary && now.duration_since(self.last_gga) >= GGA_INTERVAL {
                    info!("Requesting GGA from application");
                    self.enter(NtripState::RequestGga, now);
                    PollAction::Wait
                } else {
                    PollAction::Read
                }
            },
            NtripState::RequestGga => {
                if now.duration_since(self.entered) >= FSM_TIMEOUT {
                    self.fail(NtripDetailedError::NoGgaTimeout, now);
                }
                PollAction::Wait
            },
            NtripState::CorrectionDataAvailable => {
                if now.duration_since(self.entered) >= FSM_TIMEOUT {
                    self.fail(NtripDetailedError::CorrDataTimeout, now);
                }
                PollAction::Wait
            },
            _ => PollAction::Wait,
        }
    }

    /// Instant at which [Self::poll_timers] will next change something
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            NtripState::Ready if self.gga_necessary => Some(self.last_gga + GGA_INTERVAL),
            NtripState::RequestGga | NtripState::CorrectionDataAvailable => {
                Some(self.entered + FSM_TIMEOUT)
            },
            _ => None,
        }
    }

    /// Applies a read performed while in [NtripState::Ready]
    pub fn on_read(&mut self, outcome: ReadOutcome, data: &[u8], now: Instant) {
        if self.state != NtripState::Ready {
            if let ReadOutcome::Data(n) = outcome {
                warn!("Discarding {} bytes read in state {}", n, self.state);
            }
            return;
        }

        match outcome {
            ReadOutcome::Data(n) => {
                let n = n.min(data.len()).min(RECEIVE_DATA_SIZE);
                self.chunk.clear();
                self.chunk.extend_from_slice(&data[..n]);
                debug!("Captured {} bytes of correction data", n);
                self.enter(NtripState::CorrectionDataAvailable, now);
            },
            ReadOutcome::Idle => {},
            ReadOutcome::Closed => {
                warn!("Caster closed the connection");
                self.enter(NtripState::ConnectionReset, now);
                self.error = NtripDetailedError::ConnectionReset;
            },
            ReadOutcome::Failed(e) => match e.kind() {
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe => {
                    warn!("Connection reset: {}", e);
                    self.enter(NtripState::ConnectionReset, now);
                    self.error = NtripDetailedError::ConnectionReset;
                },
                _ => {
                    error!("Failed to get correction data: {}", e);
                    self.fail(NtripDetailedError::SocketError, now);
                },
            },
        }
    }

    /// Applies the outcome of a GGA write of `expected` bytes
    pub fn on_gga_written(&mut self, written: io::Result<usize>, expected: usize, now: Instant) {
        match written {
            Ok(n) if n == expected => {
                info!("Sent GGA message to caster [{}] bytes", n);
                self.last_gga = now;
                self.enter(NtripState::Ready, now);
            },
            Ok(n) => {
                error!("Partial GGA write, {} of {} bytes", n, expected);
                self.fail(NtripDetailedError::SocketError, now);
            },
            Err(e) => {
                error!("Error while sending GGA message: {}", e);
                self.fail(NtripDetailedError::SocketError, now);
            },
        }
    }

    /// Copies the pending chunk into `out` and returns to [NtripState::Ready].
    ///
    /// Nothing is copied when `out` cannot hold the whole chunk.
    pub fn take_correction(&mut self, out: &mut [u8], now: Instant) -> TakeOutcome {
        let Some(len) = self.pending_len() else {
            return TakeOutcome::Empty;
        };

        if out.len() < len {
            warn!("Buffer provided is too small ({} < {})", out.len(), len);
            self.error = NtripDetailedError::BufferTooSmall;
            return TakeOutcome::TooSmall(len);
        }

        out[..len].copy_from_slice(&self.chunk);
        self.chunk.clear();
        self.enter(NtripState::Ready, now);
        TakeOutcome::Copied(len)
    }
}

/// Outcome of [NtripSession::take_correction]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TakeOutcome {
    Copied(usize),
    /// Required size
    TooSmall(usize),
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_logging() {
        let _ = tracing_subscriber::FmtSubscriber::builder()
            .compact()
            .without_time()
            .with_max_level(tracing::level_filters::LevelFilter::DEBUG)
            .try_init();
    }

    #[test]
    fn starts_in_ready_or_request_gga() {
        let now = Instant::now();
        assert_eq!(NtripSession::new(false, now).state(), NtripState::Ready);
        assert_eq!(NtripSession::new(true, now).state(), NtripState::RequestGga);
        assert!(NtripSession::new(true, now).socket_valid());
    }

    #[test]
    fn no_gga_timeout() {
        setup_logging();

        let t0 = Instant::now();
        let mut s = NtripSession::new(true, t0);

        assert_eq!(s.poll_timers(t0 + Duration::from_secs(29)), PollAction::Wait);
        assert_eq!(s.state(), NtripState::RequestGga);

        s.poll_timers(t0 + Duration::from_secs(31));
        assert_eq!(
            s.snapshot(),
            Snapshot {
                state: NtripState::Error,
                error: NtripDetailedError::NoGgaTimeout
            }
        );
        assert_eq!(s.next_deadline(), None);
    }

    #[test]
    fn gga_cadence() {
        let t0 = Instant::now();
        let mut s = NtripSession::new(true, t0);

        s.on_gga_written(Ok(10), 10, t0 + Duration::from_secs(1));
        assert_eq!(s.state(), NtripState::Ready);
        assert_eq!(s.next_deadline(), Some(t0 + Duration::from_secs(21)));

        assert_eq!(s.poll_timers(t0 + Duration::from_secs(5)), PollAction::Read);
        assert_eq!(s.poll_timers(t0 + Duration::from_secs(21)), PollAction::Wait);
        assert_eq!(s.state(), NtripState::RequestGga);
    }

    #[test]
    fn partial_gga_write_is_socket_error() {
        let t0 = Instant::now();
        let mut s = NtripSession::new(true, t0);
        s.on_gga_written(Ok(3), 10, t0);
        assert_eq!(s.state(), NtripState::Error);
        assert_eq!(s.error(), NtripDetailedError::SocketError);
    }

    #[test]
    fn read_transitions() {
        let t0 = Instant::now();
        let mut s = NtripSession::new(false, t0);

        s.on_read(ReadOutcome::Idle, &[], t0);
        assert_eq!(s.state(), NtripState::Ready);

        s.on_read(ReadOutcome::Data(3), &[0xd3, 0x00, 0x13], t0);
        assert_eq!(s.state(), NtripState::CorrectionDataAvailable);
        assert_eq!(s.pending_len(), Some(3));

        // Data is not overwritten until taken
        s.on_read(ReadOutcome::Data(1), &[0xff], t0);
        assert_eq!(s.pending_len(), Some(3));

        let mut out = [0u8; 8];
        assert_eq!(s.take_correction(&mut out, t0), TakeOutcome::Copied(3));
        assert_eq!(&out[..3], &[0xd3, 0x00, 0x13]);
        assert_eq!(s.state(), NtripState::Ready);
        assert_eq!(s.take_correction(&mut out, t0), TakeOutcome::Empty);
    }

    #[test]
    fn read_errors() {
        let t0 = Instant::now();

        let mut s = NtripSession::new(false, t0);
        s.on_read(ReadOutcome::Closed, &[], t0);
        assert_eq!(s.state(), NtripState::ConnectionReset);
        assert_eq!(s.error(), NtripDetailedError::ConnectionReset);

        let mut s = NtripSession::new(false, t0);
        s.on_read(
            io::Result::<usize>::Err(io::ErrorKind::ConnectionReset.into()).into(),
            &[],
            t0,
        );
        assert_eq!(s.state(), NtripState::ConnectionReset);

        let mut s = NtripSession::new(false, t0);
        s.on_read(
            io::Result::<usize>::Err(io::ErrorKind::WouldBlock.into()).into(),
            &[],
            t0,
        );
        assert_eq!(s.state(), NtripState::Ready);

        let mut s = NtripSession::new(false, t0);
        s.on_read(
            ReadOutcome::Failed(io::Error::new(io::ErrorKind::Other, "boom")),
            &[],
            t0,
        );
        assert_eq!(
            s.snapshot(),
            Snapshot {
                state: NtripState::Error,
                error: NtripDetailedError::SocketError
            }
        );
    }

    #[test]
    fn correction_data_timeout() {
        let t0 = Instant::now();
        let mut s = NtripSession::new(false, t0);
        s.on_read(ReadOutcome::Data(2), &[1, 2], t0);

        s.poll_timers(t0 + FSM_TIMEOUT);
        assert_eq!(s.state(), NtripState::Error);
        assert_eq!(s.error(), NtripDetailedError::CorrDataTimeout);
    }

    #[test]
    fn undersized_buffer_never_copies() {
        let t0 = Instant::now();
        let mut s = NtripSession::new(false, t0);
        let data = [7u8; 64];
        s.on_read(ReadOutcome::Data(64), &data, t0);

        let mut out = [0u8; 63];
        assert_eq!(s.take_correction(&mut out, t0), TakeOutcome::TooSmall(64));
        assert!(out.iter().all(|b| *b == 0));
        assert_eq!(s.state(), NtripState::CorrectionDataAvailable);
        assert_eq!(s.error(), NtripDetailedError::BufferTooSmall);

        // Ready tick clears the detailed error once the chunk is taken
        let mut out = [0u8; 64];
        assert_eq!(s.take_correction(&mut out, t0), TakeOutcome::Copied(64));
        s.poll_timers(t0);
        assert_eq!(s.error(), NtripDetailedError::None);
    }
}
