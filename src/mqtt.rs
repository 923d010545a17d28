//! MQTT session state machine
//!
//! [MqttClient] drives a [BrokerEngine] through its connection lifecycle.
//! The engine reports back through an [EventSink]; control events are
//! applied under the client lock whenever the client is used, data chunks
//! are collected in the reassembly queue and stitched by
//! [MqttClient::receive_item].

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use strum::Display;
use tokio::{
    sync::{
        mpsc::{self, error::TryRecvError},
        Notify,
    },
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::{MqttConfig, QoS},
    engine::{BrokerEngine, EngineEvent, EventSink},
    reassembly::{ItemStatus, MqttPayload, ReassemblyItem, Reassembler},
    ClientError, Result,
};

/// Time allowed in [MqttState::Wait] before giving up
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// MQTT session states
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Display)]
pub enum MqttState {
    #[default]
    Uninit,
    Config,
    RegisterEvent,
    Start,
    Reconnect,
    Wait,
    Connected,
    Subscribed,
    DisconnectRequested,
    HardDisconnectRequested,
    DisconnectedOk,
    Timeout,
    Error,
}

/// Current and previous [MqttState]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Transition {
    pub current: MqttState,
    pub previous: MqttState,
}

impl Transition {
    fn advance(&mut self, next: MqttState) {
        debug!("MQTT {} -> {}", self.current, next);
        self.previous = self.current;
        self.current = next;
    }
}

#[derive(Debug)]
struct Watchdog {
    timeout: Duration,
    last_message: Instant,
}

impl Watchdog {
    fn feed(&mut self, now: Instant) {
        self.last_message = now;
    }

    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_message) >= self.timeout
    }
}

struct Inner<E> {
    engine: Option<E>,
    transition: Transition,
    connected: bool,
    /// When the current state was entered
    entered: Instant,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    items: Option<mpsc::Receiver<ReassemblyItem>>,
    sink: EventSink,
    reassembler: Reassembler,
    watchdog: Option<Watchdog>,
}

impl<E: BrokerEngine> Inner<E> {
    fn advance(&mut self, next: MqttState) {
        self.transition.advance(next);
        self.entered = Instant::now();
    }

    /// Applies engine events queued since the last call
    fn apply_events(&mut self) {
        loop {
            let event = match self.events.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return,
            };

            match event {
                EngineEvent::Connected => {
                    info!("MQTT broker connected");
                    self.connected = true;
                    self.advance(MqttState::Connected);
                },
                EngineEvent::Disconnected => {
                    self.connected = false;
                    if self.transition.current == MqttState::Wait
                        && self.transition.previous == MqttState::DisconnectRequested
                    {
                        info!("MQTT broker disconnected");
                        self.advance(MqttState::DisconnectedOk);
                    } else {
                        warn!("MQTT broker connection lost");
                    }
                },
                EngineEvent::Error(reason) => {
                    error!("MQTT engine error: {}", reason);
                    self.advance(MqttState::Error);
                },
                EngineEvent::Subscribed { msg_id } => debug!("Subscription {} acknowledged", msg_id),
                EngineEvent::Unsubscribed { msg_id } => {
                    debug!("Unsubscription {} acknowledged", msg_id)
                },
                EngineEvent::Published { msg_id } => debug!("Publish {} acknowledged", msg_id),
                // Data goes through the reassembly queue
                EngineEvent::Data(_) => {},
            }
        }
    }

    fn engine(&mut self) -> Result<&mut E> {
        self.engine.as_mut().ok_or(ClientError::NotInitialized)
    }

    /// Runs an engine call, moving to [MqttState::Error] on failure
    fn call<T>(
        &mut self,
        f: impl FnOnce(&mut E) -> std::result::Result<T, crate::engine::EngineError>,
    ) -> Result<T> {
        let result = f(self.engine()?);
        result.map_err(|e| {
            error!("MQTT engine call failed: {}", e);
            self.advance(MqttState::Error);
            ClientError::Engine(e)
        })
    }

    fn hard_disconnect(&mut self) -> Result<()> {
        let Some(mut engine) = self.engine.take() else {
            return Err(ClientError::NotInitialized);
        };

        self.advance(MqttState::HardDisconnectRequested);

        if let Err(e) = engine.stop() {
            warn!("MQTT engine stop failed: {}", e);
        }
        if let Err(e) = engine.destroy() {
            warn!("MQTT engine destroy failed: {}", e);
        }

        self.items = None;
        self.connected = false;
        self.advance(MqttState::DisconnectedOk);

        info!("MQTT client hard disconnected");
        Ok(())
    }
}

/// MQTT correction data session
pub struct MqttClient<E: BrokerEngine> {
    config: MqttConfig,
    inner: Mutex<Inner<E>>,
    notify: Arc<Notify>,
}

fn sink_with_queue(
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    config: &MqttConfig,
    slots: usize,
    notify: Arc<Notify>,
) -> (EventSink, mpsc::Receiver<ReassemblyItem>) {
    let (items_tx, items_rx) = mpsc::channel(slots);
    let sink = EventSink::new(events_tx, items_tx, config.chunk_capacity, notify);
    (sink, items_rx)
}

impl<E: BrokerEngine> MqttClient<E> {
    /// Validates the configuration, prepares the engine and creates the
    /// reassembly queue. The session starts in [MqttState::Uninit].
    pub fn new(config: MqttConfig, mut engine: E) -> Result<Self> {
        config.validate()?;
        engine.init(&config)?;

        let notify = Arc::new(Notify::new());
        let (events_tx, events) = mpsc::unbounded_channel();
        let (sink, items) =
            sink_with_queue(events_tx.clone(), &config, config.queue_slots, notify.clone());

        let now = Instant::now();
        let watchdog = config.enable_watchdog.then(|| Watchdog {
            timeout: config.message_timeout(),
            last_message: now,
        });

        debug!(
            "MQTT client for {}:{} ({} byte chunks, {} queue slots)",
            config.host, config.port, config.chunk_capacity, config.queue_slots
        );

        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                engine: Some(engine),
                transition: Transition::default(),
                connected: false,
                entered: now,
                events,
                events_tx,
                items: Some(items),
                sink,
                reassembler: Reassembler::new(),
                watchdog,
            }),
            notify,
        })
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner<E>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.apply_events();
        inner
    }

    /// Resizes the reassembly queue; only possible before [MqttClient::start]
    pub fn set_queue_slots(&self, count: usize) -> Result<()> {
        let mut inner = self.lock();

        if inner.transition.current != MqttState::Uninit {
            return Err(ClientError::ConfigLocked);
        }
        if inner.engine.is_none() {
            return Err(ClientError::NotInitialized);
        }

        let slots = if count <= 1 {
            warn!("Queue slot count {} too small, using 1", count);
            1
        } else {
            count
        };

        let (sink, items) =
            sink_with_queue(inner.events_tx.clone(), &self.config, slots, self.notify.clone());
        inner.sink = sink;
        inner.items = Some(items);
        Ok(())
    }

    /// Begins connecting on the next [MqttClient::fsm] ticks
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.engine()?;

        match inner.transition.current {
            MqttState::Uninit | MqttState::DisconnectedOk | MqttState::Error | MqttState::Timeout => {
                inner.advance(MqttState::Config);
                Ok(())
            },
            state => {
                warn!("MQTT client already running ({})", state);
                Err(ClientError::InvalidArgument("client already running"))
            },
        }
    }

    /// Advances the session by one step and returns the resulting state
    pub fn fsm(&self) -> Result<MqttState> {
        let mut inner = self.lock();

        match inner.transition.current {
            MqttState::Config => inner.advance(MqttState::RegisterEvent),
            MqttState::RegisterEvent => {
                let sink = inner.sink.clone();
                inner.call(|e| e.register_events(sink))?;
                inner.advance(MqttState::Start);
            },
            MqttState::Start => {
                inner.call(|e| e.start())?;
                info!("MQTT engine started for {}", self.config.host);
                inner.advance(MqttState::Wait);
            },
            MqttState::Reconnect => {
                inner.call(|e| e.reconnect())?;
                inner.advance(MqttState::Wait);
            },
            MqttState::DisconnectRequested => {
                inner.call(|e| e.disconnect())?;
                inner.advance(MqttState::Wait);
            },
            MqttState::HardDisconnectRequested => inner.hard_disconnect()?,
            MqttState::Wait => {
                if inner.entered.elapsed() >= WAIT_TIMEOUT {
                    warn!("No broker response within {:?}", WAIT_TIMEOUT);
                    inner.advance(MqttState::Timeout);
                }
            },
            _ => {},
        }

        Ok(inner.transition.current)
    }

    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<u16> {
        if topic.is_empty() {
            return Err(ClientError::InvalidArgument("empty topic"));
        }

        let mut inner = self.lock();
        inner.engine()?;

        let state = inner.transition.current;
        if !matches!(state, MqttState::Connected | MqttState::Subscribed) {
            warn!("Cannot subscribe to {} in state {}", topic, state);
            return Err(ClientError::InvalidArgument("not connected to broker"));
        }

        let msg_id = inner.engine()?.subscribe(topic, qos)?;

        info!("Subscribed to {} ({}, QoS {})", topic, msg_id, qos);

        if state != MqttState::Subscribed {
            inner.advance(MqttState::Subscribed);
        }
        if let Some(watchdog) = inner.watchdog.as_mut() {
            watchdog.feed(Instant::now());
        }
        Ok(msg_id)
    }

    /// Subscribes to every topic, stopping at the first failure
    pub fn subscribe_many(&self, topics: &[&str], qos: QoS) -> Result<()> {
        if topics.is_empty() {
            return Err(ClientError::InvalidArgument("no topics"));
        }
        for topic in topics {
            self.subscribe(topic, qos)?;
        }
        Ok(())
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<()> {
        if topic.is_empty() {
            return Err(ClientError::InvalidArgument("empty topic"));
        }

        let msg_id = self.lock().engine()?.unsubscribe(topic)?;
        info!("Unsubscribed from {} ({})", topic, msg_id);
        Ok(())
    }

    pub fn unsubscribe_many(&self, topics: &[&str]) -> Result<()> {
        if topics.is_empty() {
            return Err(ClientError::InvalidArgument("no topics"));
        }
        for topic in topics {
            self.unsubscribe(topic)?;
        }
        Ok(())
    }

    /// Queues a publish and returns its message id
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<u16> {
        if topic.is_empty() {
            return Err(ClientError::InvalidArgument("empty topic"));
        }
        if payload.is_empty() {
            return Err(ClientError::InvalidArgument("empty payload"));
        }

        let msg_id = self
            .lock()
            .engine()?
            .enqueue(topic, payload, qos, retain, true)?;
        debug!("Queued {} bytes on {} ({})", payload.len(), topic, msg_id);
        Ok(msg_id)
    }

    /// Requests a graceful disconnect, performed on the next tick
    pub fn disconnect(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.engine()?;
        inner.advance(MqttState::DisconnectRequested);
        Ok(())
    }

    /// Requests a reconnect, performed on the next tick
    pub fn reconnect(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.engine()?;
        inner.advance(MqttState::Reconnect);
        Ok(())
    }

    /// Stops and releases the engine and drops the reassembly queue.
    ///
    /// Later operations fail with [ClientError::NotInitialized].
    pub fn hard_disconnect(&self) -> Result<()> {
        self.lock().hard_disconnect()
    }

    /// Pops one queued item and stitches it into `reply`
    pub fn receive_item(&self, reply: &mut MqttPayload) -> ItemStatus {
        let mut inner = self.lock();

        let popped = match inner.items.as_mut() {
            Some(items) => items.try_recv(),
            None => return ItemStatus::NoItem,
        };

        match popped {
            Ok(item) => {
                let status = inner.reassembler.stitch(item, reply);
                if status == ItemStatus::Ok {
                    if let Some(watchdog) = inner.watchdog.as_mut() {
                        watchdog.feed(Instant::now());
                    }
                }
                status
            },
            Err(TryRecvError::Empty) => {
                let expired = inner
                    .watchdog
                    .as_ref()
                    .is_some_and(|w| w.expired(Instant::now()));

                if expired {
                    warn!(
                        "No complete message within {:?}, hard disconnecting",
                        self.config.message_timeout()
                    );
                    if let Err(e) = inner.hard_disconnect() {
                        error!("Watchdog disconnect failed: {}", e);
                    }
                }
                ItemStatus::NoItem
            },
            Err(TryRecvError::Disconnected) => ItemStatus::NoItem,
        }
    }

    /// Restarts the message watchdog period
    pub fn feed_watchdog(&self) {
        if let Some(watchdog) = self.lock().watchdog.as_mut() {
            watchdog.feed(Instant::now());
        }
    }

    /// Waits until the engine reports an event or queues data
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn current_state(&self) -> MqttState {
        self.lock().transition.current
    }

    pub fn previous_state(&self) -> MqttState {
        self.lock().transition.previous
    }

    pub fn transition(&self) -> Transition {
        self.lock().transition
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{DataChunk, EngineError};

    use super::*;

    #[derive(Default)]
    struct EngineLog {
        calls: Vec<String>,
        sink: Option<EventSink>,
        fail: Option<&'static str>,
        next_id: u16,
    }

    /// In-memory engine recording every call
    #[derive(Clone, Default)]
    struct MockEngine {
        log: Arc<Mutex<EngineLog>>,
    }

    impl MockEngine {
        fn record(&self, call: &'static str) -> std::result::Result<u16, EngineError> {
            let mut log = self.log.lock().unwrap();
            log.calls.push(call.to_string());
            if log.fail == Some(call) {
                return Err(EngineError::Rejected(call));
            }
            log.next_id += 1;
            Ok(log.next_id)
        }

        fn calls(&self) -> Vec<String> {
            self.log.lock().unwrap().calls.clone()
        }

        fn fail_on(&self, call: &'static str) {
            self.log.lock().unwrap().fail = Some(call);
        }

        fn sink(&self) -> EventSink {
            self.log.lock().unwrap().sink.clone().unwrap()
        }
    }

    impl BrokerEngine for MockEngine {
        fn init(&mut self, _config: &MqttConfig) -> std::result::Result<(), EngineError> {
            self.record("init").map(|_| ())
        }

        fn register_events(&mut self, sink: EventSink) -> std::result::Result<(), EngineError> {
            self.record("register_events")?;
            self.log.lock().unwrap().sink = Some(sink);
            Ok(())
        }

        fn start(&mut self) -> std::result::Result<(), EngineError> {
            self.record("start").map(|_| ())
        }

        fn reconnect(&mut self) -> std::result::Result<(), EngineError> {
            self.record("reconnect").map(|_| ())
        }

        fn disconnect(&mut self) -> std::result::Result<(), EngineError> {
            self.record("disconnect").map(|_| ())
        }

        fn stop(&mut self) -> std::result::Result<(), EngineError> {
            self.record("stop").map(|_| ())
        }

        fn destroy(&mut self) -> std::result::Result<(), EngineError> {
            self.record("destroy").map(|_| ())
        }

        fn subscribe(&mut self, _topic: &str, _qos: QoS) -> std::result::Result<u16, EngineError> {
            self.record("subscribe")
        }

        fn unsubscribe(&mut self, _topic: &str) -> std::result::Result<u16, EngineError> {
            self.record("unsubscribe")
        }

        fn enqueue(
            &mut self,
            _topic: &str,
            _payload: &[u8],
            _qos: QoS,
            retain: bool,
            store: bool,
        ) -> std::result::Result<u16, EngineError> {
            assert!(store);
            self.record(if retain { "enqueue_retained" } else { "enqueue" })
        }
    }

    fn config() -> MqttConfig {
        MqttConfig::new("broker.example.org", 8883).with_client_id("test")
    }

    /// Runs the client up to [MqttState::Wait]
    fn started(config: MqttConfig) -> (MqttClient<MockEngine>, MockEngine) {
        let engine = MockEngine::default();
        let client = MqttClient::new(config, engine.clone()).unwrap();

        client.start().unwrap();
        assert_eq!(client.fsm().unwrap(), MqttState::RegisterEvent);
        assert_eq!(client.fsm().unwrap(), MqttState::Start);
        assert_eq!(client.fsm().unwrap(), MqttState::Wait);

        (client, engine)
    }

    #[test]
    fn new_rejects_invalid_config() {
        assert!(matches!(
            MqttClient::new(MqttConfig::default(), MockEngine::default()),
            Err(ClientError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn connects_through_states() {
        let (client, engine) = started(config());

        assert_eq!(
            engine.calls(),
            vec!["init", "register_events", "start"]
        );
        assert!(!client.is_connected());

        engine.sink().deliver(EngineEvent::Connected).await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.current_state(), MqttState::Connected);
        assert_eq!(client.previous_state(), MqttState::Wait);

        client.subscribe("corrections/eu", QoS::AtLeastOnce).unwrap();
        assert_eq!(client.current_state(), MqttState::Subscribed);

        // A second start while running is refused
        assert!(client.start().is_err());
    }

    #[tokio::test]
    async fn engine_failure_moves_to_error() {
        let engine = MockEngine::default();
        engine.fail_on("start");
        let client = MqttClient::new(config(), engine.clone()).unwrap();

        client.start().unwrap();
        client.fsm().unwrap();
        client.fsm().unwrap();
        assert!(matches!(client.fsm(), Err(ClientError::Engine(_))));
        assert_eq!(client.current_state(), MqttState::Error);

        // Error allows a restart
        client.start().unwrap();
        assert_eq!(client.current_state(), MqttState::Config);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let (client, _engine) = started(config());

        tokio::time::advance(WAIT_TIMEOUT - Duration::from_secs(1)).await;
        assert_eq!(client.fsm().unwrap(), MqttState::Wait);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(client.fsm().unwrap(), MqttState::Timeout);
    }

    #[tokio::test]
    async fn graceful_disconnect() {
        let (client, engine) = started(config());
        let sink = engine.sink();
        sink.deliver(EngineEvent::Connected).await.unwrap();

        client.disconnect().unwrap();
        assert_eq!(client.fsm().unwrap(), MqttState::Wait);
        assert_eq!(client.previous_state(), MqttState::DisconnectRequested);

        sink.deliver(EngineEvent::Disconnected).await.unwrap();
        assert_eq!(client.current_state(), MqttState::DisconnectedOk);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn unexpected_disconnect_only_clears_flag() {
        let (client, engine) = started(config());
        let sink = engine.sink();
        sink.deliver(EngineEvent::Connected).await.unwrap();
        client.subscribe("t", QoS::AtMostOnce).unwrap();

        sink.deliver(EngineEvent::Disconnected).await.unwrap();
        assert!(!client.is_connected());
        assert_eq!(client.current_state(), MqttState::Subscribed);

        sink.deliver(EngineEvent::Error("tls".to_string()))
            .await
            .unwrap();
        assert_eq!(client.current_state(), MqttState::Error);
    }

    #[tokio::test]
    async fn reconnect_calls_engine() {
        let (client, engine) = started(config());

        client.reconnect().unwrap();
        assert_eq!(client.fsm().unwrap(), MqttState::Wait);
        assert_eq!(engine.calls().last().unwrap(), "reconnect");
    }

    #[test]
    fn argument_checks() {
        let client = MqttClient::new(config(), MockEngine::default()).unwrap();

        assert!(matches!(
            client.subscribe("", QoS::AtMostOnce),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.publish("t", b"", QoS::AtMostOnce, false),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(client.subscribe_many(&[], QoS::AtMostOnce).is_err());
        assert!(client.unsubscribe_many(&[]).is_err());
    }

    #[tokio::test]
    async fn pass_throughs_reach_engine() {
        let (client, engine) = started(config());
        engine.sink().deliver(EngineEvent::Connected).await.unwrap();

        client
            .subscribe_many(&["a", "b"], QoS::ExactlyOnce)
            .unwrap();
        client.unsubscribe_many(&["a", "b"]).unwrap();
        client.publish("c", b"x", QoS::AtMostOnce, true).unwrap();

        assert_eq!(
            engine.calls()[3..],
            [
                "subscribe",
                "subscribe",
                "unsubscribe",
                "unsubscribe",
                "enqueue_retained"
            ]
        );

        engine.fail_on("unsubscribe");
        assert!(matches!(
            client.unsubscribe("a"),
            Err(ClientError::Engine(EngineError::Rejected("unsubscribe")))
        ));
    }

    #[tokio::test]
    async fn receives_segmented_message() {
        let cfg = MqttConfig {
            chunk_capacity: 16,
            ..config()
        };
        let (client, engine) = started(cfg);
        let sink = engine.sink();

        let payload: Vec<u8> = (0..40u8).collect();
        for chunk in DataChunk::split("corr", &payload, 16) {
            sink.deliver(EngineEvent::Data(chunk)).await.unwrap();
        }

        let mut reply = MqttPayload::with_capacity(64);
        assert_eq!(client.receive_item(&mut reply), ItemStatus::Fetching);
        assert_eq!(client.receive_item(&mut reply), ItemStatus::Fetching);
        assert_eq!(client.receive_item(&mut reply), ItemStatus::Ok);
        assert_eq!(client.receive_item(&mut reply), ItemStatus::NoItem);

        assert_eq!(reply.topic, "corr");
        assert_eq!(reply.data(), payload.as_slice());
    }

    #[tokio::test]
    async fn hard_disconnect_releases_engine() {
        let (client, engine) = started(config());
        let sink = engine.sink();

        client.hard_disconnect().unwrap();
        assert_eq!(client.current_state(), MqttState::DisconnectedOk);
        assert_eq!(client.previous_state(), MqttState::HardDisconnectRequested);
        assert!(engine.calls().ends_with(&["stop".to_string(), "destroy".to_string()]));

        assert!(matches!(
            client.subscribe("t", QoS::AtMostOnce),
            Err(ClientError::NotInitialized)
        ));
        assert!(matches!(client.start(), Err(ClientError::NotInitialized)));

        let chunk = DataChunk::split("t", b"late", 16).remove(0);
        assert!(matches!(
            sink.deliver(EngineEvent::Data(chunk)).await,
            Err(ClientError::NotInitialized)
        ));

        let mut reply = MqttPayload::with_capacity(8);
        assert_eq!(client.receive_item(&mut reply), ItemStatus::NoItem);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_hard_disconnects_idle_session() {
        let (client, engine) = started(config().with_watchdog(Duration::from_secs(10)));
        let sink = engine.sink();
        let mut reply = MqttPayload::with_capacity(64);

        sink.deliver(EngineEvent::Connected).await.unwrap();
        client.subscribe("t", QoS::AtMostOnce).unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        sink.deliver(EngineEvent::Data(DataChunk::split("t", b"rtcm", 16).remove(0)))
            .await
            .unwrap();
        assert_eq!(client.receive_item(&mut reply), ItemStatus::Ok);

        // Fed by the complete message above
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(client.receive_item(&mut reply), ItemStatus::NoItem);
        assert_eq!(client.current_state(), MqttState::Subscribed);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(client.receive_item(&mut reply), ItemStatus::NoItem);
        assert_eq!(client.current_state(), MqttState::DisconnectedOk);
        assert_eq!(engine.calls().last().unwrap(), "destroy");
    }

    #[tokio::test]
    async fn subscribe_requires_connection() {
        let engine = MockEngine::default();
        let client = MqttClient::new(config(), engine.clone()).unwrap();

        assert!(matches!(
            client.subscribe("t", QoS::AtMostOnce),
            Err(ClientError::InvalidArgument(_))
        ));
        assert_eq!(client.current_state(), MqttState::Uninit);

        // The refused subscribe leaves the client startable
        client.start().unwrap();
        while client.fsm().unwrap() != MqttState::Wait {}

        assert!(client.subscribe("t", QoS::AtMostOnce).is_err());
        assert_eq!(client.current_state(), MqttState::Wait);
        assert!(!engine.calls().contains(&"subscribe".to_string()));

        engine.sink().deliver(EngineEvent::Connected).await.unwrap();
        client.subscribe("t", QoS::AtMostOnce).unwrap();
        assert_eq!(client.current_state(), MqttState::Subscribed);
    }

    #[test]
    fn queue_slots_before_start_only() {
        let client = MqttClient::new(config(), MockEngine::default()).unwrap();

        client.set_queue_slots(0).unwrap();
        client.set_queue_slots(4).unwrap();

        client.start().unwrap();
        assert!(matches!(
            client.set_queue_slots(4),
            Err(ClientError::ConfigLocked)
        ));
    }
}
