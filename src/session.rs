use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::SessionConfig;
use crate::contract::{
    Configurable, Consumer, EngineError, EngineFactory, OptionSet, PlaybackError, Producer,
    Profile, ProfileSelection, SessionState,
};
use crate::engine::Engine;

/// Stopped-state is only queryable, so waiting means polling. This is the default
/// period and therefore the worst-case latency between the engine stopping and
/// `wait_until_stopped` returning.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Shorter intervals, including zero, are raised to this floor instead of spinning.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Applies `options` to `handle` in insertion order.
pub fn configure<H>(handle: &mut H, options: &OptionSet) -> Result<(), EngineError>
where
    H: Configurable + ?Sized,
{
    for (key, value) in options.iter() {
        debug!(key, value, "set option");
        handle.set(key, value)?;
    }
    Ok(())
}

/// Drives one producer/consumer pair through connect, start, wait and stop.
///
/// Dropping the session stops the consumer and then releases both handles, whatever
/// state the session reached.
pub struct PlaybackSession<C: Consumer> {
    consumer: C,
    producer: Option<C::Source>,
    state: SessionState,
}

impl<C: Consumer> PlaybackSession<C> {
    #[must_use]
    pub fn new(consumer: C) -> Self {
        Self {
            consumer,
            producer: None,
            state: SessionState::Unconnected,
        }
    }

    /// Opens `source` through the engine, creates a consumer with the resolved profile
    /// and returns an unconnected session owning both.
    pub fn from_config<F>(
        engine: &Engine<F>,
        source: &str,
        config: &SessionConfig,
    ) -> Result<Self, PlaybackError>
    where
        F: EngineFactory<Consumer = C, Producer = C::Source> + 'static,
    {
        let opened = engine.open(source, &config.profile, &config.producer_options)?;
        let consumer = engine.consumer(
            &opened.profile,
            &config.consumer_kind,
            &config.consumer_options,
        )?;
        let mut session = Self::new(consumer);
        session.attach(opened.producer)?;
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn producer(&self) -> Option<&C::Source> {
        self.producer.as_ref()
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    /// Opens and validates `source`, replacing any producer attached earlier.
    /// A failure leaves the session unconnected with its previous producer.
    pub fn open<F>(
        &mut self,
        engine: &Engine<F>,
        source: &str,
        selection: &ProfileSelection,
        options: &OptionSet,
    ) -> Result<Profile, PlaybackError>
    where
        F: EngineFactory<Consumer = C, Producer = C::Source> + 'static,
    {
        self.require(SessionState::Unconnected, "open a source")?;
        let opened = engine.open(source, selection, options)?;
        self.producer = Some(opened.producer);
        Ok(opened.profile)
    }

    pub fn attach(&mut self, producer: C::Source) -> Result<(), PlaybackError> {
        self.require(SessionState::Unconnected, "attach a producer")?;
        self.producer = Some(producer);
        Ok(())
    }

    pub fn configure_producer(&mut self, options: &OptionSet) -> Result<(), PlaybackError> {
        self.require(SessionState::Unconnected, "configure the producer")?;
        let state = self.state;
        let producer = self
            .producer
            .as_mut()
            .ok_or_else(|| no_producer("configure the producer", state))?;
        configure(producer, options)?;
        Ok(())
    }

    pub fn configure_consumer(&mut self, options: &OptionSet) -> Result<(), PlaybackError> {
        self.require(SessionState::Unconnected, "configure the consumer")?;
        configure(&mut self.consumer, options)?;
        Ok(())
    }

    pub fn connect(&mut self) -> Result<(), PlaybackError> {
        self.require(SessionState::Unconnected, "connect")?;
        let producer = self
            .producer
            .as_ref()
            .ok_or_else(|| no_producer("connect", self.state))?;
        if !producer.is_valid() {
            return Err(PlaybackError::ConnectionRejected(
                "producer is not valid".to_string(),
            ));
        }
        self.consumer
            .connect(producer)
            .map_err(|err| PlaybackError::ConnectionRejected(err.to_string()))?;
        self.transition(SessionState::Connected);
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), PlaybackError> {
        self.require(SessionState::Connected, "start")?;
        self.consumer
            .start()
            .map_err(|err| PlaybackError::StartFailure(err.to_string()))?;
        self.transition(SessionState::Running);
        Ok(())
    }

    /// Blocks until the consumer reports stopped or `cancel` fires.
    ///
    /// The stopped flag is checked every `poll_interval`; cancellation wakes the wait
    /// immediately and surfaces as [`PlaybackError::CancelledWait`]. The consumer keeps
    /// running after a cancelled wait until [`stop`](Self::stop) or drop.
    pub fn wait_until_stopped(
        &mut self,
        poll_interval: Duration,
        cancel: &CancelToken,
    ) -> Result<(), PlaybackError> {
        match self.state {
            SessionState::Stopped => return Ok(()),
            SessionState::Running => {}
            state => {
                return Err(PlaybackError::InvalidTransition {
                    op: "wait for playback",
                    state,
                });
            }
        }
        let interval = if poll_interval < MIN_POLL_INTERVAL {
            warn!(?poll_interval, floor = ?MIN_POLL_INTERVAL, "poll interval raised to floor");
            MIN_POLL_INTERVAL
        } else {
            poll_interval
        };

        loop {
            if self.consumer.is_stopped() {
                self.transition(SessionState::Stopped);
                return Ok(());
            }
            if cancel.wait_timeout(interval) {
                info!(state = %self.state, "wait for playback cancelled");
                return Err(PlaybackError::CancelledWait);
            }
        }
    }

    /// Stops the consumer. Safe to call in any state and any number of times.
    pub fn stop(&mut self) {
        self.consumer.stop();
        if self.state != SessionState::Stopped {
            self.transition(SessionState::Stopped);
        }
    }

    pub fn play(&mut self) -> Result<(), PlaybackError> {
        self.require(SessionState::Running, "play")?;
        self.running_producer("play")?.set_speed(1.0)?;
        self.consumer.set("volume", "1")?;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), PlaybackError> {
        self.require(SessionState::Running, "pause")?;
        if self.consumer.is_stopped() {
            return Ok(());
        }
        self.running_producer("pause")?.set_speed(0.0)?;
        self.consumer.set("volume", "0")?;
        Ok(())
    }

    pub fn seek(&mut self, frame: u64) -> Result<(), PlaybackError> {
        self.require(SessionState::Running, "seek")?;
        self.running_producer("seek")?.seek(frame)?;
        Ok(())
    }

    pub fn position(&self) -> u64 {
        self.consumer.position()
    }

    pub fn playtime(&self) -> u64 {
        self.producer.as_ref().map_or(0, |producer| producer.playtime())
    }

    /// Position on a 0..=1000 scale, the range a timeline slider uses.
    pub fn progress_permille(&self) -> u32 {
        let playtime = self.playtime();
        if playtime == 0 {
            return 0;
        }
        let position = self.position().min(playtime);
        (u128::from(position) * 1000 / u128::from(playtime)) as u32
    }

    fn running_producer(&mut self, op: &'static str) -> Result<&mut C::Source, PlaybackError> {
        let state = self.state;
        self.producer.as_mut().ok_or_else(|| no_producer(op, state))
    }

    fn require(&self, expected: SessionState, op: &'static str) -> Result<(), PlaybackError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PlaybackError::InvalidTransition {
                op,
                state: self.state,
            })
        }
    }

    fn transition(&mut self, next: SessionState) {
        info!(from = %self.state, to = %next, "playback session transition");
        self.state = next;
    }
}

// Without a producer the session has nothing to connect, so every producer
// operation is refused as out of order.
fn no_producer(op: &'static str, state: SessionState) -> PlaybackError {
    PlaybackError::InvalidTransition { op, state }
}

impl<C: Consumer> Drop for PlaybackSession<C> {
    fn drop(&mut self) {
        self.consumer.stop();
        debug!(state = %self.state, "playback session released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Instant;

    #[derive(Debug, Default)]
    struct Calls {
        log: Mutex<Vec<String>>,
        stops: AtomicUsize,
    }

    impl Calls {
        fn push(&self, entry: impl Into<String>) {
            self.log.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[derive(Debug)]
    struct FakeProducer {
        valid: bool,
        speed: f64,
        position: Arc<AtomicUsize>,
        calls: Arc<Calls>,
    }

    impl Configurable for FakeProducer {
        fn set(&mut self, key: &str, value: &str) -> Result<(), EngineError> {
            self.calls.push(format!("producer.set {key}={value}"));
            Ok(())
        }
    }

    impl Producer for FakeProducer {
        fn is_valid(&self) -> bool {
            self.valid
        }

        fn playtime(&self) -> u64 {
            200
        }

        fn speed(&self) -> f64 {
            self.speed
        }

        fn set_speed(&mut self, speed: f64) -> Result<(), EngineError> {
            self.speed = speed;
            Ok(())
        }

        fn seek(&mut self, frame: u64) -> Result<(), EngineError> {
            self.position.store(frame as usize, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FakeConsumer {
        reject_connect: bool,
        fail_start: bool,
        stopped: Arc<AtomicBool>,
        position: Arc<AtomicUsize>,
        calls: Arc<Calls>,
    }

    impl Configurable for FakeConsumer {
        fn set(&mut self, key: &str, value: &str) -> Result<(), EngineError> {
            self.calls.push(format!("consumer.set {key}={value}"));
            Ok(())
        }
    }

    impl Consumer for FakeConsumer {
        type Source = FakeProducer;

        fn is_valid(&self) -> bool {
            true
        }

        fn connect(&mut self, _producer: &FakeProducer) -> Result<(), EngineError> {
            self.calls.push("consumer.connect");
            if self.reject_connect {
                return Err(EngineError::Rejected("incompatible formats".into()));
            }
            Ok(())
        }

        fn start(&mut self) -> Result<(), EngineError> {
            self.calls.push("consumer.start");
            if self.fail_start {
                return Err(EngineError::Backend("device missing".into()));
            }
            self.stopped.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }

        fn stop(&mut self) {
            self.calls.stops.fetch_add(1, Ordering::SeqCst);
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn position(&self) -> u64 {
            self.position.load(Ordering::SeqCst) as u64
        }
    }

    struct Rig {
        calls: Arc<Calls>,
        stopped: Arc<AtomicBool>,
        session: PlaybackSession<FakeConsumer>,
    }

    fn rig(valid: bool, reject_connect: bool, fail_start: bool) -> Rig {
        let calls = Arc::new(Calls::default());
        let stopped = Arc::new(AtomicBool::new(true));
        let position = Arc::new(AtomicUsize::new(0));
        let mut session = PlaybackSession::new(FakeConsumer {
            reject_connect,
            fail_start,
            stopped: Arc::clone(&stopped),
            position: Arc::clone(&position),
            calls: Arc::clone(&calls),
        });
        session
            .attach(FakeProducer {
                valid,
                speed: 1.0,
                position,
                calls: Arc::clone(&calls),
            })
            .unwrap();
        Rig {
            calls,
            stopped,
            session,
        }
    }

    #[test]
    fn options_apply_in_order_before_connect() {
        let mut rig = rig(true, false, false);
        rig.session
            .configure_producer(&OptionSet::new().with("eof", "loop").with("length", "10"))
            .unwrap();
        rig.session
            .configure_consumer(&OptionSet::new().with("rescale", "none"))
            .unwrap();
        rig.session.connect().unwrap();
        assert_eq!(
            rig.calls.entries(),
            vec![
                "producer.set eof=loop",
                "producer.set length=10",
                "consumer.set rescale=none",
                "consumer.connect",
            ]
        );
        assert!(matches!(
            rig.session.configure_consumer(&OptionSet::new().with("a", "b")),
            Err(PlaybackError::InvalidTransition { state: SessionState::Connected, .. })
        ));
    }

    #[test]
    fn start_requires_connected_state() {
        let mut rig = rig(true, false, false);
        assert!(matches!(
            rig.session.start(),
            Err(PlaybackError::InvalidTransition { op: "start", state: SessionState::Unconnected })
        ));
        assert!(!rig.calls.entries().contains(&"consumer.start".to_string()));
    }

    #[test]
    fn connect_without_producer_is_refused() {
        let calls = Arc::new(Calls::default());
        let mut session = PlaybackSession::new(FakeConsumer {
            reject_connect: false,
            fail_start: false,
            stopped: Arc::new(AtomicBool::new(true)),
            position: Arc::new(AtomicUsize::new(0)),
            calls: Arc::clone(&calls),
        });
        assert!(matches!(
            session.connect(),
            Err(PlaybackError::InvalidTransition { op: "connect", state: SessionState::Unconnected })
        ));
        assert_eq!(session.state(), SessionState::Unconnected);
        assert!(calls.entries().is_empty());
    }

    #[test]
    fn invalid_producer_is_rejected_at_connect() {
        let mut rig = rig(false, false, false);
        assert!(matches!(
            rig.session.connect(),
            Err(PlaybackError::ConnectionRejected(_))
        ));
        assert_eq!(rig.session.state(), SessionState::Unconnected);
        assert!(rig.calls.entries().is_empty());
    }

    #[test]
    fn failed_start_leaves_session_connected() {
        let mut rig = rig(true, false, true);
        rig.session.connect().unwrap();
        let err = rig.session.start().unwrap_err();
        assert!(matches!(err, PlaybackError::StartFailure(ref reason) if reason.contains("device missing")));
        assert_eq!(rig.session.state(), SessionState::Connected);
    }

    #[test]
    fn stopped_session_cannot_reconnect_or_restart() {
        let mut rig = rig(true, false, false);
        rig.session.connect().unwrap();
        rig.session.start().unwrap();
        rig.session.stop();
        assert!(matches!(
            rig.session.connect(),
            Err(PlaybackError::InvalidTransition { state: SessionState::Stopped, .. })
        ));
        assert!(matches!(
            rig.session.start(),
            Err(PlaybackError::InvalidTransition { state: SessionState::Stopped, .. })
        ));
    }

    #[test]
    fn wait_observes_engine_stop_within_interval() {
        let mut rig = rig(true, false, false);
        rig.session.connect().unwrap();
        rig.session.start().unwrap();
        let engine_flag = Arc::clone(&rig.stopped);
        let engine = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            engine_flag.store(true, Ordering::SeqCst);
        });
        let interval = Duration::from_millis(20);
        let started = Instant::now();
        rig.session
            .wait_until_stopped(interval, &CancelToken::new())
            .unwrap();
        engine.join().unwrap();
        assert_eq!(rig.session.state(), SessionState::Stopped);
        assert!(started.elapsed() < Duration::from_millis(30) + interval * 10);
    }

    #[test]
    fn cancelled_wait_returns_and_keeps_running() {
        let mut rig = rig(true, false, false);
        rig.session.connect().unwrap();
        rig.session.start().unwrap();
        let token = CancelToken::new();
        token.cancel();
        let started = Instant::now();
        let result = rig.session.wait_until_stopped(DEFAULT_POLL_INTERVAL, &token);
        assert!(matches!(result, Err(PlaybackError::CancelledWait)));
        assert!(started.elapsed() < DEFAULT_POLL_INTERVAL);
        assert_eq!(rig.session.state(), SessionState::Running);
        assert_eq!(rig.calls.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_interval_is_clamped_not_spun() {
        let mut rig = rig(true, false, false);
        rig.session.connect().unwrap();
        rig.session.start().unwrap();
        let token = CancelToken::new();
        let remote = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        let result = rig.session.wait_until_stopped(Duration::ZERO, &token);
        canceller.join().unwrap();
        assert!(matches!(result, Err(PlaybackError::CancelledWait)));
    }

    #[test]
    fn wait_on_stopped_session_returns_immediately() {
        let mut rig = rig(true, false, false);
        rig.session.connect().unwrap();
        rig.session.start().unwrap();
        rig.session.stop();
        rig.stopped.store(false, Ordering::SeqCst);

        let token = CancelToken::new();
        token.cancel();
        let started = Instant::now();
        rig.session
            .wait_until_stopped(DEFAULT_POLL_INTERVAL, &token)
            .unwrap();
        assert!(started.elapsed() < DEFAULT_POLL_INTERVAL);
        assert_eq!(rig.session.state(), SessionState::Stopped);
    }

    #[test]
    fn wait_before_start_is_invalid() {
        let mut rig = rig(true, false, false);
        assert!(matches!(
            rig.session.wait_until_stopped(MIN_POLL_INTERVAL, &CancelToken::new()),
            Err(PlaybackError::InvalidTransition { state: SessionState::Unconnected, .. })
        ));
    }

    #[test]
    fn transport_controls_follow_player_semantics() {
        let mut rig = rig(true, false, false);
        assert!(rig.session.pause().is_err());
        rig.session.connect().unwrap();
        rig.session.start().unwrap();

        rig.session.pause().unwrap();
        assert_eq!(rig.session.producer().unwrap().speed(), 0.0);
        rig.session.play().unwrap();
        assert_eq!(rig.session.producer().unwrap().speed(), 1.0);
        rig.session.seek(50).unwrap();
        assert_eq!(rig.session.position(), 50);
        assert_eq!(rig.session.progress_permille(), 250);

        let entries = rig.calls.entries();
        assert!(entries.ends_with(&[
            "consumer.set volume=0".to_string(),
            "consumer.set volume=1".to_string(),
        ]));
    }

    #[test]
    fn drop_stops_consumer_on_every_path() {
        let rig = rig(true, true, false);
        let calls = Arc::clone(&rig.calls);
        let mut session = rig.session;
        assert!(session.connect().is_err());
        drop(session);
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }
}
