//! Built-in engine that plays sources against a frame clock without rendering.
//!
//! Producers accept `color:`/`colour:`/`noise:` generators and existing files.
//! Consumers of kind `headless` or `null` run one worker thread per started
//! consumer that advances the shared transport once per frame period.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::contract::{Configurable, Consumer, EngineError, EngineFactory, Producer, Profile};

pub const DEFAULT_LENGTH: u64 = 250;
pub const CONSUMER_KINDS: &[&str] = &["headless", "null"];

const GENERATOR_PREFIXES: &[&str] = &["color:", "colour:", "noise:"];
const FALLBACK_FRAME_PERIOD: Duration = Duration::from_millis(40);
const UNPACED_IDLE_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EofAction {
    #[default]
    Stop,
    Loop,
    Pause,
}

impl EofAction {
    fn as_u8(self) -> u8 {
        match self {
            Self::Stop => 0,
            Self::Loop => 1,
            Self::Pause => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Loop,
            2 => Self::Pause,
            _ => Self::Stop,
        }
    }
}

impl FromStr for EofAction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stop" => Ok(Self::Stop),
            "loop" => Ok(Self::Loop),
            "pause" | "continue" => Ok(Self::Pause),
            other => Err(EngineError::Unsupported(format!("eof action {other:?}"))),
        }
    }
}

/// Playhead shared between a producer and the consumer connected to it.
#[derive(Debug)]
struct Transport {
    position: AtomicU64,
    speed_bits: AtomicU64,
    length: AtomicU64,
    eof: AtomicU8,
}

impl Transport {
    fn new(length: u64) -> Self {
        Self {
            position: AtomicU64::new(0),
            speed_bits: AtomicU64::new(1.0f64.to_bits()),
            length: AtomicU64::new(length),
            eof: AtomicU8::new(EofAction::Stop.as_u8()),
        }
    }

    fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Acquire))
    }

    fn set_speed(&self, speed: f64) {
        self.speed_bits.store(speed.to_bits(), Ordering::Release);
    }

    fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    fn eof(&self) -> EofAction {
        EofAction::from_u8(self.eof.load(Ordering::Acquire))
    }

    fn seek(&self, frame: u64) {
        let last = self.length().saturating_sub(1);
        self.position.store(frame.min(last), Ordering::Release);
    }

    /// Moves the playhead by one frame period at the current speed (rounded to whole
    /// frames). Returns `false` once the end is reached with [`EofAction::Stop`].
    fn advance(&self) -> bool {
        let step = self.speed().round() as i64;
        if step == 0 {
            return true;
        }
        let length = self.length();
        let next = i128::from(self.position()) + i128::from(step);
        if next < 0 {
            self.position.store(0, Ordering::Release);
            self.set_speed(0.0);
        } else if next >= i128::from(length) {
            match self.eof() {
                EofAction::Stop => {
                    self.position.store(length, Ordering::Release);
                    return false;
                }
                EofAction::Loop => self.position.store(0, Ordering::Release),
                EofAction::Pause => {
                    self.position
                        .store(length.saturating_sub(1), Ordering::Release);
                    self.set_speed(0.0);
                }
            }
        } else {
            self.position.store(next as u64, Ordering::Release);
        }
        true
    }

    /// How long the worker waits before the next frame. Unpaced playback only runs
    /// flat out while it is heading for a stop; looping or stalled playback idles at
    /// [`UNPACED_IDLE_PERIOD`].
    fn frame_wait(&self, period: Duration) -> Duration {
        if !period.is_zero() {
            return period;
        }
        let stalled = self.speed().round() == 0.0;
        if stalled || self.eof() != EofAction::Stop {
            UNPACED_IDLE_PERIOD
        } else {
            Duration::ZERO
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Generator,
    File,
    Missing,
}

impl SourceKind {
    fn classify(resource: &str) -> Self {
        if resource.trim().is_empty() {
            Self::Missing
        } else if GENERATOR_PREFIXES
            .iter()
            .any(|prefix| resource.starts_with(prefix))
        {
            Self::Generator
        } else if Path::new(resource).is_file() {
            Self::File
        } else {
            Self::Missing
        }
    }
}

#[derive(Debug)]
pub struct HeadlessProducer {
    resource: String,
    kind: SourceKind,
    profile: Profile,
    properties: BTreeMap<String, String>,
    transport: Arc<Transport>,
}

impl HeadlessProducer {
    #[must_use]
    pub fn new(profile: Profile, resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            kind: SourceKind::classify(resource),
            profile,
            properties: BTreeMap::new(),
            transport: Arc::new(Transport::new(DEFAULT_LENGTH)),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn eof(&self) -> EofAction {
        self.transport.eof()
    }
}

impl Configurable for HeadlessProducer {
    fn set(&mut self, key: &str, value: &str) -> Result<(), EngineError> {
        match key {
            "length" => match value.trim().parse::<u64>() {
                Ok(length) => {
                    self.transport.length.store(length, Ordering::Release);
                    self.transport.seek(self.transport.position());
                }
                Err(err) => warn!(value, %err, "ignoring unparseable producer length"),
            },
            "eof" => match value.parse::<EofAction>() {
                Ok(action) => self.transport.eof.store(action.as_u8(), Ordering::Release),
                Err(err) => warn!(value, %err, "ignoring producer eof setting"),
            },
            _ => {}
        }
        self.properties.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl Producer for HeadlessProducer {
    fn is_valid(&self) -> bool {
        self.kind != SourceKind::Missing
    }

    fn native_profile(&self) -> Option<Profile> {
        match self.kind {
            SourceKind::File => Profile::preset("atsc_720p_25"),
            SourceKind::Generator | SourceKind::Missing => None,
        }
    }

    fn playtime(&self) -> u64 {
        self.transport.length()
    }

    fn speed(&self) -> f64 {
        self.transport.speed()
    }

    fn set_speed(&mut self, speed: f64) -> Result<(), EngineError> {
        if !speed.is_finite() {
            return Err(EngineError::Unsupported(format!("speed {speed}")));
        }
        self.transport.set_speed(speed);
        Ok(())
    }

    fn seek(&mut self, frame: u64) -> Result<(), EngineError> {
        self.transport.seek(frame);
        Ok(())
    }
}

#[derive(Debug)]
struct Worker {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct HeadlessConsumer {
    kind: String,
    profile: Profile,
    properties: BTreeMap<String, String>,
    real_time: bool,
    transport: Option<Arc<Transport>>,
    stopped: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl HeadlessConsumer {
    #[must_use]
    pub fn new(profile: Profile, kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            profile,
            properties: BTreeMap::new(),
            real_time: true,
            transport: None,
            stopped: Arc::new(AtomicBool::new(true)),
            worker: None,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    fn frame_period(&self) -> Duration {
        if !self.real_time {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(1.0 / self.profile.fps()).unwrap_or(FALLBACK_FRAME_PERIOD)
    }
}

impl Configurable for HeadlessConsumer {
    fn set(&mut self, key: &str, value: &str) -> Result<(), EngineError> {
        if key == "real_time" {
            self.real_time = value.trim() != "0";
        }
        self.properties.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl Consumer for HeadlessConsumer {
    type Source = HeadlessProducer;

    fn is_valid(&self) -> bool {
        CONSUMER_KINDS.contains(&self.kind.as_str())
    }

    fn connect(&mut self, producer: &HeadlessProducer) -> Result<(), EngineError> {
        if self.worker.is_some() && !self.is_stopped() {
            return Err(EngineError::Busy("consumer is running".to_string()));
        }
        if !producer.is_valid() {
            return Err(EngineError::Rejected(format!(
                "producer {:?} is not valid",
                producer.resource
            )));
        }
        if producer.playtime() == 0 {
            return Err(EngineError::Rejected(format!(
                "producer {:?} has no frames",
                producer.resource
            )));
        }
        self.transport = Some(Arc::clone(&producer.transport));
        Ok(())
    }

    fn start(&mut self) -> Result<(), EngineError> {
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| EngineError::Rejected("consumer is not connected".to_string()))?;
        if self.worker.is_some() && !self.is_stopped() {
            return Ok(());
        }
        self.stop();

        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let period = self.frame_period();
        let stopped = Arc::clone(&self.stopped);
        stopped.store(false, Ordering::Release);
        let spawned = thread::Builder::new()
            .name(format!("{}-consumer", self.kind))
            .spawn(move || run_consumer(transport, period, shutdown_rx, stopped));
        match spawned {
            Ok(handle) => {
                debug!(kind = %self.kind, ?period, "consumer worker started");
                self.worker = Some(Worker {
                    shutdown: shutdown_tx,
                    handle,
                });
                Ok(())
            }
            Err(err) => {
                self.stopped.store(true, Ordering::Release);
                Err(EngineError::Backend(format!(
                    "failed to spawn consumer worker: {err}"
                )))
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown.send(());
            if worker.handle.join().is_err() {
                warn!(kind = %self.kind, "consumer worker panicked");
            }
            debug!(kind = %self.kind, "consumer worker joined");
        }
        self.stopped.store(true, Ordering::Release);
    }

    fn position(&self) -> u64 {
        self.transport.as_ref().map_or(0, |transport| transport.position())
    }
}

impl Drop for HeadlessConsumer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_consumer(
    transport: Arc<Transport>,
    period: Duration,
    shutdown: Receiver<()>,
    stopped: Arc<AtomicBool>,
) {
    loop {
        match shutdown.recv_timeout(transport.frame_wait(period)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if !transport.advance() {
            debug!(position = transport.position(), "end of stream");
            break;
        }
    }
    stopped.store(true, Ordering::Release);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessFactory;

impl HeadlessFactory {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl EngineFactory for HeadlessFactory {
    type Producer = HeadlessProducer;
    type Consumer = HeadlessConsumer;

    fn init(&self, config_path: Option<&Path>) -> Result<(), EngineError> {
        if let Some(path) = config_path {
            if !path.exists() {
                return Err(EngineError::Unsupported(format!(
                    "engine config not found: {}",
                    path.display()
                )));
            }
        }
        debug!(consumers = ?CONSUMER_KINDS, "headless engine ready");
        Ok(())
    }

    fn create_producer(
        &self,
        profile: Option<&Profile>,
        source: &str,
        extra_args: Option<&str>,
    ) -> Result<HeadlessProducer, EngineError> {
        if let Some(args) = extra_args {
            debug!(args, "headless producers take no extra arguments");
        }
        Ok(HeadlessProducer::new(
            profile.cloned().unwrap_or_default(),
            source,
        ))
    }

    fn create_consumer(
        &self,
        profile: Option<&Profile>,
        kind: &str,
        extra_args: Option<&str>,
    ) -> Result<HeadlessConsumer, EngineError> {
        if let Some(args) = extra_args {
            debug!(args, "headless consumers take no extra arguments");
        }
        Ok(HeadlessConsumer::new(
            profile.cloned().unwrap_or_default(),
            kind,
        ))
    }
}
