use std::path::Path;
use std::str::FromStr;
use std::{fmt, fmt::Display};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
}

impl Profile {
    pub const DEFAULT_NAME: &'static str = "dv_pal";

    #[must_use]
    pub fn new(
        name: impl Into<String>,
        width: u32,
        height: u32,
        frame_rate_num: u32,
        frame_rate_den: u32,
    ) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            frame_rate_num,
            frame_rate_den: frame_rate_den.max(1),
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        let (width, height, num, den) = match name {
            "dv_pal" => (720, 576, 25, 1),
            "dv_ntsc" => (720, 480, 30000, 1001),
            "atsc_720p_25" => (1280, 720, 25, 1),
            "atsc_720p_30" => (1280, 720, 30, 1),
            "atsc_1080p_25" => (1920, 1080, 25, 1),
            "atsc_1080p_30" => (1920, 1080, 30, 1),
            _ => return None,
        };
        Some(Self::new(name, width, height, num, den))
    }

    #[must_use]
    pub fn fps(&self) -> f64 {
        f64::from(self.frame_rate_num) / f64::from(self.frame_rate_den.max(1))
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::new(Self::DEFAULT_NAME, 720, 576, 25, 1)
    }
}

impl Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Profile(name={}, {}x{}, fps={}/{})",
            self.name, self.width, self.height, self.frame_rate_num, self.frame_rate_den
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProfileSelection {
    /// Derive the profile from the opened producer, falling back to the default.
    #[default]
    Auto,
    Fixed(Profile),
}

impl Display for ProfileSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Fixed(profile) => write!(f, "{}", profile.name),
        }
    }
}

/// Ordered key/value options applied to a producer or consumer before connect.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OptionSet {
    entries: Vec<(String, String)>,
}

impl OptionSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for OptionSet {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Display for OptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (index, (key, value)) in self.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str("}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionPair {
    pub key: String,
    pub value: String,
}

impl FromStr for OptionPair {
    type Err = OptionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| OptionParseError(format!("expected key=value, got {s:?}")))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(OptionParseError(format!("empty option key in {s:?}")));
        }
        Ok(Self {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

impl FromIterator<OptionPair> for OptionSet {
    fn from_iter<I: IntoIterator<Item = OptionPair>>(iter: I) -> Self {
        iter.into_iter().map(|pair| (pair.key, pair.value)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid option: {0}")]
pub struct OptionParseError(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connected,
    Running,
    Stopped,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconnected => f.write_str("unconnected"),
            Self::Connected => f.write_str("connected"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("engine busy: {0}")]
    Busy(String),
    #[error("engine error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("Unable to open {resource}")]
    InvalidSource { resource: String },
    #[error("consumer unavailable: {0}")]
    ConsumerUnavailable(String),
    #[error("connection rejected: {0}")]
    ConnectionRejected(String),
    #[error("start failure: {0}")]
    StartFailure(String),
    #[error("wait for playback to stop was cancelled")]
    CancelledWait,
    #[error("cannot {op} while {state}")]
    InvalidTransition {
        op: &'static str,
        state: SessionState,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl PlaybackError {
    /// Busy engines may succeed on a later attempt; everything else needs new handles
    /// or a different request. The session itself never retries.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Engine(EngineError::Busy(_)))
    }
}

pub trait Configurable {
    fn set(&mut self, key: &str, value: &str) -> Result<(), EngineError>;
}

pub trait Producer: Configurable {
    fn is_valid(&self) -> bool;

    fn native_profile(&self) -> Option<Profile> {
        None
    }

    fn playtime(&self) -> u64;

    fn speed(&self) -> f64;

    fn set_speed(&mut self, speed: f64) -> Result<(), EngineError>;

    fn seek(&mut self, frame: u64) -> Result<(), EngineError>;
}

pub trait Consumer: Configurable {
    type Source: Producer;

    fn is_valid(&self) -> bool;

    fn connect(&mut self, producer: &Self::Source) -> Result<(), EngineError>;

    fn start(&mut self) -> Result<(), EngineError>;

    fn is_stopped(&self) -> bool;

    /// Must be safe to call repeatedly and before `start`.
    fn stop(&mut self);

    fn position(&self) -> u64;
}

pub trait EngineFactory {
    type Producer: Producer;
    type Consumer: Consumer<Source = Self::Producer>;

    fn init(&self, config_path: Option<&Path>) -> Result<(), EngineError>;

    fn create_producer(
        &self,
        profile: Option<&Profile>,
        source: &str,
        extra_args: Option<&str>,
    ) -> Result<Self::Producer, EngineError>;

    fn create_consumer(
        &self,
        profile: Option<&Profile>,
        kind: &str,
        extra_args: Option<&str>,
    ) -> Result<Self::Consumer, EngineError>;

    fn close(&self) {}
}
