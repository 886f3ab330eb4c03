use std::path::PathBuf;
use std::time::Duration;
use std::{fmt, fmt::Display};

use crate::contract::{OptionSet, ProfileSelection};
use crate::session::DEFAULT_POLL_INTERVAL;

pub const DEFAULT_CONSUMER_KIND: &str = "headless";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub consumer_kind: String,
    pub profile: ProfileSelection,
    pub poll_interval: Duration,
    pub producer_options: OptionSet,
    pub consumer_options: OptionSet,
    pub config_path: Option<PathBuf>,
}

impl SessionConfig {
    #[must_use]
    pub fn new(consumer_kind: impl Into<String>) -> Self {
        Self {
            consumer_kind: consumer_kind.into(),
            profile: ProfileSelection::Auto,
            poll_interval: DEFAULT_POLL_INTERVAL,
            producer_options: OptionSet::new(),
            consumer_options: OptionSet::new(),
            config_path: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CONSUMER_KIND)
    }
}

impl Display for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SessionConfig(consumer={}, profile={}, poll_interval={:?}, producer_options={}, consumer_options={})",
            self.consumer_kind,
            self.profile,
            self.poll_interval,
            self.producer_options,
            self.consumer_options
        )
    }
}
