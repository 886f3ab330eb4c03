mod cancel;
mod config;
mod contract;
mod engine;
pub mod headless;
mod session;

pub use cancel::CancelToken;
pub use config::{DEFAULT_CONSUMER_KIND, SessionConfig};
pub use contract::{
    Configurable, Consumer, EngineError, EngineFactory, OptionPair, OptionParseError, OptionSet,
    PlaybackError, Producer, Profile, ProfileSelection, SessionState,
};
pub use engine::{Engine, OpenedSource};
pub use headless::{EofAction, HeadlessConsumer, HeadlessFactory, HeadlessProducer};
pub use session::{DEFAULT_POLL_INTERVAL, MIN_POLL_INTERVAL, PlaybackSession, configure};
