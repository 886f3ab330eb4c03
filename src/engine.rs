use std::any::TypeId;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, OnceLock};

use tracing::{debug, info, warn};

use crate::contract::{
    Consumer, EngineFactory, OptionSet, PlaybackError, Producer, Profile, ProfileSelection,
};
use crate::session::configure;

static LIVE_ENGINES: OnceLock<Mutex<HashMap<TypeId, usize>>> = OnceLock::new();

/// A producer that passed validation, plus the profile it was opened with.
#[derive(Debug)]
pub struct OpenedSource<P> {
    pub producer: P,
    pub profile: Profile,
}

/// An initialized engine. Holding one proves `EngineFactory::init` ran in this process.
///
/// Handles of the same factory type share one initialization; the last handle to be
/// closed or dropped runs `EngineFactory::close`.
#[derive(Debug)]
pub struct Engine<F>
where
    F: EngineFactory + 'static,
{
    factory: F,
}

impl<F> Engine<F>
where
    F: EngineFactory + 'static,
{
    pub fn init(factory: F, config_path: Option<&Path>) -> Result<Self, PlaybackError> {
        let mut registry = lock_registry();
        match registry.get_mut(&TypeId::of::<F>()) {
            Some(handles) => {
                *handles += 1;
                debug!(handles = *handles, "engine already initialized, skipping init");
            }
            None => {
                factory.init(config_path)?;
                registry.insert(TypeId::of::<F>(), 1);
                info!(config = ?config_path, "engine initialized");
            }
        }
        Ok(Self { factory })
    }

    pub fn is_initialized() -> bool {
        lock_registry().contains_key(&TypeId::of::<F>())
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Creates and validates a producer for `source`, then applies `options` in order.
    ///
    /// With [`ProfileSelection::Auto`] the producer is probed with the default profile
    /// and re-created with its native profile when it reports one.
    pub fn open(
        &self,
        source: &str,
        selection: &ProfileSelection,
        options: &OptionSet,
    ) -> Result<OpenedSource<F::Producer>, PlaybackError> {
        if source.trim().is_empty() {
            return Err(invalid_source(source));
        }
        let requested = match selection {
            ProfileSelection::Fixed(profile) => profile.clone(),
            ProfileSelection::Auto => Profile::default(),
        };
        let mut producer = self.create_valid_producer(&requested, source)?;
        let mut profile = requested;

        if *selection == ProfileSelection::Auto {
            if let Some(native) = producer.native_profile() {
                if native != profile {
                    debug!(%native, "reloading producer with derived profile");
                    producer = self.create_valid_producer(&native, source)?;
                    profile = native;
                }
            }
        }

        configure(&mut producer, options)?;
        info!(source, %profile, "producer opened");
        Ok(OpenedSource { producer, profile })
    }

    /// Creates a consumer of `kind` and applies `options`; invalid consumers are refused.
    pub fn consumer(
        &self,
        profile: &Profile,
        kind: &str,
        options: &OptionSet,
    ) -> Result<F::Consumer, PlaybackError> {
        let mut consumer = self
            .factory
            .create_consumer(Some(profile), kind, None)
            .map_err(|err| PlaybackError::ConsumerUnavailable(format!("{kind}: {err}")))?;
        if !consumer.is_valid() {
            return Err(PlaybackError::ConsumerUnavailable(kind.to_string()));
        }
        configure(&mut consumer, options)?;
        debug!(kind, %profile, "consumer created");
        Ok(consumer)
    }

    /// Releases this handle. The engine shuts down once no handle of this type is left,
    /// and a later `init` runs the factory again.
    pub fn close(self) {
        drop(self);
    }

    fn create_valid_producer(
        &self,
        profile: &Profile,
        source: &str,
    ) -> Result<F::Producer, PlaybackError> {
        let producer = self
            .factory
            .create_producer(Some(profile), source, None)
            .map_err(|err| {
                warn!(source, %err, "engine failed to create producer");
                invalid_source(source)
            })?;
        if !producer.is_valid() {
            return Err(invalid_source(source));
        }
        Ok(producer)
    }
}

impl<F> Drop for Engine<F>
where
    F: EngineFactory + 'static,
{
    fn drop(&mut self) {
        let mut registry = lock_registry();
        let remaining = match registry.get_mut(&TypeId::of::<F>()) {
            Some(handles) => {
                *handles = handles.saturating_sub(1);
                *handles
            }
            None => 0,
        };
        if remaining > 0 {
            debug!(handles = remaining, "engine handle released");
            return;
        }
        registry.remove(&TypeId::of::<F>());
        self.factory.close();
        info!("engine closed");
    }
}

fn invalid_source(source: &str) -> PlaybackError {
    PlaybackError::InvalidSource {
        resource: source.to_string(),
    }
}

fn lock_registry() -> MutexGuard<'static, HashMap<TypeId, usize>> {
    let registry = LIVE_ENGINES.get_or_init(|| Mutex::new(HashMap::new()));
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
