use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use playback_session::{
    CancelToken, DEFAULT_CONSUMER_KIND, Engine, HeadlessFactory, OptionPair, PlaybackError,
    PlaybackSession, Profile, ProfileSelection, SessionConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Play a media source until it stops or Ctrl-C is pressed")]
struct Args {
    /// Media source: a file path or a generator such as `color:black`.
    source: String,
    #[arg(long, env = "PLAYBACK_CONSUMER", default_value = DEFAULT_CONSUMER_KIND)]
    consumer: String,
    /// Profile preset name; derived from the source when omitted.
    #[arg(long, env = "PLAYBACK_PROFILE")]
    profile: Option<String>,
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,
    #[arg(short = 'p', long = "producer-option", value_name = "KEY=VALUE")]
    producer_options: Vec<OptionPair>,
    #[arg(short = 'c', long = "consumer-option", value_name = "KEY=VALUE")]
    consumer_options: Vec<OptionPair>,
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<PlaybackError>() {
                Some(invalid @ PlaybackError::InvalidSource { .. }) => eprintln!("{invalid}"),
                _ => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("playback_session=info,play=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(args: Args) -> Result<()> {
    let config = session_config(&args)?;
    info!(%config, source = %args.source, "starting playback");
    let engine = Engine::init(HeadlessFactory::new(), config.config_path.as_deref())
        .context("engine init failed")?;

    let cancel = CancelToken::new();
    spawn_interrupt_listener(cancel.clone())?;

    let outcome = play(&engine, &args.source, &config, &cancel);
    engine.close();
    outcome
}

fn play(
    engine: &Engine<HeadlessFactory>,
    source: &str,
    config: &SessionConfig,
    cancel: &CancelToken,
) -> Result<()> {
    let mut session = PlaybackSession::from_config(engine, source, config)?;
    session.connect().context("connect failed")?;
    session.start().context("start failed")?;

    match session.wait_until_stopped(config.poll_interval, cancel) {
        Ok(()) => {}
        Err(PlaybackError::CancelledWait) => info!("interrupted, stopping playback"),
        Err(err) => return Err(err).context("wait for playback failed"),
    }
    session.stop();

    println!(
        "position={}, playtime={}, source={}, consumer={}",
        session.position(),
        session.playtime(),
        source,
        config.consumer_kind
    );
    Ok(())
}

fn session_config(args: &Args) -> Result<SessionConfig> {
    let mut config = SessionConfig::new(args.consumer.clone());
    if let Some(name) = &args.profile {
        let profile =
            Profile::preset(name).with_context(|| format!("unknown profile preset: {name}"))?;
        config.profile = ProfileSelection::Fixed(profile);
    }
    config.poll_interval = Duration::from_millis(args.poll_interval_ms);
    config.producer_options = args.producer_options.iter().cloned().collect();
    config.consumer_options = args.consumer_options.iter().cloned().collect();
    config.config_path = args.config.clone();
    Ok(config)
}

fn spawn_interrupt_listener(cancel: CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    thread::Builder::new()
        .name("interrupt-listener".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });
        })
        .context("failed to spawn interrupt listener")?;
    Ok(())
}
