use std::fmt::{self, Display};
use std::io;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use calloop::generic::Generic;
use calloop::signals::{Signal, Signals};
use calloop::{EventLoop, Interest, Mode as TriggerMode, PostAction};
use clap::Parser;
#[cfg(feature = "profiling")]
use profiling::puffin;
#[cfg(feature = "profiling")]
use puffin_http::Server;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::backend::{BackendError, DisplayBackend};
use crate::commit::CommitOutcome;
use crate::config::{Config, ConfigError};
use crate::drawing::PatternRenderer;
use crate::drm::{Card, DrmBackend, GbmAllocator};
use crate::planeflip::{OutputRequest, PlaneFlip, Settings};
use crate::registry::ResourceRegistry;
use crate::term::{Command, RawTerminal};

mod animation;
mod backend;
mod commit;
mod config;
mod drawing;
mod drm;
mod events;
mod geometry;
mod output;
mod pipe;
mod planeflip;
mod registry;
mod surface;
mod term;
#[cfg(test)]
mod testing;

/// Command line arguments.
#[derive(Parser, Debug)]
#[clap(author, about, version, max_term_width = 80)]
struct Options {
    /// Connector and mode pairs, like `HDMI-A-1 1920x1080`.
    #[clap(value_name = "CONNECTOR MODE", required = true)]
    outputs: Vec<String>,

    /// DRM device node.
    #[clap(long)]
    device: Option<PathBuf>,

    /// Configuration file.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Wait for completion events before producing new frames.
    #[clap(long)]
    throttle: bool,
}

/// Fatal setup failure.
#[derive(thiserror::Error, Debug)]
enum SetupError {
    #[error("{0}")]
    Usage(String),
    #[error("unable to open {}: {source}", path.display())]
    Device {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to initialize display resources: {0}")]
    Resources(#[source] BackendError),
    #[error("no requested output could be bound")]
    NoOutput,
    #[error("unable to create GBM device: {0}")]
    Gbm(#[source] BackendError),
    #[error("unable to allocate surfaces: {0}")]
    Surface(#[source] BackendError),
    #[error("unable to set up event loop: {0}")]
    EventLoop(#[source] calloop::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SetupError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 1,
            Self::Device { .. } => 2,
            Self::Resources(_) => 3,
            Self::NoOutput => 4,
            Self::Gbm(_) => 5,
            Self::Surface(_) => 6,
            Self::EventLoop(_) => 7,
            Self::Config(_) => 8,
        }
    }
}

pub fn main() {
    #[cfg(feature = "profiling")]
    let _server = {
        puffin::set_scopes_on(true);
        Server::new(&format!("0.0.0.0:{}", puffin_http::DEFAULT_PORT)).ok()
    };

    // Setup logging.
    let directives = std::env::var("RUST_LOG").unwrap_or("warn,planeflip=info".into());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    FmtSubscriber::builder().with_env_filter(env_filter).with_line_number(true).init();

    let options = match Options::try_parse() {
        Ok(options) => options,
        Err(err) if err.use_stderr() => {
            let _ = err.print();
            process::exit(SetupError::Usage(String::new()).exit_code());
        },
        Err(err) => err.exit(),
    };

    if let Err(err) = run(options) {
        error!("{err}");
        process::exit(err.exit_code());
    }
}

/// Set up the display pipeline and run the interactive session.
fn run(options: Options) -> Result<(), SetupError> {
    let mut config = Config::load(options.config.as_deref())?;
    if let Some(device) = options.device {
        config.device = device;
    }
    config.throttle |= options.throttle;

    let requests = output_requests(&options.outputs)?;

    let card = Card::open(&config.device)
        .map_err(|source| SetupError::Device { path: config.device.clone(), source })?;
    let backend = DrmBackend::new(card).map_err(SetupError::Resources)?;

    let mut registry = ResourceRegistry::new();
    let pipes = planeflip::bind_pipes(backend.resources(), &mut registry, &requests);
    if pipes.is_empty() {
        return Err(SetupError::NoOutput);
    }

    let gbm_card = backend.event_source().map_err(SetupError::Gbm)?;
    let mut allocator = GbmAllocator::new(gbm_card, config.queue_depth).map_err(SetupError::Gbm)?;
    let outputs =
        planeflip::create_outputs(&backend, &mut allocator, pipes, config.overlay_size)
            .map_err(SetupError::Surface)?;

    let settings = Settings::new(&config);
    let renderer = Box::new(PatternRenderer);
    let mut flip = PlaneFlip::new(backend, registry, outputs, settings, renderer);

    let mut event_loop = EventLoop::try_new().map_err(SetupError::EventLoop)?;
    let handle = event_loop.handle();

    // Register interactive command source.
    handle
        .insert_source(
            Generic::new(io::stdin(), Interest::READ, TriggerMode::Level),
            |_, _, flip: &mut PlaneFlip<DrmBackend>| {
                handle_input(flip);
                Ok(PostAction::Continue)
            },
        )
        .map_err(|err| SetupError::EventLoop(err.error))?;

    // Register completion event source.
    let drm_source = flip.backend.event_source().map_err(SetupError::Resources)?;
    handle
        .insert_source(
            Generic::new(drm_source, Interest::READ, TriggerMode::Level),
            |_, _, flip: &mut PlaneFlip<DrmBackend>| {
                trace_error(flip.handle_backend_events());
                Ok(PostAction::Continue)
            },
        )
        .map_err(|err| SetupError::EventLoop(err.error))?;

    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM]).map_err(SetupError::EventLoop)?;
    handle
        .insert_source(signals, |event, _, flip: &mut PlaneFlip<DrmBackend>| {
            info!("Received {:?}, shutting down", event.signal());
            flip.terminated = true;
        })
        .map_err(|err| SetupError::EventLoop(err.error))?;

    let terminal = match RawTerminal::new(&io::stdin()) {
        Ok(terminal) => Some(terminal),
        Err(err) => {
            warn!("Unable to switch terminal to raw mode: {err}");
            None
        },
    };

    if flip.start() == CommitOutcome::Rejected {
        warn!("Initial modeset was rejected");
    }

    // Continously dispatch event loop.
    while !flip.terminated {
        let timeout = flip.wants_frame().then_some(Duration::ZERO);
        if let Err(err) = event_loop.dispatch(timeout, &mut flip) {
            error!("Event loop error: {err}");
            break;
        }

        if flip.wants_frame() {
            flip.tick();
        }
    }

    drop(terminal);
    flip.shutdown();

    Ok(())
}

/// Split positional arguments into connector and mode pairs.
fn output_requests(args: &[String]) -> Result<Vec<OutputRequest>, SetupError> {
    if args.is_empty() || args.len() % 2 != 0 {
        let message = "expected pairs of CONNECTOR MODE arguments".into();
        return Err(SetupError::Usage(message));
    }

    let requests = args
        .chunks_exact(2)
        .map(|pair| OutputRequest { connector: pair[0].clone(), mode: pair[1].clone() })
        .collect();
    Ok(requests)
}

/// Apply all pending key presses.
fn handle_input(flip: &mut PlaneFlip<DrmBackend>) {
    let bytes = match term::read_input(&io::stdin()) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("Unable to read input: {err}");
            return;
        },
    };

    // Closed input can't deliver a quit command anymore.
    if bytes.is_empty() {
        info!("Input closed, shutting down");
        flip.terminated = true;
        return;
    }

    for command in bytes.into_iter().filter_map(Command::from_byte) {
        flip.handle_command(command);
    }
}

/// Log an error, ignoring success.
pub fn trace_error<T, E: Display>(result: Result<T, E>) {
    if let Err(err) = &result {
        error!("{err}");
    }
}

/// Report a broken internal invariant.
///
/// This is fatal in debug builds, release builds only log the violation.
#[track_caller]
pub fn invariant_violated(message: fmt::Arguments<'_>) {
    if cfg!(debug_assertions) {
        panic!("invariant violated: {message}");
    }

    error!("invariant violated: {message}");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn pairs_become_requests() {
        let requests = output_requests(&args(&["HDMI-A-1", "1920x1080", "DP-1", "800x600"]));
        let requests = requests.unwrap();

        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1], OutputRequest { connector: "DP-1".into(), mode: "800x600".into() });
    }

    #[test]
    fn odd_arguments_are_usage_errors() {
        let err = output_requests(&args(&["HDMI-A-1"])).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert_eq!(output_requests(&[]).unwrap_err().exit_code(), 1);
    }

    #[test]
    fn options_parse() {
        let options =
            Options::try_parse_from(["planeflip", "--throttle", "HDMI-A-1", "1920x1080"]).unwrap();
        assert!(options.throttle);
        assert_eq!(options.outputs, args(&["HDMI-A-1", "1920x1080"]));
        assert!(Options::try_parse_from(["planeflip"]).is_err());
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            SetupError::Usage(String::new()).exit_code(),
            SetupError::NoOutput.exit_code(),
            SetupError::Gbm(BackendError::QueueExhausted).exit_code(),
            SetupError::Surface(BackendError::QueueExhausted).exit_code(),
            SetupError::Resources(BackendError::QueueExhausted).exit_code(),
        ];
        assert_eq!(codes, [1, 4, 5, 6, 3]);
    }
}
