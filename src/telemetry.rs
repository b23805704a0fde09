//! Tracing setup for the CLI.
//!
//! Human-readable (or JSON) events go to stderr, so stdout stays free for
//! command output. A daily-rolling JSON log is kept under `.gauntlet/logs`
//! when that directory can be created.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct TelemetryOptions {
    pub verbose: bool,
    pub json: bool,
}

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "warn,gauntlet=debug"
        } else {
            "warn,gauntlet=info"
        })
    })
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process so the file writer flushes.
pub fn init(options: &TelemetryOptions, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    let stderr = if options.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter(options.verbose))
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(filter(options.verbose))
            .boxed()
    };
    layers.push(stderr);

    let guard = log_dir
        .filter(|dir| std::fs::create_dir_all(dir).is_ok())
        .map(|dir| {
            let appender = tracing_appender::rolling::daily(dir, "gauntlet.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(filter(true))
                    .boxed(),
            );
            guard
        });

    // A subscriber may already be installed (tests, embedding).
    let _ = tracing_subscriber::registry().with(layers).try_init();
    guard
}
