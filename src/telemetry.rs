use std::fs;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use tracing::{Subscriber, subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, registry::LookupSpan};

use crate::config::{LogFormat, LoggingSection};

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "dohrelay=debug"
    } else {
        "dohrelay=info"
    }
}

fn install_subscriber<S>(subscriber: S) -> Result<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    subscriber::set_global_default(subscriber)?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

fn console_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match format {
        LogFormat::Text => fmt::layer().with_target(false).boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed(),
    }
}

/// Install the global subscriber: stderr in the configured format, plus a
/// daily rolling JSON file when `logging.directory` is set.
///
/// `RUST_LOG` overrides the default level filter.
pub fn init_tracing(verbose: bool, logging: &LoggingSection) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let file_layer = match &logging.directory {
        Some(directory) => {
            fs::create_dir_all(directory).with_context(|| {
                format!("Failed to create log directory {}", directory.display())
            })?;
            let appender = tracing_appender::rolling::daily(directory, "dohrelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .with_writer(writer),
            )
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer(logging.format))
        .with(file_layer);
    install_subscriber(subscriber)
}
