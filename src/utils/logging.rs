//! Subscriber setup for binaries and tests embedding the runtime.
//!
//! The library only emits `tracing` events; nothing is printed until the
//! host application calls [`init`] (or installs its own subscriber).

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{Fault, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn format_layer<W>(json: bool, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(ansi);
    if json {
        layer.json().boxed()
    } else {
        layer.compact().boxed()
    }
}

/// Filter from `RUST_LOG` when set, else from the configuration.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = config
        .env_filter
        .clone()
        .unwrap_or_else(|| config.log_level.to_string().to_ascii_lowercase());
    EnvFilter::try_new(&directives)
        .map_err(|e| Fault::Config(format!("Invalid log filter '{directives}': {e}")))
}

/// Install the global subscriber described by `config`. Fails when the
/// configuration is invalid or a subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(Fault::Config(errors.join("; ")));
    }

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if config.log_to_console {
        layers.push(format_layer(config.json_format, std::io::stderr, true));
    }
    if config.log_to_file {
        if let Some(path) = &config.log_file_path {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            layers.push(format_layer(config.json_format, Mutex::new(file), false));
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(build_filter(config)?)
        .try_init()
        .map_err(|e| Fault::Config(format!("Logging already initialized: {e}")))?;

    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}
