// Tracing setup
//
// Subscriber initialisation for binaries embedding the manager, and a
// once-only helper for tests that want to see lifecycle events.
//
// Manager events are emitted under the `ndscope_core` target. Unless asked
// otherwise, other crates are held at `warn` so an embedding binary is not
// flooded by its dependencies.

use std::str::FromStr;
use std::sync::Once;

use anyhow::{bail, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

static TEST_INIT: Once = Once::new();
static DEBUG_INIT: Once = Once::new();

const DEFAULT_DIRECTIVES: &str = "warn,ndscope_core=info";

/// Output format of the global subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line human readable events
    #[default]
    Pretty,
    /// One JSON object per event, with manager ids as fields
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format '{}', expected 'pretty' or 'json'", other),
        }
    }
}

/// Filter directives for `level`.
///
/// A bare level such as `"debug"` applies to the manager only. Anything with
/// a target or several directives is used as given.
fn directives(level: Option<&str>) -> String {
    match level.map(str::trim) {
        None | Some("") => DEFAULT_DIRECTIVES.to_string(),
        Some(level) if level.contains('=') || level.contains(',') => level.to_string(),
        Some(level) => format!("warn,ndscope_core={}", level),
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `level` when set. Fails if the directives do not
/// parse or a global subscriber is already installed.
pub fn init_tracing(level: Option<&str>, format: LogFormat) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(directives(level))?,
    };
    let subscriber = Registry::default().with(filter);

    match format {
        LogFormat::Json => tracing::subscriber::set_global_default(
            subscriber.with(fmt::layer().json().flatten_event(true)),
        )?,
        LogFormat::Pretty => {
            tracing::subscriber::set_global_default(subscriber.with(fmt::layer().pretty()))?
        }
    }
    Ok(())
}

/// Info-level logging routed through the test writer, installed at most once
pub fn init_test_logging() {
    TEST_INIT.call_once(|| {
        let _ = init_test_subscriber("info");
    });
}

/// Like [`init_test_logging`] but at debug level, so every attach and release shows
pub fn init_debug_logging() {
    DEBUG_INIT.call_once(|| {
        let _ = init_test_subscriber("debug");
    });
}

fn init_test_subscriber(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(directives(Some(level))))?;
    let layer = fmt::layer().with_target(true).with_test_writer();
    tracing::subscriber::set_global_default(Registry::default().with(filter).with(layer))?;
    Ok(())
}
