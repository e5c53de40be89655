//! Tracing setup shared by the worker binary and embedding hosts.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Build the default filter.
///
/// `RUST_LOG` wins when set. Otherwise `LMLAYER_LOG` picks the level for this
/// crate (`debug`, `warn`, `error`; anything else means `info`) and the
/// per-frame codec logs stay off.
pub fn default_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::new(filter_directives(
        std::env::var("LMLAYER_LOG").ok().as_deref(),
    ))
}

fn filter_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("lmlayer={level},lmlayer::bridge::codec=off")
}

/// Install a stderr subscriber. `LOG_FORMAT=json` switches to JSON lines.
///
/// Stdout is reserved for protocol frames when running as a subprocess.
/// Safe to call more than once; only the first call installs anything.
pub fn init_tracing() {
    let filter = default_filter();
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
