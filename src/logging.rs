//! tracing-subscriber setup shared by the binary and the C ABI.

use tracing_subscriber::EnvFilter;

pub const ENV_LOG: &str = "EMA_LOG";

/// Filter directive for a `-v` count: 0 = warn, 1 = info, 2 = debug, 3+ = trace.
pub fn verbosity_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Log to stderr. `RUST_LOG` takes precedence over `verbosity`.
///
/// Does nothing if a global subscriber is already installed.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_directive(verbosity)));
    install(filter);
}

/// Log to stderr with the filter taken from `EMA_LOG`, warnings only if unset.
pub fn init_from_env() {
    let filter = EnvFilter::try_from_env(ENV_LOG)
        .unwrap_or_else(|_| EnvFilter::new(verbosity_directive(0)));
    install(filter);
}

fn install(filter: EnvFilter) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
