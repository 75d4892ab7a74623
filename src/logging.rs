use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` (default `info`); `HISTMARK_LOG_FORMAT=json`
/// switches to line-delimited JSON output.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("HISTMARK_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    // A second init (e.g. from tests) is not an error worth surfacing.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
