use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;

/// Initialize structured logging driven by `RUST_LOG`. Pretty output for dev
/// environments, compact single-line output otherwise. Safe to call more than
/// once; later calls are ignored.
pub fn init_logging(app: &AppConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    let result = if app.env.eq_ignore_ascii_case("dev") {
        builder.pretty().with_writer(std::io::stderr).try_init()
    } else {
        builder.compact().try_init()
    };

    if result.is_err() {
        tracing::debug!("logging already initialized");
    }
}
