use crate::cli::LogFormat;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` takes precedence over `verbose`.
pub fn init(format: LogFormat, verbose: bool) {
    let filter = if verbose {
        "gbridge=debug,gbridge_core=debug,tower_http=debug"
    } else {
        "gbridge=info,gbridge_core=info,tower_http=info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}
