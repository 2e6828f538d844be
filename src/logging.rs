use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "warn,aix=info";
const VERBOSE_LOG_FILTER: &str = "warn,aix=debug";
const SILENT_LOG_FILTER: &str = "off";

type InitResult = Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>;

fn default_filter(verbose: bool, silent: bool) -> &'static str {
    if silent {
        SILENT_LOG_FILTER
    } else if verbose {
        VERBOSE_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    }
}

/// Sends diagnostics to stderr so stdout only carries the result.
/// `RUST_LOG`, when set, replaces the filter picked from the flags.
pub fn init(verbose: bool, silent: bool) -> InitResult {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose, silent)));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
}
