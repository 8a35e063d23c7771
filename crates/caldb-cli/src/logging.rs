//! Tracing subscriber for the `caldb` binary. Logs go to stderr so stdout
//! stays clean for command output.
//!
//! Filter priority: `CALDB_LOG`, then `RUST_LOG`, then `--verbose` (debug),
//! then `warn`.

use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "CALDB_LOG";

pub fn init_subscriber(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .compact()
        .init();
}

fn build_env_filter(verbose: bool) -> EnvFilter {
    if let Ok(directives) = std::env::var(LOG_ENV) {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return filter;
        }
    }

    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    EnvFilter::new(default_directive(verbose))
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "warn,caldb_store_sqlite=debug,caldb=debug"
    } else {
        "warn"
    }
}
