//! Subscriber setup for the `tracing` output of the binary

use std::io::{self, IsTerminal};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{Error, Result};

/// Default filter directive for a verbosity level
///
/// Non-primary workers are held to warnings unless verbosity is raised, so
/// a multi-worker console shows each progress line once.
pub fn default_directive(verbosity: u8, quiet: bool, rank: usize) -> &'static str {
    if quiet {
        return "error";
    }
    match (verbosity, rank) {
        (0, 0) => "pelican_trainer=info,warn",
        (0, _) => "warn",
        (1, _) => "pelican_trainer=debug,info",
        (2, _) => "pelican_trainer=trace,debug",
        _ => "trace",
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` overrides the verbosity-derived filter. JSON output carries the
/// current span, so every line includes the run prefix and rank.
pub fn init_logging(verbosity: u8, quiet: bool, json_output: bool, rank: usize) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity, quiet, rank)));

    let result = if json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(json_layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_ansi(io::stdout().is_terminal())
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).try_init()
    };

    result.map_err(|e| Error::config(format!("failed to install log subscriber: {}", e)))
}
