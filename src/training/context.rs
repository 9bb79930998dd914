//! Per-run logging context
//!
//! Created once when the trainer is built and handed by reference to every
//! collaborator that logs, so log lines carry the run prefix and rank without
//! any process-global state.

use tracing::{debug, info, Span};

/// Logging context of one worker in one run
#[derive(Debug, Clone)]
pub struct LogContext {
    prefix: String,
    rank: usize,
    primary: bool,
    span: Span,
}

impl LogContext {
    /// Create the context for worker `rank` of the run named `prefix`
    pub fn new(prefix: impl Into<String>, rank: usize, primary: bool) -> Self {
        let prefix = prefix.into();
        let span = tracing::info_span!("run", prefix = %prefix, rank);
        Self {
            prefix,
            rank,
            primary,
            span,
        }
    }

    /// Run name
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Worker rank
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Whether this worker owns console-visible output
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Span wrapping everything logged for this run
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Emit a human-readable progress line
    ///
    /// Only the primary worker reports at info level; other workers keep the
    /// line at debug so the console shows each event once.
    pub fn progress(&self, line: &str) {
        let _entered = self.span.enter();
        if self.primary {
            info!("{}", line);
        } else {
            debug!("{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_accessors() {
        let ctx = LogContext::new("pelican-7", 2, false);
        assert_eq!(ctx.prefix(), "pelican-7");
        assert_eq!(ctx.rank(), 2);
        assert!(!ctx.is_primary());
        ctx.progress("no subscriber installed, must not panic");
    }
}
