use std::fmt::Display;

use tracing_error::SpanTrace;

/// An error kind together with the `tracing` spans that were active when it was created.
///
/// The span trace is only populated when a `tracing_error::ErrorLayer` is installed, see
/// `logging::init_logging`.
#[derive(Debug)]
pub struct TracedError<E> {
    pub kind: E,
    pub context: SpanTrace,
}

impl<E> TracedError<E> {
    pub fn new(kind: E) -> Self {
        Self::with_context(kind, SpanTrace::capture())
    }

    pub fn with_context(kind: E, context: SpanTrace) -> Self {
        Self { kind, context }
    }

    pub fn kind(&self) -> &E {
        &self.kind
    }

    pub fn into_kind(self) -> E {
        self.kind
    }

    pub fn span(&self) -> &SpanTrace {
        &self.context
    }
}

impl<E: Display> std::fmt::Display for TracedError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.kind.fmt(f)?;
        if self.context.status() == tracing_error::SpanTraceStatus::CAPTURED {
            write!(f, "\n\ncontext:\n{}\n", self.context)?;
        }
        Ok(())
    }
}

impl<E: std::error::Error + 'static> std::error::Error for TracedError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}
