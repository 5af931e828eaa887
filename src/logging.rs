use std::time::{Duration, Instant};

use tracing::{info, Span};

/// Logging state of one mount. Created by `mount`, entered around every
/// dispatched call and dropped when the session is released.
#[derive(Debug)]
pub struct LogContext {
    span: Span,
    started: Instant,
}

impl LogContext {
    pub fn new(target: &str, session_id: &str) -> Self {
        let span = tracing::info_span!("mount", target = %target, session = %session_id);
        span.in_scope(|| info!("mount session started"));
        Self {
            span,
            started: Instant::now(),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for LogContext {
    fn drop(&mut self) {
        let uptime = self.started.elapsed();
        self.span
            .in_scope(|| info!("mount session ended after {:.1}s", uptime.as_secs_f64()));
    }
}
