//! Failure containment for I/O callbacks.
//!
//! Every externally-invoked callback body (accept handling, connect,
//! pipeline I/O, shutdown) runs inside a shield that catches all three
//! failure classes — panics, system I/O errors, and generic errors — and
//! converts each into a single located diagnostic on the log sink. A
//! failing callback degrades to an orderly per-connection shutdown; it
//! never unwinds into a worker thread.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::error;

/// Where a diagnostic came from: source location plus callback name.
#[derive(Debug, Clone, Copy)]
pub struct Origin {
    pub file: &'static str,
    pub line: u32,
    pub callback: &'static str,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.file, self.line, self.callback)
    }
}

/// Builds an [`Origin`](crate::shield::Origin) for the current source line.
#[macro_export]
macro_rules! origin {
    ($callback:expr) => {
        $crate::shield::Origin {
            file: file!(),
            line: line!(),
            callback: $callback,
        }
    };
}

/// Runs an async callback body inside the shield.
///
/// Returns `true` if the body completed cleanly, `false` if it failed in
/// any way. Failures are logged and swallowed.
pub async fn guard<F>(origin: Origin, body: F) -> bool
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(body).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            report(&origin, &err);
            false
        }
        Err(payload) => {
            report_panic(&origin, payload.as_ref());
            false
        }
    }
}

/// Synchronous variant of [`guard`] for non-async callback bodies.
pub fn guard_sync<F>(origin: Origin, body: F) -> bool
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            report(&origin, &err);
            false
        }
        Err(payload) => {
            report_panic(&origin, payload.as_ref());
            false
        }
    }
}

fn report(origin: &Origin, err: &anyhow::Error) {
    if let Some(io) = err.downcast_ref::<std::io::Error>() {
        error!(origin = %origin, error = %io, "I/O failure in callback");
    } else {
        error!(origin = %origin, error = %err, "failure in callback");
    }
}

fn report_panic(origin: &Origin, payload: &(dyn Any + Send)) {
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    };
    error!(origin = %origin, panic = message, "panic in callback");
}
