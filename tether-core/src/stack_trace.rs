//! Call-site capture for resource diagnostics.
//!
//! A [`StackTrace`] always records the caller location (via `#[track_caller]`)
//! and the current thread. A full backtrace is only captured on request,
//! which tracing resources do at construction and, when configured, on every
//! reserve/release.

use std::backtrace::Backtrace;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::thread;

/// Where and on which thread something happened.
#[derive(Clone)]
pub struct StackTrace {
    message: String,
    location: &'static Location<'static>,
    thread_name: Option<String>,
    backtrace: Option<Arc<Backtrace>>,
}

impl StackTrace {
    /// Capture the caller location and a full backtrace.
    ///
    /// The backtrace is captured regardless of `RUST_BACKTRACE`.
    #[track_caller]
    pub fn capture(message: impl Into<String>) -> Self {
        Self::build(message.into(), Location::caller(), true)
    }

    /// Capture only the caller location.
    #[track_caller]
    pub fn here(message: impl Into<String>) -> Self {
        Self::build(message.into(), Location::caller(), false)
    }

    /// Capture at an explicit location, optionally with a backtrace.
    pub fn at(
        message: impl Into<String>,
        location: &'static Location<'static>,
        with_backtrace: bool,
    ) -> Self {
        Self::build(message.into(), location, with_backtrace)
    }

    fn build(message: String, location: &'static Location<'static>, with_backtrace: bool) -> Self {
        Self {
            message,
            location,
            thread_name: thread::current().name().map(str::to_owned),
            backtrace: with_backtrace.then(|| Arc::new(Backtrace::force_capture())),
        }
    }

    /// The message describing the captured event.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Source location of the call that captured this trace.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Name of the capturing thread, if it had one.
    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    /// The full backtrace, if one was captured.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on thread {} at {}:{}:{}",
            self.message,
            self.thread_name.as_deref().unwrap_or("<unnamed>"),
            self.location.file(),
            self.location.line(),
            self.location.column()
        )?;
        if let Some(backtrace) = &self.backtrace {
            write!(f, "\n{backtrace}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackTrace")
            .field("message", &self.message)
            .field("location", &format_args!("{}", self.location))
            .field("thread_name", &self.thread_name)
            .field("has_backtrace", &self.backtrace.is_some())
            .finish()
    }
}
