//! Out-of-band diagnostics.
//!
//! Mirrors the teacher's `printf.rs`: a tiny console writer that
//! carries progress/pressure messages but is never part of the
//! contract (spec §6: "Out-of-band diagnostic messages ... are not
//! part of the contract").

use core::fmt;
use std::sync::RwLock;

/// Something that can receive a formatted diagnostic line.
pub trait Sink: Send + Sync {
    fn line(&self, args: fmt::Arguments<'_>);
}

struct StderrSink;

impl Sink for StderrSink {
    fn line(&self, args: fmt::Arguments<'_>) {
        eprintln!("{}", args);
    }
}

static SINK: RwLock<Option<Box<dyn Sink>>> = RwLock::new(None);

/// Installs a custom diagnostic sink, replacing the default stderr one.
pub fn set_sink(sink: Box<dyn Sink>) {
    *SINK.write().unwrap() = Some(sink);
}

#[doc(hidden)]
pub fn _diag(args: fmt::Arguments<'_>) {
    match SINK.read().unwrap().as_ref() {
        Some(sink) => sink.line(args),
        None => StderrSink.line(args),
    }
}

/// Emits one diagnostic line. Never fails, never observed by callers
/// other than through this sink.
#[macro_export]
macro_rules! diag {
    ($($arg:tt)*) => ($crate::diag::_diag(format_args!($($arg)*)));
}
