/// Emits a trace-level event, but only when the `trace-more` feature is on.
///
/// Used on per-read and per-chunk paths, which would flood any subscriber.
#[cfg(feature = "trace-more")]
macro_rules! trace {
    ($($arg:tt)+) => (::tracing::trace!($($arg)+));
}
/// Emits a trace-level event, but only when the `trace-more` feature is on.
#[cfg(not(feature = "trace-more"))]
macro_rules! trace {
    ($($arg:tt)+) => {};
}
pub(crate) use trace;

/// Evaluates an `io::Result` expression until it stops failing with
/// [`ErrorKind::Interrupted`](std::io::ErrorKind::Interrupted).
macro_rules! retry_interrupted {
    ($e:expr) => {
        loop {
            match $e {
                Err(e) if e.kind() == ::std::io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        }
    };
}
pub(crate) use retry_interrupted;
