use std::fmt;
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Trace,
    Info,
    Warn,
}

/// Destination for core log output.
///
/// The core never links a logging framework directly; a host installs a sink
/// once per process and the `core_*` macros stay silent until it does.
pub trait LogSink: Send + Sync + 'static {
    fn log(&self, level: Level, target: &'static str, args: fmt::Arguments);
}

static SINK: OnceLock<Box<dyn LogSink>> = OnceLock::new();

/// Install the process-wide sink. Fails (returning the sink back) if one was
/// already installed.
pub fn install_sink(sink: Box<dyn LogSink>) -> Result<(), Box<dyn LogSink>> {
    SINK.set(sink)
}

pub fn sink_installed() -> bool {
    SINK.get().is_some()
}

pub(crate) fn emit(level: Level, target: &'static str, args: fmt::Arguments) {
    if let Some(sink) = SINK.get() {
        sink.log(level, target, args);
    }
}
