use crate::LogSink;
use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

pub struct KernelLogger<S> {
    max_level: LevelFilter,
    sink: S,
}

impl<S: LogSink> KernelLogger<S> {
    #[must_use]
    pub const fn new(max_level: LevelFilter, sink: S) -> Self {
        Self { max_level, sink }
    }

    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// Install as the global logger. Call once during early init.
    ///
    /// # Errors
    /// Fails if another logger was installed first.
    pub fn init(&'static self) -> Result<(), SetLoggerError>
    where
        S: 'static,
    {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }
}

/// Adapts a sink to [`fmt::Write`] so records format without allocating.
struct SinkWriter<'a, S>(&'a S);

impl<S: LogSink> Write for SinkWriter<'_, S> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

impl<S: LogSink> Log for KernelLogger<S> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Best effort: a sink that drops bytes must not take the kernel down.
        let _ = writeln!(
            SinkWriter(&self.sink),
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        self.sink.flush();
    }
}
