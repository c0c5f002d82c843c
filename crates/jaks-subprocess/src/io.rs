//! Stream sinks for process output

use std::io::{self, Write};

use crate::pump::PumpRole;

/// Where a pump delivers the bytes a process writes to stdout or stderr.
///
/// `Inherit` writes through this process's own standard handle, chunk by
/// chunk as the child produces output.
#[derive(Default)]
pub enum Sink<'a> {
    #[default]
    Inherit,
    Discard,
    Writer(&'a mut (dyn Write + Send)),
}

impl<'a> Sink<'a> {
    pub(crate) fn into_writer(self, role: PumpRole) -> Box<dyn Write + Send + 'a> {
        match self {
            Self::Inherit => match role {
                PumpRole::Stderr => Box::new(FlushEach(io::stderr())),
                PumpRole::Stdout | PumpRole::Stdin => Box::new(FlushEach(io::stdout())),
            },
            Self::Discard => Box::new(io::sink()),
            Self::Writer(writer) => Box::new(writer),
        }
    }
}

impl std::fmt::Debug for Sink<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inherit => f.write_str("Inherit"),
            Self::Discard => f.write_str("Discard"),
            Self::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

/// Flushes after every write.
///
/// `io::stdout()` is line-buffered, so without this a child's partial line
/// would sit in our buffer until the next newline or the end of the stream.
#[derive(Debug)]
struct FlushEach<W>(W);

impl<W: Write> Write for FlushEach<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_all(buf)?;
        self.0.flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Writes every byte to two writers, primary first.
#[derive(Debug)]
pub struct TeeWriter<A, B> {
    primary: A,
    secondary: B,
}

impl<A: Write, B: Write> TeeWriter<A, B> {
    #[must_use]
    pub const fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }

    #[must_use]
    pub fn into_parts(self) -> (A, B) {
        (self.primary, self.secondary)
    }
}

impl<A: Write, B: Write> Write for TeeWriter<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.primary.write_all(buf)?;
        self.secondary.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        self.secondary.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("sink closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_tee_writes_both() {
        let mut tee = TeeWriter::new(Vec::new(), Vec::new());
        tee.write_all(b"hello ").unwrap();
        tee.write_all(b"world").unwrap();
        tee.flush().unwrap();

        let (primary, secondary) = tee.into_parts();
        assert_eq!(primary, b"hello world");
        assert_eq!(secondary, b"hello world");
    }

    #[test]
    fn test_tee_propagates_primary_error() {
        let mut tee = TeeWriter::new(FailingWriter, Vec::new());
        let err = tee.write_all(b"data").unwrap_err();
        assert_eq!(err.to_string(), "sink closed");
    }

    #[test]
    fn test_writer_sink_borrows_caller_buffer() {
        let mut captured: Vec<u8> = Vec::new();
        {
            let mut writer = Sink::Writer(&mut captured).into_writer(PumpRole::Stdout);
            writer.write_all(b"abc").unwrap();
        }
        assert_eq!(captured, b"abc");
    }

    #[test]
    fn test_discard_sink_accepts_everything() {
        let mut writer = Sink::Discard.into_writer(PumpRole::Stderr);
        writer.write_all(&[0u8; 8192]).unwrap();
        writer.flush().unwrap();
    }

    /// Records each write and flush as one event
    #[derive(Default)]
    struct EventLog(Vec<String>);

    impl Write for EventLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.push(format!("write {}", String::from_utf8_lossy(buf)));
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.0.push("flush".to_string());
            Ok(())
        }
    }

    #[test]
    fn test_flush_each_flushes_partial_lines() {
        let mut writer = FlushEach(EventLog::default());
        writer.write_all(b"prompt> ").unwrap();
        writer.write_all(b"more").unwrap();

        assert_eq!(writer.0.0, ["write prompt> ", "flush", "write more", "flush"]);
    }

    #[test]
    fn test_default_sink_is_inherit() {
        assert!(matches!(Sink::default(), Sink::Inherit));
        assert_eq!(format!("{:?}", Sink::Discard), "Discard");
    }
}
