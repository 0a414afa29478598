//! Rendering diagnostic messages to output streams.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::diagnostics::{DiagnosticDelegate, level};

/// Build a subscriber delegate that renders messages to a pair of sinks.
///
/// Each message becomes one line of the form
/// `[<seconds> <sender>:<level>] <prefix><message>`, where `<seconds>` is
/// the time since the reporter was created and `<prefix>` is `"error: "`
/// for levels at or above [`level::ERROR`], `"warning: "` for levels at or
/// above [`level::WARNING`], and empty otherwise. Warnings and errors go
/// to `error`; everything else goes to `output`. A shared lock keeps lines
/// from interleaving when several threads publish at once.
///
/// ```
/// use ferrule_core::{DiagnosticsBus, stream_reporter};
///
/// let bus = DiagnosticsBus::new("demo");
/// bus.subscribe_delegate(stream_reporter(std::io::stdout(), std::io::stderr()), 0);
/// bus.publish(0, "up and running");
/// ```
pub fn stream_reporter<O, E>(output: O, error: E) -> DiagnosticDelegate
where
    O: Write + Send + 'static,
    E: Write + Send + 'static,
{
    let start = Instant::now();
    let sinks = Arc::new(Mutex::new((output, error)));
    Arc::new(move |sender, message_level, message| {
        let elapsed = start.elapsed().as_secs_f64();
        let prefix = if message_level >= level::ERROR {
            "error: "
        } else if message_level >= level::WARNING {
            "warning: "
        } else {
            ""
        };
        let mut sinks = sinks.lock();
        let (output, error) = &mut *sinks;
        let _ = if message_level >= level::WARNING {
            writeln!(error, "[{elapsed:.6} {sender}:{message_level}] {prefix}{message}")
        } else {
            writeln!(output, "[{elapsed:.6} {sender}:{message_level}] {prefix}{message}")
        };
    })
}

/// A [`stream_reporter`] over the process's standard output and error.
pub fn stderr_reporter() -> DiagnosticDelegate {
    stream_reporter(io::stdout(), io::stderr())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticsBus;

    /// A `Write` sink that can still be inspected after it is moved into
    /// the reporter closure.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn formats_and_routes_by_level() {
        let output = SharedSink::default();
        let error = SharedSink::default();

        let bus = DiagnosticsBus::new("test");
        bus.subscribe_delegate(stream_reporter(output.clone(), error.clone()), 0);

        bus.publish(0, "plain note");
        bus.publish(level::WARNING, "heads up");
        bus.publish(level::ERROR, "boom");

        let output = output.contents();
        let error = error.contents();

        assert!(output.contains(" test:0] plain note\n"), "{output:?}");
        assert!(output.starts_with('['));
        assert!(!output.contains("heads up"));

        assert!(error.contains(" test:5] warning: heads up\n"), "{error:?}");
        assert!(error.contains(" test:10] error: boom\n"), "{error:?}");
    }
}
