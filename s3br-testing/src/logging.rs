//! Per-test log capture.
//!
//! Stage workers log from many tokio tasks on many runtime threads.  Left to the default global
//! subscriber, the output of tests running in parallel gets interleaved and is useless for figuring
//! out why one of them failed.  [`test_with_logging`] gives each test its own subscriber and its own
//! runtime, and prints that test's log only once the test is over.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::fmt::MakeWriter;

/// Filter used when `RUST_LOG` isn't set.  The AWS SDK and its HTTP stack are far too chatty at
/// debug level to be useful in a test log.
const DEFAULT_FILTER: &str = "aws=info,aws_smithy_runtime=info,hyper=info,h2=warn,rustls=info,debug";

/// How long to wait for a test's runtime to wind down before giving up on its tasks
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffer that collects the formatted log events of one test
#[derive(Clone, Default)]
struct LogBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    /// Empty the buffer, returning what was in it
    fn drain(&self) -> String {
        let bytes = std::mem::take(&mut *self.bytes.lock().unwrap());

        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl<'a> Write for &'a LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = &'a Self;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

fn make_dispatch(buffer: LogBuffer) -> tracing::Dispatch {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let format = fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(false)
        .with_writer(buffer);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .unwrap();

    tracing::Dispatch::new(tracing_subscriber::registry().with(filter).with(format))
}

/// Run an async test on a dedicated multi-threaded tokio runtime with logging captured.
///
/// Use this in place of `#[tokio::test]`.  Every thread of the runtime gets this test's subscriber
/// as its default, so events from spawned workers are captured along with the test's own.  The
/// captured log is printed when the test finishes, whether it passed, failed or panicked.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    std::thread_local! {
        static DISPATCH_GUARD: RefCell<Option<tracing::subscriber::DefaultGuard>> = RefCell::new(None);
    }

    let buffer = LogBuffer::default();
    let dispatch = make_dispatch(buffer.clone());

    let outcome = tracing::dispatcher::with_default(&dispatch, || {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all();

        {
            let dispatch = dispatch.clone();
            builder.on_thread_start(move || {
                let guard = tracing::dispatcher::set_default(&dispatch);
                DISPATCH_GUARD.with(|cell| cell.replace(Some(guard)));
            });
        }
        builder.on_thread_stop(|| {
            DISPATCH_GUARD.with(|cell| cell.replace(None));
        });

        let runtime = builder.build()?;

        Ok::<_, color_eyre::Report>(std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

            result
        })))
    })?;

    println!("Log events from this test:\n{}", buffer.drain());

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
