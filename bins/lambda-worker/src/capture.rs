//! Output capture and the exit/timeout race.
//!
//! A background task drains the demultiplexed container stream into shared
//! buffers, so whatever was written before a kill is still readable.

use futures_util::stream::{Stream, StreamExt};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// One demultiplexed piece of container output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    pub fn push(&self, chunk: Chunk) {
        let (target, bytes) = match chunk {
            Chunk::Stdout(bytes) => (&self.stdout, bytes),
            Chunk::Stderr(bytes) => (&self.stderr, bytes),
        };
        target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(&bytes);
    }

    pub fn stdout(&self) -> String {
        Self::read(&self.stdout)
    }

    pub fn stderr(&self) -> String {
        Self::read(&self.stderr)
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        let mut out = self.stdout();
        out.push_str(&self.stderr());
        out
    }

    fn read(buf: &Mutex<Vec<u8>>) -> String {
        String::from_utf8_lossy(&buf.lock().unwrap_or_else(PoisonError::into_inner)).into_owned()
    }
}

/// Drain `stream` into `buffer` until it ends or errors
pub fn spawn_capture<S, E>(stream: S, buffer: OutputBuffer) -> JoinHandle<()>
where
    S: Stream<Item = Result<Chunk, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => buffer.push(chunk),
                Err(e) => {
                    tracing::debug!(error = %e, "output stream closed with error");
                    break;
                }
            }
        }
    })
}

#[derive(Debug, PartialEq, Eq)]
pub enum Exit<T> {
    Completed(T),
    TimedOut,
}

/// Race `exit` against a `limit` timer; the loser is dropped
pub async fn wait_or_timeout<F>(exit: F, limit: Duration) -> Exit<F::Output>
where
    F: Future,
{
    tokio::select! {
        out = exit => Exit::Completed(out),
        _ = tokio::time::sleep(limit) => Exit::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn test_capture_demuxes_in_order() {
        let chunks: Vec<Result<Chunk, String>> = vec![
            Ok(Chunk::Stdout(b"{\"success\":".to_vec())),
            Ok(Chunk::Stderr(b"warn 1\n".to_vec())),
            Ok(Chunk::Stdout(b"true}".to_vec())),
            Ok(Chunk::Stderr(b"warn 2\n".to_vec())),
        ];
        let buffer = OutputBuffer::default();

        spawn_capture(stream::iter(chunks), buffer.clone())
            .await
            .unwrap();

        assert_eq!(buffer.stdout(), "{\"success\":true}");
        assert_eq!(buffer.stderr(), "warn 1\nwarn 2\n");
        assert_eq!(buffer.combined(), "{\"success\":true}warn 1\nwarn 2\n");
    }

    #[tokio::test]
    async fn test_capture_keeps_output_before_error() {
        let chunks: Vec<Result<Chunk, String>> = vec![
            Ok(Chunk::Stdout(b"partial".to_vec())),
            Err("connection reset".to_string()),
            Ok(Chunk::Stdout(b" never".to_vec())),
        ];
        let buffer = OutputBuffer::default();

        spawn_capture(stream::iter(chunks), buffer.clone())
            .await
            .unwrap();

        assert_eq!(buffer.stdout(), "partial");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_completes_before_timer() {
        let exit = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            0i64
        };
        assert_eq!(
            wait_or_timeout(exit, Duration::from_millis(1000)).await,
            Exit::Completed(0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let started = tokio::time::Instant::now();
        let exit = std::future::pending::<()>();

        assert_eq!(
            wait_or_timeout(exit, Duration::from_millis(1000)).await,
            Exit::TimedOut
        );
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }
}
