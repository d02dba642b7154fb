//! In-memory byte pipe connecting one producer to one consumer.
//!
//! Data travels through a small bounded channel, so a writer suspends until
//! the reader catches up. Termination travels separately through a shared
//! cell: the reader can always tell a clean end of stream from a failure.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::Stream;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

#[derive(Debug, Clone)]
enum Terminal {
    Open,
    Closed,
    Failed(Error),
}

#[derive(Debug)]
struct Shared {
    terminal: Mutex<Terminal>,
    /// Fires on error close or when the owning export is cancelled.
    closed: CancellationToken,
}

impl Shared {
    fn terminal(&self) -> Terminal {
        match self.terminal.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn failure(&self) -> Option<Error> {
        match self.terminal() {
            Terminal::Failed(err) => Some(err),
            _ if self.closed.is_cancelled() => Some(Error::Cancelled),
            _ => None,
        }
    }

    /// Record a clean close. Returns the failure if one was recorded first.
    fn close(&self) -> Result<()> {
        let mut guard = match self.terminal.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &*guard {
            Terminal::Open => {
                *guard = Terminal::Closed;
                Ok(())
            }
            Terminal::Closed => Ok(()),
            Terminal::Failed(err) => Err(err.clone()),
        }
    }

    /// Record a failure. The first failure wins; a failure replaces a clean close.
    fn fail(&self, err: Error) {
        {
            let mut guard = match self.terminal.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if matches!(&*guard, Terminal::Failed(_)) {
                return;
            }
            *guard = Terminal::Failed(err);
        }
        self.closed.cancel();
    }
}

/// Create a pipe whose pending operations are released when `cancel` fires.
pub fn pipe(capacity: usize, cancel: &CancellationToken) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared {
        terminal: Mutex::new(Terminal::Open),
        closed: cancel.child_token(),
    });

    (
        PipeWriter {
            tx: Some(tx),
            shared: shared.clone(),
        },
        PipeReader { rx, shared },
    )
}

/// Write end of a [`pipe`].
#[derive(Debug)]
pub struct PipeWriter {
    tx: Option<mpsc::Sender<Bytes>>,
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Hand `data` to the reader, suspending while the channel is full.
    pub async fn write(&mut self, data: Bytes) -> Result<()> {
        if let Some(err) = self.shared.failure() {
            return Err(err);
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Pipe("write on closed pipe".to_string()))?;
        if data.is_empty() {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => {
                Err(self.shared.failure().unwrap_or(Error::Cancelled))
            }
            res = tx.send(data) => res.map_err(|_| {
                self.shared
                    .failure()
                    .unwrap_or_else(|| Error::Pipe("read side of pipe dropped".to_string()))
            }),
        }
    }

    /// Signal a clean end of stream.
    pub fn close(&mut self) -> Result<()> {
        // The terminal state must be visible before the reader sees the
        // channel end.
        let closed = self.shared.close();
        self.tx = None;
        closed
    }

    /// Signal a failed end of stream; the reader observes `err`.
    pub fn close_with_error(&mut self, err: Error) {
        self.shared.fail(err);
        self.tx = None;
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if self.tx.is_some() && matches!(self.shared.terminal(), Terminal::Open) {
            self.shared
                .fail(Error::Pipe("writer dropped without closing".to_string()));
        }
    }
}

/// Read end of a [`pipe`].
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Next chunk of bytes, `None` on clean end of stream.
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        if let Some(err) = self.shared.failure() {
            return Err(err);
        }

        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => {
                Err(self.shared.failure().unwrap_or(Error::Cancelled))
            }
            chunk = self.rx.recv() => match chunk {
                Some(data) => Ok(Some(data)),
                None => match self.shared.terminal() {
                    Terminal::Closed => Ok(None),
                    Terminal::Failed(err) => Err(err),
                    Terminal::Open => Err(Error::Pipe("write side of pipe dropped".to_string())),
                },
            },
        }
    }

    /// Fail the pipe from the consuming side, releasing a blocked writer.
    pub fn close_with_error(&self, err: Error) {
        self.shared.fail(err);
    }

    /// A handle that can fail the pipe after the reader has been consumed.
    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            shared: self.shared.clone(),
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        futures::stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.read().await {
                Ok(Some(data)) => Some((Ok(data), Some(reader))),
                Ok(None) => None,
                Err(err) => Some((Err(io::Error::other(err)), None)),
            }
        })
    }

    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin + 'static {
        StreamReader::new(Box::pin(self.into_stream()))
    }
}

/// Failure handle detached from a [`PipeReader`].
#[derive(Debug, Clone)]
pub struct PipeCloser {
    shared: Arc<Shared>,
}

impl PipeCloser {
    pub fn close_with_error(&self, err: Error) {
        self.shared.fail(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_then_read_until_eof() {
        let token = CancellationToken::new();
        let (mut w, mut r) = pipe(4, &token);

        w.write(Bytes::from_static(b"a,b\n")).await.unwrap();
        w.write(Bytes::from_static(b"c,d\n")).await.unwrap();
        w.close().unwrap();

        assert_eq!(r.read().await.unwrap().unwrap(), Bytes::from_static(b"a,b\n"));
        assert_eq!(r.read().await.unwrap().unwrap(), Bytes::from_static(b"c,d\n"));
        assert!(r.read().await.unwrap().is_none());
        assert!(r.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_with_error_reaches_reader() {
        let token = CancellationToken::new();
        let (mut w, mut r) = pipe(4, &token);

        w.write(Bytes::from_static(b"row\n")).await.unwrap();
        w.close_with_error(Error::Export("export read failed".to_string()));

        let err = r.read().await.unwrap_err();
        assert!(err.to_string().contains("export read failed"));
        assert!(w.write(Bytes::from_static(b"more")).await.is_err());
    }

    #[tokio::test]
    async fn test_first_error_wins_and_overrides_clean_close() {
        let token = CancellationToken::new();
        let (mut w, mut r) = pipe(1, &token);

        w.close().unwrap();
        r.close_with_error(Error::Storage("first".to_string()));
        r.close_with_error(Error::Storage("second".to_string()));

        let err = r.read().await.unwrap_err();
        assert!(err.to_string().contains("first"));
        assert!(!err.to_string().contains("second"));
    }

    #[tokio::test]
    async fn test_dropped_writer_is_not_clean_eof() {
        let token = CancellationToken::new();
        let (w, mut r) = pipe(1, &token);
        drop(w);

        assert!(matches!(r.read().await, Err(Error::Pipe(_))));
    }

    #[tokio::test]
    async fn test_reader_failure_unblocks_writer() {
        let token = CancellationToken::new();
        let (mut w, r) = pipe(1, &token);
        w.write(Bytes::from_static(b"fills the channel")).await.unwrap();

        let closer = r.closer();
        let blocked = tokio::spawn(async move { w.write(Bytes::from_static(b"blocked")).await });
        tokio::task::yield_now().await;
        closer.close_with_error(Error::Storage("upload failed".to_string()));

        let err = blocked.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("upload failed"));
        drop(r);
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_reader() {
        let token = CancellationToken::new();
        let (_w, mut r) = pipe(1, &token);

        let pending = tokio::spawn(async move { r.read().await });
        tokio::task::yield_now().await;
        token.cancel();

        assert!(matches!(pending.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_seen_as_clean_eof_across_threads() {
        for _ in 0..500 {
            let token = CancellationToken::new();
            let (mut w, mut r) = pipe(1, &token);

            let writer = tokio::spawn(async move {
                w.write(Bytes::from_static(b"1,a\n")).await?;
                w.close()
            });
            let reader = tokio::spawn(async move {
                let mut chunks = 0;
                while r.read().await?.is_some() {
                    chunks += 1;
                }
                Ok::<_, Error>(chunks)
            });

            writer.await.unwrap().unwrap();
            assert_eq!(reader.await.unwrap().unwrap(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_close_never_seen_as_dropped_writer() {
        for _ in 0..500 {
            let token = CancellationToken::new();
            let (mut w, mut r) = pipe(1, &token);

            let reader = tokio::spawn(async move {
                loop {
                    match r.read().await {
                        Ok(Some(_)) => continue,
                        Ok(None) => return None,
                        Err(err) => return Some(err),
                    }
                }
            });
            w.close_with_error(Error::Export("export read failed".to_string()));

            let err = reader.await.unwrap().expect("failure must reach the reader");
            assert!(err.to_string().contains("export read failed"));
        }
    }

    #[tokio::test]
    async fn test_async_read_adapter() {
        let token = CancellationToken::new();
        let (mut w, r) = pipe(4, &token);

        let writer = tokio::spawn(async move {
            w.write(Bytes::from_static(b"hello ")).await?;
            w.write(Bytes::from_static(b"world")).await?;
            w.close()
        });

        let mut out = String::new();
        r.into_async_read().read_to_string(&mut out).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(out, "hello world");
    }
}
