use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use crate::compression::ChunkWriter;
use crate::pipe::PipeReader;
use crate::{Error, Result, TableName};

/// Hands out the writer for the next chunk.
#[async_trait]
pub trait ChunkWriterFactory: Send {
    /// `num_rows` resolves with the chunk's row count after the returned
    /// writer has been closed.
    async fn new_writer(&mut self, num_rows: oneshot::Receiver<usize>) -> Result<ChunkWriter>;
}

struct OpenChunk {
    writer: ChunkWriter,
    num_rows: oneshot::Sender<usize>,
}

/// Splits a CSV byte stream into chunks at row boundaries.
///
/// Bytes are forwarded untouched. A newline ends a row unless it sits
/// inside a quoted field.
pub struct FlushController {
    flush_size: usize,
    flush_rows: usize,
    num_rows: usize,
    chunk_bytes: usize,
    chunk_rows: usize,
    in_quotes: bool,
    partial_row: bool,
    current: Option<OpenChunk>,
}

impl FlushController {
    /// `flush_rows == 0` disables the row threshold.
    pub fn new(flush_size: usize, flush_rows: usize) -> Self {
        Self {
            flush_size: flush_size.max(1),
            flush_rows,
            num_rows: 0,
            chunk_bytes: 0,
            chunk_rows: 0,
            in_quotes: false,
            partial_row: false,
            current: None,
        }
    }

    /// Rows seen so far.
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Drain `input` into chunks obtained from `factory`.
    ///
    /// On failure the open chunk and `input` are both closed with the error,
    /// so neither the uploader nor the producer is left waiting.
    pub async fn pipe<F>(&mut self, mut input: PipeReader, factory: &mut F, table: &TableName) -> Result<usize>
    where
        F: ChunkWriterFactory + ?Sized,
    {
        match self.run(&mut input, factory).await {
            Ok(()) => {
                debug!(table = %table, num_rows = self.num_rows, "finished chunking table");
                Ok(self.num_rows)
            }
            Err(err) => {
                if let Some(open) = self.current.take() {
                    open.writer.close_with_error(err.clone());
                }
                input.close_with_error(err.clone());
                Err(err)
            }
        }
    }

    async fn run<F>(&mut self, input: &mut PipeReader, factory: &mut F) -> Result<()>
    where
        F: ChunkWriterFactory + ?Sized,
    {
        while let Some(data) = input.read().await? {
            self.consume(data, factory).await?;
        }

        if self.in_quotes {
            return Err(Error::Export(
                "export stream ended inside a quoted field".to_string(),
            ));
        }
        if self.partial_row {
            self.partial_row = false;
            self.num_rows += 1;
            self.chunk_rows += 1;
        }
        self.flush().await
    }

    async fn consume<F>(&mut self, data: Bytes, factory: &mut F) -> Result<()>
    where
        F: ChunkWriterFactory + ?Sized,
    {
        let mut seg_start = 0;
        for (i, &b) in data.iter().enumerate() {
            match b {
                b'"' => {
                    self.in_quotes = !self.in_quotes;
                    self.partial_row = true;
                }
                b'\n' if !self.in_quotes => {
                    self.partial_row = false;
                    self.num_rows += 1;
                    self.chunk_rows += 1;

                    let row_end = i + 1;
                    if self.threshold_reached(row_end - seg_start) {
                        self.write(data.slice(seg_start..row_end), factory).await?;
                        seg_start = row_end;
                        self.flush().await?;
                    }
                }
                _ => self.partial_row = true,
            }
        }

        if seg_start < data.len() {
            self.write(data.slice(seg_start..), factory).await?;
        }
        Ok(())
    }

    fn threshold_reached(&self, unwritten: usize) -> bool {
        self.chunk_bytes + unwritten >= self.flush_size
            || (self.flush_rows > 0 && self.chunk_rows >= self.flush_rows)
    }

    async fn write<F>(&mut self, data: Bytes, factory: &mut F) -> Result<()>
    where
        F: ChunkWriterFactory + ?Sized,
    {
        if self.current.is_none() {
            let (tx, rx) = oneshot::channel();
            let writer = factory.new_writer(rx).await?;
            self.current = Some(OpenChunk {
                writer,
                num_rows: tx,
            });
        }
        self.chunk_bytes += data.len();
        match self.current.as_mut() {
            Some(open) => open.writer.write(data).await,
            None => Err(Error::Export("no chunk writer available".to_string())),
        }
    }

    /// Close the open chunk and report its row count.
    async fn flush(&mut self) -> Result<()> {
        let rows = self.chunk_rows;
        self.chunk_bytes = 0;
        self.chunk_rows = 0;

        let Some(open) = self.current.take() else {
            return Ok(());
        };
        open.writer.close().await?;
        // The uploader may already be gone; its result is collected elsewhere.
        let _ = open.num_rows.send(rows);
        Ok(())
    }
}
