use std::fmt;
use std::io::Write;
use std::str::FromStr;

use bytes::Bytes;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::pipe::PipeWriter;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    /// Extension used in chunk names for this scheme.
    pub fn file_extension(&self) -> &'static str {
        match self {
            Compression::None => "csv",
            Compression::Gzip => "tar.gz",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => f.write_str("none"),
            Compression::Gzip => f.write_str("gzip"),
        }
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "gzip" | "gz" => Ok(Compression::Gzip),
            other => Err(Error::Configuration(format!(
                "unknown compression type '{}'",
                other
            ))),
        }
    }
}

/// Writer for one chunk, optionally compressing before the chunk pipe.
#[derive(Debug)]
pub enum ChunkWriter {
    Plain(PipeWriter),
    Gzip(GzipPipeWriter),
}

impl ChunkWriter {
    pub fn new(inner: PipeWriter, compression: Compression) -> Self {
        match compression {
            Compression::None => ChunkWriter::Plain(inner),
            Compression::Gzip => ChunkWriter::Gzip(GzipPipeWriter::new(inner)),
        }
    }

    pub async fn write(&mut self, data: Bytes) -> Result<()> {
        match self {
            ChunkWriter::Plain(w) => w.write(data).await,
            ChunkWriter::Gzip(w) => w.write(data).await,
        }
    }

    /// Flush any compressor state and close the chunk pipe.
    pub async fn close(self) -> Result<()> {
        match self {
            ChunkWriter::Plain(mut w) => w.close(),
            ChunkWriter::Gzip(w) => w.close().await,
        }
    }

    pub fn close_with_error(self, err: Error) {
        match self {
            ChunkWriter::Plain(mut w) => w.close_with_error(err),
            ChunkWriter::Gzip(mut w) => w.inner.close_with_error(err),
        }
    }
}

pub struct GzipPipeWriter {
    encoder: GzEncoder<Vec<u8>>,
    inner: PipeWriter,
}

impl fmt::Debug for GzipPipeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GzipPipeWriter")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl GzipPipeWriter {
    pub fn new(inner: PipeWriter) -> Self {
        Self {
            encoder: GzEncoder::new(Vec::new(), flate2::Compression::default()),
            inner,
        }
    }

    pub async fn write(&mut self, data: Bytes) -> Result<()> {
        self.encoder.write_all(&data)?;
        self.forward().await
    }

    async fn forward(&mut self) -> Result<()> {
        let out = std::mem::take(self.encoder.get_mut());
        if out.is_empty() {
            return Ok(());
        }
        self.inner.write(Bytes::from(out)).await
    }

    pub async fn close(mut self) -> Result<()> {
        let finished = match self.encoder.try_finish() {
            Ok(()) => self.forward().await,
            Err(e) => Err(Error::from(e)),
        };
        match finished {
            Ok(()) => self.inner.close(),
            Err(err) => {
                self.inner.close_with_error(err.clone());
                Err(err)
            }
        }
    }
}
