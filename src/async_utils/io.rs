//! I/O utilities.
//!
//! This module is responsible for reading JSON or TOML configuration and
//! fixture files, auto-detecting the format from the file extension and
//! first byte, the way the rest of this code base does for its other
//! "smart" inputs.

use std::pin::Pin;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt as _, AsyncWrite, BufReader};

use crate::prelude::*;

/// Create an [`AsyncWrite`] for a file or, when `path` is `None`, standard
/// output.
pub async fn create_writer(path: Option<&Path>) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// A smart async reader that detects whether the input is JSON-like or
/// TOML-like, either from the file extension or by peeking at the first
/// non-whitespace byte.
pub struct SmartReader {
    /// Do we expect our input to be JSON?
    is_json_like: bool,

    /// Our reader.
    reader: Pin<Box<dyn AsyncBufRead + Unpin + Send + Sync + 'static>>,
}

impl SmartReader {
    /// Create a new `SmartReader` from an existing reader, sniffing the
    /// format from the first non-whitespace byte.
    pub async fn new_from_reader(
        reader: impl AsyncRead + Unpin + Send + Sync + 'static,
    ) -> Result<Self> {
        let mut reader = BufReader::new(reader);
        let is_json_like = loop {
            let buffer = reader
                .fill_buf()
                .await
                .context("failed to sniff input format")?;
            match buffer.first() {
                None => break false,
                Some(b) if b.is_ascii_whitespace() => {
                    reader.consume(1);
                    continue;
                }
                Some(b) => break *b == b'{' || *b == b'[',
            }
        };
        Ok(Self {
            is_json_like,
            reader: Box::pin(reader),
        })
    }

    /// Create a new `SmartReader` from a [`Path`], sniffing the format from
    /// the file extension.
    pub async fn new_from_path(path: &Path) -> Result<Self> {
        let ext = path.extension().unwrap_or_default();
        let is_json_like = ext == "json";
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open file at path: {:?}", path))?;
        Ok(Self {
            is_json_like,
            reader: Box::pin(BufReader::new(file)),
        })
    }
}

/// Read TOML or JSON from a file, auto-detecting the format.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let mut reader = SmartReader::new_from_path(path).await?;
    let mut data = String::new();
    reader
        .reader
        .read_to_string(&mut data)
        .await
        .with_context(|| format!("failed to read file at path: {:?}", path))?;
    if reader.is_json_like {
        serde_json::from_str(&data)
            .with_context(|| format!("failed to parse JSON from file at path: {:?}", path))
    } else {
        toml::from_str(&data)
            .with_context(|| format!("failed to parse TOML from file at path: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sniffs_json_from_content() {
        let reader = SmartReader::new_from_reader(std::io::Cursor::new(b"  {\"a\": 1}".to_vec()))
            .await
            .unwrap();
        assert!(reader.is_json_like);
    }

    #[tokio::test]
    async fn test_sniffs_toml_from_content() {
        let reader = SmartReader::new_from_reader(std::io::Cursor::new(b"a = 1\n".to_vec()))
            .await
            .unwrap();
        assert!(!reader.is_json_like);
    }
}
