//! Async I/O traits and utilities.
//!
//! Re-exports tokio's I/O traits so downstream crates can describe byte
//! streams without depending on tokio.
//!
//! # Examples
//!
//! ```rust
//! use core_async::io::{AsyncRead, AsyncReadExt};
//!
//! async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<Vec<u8>> {
//!     let mut buffer = Vec::new();
//!     reader.read_to_end(&mut buffer).await?;
//!     Ok(buffer)
//! }
//! ```

pub use tokio::io::{
    copy, duplex, empty, sink, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeek,
    AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, DuplexStream, ReadBuf,
    ReadHalf, WriteHalf,
};

pub use tokio::io::{split, Error, ErrorKind};
