//! Chunked file streaming
//!
//! Shared by download responses and the client upload so that neither side
//! holds a whole executable in memory.

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Read size per chunk (64KB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Stream the remaining contents of `file` in chunks of at most [`CHUNK_SIZE`]
pub fn file_chunks(file: File) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    futures::stream::try_unfold(file, |mut file| async move {
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        let n = file.read_buf(&mut buf).await?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some((buf.freeze(), file)))
        }
    })
}
