use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use plexus_core::TailBuffer;

pub type SharedTail = Arc<Mutex<TailBuffer>>;

/// Copy a pipe into a shared tail buffer until EOF.
pub async fn drain_into<R: AsyncRead + Unpin>(mut pipe: R, tail: SharedTail) {
    let mut chunk = [0u8; 1024];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => tail.lock().push(&chunk[..n]),
        }
    }
}
