use std::collections::VecDeque;

/// Keeps the last `limit` bytes written to it.
#[derive(Debug)]
pub struct TailBuffer {
    bytes: VecDeque<u8>,
    limit: usize,
}

impl TailBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(limit.min(8192)),
            limit,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.limit == 0 {
            return;
        }
        let chunk = if chunk.len() > self.limit {
            &chunk[chunk.len() - self.limit..]
        } else {
            chunk
        };
        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.limit);
        self.bytes.drain(..overflow);
        self.bytes.extend(chunk);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lossy UTF-8 view of the retained tail.
    pub fn contents(&self) -> String {
        let (a, b) = self.bytes.as_slices();
        let mut buf = Vec::with_capacity(a.len() + b.len());
        buf.extend_from_slice(a);
        buf.extend_from_slice(b);
        String::from_utf8_lossy(&buf).into_owned()
    }
}
