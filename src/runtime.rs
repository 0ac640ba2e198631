use std::fmt;
use std::sync::Arc;

use crate::error::{GraphError, Result};

/// Backend collaborator that supplies raw backing storage for an arena.
/// Release is scoped: storage goes away when the last `Buffer` clone drops.
pub trait Runtime: fmt::Debug + Send + Sync {
    /// Obtain a zero-initialized buffer of `bytes` bytes.
    fn alloc(&self, bytes: usize) -> Result<Buffer>;

    /// Runtime name used in diagnostics.
    fn name(&self) -> &str;
}

/// Host-memory runtime.
#[derive(Debug, Default)]
pub struct CpuRuntime;

impl CpuRuntime {
    pub fn shared() -> Arc<dyn Runtime> {
        Arc::new(CpuRuntime)
    }
}

impl Runtime for CpuRuntime {
    fn alloc(&self, bytes: usize) -> Result<Buffer> {
        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|_| GraphError::AllocationFailed {
                op: "cpu_runtime.alloc",
                bytes,
            })?;
        data.resize(bytes, 0);
        Ok(Buffer {
            data: Arc::new(data),
        })
    }

    fn name(&self) -> &str {
        "cpu"
    }
}

/// Backing storage materialized once per arena. Clones share the storage.
#[derive(Clone)]
pub struct Buffer {
    data: Arc<Vec<u8>>,
}

impl Buffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer").field("len", &self.len()).finish()
    }
}

/// A byte range of an arena buffer, bound to one tensor.
#[derive(Clone)]
pub struct Blob {
    buffer: Buffer,
    offset: usize,
    len: usize,
}

impl Blob {
    pub(crate) fn new(buffer: Buffer, offset: usize, len: usize) -> Self {
        Self {
            buffer,
            offset,
            len,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer.as_slice()[self.offset..self.offset + self.len]
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}
