//! Defines the `MemSize` trait for tracking memory usage.

use crate::value::Value;
use std::sync::Arc;

/// A trait for types to report their memory usage, including heap-allocated data.
///
/// The version store sums these figures into the memory gauge reported by
/// [`crate::db::Engine::stats`].
pub trait MemSize {
    /// Returns the total memory size of the value in bytes.
    fn mem_size(&self) -> usize;
}

impl MemSize for [u8] {
    fn mem_size(&self) -> usize {
        self.len()
    }
}

impl MemSize for Box<[u8]> {
    fn mem_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.len()
    }
}

impl MemSize for Value {
    fn mem_size(&self) -> usize {
        match self {
            Value::Inline { .. } => std::mem::size_of::<Self>(),
            // Arc header (two counters) plus the payload.
            Value::Heap(bytes) => {
                std::mem::size_of::<Self>() + 2 * std::mem::size_of::<usize>() + bytes.len()
            }
        }
    }
}

impl<T: MemSize + ?Sized> MemSize for Arc<T> {
    fn mem_size(&self) -> usize {
        std::mem::size_of::<Self>() + (**self).mem_size()
    }
}

impl<T: MemSize> MemSize for Option<T> {
    fn mem_size(&self) -> usize {
        match self {
            Some(v) => v.mem_size(),
            None => std::mem::size_of::<Self>(),
        }
    }
}
