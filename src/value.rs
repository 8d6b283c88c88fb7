//! Byte keys and values.
//!
//! Keys are plain boxed byte slices ordered byte-wise. Values use a small sum
//! type: payloads up to [`INLINE_CAPACITY`] bytes live inside the `Value`
//! itself, larger payloads are shared on the heap. Both are read through
//! [`Value::as_bytes`].

use crate::error::{FluxError, Result};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// The largest payload stored without a heap allocation.
pub const INLINE_CAPACITY: usize = 22;

/// The owned form of a key.
pub type Key = Box<[u8]>;

/// Checks that `key` can be stored and logged, and copies it.
pub(crate) fn make_key(key: &[u8]) -> Result<Key> {
    validate_key(key)?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(key.len())
        .map_err(|_| FluxError::OutOfMemory(key.len()))?;
    buf.extend_from_slice(key);
    Ok(buf.into_boxed_slice())
}

pub(crate) fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(FluxError::InvalidArgument("key must not be empty"));
    }
    if u32::try_from(key.len()).is_err() {
        return Err(FluxError::InvalidArgument("key length exceeds u32::MAX"));
    }
    Ok(())
}

/// An immutable value payload.
#[derive(Clone)]
pub enum Value {
    Inline { len: u8, buf: [u8; INLINE_CAPACITY] },
    Heap(Arc<[u8]>),
}

impl Value {
    /// Copies `bytes` into a new value, inline when it fits.
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if u32::try_from(bytes.len()).is_err() {
            return Err(FluxError::InvalidArgument("value length exceeds u32::MAX"));
        }
        if bytes.len() <= INLINE_CAPACITY {
            let mut buf = [0u8; INLINE_CAPACITY];
            buf[..bytes.len()].copy_from_slice(bytes);
            return Ok(Value::Inline {
                len: bytes.len() as u8,
                buf,
            });
        }
        let mut owned = Vec::new();
        owned
            .try_reserve_exact(bytes.len())
            .map_err(|_| FluxError::OutOfMemory(bytes.len()))?;
        owned.extend_from_slice(bytes);
        Ok(Value::Heap(Arc::from(owned)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Value::Inline { len, buf } => &buf[..*len as usize],
            Value::Heap(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, Value::Inline { .. })
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl Deref for Value {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl AsRef<[u8]> for Value {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Value {}

impl PartialEq<[u8]> for Value {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

impl PartialEq<&[u8]> for Value {
    fn eq(&self, other: &&[u8]) -> bool {
        self.as_bytes() == *other
    }
}

impl<const N: usize> PartialEq<&[u8; N]> for Value {
    fn eq(&self, other: &&[u8; N]) -> bool {
        self.as_bytes() == &other[..]
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_inline() { "Inline" } else { "Heap" };
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => write!(f, "{}({:?})", kind, s),
            Err(_) => write!(f, "{}({:?})", kind, self.as_bytes()),
        }
    }
}
