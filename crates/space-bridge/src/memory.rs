//! Marshaling between guest byte ranges and host values.
//!
//! The guest only hands over `(ptr, len)` integers addressing its own linear
//! memory. [`GuestMemory`] is the accessor the runtime provides for that
//! memory; [`deliver`] implements the size-negotiation convention shared by
//! every call that returns variable-length data into a guest buffer:
//!
//! - `n <= buffer_len`: the result is written and `n` is returned,
//! - `n > buffer_len`: nothing is written and `-n` is returned so the guest
//!   can grow its buffer and retry.

use crate::{Error, Result};

/// Accessor for a guest's linear memory.
///
/// Bounds are checked against the whole memory region only; whether the
/// destination range belongs to a guest allocation of sufficient size is the
/// caller's responsibility.
pub trait GuestMemory {
    /// Current size of the memory region in bytes.
    fn size(&self) -> u64;

    fn read(&self, ptr: u32, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<()>;

    fn load_bytes(&self, ptr: u32, len: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.read(ptr, &mut buf)?;
        Ok(buf)
    }

    fn load_string(&self, ptr: u32, len: u32) -> Result<String> {
        let bytes = self.load_bytes(ptr, len)?;
        String::from_utf8(bytes).map_err(|e| Error::Utf8(e.utf8_error()))
    }

    fn store_bytes(&mut self, ptr: u32, bytes: &[u8]) -> Result<()> {
        self.write(ptr, bytes)
    }

    fn store_string(&mut self, ptr: u32, text: &str) -> Result<()> {
        self.write(ptr, text.as_bytes())
    }
}

/// Check that `[ptr, ptr + len)` lies inside a region of `size` bytes.
pub fn check_range(ptr: u32, len: usize, size: u64) -> Result<std::ops::Range<usize>> {
    let start = ptr as u64;
    let end = start + len as u64;
    if end > size {
        return Err(Error::OutOfBounds {
            ptr: start,
            len: len as u64,
            size,
        });
    }
    Ok(start as usize..end as usize)
}

/// Signed length as returned to the guest, saturating at `i32::MAX`.
pub fn guest_len(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Write `bytes` into the guest buffer `(ptr, cap)` following the
/// size-negotiation convention.
pub fn deliver(memory: &mut dyn GuestMemory, ptr: u32, cap: u32, bytes: &[u8]) -> Result<i32> {
    let n = guest_len(bytes.len());
    if bytes.len() <= cap as usize {
        memory.store_bytes(ptr, bytes)?;
        Ok(n)
    } else {
        Ok(-n)
    }
}

/// Plain byte vector acting as guest memory.
///
/// Used by hosts that marshal through a scratch buffer, and by tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinearMemory {
    data: Vec<u8>,
}

impl LinearMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
        }
    }

    /// Copy `bytes` to `ptr`, growing the memory if needed. Returns `(ptr, len)`.
    pub fn place(&mut self, ptr: u32, bytes: &[u8]) -> (u32, u32) {
        let end = ptr as usize + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[ptr as usize..end].copy_from_slice(bytes);
        (ptr, bytes.len() as u32)
    }

    /// `None` if the range is out of bounds.
    pub fn slice(&self, ptr: u32, len: u32) -> Option<&[u8]> {
        let range = check_range(ptr, len as usize, self.size()).ok()?;
        self.data.get(range)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl GuestMemory for LinearMemory {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&self, ptr: u32, buf: &mut [u8]) -> Result<()> {
        let range = check_range(ptr, buf.len(), self.size())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<()> {
        let range = check_range(ptr, bytes.len(), self.size())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }
}
