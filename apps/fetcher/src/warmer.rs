//! Process-wide memory reservation
//!
//! Simulates the footprint of a real application sharing the process with the
//! tunnel. The buffer is reserved once and held until the process exits.

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{debug, info};
use tunneled_fetch_common::constants::MEMORY_PRESSURE_BYTES;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WarmupError {
    #[error("failed to reserve {0} bytes")]
    Allocation(usize),

    #[error("memory page size is unavailable")]
    PageSize,
}

/// Result of a successful warm-up call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupStatus {
    /// This call reserved the buffer
    Reserved(usize),
    /// An earlier call already holds the buffer
    AlreadyReserved,
}

/// Holds a committed buffer for the rest of the process lifetime
pub struct MemoryPressureWarmer {
    size: usize,
    buffer: OnceCell<Box<[u8]>>,
}

impl MemoryPressureWarmer {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            buffer: OnceCell::new(),
        }
    }

    /// Reserve the buffer if it is not held yet and touch every page
    pub fn warm_up(&self) -> Result<WarmupStatus, WarmupError> {
        if self.buffer.get().is_some() {
            debug!("Memory already reserved");
            return Ok(WarmupStatus::AlreadyReserved);
        }

        let mut reserved = false;
        self.buffer.get_or_try_init(|| {
            reserved = true;
            allocate(self.size)
        })?;

        if reserved {
            info!("Reserved {} bytes of memory", self.size);
            Ok(WarmupStatus::Reserved(self.size))
        } else {
            Ok(WarmupStatus::AlreadyReserved)
        }
    }

    /// Bytes currently held, zero before a successful warm-up
    pub fn reserved_bytes(&self) -> usize {
        self.buffer.get().map_or(0, |buffer| buffer.len())
    }
}

impl Default for MemoryPressureWarmer {
    fn default() -> Self {
        Self::new(MEMORY_PRESSURE_BYTES)
    }
}

fn allocate(size: usize) -> Result<Box<[u8]>, WarmupError> {
    let page = page_size()?;

    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(size)
        .map_err(|_| WarmupError::Allocation(size))?;
    buffer.resize(size, 0u8);

    // Zero-filled pages may stay shared; write a non-zero byte per page
    for i in (0..size).step_by(page) {
        buffer[i] = (i % 7) as u8;
    }

    Ok(buffer.into_boxed_slice())
}

/// Size of a virtual memory page
#[cfg(unix)]
pub fn page_size() -> Result<usize, WarmupError> {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size)
        .ok()
        .filter(|size| *size > 0)
        .ok_or(WarmupError::PageSize)
}

#[cfg(not(unix))]
pub fn page_size() -> Result<usize, WarmupError> {
    Ok(tunneled_fetch_common::constants::FALLBACK_PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunneled_fetch_common::constants::FALLBACK_PAGE_SIZE;

    #[test]
    fn test_page_size_is_positive() {
        let size = page_size().unwrap();
        assert!(size > 0);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn test_warm_up_is_idempotent() {
        let warmer = MemoryPressureWarmer::new(64 * 1024);
        assert_eq!(warmer.reserved_bytes(), 0);

        assert_eq!(warmer.warm_up(), Ok(WarmupStatus::Reserved(64 * 1024)));
        assert_eq!(warmer.reserved_bytes(), 64 * 1024);

        assert_eq!(warmer.warm_up(), Ok(WarmupStatus::AlreadyReserved));
        assert_eq!(warmer.reserved_bytes(), 64 * 1024);
    }

    #[test]
    fn test_pages_are_touched() {
        let page = page_size().unwrap();
        let buffer = allocate(page * 8 + 1).unwrap();

        assert_eq!(buffer.len(), page * 8 + 1);
        for i in (0..buffer.len()).step_by(page) {
            assert_eq!(buffer[i], (i % 7) as u8);
        }
    }

    #[test]
    fn test_impossible_allocation_fails() {
        let warmer = MemoryPressureWarmer::new(usize::MAX);

        assert_eq!(warmer.warm_up(), Err(WarmupError::Allocation(usize::MAX)));
        assert_eq!(warmer.reserved_bytes(), 0);
    }

    #[test]
    fn test_default_size() {
        let warmer = MemoryPressureWarmer::default();
        assert_eq!(warmer.size, MEMORY_PRESSURE_BYTES);
        assert_eq!(warmer.reserved_bytes(), 0);
    }

    #[test]
    fn test_fallback_page_size() {
        assert!(FALLBACK_PAGE_SIZE.is_power_of_two());
    }
}
