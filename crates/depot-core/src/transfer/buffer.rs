//! Reusable chunk buffers.
//!
//! Transfers stream through one fixed-size buffer. Buffers go back to the
//! pool on drop, so steady-state transfers don't allocate. Allocation
//! failure is reported as an error instead of aborting the process.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("Could not allocate a {0} byte transfer buffer")]
    OutOfMemory(usize),

    #[error("Transfer buffer pool exhausted ({0} buffers in use)")]
    Exhausted(usize),
}

#[derive(Debug)]
struct PoolState {
    idle: Vec<Vec<u8>>,
    outstanding: usize,
}

#[derive(Debug, Clone)]
pub struct BufferPool {
    chunk_size: usize,
    max_outstanding: usize,
    state: Arc<Mutex<PoolState>>,
}

impl BufferPool {
    pub fn new(chunk_size: usize, max_outstanding: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            max_outstanding: max_outstanding.max(1),
            state: Arc::new(Mutex::new(PoolState {
                idle: Vec::new(),
                outstanding: 0,
            })),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Buffers currently sitting in the pool.
    pub fn idle(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).idle.len()
    }

    pub fn acquire(&self) -> Result<PooledBuffer, AllocationError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.outstanding >= self.max_outstanding {
            return Err(AllocationError::Exhausted(state.outstanding));
        }
        let buf = match state.idle.pop() {
            Some(buf) => buf,
            None => {
                let mut buf = Vec::new();
                buf.try_reserve_exact(self.chunk_size)
                    .map_err(|_| AllocationError::OutOfMemory(self.chunk_size))?;
                buf.resize(self.chunk_size, 0);
                buf
            }
        };
        state.outstanding += 1;
        Ok(PooledBuffer {
            buf,
            state: Arc::clone(&self.state),
        })
    }
}

/// A buffer on loan from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    state: Arc<Mutex<PoolState>>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.outstanding = state.outstanding.saturating_sub(1);
        state.idle.push(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_are_reused() {
        let pool = BufferPool::new(4096, 2);
        {
            let buf = pool.acquire().unwrap();
            assert_eq!(buf.len(), 4096);
        }
        assert_eq!(pool.idle(), 1);

        let _buf = pool.acquire().unwrap();
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let pool = BufferPool::new(16, 1);
        let held = pool.acquire().unwrap();
        assert_eq!(pool.acquire().unwrap_err(), AllocationError::Exhausted(1));
        drop(held);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_impossible_allocation_is_an_error() {
        let pool = BufferPool::new(usize::MAX, 1);
        assert_eq!(
            pool.acquire().unwrap_err(),
            AllocationError::OutOfMemory(usize::MAX)
        );
        // A failed allocation doesn't leak a slot
        assert_eq!(pool.idle(), 0);
    }
}
