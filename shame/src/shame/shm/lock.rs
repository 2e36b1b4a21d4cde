//! Locks that live inside the shared memory segment.
//!
//! Both locks are a single atomic word with no owner bookkeeping, so they
//! work across processes as long as the word itself is mapped into each
//! address space. Contention is handled with an adaptive backoff that
//! escalates from busy spinning to yielding to sleeping.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

#[inline]
fn backoff(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        ::std::hint::spin_loop();
    } else if *k < 32 {
        thread::yield_now();
    } else {
        thread::sleep(Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// High bit marks the exclusive holder; the low 31 bits count readers.
const WRITER: u32 = 1 << 31;
const READER_MASK: u32 = WRITER - 1;

/// A process-shared reader/writer lock.
///
/// Multiple holders may take the sharable side concurrently; the exclusive
/// side excludes readers and other writers. Every registry entry embeds one
/// of these in front of its byte buffer.
#[repr(transparent)]
pub struct SharableLock {
    state: AtomicU32,
}

impl SharableLock {
    pub const fn new() -> Self {
        SharableLock {
            state: AtomicU32::new(0),
        }
    }

    /// Acquires the lock exclusively.
    pub fn lock(&self) {
        let mut k = 0u32;
        loop {
            let old = self.state.fetch_or(WRITER, Ordering::AcqRel);
            if old == 0 {
                // No readers and no writer.
                return;
            }
            if old & WRITER == 0 {
                // We took the writer bit; readers are still draining.
                break;
            }
            // Another writer holds the lock.
            backoff(&mut k);
        }

        let mut k = 0u32;
        while self.state.load(Ordering::Acquire) & READER_MASK != 0 {
            backoff(&mut k);
        }
    }

    /// Releases the exclusive lock.
    pub fn unlock(&self) {
        self.state.store(0, Ordering::Release);
    }

    /// Acquires the lock in shared mode.
    pub fn lock_sharable(&self) {
        let mut k = 0u32;
        let mut old = self.state.load(Ordering::Acquire);
        loop {
            if old & WRITER != 0 {
                backoff(&mut k);
                old = self.state.load(Ordering::Acquire);
            } else {
                match self.state.compare_exchange_weak(
                    old,
                    old + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return,
                    Err(actual) => old = actual,
                }
            }
        }
    }

    /// Releases a shared hold.
    pub fn unlock_sharable(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }
}

/// A plain spin lock guarding the registry table.
///
/// Table operations are short (a scan over a fixed array), so spinning beats
/// parking even across processes.
#[repr(transparent)]
pub struct SpinLock {
    state: AtomicU32,
}

impl SpinLock {
    pub const fn new() -> Self {
        SpinLock {
            state: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) {
        let mut k = 0u32;
        while self.state.swap(1, Ordering::Acquire) != 0 {
            backoff(&mut k);
        }
    }

    pub fn unlock(&self) {
        self.state.store(0, Ordering::Release);
    }
}
