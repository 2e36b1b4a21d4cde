//! The shared memory registry.
//!
//! A registry lives inside a named segment created ahead of time by the
//! `shame-server` bootstrap utility. Each entry pairs a process-shared
//! reader/writer lock with a resizable byte buffer; the bus keys entries by
//! channel name. Any number of processes may read an entry concurrently
//! while a writer is excluded, and vice versa.

mod lock;
mod segment;

use std::ops::Deref;
use std::ptr;
use std::slice;
use std::sync::Arc;

use error::{InitError, ShmError};

use self::segment::{Record, Segment};

/// A handle to the registry of a named shared memory segment.
pub struct Shm {
    name: String,
    segment: Arc<Segment>,
}

impl Shm {
    /// Opens the registry of an existing segment. The segment is never
    /// created here; that is the bootstrap utility's job.
    pub fn open(name: &str) -> Result<Shm, InitError> {
        let segment = Segment::open(name).map_err(|cause| InitError::ShmOpen {
            name: name.to_string(),
            cause,
        })?;
        debug!("Opened shared memory segment \"{}\"", name);
        Ok(Shm {
            name: name.to_string(),
            segment: Arc::new(segment),
        })
    }

    /// Creates a fresh segment of `size` bytes and opens its registry.
    ///
    /// Reserved for the bootstrap utility and for tests; a bus instance only
    /// ever calls [`Shm::open`].
    pub fn create(name: &str, size: usize) -> Result<Shm, InitError> {
        let segment = Segment::create(name, size).map_err(|cause| InitError::ShmOpen {
            name: name.to_string(),
            cause,
        })?;
        debug!("Created {} byte shared memory segment \"{}\"", size, name);
        Ok(Shm {
            name: name.to_string(),
            segment: Arc::new(segment),
        })
    }

    /// Removes the named segment from the system.
    pub fn unlink(name: &str) {
        Segment::unlink(name);
    }

    /// The name the segment was opened under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up the entry for `key`.
    pub fn find(&self, key: &str) -> Option<ShameData> {
        self.segment.find(key).map(|record| ShameData {
            record,
            segment: self.segment.clone(),
        })
    }

    /// Looks up the entry for `key`, constructing an empty one if absent.
    pub fn find_or_construct(&self, key: &str) -> Result<ShameData, ShmError> {
        self.segment.find_or_construct(key).map(|record| ShameData {
            record,
            segment: self.segment.clone(),
        })
    }

    /// Stores `data` into the entry keyed by `key` under its exclusive lock,
    /// resizing the entry's buffer as needed. Returns the byte count stored.
    pub fn put(&self, key: &str, data: &[u8]) -> Result<usize, ShmError> {
        let entry = self.find_or_construct(key)?;
        entry.write(data)?;
        Ok(data.len())
    }
}

/// A registry entry: a process-shared lock in front of a byte buffer.
///
/// Subscribers receive one of these in their shared memory callback and are
/// expected to take the shared lock via [`ShameData::read`] before looking
/// at the bytes.
pub struct ShameData {
    record: *mut Record,
    segment: Arc<Segment>,
}

unsafe impl Send for ShameData {}
unsafe impl Sync for ShameData {}

impl ShameData {
    /// Takes the shared lock and returns a guard dereferencing to the bytes.
    pub fn read(&self) -> ShmReadGuard {
        unsafe { (*self.record).lock.lock_sharable() };
        ShmReadGuard { entry: self }
    }

    /// Replaces the entry's bytes under the exclusive lock.
    fn write(&self, data: &[u8]) -> Result<(), ShmError> {
        unsafe {
            let record = self.record;
            (*record).lock.lock();

            if (data.len() as u64) > (*record).capacity {
                match self.segment.alloc(data.len()) {
                    Ok(offset) => {
                        (*record).data_off = offset;
                        (*record).capacity = data.len() as u64;
                    }
                    Err(e) => {
                        (*record).lock.unlock();
                        return Err(e);
                    }
                }
            }

            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.segment.base().add((*record).data_off as usize),
                data.len(),
            );
            (*record).len = data.len() as u64;

            (*record).lock.unlock();
        }
        Ok(())
    }

    fn bytes(&self) -> &[u8] {
        unsafe {
            let record = self.record;
            slice::from_raw_parts(
                self.segment.base().add((*record).data_off as usize),
                (*record).len as usize,
            )
        }
    }
}

/// Shared-lock guard over a registry entry's bytes.
///
/// Holding the guard keeps writers out; dropping it releases the shared
/// lock. The guard only ever exposes an immutable view, so readers cannot
/// resize or scribble on the entry.
pub struct ShmReadGuard<'a> {
    entry: &'a ShameData,
}

impl<'a> Deref for ShmReadGuard<'a> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.entry.bytes()
    }
}

impl<'a> Drop for ShmReadGuard<'a> {
    fn drop(&mut self) {
        unsafe { (*self.entry.record).lock.unlock_sharable() };
    }
}
