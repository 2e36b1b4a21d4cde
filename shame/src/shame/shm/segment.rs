//! The on-disk (well, in-kernel) layout of the managed segment and the POSIX
//! plumbing that maps it.
//!
//! The segment starts with a fixed [`SegmentHeader`]: a magic/version stamp,
//! a bump allocator cursor, and a table of named entries guarded by a spin
//! lock. Every cross-process reference inside the segment is a byte offset
//! from the segment base, never a pointer, because each process maps the
//! segment at its own address.

use libc;
use std::ffi::CString;
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use error::ShmError;

use super::lock::{SharableLock, SpinLock};

const SEGMENT_MAGIC: u32 = 0x5348_414D;
const SEGMENT_VERSION: u32 = 1;

/// Number of slots in the registry table. Slots are never reclaimed; the
/// table is sized for "a handful of channels per segment".
pub const MAX_ENTRIES: usize = 64;

/// Size of the fixed name field of a table slot.
pub const MAX_KEY_LEN: usize = 128;

const ALLOC_ALIGN: u64 = 64;

/// One keyed record: the reader/writer lock and the control block of the
/// resizable byte buffer behind it.
#[repr(C)]
pub struct Record {
    pub lock: SharableLock,
    _pad: u32,
    pub len: u64,
    pub capacity: u64,
    pub data_off: u64,
}

#[repr(C)]
struct EntryRecord {
    used: u32,
    name_len: u32,
    name: [u8; MAX_KEY_LEN],
    record: Record,
}

#[repr(C)]
struct SegmentHeader {
    magic: u32,
    version: u32,
    segment_size: u64,
    alloc_head: AtomicU64,
    table_lock: SpinLock,
    _pad: u32,
    entries: [EntryRecord; MAX_ENTRIES],
}

/// A mapped named shared memory segment.
///
/// `open` attaches to an existing segment; `create` builds a fresh one and
/// is reserved for the bootstrap utility and for tests. Dropping a `Segment`
/// unmaps it without touching the kernel object; only [`Segment::unlink`]
/// removes the name.
pub struct Segment {
    base: *mut u8,
    size: usize,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Opens an existing segment read/write and validates its header.
    pub fn open(name: &str) -> io::Result<Segment> {
        let cname = segment_name(name)?;

        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o666) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let size = match segment_size(fd) {
            Ok(size) => size,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        let segment = Segment::map(fd, size)?;

        let header = segment.header();
        if header.magic != SEGMENT_MAGIC || header.version != SEGMENT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared memory segment has no registry header",
            ));
        }
        if header.segment_size != size as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared memory segment size disagrees with its header",
            ));
        }

        Ok(segment)
    }

    /// Creates a segment of `size` bytes, replacing any previous one of the
    /// same name, and writes a fresh registry header into it.
    pub fn create(name: &str, size: usize) -> io::Result<Segment> {
        let min_size = mem::size_of::<SegmentHeader>() + 4096;
        if size < min_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("segment must be at least {} bytes", min_size),
            ));
        }

        let cname = segment_name(name)?;
        unsafe { libc::shm_unlink(cname.as_ptr()) };

        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o666,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let e = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(e);
        }

        let segment = Segment::map(fd, size)?;

        // ftruncate produced an all-zero mapping, which is already the valid
        // empty state of the table and both lock types. Only the scalar
        // fields need writing.
        unsafe {
            let header = segment.base as *mut SegmentHeader;
            (*header).magic = SEGMENT_MAGIC;
            (*header).version = SEGMENT_VERSION;
            (*header).segment_size = size as u64;
            (*header)
                .alloc_head
                .store(align_up(mem::size_of::<SegmentHeader>() as u64), Ordering::Release);
        }

        Ok(segment)
    }

    /// Removes the kernel object behind the name, if any.
    pub fn unlink(name: &str) {
        if let Ok(cname) = segment_name(name) {
            unsafe { libc::shm_unlink(cname.as_ptr()) };
        }
    }

    fn map(fd: libc::c_int, size: usize) -> io::Result<Segment> {
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Segment {
            base: base as *mut u8,
            size,
        })
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.base as *const SegmentHeader) }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Looks up a key in the registry table.
    pub fn find(&self, key: &str) -> Option<*mut Record> {
        let header = self.header();
        header.table_lock.lock();
        let record = self.lookup(key);
        header.table_lock.unlock();
        record
    }

    /// Looks up a key, constructing an empty record for it if absent.
    pub fn find_or_construct(&self, key: &str) -> Result<*mut Record, ShmError> {
        if key.len() > MAX_KEY_LEN {
            return Err(ShmError::KeyTooLong { len: key.len() });
        }

        let header = self.header();
        header.table_lock.lock();

        if let Some(record) = self.lookup(key) {
            header.table_lock.unlock();
            return Ok(record);
        }

        let result = unsafe {
            let table = self.base as *mut SegmentHeader;
            let mut slot = None;
            for i in 0..MAX_ENTRIES {
                if (*table).entries[i].used == 0 {
                    slot = Some(i);
                    break;
                }
            }
            match slot {
                Some(i) => {
                    let entry = &mut (*table).entries[i];
                    entry.name[..key.len()].copy_from_slice(key.as_bytes());
                    entry.name_len = key.len() as u32;
                    entry.record.len = 0;
                    entry.record.capacity = 0;
                    entry.record.data_off = 0;
                    entry.used = 1;
                    Ok(&mut entry.record as *mut Record)
                }
                None => Err(ShmError::TableFull),
            }
        };

        header.table_lock.unlock();
        result
    }

    fn lookup(&self, key: &str) -> Option<*mut Record> {
        unsafe {
            let table = self.base as *mut SegmentHeader;
            for i in 0..MAX_ENTRIES {
                let entry = &mut (*table).entries[i];
                if entry.used != 0
                    && entry.name_len as usize == key.len()
                    && &entry.name[..key.len()] == key.as_bytes()
                {
                    return Some(&mut entry.record as *mut Record);
                }
            }
        }
        None
    }

    /// Carves `size` bytes out of the bump region.
    ///
    /// Grown buffers abandon their previous block; the allocator never
    /// reclaims. The bootstrap utility is expected to size the segment with
    /// headroom for that.
    pub fn alloc(&self, size: usize) -> Result<u64, ShmError> {
        let header = self.header();
        let mut cur = header.alloc_head.load(Ordering::Relaxed);
        loop {
            let start = align_up(cur);
            let end = match start.checked_add(size as u64) {
                Some(end) if end <= self.size as u64 => end,
                _ => return Err(ShmError::SegmentFull { requested: size }),
            };
            match header.alloc_head.compare_exchange_weak(
                cur,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(start),
                Err(actual) => cur = actual,
            }
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

fn align_up(offset: u64) -> u64 {
    (offset + ALLOC_ALIGN - 1) & !(ALLOC_ALIGN - 1)
}

/// Normalizes a segment name into the single-leading-slash form POSIX wants.
fn segment_name(name: &str) -> io::Result<CString> {
    let mut normalized = String::with_capacity(name.len() + 1);
    normalized.push('/');
    for c in name.chars() {
        normalized.push(if c == '/' { '_' } else { c });
    }
    CString::new(normalized)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "segment name contains NUL"))
}

fn segment_size(fd: libc::c_int) -> io::Result<usize> {
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.st_size as usize)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn align_up_rounds_to_cache_lines() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 64);
        assert_eq!(align_up(64), 64);
        assert_eq!(align_up(65), 128);
    }

    #[test]
    fn header_is_compact() {
        // The table must leave the bulk of a small segment for payloads.
        assert!(mem::size_of::<SegmentHeader>() < 16 * 1024);
        assert_eq!(mem::size_of::<Record>(), 32);
    }

    #[test]
    fn names_are_normalized() {
        assert_eq!(segment_name("Shame").unwrap().to_bytes(), b"/Shame");
        assert_eq!(segment_name("/Shame").unwrap().to_bytes(), b"/_Shame");
        assert_eq!(segment_name("a/b").unwrap().to_bytes(), b"/a_b");
        assert!(segment_name("a\0b").is_err());
    }
}
