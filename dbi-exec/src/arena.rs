//! mmap-backed arenas for an `ExecBlock`'s code and data. Mirrors the
//! teacher's `CodeBuffer`: allocate RW, emit, flip to RX before any guest
//! execution, flip back to RW only when the region is being patched
//! (invalidation, `splitSequence`). This W^X discipline is the concrete
//! form of the code/data arena invariants in the data model (§3 ii/iii).

use std::ptr;

/// A single mmap'd region that toggles between writable and executable.
/// Never both at once outside of a short invalidate/rewrite window.
pub struct Arena {
    ptr: *mut u8,
    size: usize,
    offset: usize,
    executable: bool,
}

unsafe impl Send for Arena {}

impl Arena {
    pub fn new(size: usize) -> std::io::Result<Self> {
        let page = page_size();
        let size = (size + page - 1) & !(page - 1);
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            offset: 0,
            executable: false,
        })
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn remaining(&self) -> usize {
        self.size - self.offset
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn ptr_at(&self, off: usize) -> *const u8 {
        assert!(off <= self.size);
        unsafe { self.ptr.add(off) }
    }

    /// Append bytes at the current offset. Caller must have checked
    /// `remaining() >= bytes.len()` and that the arena is currently
    /// writable (not executable).
    pub fn emit(&mut self, bytes: &[u8]) -> usize {
        assert!(!self.executable, "arena must be writable to emit code");
        assert!(self.offset + bytes.len() <= self.size, "arena overflow");
        let start = self.offset;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(start), bytes.len());
        }
        self.offset += bytes.len();
        start
    }

    /// Patch bytes already written, at an arbitrary offset (used for
    /// label/fixup back-patching). Valid whether or not the arena is
    /// currently marked executable only on platforms where W^X is not
    /// enforced; callers needing strict W^X must `set_writable()` first.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.size);
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
    }

    pub fn set_executable(&mut self) -> std::io::Result<()> {
        let ret = unsafe {
            libc::mprotect(
                self.ptr as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        self.executable = true;
        Ok(())
    }

    pub fn set_writable(&mut self) -> std::io::Result<()> {
        let ret = unsafe {
            libc::mprotect(
                self.ptr as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        self.executable = false;
        Ok(())
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    pub fn reset(&mut self) {
        self.offset = 0;
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
