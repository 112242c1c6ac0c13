//! Narrow `libc::mmap`/`mprotect` wrapper satisfying whatever trait
//! `dbi-exec`'s arena would take from an external memory manager, kept
//! here rather than exported from `dbi-exec` itself so that crate's
//! public surface doesn't force every consumer to depend on `libc`
//! directly for this one concern.

use std::ptr;

pub fn reserve_rw(size: usize) -> std::io::Result<*mut u8> {
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
    Ok(ptr as *mut u8)
}

/// # Safety
/// `ptr`/`size` must describe a live mapping obtained from `reserve_rw`.
pub unsafe fn release(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}
