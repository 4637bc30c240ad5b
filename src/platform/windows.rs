// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 flatcache contributors
//
// Windows reservation of the storage region via VirtualAlloc.  Committed
// read-write pages are still faulted in lazily by the memory manager.

use std::io;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};

/// Reserve `len` bytes of private read-write memory.
pub fn reserve(len: usize) -> io::Result<*mut u8> {
    let mem = unsafe {
        VirtualAlloc(
            ptr::null_mut(),
            len,
            MEM_RESERVE | MEM_COMMIT,
            PAGE_READWRITE,
        )
    };
    if mem.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(mem as *mut u8)
}

/// Release a reservation obtained from [`reserve`].
///
/// # Safety
/// `mem` must name exactly one prior successful `reserve` call, and no
/// pointer into the region may be used afterwards.
pub unsafe fn release(mem: *mut u8, _len: usize) {
    VirtualFree(mem as *mut core::ffi::c_void, 0, MEM_RELEASE);
}
