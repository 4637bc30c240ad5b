// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 flatcache contributors
//
// POSIX reservation of the storage region: one anonymous, private,
// read-write mapping for the lifetime of the process.  Pages are faulted in
// lazily by the kernel, which is what keeps the engine's `grow()` cheap —
// reserving a multi-gigabyte region touches nothing.

use std::io;
use std::ptr;

/// Reserve `len` bytes of anonymous private read-write memory.
pub fn reserve(len: usize) -> io::Result<*mut u8> {
    let mem = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if mem == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(mem as *mut u8)
}

/// Release a reservation obtained from [`reserve`].
///
/// # Safety
/// `mem`/`len` must name exactly one prior successful `reserve` call, and
/// no pointer into the region may be used afterwards.
pub unsafe fn release(mem: *mut u8, len: usize) {
    libc::munmap(mem as *mut libc::c_void, len);
}
