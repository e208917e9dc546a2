//! Discovering the stack top.

use std::io;
use std::ptr::NonNull;

/// Highest address of the current thread's stack — the address the stack
/// grows down from.
///
/// Call once per thread, before that thread's first handle operation,
/// and record the result with [`crate::HandleConfig::set_stack_top`].
///
/// Platform notes: on Linux and Android this reads the pthread stack
/// attributes; on macOS and iOS it asks pthread for the stack address
/// directly. Other platforms report [`io::ErrorKind::Unsupported`].
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn thread_stack_top() -> io::Result<NonNull<u8>> {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        let err = libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
        if err != 0 {
            return Err(io::Error::from_raw_os_error(err));
        }
        let mut stack_addr: *mut libc::c_void = std::ptr::null_mut();
        let mut stack_size: libc::size_t = 0;
        let err = libc::pthread_attr_getstack(&attr, &mut stack_addr, &mut stack_size);
        libc::pthread_attr_destroy(&mut attr);
        if err != 0 {
            return Err(io::Error::from_raw_os_error(err));
        }
        Ok(NonNull::new_unchecked(
            (stack_addr as *mut u8).add(stack_size),
        ))
    }
}

/// Highest address of the current thread's stack — the address the stack
/// grows down from.
///
/// Call once per thread, before that thread's first handle operation,
/// and record the result with [`crate::HandleConfig::set_stack_top`].
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub fn thread_stack_top() -> io::Result<NonNull<u8>> {
    unsafe {
        let top = libc::pthread_get_stackaddr_np(libc::pthread_self()) as *mut u8;
        NonNull::new(top).ok_or_else(|| io::Error::from(io::ErrorKind::Unsupported))
    }
}

/// Highest address of the current thread's stack.
///
/// Not implemented for this platform; always reports
/// [`io::ErrorKind::Unsupported`].
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
pub fn thread_stack_top() -> io::Result<NonNull<u8>> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}
