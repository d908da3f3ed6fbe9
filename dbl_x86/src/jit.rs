//! In-process execution of a compiled image.
//!
//! Maps the three areas into anonymous read-write memory, writes the
//! absolute rodata/data pointers into the two movabs patch sites, then
//! drops protections to R|X on text, R on rodata, R|W on data. The loader
//! owns the mappings; text is never mutated after it becomes executable.

use std::io;
use std::ptr;

use log::debug;

use crate::error::BackendError;
use crate::image::X86Image;

struct Mapping {
    ptr: *mut u8,
    len: usize,
}

impl Mapping {
    /// Anonymous RW mapping of at least one page.
    fn new(len: usize) -> Result<Self, BackendError> {
        let len = len.max(1);
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(BackendError::Map(io::Error::last_os_error()));
        }
        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    fn copy_from(&mut self, bytes: &[u8]) {
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr, bytes.len()) }
    }

    fn protect(&self, prot: i32) -> Result<(), BackendError> {
        let rc = unsafe { libc::mprotect(self.ptr.cast(), self.len, prot) };
        if rc != 0 {
            return Err(BackendError::Map(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

/// A mapped, patched, executable image.
pub struct JitImage {
    text: Mapping,
    // Referenced only by the generated code, through r13/r15; the fields
    // keep the mappings alive for the text's lifetime.
    _rodata: Mapping,
    _data: Mapping,
    entry_offset: usize,
}

impl JitImage {
    pub fn load(image: &X86Image) -> Result<Self, BackendError> {
        let entry_offset = image.flashing.main_offset.ok_or(BackendError::MissingEntry)?;

        let mut text = Mapping::new(image.text.len())?;
        let mut rodata = Mapping::new(image.rodata.len())?;
        let mut data = Mapping::new(image.data.len())?;
        text.copy_from(image.text.as_slice());
        rodata.copy_from(image.rodata.as_slice());
        data.copy_from(image.data.as_slice());

        // Flash the mapped addresses into the two movabs immediates.
        unsafe {
            let ro = (rodata.ptr as u64).to_le_bytes();
            ptr::copy_nonoverlapping(
                ro.as_ptr(),
                text.ptr.add(image.flashing.rodata_patch_site),
                8,
            );
            let rw = (data.ptr as u64).to_le_bytes();
            ptr::copy_nonoverlapping(rw.as_ptr(), text.ptr.add(image.flashing.data_patch_site), 8);
        }

        text.protect(libc::PROT_READ | libc::PROT_EXEC)?;
        rodata.protect(libc::PROT_READ)?;
        data.protect(libc::PROT_READ | libc::PROT_WRITE)?;

        debug!(
            "jit mapped: text {:p}+{:#x}, entry +{entry_offset:#x}",
            text.ptr, text.len
        );
        Ok(Self {
            text,
            _rodata: rodata,
            _data: data,
            entry_offset,
        })
    }

    /// The C-convention `void()` entry.
    ///
    /// A `main` lowered by this back end ends in the exit syscall, so
    /// calling the entry terminates the process with status 0.
    pub fn entry(&self) -> extern "C" fn() {
        unsafe { std::mem::transmute(self.text.ptr.add(self.entry_offset)) }
    }

    /// Call the entry synchronously.
    pub fn run(&self) {
        (self.entry())()
    }
}
