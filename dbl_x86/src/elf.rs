//! ELF64 executable emission.
//!
//! Writes an `ET_EXEC`/`EM_X86_64` image with an ELF header, three program
//! headers, and the three areas as `PT_LOAD` segments in text, rodata,
//! data order. No section headers. The entry point is `main`'s first byte;
//! the two movabs immediates in `main` are patched with the final segment
//! addresses before any text byte reaches the disk.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use log::debug;

use crate::error::BackendError;
use crate::image::X86Image;

/// Virtual address of the first byte of the file image.
pub const ENTRY0: u64 = 0x400000;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const PHDR_COUNT: usize = 3;
/// Bytes of headers preceding the text area in the first segment.
pub const HEADERS_SIZE: usize = EHDR_SIZE + PHDR_SIZE * PHDR_COUNT;

const ALIGN: u64 = 0x1000;

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

#[derive(Debug, Clone, Copy)]
struct Segment {
    flags: u32,
    offset: u64,
    vaddr: u64,
    size: u64,
}

/// Next page boundary at or above `min`, plus the in-page part of the file
/// offset. Keeping `p_vaddr ≡ p_offset (mod align)` lets the loader map
/// the segment exactly where the patched immediates point.
fn next_vaddr(min: u64, offset: u64) -> u64 {
    let page = (min + ALIGN - 1) & !(ALIGN - 1);
    page + (offset & (ALIGN - 1))
}

fn layout(image: &X86Image) -> [Segment; 3] {
    let text_size = (HEADERS_SIZE + image.text.len()) as u64;
    let text = Segment {
        flags: PF_R | PF_X,
        offset: 0,
        vaddr: ENTRY0,
        size: text_size,
    };

    let ro_offset = text_size;
    let rodata = Segment {
        flags: PF_R,
        offset: ro_offset,
        vaddr: next_vaddr(text.vaddr + text.size, ro_offset),
        size: image.rodata.len() as u64,
    };

    let data_offset = ro_offset + rodata.size;
    let data = Segment {
        flags: PF_R | PF_W,
        offset: data_offset,
        vaddr: next_vaddr(rodata.vaddr + rodata.size, data_offset),
        size: image.data.len() as u64,
    };

    [text, rodata, data]
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Write the image as an executable file at `path`.
pub fn write_executable(image: &mut X86Image, path: &Path) -> Result<(), BackendError> {
    let main_offset = image.flashing.main_offset.ok_or(BackendError::MissingEntry)?;
    let [text, rodata, data] = layout(image);

    image
        .text
        .patch_u64(image.flashing.rodata_patch_site, rodata.vaddr);
    image
        .text
        .patch_u64(image.flashing.data_patch_site, data.vaddr);

    let entry = ENTRY0 + HEADERS_SIZE as u64 + main_offset as u64;
    debug!(
        "elf layout: entry {entry:#x}, text {:#x}+{:#x}, rodata {:#x}+{:#x}, data {:#x}+{:#x}",
        text.vaddr, text.size, rodata.vaddr, rodata.size, data.vaddr, data.size
    );

    let total = HEADERS_SIZE + image.text.len() + image.rodata.len() + image.data.len();
    let mut out = Vec::with_capacity(total);

    // e_ident: ELFCLASS64, ELFDATA2LSB, EV_CURRENT, ELFOSABI_LINUX.
    out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 3]);
    out.extend_from_slice(&[0u8; 8]);
    put_u16(&mut out, 2); // e_type = ET_EXEC
    put_u16(&mut out, 0x3E); // e_machine = EM_X86_64
    put_u32(&mut out, 1); // e_version
    put_u64(&mut out, entry);
    put_u64(&mut out, EHDR_SIZE as u64); // e_phoff
    put_u64(&mut out, 0); // e_shoff: no section headers
    put_u32(&mut out, 0); // e_flags
    put_u16(&mut out, EHDR_SIZE as u16);
    put_u16(&mut out, PHDR_SIZE as u16);
    put_u16(&mut out, PHDR_COUNT as u16);
    put_u16(&mut out, 64); // e_shentsize
    put_u16(&mut out, 0); // e_shnum
    put_u16(&mut out, 0); // e_shstrndx

    for seg in [text, rodata, data] {
        put_u32(&mut out, PT_LOAD);
        put_u32(&mut out, seg.flags);
        put_u64(&mut out, seg.offset);
        put_u64(&mut out, seg.vaddr);
        put_u64(&mut out, seg.vaddr); // p_paddr
        put_u64(&mut out, seg.size); // p_filesz
        put_u64(&mut out, seg.size); // p_memsz
        put_u64(&mut out, ALIGN);
    }
    debug_assert_eq!(out.len(), HEADERS_SIZE);

    out.extend_from_slice(image.text.as_slice());
    out.extend_from_slice(image.rodata.as_slice());
    out.extend_from_slice(image.data.as_slice());

    fs::write(path, &out).map_err(|source| BackendError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|source| {
        BackendError::Io {
            path: path.to_path_buf(),
            source,
        }
    })?;
    Ok(())
}
