use crate::inferior::error::Error;
use log::debug;
use nix::errno::Errno;
use nix::libc::{c_long, c_void};
use nix::sys;
use nix::sys::uio::{self, RemoteIoVec};
use nix::unistd::Pid;
use std::io::IoSliceMut;
use std::mem;

const WORD: usize = mem::size_of::<c_long>();

/// Part of one page covered by a memory request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageChunk {
    /// Page-aligned start of the containing page.
    pub page: usize,
    /// Offset of the requested window inside the page.
    pub offset: usize,
    pub len: usize,
}

/// End of `[addr, addr + len)`, a window past the top of the address space is a fault.
fn window_end(addr: usize, len: usize) -> Result<usize, Error> {
    addr.checked_add(len).ok_or(Error::MemoryAccess(addr, Errno::EFAULT))
}

/// Split `[addr, addr + len)` into per-page windows.
pub fn page_chunks(addr: usize, len: usize, page_size: usize) -> Result<Vec<PageChunk>, Error> {
    let mut chunks = vec![];
    let mut cursor = addr;
    let end = window_end(addr, len)?;
    while cursor < end {
        let offset = cursor % page_size;
        let page = cursor - offset;
        let chunk_len = (page_size - offset).min(end - cursor);
        chunks.push(PageChunk {
            page,
            offset,
            len: chunk_len,
        });
        cursor += chunk_len;
    }
    Ok(chunks)
}

/// Read `len` bytes of the inferior address space.
///
/// Every containing page is read whole and the requested window is sliced out of it, so an
/// address that is not page aligned is handled transparently.
pub fn read(pid: Pid, addr: usize, len: usize, page_size: usize) -> Result<Vec<u8>, Error> {
    let mut result = Vec::with_capacity(len);
    let mut page_buf = vec![0u8; page_size];

    for chunk in page_chunks(addr, len, page_size)? {
        read_page(pid, chunk.page, &mut page_buf)?;
        result.extend_from_slice(&page_buf[chunk.offset..chunk.offset + chunk.len]);
    }

    Ok(result)
}

fn read_page(pid: Pid, page: usize, buf: &mut [u8]) -> Result<(), Error> {
    let expected = buf.len();
    let remote = RemoteIoVec {
        base: page,
        len: expected,
    };
    let local = &mut [IoSliceMut::new(buf)];

    match uio::process_vm_readv(pid, local.as_mut_slice(), &[remote]) {
        Ok(got) if got == expected => Ok(()),
        Ok(got) => Err(Error::ShortRead {
            addr: page,
            expected,
            got,
        }),
        Err(Errno::ENOSYS) => {
            debug!(target: "tracer", "process_vm_readv unavailable, fall back to PTRACE_PEEKDATA");
            peek(pid, page, &mut local[0])
        }
        Err(e) => Err(Error::MemoryAccess(page, e)),
    }
}

/// Word by word read with `PTRACE_PEEKDATA`, `addr` must be word aligned.
fn peek(pid: Pid, addr: usize, buf: &mut [u8]) -> Result<(), Error> {
    for (i, dst) in buf.chunks_mut(WORD).enumerate() {
        let word_addr = addr + i * WORD;
        let word = sys::ptrace::read(pid, word_addr as *mut c_void)
            .map_err(|e| Error::MemoryAccess(word_addr, e))?;
        let n = dst.len();
        dst.copy_from_slice(&word.to_ne_bytes()[..n]);
    }
    Ok(())
}

/// Write `data` into the inferior address space with `PTRACE_POKEDATA`.
///
/// The write goes through ptrace so read-only text pages can be patched. Partially covered words
/// at both edges are merged with their current content.
pub fn write(pid: Pid, addr: usize, data: &[u8]) -> Result<(), Error> {
    let mut cursor = addr;
    let end = window_end(addr, data.len())?;

    while cursor < end {
        let word_addr = cursor - cursor % WORD;
        let skip = cursor - word_addr;
        let n = (WORD - skip).min(end - cursor);
        let src = &data[cursor - addr..cursor - addr + n];

        let mut bytes = if skip == 0 && n == WORD {
            [0u8; WORD]
        } else {
            sys::ptrace::read(pid, word_addr as *mut c_void)
                .map_err(|e| Error::MemoryAccess(word_addr, e))?
                .to_ne_bytes()
        };
        bytes[skip..skip + n].copy_from_slice(src);

        let word = c_long::from_ne_bytes(bytes);
        unsafe {
            sys::ptrace::write(pid, word_addr as *mut c_void, word as *mut c_void)
                .map_err(|e| Error::MemoryAccess(word_addr, e))?;
        }

        cursor += n;
    }

    Ok(())
}
