use std::{
    fs::File,
    io,
    ops::Deref,
    os::unix::io::AsRawFd,
    ptr::{self, NonNull},
    slice,
};

/// How a mapping may be used
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    /// writable, changes reach the underlying file
    Shared,
    /// writable, changes stay private to this process
    Private,
}

/// Memory mapping of a byte range of a file, unmapped on drop.
///
/// The requested offset does not need to be page aligned: the mapping starts at the enclosing
/// page boundary and `Deref` hides the leading bytes.
pub struct Mapping {
    base: NonNull<libc::c_void>,
    mapped_len: usize,
    skip: usize,
    access: Access,
}

impl Mapping {
    /// Map `len` bytes of `file` starting at `offset`
    pub fn map(file: &File, offset: u64, len: usize, access: Access) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "refusing to map an empty range",
            ));
        }
        let page = page_size() as u64;
        let skip = (offset % page) as usize;
        let aligned = offset - skip as u64;
        let mapped_len = len.checked_add(skip).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "mapping length overflow")
        })?;
        let aligned = libc::off_t::try_from(aligned).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "mapping offset out of range")
        })?;

        let (prot, flags) = match access {
            Access::ReadOnly => (libc::PROT_READ, libc::MAP_PRIVATE),
            Access::Shared => (libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED),
            Access::Private => (libc::PROT_READ | libc::PROT_WRITE, libc::MAP_PRIVATE),
        };

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_len,
                prot,
                flags,
                file.as_raw_fd(),
                aligned,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(base).ok_or_else(|| io::Error::other("mmap returned null"))?;

        Ok(Self {
            base,
            mapped_len,
            skip,
            access,
        })
    }

    /// True if modifications are written back to the file without further action
    pub fn writes_through(&self) -> bool {
        self.access == Access::Shared
    }

    /// Mutable view, unavailable for read-only mappings
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if self.access == Access::ReadOnly {
            return None;
        }
        let len = self.mapped_len - self.skip;
        Some(unsafe { slice::from_raw_parts_mut(self.start(), len) })
    }

    fn start(&self) -> *mut u8 {
        unsafe { (self.base.as_ptr() as *mut u8).add(self.skip) }
    }
}

impl Deref for Mapping {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        unsafe { slice::from_raw_parts(self.start(), self.mapped_len - self.skip) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr(), self.mapped_len);
        }
    }
}

/// Granularity of mapping offsets
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom, Write};

    use super::*;

    fn file_with(content: &[u8]) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(content).unwrap();
        file
    }

    #[test]
    fn unaligned_offset_is_hidden() {
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let file = file_with(&content);
        let mapping = Mapping::map(&file, 5000, 3000, Access::ReadOnly).unwrap();
        assert_eq!(&mapping[..], &content[5000..8000]);
    }

    #[test]
    fn shared_mapping_writes_through() {
        let mut file = file_with(b"0000:0000:0001\n");
        {
            let mut mapping = Mapping::map(&file, 0, 15, Access::Shared).unwrap();
            assert!(mapping.writes_through());
            mapping.as_mut_slice().unwrap()[13] = b'f';
        }
        let mut content = String::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "0000:0000:000f\n");
    }

    #[test]
    fn private_mapping_keeps_changes_local() {
        let mut file = file_with(b"abc");
        {
            let mut mapping = Mapping::map(&file, 0, 3, Access::Private).unwrap();
            mapping.as_mut_slice().unwrap()[0] = b'x';
            assert_eq!(&mapping[..], b"xbc");
        }
        let mut content = String::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "abc");
    }

    #[test]
    fn read_only_mapping_is_not_mutable() {
        let file = file_with(b"abc");
        let mut mapping = Mapping::map(&file, 0, 3, Access::ReadOnly).unwrap();
        assert!(mapping.as_mut_slice().is_none());
    }

    #[test]
    fn empty_range_is_refused() {
        let file = file_with(b"abc");
        assert!(Mapping::map(&file, 0, 0, Access::ReadOnly).is_err());
    }
}
