use std::{
    io::{self, Write},
    os::unix::io::RawFd,
};

/// Destination of displayed data and headers
pub trait Output {
    /// Write a chunk of file data, returning the number of bytes accepted. No buffering is
    /// allowed: bytes reported as accepted must have left the process.
    fn write_data(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Write one complete header line
    fn write_header(&mut self, line: &str) -> io::Result<()>;
}

/// Where header lines go
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum HeaderTarget {
    #[default]
    Stdout,
    Stderr,
}

/// Unbuffered standard output of the process
#[derive(Debug)]
pub struct Terminal {
    fd: RawFd,
    headers: HeaderTarget,
}

impl Terminal {
    pub fn new(headers: HeaderTarget) -> Self {
        Self {
            fd: libc::STDOUT_FILENO,
            headers,
        }
    }
}

impl Default for Terminal {
    fn default() -> Self {
        Self::new(HeaderTarget::default())
    }
}

impl Output for Terminal {
    fn write_data(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = unsafe {
            libc::write(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if result < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(result as usize)
        }
    }

    fn write_header(&mut self, line: &str) -> io::Result<()> {
        match self.headers {
            HeaderTarget::Stdout => {
                let mut remaining = line.as_bytes();
                while !remaining.is_empty() {
                    match self.write_data(remaining) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(written) => remaining = &remaining[written..],
                        Err(err) => return Err(err),
                    }
                }
                Ok(())
            }
            HeaderTarget::Stderr => {
                let mut stderr = io::stderr().lock();
                stderr.write_all(line.as_bytes())?;
                stderr.flush()
            }
        }
    }
}
