use anyhow::{anyhow, Result};
use std::io::{self, ErrorKind};
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

/// Result of a single non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    Eof,
    WouldBlock,
}

pub(super) fn should_retry_read_error(err: &io::Error) -> bool {
    err.kind() == ErrorKind::Interrupted
}

/// Read once from `fd`, retrying interrupted reads.
pub fn read_chunk(fd: RawFd, buffer: &mut [u8]) -> io::Result<ReadOutcome> {
    loop {
        // SAFETY: buffer is a valid writable slice for its full length.
        let n = unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len()) };
        if n > 0 {
            return Ok(ReadOutcome::Data(n as usize));
        }
        if n == 0 {
            return Ok(ReadOutcome::Eof);
        }
        let err = io::Error::last_os_error();
        if should_retry_read_error(&err) {
            continue;
        }
        if err.kind() == ErrorKind::WouldBlock {
            return Ok(ReadOutcome::WouldBlock);
        }
        return Err(err);
    }
}

/// Write the entire buffer to `fd`, retrying short writes.
pub fn write_all(fd: RawFd, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        // SAFETY: data is a valid readable slice for its full length.
        let written = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if written < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted || err.kind() == ErrorKind::WouldBlock {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            return Err(anyhow!("write to fd {fd} failed: {err}"));
        }
        if written == 0 {
            return Err(anyhow!("write to fd {fd} returned 0"));
        }
        data = data.get(written as usize..).unwrap_or(&[]);
    }
    Ok(())
}
