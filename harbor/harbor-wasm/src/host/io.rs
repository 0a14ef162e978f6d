//! Small-integer I/O handles backing `fd_read`/`fd_write`/`harbor.write`.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

pub const STDIN: u32 = 0;
pub const STDOUT: u32 = 1;
pub const STDERR: u32 = 2;

pub enum Handle {
    Reader(Box<dyn Read + Send>),
    Writer(Box<dyn Write + Send>),
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Reader(_) => f.write_str("Reader"),
            Handle::Writer(_) => f.write_str("Writer"),
        }
    }
}

/// Why an I/O call on a handle did not succeed.
#[derive(Debug)]
pub enum IoFailure {
    /// No handle with that number, or it does not support the operation.
    BadHandle,
    Io(io::Error),
}

#[derive(Debug, Default)]
pub struct IoTable {
    handles: HashMap<u32, Handle>,
}

impl IoTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Process stdin, stdout and stderr on handles 0, 1 and 2.
    pub fn stdio() -> Self {
        let mut table = Self::empty();
        table.insert(STDIN, Handle::Reader(Box::new(io::stdin())));
        table.insert(STDOUT, Handle::Writer(Box::new(io::stdout())));
        table.insert(STDERR, Handle::Writer(Box::new(io::stderr())));
        table
    }

    pub fn insert(&mut self, fd: u32, handle: Handle) -> Option<Handle> {
        self.handles.insert(fd, handle)
    }

    pub fn is_writer(&self, fd: u32) -> bool {
        matches!(self.handles.get(&fd), Some(Handle::Writer(_)))
    }

    pub fn write(&mut self, fd: u32, bytes: &[u8]) -> Result<usize, IoFailure> {
        match self.handles.get_mut(&fd) {
            Some(Handle::Writer(w)) => {
                w.write_all(bytes).and_then(|_| w.flush()).map_err(IoFailure::Io)?;
                Ok(bytes.len())
            }
            _ => Err(IoFailure::BadHandle),
        }
    }

    pub fn read(&mut self, fd: u32, buf: &mut [u8]) -> Result<usize, IoFailure> {
        match self.handles.get_mut(&fd) {
            Some(Handle::Reader(r)) => loop {
                match r.read(buf) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    other => return other.map_err(IoFailure::Io),
                }
            },
            _ => Err(IoFailure::BadHandle),
        }
    }
}

/// Cloneable in-memory writer, used to capture module output.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "output buffer poisoned"))?;
        inner.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn capture_and_bad_handles() {
        let out = SharedBuffer::new();
        let mut table = IoTable::empty();
        table.insert(STDOUT, Handle::Writer(Box::new(out.clone())));
        table.insert(STDIN, Handle::Reader(Box::new(io::Cursor::new(b"abc".to_vec()))));

        assert_eq!(table.write(STDOUT, b"hi").unwrap(), 2);
        assert_eq!(out.to_string_lossy(), "hi");
        assert!(matches!(table.write(STDIN, b"x"), Err(IoFailure::BadHandle)));
        assert!(matches!(table.write(9, b"x"), Err(IoFailure::BadHandle)));

        let mut buf = [0u8; 8];
        assert_eq!(table.read(STDIN, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn failing_writer_reports_io_error() {
        let mut table = IoTable::empty();
        table.insert(STDERR, Handle::Writer(Box::new(Broken)));
        assert!(matches!(table.write(STDERR, b"x"), Err(IoFailure::Io(_))));
    }
}
