//! Byte stream boundary between the protocol and the physical link.
//!
//! Serial ports and USB bridge chips both look like a duplex byte stream with
//! blocking reads. A transport may additionally tell whether data is waiting,
//! which is what lets reads time out instead of blocking forever.

use std::io::{self, Read, Write};
use std::time::Duration;

pub trait Transport {
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize>;

    /// Wait until data can be read or `timeout` elapses. Returns `false` on
    /// timeout. Transports that cannot poll report ready right away and the
    /// following `read` blocks.
    fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
        Ok(true)
    }

    fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            match self.write(data) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport accepted no bytes",
                    ))
                }
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).write(data)
    }
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        (**self).read(buffer)
    }
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        (**self).wait_readable(timeout)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).write(data)
    }
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        (**self).read(buffer)
    }
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        (**self).wait_readable(timeout)
    }
}

/// Adapts any blocking `Read + Write` stream, e.g. an already configured
/// tty device opened as a file.
pub struct StreamTransport<S> {
    stream: S,
}

impl<S: Read + Write> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write> Transport for StreamTransport<S> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let written = self.stream.write(data)?;
        self.stream.flush()?;
        Ok(written)
    }

    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buffer)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// Records everything written and serves scripted input.
    #[derive(Default)]
    pub struct MockTransport {
        pub written: Vec<u8>,
        pub writes: usize,
        pub input: VecDeque<u8>,
        pub max_read: usize,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                max_read: usize::MAX,
                ..Default::default()
            }
        }

        pub fn queue(&mut self, bytes: &[u8]) {
            self.input.extend(bytes.iter().copied());
        }
    }

    impl Transport for MockTransport {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(data);
            self.writes += 1;
            Ok(data.len())
        }

        fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
            let n = buffer.len().min(self.input.len()).min(self.max_read);
            for slot in buffer.iter_mut().take(n) {
                *slot = self.input.pop_front().unwrap_or_default();
            }
            Ok(n)
        }

        fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
            Ok(!self.input.is_empty())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Trickle {
        accepted: Vec<u8>,
    }

    impl Transport for Trickle {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.accepted.push(data[0]);
            Ok(1)
        }
        fn read(&mut self, _buffer: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn write_all_retries_partial_writes() {
        let mut t = Trickle {
            accepted: Vec::new(),
        };
        t.write_all(&[1, 2, 3, 4]).unwrap();
        assert_eq!(t.accepted, vec![1, 2, 3, 4]);
        assert!(t.wait_readable(Duration::from_millis(1)).unwrap());
    }

    #[test]
    fn stream_transport_reads_and_writes() {
        let mut t = StreamTransport::new(Cursor::new(vec![0u8; 4]));
        t.write_all(&[9, 8]).unwrap();
        let mut buf = [0u8; 4];
        let n = t.read(&mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(t.into_inner().into_inner(), vec![9, 8, 0, 0]);
    }
}
