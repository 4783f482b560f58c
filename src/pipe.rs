//! Readiness-driven byte channel over an OS pipe.
//!
//! Every producer to consumer hop in the receiver goes through one of these:
//! engine to distributor, engine tap to metadata feeder, decoder stdout to
//! metadata reader. Reads never block longer than the readiness timeout the
//! caller passes, and a closed or broken channel reads as empty instead of
//! failing, so worker loops only ever need to look at their liveness flag.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

/// Readiness timeout used by the streaming workers.
pub const READ_TIMEOUT: Duration = Duration::from_millis(50);

pub fn open() -> io::Result<(PipeReader, PipeWriter)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe(2) succeeded, both descriptors are fresh and owned by us.
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    set_cloexec(read.as_raw_fd())?;
    set_cloexec(write.as_raw_fd())?;
    Ok((PipeReader::from_fd(read)?, PipeWriter::from_fd(write)))
}

pub struct PipeReader {
    file: RwLock<Option<File>>,
    closed: AtomicBool,
    eof: AtomicBool,
}

impl PipeReader {
    /// Adopt a readable descriptor. The descriptor is switched to
    /// non-blocking mode.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(PipeReader {
            file: RwLock::new(Some(File::from(fd))),
            closed: AtomicBool::new(false),
            eof: AtomicBool::new(false),
        })
    }

    /// Read up to `max_bytes`. Returns `None` when nothing arrived within
    /// `timeout`, when the channel is closed, or when the writer went away.
    pub fn read(&self, max_bytes: usize, timeout: Duration) -> Option<Vec<u8>> {
        let guard = self.file.read().ok()?;
        let file = guard.as_ref()?;
        if !wait_readable(file.as_raw_fd(), timeout) {
            return None;
        }

        let mut buf = vec![0u8; max_bytes];
        let mut reader: &File = file;
        match reader.read(&mut buf) {
            Ok(0) => {
                self.eof.store(true, Ordering::Release);
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some(buf)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => None,
            Err(e) => {
                debug!("pipe read failed: {}", e);
                self.eof.store(true, Ordering::Release);
                None
            }
        }
    }

    /// False once the channel was closed locally or the writer side hung up
    /// and the buffered data has been drained.
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.eof.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Waits for an in-flight read to leave the descriptor before it is released.
        if let Ok(mut guard) = self.file.write() {
            guard.take();
        }
    }
}

/// Result of a bounded write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Complete,
    /// The reader stopped taking data; `written` bytes went through first.
    Stalled { written: usize },
}

pub struct PipeWriter {
    file: Mutex<Option<File>>,
}

impl PipeWriter {
    pub fn from_fd(fd: OwnedFd) -> Self {
        PipeWriter {
            file: Mutex::new(Some(File::from(fd))),
        }
    }

    /// Adopt a writable descriptor in non-blocking mode. Only for
    /// descriptors nobody else shares: the flag lives on the open file.
    pub fn nonblocking(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self::from_fd(fd))
    }

    /// Write `data`, giving the reader at most `timeout` in total to make
    /// room. Needs a non-blocking descriptor to be bounded.
    pub fn write_all_timeout(&self, data: &[u8], timeout: Duration) -> io::Result<WriteOutcome> {
        let guard = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe writer poisoned"))?;
        let file = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))?;
        let deadline = Instant::now() + timeout;
        let mut written = 0;
        while written < data.len() {
            let mut writer: &File = file;
            match writer.write(&data[written..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "pipe accepted nothing")),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(WriteOutcome::Stalled { written });
                    }
                    wait_writable(file.as_raw_fd(), deadline - now);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(WriteOutcome::Complete)
    }

    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe writer poisoned"))?;
        match guard.as_mut() {
            Some(file) => file.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")),
        }
    }

    /// A duplicate of the write end suitable for a child's stdout.
    pub fn to_stdio(&self) -> io::Result<Stdio> {
        let guard = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe writer poisoned"))?;
        match guard.as_ref() {
            Some(file) => Ok(Stdio::from(file.try_clone()?)),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")),
        }
    }

    /// A duplicate of the write end without close-on-exec, so a child can
    /// open it as `/dev/fd/N`. The caller drops it once the child is spawned.
    pub fn inheritable_fd(&self) -> io::Result<OwnedFd> {
        let guard = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe writer poisoned"))?;
        let file = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))?;
        // SAFETY: dup(2) on a descriptor we own; the result is checked below.
        let fd = unsafe { libc::dup(file.as_raw_fd()) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a fresh descriptor returned by dup(2).
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    pub fn is_closed(&self) -> bool {
        self.file.lock().map(|g| g.is_none()).unwrap_or(true)
    }

    pub fn close(&self) {
        if let Ok(mut guard) = self.file.lock() {
            guard.take();
        }
    }
}

fn wait_readable(fd: RawFd, timeout: Duration) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // SAFETY: one valid pollfd, the descriptor is kept open by the caller's lock.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    rc > 0 && pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
}

fn wait_writable(fd: RawFd, timeout: Duration) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().clamp(1, i32::MAX as u128) as libc::c_int;
    // SAFETY: one valid pollfd, the descriptor is kept open by the caller's lock.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    rc > 0
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor owned by the caller.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor owned by the caller.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn read_returns_written_bytes() {
        let (reader, writer) = open().unwrap();
        writer.write_all(&[1, 2, 3, 4]).unwrap();
        let data = reader.read(16, Duration::from_millis(200)).unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
        assert!(reader.is_alive());
    }

    #[test]
    fn empty_pipe_times_out_instead_of_blocking() {
        let (reader, _writer) = open().unwrap();
        let start = Instant::now();
        assert!(reader.read(16, Duration::from_millis(30)).is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(reader.is_alive());
    }

    #[test]
    fn closing_writer_eventually_marks_reader_dead() {
        let (reader, writer) = open().unwrap();
        writer.write_all(b"tail").unwrap();
        writer.close();
        assert_eq!(reader.read(16, READ_TIMEOUT).unwrap(), b"tail".to_vec());
        assert!(reader.read(16, READ_TIMEOUT).is_none());
        assert!(!reader.is_alive());
    }

    #[test]
    fn close_is_idempotent_and_reads_stay_empty() {
        let (reader, writer) = open().unwrap();
        writer.write_all(b"data").unwrap();
        reader.close();
        reader.close();
        assert!(reader.read(16, READ_TIMEOUT).is_none());
        assert!(!reader.is_alive());
        writer.close();
        writer.close();
        assert!(writer.is_closed());
        assert!(writer.write_all(b"x").is_err());
    }

    #[test]
    fn bounded_write_gives_up_on_a_full_pipe() {
        let (reader, writer) = open().unwrap();
        let writer = PipeWriter::nonblocking(writer.inheritable_fd().unwrap()).unwrap();
        let chunk = vec![7u8; 16 * 1024];
        let start = Instant::now();
        let mut outcome = WriteOutcome::Complete;
        for _ in 0..64 {
            outcome = writer.write_all_timeout(&chunk, Duration::from_millis(50)).unwrap();
            if outcome != WriteOutcome::Complete {
                break;
            }
        }
        assert!(matches!(outcome, WriteOutcome::Stalled { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(reader.read(4, READ_TIMEOUT).unwrap(), vec![7u8; 4]);
    }

    #[test]
    fn bounded_write_reports_a_vanished_reader() {
        let (reader, writer) = open().unwrap();
        let writer = PipeWriter::nonblocking(writer.inheritable_fd().unwrap()).unwrap();
        reader.close();
        assert!(writer.write_all_timeout(b"data", Duration::from_millis(50)).is_err());
    }

    #[test]
    fn close_from_another_thread_unblocks_reader_loop() {
        let (reader, _writer) = open().unwrap();
        let reader = Arc::new(reader);
        let worker = {
            let reader = Arc::clone(&reader);
            thread::spawn(move || {
                let mut reads = 0;
                while reader.is_alive() {
                    let _ = reader.read(64, READ_TIMEOUT);
                    reads += 1;
                }
                reads
            })
        };
        thread::sleep(Duration::from_millis(120));
        reader.close();
        let reads = worker.join().unwrap();
        assert!(reads >= 1);
    }
}
