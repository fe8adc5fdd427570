// Anonymous pipe endpoints carrying length-prefixed UTF-8 frames.

use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BridgeError, BridgeResult};

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024; // 1MB safety limit

/// Native handle value of a pipe end: a file descriptor on Unix, a `HANDLE`
/// on Windows.
pub type RawPipeHandle = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDirection {
    Read,
    Write,
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Read end of a pipe.
pub struct PipeReader {
    stream: Option<BoxedRead>,
    raw: Option<RawPipeHandle>,
    max_message_size: usize,
}

/// Write end of a pipe.
pub struct PipeWriter {
    stream: Option<BoxedWrite>,
    raw: Option<RawPipeHandle>,
    max_message_size: usize,
}

impl PipeReader {
    pub fn from_stream<R>(stream: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            stream: Some(Box::new(stream)),
            raw: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Adopt an inherited read handle.
    ///
    /// # Safety
    /// `raw` must be an open pipe read end that nothing else in this process
    /// owns; the returned reader closes it.
    pub unsafe fn from_raw_handle(raw: RawPipeHandle) -> BridgeResult<Self> {
        let owned = sys::adopt(raw)?;
        Ok(Self {
            stream: Some(sys::async_reader(owned)?),
            raw: Some(raw),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        })
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn direction(&self) -> PipeDirection {
        PipeDirection::Read
    }

    pub fn raw_handle(&self) -> Option<RawPipeHandle> {
        self.raw
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Read one complete frame. Zero-length frames are keep-alives and are
    /// skipped.
    pub async fn read_message(&mut self) -> BridgeResult<String> {
        let max = self.max_message_size;
        let stream = self.stream.as_mut().ok_or(BridgeError::TransportClosed)?;

        loop {
            let mut len_buf = [0u8; 4];
            stream
                .read_exact(&mut len_buf)
                .await
                .map_err(BridgeError::from_pipe_io)?;
            let len = u32::from_le_bytes(len_buf) as usize;

            if len == 0 {
                trace!("[PIPE] Skipping empty frame");
                continue;
            }
            if len > max {
                return Err(BridgeError::ProtocolViolation(format!(
                    "Message too large: {} bytes",
                    len
                )));
            }

            let mut payload = vec![0u8; len];
            stream
                .read_exact(&mut payload)
                .await
                .map_err(BridgeError::from_pipe_io)?;

            return String::from_utf8(payload).map_err(|e| {
                BridgeError::ProtocolViolation(format!("Frame is not valid UTF-8: {}", e))
            });
        }
    }

    /// Release the OS handle. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("[PIPE] Closed read end {:?}", self.raw);
        }
    }
}

impl PipeWriter {
    pub fn from_stream<W>(stream: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            stream: Some(Box::new(stream)),
            raw: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Adopt an inherited write handle.
    ///
    /// # Safety
    /// `raw` must be an open pipe write end that nothing else in this process
    /// owns; the returned writer closes it.
    pub unsafe fn from_raw_handle(raw: RawPipeHandle) -> BridgeResult<Self> {
        let owned = sys::adopt(raw)?;
        Ok(Self {
            stream: Some(sys::async_writer(owned)?),
            raw: Some(raw),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        })
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn direction(&self) -> PipeDirection {
        PipeDirection::Write
    }

    pub fn raw_handle(&self) -> Option<RawPipeHandle> {
        self.raw
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Write one frame and flush it.
    pub async fn write_message(&mut self, text: &str) -> BridgeResult<()> {
        if text.len() > self.max_message_size {
            return Err(BridgeError::ProtocolViolation(format!(
                "Message too large: {} bytes",
                text.len()
            )));
        }
        let stream = self.stream.as_mut().ok_or(BridgeError::TransportClosed)?;

        let mut frame = Vec::with_capacity(4 + text.len());
        frame.extend_from_slice(&(text.len() as u32).to_le_bytes());
        frame.extend_from_slice(text.as_bytes());

        stream
            .write_all(&frame)
            .await
            .map_err(BridgeError::from_pipe_io)?;
        stream.flush().await.map_err(BridgeError::from_pipe_io)?;
        Ok(())
    }

    /// Release the OS handle. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("[PIPE] Closed write end {:?}", self.raw);
        }
    }
}

/// The end of a pipe that belongs to the peer process.
///
/// The host holds it open until the target is launched and has inherited
/// it, then closes its own copy so the target's exit shows up as
/// end-of-stream on the local end.
pub struct RemotePipeEnd {
    handle: Option<sys::OwnedPipeHandle>,
    raw: RawPipeHandle,
    direction: PipeDirection,
}

impl RemotePipeEnd {
    fn new(handle: sys::OwnedPipeHandle, direction: PipeDirection) -> Self {
        let raw = sys::raw_value(&handle);
        Self {
            handle: Some(handle),
            raw,
            direction,
        }
    }

    pub fn raw_handle(&self) -> RawPipeHandle {
        self.raw
    }

    pub fn direction(&self) -> PipeDirection {
        self.direction
    }

    /// Let a child process inherit this end on spawn.
    pub fn make_inheritable(&self) -> BridgeResult<()> {
        match &self.handle {
            Some(handle) => sys::set_inheritable(handle, true).map_err(BridgeError::from),
            None => Err(BridgeError::TransportClosed),
        }
    }

    /// Give up ownership without closing; the handle now belongs to whoever
    /// adopts the returned value.
    pub fn detach(mut self) -> RawPipeHandle {
        if let Some(handle) = self.handle.take() {
            sys::into_raw(handle);
        }
        self.raw
    }

    pub fn close(&mut self) {
        if self.handle.take().is_some() {
            debug!("[PIPE] Closed remote {:?} end {}", self.direction, self.raw);
        }
    }
}

/// Create a pipe whose read end stays in this process.
pub fn open_inbound(max_message_size: usize) -> BridgeResult<(PipeReader, RemotePipeEnd)> {
    let (read, write) = sys::create()?;
    let raw = sys::raw_value(&read);
    let reader = PipeReader {
        stream: Some(sys::async_reader(read)?),
        raw: Some(raw),
        max_message_size,
    };
    Ok((reader, RemotePipeEnd::new(write, PipeDirection::Write)))
}

/// Create a pipe whose write end stays in this process.
pub fn open_outbound(max_message_size: usize) -> BridgeResult<(PipeWriter, RemotePipeEnd)> {
    let (read, write) = sys::create()?;
    let raw = sys::raw_value(&write);
    let writer = PipeWriter {
        stream: Some(sys::async_writer(write)?),
        raw: Some(raw),
        max_message_size,
    };
    Ok((writer, RemotePipeEnd::new(read, PipeDirection::Read)))
}

/// In-process pipe with both ends local.
pub fn memory_pipe(capacity: usize) -> (PipeReader, PipeWriter) {
    let (read_half, write_half) = tokio::io::duplex(capacity);
    (
        PipeReader::from_stream(read_half),
        PipeWriter::from_stream(write_half),
    )
}

#[cfg(unix)]
mod sys {
    use super::{BoxedRead, BoxedWrite, RawPipeHandle};
    use crate::error::{BridgeError, BridgeResult};
    use std::fs::File;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
    use tokio::net::unix::pipe;

    pub(super) type OwnedPipeHandle = OwnedFd;

    pub(super) fn create() -> io::Result<(OwnedFd, OwnedFd)> {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        // SAFETY: `fds` has room for the two descriptors pipe() writes.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe() succeeded, both descriptors are fresh and unowned.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_inheritable(&read, false)?;
        set_inheritable(&write, false)?;
        Ok((read, write))
    }

    pub(super) fn set_inheritable(fd: &OwnedFd, inherit: bool) -> io::Result<()> {
        let raw = fd.as_raw_fd();
        // SAFETY: `raw` is a valid descriptor borrowed from `fd`.
        let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if inherit {
            flags & !libc::FD_CLOEXEC
        } else {
            flags | libc::FD_CLOEXEC
        };
        // SAFETY: as above.
        if unsafe { libc::fcntl(raw, libc::F_SETFD, flags) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn raw_value(fd: &OwnedFd) -> RawPipeHandle {
        fd.as_raw_fd() as RawPipeHandle
    }

    pub(super) fn into_raw(fd: OwnedFd) -> RawPipeHandle {
        fd.into_raw_fd() as RawPipeHandle
    }

    pub(super) unsafe fn adopt(raw: RawPipeHandle) -> BridgeResult<OwnedFd> {
        if raw < 0 || raw > RawFd::MAX as RawPipeHandle {
            return Err(BridgeError::HandshakeFailed(format!(
                "{} is not a file descriptor",
                raw
            )));
        }
        let fd = OwnedFd::from_raw_fd(raw as RawFd);
        // Make sure the descriptor is open before handing it to the reactor.
        if libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) < 0 {
            let err = io::Error::last_os_error();
            // Not ours to close.
            let _ = fd.into_raw_fd();
            return Err(BridgeError::HandshakeFailed(format!(
                "descriptor {} is not open: {}",
                raw, err
            )));
        }
        Ok(fd)
    }

    pub(super) fn async_reader(fd: OwnedFd) -> BridgeResult<BoxedRead> {
        let receiver = pipe::Receiver::from_file(File::from(fd))?;
        Ok(Box::new(receiver))
    }

    pub(super) fn async_writer(fd: OwnedFd) -> BridgeResult<BoxedWrite> {
        let sender = pipe::Sender::from_file(File::from(fd))?;
        Ok(Box::new(sender))
    }
}

#[cfg(windows)]
mod sys {
    use super::{BoxedRead, BoxedWrite, RawPipeHandle};
    use crate::error::{BridgeError, BridgeResult};
    use std::io;
    use std::os::windows::io::{AsRawHandle, FromRawHandle, IntoRawHandle, OwnedHandle};
    use windows::Win32::Foundation::{SetHandleInformation, HANDLE, HANDLE_FLAGS, HANDLE_FLAG_INHERIT};
    use windows::Win32::System::Pipes::CreatePipe;

    pub(super) type OwnedPipeHandle = OwnedHandle;

    pub(super) fn create() -> io::Result<(OwnedHandle, OwnedHandle)> {
        let mut read = HANDLE::default();
        let mut write = HANDLE::default();
        // SAFETY: both out-pointers are valid; handles start non-inheritable.
        unsafe { CreatePipe(&mut read, &mut write, None, 0) }.map_err(io::Error::from)?;
        // SAFETY: CreatePipe succeeded, both handles are fresh and unowned.
        Ok(unsafe {
            (
                OwnedHandle::from_raw_handle(read.0 as _),
                OwnedHandle::from_raw_handle(write.0 as _),
            )
        })
    }

    pub(super) fn set_inheritable(handle: &OwnedHandle, inherit: bool) -> io::Result<()> {
        let flags = if inherit {
            HANDLE_FLAG_INHERIT
        } else {
            HANDLE_FLAGS(0)
        };
        // SAFETY: the handle is borrowed and valid for the duration of the call.
        unsafe {
            SetHandleInformation(
                HANDLE(handle.as_raw_handle() as _),
                HANDLE_FLAG_INHERIT.0,
                flags,
            )
        }
        .map_err(io::Error::from)
    }

    pub(super) fn raw_value(handle: &OwnedHandle) -> RawPipeHandle {
        handle.as_raw_handle() as isize as RawPipeHandle
    }

    pub(super) fn into_raw(handle: OwnedHandle) -> RawPipeHandle {
        handle.into_raw_handle() as isize as RawPipeHandle
    }

    pub(super) unsafe fn adopt(raw: RawPipeHandle) -> BridgeResult<OwnedHandle> {
        if raw <= 0 {
            return Err(BridgeError::HandshakeFailed(format!(
                "{} is not a pipe handle",
                raw
            )));
        }
        Ok(OwnedHandle::from_raw_handle(raw as isize as _))
    }

    pub(super) fn async_reader(handle: OwnedHandle) -> BridgeResult<BoxedRead> {
        let file = std::fs::File::from(handle);
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }

    pub(super) fn async_writer(handle: OwnedHandle) -> BridgeResult<BoxedWrite> {
        let file = std::fs::File::from(handle);
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }
}
