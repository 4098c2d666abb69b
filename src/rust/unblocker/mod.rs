// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod blocking;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::blocking::BlockingStream;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    io::Interest,
    SharedKernel,
};
use ::libc::{
    c_int,
    c_void,
    off_t,
    EAGAIN,
    EBADF,
    EINTR,
    EINVAL,
    EIO,
    ENODATA,
    ETIMEDOUT,
    EWOULDBLOCK,
    F_GETFL,
    F_SETFL,
    LOCK_EX,
    LOCK_NB,
    LOCK_SH,
    LOCK_UN,
    O_NONBLOCK,
    SEEK_CUR,
    SEEK_END,
    SEEK_SET,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    collections::HashMap,
    io::{
        self,
        SeekFrom,
    },
    mem,
    os::fd::{
        AsRawFd,
        RawFd,
    },
    rc::{
        Rc,
        Weak,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Live wrappers, keyed by descriptor.
pub(crate) type UnblockerRegistry = HashMap<RawFd, Weak<UnblockerInner>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOperation {
    Shared,
    Exclusive,
    Unlock,
}

pub(crate) struct UnblockerInner {
    kernel: SharedKernel,
    fd: RawFd,
    /// Keeps the descriptor open until the wrapper is closed.
    owner: RefCell<Option<Rc<dyn AsRawFd>>>,
    read_timeout: Cell<Option<Duration>>,
    /// Report `EAGAIN` instead of waiting.
    pretend_nonblocking: Cell<bool>,
    destroyed: Cell<bool>,
    eof: Cell<bool>,
    /// Tick in which the last cooperative suspension resumed.
    resumed_at: Cell<Option<u64>>,
}

/// Non-blocking view of a blocking stream. Operations that would block suspend the calling coroutine instead, and
/// drive the loop when called from outside of any coroutine.
#[derive(Clone)]
pub struct Unblocker(Rc<UnblockerInner>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Unblocker {
    /// Switches the descriptor of `stream` to non-blocking mode and wraps it. A descriptor that already has a live
    /// wrapper gets that same wrapper back.
    pub fn new<S: AsRawFd + 'static>(kernel: &SharedKernel, stream: Rc<S>) -> Result<Self, Fail> {
        let fd: RawFd = stream.as_raw_fd();
        if let Some(existing) = Self::lookup(kernel, fd) {
            trace!("new(): reusing wrapper of fd {}", fd);
            return Ok(existing);
        }
        set_nonblocking(fd)?;
        let owner: Rc<dyn AsRawFd> = stream;
        let inner: Rc<UnblockerInner> = Rc::new(UnblockerInner {
            kernel: kernel.clone(),
            fd,
            owner: RefCell::new(Some(owner)),
            read_timeout: Cell::new(None),
            pretend_nonblocking: Cell::new(false),
            destroyed: Cell::new(false),
            eof: Cell::new(false),
            resumed_at: Cell::new(None),
        });
        kernel.unblocked().borrow_mut().insert(fd, Rc::downgrade(&inner));
        Ok(Self(inner))
    }

    pub(crate) fn lookup(kernel: &SharedKernel, fd: RawFd) -> Option<Self> {
        let inner: Option<Rc<UnblockerInner>> = kernel.unblocked().borrow().get(&fd).and_then(|weak| weak.upgrade());
        inner.map(Self)
    }

    pub fn fd(&self) -> RawFd {
        self.0.fd
    }

    pub fn is_closed(&self) -> bool {
        self.0.destroyed.get()
    }

    pub fn ptr_eq(&self, other: &Unblocker) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Bounds how long reads and writes wait for readiness. `None` waits forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.0.read_timeout.set(timeout);
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.0.read_timeout.get()
    }

    /// In non-blocking mode, operations that cannot complete right away fail with `EAGAIN` instead of waiting.
    pub fn set_blocking(&self, blocking: bool) {
        self.0.pretend_nonblocking.set(!blocking);
    }

    pub fn is_blocking(&self) -> bool {
        !self.0.pretend_nonblocking.get()
    }

    /// Reads into `buf`, waiting for data if there is none yet. Returns zero at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Fail> {
        loop {
            if let Some(nbytes) = self.try_read(buf)? {
                return Ok(nbytes);
            }
            self.await_ready(Interest::READABLE).await?;
        }
    }

    /// Reads exactly `buf.len()` bytes.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<(), Fail> {
        let mut filled: usize = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]).await? {
                0 => return Err(Fail::new(ENODATA, "stream ended before the buffer was filled")),
                nbytes => filled += nbytes,
            }
        }
        Ok(())
    }

    /// Writes from `buf`, waiting for room if there is none yet.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, Fail> {
        loop {
            if let Some(nbytes) = self.try_write(buf)? {
                return Ok(nbytes);
            }
            self.await_ready(Interest::WRITABLE).await?;
        }
    }

    pub async fn write_all(&self, buf: &[u8]) -> Result<(), Fail> {
        let mut written: usize = 0;
        while written < buf.len() {
            match self.write(&buf[written..]).await? {
                0 => return Err(Fail::new(EIO, "stream accepted no bytes")),
                nbytes => written += nbytes,
            }
        }
        Ok(())
    }

    pub async fn seek(&self, pos: SeekFrom) -> Result<u64, Fail> {
        self.single_suspend().await?;
        self.seek_now(pos)
    }

    pub async fn tell(&self) -> Result<u64, Fail> {
        self.single_suspend().await?;
        self.seek_now(SeekFrom::Current(0))
    }

    pub async fn stat(&self) -> Result<libc::stat, Fail> {
        self.single_suspend().await?;
        self.check_open()?;
        let mut stat: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(self.0.fd, &mut stat) } == -1 {
            return Err(last_error("fstat"));
        }
        Ok(stat)
    }

    pub async fn truncate(&self, len: u64) -> Result<(), Fail> {
        self.single_suspend().await?;
        self.check_open()?;
        let len: off_t = to_offset(len)?;
        if unsafe { libc::ftruncate(self.0.fd, len) } == -1 {
            return Err(last_error("ftruncate"));
        }
        Ok(())
    }

    /// Writes go straight to the descriptor, so this is only a cooperative checkpoint.
    pub async fn flush(&self) -> Result<(), Fail> {
        self.single_suspend().await?;
        self.check_open()
    }

    /// Whether a read has hit the end of the stream.
    pub async fn eof(&self) -> Result<bool, Fail> {
        self.single_suspend().await?;
        Ok(self.0.eof.get())
    }

    /// Applies an advisory lock. Without `blocking`, returns false instead of waiting for a conflicting lock.
    pub async fn lock(&self, operation: LockOperation, blocking: bool) -> Result<bool, Fail> {
        let operation: c_int = match operation {
            LockOperation::Shared => LOCK_SH,
            LockOperation::Exclusive => LOCK_EX,
            LockOperation::Unlock => LOCK_UN,
        };
        loop {
            self.check_open()?;
            if unsafe { libc::flock(self.0.fd, operation | LOCK_NB) } == 0 {
                return Ok(true);
            }
            let e: io::Error = io::Error::last_os_error();
            match e.raw_os_error() {
                Some(EWOULDBLOCK) if !blocking => return Ok(false),
                Some(EWOULDBLOCK) | Some(EINTR) => self.0.kernel.suspend().await?,
                _ => return Err(Fail::from(e)),
            }
        }
    }

    /// Marks the wrapper destroyed, wakes pending waiters and releases the stream.
    pub fn close(&self) {
        if self.0.destroyed.replace(true) {
            return;
        }
        let kernel: &SharedKernel = &self.0.kernel;
        let cancelled: usize = kernel.io().cancel_fd(kernel, self.0.fd);
        trace!("close(): fd {} closed with {} waiters", self.0.fd, cancelled);
        {
            let mut registry = kernel.unblocked().borrow_mut();
            if registry.get(&self.0.fd).is_some_and(|weak| weak.ptr_eq(&Rc::downgrade(&self.0))) {
                registry.remove(&self.0.fd);
            }
        }
        let owner: Option<Rc<dyn AsRawFd>> = self.0.owner.borrow_mut().take();
        drop(owner);
    }

    /// Adapter for code that expects `std::io` traits. Meant for code outside of any coroutine, where every call drives
    /// the loop until it completes. Inside a coroutine the adapter cannot suspend, so calls that are not ready fail
    /// with [std::io::ErrorKind::WouldBlock]; coroutines should await [Self::read] and [Self::write] instead.
    pub fn blocking(&self) -> BlockingStream<'_> {
        BlockingStream::new(self)
    }

    pub(crate) fn kernel(&self) -> &SharedKernel {
        &self.0.kernel
    }

    /// Reads once. Returns `None` if no data is available yet.
    pub(crate) fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>, Fail> {
        loop {
            self.check_open()?;
            let nbytes: isize = unsafe { libc::read(self.0.fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if nbytes >= 0 {
                if nbytes == 0 && !buf.is_empty() {
                    self.0.eof.set(true);
                }
                return Ok(Some(nbytes as usize));
            }
            let e: io::Error = io::Error::last_os_error();
            match e.raw_os_error() {
                Some(EINTR) => continue,
                Some(EAGAIN) => return Ok(None),
                _ => return Err(Fail::from(e)),
            }
        }
    }

    /// Writes once. Returns `None` if the descriptor has no room yet.
    pub(crate) fn try_write(&self, buf: &[u8]) -> Result<Option<usize>, Fail> {
        loop {
            self.check_open()?;
            let nbytes: isize = unsafe { libc::write(self.0.fd, buf.as_ptr() as *const c_void, buf.len()) };
            if nbytes >= 0 {
                return Ok(Some(nbytes as usize));
            }
            let e: io::Error = io::Error::last_os_error();
            match e.raw_os_error() {
                Some(EINTR) => continue,
                Some(EAGAIN) => return Ok(None),
                _ => return Err(Fail::from(e)),
            }
        }
    }

    pub(crate) fn seek_now(&self, pos: SeekFrom) -> Result<u64, Fail> {
        self.check_open()?;
        let (offset, whence): (off_t, c_int) = match pos {
            SeekFrom::Start(offset) => (to_offset(offset)?, SEEK_SET),
            SeekFrom::End(offset) => (to_offset(offset)?, SEEK_END),
            SeekFrom::Current(offset) => (to_offset(offset)?, SEEK_CUR),
        };
        let position: off_t = unsafe { libc::lseek(self.0.fd, offset, whence) };
        if position == -1 {
            return Err(last_error("lseek"));
        }
        if whence != SEEK_CUR || offset != 0 {
            self.0.eof.set(false);
        }
        Ok(position as u64)
    }

    fn check_open(&self) -> Result<(), Fail> {
        match self.0.destroyed.get() {
            true => Err(Fail::new(EBADF, "stream was closed")),
            false => Ok(()),
        }
    }

    async fn await_ready(&self, interest: Interest) -> Result<(), Fail> {
        if self.0.pretend_nonblocking.get() {
            return Err(Fail::new(EAGAIN, "operation would block"));
        }
        let timeout: Option<Duration> = self.0.read_timeout.get();
        if self.0.kernel.io().wait(&self.0.kernel, self.0.fd, interest, timeout).await? {
            return Ok(());
        }
        if self.0.destroyed.get() {
            Err(Fail::new(EBADF, "stream was closed while waiting"))
        } else if timeout.is_some() {
            Err(Fail::new(ETIMEDOUT, "stream timed out"))
        } else {
            Err(Fail::new(EBADF, "stream descriptor became invalid"))
        }
    }

    /// Suspends at most once per tick, so that metadata operations stay cooperative without slowing down loops.
    async fn single_suspend(&self) -> Result<(), Fail> {
        let tick: u64 = self.0.kernel.tick_count();
        if self.0.resumed_at.get() == Some(tick) {
            return Ok(());
        }
        self.0.resumed_at.set(Some(tick + 1));
        self.0.kernel.suspend().await
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), Fail> {
    let flags: c_int = unsafe { libc::fcntl(fd, F_GETFL) };
    if flags == -1 {
        return Err(last_error("fcntl"));
    }
    if flags & O_NONBLOCK == 0 && unsafe { libc::fcntl(fd, F_SETFL, flags | O_NONBLOCK) } == -1 {
        return Err(last_error("fcntl"));
    }
    Ok(())
}

fn to_offset<T: TryInto<off_t>>(offset: T) -> Result<off_t, Fail> {
    offset
        .try_into()
        .map_err(|_| Fail::new(EINVAL, "offset is out of range"))
}

fn last_error(operation: &str) -> Fail {
    let e: io::Error = io::Error::last_os_error();
    debug!("{}(): failed (error={:?})", operation, e);
    Fail::from(e)
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl PartialEq for Unblocker {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Unblocker {}

impl Drop for UnblockerInner {
    fn drop(&mut self) {
        // The registry is being torn down if it is already borrowed.
        if let Ok(mut registry) = self.kernel.unblocked().try_borrow_mut() {
            if registry.get(&self.fd).is_some_and(|weak| weak.strong_count() == 0) {
                registry.remove(&self.fd);
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
