// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::corokernel::{
    Fail,
    Promise,
    Runtime,
    SharedKernel,
    Unblocker,
};
use ::std::{
    io::{
        BufRead,
        BufReader,
        ErrorKind,
        Read,
        Write,
    },
    os::unix::net::UnixStream,
    rc::Rc,
    time::{
        Duration,
        Instant,
    },
};
use common::Journal;

//======================================================================================================================
// Reads and Writes
//======================================================================================================================

/// A read with no data suspends its coroutine while a sibling writes, then returns exactly the written bytes.
#[test]
fn read_suspends_until_sibling_writes() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let journal: Journal = Journal::default();
    let (left, right): (UnixStream, UnixStream) = UnixStream::pair()?;
    let reader: Unblocker = kernel.unblock(Rc::new(left))?;
    let writer: Unblocker = kernel.unblock(Rc::new(right))?;

    let journal_: Journal = journal.clone();
    let received: Promise<Vec<u8>> = kernel.go(move || async move {
        journal_.record("reading");
        let mut buf: [u8; 5] = [0; 5];
        reader.read_exact(&mut buf).await?;
        journal_.record("read");
        Ok(buf.to_vec())
    });

    let kernel_: SharedKernel = kernel.clone();
    let journal_: Journal = journal.clone();
    let _: Promise<()> = kernel.go(move || async move {
        kernel_.sleep(Duration::from_millis(10)).await?;
        journal_.record("writing");
        writer.write_all(b"hello").await?;
        Ok(())
    });

    let bytes: Vec<u8> = kernel.block_on(kernel.await_thenable(&received))?;
    corokernel::ensure_eq!(bytes.as_slice(), b"hello");
    let expected: Vec<String> = vec!["reading".to_string(), "writing".to_string(), "read".to_string()];
    corokernel::ensure_eq!(journal.entries(), expected);
    Ok(())
}

/// Many coroutines relay bytes through a chain of socket pairs without blocking each other.
#[test]
fn relay_through_socket_pairs() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let (source, first_in): (UnixStream, UnixStream) = UnixStream::pair()?;
    let (first_out, sink): (UnixStream, UnixStream) = UnixStream::pair()?;
    let source: Unblocker = kernel.unblock(Rc::new(source))?;
    let first_in: Unblocker = kernel.unblock(Rc::new(first_in))?;
    let first_out: Unblocker = kernel.unblock(Rc::new(first_out))?;
    let sink: Unblocker = kernel.unblock(Rc::new(sink))?;

    let _: Promise<()> = kernel.go(move || async move {
        let mut buf: [u8; 64] = [0; 64];
        loop {
            match first_in.read(&mut buf).await? {
                0 => break,
                nbytes => first_out.write_all(&buf[..nbytes]).await?,
            }
        }
        first_out.close();
        Ok(())
    });

    let payload: Vec<u8> = (0..200u8).collect();
    let payload_: Vec<u8> = payload.clone();
    let _: Promise<()> = kernel.go(move || async move {
        for chunk in payload_.chunks(32) {
            source.write_all(chunk).await?;
        }
        source.close();
        Ok(())
    });

    let mut collected: Vec<u8> = Vec::new();
    sink.blocking().read_to_end(&mut collected)?;
    corokernel::ensure_eq!(collected, payload);
    Ok(())
}

//======================================================================================================================
// Wrapper Lifecycle
//======================================================================================================================

/// Wrapping the same stream twice yields one shared wrapper.
#[test]
fn unblocking_is_idempotent() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let (left, _right): (UnixStream, UnixStream) = UnixStream::pair()?;
    let left: Rc<UnixStream> = Rc::new(left);
    let first: Unblocker = kernel.unblock(left.clone())?;
    let second: Unblocker = kernel.unblock(left)?;
    corokernel::ensure_eq!(first.ptr_eq(&second), true);
    first.set_read_timeout(Some(Duration::from_millis(1)));
    corokernel::ensure_eq!(second.read_timeout(), Some(Duration::from_millis(1)));
    Ok(())
}

/// A read that waits longer than the configured timeout fails with `ETIMEDOUT`.
#[test]
fn read_timeout_expires() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let (left, _right): (UnixStream, UnixStream) = UnixStream::pair()?;
    let reader: Unblocker = kernel.unblock(Rc::new(left))?;
    reader.set_read_timeout(Some(Duration::from_millis(20)));

    let start: Instant = Instant::now();
    let outcome: Promise<()> = kernel.go(move || async move {
        let mut buf: [u8; 1] = [0; 1];
        reader.read(&mut buf).await?;
        Ok(())
    });
    let result: Result<(), Fail> = kernel.block_on(kernel.await_thenable(&outcome));
    corokernel::ensure_eq!(result.map_err(|e| e.errno), Err(libc::ETIMEDOUT));
    corokernel::ensure_eq!(start.elapsed() >= Duration::from_millis(20), true);
    Ok(())
}

/// A read timeout too large for the clock behaves as no timeout at all.
#[test]
fn unbounded_read_timeout_never_expires() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let (left, right): (UnixStream, UnixStream) = UnixStream::pair()?;
    let reader: Unblocker = kernel.unblock(Rc::new(left))?;
    let writer: Unblocker = kernel.unblock(Rc::new(right))?;
    reader.set_read_timeout(Some(Duration::MAX));

    let received: Promise<Vec<u8>> = kernel.go(move || async move {
        let mut buf: [u8; 4] = [0; 4];
        reader.read_exact(&mut buf).await?;
        Ok(buf.to_vec())
    });
    corokernel::ensure_eq!(kernel.timers().len(), 0);

    let kernel_: SharedKernel = kernel.clone();
    let _: Promise<()> = kernel.go(move || async move {
        kernel_.sleep(Duration::from_millis(5)).await?;
        writer.write_all(b"ping").await?;
        Ok(())
    });
    let bytes: Vec<u8> = kernel.block_on(kernel.await_thenable(&received))?;
    corokernel::ensure_eq!(bytes.as_slice(), b"ping");
    Ok(())
}

/// Closing a stream wakes a coroutine waiting on it with `EBADF`.
#[test]
fn close_wakes_pending_reader() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let (left, _right): (UnixStream, UnixStream) = UnixStream::pair()?;
    let reader: Unblocker = kernel.unblock(Rc::new(left))?;

    let reader_: Unblocker = reader.clone();
    let outcome: Promise<usize> = kernel.go(move || async move {
        let mut buf: [u8; 1] = [0; 1];
        reader_.read(&mut buf).await
    });

    let kernel_: SharedKernel = kernel.clone();
    let _: Promise<()> = kernel.go(move || async move {
        kernel_.sleep(Duration::from_millis(5)).await?;
        reader.close();
        Ok(())
    });

    let result: Result<usize, Fail> = kernel.block_on(kernel.await_thenable(&outcome));
    corokernel::ensure_eq!(result.map_err(|e| e.errno), Err(libc::EBADF));
    Ok(())
}

/// The `std::io` adapter works for code that knows nothing about coroutines.
#[test]
fn blocking_adapter_serves_std_io() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let (left, right): (UnixStream, UnixStream) = UnixStream::pair()?;
    let near: Unblocker = kernel.unblock(Rc::new(left))?;
    let far: Unblocker = kernel.unblock(Rc::new(right))?;

    let _: Promise<()> = kernel.go(move || async move {
        let mut buf: [u8; 16] = [0; 16];
        let nbytes: usize = far.read(&mut buf).await?;
        far.write_all(&buf[..nbytes]).await?;
        far.write_all(b"\n").await?;
        Ok(())
    });

    near.blocking().write_all(b"echo")?;
    let mut line: String = String::new();
    BufReader::new(near.blocking()).read_line(&mut line)?;
    corokernel::ensure_eq!(line.as_str(), "echo\n");
    Ok(())
}

/// Inside a coroutine the `std::io` adapter cannot suspend, so a read that is not ready reports `WouldBlock`.
#[test]
fn blocking_adapter_never_suspends_a_coroutine() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let (left, _right): (UnixStream, UnixStream) = UnixStream::pair()?;
    let reader: Unblocker = kernel.unblock(Rc::new(left))?;

    let outcome: Promise<Option<ErrorKind>> = kernel.go(move || async move {
        let mut buf: [u8; 1] = [0; 1];
        Ok(reader.blocking().read(&mut buf).err().map(|e| e.kind()))
    });
    corokernel::ensure_eq!(kernel.block_on(kernel.await_thenable(&outcome))?, Some(ErrorKind::WouldBlock));
    Ok(())
}
