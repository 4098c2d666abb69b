// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::fail::Fail,
    unblocker::Unblocker,
};
use ::std::io::{
    self,
    Read,
    Seek,
    SeekFrom,
    Write,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// `std::io` view of an [Unblocker]. Outside of any coroutine, calls drive the loop until they complete. Inside a
/// coroutine they never suspend and report [io::ErrorKind::WouldBlock] instead.
pub struct BlockingStream<'a> {
    stream: &'a Unblocker,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<'a> BlockingStream<'a> {
    pub fn new(stream: &'a Unblocker) -> Self {
        Self { stream }
    }

    fn in_coroutine(&self) -> bool {
        self.stream.kernel().current().is_some()
    }
}

fn would_block(result: Result<Option<usize>, Fail>) -> io::Result<usize> {
    match result {
        Ok(Some(nbytes)) => Ok(nbytes),
        Ok(None) => Err(io::ErrorKind::WouldBlock.into()),
        Err(e) => Err(e.into()),
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Read for BlockingStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.in_coroutine() {
            return would_block(self.stream.try_read(buf));
        }
        let stream: &Unblocker = self.stream;
        Ok(stream.kernel().block_on(stream.read(buf))?)
    }
}

impl Write for BlockingStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.in_coroutine() {
            return would_block(self.stream.try_write(buf));
        }
        let stream: &Unblocker = self.stream;
        Ok(stream.kernel().block_on(stream.write(buf))?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for BlockingStream<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.stream.seek_now(pos)?)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
