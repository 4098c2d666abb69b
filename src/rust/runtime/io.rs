// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    event::{
        EventId,
        SharedEventHandler,
        Target,
    },
    fail::Fail,
    hooks::HookKind,
    scheduler::Yield,
    KernelModule,
    SharedKernel,
};
use ::bitflags::bitflags;
use ::indexmap::IndexMap;
use ::libc::{
    c_int,
    c_short,
    pollfd,
    EINVAL,
    POLLERR,
    POLLHUP,
    POLLIN,
    POLLNVAL,
    POLLOUT,
    POLLPRI,
};
use ::std::{
    cell::RefCell,
    io,
    mem,
    os::fd::RawFd,
    rc::Rc,
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

bitflags! {
    /// Readiness conditions a watch waits for.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interest: u64 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const EXCEPTIONAL = 1 << 2;
    }
}

struct Watcher {
    handler: SharedEventHandler,
    fd: RawFd,
    interest: Interest,
    /// Timer that cancels this watch when its timeout expires.
    timer: Option<EventId>,
}

/// File descriptor readiness, polled while the kernel sleeps.
#[derive(Default)]
pub struct Io {
    watchers: RefCell<IndexMap<EventId, Watcher>>,
    /// Watches found ready by the last poll, fired on the next before-tick pass.
    ready: RefCell<Vec<EventId>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Interest {
    fn to_events(self) -> c_short {
        let mut events: c_short = 0;
        if self.contains(Interest::READABLE) {
            events |= POLLIN;
        }
        if self.contains(Interest::WRITABLE) {
            events |= POLLOUT;
        }
        if self.contains(Interest::EXCEPTIONAL) {
            events |= POLLPRI;
        }
        events
    }

    /// Hang-ups and errors satisfy any interest, so that waiters observe them on their next operation.
    fn from_revents(revents: c_short) -> Self {
        let mut interest: Interest = Interest::empty();
        if revents & (POLLIN | POLLHUP | POLLERR) != 0 {
            interest |= Interest::READABLE;
        }
        if revents & (POLLOUT | POLLHUP | POLLERR) != 0 {
            interest |= Interest::WRITABLE;
        }
        if revents & (POLLPRI | POLLHUP | POLLERR) != 0 {
            interest |= Interest::EXCEPTIONAL;
        }
        interest
    }
}

impl Io {
    pub const NAME: &'static str = "core.io";

    /// Number of pending watches.
    pub fn len(&self) -> usize {
        self.watchers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.borrow().is_empty()
    }

    /// Registers a watch on `fd`. A coroutine target is taken out of the schedule until the watch resolves. With a
    /// timeout, the watch is cancelled once it expires.
    pub fn watch(
        &self,
        kernel: &SharedKernel,
        fd: RawFd,
        interest: Interest,
        target: Target,
        timeout: Option<Duration>,
    ) -> Result<SharedEventHandler, Fail> {
        if interest.is_empty() {
            let cause: String = format!("empty interest for file descriptor {}", fd);
            error!("watch(): {}", cause);
            return Err(Fail::new(EINVAL, &cause));
        }
        if let Target::Coroutine(coroutine) = &target {
            kernel.coroutines().deactivate(kernel, coroutine);
        }

        let id: EventId = kernel.next_event_id();
        // A timeout past the end of the clock never expires.
        let now: Instant = Instant::now();
        let timeout: Option<Duration> = timeout.filter(|timeout| now.checked_add(*timeout).is_some());
        let deadline: Option<Instant> = timeout.map(|timeout| now + timeout);
        let handler: SharedEventHandler = SharedEventHandler::new(id, target, deadline, interest.bits());
        let timer: Option<EventId> = timeout.map(|timeout| {
            let expire: Target = Target::Callback(Box::new(|kernel: &SharedKernel, extra: u64| {
                kernel.io().cancel(kernel, EventId::from(extra));
            }));
            kernel.timers().schedule(kernel, expire, timeout, u64::from(id))
        });
        self.watchers.borrow_mut().insert(
            id,
            Watcher {
                handler: handler.clone(),
                fd,
                interest,
                timer,
            },
        );
        kernel.increment(Self::NAME);
        kernel.set_max_delay(kernel.io_idle_sleep());
        trace!("watch(): event {} on fd {} ({:?})", id, fd, interest);
        Ok(handler)
    }

    /// Waits until `fd` satisfies `interest`. Returns true when it does, false when the watch was cancelled (timeout,
    /// invalid descriptor or explicit cancellation).
    pub async fn wait(
        &self,
        kernel: &SharedKernel,
        fd: RawFd,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<bool, Fail> {
        match kernel.current() {
            Some(coroutine) => {
                if !is_valid_fd(fd) {
                    return Ok(false);
                }
                let handler: SharedEventHandler =
                    self.watch(kernel, fd, interest, Target::Coroutine(coroutine.clone()), timeout)?;
                let resumed: Result<(), Fail> = Yield::new(coroutine).await;
                if handler.is_pending() {
                    self.discard(kernel, handler.id());
                }
                resumed?;
                Ok(handler.result() == Some(true))
            },
            None => {
                let noop: Target = Target::Callback(Box::new(|_: &SharedKernel, _: u64| {}));
                let handler: SharedEventHandler = self.watch(kernel, fd, interest, noop, timeout)?;
                if let Err(e) = kernel.run_until(|| handler.is_pending()) {
                    self.cancel(kernel, handler.id());
                    return Err(e);
                }
                Ok(handler.result() == Some(true))
            },
        }
    }

    /// Cancels a pending watch. A coroutine target becomes runnable again and observes a negative result.
    pub fn cancel(&self, kernel: &SharedKernel, id: EventId) -> bool {
        match self.remove(kernel, id) {
            Some(handler) => {
                handler.cancel(kernel);
                true
            },
            None => false,
        }
    }

    /// Cancels every pending watch on `fd`. Returns how many there were.
    pub fn cancel_fd(&self, kernel: &SharedKernel, fd: RawFd) -> usize {
        let ids: Vec<EventId> = self
            .watchers
            .borrow()
            .iter()
            .filter(|(_, watcher)| watcher.fd == fd)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter(|id| self.cancel(kernel, *id)).count()
    }

    fn fire(&self, kernel: &SharedKernel, id: EventId) -> bool {
        match self.remove(kernel, id) {
            Some(handler) => {
                handler.fire(kernel);
                true
            },
            None => false,
        }
    }

    /// Drops a watch whose waiter already resumed.
    fn discard(&self, kernel: &SharedKernel, id: EventId) {
        if let Some(handler) = self.remove(kernel, id) {
            handler.abandon();
        }
    }

    fn remove(&self, kernel: &SharedKernel, id: EventId) -> Option<SharedEventHandler> {
        let watcher: Watcher = self.watchers.borrow_mut().shift_remove(&id)?;
        kernel.decrement(Self::NAME);
        if let Some(timer) = watcher.timer {
            kernel.timers().cancel(kernel, timer);
        }
        Some(watcher.handler)
    }

    fn on_sleep(&self, kernel: &SharedKernel, delay: Duration) {
        let invalid: Vec<RawFd> = self
            .watchers
            .borrow()
            .values()
            .map(|watcher| watcher.fd)
            .filter(|fd| !is_valid_fd(*fd))
            .collect();
        if !invalid.is_empty() {
            for fd in invalid {
                debug!("on_sleep(): cancelling watches on invalid file descriptor {}", fd);
                self.cancel_fd(kernel, fd);
            }
            return;
        }

        let (ids, mut fds): (Vec<(EventId, Interest)>, Vec<pollfd>) = self
            .watchers
            .borrow()
            .iter()
            .map(|(id, watcher)| {
                let fd: pollfd = pollfd {
                    fd: watcher.fd,
                    events: watcher.interest.to_events(),
                    revents: 0,
                };
                ((*id, watcher.interest), fd)
            })
            .unzip();
        if fds.is_empty() {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            return;
        }

        if let Err(e) = poll(&mut fds, delay) {
            // Retried on the next tick.
            debug!("on_sleep(): poll failed (error={:?})", e);
            return;
        }

        // Check flagged descriptors once more, in case their state changed while others were being reported.
        let (flagged_ids, mut flagged): (Vec<(EventId, Interest)>, Vec<pollfd>) = ids
            .into_iter()
            .zip(fds)
            .filter(|(_, fd)| fd.revents != 0)
            .map(|(id, fd)| (id, pollfd { revents: 0, ..fd }))
            .unzip();
        if flagged.is_empty() {
            return;
        }
        if let Err(e) = poll(&mut flagged, Duration::ZERO) {
            debug!("on_sleep(): poll failed (error={:?})", e);
            return;
        }

        let mut invalid: Vec<RawFd> = Vec::new();
        let mut ready: Vec<EventId> = Vec::new();
        for ((id, interest), fd) in flagged_ids.into_iter().zip(flagged) {
            if fd.revents & POLLNVAL != 0 {
                invalid.push(fd.fd);
            } else if Interest::from_revents(fd.revents).intersects(interest) {
                ready.push(id);
            }
        }
        self.ready.borrow_mut().extend(ready);
        for fd in invalid {
            self.cancel_fd(kernel, fd);
        }
    }

    fn on_before_tick(&self, kernel: &SharedKernel) {
        let ready: Vec<EventId> = mem::take(&mut *self.ready.borrow_mut());
        for id in ready {
            // Already resolved by a timeout or an explicit cancellation.
            if !self.fire(kernel, id) {
                trace!("on_before_tick(): event {} is gone", id);
            }
        }
    }

    fn on_after_tick(&self, kernel: &SharedKernel) {
        if !self.is_empty() {
            kernel.set_max_delay(kernel.io_idle_sleep());
        }
    }

    /// Cancels every pending watch, so that the final drain does not wait on descriptors nobody will touch again.
    fn on_terminate(&self, kernel: &SharedKernel) {
        let ids: Vec<EventId> = self.watchers.borrow().keys().copied().collect();
        if !ids.is_empty() {
            debug!("on_terminate(): cancelling {} pending watches", ids.len());
        }
        for id in ids {
            self.cancel(kernel, id);
        }
    }
}

fn is_valid_fd(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

/// Polls `fds`, waiting at most `timeout` rounded up to the next millisecond.
fn poll(fds: &mut [pollfd], timeout: Duration) -> Result<c_int, Fail> {
    let timeout_ms: c_int = c_int::try_from(timeout.as_micros().div_ceil(1000)).unwrap_or(c_int::MAX);
    match unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) } {
        n if n >= 0 => Ok(n),
        _ => Err(Fail::from(io::Error::last_os_error())),
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl KernelModule for Io {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn start(&self, kernel: &SharedKernel) {
        kernel.register_module(Self::NAME);
        kernel.install_sleep_hook(
            Self::NAME,
            Rc::new(|kernel: &SharedKernel, delay: Duration| kernel.io().on_sleep(kernel, delay)),
        );
        kernel.install_hook(
            HookKind::BeforeTick,
            Self::NAME,
            Rc::new(|kernel: &SharedKernel| kernel.io().on_before_tick(kernel)),
        );
        kernel.install_hook(
            HookKind::AfterTick,
            Self::NAME,
            Rc::new(|kernel: &SharedKernel| kernel.io().on_after_tick(kernel)),
        );
        kernel.install_hook(
            HookKind::Terminate,
            Self::NAME,
            Rc::new(|kernel: &SharedKernel| kernel.io().on_terminate(kernel)),
        );
    }

    fn stop(&self, kernel: &SharedKernel) {
        kernel.remove_hooks(Self::NAME);
        kernel.reset_activity(Self::NAME);
        let watchers: IndexMap<EventId, Watcher> = mem::take(&mut *self.watchers.borrow_mut());
        let ready: Vec<EventId> = mem::take(&mut *self.ready.borrow_mut());
        drop(watchers);
        drop(ready);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
