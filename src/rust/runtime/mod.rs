// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod channel;
pub mod config;
pub mod event;
pub mod fail;
pub mod hooks;
pub mod io;
pub mod ledger;
pub mod logging;
pub mod promise;
pub mod promises;
pub mod scheduler;
pub mod timer;
pub mod wait_group;
pub mod zombies;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        config::Config,
        event::{
            EventId,
            Target,
        },
        fail::Fail,
        hooks::{
            Hook,
            HookKind,
            Hooks,
            SleepHook,
        },
        io::{
            Interest,
            Io,
        },
        ledger::ActivityLedger,
        promise::{
            Promise,
            Thenable,
        },
        promises::Promises,
        scheduler::{
            Body,
            CoroutineId,
            Coroutines,
            Settle,
            SharedCoroutine,
            Start,
            Yield,
        },
        timer::Timers,
        zombies::Zombies,
    },
    unblocker::{
        Unblocker,
        UnblockerRegistry,
    },
};
use ::futures::{
    task::noop_waker_ref,
    FutureExt,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    future::Future,
    mem,
    os::fd::{
        AsRawFd,
        RawFd,
    },
    panic::AssertUnwindSafe,
    pin::pin,
    rc::Rc,
    sync::Arc,
    task::{
        Context,
        Poll,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A module plugged into the tick loop. Modules are started once per kernel, in a fixed order.
pub trait KernelModule {
    fn name(&self) -> &'static str;

    /// Registers the module in the activity ledger and installs its hooks.
    fn start(&self, kernel: &SharedKernel);

    /// Removes the module's hooks and drops every waiter it still holds.
    fn stop(&self, kernel: &SharedKernel);
}

/// Callback run once after the coroutine steps of the current tick.
pub type Deferred = Box<dyn FnOnce(&SharedKernel)>;

struct Settings {
    debug: bool,
    interrupt_budget: Duration,
    idle_tick: Duration,
    io_idle_sleep: Duration,
}

/// Cooperative scheduling kernel.
pub struct Kernel {
    settings: Settings,
    epoch: Instant,
    /// Start of the current tick.
    current_time: Cell<Instant>,
    /// Latest moment the next tick may start.
    next_tick_time: Cell<Instant>,
    tick_count: Cell<u64>,
    running: Cell<bool>,
    ledger: RefCell<ActivityLedger>,
    hooks: RefCell<Hooks>,
    deferred: RefCell<Vec<Deferred>>,
    next_coroutine_id: Cell<u64>,
    next_event_id: Cell<u64>,
    coroutines: Coroutines,
    timers: Timers,
    promises: Promises,
    zombies: Zombies,
    io: Io,
    unblocked: RefCell<UnblockerRegistry>,
}

#[derive(Clone)]
pub struct SharedKernel(Rc<Kernel>);

/// Owns a kernel for the lifetime of an application. Dropping it drains every outstanding coroutine, unless the
/// thread is panicking or a coroutine is still executing, in which case the kernel state is discarded instead.
pub struct Runtime {
    kernel: SharedKernel,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Runtime {
    pub fn new(config: &Config) -> Result<Self, Fail> {
        Ok(Self {
            kernel: SharedKernel::new(config)?,
        })
    }

    pub fn kernel(&self) -> &SharedKernel {
        &self.kernel
    }
}

impl SharedKernel {
    /// Creates a kernel and starts its modules. Prefer [Runtime], which also shuts the kernel down.
    pub fn new(config: &Config) -> Result<Self, Fail> {
        let settings: Settings = Settings {
            debug: config.debug()?,
            interrupt_budget: config.interrupt_budget()?,
            idle_tick: config.idle_tick()?,
            io_idle_sleep: config.io_idle_sleep()?,
        };
        logging::initialize(settings.debug);

        let now: Instant = Instant::now();
        let kernel: Self = Self(Rc::new(Kernel {
            settings,
            epoch: now,
            current_time: Cell::new(now),
            next_tick_time: Cell::new(now),
            tick_count: Cell::new(0),
            running: Cell::new(false),
            ledger: RefCell::new(ActivityLedger::default()),
            hooks: RefCell::new(Hooks::default()),
            deferred: RefCell::new(Vec::new()),
            next_coroutine_id: Cell::new(1),
            next_event_id: Cell::new(1),
            coroutines: Coroutines::default(),
            timers: Timers::default(),
            promises: Promises::default(),
            zombies: Zombies::default(),
            io: Io::default(),
            unblocked: RefCell::new(UnblockerRegistry::default()),
        }));
        kernel.bootstrap();
        Ok(kernel)
    }

    fn modules(&self) -> [&dyn KernelModule; 5] {
        [
            &self.0.coroutines,
            &self.0.timers,
            &self.0.promises,
            &self.0.zombies,
            &self.0.io,
        ]
    }

    fn bootstrap(&self) {
        for module in self.modules() {
            trace!("bootstrap(): starting {}", module.name());
            module.start(self);
        }
    }

    /// Stops every module, dropping whatever coroutines and callbacks they still hold.
    fn cleanup(&self) {
        for module in self.modules() {
            trace!("cleanup(): stopping {}", module.name());
            module.stop(self);
        }
        let deferred: Vec<Deferred> = mem::take(&mut *self.0.deferred.borrow_mut());
        drop(deferred);
        let unblocked: UnblockerRegistry = mem::take(&mut *self.0.unblocked.borrow_mut());
        drop(unblocked);
    }

    /// Runs terminate hooks and drains the kernel, or discards its state after an abrupt termination.
    pub fn shutdown(&self) {
        if thread::panicking() {
            error!("shutdown(): a fatal error is in flight, discarding kernel state");
        } else if let Some(coroutine) = self.current() {
            error!(
                "shutdown(): coroutine {:?} is still executing, discarding kernel state",
                coroutine.id()
            );
        } else if self.0.running.get() {
            error!("shutdown(): the loop is still running, discarding kernel state");
        } else {
            self.run_hooks(HookKind::Terminate);
            if let Err(e) = self.run_loop() {
                warn!("shutdown(): failed to drain (error={:?})", e);
            }
        }
        self.cleanup();
    }

    //==================================================================================================================
    // Modules
    //==================================================================================================================

    pub fn coroutines(&self) -> &Coroutines {
        &self.0.coroutines
    }

    pub fn timers(&self) -> &Timers {
        &self.0.timers
    }

    pub fn promises(&self) -> &Promises {
        &self.0.promises
    }

    pub fn zombies(&self) -> &Zombies {
        &self.0.zombies
    }

    pub fn io(&self) -> &Io {
        &self.0.io
    }

    pub(crate) fn unblocked(&self) -> &RefCell<UnblockerRegistry> {
        &self.0.unblocked
    }

    pub fn is_debug(&self) -> bool {
        self.0.settings.debug
    }

    pub fn io_idle_sleep(&self) -> Duration {
        self.0.settings.io_idle_sleep
    }

    pub fn next_event_id(&self) -> EventId {
        let id: u64 = self.0.next_event_id.get();
        self.0.next_event_id.set(id + 1);
        EventId::from(id)
    }

    //==================================================================================================================
    // Activity Ledger
    //==================================================================================================================

    pub fn register_module(&self, module: &'static str) {
        self.0.ledger.borrow_mut().register(module);
    }

    pub fn increment(&self, module: &'static str) {
        self.0.ledger.borrow_mut().increment(module);
    }

    pub fn decrement(&self, module: &'static str) {
        self.0.ledger.borrow_mut().decrement(module);
    }

    pub fn reset_activity(&self, module: &'static str) {
        self.0.ledger.borrow_mut().reset(module);
    }

    pub fn activity_of(&self, module: &str) -> usize {
        self.0.ledger.borrow().get(module)
    }

    /// Outstanding work across all modules. Zero means nothing will ever happen again without outside help.
    pub fn activity_level(&self) -> usize {
        self.0.ledger.borrow().sum() + self.0.deferred.borrow().len()
    }

    //==================================================================================================================
    // Hooks
    //==================================================================================================================

    pub fn install_hook(&self, kind: HookKind, owner: &'static str, hook: Hook) {
        self.0.hooks.borrow_mut().install(kind, owner, hook);
    }

    pub fn install_sleep_hook(&self, owner: &'static str, hook: SleepHook) {
        self.0.hooks.borrow_mut().install_sleep(owner, hook);
    }

    pub fn remove_hooks(&self, owner: &'static str) {
        self.0.hooks.borrow_mut().remove(owner);
    }

    fn run_hooks(&self, kind: HookKind) {
        let hooks: Vec<Hook> = self.0.hooks.borrow().get(kind);
        for hook in hooks {
            hook(self);
        }
    }

    //==================================================================================================================
    // Time
    //==================================================================================================================

    /// Start of the current tick, relative to the creation of the kernel.
    pub fn time(&self) -> Duration {
        self.0.current_time.get().duration_since(self.0.epoch)
    }

    /// Time elapsed since the creation of the kernel.
    pub fn real_time(&self) -> Duration {
        self.0.epoch.elapsed()
    }

    pub fn tick_count(&self) -> u64 {
        self.0.tick_count.get()
    }

    /// Asks the kernel not to sleep longer than `delay` past the start of the current tick.
    pub fn set_max_delay(&self, delay: Duration) {
        // A bound past the end of the clock bounds nothing.
        if let Some(bound) = self.0.current_time.get().checked_add(delay) {
            if bound < self.0.next_tick_time.get() {
                self.0.next_tick_time.set(bound);
            }
        }
    }

    /// How long the kernel may sleep right now.
    pub fn max_delay(&self) -> Duration {
        self.0.next_tick_time.get().saturating_duration_since(Instant::now())
    }

    //==================================================================================================================
    // Tick Loop
    //==================================================================================================================

    /// Runs the loop until the kernel is idle or [Self::stop] is called.
    pub fn run_loop(&self) -> Result<(), Fail> {
        self.drive(None)
    }

    /// Runs the loop while `resume` returns true. Fails with `EAGAIN` if the kernel becomes idle first, and with
    /// `EINTR` if [Self::stop] is called.
    pub fn run_until<F: FnMut() -> bool>(&self, mut resume: F) -> Result<(), Fail> {
        self.drive(Some(&mut resume))
    }

    /// Asks a running loop to return after the current tick.
    pub fn stop(&self) {
        self.0.running.set(false);
    }

    pub fn is_running(&self) -> bool {
        self.0.running.get()
    }

    fn drive(&self, mut resume: Option<&mut dyn FnMut() -> bool>) -> Result<(), Fail> {
        if let Some(coroutine) = self.current() {
            panic!("drive(): coroutine {:?} cannot drive the loop that schedules it", coroutine.id());
        }
        if self.0.running.get() {
            panic!("drive(): the loop is already running");
        }
        self.0.running.set(true);

        loop {
            self.tick();

            if let Some(resume) = resume.as_mut() {
                if !resume() {
                    self.0.running.set(false);
                    return Ok(());
                }
            }

            if !self.0.running.get() {
                return match resume {
                    Some(_) => Err(Fail::new(libc::EINTR, "kernel was instructed to stop")),
                    None => Ok(()),
                };
            }

            if self.activity_level() == 0 {
                self.0.running.set(false);
                return match resume {
                    Some(_) => Err(Fail::new(libc::EAGAIN, "kernel has no work left")),
                    None => Ok(()),
                };
            }
        }
    }

    fn tick(&self) {
        if self.0.settings.debug {
            self.dump_stats();
            self.assert_invariants();
        }

        if self.activity_level() > 0 {
            let delay: Duration = self.max_delay();
            self.sleep_for(delay);
        }

        let now: Instant = Instant::now();
        self.0.current_time.set(now);
        self.0.next_tick_time.set(now + self.0.settings.idle_tick);

        self.run_hooks(HookKind::BeforeTick);
        self.run_hooks(HookKind::Tick);
        self.run_deferred();
        self.run_hooks(HookKind::AfterTick);

        self.0.tick_count.set(self.0.tick_count.get() + 1);
    }

    /// Sleeps through the sleep hooks, which share the delay. Without any, the thread simply sleeps.
    fn sleep_for(&self, delay: Duration) {
        let sleepers: Vec<SleepHook> = self.0.hooks.borrow().get_sleep();
        if sleepers.is_empty() {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            return;
        }
        let mut delay: Duration = delay / (sleepers.len() as u32);
        for sleeper in sleepers {
            let started: Instant = Instant::now();
            sleeper(self, delay);
            delay = delay.min(started.elapsed());
        }
    }

    fn run_deferred(&self) {
        let deferred: Vec<Deferred> = mem::take(&mut *self.0.deferred.borrow_mut());
        for callback in deferred {
            callback(self);
        }
    }

    /// Runs a single tick, unless the loop is already running. Fails with `EINTR` if [Self::stop] was called during it.
    fn tick_once(&self) -> Result<(), Fail> {
        if self.0.running.get() {
            debug!("tick_once(): the loop is already running, ignoring suspension outside of a coroutine");
            return Ok(());
        }
        // Only a stopped kernel gets past the predicate, so the loop ends after exactly one tick either way.
        self.drive(Some(&mut || !self.0.running.get()))
    }

    fn dump_stats(&self) {
        debug!(
            "tick(): tick={} time={:?} sleep={:?} activity={} [{}]",
            self.tick_count(),
            self.time(),
            self.max_delay(),
            self.activity_level(),
            self.0.ledger.borrow()
        );
    }

    fn assert_invariants(&self) {
        let ledger = self.0.ledger.borrow();
        assert_eq!(
            ledger.get(Coroutines::NAME),
            self.0.coroutines.len(),
            "runnable coroutines disagree with the activity ledger"
        );
        assert_eq!(
            ledger.get(Timers::NAME),
            self.0.timers.len(),
            "pending timers disagree with the activity ledger"
        );
        assert_eq!(
            ledger.get(Io::NAME),
            self.0.io.len(),
            "pending watches disagree with the activity ledger"
        );
    }

    //==================================================================================================================
    // Coroutines
    //==================================================================================================================

    /// Coroutine currently being stepped, if any.
    pub fn current(&self) -> Option<SharedCoroutine> {
        self.0.coroutines.current()
    }

    /// Starts a coroutine and steps it once before returning. The promise settles with whatever the body returns.
    pub fn go<F, Fut, T>(&self, f: F) -> Promise<T>
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<T, Fail>> + 'static,
        T: Clone + 'static,
    {
        let id: CoroutineId = CoroutineId::from(self.0.next_coroutine_id.get());
        self.0.next_coroutine_id.set(u64::from(id) + 1);

        let promise: Promise<T> = Promise::with_origin(id);
        let settler: Promise<T> = promise.clone();
        let start: Start = Box::new(move || -> Body {
            Box::pin(async move {
                // A panicking body rejects its own promise instead of unwinding through the scheduler.
                let body = AssertUnwindSafe(async move { f().await });
                let result: Result<T, Fail> = match body.catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => Err(Fail::from_panic(payload)),
                };
                let settle: Settle = Box::new(move || match result {
                    Ok(value) => settler.resolve(value),
                    Err(e) => {
                        trace!("go(): coroutine {:?} failed (error={:?})", id, e);
                        settler.reject(Arc::new(e))
                    },
                });
                settle
            })
        });
        self.0.coroutines.add(self, SharedCoroutine::new(id, start));
        promise
    }

    /// Runs `f` as a coroutine and drives the loop until it finishes. Must be called from outside any coroutine.
    pub fn run<F, Fut, T>(&self, f: F) -> Result<T, Fail>
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<T, Fail>> + 'static,
        T: Clone + 'static,
    {
        let promise: Promise<T> = self.go(f);
        self.block_on(self.await_thenable(&promise))
    }

    /// Polls `future` from outside any coroutine, ticking the loop whenever it cannot complete yet. Kernel
    /// primitives awaited this way drive the loop themselves.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        if let Some(coroutine) = self.current() {
            panic!("block_on(): called from inside coroutine {:?}", coroutine.id());
        }
        let mut future = pin!(future);
        let mut ctx: Context = Context::from_waker(noop_waker_ref());
        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut ctx) {
                return output;
            }
            if self.0.running.get() {
                panic!("block_on(): cannot make progress while the loop is already running");
            }
            if let Err(e) = self.tick_once() {
                warn!("block_on(): stop requested while waiting on a future, ticking on (error={:?})", e);
            }
        }
    }

    /// Yields the current coroutine to the scheduler. Whoever deactivated it is responsible for activating it again.
    pub fn park(&self) -> Yield {
        match self.current() {
            Some(coroutine) => Yield::new(coroutine),
            None => panic!("park(): no coroutine is running"),
        }
    }

    /// Inside a coroutine, lets every other runnable coroutine take a step. Outside, runs exactly one tick.
    pub async fn suspend(&self) -> Result<(), Fail> {
        match self.current() {
            Some(coroutine) => Yield::new(coroutine).await,
            None => self.tick_once(),
        }
    }

    /// Suspends the current coroutine only if its step has outlasted the interrupt budget.
    pub async fn interrupt(&self) -> Result<(), Fail> {
        match self.current() {
            Some(coroutine) if coroutine.step_elapsed() >= self.0.settings.interrupt_budget => {
                Yield::new(coroutine).await
            },
            _ => Ok(()),
        }
    }

    /// Waits for at least `duration`. Outside a coroutine the loop keeps running in the meantime.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Fail> {
        match self.current() {
            Some(coroutine) => {
                self.0
                    .timers
                    .schedule(self, Target::Coroutine(coroutine.clone()), duration, 0);
                Yield::new(coroutine).await
            },
            None => self.sleep_outside(duration),
        }
    }

    fn sleep_outside(&self, duration: Duration) -> Result<(), Fail> {
        let duration: Duration = duration.min(timer::MAX_DELAY);
        let deadline: Instant = Instant::now() + duration;
        self.set_max_delay(duration);
        let result: Result<(), Fail> = self.run_until(|| {
            let now: Instant = Instant::now();
            if now >= deadline {
                return false;
            }
            self.set_max_delay(deadline - now);
            true
        });
        match result {
            Ok(()) => Ok(()),
            // Nothing else to do, so just block for what is left.
            Err(e) if e.errno == libc::EAGAIN => {
                let remaining: Duration = deadline.saturating_duration_since(Instant::now());
                if !remaining.is_zero() {
                    thread::sleep(remaining);
                }
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    /// Waits until `fd` becomes readable. Returns false on timeout or if the descriptor became invalid.
    pub async fn readable(&self, fd: RawFd, timeout: Option<Duration>) -> Result<bool, Fail> {
        self.0.io.wait(self, fd, Interest::READABLE, timeout).await
    }

    /// Waits until `fd` becomes writable. Returns false on timeout or if the descriptor became invalid.
    pub async fn writable(&self, fd: RawFd, timeout: Option<Duration>) -> Result<bool, Fail> {
        self.0.io.wait(self, fd, Interest::WRITABLE, timeout).await
    }

    /// Waits for `thenable` to settle, returning its value or raising its rejection.
    pub async fn await_thenable<Th: Thenable>(&self, thenable: &Th) -> Result<Th::Output, Fail> {
        self.0.promises.await_thenable(self, thenable).await
    }

    /// Waits until nothing but other draining coroutines is left. Outside a coroutine, runs the loop until idle.
    pub async fn drain(&self) -> Result<(), Fail> {
        match self.current() {
            Some(coroutine) => {
                self.0.zombies.bury(self, &coroutine);
                Yield::new(coroutine).await
            },
            None => self.run_loop(),
        }
    }

    /// Runs `callback` after the coroutine steps of the current (or next) tick.
    pub fn defer<F: FnOnce(&SharedKernel) + 'static>(&self, callback: F) {
        self.0.deferred.borrow_mut().push(Box::new(callback));
        self.set_max_delay(Duration::ZERO);
    }

    /// Runs `task` right after the current coroutine step.
    pub fn queue_microtask<F: FnOnce(&SharedKernel) -> Result<(), Fail> + 'static>(&self, task: F) {
        self.0.coroutines.queue_microtask(Box::new(task));
    }

    /// Invokes `callback` once `delay` has elapsed.
    pub fn set_timeout<F: FnOnce(&SharedKernel) + 'static>(&self, delay: Duration, callback: F) -> EventId {
        let target: Target = Target::Callback(Box::new(move |kernel: &SharedKernel, _: u64| callback(kernel)));
        self.0.timers.schedule(self, target, delay, 0)
    }

    /// Cancels a timeout. Returns false if it already fired or was cancelled.
    pub fn clear_timeout(&self, id: EventId) -> bool {
        self.0.timers.cancel(self, id)
    }

    /// Wraps a stream so that blocking operations on it suspend the calling coroutine instead of the process.
    pub fn unblock<S: AsRawFd + 'static>(&self, stream: Rc<S>) -> Result<Unblocker, Fail> {
        Unblocker::new(self, stream)
    }

    /// Returns the live wrapper of `fd`, if it was unblocked.
    pub fn unblocked_stream(&self, fd: RawFd) -> Option<Unblocker> {
        Unblocker::lookup(self, fd)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Runtime {
    fn drop(&mut self) {
        self.kernel.shutdown();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
