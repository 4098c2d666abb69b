// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::corokernel::{
    EventId,
    Fail,
    Promise,
    PromiseStatus,
    Runtime,
    SharedKernel,
};
use ::std::{
    cell::Cell,
    rc::Rc,
    time::{
        Duration,
        Instant,
    },
};
use common::Journal;

//======================================================================================================================
// Sleep
//======================================================================================================================

/// Coroutines sleeping for different durations finish in deadline order, not start order.
#[test]
fn shorter_sleep_finishes_first() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let journal: Journal = Journal::default();

    for (name, delay) in [("A", 50), ("B", 20)] {
        let kernel_: SharedKernel = kernel.clone();
        let journal_: Journal = journal.clone();
        let _: Promise<()> = kernel.go(move || async move {
            kernel_.sleep(Duration::from_millis(delay)).await?;
            journal_.record(name);
            Ok(())
        });
    }

    kernel.run_loop()?;
    corokernel::ensure_eq!(journal.entries(), vec!["B".to_string(), "A".to_string()]);
    Ok(())
}

/// A sleeping coroutine resumes no earlier than its deadline, and its siblings keep running in the meantime.
#[test]
fn siblings_progress_while_sleeping() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let spins: Rc<Cell<u64>> = Rc::new(Cell::new(0));
    let done: Rc<Cell<bool>> = Rc::new(Cell::new(false));

    let kernel_: SharedKernel = kernel.clone();
    let done_: Rc<Cell<bool>> = done.clone();
    let sleeper: Promise<Duration> = kernel.go(move || async move {
        let start: Instant = Instant::now();
        kernel_.sleep(Duration::from_millis(30)).await?;
        done_.set(true);
        Ok(start.elapsed())
    });

    let kernel_: SharedKernel = kernel.clone();
    let spins_: Rc<Cell<u64>> = spins.clone();
    let done_: Rc<Cell<bool>> = done.clone();
    let _: Promise<()> = kernel.go(move || async move {
        while !done_.get() {
            spins_.set(spins_.get() + 1);
            kernel_.suspend().await?;
        }
        Ok(())
    });

    let elapsed: Duration = kernel.block_on(kernel.await_thenable(&sleeper))?;
    corokernel::ensure_eq!(elapsed >= Duration::from_millis(30), true);
    corokernel::ensure_eq!(spins.get() > 1, true);
    Ok(())
}

/// Sleeping outside of any coroutine still drives pending coroutines.
#[test]
fn sleep_outside_drives_coroutines() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let journal: Journal = Journal::default();
    let kernel_: SharedKernel = kernel.clone();
    let journal_: Journal = journal.clone();
    let _: Promise<()> = kernel.go(move || async move {
        kernel_.sleep(Duration::from_millis(5)).await?;
        journal_.record("woke");
        Ok(())
    });
    kernel.block_on(kernel.sleep(Duration::from_millis(20)))?;
    corokernel::ensure_eq!(journal.entries(), vec!["woke".to_string()]);
    Ok(())
}

//======================================================================================================================
// Lifecycle
//======================================================================================================================

/// An idle kernel returns from its loop right away.
#[test]
fn idle_kernel_does_not_sleep() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let start: Instant = Instant::now();
    runtime.kernel().run_loop()?;
    corokernel::ensure_eq!(runtime.kernel().activity_level(), 0);
    corokernel::ensure_eq!(start.elapsed() < Duration::from_millis(100), true);
    Ok(())
}

/// Every coroutine settles its promise exactly once, with its value or its error.
#[test]
fn promises_settle_once() -> Result<()> {
    let runtime: Runtime = common::debug_runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let mut promises: Vec<Promise<u32>> = Vec::new();
    for i in 0..8u32 {
        let kernel_: SharedKernel = kernel.clone();
        promises.push(kernel.go(move || async move {
            for _ in 0..i {
                kernel_.suspend().await?;
            }
            match i % 2 {
                0 => Ok(i),
                _ => Err(Fail::new(libc::EINVAL, "odd")),
            }
        }));
    }
    kernel.run_loop()?;
    for (i, promise) in promises.iter().enumerate() {
        let expected: PromiseStatus = match i % 2 {
            0 => PromiseStatus::Fulfilled,
            _ => PromiseStatus::Rejected,
        };
        corokernel::ensure_eq!(promise.status(), expected);
        let result: Result<u32, Fail> = kernel.block_on(kernel.await_thenable(promise));
        corokernel::ensure_eq!(result.map_err(|e| e.errno), if i % 2 == 0 { Ok(i as u32) } else { Err(libc::EINVAL) });
    }
    Ok(())
}

/// Errors raised inside a coroutine reach whoever awaits it, without disturbing siblings.
#[test]
fn errors_stay_local_to_their_coroutine() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let kernel_: SharedKernel = kernel.clone();
    let sibling: Promise<u32> = kernel.go(move || async move {
        kernel_.sleep(Duration::from_millis(5)).await?;
        Ok(7)
    });
    let kernel_: SharedKernel = kernel.clone();
    let failed: Result<(), Fail> = kernel.run(move || async move {
        kernel_.suspend().await?;
        Err(Fail::new(libc::ENOENT, "missing"))
    });
    corokernel::ensure_eq!(failed.map_err(|e| e.errno), Err(libc::ENOENT));
    corokernel::ensure_eq!(kernel.block_on(kernel.await_thenable(&sibling))?, 7);
    Ok(())
}

/// A drained coroutine resumes only once everything else has finished.
#[test]
fn drain_waits_for_other_work() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let journal: Journal = Journal::default();

    let kernel_: SharedKernel = kernel.clone();
    let journal_: Journal = journal.clone();
    let _: Promise<()> = kernel.go(move || async move {
        kernel_.drain().await?;
        journal_.record("cleanup");
        Ok(())
    });
    for delay in [10, 5] {
        let kernel_: SharedKernel = kernel.clone();
        let journal_: Journal = journal.clone();
        let _: Promise<()> = kernel.go(move || async move {
            kernel_.sleep(Duration::from_millis(delay)).await?;
            journal_.record(format!("work {}", delay));
            Ok(())
        });
    }

    kernel.run_loop()?;
    let expected: Vec<String> = vec!["work 5".to_string(), "work 10".to_string(), "cleanup".to_string()];
    corokernel::ensure_eq!(journal.entries(), expected);
    Ok(())
}

/// Stopping the loop returns control to the caller, and dropping the runtime finishes the remaining work.
#[test]
fn stop_returns_early_and_shutdown_drains() -> Result<()> {
    let finished: Rc<Cell<bool>> = Rc::new(Cell::new(false));
    {
        let runtime: Runtime = common::runtime()?;
        let kernel: SharedKernel = runtime.kernel().clone();
        let kernel_: SharedKernel = kernel.clone();
        let _: Promise<()> = kernel.go(move || async move {
            kernel_.suspend().await?;
            kernel_.stop();
            Ok(())
        });
        let kernel_: SharedKernel = kernel.clone();
        let finished_: Rc<Cell<bool>> = finished.clone();
        let _: Promise<()> = kernel.go(move || async move {
            kernel_.sleep(Duration::from_millis(20)).await?;
            finished_.set(true);
            Ok(())
        });
        kernel.run_loop()?;
        corokernel::ensure_eq!(finished.get(), false);
        corokernel::ensure_eq!(kernel.activity_level() > 0, true);
    }
    corokernel::ensure_eq!(finished.get(), true);
    Ok(())
}

/// Deferred callbacks and timeouts run outside of coroutines, in the loop that owns them.
#[test]
fn deferred_work_and_timeouts() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let journal: Journal = Journal::default();

    let journal_: Journal = journal.clone();
    kernel.set_timeout(Duration::from_millis(10), move |_: &SharedKernel| journal_.record("timeout"));
    let journal_: Journal = journal.clone();
    let cancelled: EventId = kernel.set_timeout(Duration::from_millis(5), move |_: &SharedKernel| journal_.record("cancelled"));
    let journal_: Journal = journal.clone();
    kernel.defer(move |_: &SharedKernel| journal_.record("deferred"));
    corokernel::ensure_eq!(kernel.clear_timeout(cancelled), true);

    kernel.run_loop()?;
    corokernel::ensure_eq!(journal.entries(), vec!["deferred".to_string(), "timeout".to_string()]);
    Ok(())
}

/// Driving the loop from inside a coroutine is a programming error. The panic stays inside that coroutine and
/// rejects its promise.
#[test]
fn driving_loop_from_coroutine_rejects_it() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let kernel_: SharedKernel = kernel.clone();
    let promise: Promise<()> = kernel.go(move || async move { kernel_.run_loop() });
    corokernel::ensure_eq!(promise.status(), PromiseStatus::Rejected);
    let errno: Option<i32> = kernel.block_on(kernel.await_thenable(&promise)).err().map(|e| e.errno);
    corokernel::ensure_eq!(errno, Some(libc::ENOTRECOVERABLE));
    Ok(())
}

/// A coroutine that panics fails alone. Its siblings keep running and the loop carries on.
#[test]
fn panic_in_one_coroutine_spares_siblings() -> Result<()> {
    let runtime: Runtime = common::debug_runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let journal: Journal = Journal::default();

    let kernel_: SharedKernel = kernel.clone();
    let journal_: Journal = journal.clone();
    let broken: Promise<u32> = kernel.go(move || async move {
        kernel_.sleep(Duration::from_millis(5)).await?;
        journal_.record("broken");
        let empty: Vec<u32> = Vec::new();
        Ok(empty[0])
    });
    let kernel_: SharedKernel = kernel.clone();
    let journal_: Journal = journal.clone();
    let sibling: Promise<()> = kernel.go(move || async move {
        kernel_.sleep(Duration::from_millis(20)).await?;
        journal_.record("sibling");
        Ok(())
    });

    kernel.run_loop()?;
    corokernel::ensure_eq!(journal.entries(), vec!["broken".to_string(), "sibling".to_string()]);
    corokernel::ensure_eq!(broken.status(), PromiseStatus::Rejected);
    corokernel::ensure_eq!(sibling.status(), PromiseStatus::Fulfilled);
    Ok(())
}
