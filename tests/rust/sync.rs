// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::corokernel::{
    Channel,
    Promise,
    PromiseStatus,
    Runtime,
    SharedKernel,
    WaitGroup,
};
use ::std::time::Duration;
use common::Journal;

//======================================================================================================================
// Wait Groups
//======================================================================================================================

/// A waiter blocked on a wait group of two resumes only after both workers are done.
#[test]
fn wait_group_releases_after_last_worker() -> Result<()> {
    let runtime: Runtime = common::debug_runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let journal: Journal = Journal::default();
    let wg: WaitGroup = WaitGroup::new(&kernel);
    wg.add(2);

    let wg_: WaitGroup = wg.clone();
    let journal_: Journal = journal.clone();
    let waiter: Promise<()> = kernel.go(move || async move {
        wg_.wait().await?;
        journal_.record("released");
        Ok(())
    });

    for delay in [20, 5] {
        let kernel_: SharedKernel = kernel.clone();
        let wg_: WaitGroup = wg.clone();
        let journal_: Journal = journal.clone();
        let _: Promise<()> = kernel.go(move || async move {
            kernel_.sleep(Duration::from_millis(delay)).await?;
            journal_.record(format!("done {}", delay));
            wg_.done();
            Ok(())
        });
    }

    corokernel::ensure_eq!(waiter.status(), PromiseStatus::Pending);
    kernel.block_on(kernel.await_thenable(&waiter))?;
    let expected: Vec<String> = vec!["done 5".to_string(), "done 20".to_string(), "released".to_string()];
    corokernel::ensure_eq!(journal.entries(), expected);
    corokernel::ensure_eq!(wg.count(), 0);
    Ok(())
}

/// Waiting outside of any coroutine on a wait group nobody will finish is reported as a deadlock.
#[test]
fn wait_group_deadlock_is_reported() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let wg: WaitGroup = WaitGroup::new(&kernel);
    wg.add(1);
    let errno: Option<i32> = kernel.block_on(wg.wait()).err().map(|e| e.errno);
    corokernel::ensure_eq!(errno, Some(libc::EDEADLK));
    Ok(())
}

/// Waiting outside of any coroutine drives the workers that finish the wait group.
#[test]
fn wait_group_wait_outside_drives_workers() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let wg: WaitGroup = WaitGroup::new(&kernel);
    for delay in [1, 2, 3] {
        wg.add(1);
        let kernel_: SharedKernel = kernel.clone();
        let wg_: WaitGroup = wg.clone();
        let _: Promise<()> = kernel.go(move || async move {
            kernel_.sleep(Duration::from_millis(delay)).await?;
            wg_.done();
            Ok(())
        });
    }
    kernel.block_on(wg.wait())?;
    corokernel::ensure_eq!(wg.count(), 0);
    Ok(())
}

//======================================================================================================================
// Channels
//======================================================================================================================

/// On an unbuffered channel, a send completes only once a receiver has taken the value.
#[test]
fn unbuffered_channel_is_a_rendezvous() -> Result<()> {
    let runtime: Runtime = common::debug_runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let journal: Journal = Journal::default();
    let channel: Channel<u32> = Channel::new(&kernel, 0);

    let channel_: Channel<u32> = channel.clone();
    let journal_: Journal = journal.clone();
    let _: Promise<()> = kernel.go(move || async move {
        journal_.record("sending");
        channel_.send(42).await?;
        journal_.record("sent");
        Ok(())
    });

    let kernel_: SharedKernel = kernel.clone();
    let channel_: Channel<u32> = channel.clone();
    let journal_: Journal = journal.clone();
    let _: Promise<()> = kernel.go(move || async move {
        kernel_.sleep(Duration::from_millis(10)).await?;
        let value: u32 = channel_.receive().await?;
        journal_.record(format!("received {}", value));
        Ok(())
    });

    kernel.run_loop()?;
    let expected: Vec<String> = vec!["sending".to_string(), "received 42".to_string(), "sent".to_string()];
    corokernel::ensure_eq!(journal.entries(), expected);
    Ok(())
}

/// With a buffer of B, exactly B sends complete before the next one blocks.
#[test]
fn buffered_channel_blocks_when_full() -> Result<()> {
    const CAPACITY: usize = 3;
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let channel: Channel<usize> = Channel::new(&kernel, CAPACITY);
    let journal: Journal = Journal::default();

    let channel_: Channel<usize> = channel.clone();
    let journal_: Journal = journal.clone();
    let producer: Promise<()> = kernel.go(move || async move {
        for i in 0..CAPACITY + 2 {
            channel_.send(i).await?;
            journal_.record(format!("sent {}", i));
        }
        Ok(())
    });
    corokernel::ensure_eq!(journal.entries().len(), CAPACITY);
    corokernel::ensure_eq!(channel.len(), CAPACITY);
    corokernel::ensure_eq!(channel.capacity(), CAPACITY);

    let mut received: Vec<usize> = Vec::new();
    for _ in 0..CAPACITY + 2 {
        received.push(kernel.block_on(channel.receive())?);
    }
    kernel.block_on(kernel.await_thenable(&producer))?;
    corokernel::ensure_eq!(received, (0..CAPACITY + 2).collect::<Vec<usize>>());
    corokernel::ensure_eq!(channel.is_empty(), true);
    Ok(())
}

/// Values flow from many producers to many consumers in FIFO order per producer.
#[test]
fn channel_fan_in_preserves_order() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let channel: Channel<(usize, usize)> = Channel::new(&kernel, 1);
    for producer in 0..3 {
        let kernel_: SharedKernel = kernel.clone();
        let channel_: Channel<(usize, usize)> = channel.clone();
        let _: Promise<()> = kernel.go(move || async move {
            for seq in 0..5 {
                channel_.send((producer, seq)).await?;
                kernel_.suspend().await?;
            }
            Ok(())
        });
    }

    let channel_: Channel<(usize, usize)> = channel.clone();
    let consumer: Promise<Vec<(usize, usize)>> = kernel.go(move || async move {
        let mut values: Vec<(usize, usize)> = Vec::new();
        for _ in 0..15 {
            values.push(channel_.receive().await?);
        }
        Ok(values)
    });

    let values: Vec<(usize, usize)> = kernel.block_on(kernel.await_thenable(&consumer))?;
    for producer in 0..3 {
        let seqs: Vec<usize> = values.iter().filter(|(p, _)| *p == producer).map(|(_, s)| *s).collect();
        corokernel::ensure_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }
    Ok(())
}

/// Receiving outside of any coroutine from a channel nobody sends to is reported as a deadlock.
#[test]
fn channel_deadlock_is_reported() -> Result<()> {
    let runtime: Runtime = common::runtime()?;
    let kernel: SharedKernel = runtime.kernel().clone();
    let channel: Channel<String> = Channel::new(&kernel, 0);
    let errno: Option<i32> = kernel.block_on(channel.receive()).err().map(|e| e.errno);
    corokernel::ensure_eq!(errno, Some(libc::EDEADLK));
    Ok(())
}
