// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::{
        SharedCoroutine,
        Yield,
    },
    SharedKernel,
};
use ::libc::{
    EAGAIN,
    EDEADLK,
    EINTR,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    collections::VecDeque,
    rc::Rc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Whoever is blocked on the channel.
enum Party {
    Coroutine(SharedCoroutine),
    /// Code outside of any coroutine, driving the loop until it is served.
    Outside,
}

struct PendingSender<T> {
    ticket: u64,
    party: Party,
    value: T,
    delivered: Rc<Cell<bool>>,
}

struct PendingReceiver<T> {
    ticket: u64,
    party: Party,
    slot: Rc<RefCell<Option<T>>>,
}

struct ChannelState<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    senders: VecDeque<PendingSender<T>>,
    receivers: VecDeque<PendingReceiver<T>>,
    next_ticket: u64,
}

enum Offer {
    Accepted,
    Blocked(u64, Rc<Cell<bool>>),
}

enum Take<T> {
    Taken(T),
    Blocked(u64, Rc<RefCell<Option<T>>>),
}

/// Bounded FIFO channel. With a zero capacity, every send waits for a matching receive.
pub struct Channel<T> {
    kernel: SharedKernel,
    state: Rc<RefCell<ChannelState<T>>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T: 'static> Channel<T> {
    pub fn new(kernel: &SharedKernel, capacity: usize) -> Self {
        Self {
            kernel: kernel.clone(),
            state: Rc::new(RefCell::new(ChannelState {
                capacity,
                buffer: VecDeque::with_capacity(capacity),
                senders: VecDeque::new(),
                receivers: VecDeque::new(),
                next_ticket: 0,
            })),
        }
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.state.borrow().buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.state.borrow().capacity
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().buffer.is_empty()
    }

    /// Sends `value`, waiting for buffer space or a receiver if needed.
    pub async fn send(&self, value: T) -> Result<(), Fail> {
        let current: Option<SharedCoroutine> = self.kernel.current();
        let (ticket, delivered): (u64, Rc<Cell<bool>>) = match self.offer(value, current.as_ref()) {
            Offer::Accepted => return Ok(()),
            Offer::Blocked(ticket, delivered) => (ticket, delivered),
        };

        match current {
            Some(coroutine) => {
                self.kernel.coroutines().deactivate(&self.kernel, &coroutine);
                let resumed: Result<(), Fail> = Yield::new(coroutine).await;
                if !delivered.get() {
                    self.withdraw_sender(ticket);
                    resumed?;
                    return Err(Fail::new(EINTR, "sender resumed before its value was taken"));
                }
                resumed
            },
            None => match self.kernel.run_until(|| !delivered.get()) {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.withdraw_sender(ticket);
                    Err(Self::deadlock(e, "kernel went idle with a blocked sender"))
                },
            },
        }
    }

    /// Receives the oldest value, waiting for a sender if needed.
    pub async fn receive(&self) -> Result<T, Fail> {
        let current: Option<SharedCoroutine> = self.kernel.current();
        let (ticket, slot): (u64, Rc<RefCell<Option<T>>>) = match self.take(current.as_ref()) {
            Take::Taken(value) => return Ok(value),
            Take::Blocked(ticket, slot) => (ticket, slot),
        };

        match current {
            Some(coroutine) => {
                self.kernel.coroutines().deactivate(&self.kernel, &coroutine);
                let resumed: Result<(), Fail> = Yield::new(coroutine).await;
                let value: Option<T> = slot.borrow_mut().take();
                match value {
                    // The value is already off the channel, so it wins over whatever woke us up.
                    Some(value) => {
                        if let Err(e) = resumed {
                            debug!("receive(): value arrived, ignoring injected error (error={:?})", e);
                        }
                        Ok(value)
                    },
                    None => {
                        self.withdraw_receiver(ticket);
                        resumed?;
                        Err(Fail::new(EINTR, "receiver resumed before a value arrived"))
                    },
                }
            },
            None => {
                if let Err(e) = self.kernel.run_until(|| slot.borrow().is_none()) {
                    self.withdraw_receiver(ticket);
                    return Err(Self::deadlock(e, "kernel went idle with a blocked receiver"));
                }
                let value: Option<T> = slot.borrow_mut().take();
                value.ok_or_else(|| Fail::new(EINTR, "receiver resumed before a value arrived"))
            },
        }
    }

    /// Hands `value` to the oldest receiver, buffers it, or queues it as a blocked sender.
    fn offer(&self, value: T, current: Option<&SharedCoroutine>) -> Offer {
        let receiver: PendingReceiver<T> = {
            let mut state = self.state.borrow_mut();
            match state.receivers.pop_front() {
                Some(receiver) => receiver,
                None => {
                    if state.buffer.len() < state.capacity {
                        state.buffer.push_back(value);
                        return Offer::Accepted;
                    }
                    let ticket: u64 = state.take_ticket();
                    let delivered: Rc<Cell<bool>> = Rc::new(Cell::new(false));
                    state.senders.push_back(PendingSender {
                        ticket,
                        party: Party::of(current),
                        value,
                        delivered: delivered.clone(),
                    });
                    return Offer::Blocked(ticket, delivered);
                },
            }
        };
        *receiver.slot.borrow_mut() = Some(value);
        self.wake(receiver.party);
        Offer::Accepted
    }

    /// Takes the oldest buffered value and refills the buffer from the oldest sender, takes straight from a sender,
    /// or queues a blocked receiver.
    fn take(&self, current: Option<&SharedCoroutine>) -> Take<T> {
        let (value, sender): (T, Option<(Party, Rc<Cell<bool>>)>) = {
            let mut state = self.state.borrow_mut();
            match state.buffer.pop_front() {
                Some(value) => match state.senders.pop_front() {
                    Some(sender) => {
                        state.buffer.push_back(sender.value);
                        (value, Some((sender.party, sender.delivered)))
                    },
                    None => (value, None),
                },
                None => match state.senders.pop_front() {
                    Some(sender) => (sender.value, Some((sender.party, sender.delivered))),
                    None => {
                        let ticket: u64 = state.take_ticket();
                        let slot: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
                        state.receivers.push_back(PendingReceiver {
                            ticket,
                            party: Party::of(current),
                            slot: slot.clone(),
                        });
                        return Take::Blocked(ticket, slot);
                    },
                },
            }
        };
        if let Some((party, delivered)) = sender {
            delivered.set(true);
            self.wake(party);
        }
        Take::Taken(value)
    }

    fn wake(&self, party: Party) {
        if let Party::Coroutine(coroutine) = party {
            self.kernel.coroutines().activate(&self.kernel, &coroutine);
        }
    }

    fn withdraw_sender(&self, ticket: u64) {
        self.state.borrow_mut().senders.retain(|sender| sender.ticket != ticket);
    }

    fn withdraw_receiver(&self, ticket: u64) {
        self.state.borrow_mut().receivers.retain(|receiver| receiver.ticket != ticket);
    }

    fn deadlock(e: Fail, cause: &str) -> Fail {
        match e.errno {
            EAGAIN => Fail::new(EDEADLK, cause),
            _ => e,
        }
    }
}

impl<T> ChannelState<T> {
    fn take_ticket(&mut self) -> u64 {
        let ticket: u64 = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }
}

impl Party {
    fn of(current: Option<&SharedCoroutine>) -> Self {
        match current {
            Some(coroutine) => Party::Coroutine(coroutine.clone()),
            None => Party::Outside,
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            kernel: self.kernel.clone(),
            state: self.state.clone(),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
