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
    hooks::HookKind,
    KernelModule,
    SharedKernel,
};
use ::std::{
    cell::RefCell,
    cmp::Reverse,
    collections::{
        BinaryHeap,
        HashMap,
    },
    mem,
    rc::Rc,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Longest delay a timer honours. Anything longer never fires in practice, and clamping keeps deadlines on the clock.
pub const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

//======================================================================================================================
// Structures
//======================================================================================================================

struct TimerQueueEntry {
    expiry: Instant,
    id: EventId,
}

/// Deadline-ordered events. Cancelled entries stay in the heap until they reach its top.
#[derive(Default)]
pub struct Timers {
    // Use a reverse to get a min heap.
    heap: RefCell<BinaryHeap<Reverse<TimerQueueEntry>>>,
    active: RefCell<HashMap<EventId, SharedEventHandler>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Timers {
    pub const NAME: &'static str = "core.timers";

    /// Number of timers that have neither fired nor been cancelled.
    pub fn len(&self) -> usize {
        self.active.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.borrow().is_empty()
    }

    /// Fires `target` once `delay` has elapsed. A coroutine target is taken out of the schedule until then.
    pub fn schedule(&self, kernel: &SharedKernel, target: Target, delay: Duration, extra: u64) -> EventId {
        if let Target::Coroutine(coroutine) = &target {
            kernel.coroutines().deactivate(kernel, coroutine);
        }
        let id: EventId = kernel.next_event_id();
        let delay: Duration = delay.min(MAX_DELAY);
        let expiry: Instant = Instant::now() + delay;
        let handler: SharedEventHandler = SharedEventHandler::new(id, target, Some(expiry), extra);
        self.active.borrow_mut().insert(id, handler);
        self.heap.borrow_mut().push(Reverse(TimerQueueEntry { expiry, id }));
        kernel.increment(Self::NAME);
        kernel.set_max_delay(delay);
        trace!("schedule(): timer {} in {:?}", id, delay);
        id
    }

    /// Cancels a pending timer. A coroutine target becomes runnable again. Returns false if there was nothing to cancel.
    pub fn cancel(&self, kernel: &SharedKernel, id: EventId) -> bool {
        let handler: Option<SharedEventHandler> = self.active.borrow_mut().remove(&id);
        match handler {
            Some(handler) => {
                kernel.decrement(Self::NAME);
                handler.cancel(kernel);
                true
            },
            None => false,
        }
    }

    /// Earliest deadline among pending timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.discard_cancelled();
        self.heap.borrow().peek().map(|Reverse(entry)| entry.expiry)
    }

    fn discard_cancelled(&self) {
        let active = self.active.borrow();
        let mut heap = self.heap.borrow_mut();
        while let Some(Reverse(entry)) = heap.peek() {
            if active.contains_key(&entry.id) {
                break;
            }
            heap.pop();
        }
    }

    fn on_before_tick(&self, kernel: &SharedKernel) {
        let now: Instant = Instant::now();
        loop {
            let handler: Option<SharedEventHandler> = {
                let mut heap = self.heap.borrow_mut();
                match heap.peek() {
                    Some(Reverse(entry)) if entry.expiry <= now => {},
                    _ => break,
                }
                let Reverse(entry) = heap.pop().expect("should have an entry because we were able to peek");
                self.active.borrow_mut().remove(&entry.id)
            };
            // Callbacks may schedule or cancel timers, so fire outside of the borrows.
            if let Some(handler) = handler {
                kernel.decrement(Self::NAME);
                handler.fire(kernel);
            }
        }
    }

    fn on_after_tick(&self, kernel: &SharedKernel) {
        if let Some(expiry) = self.next_deadline() {
            kernel.set_max_delay(expiry.saturating_duration_since(Instant::now()));
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl KernelModule for Timers {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn start(&self, kernel: &SharedKernel) {
        kernel.register_module(Self::NAME);
        kernel.install_hook(
            HookKind::BeforeTick,
            Self::NAME,
            Rc::new(|kernel: &SharedKernel| kernel.timers().on_before_tick(kernel)),
        );
        kernel.install_hook(
            HookKind::AfterTick,
            Self::NAME,
            Rc::new(|kernel: &SharedKernel| kernel.timers().on_after_tick(kernel)),
        );
    }

    fn stop(&self, kernel: &SharedKernel) {
        kernel.remove_hooks(Self::NAME);
        kernel.reset_activity(Self::NAME);
        let heap: BinaryHeap<Reverse<TimerQueueEntry>> = mem::take(&mut *self.heap.borrow_mut());
        let active: HashMap<EventId, SharedEventHandler> = mem::take(&mut *self.active.borrow_mut());
        drop(heap);
        drop(active);
    }
}

impl PartialEq for TimerQueueEntry {
    fn eq(&self, other: &TimerQueueEntry) -> bool {
        self.expiry == other.expiry && self.id == other.id
    }
}

impl Eq for TimerQueueEntry {}

impl PartialOrd for TimerQueueEntry {
    fn partial_cmp(&self, other: &TimerQueueEntry) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerQueueEntry {
    fn cmp(&self, other: &TimerQueueEntry) -> core::cmp::Ordering {
        // Ties on expiration go to the timer scheduled first.
        (self.expiry, self.id).cmp(&(other.expiry, other.id))
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
