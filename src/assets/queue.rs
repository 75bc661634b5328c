//! Serialized load queue
//!
//! Loading many assets at once stalls the frame. Requests routed through the
//! [`LoadCoordinator`] are served one at a time instead: the next queued load
//! is dispatched only after the previous one has completed.
//!
//! # Example
//!
//! ```ignore
//! // Cache hits resolve synchronously and never enter the queue
//! coordinator.enqueue_or_serve(key, consumer, |asset| show(asset));
//!
//! // Once per frame
//! coordinator.drain();
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use super::key::AssetKey;
use super::owners::ConsumerId;
use super::registry::HandleRegistry;
use crate::backend::AssetBackend;

/// Callback receiving a requested asset, or `None` if the load failed
type AssetCallback<A> = Box<dyn FnOnce(Option<A>)>;

/// A request waiting in the load queue
struct LoadRequest<A> {
    key: AssetKey,
    consumer: ConsumerId,
    callback: AssetCallback<A>,
}

impl<A> std::fmt::Debug for LoadRequest<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadRequest")
            .field("key", &self.key)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

/// Single-file FIFO of load requests.
///
/// At most one queued load is outstanding at any time. The busy slot holds the
/// ticket of that load and is cleared only by that load's own completion, so
/// unrelated immediate loads finishing in between do not open the gate.
pub struct LoadCoordinator<B: AssetBackend> {
    registry: Rc<HandleRegistry<B>>,
    queue: RefCell<VecDeque<LoadRequest<B::Asset>>>,
    /// Ticket of the outstanding queued load
    busy: Rc<Cell<Option<u64>>>,
    next_ticket: Cell<u64>,
    paused: Cell<bool>,
}

impl<B: AssetBackend> LoadCoordinator<B> {
    /// Default initial capacity for the queue.
    const DEFAULT_CAPACITY: usize = 32;

    /// Create an empty coordinator in front of `registry`
    #[must_use]
    pub fn new(registry: Rc<HandleRegistry<B>>) -> Self {
        Self {
            registry,
            queue: RefCell::new(VecDeque::with_capacity(Self::DEFAULT_CAPACITY)),
            busy: Rc::new(Cell::new(None)),
            next_ticket: Cell::new(0),
            paused: Cell::new(false),
        }
    }

    /// Serve from cache if possible, otherwise append to the queue.
    ///
    /// Returns `true` if the request was served synchronously.
    pub fn enqueue_or_serve(
        &self,
        key: AssetKey,
        consumer: ConsumerId,
        callback: impl FnOnce(Option<B::Asset>) + 'static,
    ) -> bool {
        let registry = &self.registry;
        match registry.try_serve_from_cache(&key, consumer, callback) {
            Ok(()) => true,
            Err(callback) => {
                self.queue.borrow_mut().push_back(LoadRequest {
                    key,
                    consumer,
                    callback: Box::new(callback),
                });
                false
            }
        }
    }

    /// Dispatch the next queued load if none is outstanding.
    ///
    /// Requests whose consumer has been destroyed are discarded without
    /// loading. Returns `true` if a load was dispatched.
    pub fn drain(&self) -> bool {
        if self.paused.get() || self.busy.get().is_some() {
            return false;
        }

        let registry = &self.registry;
        loop {
            let Some(request) = self.queue.borrow_mut().pop_front() else {
                return false;
            };
            if !registry.is_consumer_valid(request.consumer) {
                log::debug!("Dropping queued '{}': consumer destroyed", request.key);
                continue;
            }

            let ticket = self.next_ticket.get();
            self.next_ticket.set(ticket.wrapping_add(1));
            self.busy.set(Some(ticket));
            log::debug!(
                "Dispatching queued '{}' ({} waiting)",
                request.key,
                self.len()
            );

            let busy = Rc::clone(&self.busy);
            let settled = move || {
                if busy.get() == Some(ticket) {
                    busy.set(None);
                }
            };
            registry.load_then(&request.key, request.consumer, request.callback, settled);
            return true;
        }
    }

    /// Whether a queued load is outstanding
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.get().is_some()
    }

    /// Stop dispatching; queued requests stay queued
    pub fn pause(&self) {
        self.paused.set(true);
    }

    /// Resume dispatching
    pub fn resume(&self) {
        self.paused.set(false);
    }

    /// Whether dispatching is paused
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.get()
    }

    /// Number of requests waiting
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Check if no request is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

impl<B: AssetBackend> std::fmt::Debug for LoadCoordinator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadCoordinator")
            .field("queued", &self.len())
            .field("busy", &self.is_busy())
            .field("paused", &self.is_paused())
            .finish()
    }
}
