use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use anyhow::Result;

/// A receiver of events published on an [`EventBus`].
///
/// Any `Fn(&E) -> Result<()>` closure is a handler. Object targets (entities,
/// widgets) implement the trait directly so they can be connected with
/// [`EventBus::connect_shared`] or [`EventBus::connect_weak`] and reached
/// again through [`EventBus::apply_to_all`].
///
/// Handlers take `&self`: a handler may synchronously dispatch on the bus that
/// is invoking it, so it must tolerate being re-entered. Use `Cell`/`RefCell`
/// for state.
pub trait Handler<E> {
    /// Handle one event. An error aborts the dispatch pass and is returned
    /// to the caller of [`EventBus::dispatch`].
    fn handle(&self, event: &E) -> Result<()>;

    /// Return `self` as `&dyn Any` to enable downcasting in
    /// [`EventBus::apply_to_all`].
    fn as_any(&self) -> &dyn Any;
}

impl<E, F> Handler<E> for F
where
    F: Fn(&E) -> Result<()> + 'static,
{
    fn handle(&self, event: &E) -> Result<()> {
        self(event)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// How a subscription holds on to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The bus keeps the handler alive for as long as it is subscribed.
    Strong,
    /// The bus only observes the handler. Once every other owner drops it the
    /// subscription is dead and is pruned the next time the bus touches it.
    Weak,
}

enum Target<E> {
    Strong(Rc<dyn Handler<E>>),
    Weak(Weak<dyn Handler<E>>),
}

impl<E> Target<E> {
    fn get(&self) -> Option<Rc<dyn Handler<E>>> {
        match self {
            Target::Strong(handler) => Some(handler.clone()),
            Target::Weak(handler) => handler.upgrade(),
        }
    }

    fn addr(&self) -> *const () {
        match self {
            Target::Strong(handler) => Rc::as_ptr(handler) as *const (),
            Target::Weak(handler) => handler.as_ptr() as *const (),
        }
    }

    fn ownership(&self) -> Ownership {
        match self {
            Target::Strong(_) => Ownership::Strong,
            Target::Weak(_) => Ownership::Weak,
        }
    }
}

struct Slot<E> {
    id: u64,
    target: Target<E>,
    once: bool,
    /// Set once a one-shot slot has fired; nested passes skip it.
    spent: Cell<bool>,
    /// Logical membership. Cleared as soon as removal is requested, even if
    /// the physical removal is still queued behind a dispatch.
    connected: Cell<bool>,
    priority: Cell<i32>,
}

type Reorder<E> = Box<dyn FnOnce(&mut Vec<Rc<Slot<E>>>)>;
type Action<E> = Box<dyn FnMut(&dyn Handler<E>)>;

/// Structural operation deferred until the outermost dispatch unwinds.
enum Pending<E> {
    Connect(Rc<Slot<E>>),
    Disconnect(Rc<Slot<E>>),
    Clear,
    Reorder(Reorder<E>),
    Apply(Action<E>),
}

struct BusInner<E> {
    slots: RefCell<Vec<Rc<Slot<E>>>>,
    depth: Cell<usize>,
    queued: RefCell<VecDeque<Pending<E>>>,
    draining: Cell<bool>,
    next_id: Cell<u64>,
}

/// Keeps `depth` raised for the duration of a pass and replays queued
/// operations when the outermost pass ends, including on early return.
struct PassGuard<'a, E: 'static> {
    bus: &'a BusInner<E>,
}

impl<'a, E: 'static> PassGuard<'a, E> {
    fn enter(bus: &'a BusInner<E>) -> Self {
        bus.depth.set(bus.depth.get() + 1);
        Self { bus }
    }
}

impl<E: 'static> Drop for PassGuard<'_, E> {
    fn drop(&mut self) {
        let depth = self.bus.depth.get() - 1;
        self.bus.depth.set(depth);
        if depth == 0 {
            self.bus.flush();
        }
    }
}

impl<E: 'static> BusInner<E> {
    fn new() -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
            depth: Cell::new(0),
            queued: RefCell::new(VecDeque::new()),
            draining: Cell::new(false),
            next_id: Cell::new(0),
        }
    }

    fn blocked(&self) -> bool {
        self.depth.get() > 0
    }

    fn defer(&self, op: Pending<E>) {
        self.queued.borrow_mut().push_back(op);
    }

    fn attach(&self, slot: Rc<Slot<E>>) {
        if self.blocked() {
            tracing::trace!(slot = slot.id, "connect queued behind dispatch");
            self.defer(Pending::Connect(slot));
        } else {
            self.slots.borrow_mut().push(slot);
        }
    }

    /// Request removal of `slot`. Returns `false` if it was already removed.
    fn detach(&self, slot: &Rc<Slot<E>>) -> bool {
        if !slot.connected.replace(false) {
            return false;
        }
        if self.blocked() {
            tracing::trace!(slot = slot.id, "disconnect queued behind dispatch");
            self.defer(Pending::Disconnect(slot.clone()));
        } else {
            self.slots.borrow_mut().retain(|s| !Rc::ptr_eq(s, slot));
        }
        true
    }

    /// Find the first connected slot whose handler lives at `addr`, looking at
    /// live slots first and then at connects still waiting in the queue.
    fn find_target(&self, addr: *const ()) -> Option<Rc<Slot<E>>> {
        let live = self
            .slots
            .borrow()
            .iter()
            .find(|s| s.connected.get() && s.target.addr() == addr)
            .cloned();
        live.or_else(|| {
            self.queued.borrow().iter().find_map(|op| match op {
                Pending::Connect(s) if s.connected.get() && s.target.addr() == addr => {
                    Some(s.clone())
                }
                _ => None,
            })
        })
    }

    fn clear_now(&self) -> bool {
        let removed = std::mem::take(&mut *self.slots.borrow_mut());
        for slot in &removed {
            slot.connected.set(false);
        }
        !removed.is_empty()
    }

    /// Queue a clear. Everything it will remove counts as disconnected from
    /// now on, the same as a queued disconnect.
    fn clear_later(&self) {
        for slot in self.slots.borrow().iter() {
            slot.connected.set(false);
        }
        for op in self.queued.borrow().iter() {
            if let Pending::Connect(slot) = op {
                slot.connected.set(false);
            }
        }
        self.defer(Pending::Clear);
    }

    fn reorder(&self, reorder: Reorder<E>) {
        if self.blocked() {
            self.defer(Pending::Reorder(reorder));
        } else {
            self.reorder_now(reorder);
        }
    }

    /// Sort keys may run user code, so a copy of the sequence is sorted while
    /// the bus is treated as mid-pass. A dispatch from inside a key still
    /// sees the current order, and mutations it makes are queued.
    fn reorder_now(&self, reorder: Reorder<E>) {
        let _pass = PassGuard::enter(self);
        let mut slots = self.slots.borrow().clone();
        reorder(&mut slots);
        *self.slots.borrow_mut() = slots;
    }

    fn slot_at(&self, index: usize) -> Option<Rc<Slot<E>>> {
        self.slots.borrow().get(index).cloned()
    }

    fn apply_now(&self, action: &mut dyn FnMut(&dyn Handler<E>)) {
        let _pass = PassGuard::enter(self);
        let count = self.slots.borrow().len();
        for index in 0..count {
            let Some(slot) = self.slot_at(index) else {
                break;
            };
            if slot.spent.get() {
                continue;
            }
            match slot.target.get() {
                Some(handler) => action(&*handler),
                None => {
                    self.detach(&slot);
                }
            }
        }
    }

    fn dispatch(&self, event: &E) -> Result<()> {
        let _pass = PassGuard::enter(self);
        // Structural changes are queued while the guard is held, so the slot
        // sequence is stable for the whole pass.
        let count = self.slots.borrow().len();
        for index in 0..count {
            let Some(slot) = self.slot_at(index) else {
                break;
            };
            if slot.spent.get() {
                continue;
            }
            let Some(handler) = slot.target.get() else {
                tracing::trace!(slot = slot.id, "pruning dead weak subscription");
                self.detach(&slot);
                continue;
            };
            if !slot.once {
                handler.handle(event)?;
                continue;
            }
            // Spent before the call so a dispatch from inside the handler
            // cannot deliver to it a second time.
            slot.spent.set(true);
            if let Err(err) = handler.handle(event) {
                slot.spent.set(false);
                return Err(err);
            }
            self.detach(&slot);
        }
        Ok(())
    }

    /// Replay queued operations in request order.
    fn flush(&self) {
        if self.draining.replace(true) {
            return;
        }
        loop {
            let next = self.queued.borrow_mut().pop_front();
            let Some(op) = next else {
                break;
            };
            match op {
                Pending::Connect(slot) => {
                    if slot.connected.get() {
                        self.slots.borrow_mut().push(slot);
                    }
                }
                Pending::Disconnect(slot) => {
                    self.slots.borrow_mut().retain(|s| !Rc::ptr_eq(s, &slot));
                }
                Pending::Clear => {
                    self.clear_now();
                }
                Pending::Reorder(reorder) => self.reorder_now(reorder),
                Pending::Apply(mut action) => self.apply_now(&mut *action),
            }
        }
        self.draining.set(false);
    }
}

/// An ordered publish/subscribe channel for events of type `E`.
///
/// Subscriptions are invoked in registration order. The bus is safe to mutate
/// from inside its own dispatch: `connect`, `disconnect`, `clear`, `sort` and
/// `apply_to_all` issued while a dispatch is in progress are queued and
/// replayed, in request order, right after the outermost dispatch returns.
/// A subscription added mid-dispatch therefore never sees the event that was
/// being delivered when it was added.
///
/// `EventBus` is a cheap handle; clones refer to the same bus. It is meant to
/// be passed explicitly to whichever components publish or subscribe.
pub struct EventBus<E: 'static> {
    inner: Rc<BusInner<E>>,
}

impl<E: 'static> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.len())
            .field("depth", &self.depth())
            .field("pending", &self.pending())
            .finish()
    }
}

impl<E: 'static> EventBus<E> {
    /// Create a bus with no subscriptions.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(BusInner::new()),
        }
    }

    fn subscribe(&self, target: Target<E>, once: bool) -> Subscription<E> {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        let slot = Rc::new(Slot {
            id,
            target,
            once,
            spent: Cell::new(false),
            connected: Cell::new(true),
            priority: Cell::new(0),
        });
        self.inner.attach(slot.clone());
        Subscription {
            slot,
            bus: Rc::downgrade(&self.inner),
        }
    }

    /// Subscribe a closure. The bus owns it until it is disconnected.
    pub fn connect<F>(&self, f: F) -> Subscription<E>
    where
        F: Fn(&E) -> Result<()> + 'static,
    {
        self.subscribe(Target::Strong(Rc::new(f)), false)
    }

    /// Subscribe a closure that is removed after its first successful call.
    pub fn connect_once<F>(&self, f: F) -> Subscription<E>
    where
        F: Fn(&E) -> Result<()> + 'static,
    {
        self.subscribe(Target::Strong(Rc::new(f)), true)
    }

    /// Subscribe a shared handler object, keeping it alive while subscribed.
    pub fn connect_shared<H>(&self, handler: Rc<H>) -> Subscription<E>
    where
        H: Handler<E> + 'static,
    {
        let handler: Rc<dyn Handler<E>> = handler;
        self.subscribe(Target::Strong(handler), false)
    }

    /// Subscribe a handler object without keeping it alive.
    ///
    /// When the last `Rc` to the handler is dropped elsewhere, the
    /// subscription is pruned the next time the bus touches it. Dead
    /// subscriptions are never invoked.
    pub fn connect_weak<H>(&self, handler: &Rc<H>) -> Subscription<E>
    where
        H: Handler<E> + 'static,
    {
        let handler: Rc<dyn Handler<E>> = handler.clone();
        self.subscribe(Target::Weak(Rc::downgrade(&handler)), false)
    }

    /// Remove a subscription by handle.
    ///
    /// Returns `false` if the subscription is not (or no longer) connected to
    /// this bus. Disconnecting twice is harmless.
    pub fn disconnect(&self, subscription: &Subscription<E>) -> bool {
        if !std::ptr::eq(subscription.bus.as_ptr(), Rc::as_ptr(&self.inner)) {
            return false;
        }
        self.inner.detach(&subscription.slot)
    }

    /// Remove the first subscription whose handler is `handler`, matched by
    /// identity. Works for both strong and weak subscriptions.
    pub fn disconnect_handler<H>(&self, handler: &Rc<H>) -> bool
    where
        H: Handler<E> + 'static,
    {
        let addr = Rc::as_ptr(handler) as *const ();
        match self.inner.find_target(addr) {
            Some(slot) => self.inner.detach(&slot),
            None => false,
        }
    }

    /// Deliver `event` to every live subscription in order.
    ///
    /// Dead weak subscriptions are pruned instead of invoked. The first
    /// handler error stops the pass and is returned; queued mutations are
    /// still applied before returning.
    pub fn dispatch(&self, event: &E) -> Result<()> {
        self.inner.dispatch(event)
    }

    /// Run `action` against the handler of every live subscription, in
    /// order, without delivering an event. Queued if a dispatch is in
    /// progress.
    pub fn apply_to_all<A>(&self, action: A)
    where
        A: FnMut(&dyn Handler<E>) + 'static,
    {
        if self.inner.blocked() {
            self.inner.defer(Pending::Apply(Box::new(action)));
        } else {
            let mut action = action;
            self.inner.apply_now(&mut action);
        }
    }

    /// Remove every subscription.
    ///
    /// Returns whether anything was removed. Returns `false` when the clear
    /// was queued behind an in-progress dispatch.
    pub fn clear(&self) -> bool {
        if self.inner.blocked() {
            self.inner.clear_later();
            return false;
        }
        self.inner.clear_now()
    }

    /// Reorder subscriptions by priority (see
    /// [`Subscription::set_priority`]), lowest first. The sort is stable, so
    /// equal priorities keep registration order.
    pub fn sort(&self) {
        self.inner
            .reorder(Box::new(|slots| slots.sort_by_key(|s| s.priority.get())));
    }

    /// Reorder subscriptions by a key computed from each handler. Dead weak
    /// subscriptions sort last. Stable.
    pub fn sort_by_key<K, F>(&self, mut key: F)
    where
        K: Ord,
        F: FnMut(&dyn Handler<E>) -> K + 'static,
    {
        self.inner.reorder(Box::new(move |slots| {
            slots.sort_by_cached_key(|s| match s.target.get() {
                Some(handler) => (false, Some(key(&*handler))),
                None => (true, None),
            })
        }));
    }

    /// Number of subscriptions currently in the dispatch sequence.
    pub fn len(&self) -> usize {
        self.inner.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of dispatch passes currently in progress on this bus.
    pub fn depth(&self) -> usize {
        self.inner.depth.get()
    }

    /// Number of structural operations waiting for dispatch to unwind.
    pub fn pending(&self) -> usize {
        self.inner.queued.borrow().len()
    }
}

/// Handle to one registered handler.
///
/// Holding a `Subscription` does not keep the bus alive, and dropping it does
/// not disconnect anything.
pub struct Subscription<E: 'static> {
    slot: Rc<Slot<E>>,
    bus: Weak<BusInner<E>>,
}

impl<E: 'static> Clone for Subscription<E> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            bus: self.bus.clone(),
        }
    }
}

impl<E: 'static> fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.slot.id)
            .field("ownership", &self.ownership())
            .field("once", &self.slot.once)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl<E: 'static> Subscription<E> {
    /// Disconnect from the owning bus. Returns `false` if already
    /// disconnected or if the bus no longer exists.
    pub fn disconnect(&self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.detach(&self.slot),
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.slot.connected.get() && self.bus.strong_count() > 0
    }

    pub fn is_once(&self) -> bool {
        self.slot.once
    }

    pub fn ownership(&self) -> Ownership {
        self.slot.target.ownership()
    }

    /// The handler behind this subscription, or `None` if it was weak and its
    /// owner has dropped it.
    pub fn target(&self) -> Option<Rc<dyn Handler<E>>> {
        self.slot.target.get()
    }

    /// The bus this subscription was made on, if it still exists.
    pub fn bus(&self) -> Option<EventBus<E>> {
        self.bus.upgrade().map(|inner| EventBus { inner })
    }

    pub fn priority(&self) -> i32 {
        self.slot.priority.get()
    }

    /// Set the key used by [`EventBus::sort`]. Takes effect on the next sort.
    pub fn set_priority(&self, priority: i32) {
        self.slot.priority.set(priority);
    }
}
