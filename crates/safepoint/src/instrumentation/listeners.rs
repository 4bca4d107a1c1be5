//! Listener registration and the per-event slot lists events are fired through.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bitflags::bitflags;
use parking_lot::RwLock;
use tinyvec::TinyVec;

use crate::runtime::{
    methods::Method,
    stack::Frame,
    threads::{ExceptionRef, ManagedThread},
};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InstrumentationEvent: u32 {
        const METHOD_ENTERED = 0x1;
        const METHOD_EXITED = 0x2;
        const METHOD_UNWIND = 0x4;
        const DEX_PC_MOVED = 0x8;
        const FIELD_READ = 0x10;
        const FIELD_WRITTEN = 0x20;
        const EXCEPTION_THROWN = 0x40;
        const BRANCH = 0x80;
        const WATCHED_FRAME_POP = 0x200;
        const EXCEPTION_HANDLED = 0x400;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FieldId(pub u32);

/// A return value or field value handed to listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value {
    Void,
    Primitive(u64),
    Reference(Option<ObjectRef>),
}

/// Receiver of instrumentation events. Every callback defaults to doing
/// nothing so a listener only implements what it registered for.
#[allow(unused_variables)]
pub trait InstrumentationListener: Send + Sync {
    fn method_entered(&self, thread: &ManagedThread, method: &Method) {}

    /// `return_value` may be replaced by the listener.
    fn method_exited(&self, thread: &ManagedThread, method: &Method, return_value: &mut Value) {}

    fn method_unwind(&self, thread: &ManagedThread, method: &Method, dex_pc: u32) {}

    fn dex_pc_moved(
        &self,
        thread: &ManagedThread,
        this_object: Option<ObjectRef>,
        method: &Method,
        dex_pc: u32,
    ) {
    }

    fn field_read(
        &self,
        thread: &ManagedThread,
        this_object: Option<ObjectRef>,
        method: &Method,
        dex_pc: u32,
        field: FieldId,
    ) {
    }

    fn field_written(
        &self,
        thread: &ManagedThread,
        this_object: Option<ObjectRef>,
        method: &Method,
        dex_pc: u32,
        field: FieldId,
        value: Value,
    ) {
    }

    fn exception_thrown(&self, thread: &ManagedThread, exception: ExceptionRef) {}

    fn exception_handled(&self, thread: &ManagedThread, exception: ExceptionRef) {}

    fn branch(&self, thread: &ManagedThread, method: &Method, dex_pc: u32, offset: i32) {}

    fn watched_frame_pop(&self, thread: &ManagedThread, frame: &Frame) {}
}

pub type ListenerRef = Arc<dyn InstrumentationListener>;

fn same_listener(a: &ListenerRef, b: &ListenerRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Listeners of a single event kind.
///
/// Removal only empties a slot and a new listener takes the first empty
/// slot, so a dispatch that snapshotted the list never sees it shift.
pub struct ListenerList {
    slots: RwLock<Vec<Option<ListenerRef>>>,
    has_listeners: AtomicBool,
}

impl ListenerList {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            has_listeners: AtomicBool::new(false),
        }
    }

    pub fn has_listeners(&self) -> bool {
        self.has_listeners.load(Ordering::Acquire)
    }

    fn add(&self, listener: &ListenerRef) {
        let mut slots = self.slots.write();
        match slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => *slot = Some(listener.clone()),
            None => slots.push(Some(listener.clone())),
        }
        self.has_listeners.store(true, Ordering::Release);
    }

    /// Empty every slot holding `listener`, however often it was added.
    fn remove(&self, listener: &ListenerRef) {
        let mut slots = self.slots.write();
        for slot in slots.iter_mut() {
            if slot.as_ref().is_some_and(|l| same_listener(l, listener)) {
                *slot = None;
            }
        }
        let any = slots.iter().any(Option::is_some);
        self.has_listeners.store(any, Ordering::Release);
    }

    /// Number of slots, occupied or not.
    pub fn capacity(&self) -> usize {
        self.slots.read().len()
    }

    /// Call `f` for every registered listener. The list is copied first so
    /// listeners run without the list lock held.
    pub fn for_each(&self, mut f: impl FnMut(&dyn InstrumentationListener)) {
        let snapshot: TinyVec<[Option<ListenerRef>; 4]> = self.slots.read().iter().cloned().collect();
        for listener in snapshot.iter().flatten() {
            f(listener.as_ref());
        }
    }
}

impl Default for ListenerList {
    fn default() -> Self {
        Self::new()
    }
}

/// One [`ListenerList`] per event kind.
#[derive(Default)]
pub struct Listeners {
    pub method_entry: ListenerList,
    pub method_exit: ListenerList,
    pub method_unwind: ListenerList,
    pub dex_pc: ListenerList,
    pub field_read: ListenerList,
    pub field_write: ListenerList,
    pub exception_thrown: ListenerList,
    pub branch: ListenerList,
    pub watched_frame_pop: ListenerList,
    pub exception_handled: ListenerList,
}

impl Listeners {
    fn lists(&self) -> [(InstrumentationEvent, &ListenerList); 10] {
        [
            (InstrumentationEvent::METHOD_ENTERED, &self.method_entry),
            (InstrumentationEvent::METHOD_EXITED, &self.method_exit),
            (InstrumentationEvent::METHOD_UNWIND, &self.method_unwind),
            (InstrumentationEvent::DEX_PC_MOVED, &self.dex_pc),
            (InstrumentationEvent::FIELD_READ, &self.field_read),
            (InstrumentationEvent::FIELD_WRITTEN, &self.field_write),
            (InstrumentationEvent::EXCEPTION_THROWN, &self.exception_thrown),
            (InstrumentationEvent::BRANCH, &self.branch),
            (InstrumentationEvent::WATCHED_FRAME_POP, &self.watched_frame_pop),
            (InstrumentationEvent::EXCEPTION_HANDLED, &self.exception_handled),
        ]
    }

    pub fn add(&self, listener: &ListenerRef, events: InstrumentationEvent) {
        for (event, list) in self.lists() {
            if events.contains(event) {
                list.add(listener);
            }
        }
    }

    pub fn remove(&self, listener: &ListenerRef, events: InstrumentationEvent) {
        for (event, list) in self.lists() {
            if events.contains(event) {
                list.remove(listener);
            }
        }
    }

    /// Events that currently have at least one listener.
    pub fn active(&self) -> InstrumentationEvent {
        self.lists()
            .into_iter()
            .filter(|(_, list)| list.has_listeners())
            .fold(InstrumentationEvent::empty(), |acc, (event, _)| acc | event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl InstrumentationListener for Nop {}

    #[test]
    fn slots_are_reused_not_shifted() {
        let listeners = Listeners::default();
        let a: ListenerRef = Arc::new(Nop);
        let b: ListenerRef = Arc::new(Nop);
        let c: ListenerRef = Arc::new(Nop);

        listeners.add(&a, InstrumentationEvent::METHOD_ENTERED);
        listeners.add(&b, InstrumentationEvent::METHOD_ENTERED | InstrumentationEvent::BRANCH);
        assert_eq!(listeners.method_entry.capacity(), 2);

        listeners.remove(&a, InstrumentationEvent::METHOD_ENTERED);
        assert!(listeners.method_entry.has_listeners());
        assert_eq!(listeners.method_entry.capacity(), 2);

        listeners.add(&c, InstrumentationEvent::METHOD_ENTERED);
        assert_eq!(listeners.method_entry.capacity(), 2);

        let mut seen = 0;
        listeners.method_entry.for_each(|_| seen += 1);
        assert_eq!(seen, 2);
        assert_eq!(
            listeners.active(),
            InstrumentationEvent::METHOD_ENTERED | InstrumentationEvent::BRANCH
        );
    }

    #[test]
    fn has_flag_follows_membership() {
        let listeners = Listeners::default();
        let a: ListenerRef = Arc::new(Nop);
        assert!(!listeners.dex_pc.has_listeners());
        listeners.add(&a, InstrumentationEvent::DEX_PC_MOVED);
        assert!(listeners.dex_pc.has_listeners());
        // Removing for an event it never registered for leaves it alone.
        listeners.remove(&a, InstrumentationEvent::FIELD_READ);
        assert!(listeners.dex_pc.has_listeners());
        listeners.remove(&a, InstrumentationEvent::DEX_PC_MOVED);
        assert!(!listeners.dex_pc.has_listeners());
        assert!(listeners.active().is_empty());
    }

    #[test]
    fn removal_clears_every_registration() {
        let listeners = Listeners::default();
        let a: ListenerRef = Arc::new(Nop);
        let b: ListenerRef = Arc::new(Nop);
        listeners.add(&a, InstrumentationEvent::METHOD_EXITED);
        listeners.add(&a, InstrumentationEvent::METHOD_EXITED);
        listeners.add(&b, InstrumentationEvent::METHOD_EXITED);
        assert_eq!(listeners.method_exit.capacity(), 3);

        listeners.remove(&a, InstrumentationEvent::METHOD_EXITED);
        let mut seen = 0;
        listeners.method_exit.for_each(|_| seen += 1);
        assert_eq!(seen, 1);

        listeners.remove(&b, InstrumentationEvent::METHOD_EXITED);
        assert!(!listeners.method_exit.has_listeners());
    }
}
