//! Bounded lock-free MPMC stack used as the shared task store
//!
//! Both meshing phases share their work through one of these, sized to the
//! worker count; when it is full, workers keep tasks on a private stack
//! instead, which preserves depth-first locality and keeps contention on
//! the shared stack low.
//!
//! The implementation is a Treiber stack over a fixed slot array.  The
//! `head` and `free` lists are packed `(slot index, tag)` words; the tag is
//! bumped on every successful exchange, which rules out the ABA problem
//! without any deferred reclamation (slots live as long as the stack).
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Sets a shared flag when dropped
///
/// Each worker holds one of these over its run loop, so the other
/// workers stop spinning even if it unwinds (an evaluator contract
/// violation aborts the whole operation, not just one thread).
pub(crate) struct DoneGuard<'a>(pub &'a std::sync::atomic::AtomicBool);

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Marker for the end of a slot list
const NIL: u32 = u32::MAX;

fn pack(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

fn unpack(v: u64) -> (u32, u32) {
    (v as u32, (v >> 32) as u32)
}

struct Slot<T> {
    /// Index of the next slot in whichever list this slot is on
    next: AtomicU32,
    /// Task storage; written only by the slot's current owner
    value: UnsafeCell<Option<T>>,
}

/// A bounded lock-free MPMC stack
pub struct TaskStack<T> {
    /// List of slots holding tasks
    head: AtomicU64,
    /// List of unused slots
    free: AtomicU64,
    slots: Box<[Slot<T>]>,
}

// SAFETY: a slot's `value` is only touched by the thread that currently
// owns the slot, i.e. between detaching it from one list and attaching it
// to the other; the list CASes transfer ownership with release/acquire
// ordering.
unsafe impl<T: Send> Send for TaskStack<T> {}
unsafe impl<T: Send> Sync for TaskStack<T> {}

impl<T> TaskStack<T> {
    /// Builds a stack with the given capacity
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        assert!(capacity < NIL as usize);
        let slots: Box<[Slot<T>]> = (0..capacity)
            .map(|i| Slot {
                next: AtomicU32::new(if i + 1 < capacity {
                    i as u32 + 1
                } else {
                    NIL
                }),
                value: UnsafeCell::new(None),
            })
            .collect();
        Self {
            head: AtomicU64::new(pack(NIL, 0)),
            free: AtomicU64::new(pack(0, 0)),
            slots,
        }
    }

    /// Detaches the top slot of the given list, or `None` if it's empty
    fn detach(&self, list: &AtomicU64) -> Option<u32> {
        let mut cur = list.load(Ordering::Acquire);
        loop {
            let (index, tag) = unpack(cur);
            if index == NIL {
                return None;
            }
            // This load may race with another thread that detached the
            // slot and is rewriting `next`; the tag check below rejects
            // the exchange in that case.
            let next = self.slots[index as usize].next.load(Ordering::Relaxed);
            match list.compare_exchange_weak(
                cur,
                pack(next, tag.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Attaches a detached slot to the top of the given list
    fn attach(&self, list: &AtomicU64, index: u32) {
        let mut cur = list.load(Ordering::Relaxed);
        loop {
            let (top, tag) = unpack(cur);
            self.slots[index as usize].next.store(top, Ordering::Relaxed);
            match list.compare_exchange_weak(
                cur,
                pack(index, tag.wrapping_add(1)),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Pushes a task, failing (and returning it) when the stack is full
    pub fn push(&self, t: T) -> Result<(), T> {
        let Some(index) = self.detach(&self.free) else {
            return Err(t);
        };
        // SAFETY: we own `index` until it's attached to `head`
        unsafe {
            *self.slots[index as usize].value.get() = Some(t);
        }
        self.attach(&self.head, index);
        Ok(())
    }

    /// Pops the most recently pushed task, if any
    pub fn pop(&self) -> Option<T> {
        let index = self.detach(&self.head)?;
        // SAFETY: we own `index` until it's attached back to `free`
        let t = unsafe { (*self.slots[index as usize].value.get()).take() };
        debug_assert!(t.is_some());
        self.attach(&self.free, index);
        t
    }
}

////////////////////////////////////////////////////////////////////////////////
