//! Epoch-based reclamation for the program-swap RCU scheme.
//!
//! This replaces the OS RCU/push-lock shape the original driver used: a
//! single-writer epoch counter plus a per-reader active-pin set guarded by
//! a `spin::Mutex`. Readers (the inspection engine) `pin()` around
//! evaluating one frame against the currently published program; a writer
//! publishing a replacement waits, after the swap, for every pin observed
//! at publish time to have exited before dropping the old value.
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, RwLock};

/// The epoch clock and the set of epochs readers are currently pinned to.
#[derive(Default)]
pub struct Epoch {
    clock: AtomicU64,
    active: Mutex<Vec<u64>>,
}

/// A reader's pin on the current epoch. Evaluating a frame against the
/// program observed at `pin()` time is safe for the lifetime of this guard;
/// the writer guarantees the `Arc` isn't dropped until every such guard
/// alive at publish time has gone away.
pub struct Guard<'e> {
    epoch: &'e Epoch,
    value: u64,
}

impl Epoch {
    pub fn new() -> Self {
        Epoch {
            clock: AtomicU64::new(0),
            active: Mutex::new(Vec::new()),
        }
    }

    pub fn pin(&self) -> Guard<'_> {
        let value = self.clock.load(Ordering::Acquire);
        self.active.lock().push(value);
        Guard { epoch: self, value }
    }

    /// Bump the clock past `publish` and block until every guard pinned at
    /// or before `publish` has exited. Called once, right after a writer
    /// has made a replacement visible to new readers.
    fn wait_past(&self, publish: u64) {
        self.clock.fetch_max(publish + 1, Ordering::AcqRel);
        loop {
            let stuck = self.active.lock().iter().any(|&e| e <= publish);
            if !stuck {
                return;
            }
            core::hint::spin_loop();
        }
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        let mut active = self.epoch.active.lock();
        if let Some(pos) = active.iter().position(|&e| e == self.value) {
            active.swap_remove(pos);
        }
    }
}

/// A published value readers can observe without blocking, and that a
/// writer can replace with a grace period before the old value is dropped.
///
/// Used for the `(ifIndex, hook, queueId) -> CompiledProgram` slot of
/// `program.rs`: `load` is the reader-side fast path (a brief read-lock,
/// no allocation, no syscalls); `replace` is the writer-side slow path.
pub struct Slot<T> {
    epoch: Epoch,
    value: RwLock<Arc<T>>,
}

impl<T> Slot<T> {
    pub fn new(value: T) -> Self {
        Slot {
            epoch: Epoch::new(),
            value: RwLock::new(Arc::new(value)),
        }
    }

    /// Pin the epoch and clone the currently published `Arc`. Hold the
    /// returned guard for as long as the cloned value is in use.
    pub fn load(&self) -> (Arc<T>, Guard<'_>) {
        let guard = self.epoch.pin();
        let value = self.value.read().clone();
        (value, guard)
    }

    /// Publish `new`, then wait out the grace period for the previous
    /// value before returning it to the caller for final disposal.
    pub fn replace(&self, new: T) -> Arc<T> {
        let publish = self.epoch.clock.load(Ordering::Acquire);
        let old = core::mem::replace(&mut *self.value.write(), Arc::new(new));
        self.epoch.wait_past(publish);
        old
    }

    /// [`Self::load`], but pinned through an owned `Arc<Slot<T>>` rather
    /// than a borrow of `self`. Needed by callers (e.g.
    /// [`crate::program::ProgramRegistry::lookup`]) that look the slot up
    /// behind a lock they must release before the pin can outlive it — a
    /// plain `Guard<'_>` borrowing `self` can't escape that lock's scope.
    pub fn load_arc(self_arc: &Arc<Self>) -> (Arc<T>, OwnedGuard<T>) {
        let value = self_arc.epoch.pin_value();
        let program = self_arc.value.read().clone();
        (
            program,
            OwnedGuard {
                slot: self_arc.clone(),
                value,
            },
        )
    }
}

impl Epoch {
    fn pin_value(&self) -> u64 {
        let value = self.clock.load(Ordering::Acquire);
        self.active.lock().push(value);
        value
    }
}

/// Owned counterpart to [`Guard`]: holds its own `Arc<Slot<T>>` instead of
/// borrowing one, so it can be returned from behind a lock the caller no
/// longer holds.
pub struct OwnedGuard<T> {
    slot: Arc<Slot<T>>,
    value: u64,
}

impl<T> Drop for OwnedGuard<T> {
    fn drop(&mut self) {
        let mut active = self.slot.epoch.active.lock();
        if let Some(pos) = active.iter().position(|&e| e == self.value) {
            active.swap_remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A reader's own `Arc` clone from `load()` stays valid after `replace`,
    /// independent of whether its guard has been dropped yet.
    #[test]
    fn reader_value_survives_replace() {
        let slot = Slot::new(1u32);
        let (first, guard) = slot.load();
        drop(guard);
        assert_eq!(*first, 1);

        let old = slot.replace(2);
        assert_eq!(*old, 1);
        assert_eq!(*first, 1);

        let (second, _guard2) = slot.load();
        assert_eq!(*second, 2);
    }

    /// `replace` on one thread blocks until a reader pinned on another
    /// thread drops its guard — the actual RCU-grace property, exercised
    /// across threads since a single thread can never correctly hold a
    /// guard across its own `replace` call (it would wait on itself).
    #[test]
    fn replace_waits_for_outstanding_guard_on_another_thread() {
        use core::sync::atomic::AtomicBool;
        use std::thread;
        use std::time::Duration;

        let slot = Arc::new(Slot::new(1u32));
        let reader_pinned = Arc::new(AtomicBool::new(false));
        let release_reader = Arc::new(AtomicBool::new(false));
        let replaced = Arc::new(AtomicBool::new(false));

        let reader = thread::spawn({
            let slot = slot.clone();
            let reader_pinned = reader_pinned.clone();
            let release_reader = release_reader.clone();
            move || {
                let (_value, _guard) = slot.load();
                reader_pinned.store(true, Ordering::Release);
                while !release_reader.load(Ordering::Acquire) {
                    thread::yield_now();
                }
            }
        });

        while !reader_pinned.load(Ordering::Acquire) {
            thread::yield_now();
        }

        let writer = thread::spawn({
            let slot = slot.clone();
            let replaced = replaced.clone();
            move || {
                slot.replace(2);
                replaced.store(true, Ordering::Release);
            }
        });

        thread::sleep(Duration::from_millis(20));
        assert!(
            !replaced.load(Ordering::Acquire),
            "replace must not return while the reader's guard is still pinned"
        );

        release_reader.store(true, Ordering::Release);
        reader.join().unwrap();
        writer.join().unwrap();
        assert!(replaced.load(Ordering::Acquire));
    }

    #[test]
    fn replace_without_readers_is_immediate() {
        let slot = Slot::new("a");
        let old = slot.replace("b");
        assert_eq!(*old, "a");
        assert_eq!(*slot.load().0, "b");
    }

    #[test]
    fn owned_guard_survives_its_source_arc_going_out_of_scope() {
        let arc = Arc::new(Slot::new(1u32));
        let (value, guard) = {
            let local = arc.clone();
            Slot::load_arc(&local)
            // `local` drops here; the slot itself stays alive via `guard`.
        };
        assert_eq!(*value, 1);
        drop(guard);
    }
}
