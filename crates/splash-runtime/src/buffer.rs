//! Buffer objects: graph entities whose payload travels as bytes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use splash_core::{clock, SerializedObject};

use crate::object::GraphObject;

/// Condition shared between a root and its buffer objects, notified when
/// any payload lands.
pub struct UpdateSignal {
    flag: Mutex<bool>,
    condition: Condvar,
    /// Only the first signal of a burst pays for the notification.
    single_waker: Mutex<()>,
}

impl UpdateSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flag: Mutex::new(false),
            condition: Condvar::new(),
            single_waker: Mutex::new(()),
        })
    }

    pub fn signal(&self) {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        if let Ok(_waker) = self.single_waker.try_lock() {
            self.condition.notify_all();
        }
    }

    /// Wait for a signal. A zero timeout waits indefinitely; returns false
    /// only on timeout. Spurious wakeups are not filtered out.
    pub fn wait(&self, timeout_us: u64) -> bool {
        let mut flag = self.flag.lock().unwrap();
        if *flag {
            *flag = false;
            return true;
        }
        if timeout_us == 0 {
            let mut flag = self.condition.wait(flag).unwrap();
            *flag = false;
            true
        } else {
            let (mut flag, timeout) = self
                .condition
                .wait_timeout(flag, Duration::from_micros(timeout_us))
                .unwrap();
            *flag = false;
            !timeout.timed_out()
        }
    }
}

/// Bookkeeping embedded in every buffer object: the payload locks, the
/// update timestamp, and the single-slot inbound deserialization channel.
pub struct BufferCore {
    timestamp: Mutex<i64>,
    updated_buffer: AtomicBool,
    /// Guards the payload: renderers hold it shared, writers exclusive.
    payload_lock: RwLock<()>,
    /// Claimed while one inbound buffer is staged or deserializing.
    deser_claimed: AtomicBool,
    pending: Mutex<Option<SerializedObject>>,
    signal: Mutex<Option<Arc<UpdateSignal>>>,
}

impl BufferCore {
    pub fn new() -> Self {
        Self {
            timestamp: Mutex::new(0),
            updated_buffer: AtomicBool::new(false),
            payload_lock: RwLock::new(()),
            deser_claimed: AtomicBool::new(false),
            pending: Mutex::new(None),
            signal: Mutex::new(None),
        }
    }

    /// Wire the owning root's update condition in; done at registration.
    pub fn attach_signal(&self, signal: Arc<UpdateSignal>) {
        *self.signal.lock().unwrap() = Some(signal);
    }

    pub fn timestamp(&self) -> i64 {
        *self.timestamp.lock().unwrap()
    }

    pub fn set_timestamp(&self, timestamp: i64) {
        *self.timestamp.lock().unwrap() = timestamp;
    }

    /// Bump the timestamp (now if `None`), flag the buffer updated and wake
    /// the owning root.
    pub fn update_timestamp(&self, timestamp: Option<i64>) {
        self.set_timestamp(timestamp.unwrap_or_else(clock::now_us));
        self.updated_buffer.store(true, Ordering::SeqCst);
        if let Some(signal) = self.signal.lock().unwrap().as_ref() {
            signal.signal();
        }
    }

    /// Shared lock held by readers of the payload.
    pub fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.payload_lock.read().unwrap()
    }

    /// Exclusive lock held while mutating the payload.
    pub fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.payload_lock.write().unwrap()
    }

    pub fn was_updated(&self) -> bool {
        self.updated_buffer.load(Ordering::SeqCst)
    }

    pub fn set_not_updated(&self) {
        self.updated_buffer.store(false, Ordering::SeqCst);
    }

    pub fn has_serialized_waiting(&self) -> bool {
        self.deser_claimed.load(Ordering::SeqCst)
    }

    pub(crate) fn try_claim_deserialize(&self) -> bool {
        self.deser_claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn release_deserialize(&self) {
        self.deser_claimed.store(false, Ordering::SeqCst);
    }

    pub(crate) fn store_pending(&self, buffer: SerializedObject) {
        *self.pending.lock().unwrap() = Some(buffer);
    }

    pub(crate) fn take_pending(&self) -> Option<SerializedObject> {
        self.pending.lock().unwrap().take()
    }
}

impl Default for BufferCore {
    fn default() -> Self {
        Self::new()
    }
}

/// A graph object with a byte-serializable payload.
pub trait BufferObject: GraphObject {
    fn buffer_core(&self) -> &BufferCore;

    /// Producer side. The returned frame is self-contained and starts with
    /// the distant name, so the link can route it.
    fn serialize(&self) -> SerializedObject;

    /// Consumer side. Validates the frame and swaps the payload in
    /// atomically; on failure the previous payload stays intact.
    fn deserialize(&self, buffer: &SerializedObject) -> bool;

    /// Name the receiving process knows this object by; differs from the
    /// local name for queue-like forwarders.
    fn distant_name(&self) -> String {
        self.core().name()
    }
}

/// Stage an inbound frame for asynchronous deserialization.
///
/// Returns true if the single slot was claimed; while a previous frame is
/// staged or deserializing, further frames are dropped silently, which is
/// the receiver-side backpressure. The caller is responsible for scheduling
/// the worker that consumes the slot.
pub fn stage_serialized(object: &dyn BufferObject, buffer: SerializedObject) -> bool {
    let core = object.buffer_core();
    if !core.try_claim_deserialize() {
        return false;
    }
    core.store_pending(buffer);
    true
}

/// Worker-side counterpart of [`stage_serialized`]: take the staged frame,
/// deserialize under the exclusive payload lock, release the slot.
pub fn run_deserialize(object: &dyn BufferObject) -> bool {
    let core = object.buffer_core();
    let result = match core.take_pending() {
        Some(buffer) => {
            let _write = core.write_lock();
            object.deserialize(&buffer)
        }
        None => false,
    };
    core.release_deserialize();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_signal_is_consumed_by_wait() {
        let signal = UpdateSignal::new();
        signal.signal();
        assert!(signal.wait(1));
        // Flag consumed: a bounded wait now times out.
        assert!(!signal.wait(1_000));
    }

    #[test]
    fn waiters_are_woken_across_threads() {
        let signal = UpdateSignal::new();
        let waker = signal.clone();
        let waiter = std::thread::spawn(move || signal.wait(2_000_000));
        std::thread::sleep(Duration::from_millis(20));
        waker.signal();
        assert!(waiter.join().unwrap());
    }
}
