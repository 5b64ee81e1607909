/*! Single-threaded cooperative event loop.

The loop multiplexes three event sources and dispatches them from one
thread:

 - [Timer]: one-shot timers ordered by deadline, FIFO on ties.
 - [FdWatcher]: file-descriptor readiness (epoll).
 - [AsyncSignal]: cooperative wakeups from other threads.

Within one dispatch cycle, descriptor callbacks run before timer
callbacks, and timer callbacks run before async-signal callbacks. A timer
(re)armed from inside any callback never fires in the same cycle, even if
its deadline has already passed.

Dropping a [Timer], [FdWatcher], [AsyncSignal] or [SignalWatcher] before
its callback has run guarantees the callback will not run afterwards.

[Timer]: struct.Timer.html
[FdWatcher]: struct.FdWatcher.html
[AsyncSignal]: struct.AsyncSignal.html
[SignalWatcher]: struct.SignalWatcher.html
*/

mod observer;
pub(crate) mod sys;

pub use self::observer::{Keep, Observable};

use core::cmp::Reverse;
use core::ops;
use std::cell::RefCell;
use std::collections::BinaryHeap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};

use self::sys::{Poller, WakeHandle};
use crate::time::{Duration, Instant};

pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

/// Readiness events on a watched file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FdEvents(u8);

impl FdEvents {
    pub const READ: FdEvents = FdEvents(0b0001);
    pub const WRITE: FdEvents = FdEvents(0b0010);
    pub const ERR: FdEvents = FdEvents(0b0100);
    pub const HUP: FdEvents = FdEvents(0b1000);

    pub const fn empty() -> FdEvents {
        FdEvents(0)
    }

    pub const fn contains(self, other: FdEvents) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: FdEvents) -> bool {
        self.0 & other.0 != 0
    }
}

impl ops::BitOr for FdEvents {
    type Output = FdEvents;

    fn bitor(self, rhs: FdEvents) -> FdEvents {
        FdEvents(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for FdEvents {
    fn bitor_assign(&mut self, rhs: FdEvents) {
        self.0 |= rhs.0;
    }
}

/// Slot identifier with a generation guard against reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    index: u32,
    gen: u32,
}

impl Key {
    fn to_token(self) -> u64 {
        ((self.index as u64) << 32) | self.gen as u64
    }

    fn from_token(token: u64) -> Key {
        Key {
            index: (token >> 32) as u32,
            gen: token as u32,
        }
    }
}

struct Slab<T> {
    slots: Vec<(u32, Option<T>)>,
    free: Vec<u32>,
}

impl<T> Slab<T> {
    fn new() -> Slab<T> {
        Slab {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, value: T) -> Key {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.1.is_none());
                slot.1 = Some(value);
                Key {
                    index,
                    gen: slot.0,
                }
            }
            None => {
                self.slots.push((0, Some(value)));
                Key {
                    index: (self.slots.len() - 1) as u32,
                    gen: 0,
                }
            }
        }
    }

    fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        match self.slots.get_mut(key.index as usize) {
            Some((gen, value)) if *gen == key.gen => value.as_mut(),
            _ => None,
        }
    }

    fn get(&self, key: Key) -> Option<&T> {
        match self.slots.get(key.index as usize) {
            Some((gen, value)) if *gen == key.gen => value.as_ref(),
            _ => None,
        }
    }

    fn remove(&mut self, key: Key) -> Option<T> {
        match self.slots.get_mut(key.index as usize) {
            Some((gen, value)) if *gen == key.gen && value.is_some() => {
                *gen = gen.wrapping_add(1);
                self.free.push(key.index);
                value.take()
            }
            _ => None,
        }
    }
}

/// Timer lifecycle. The low two bits encode the heap-residency class so
/// membership tests compile to a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum TimerState {
    /// Not armed, not in the heap.
    Idle = 0,
    /// Deadline reached, callback scheduled for the current cycle.
    Dispatch = 1,
    /// Unset while its callback runs; heap fix-up deferred.
    TempUnset = 2,
    /// Re-armed while its callback runs; heap fix-up deferred.
    TempSet = 2 | (1 << 2),
    /// Armed, waiting for its deadline.
    Pending = 3,
}

const TIMER_STATE_ORDER_MASK: u8 = 0b11;

impl TimerState {
    fn in_heap(self) -> bool {
        self as u8 & TIMER_STATE_ORDER_MASK != 0
    }
}

struct TimerSlot {
    state: TimerState,
    time: Instant,
    /// Incremented on every `set_at`; stale heap entries are recognized by
    /// a mismatch.
    arm: u64,
    cb: Option<Box<dyn FnMut()>>,
}

struct FdSlot {
    fd: RawFd,
    events: FdEvents,
    cb: Option<Box<dyn FnMut(FdEvents)>>,
}

struct AsigSlot {
    cb: Option<Box<dyn FnMut()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    time: Instant,
    seq: u64,
    key: Key,
    arm: u64,
}

struct Inner {
    poller: Poller,
    timers: Slab<TimerSlot>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    heap_seq: u64,
    fds: Slab<FdSlot>,
    asigs: Slab<AsigSlot>,
    stop: bool,
    event_time: Instant,
    ready: Vec<(u64, FdEvents)>,
}

impl Inner {
    fn heap_entry_armed(&self, entry: &HeapEntry) -> bool {
        match self.timers.get(entry.key) {
            Some(slot) => {
                slot.arm == entry.arm
                    && slot.state.in_heap()
                    && slot.state != TimerState::TempUnset
            }
            None => false,
        }
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.heap_entry_armed(entry) {
                return Some(entry.time);
            }
            self.heap.pop();
        }
        None
    }

    fn push_heap(&mut self, key: Key, time: Instant, arm: u64) {
        let seq = self.heap_seq;
        self.heap_seq += 1;
        self.heap.push(Reverse(HeapEntry {
            time,
            seq,
            key,
            arm,
        }));
    }

    /// Transition every timer whose deadline has been reached from
    /// `Pending` to `Dispatch`, collecting them in deadline order with
    /// FIFO tie-break.
    fn collect_due(&mut self, cycle: &mut Vec<(Key, u64)>) {
        loop {
            let entry = match self.heap.peek() {
                Some(&Reverse(entry)) => entry,
                None => break,
            };
            if !self.heap_entry_armed(&entry) {
                self.heap.pop();
                continue;
            }
            if entry.time > self.event_time {
                break;
            }
            self.heap.pop();
            let slot = self.timers.get_mut(entry.key).unwrap();
            debug_assert_eq!(slot.state, TimerState::Pending);
            slot.state = TimerState::Dispatch;
            cycle.push((entry.key, entry.arm));
        }
    }
}

struct AsyncShared {
    pending: Mutex<Vec<Key>>,
    wake: WakeHandle,
}

/// Handle to a single-threaded event loop.
///
/// The handle is cheaply cloneable; clones refer to the same loop. All
/// methods must be called from the loop's thread; the only cross-thread
/// door is [`AsyncTrigger::signal`].
///
/// [`AsyncTrigger::signal`]: struct.AsyncTrigger.html#method.signal
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<RefCell<Inner>>,
    shared: Arc<AsyncShared>,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        let poller = Poller::new()?;
        let wake = poller.wake_handle();
        Ok(EventLoop {
            inner: Rc::new(RefCell::new(Inner {
                poller,
                timers: Slab::new(),
                heap: BinaryHeap::new(),
                heap_seq: 0,
                fds: Slab::new(),
                asigs: Slab::new(),
                stop: false,
                event_time: Instant::now(),
                ready: Vec::new(),
            })),
            shared: Arc::new(AsyncShared {
                pending: Mutex::new(Vec::new()),
                wake,
            }),
        })
    }

    /// The loop's notion of "now": the monotonic clock captured at the
    /// start of the current dispatch cycle. Non-decreasing across cycles.
    pub fn event_time(&self) -> Instant {
        self.inner.borrow().event_time
    }

    /// Make [`run`] return after the current dispatch cycle.
    ///
    /// [`run`]: #method.run
    pub fn stop(&self) {
        self.inner.borrow_mut().stop = true;
    }

    /// Run dispatch cycles until [`stop`] is called.
    ///
    /// [`stop`]: #method.stop
    pub fn run(&self) -> io::Result<()> {
        let mut cycle: Vec<(Key, u64)> = Vec::new();
        loop {
            // (1) earliest pending deadline, (2) wait for readiness or wakeup
            let timeout = {
                let mut inner = self.inner.borrow_mut();
                if inner.stop {
                    return Ok(());
                }
                inner.next_deadline().map(|deadline| {
                    let now = Instant::now();
                    if deadline <= now {
                        Duration::ZERO
                    } else {
                        deadline - now
                    }
                })
            };
            {
                let mut inner = self.inner.borrow_mut();
                let inner = &mut *inner;
                inner.ready.clear();
                inner.poller.wait(timeout, &mut inner.ready)?;
                // (3) capture the cycle's time, (4) mark due timers
                inner.event_time = Instant::now();
                cycle.clear();
                inner.collect_due(&mut cycle);
            }

            // (5) descriptor events
            let ready = core::mem::take(&mut self.inner.borrow_mut().ready);
            for &(token, events) in &ready {
                let key = Key::from_token(token);
                let cb = match self.inner.borrow_mut().fds.get_mut(key) {
                    Some(slot) => slot.cb.take(),
                    None => continue,
                };
                let mut cb = match cb {
                    Some(cb) => cb,
                    None => continue,
                };
                cb(events);
                if let Some(slot) = self.inner.borrow_mut().fds.get_mut(key) {
                    if slot.cb.is_none() {
                        slot.cb = Some(cb);
                    }
                }
            }
            {
                let mut inner = self.inner.borrow_mut();
                if inner.ready.is_empty() {
                    inner.ready = ready;
                }
            }

            // (6) timers, one at a time, in deadline order
            for &(key, arm) in &cycle {
                let cb = {
                    let mut inner = self.inner.borrow_mut();
                    match inner.timers.get_mut(key) {
                        Some(slot) if slot.state == TimerState::Dispatch && slot.arm == arm => {
                            slot.state = TimerState::TempUnset;
                            slot.cb.take()
                        }
                        _ => continue,
                    }
                };
                let mut cb = match cb {
                    Some(cb) => cb,
                    None => continue,
                };
                cb();
                let mut inner = self.inner.borrow_mut();
                if let Some(slot) = inner.timers.get_mut(key) {
                    if slot.cb.is_none() {
                        slot.cb = Some(cb);
                    }
                    match slot.state {
                        TimerState::TempSet => slot.state = TimerState::Pending,
                        TimerState::TempUnset => slot.state = TimerState::Idle,
                        _ => (),
                    }
                }
            }

            // (7) cross-thread async signals
            let pending: Vec<Key> = {
                let mut pending = self.shared.pending.lock().unwrap();
                core::mem::take(&mut *pending)
            };
            for key in pending {
                let cb = match self.inner.borrow_mut().asigs.get_mut(key) {
                    Some(slot) => slot.cb.take(),
                    None => continue,
                };
                let mut cb = match cb {
                    Some(cb) => cb,
                    None => continue,
                };
                cb();
                if let Some(slot) = self.inner.borrow_mut().asigs.get_mut(key) {
                    if slot.cb.is_none() {
                        slot.cb = Some(cb);
                    }
                }
            }

            // (8) stop is re-checked at the top of the loop
        }
    }
}

/// A one-shot timer bound to an [EventLoop].
///
/// At most one expiration is pending at any moment: `set_at` reschedules,
/// `unset` is idempotent. The callback runs in the loop thread when loop
/// time first reaches the deadline. Dropping the timer cancels any pending
/// fire.
///
/// [EventLoop]: struct.EventLoop.html
pub struct Timer {
    inner: Weak<RefCell<Inner>>,
    key: Key,
}

impl Timer {
    pub fn new<F>(event_loop: &EventLoop, callback: F) -> Timer
    where
        F: FnMut() + 'static,
    {
        let key = event_loop.inner.borrow_mut().timers.insert(TimerSlot {
            state: TimerState::Idle,
            time: Instant::ZERO,
            arm: 0,
            cb: Some(Box::new(callback)),
        });
        Timer {
            inner: Rc::downgrade(&event_loop.inner),
            key,
        }
    }

    /// Arm the timer for the absolute time `time`, replacing any earlier
    /// deadline.
    pub fn set_at(&self, time: Instant) {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let mut inner = inner.borrow_mut();
        let key = self.key;
        let slot = match inner.timers.get_mut(key) {
            Some(slot) => slot,
            None => return,
        };
        slot.time = time;
        slot.arm += 1;
        slot.state = match slot.state {
            // inside this timer's own callback: defer heap fix-up
            TimerState::TempUnset | TimerState::TempSet => TimerState::TempSet,
            _ => TimerState::Pending,
        };
        let arm = slot.arm;
        inner.push_heap(key, time, arm);
    }

    /// Arm the timer `duration` from now.
    pub fn set_after(&self, duration: Duration) {
        self.set_at(Instant::now() + duration);
    }

    /// Disarm the timer. Idempotent; a fire already scheduled for the
    /// current cycle is cancelled as well.
    pub fn unset(&self) {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let mut inner = inner.borrow_mut();
        if let Some(slot) = inner.timers.get_mut(self.key) {
            slot.state = match slot.state {
                TimerState::TempUnset | TimerState::TempSet => TimerState::TempUnset,
                _ => TimerState::Idle,
            };
        }
    }

    pub fn is_set(&self) -> bool {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return false,
        };
        let inner = inner.borrow();
        match inner.timers.get(self.key) {
            Some(slot) => !matches!(slot.state, TimerState::Idle | TimerState::TempUnset),
            None => false,
        }
    }

    /// The deadline of the pending expiration, if armed.
    pub fn set_time(&self) -> Option<Instant> {
        let inner = self.inner.upgrade()?;
        let inner = inner.borrow();
        let slot = inner.timers.get(self.key)?;
        match slot.state {
            TimerState::Idle | TimerState::TempUnset => None,
            _ => Some(slot.time),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.borrow_mut().timers.remove(self.key);
        }
    }
}

/// Watches a file descriptor for readiness through the loop's poller.
///
/// The watcher is created without a descriptor; [`init_fd`] attaches one.
/// Dropping the watcher deregisters the descriptor and guarantees the
/// callback will not run afterwards. The descriptor itself is owned by the
/// caller.
///
/// [`init_fd`]: #method.init_fd
pub struct FdWatcher {
    inner: Weak<RefCell<Inner>>,
    key: Key,
}

impl FdWatcher {
    pub fn new<F>(event_loop: &EventLoop, callback: F) -> FdWatcher
    where
        F: FnMut(FdEvents) + 'static,
    {
        let key = event_loop.inner.borrow_mut().fds.insert(FdSlot {
            fd: -1,
            events: FdEvents::empty(),
            cb: Some(Box::new(callback)),
        });
        FdWatcher {
            inner: Rc::downgrade(&event_loop.inner),
            key,
        }
    }

    pub fn has_fd(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                let inner = inner.borrow();
                matches!(inner.fds.get(self.key), Some(slot) if slot.fd >= 0)
            }
            None => false,
        }
    }

    /// The readiness events currently watched for.
    pub fn events(&self) -> FdEvents {
        match self.inner.upgrade() {
            Some(inner) => {
                let inner = inner.borrow();
                inner
                    .fds
                    .get(self.key)
                    .map(|slot| slot.events)
                    .unwrap_or_default()
            }
            None => FdEvents::empty(),
        }
    }

    /// Start watching `fd` for `events`.
    ///
    /// # Panics
    /// Panics if a descriptor is already attached.
    pub fn init_fd(&self, fd: RawFd, events: FdEvents) -> io::Result<()> {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return Ok(()),
        };
        let mut inner = inner.borrow_mut();
        let inner = &mut *inner;
        let slot = match inner.fds.get_mut(self.key) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        assert!(slot.fd < 0, "FdWatcher already has a file descriptor");
        inner.poller.add(fd, self.key.to_token(), events)?;
        slot.fd = fd;
        slot.events = events;
        Ok(())
    }

    /// Change the watched readiness events.
    pub fn update_events(&self, events: FdEvents) -> io::Result<()> {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return Ok(()),
        };
        let mut inner = inner.borrow_mut();
        let inner = &mut *inner;
        let slot = match inner.fds.get_mut(self.key) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        debug_assert!(slot.fd >= 0);
        inner.poller.modify(slot.fd, self.key.to_token(), events)?;
        slot.events = events;
        Ok(())
    }

    /// Stop watching the descriptor, keeping the watcher reusable.
    pub fn reset(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.borrow_mut();
            let inner = &mut *inner;
            if let Some(slot) = inner.fds.get_mut(self.key) {
                if slot.fd >= 0 {
                    let _ = inner.poller.del(slot.fd);
                    slot.fd = -1;
                    slot.events = FdEvents::empty();
                }
            }
        }
    }
}

impl Drop for FdWatcher {
    fn drop(&mut self) {
        self.reset();
        if let Some(inner) = self.inner.upgrade() {
            inner.borrow_mut().fds.remove(self.key);
        }
    }
}

/// Cross-thread send half of an [AsyncSignal].
///
/// [AsyncSignal]: struct.AsyncSignal.html
#[derive(Clone)]
pub struct AsyncTrigger {
    shared: Arc<AsyncShared>,
    key: Key,
}

impl AsyncTrigger {
    /// Request a callback in the loop thread. Signals collapse: multiple
    /// calls before the dispatch produce one callback.
    pub fn signal(&self) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            if !pending.contains(&self.key) {
                pending.push(self.key);
            }
        }
        self.shared.wake.wake();
    }
}

/// A cooperative wakeup channel into the loop.
///
/// The callback runs in the loop thread at the end of a dispatch cycle.
/// [`trigger`] yields a `Send + Sync` handle for other threads.
///
/// [`trigger`]: #method.trigger
pub struct AsyncSignal {
    inner: Weak<RefCell<Inner>>,
    shared: Arc<AsyncShared>,
    key: Key,
}

impl AsyncSignal {
    pub fn new<F>(event_loop: &EventLoop, callback: F) -> AsyncSignal
    where
        F: FnMut() + 'static,
    {
        let key = event_loop.inner.borrow_mut().asigs.insert(AsigSlot {
            cb: Some(Box::new(callback)),
        });
        AsyncSignal {
            inner: Rc::downgrade(&event_loop.inner),
            shared: event_loop.shared.clone(),
            key,
        }
    }

    pub fn trigger(&self) -> AsyncTrigger {
        AsyncTrigger {
            shared: self.shared.clone(),
            key: self.key,
        }
    }

    /// Request a callback from the loop thread itself.
    pub fn signal(&self) {
        self.trigger().signal();
    }
}

impl Drop for AsyncSignal {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.borrow_mut().asigs.remove(self.key);
        }
        let mut pending = self.shared.pending.lock().unwrap();
        pending.retain(|k| *k != self.key);
    }
}

/// Delivers POSIX signals into the loop thread through a signalfd.
///
/// The watched signals are blocked for the calling thread on construction
/// and the previous mask is restored on drop.
pub struct SignalWatcher {
    watcher: FdWatcher,
    old_mask: libc::sigset_t,
}

impl SignalWatcher {
    pub fn new<F>(event_loop: &EventLoop, signals: &[libc::c_int], mut callback: F) -> io::Result<SignalWatcher>
    where
        F: FnMut(libc::c_int) + 'static,
    {
        let mut set: libc::sigset_t = unsafe { core::mem::zeroed() };
        let mut old_mask: libc::sigset_t = unsafe { core::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut set);
            for &signo in signals {
                libc::sigaddset(&mut set, signo);
            }
            if libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old_mask) != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let fd = unsafe { libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
        if fd == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &old_mask, core::ptr::null_mut()) };
            return Err(err);
        }
        let sigfd = sys::FdWrapper::new(fd);

        let watcher = FdWatcher::new(event_loop, move |_events| loop {
            let mut info: libc::signalfd_siginfo = unsafe { core::mem::zeroed() };
            let n = unsafe {
                libc::read(
                    sigfd.fd(),
                    &mut info as *mut libc::signalfd_siginfo as *mut libc::c_void,
                    core::mem::size_of::<libc::signalfd_siginfo>(),
                )
            };
            if n != core::mem::size_of::<libc::signalfd_siginfo>() as isize {
                break;
            }
            callback(info.ssi_signo as libc::c_int);
        });
        watcher.init_fd(fd, FdEvents::READ)?;

        Ok(SignalWatcher { watcher, old_mask })
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.watcher.reset();
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.old_mask, core::ptr::null_mut());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn stop_after(event_loop: &EventLoop, duration: Duration) -> Timer {
        let handle = event_loop.clone();
        let timer = Timer::new(event_loop, move || handle.stop());
        timer.set_after(duration);
        timer
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(RefCell::new(Vec::new()));

        let base = Instant::now() + Duration::from_millis(5);
        let timers: Vec<Timer> = [(3u8, 2u64), (1, 0), (2, 1)]
            .iter()
            .map(|&(id, offset_ms)| {
                let fired = fired.clone();
                let timer = Timer::new(&event_loop, move || fired.borrow_mut().push(id));
                timer.set_at(base + Duration::from_millis(offset_ms));
                timer
            })
            .collect();

        let _stop = stop_after(&event_loop, Duration::from_millis(50));
        event_loop.run().unwrap();
        assert_eq!(*fired.borrow(), [1, 2, 3]);
        drop(timers);
    }

    #[test]
    fn test_timer_set_reschedules() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(RefCell::new(0u32));

        let timer = Timer::new(&event_loop, {
            let fired = fired.clone();
            move || *fired.borrow_mut() += 1
        });
        timer.set_after(Duration::from_millis(100));
        assert!(timer.is_set());
        timer.set_after(Duration::from_millis(1));

        let _stop = stop_after(&event_loop, Duration::from_millis(30));
        event_loop.run().unwrap();
        assert_eq!(*fired.borrow(), 1);
        assert!(!timer.is_set());
    }

    #[test]
    fn test_timer_unset_cancels() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(RefCell::new(0u32));

        let timer = Timer::new(&event_loop, {
            let fired = fired.clone();
            move || *fired.borrow_mut() += 1
        });
        timer.set_after(Duration::from_millis(1));
        timer.unset();
        assert!(!timer.is_set());
        timer.unset();

        let _stop = stop_after(&event_loop, Duration::from_millis(20));
        event_loop.run().unwrap();
        assert_eq!(*fired.borrow(), 0);
    }

    #[test]
    fn test_timer_drop_cancels() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(RefCell::new(0u32));

        let timer = Timer::new(&event_loop, {
            let fired = fired.clone();
            move || *fired.borrow_mut() += 1
        });
        timer.set_after(Duration::from_millis(1));
        drop(timer);

        let _stop = stop_after(&event_loop, Duration::from_millis(20));
        event_loop.run().unwrap();
        assert_eq!(*fired.borrow(), 0);
    }

    #[test]
    fn test_timer_rearm_from_callback() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(RefCell::new(0u32));

        let timer: Rc<RefCell<Option<Timer>>> = Rc::new(RefCell::new(None));
        let t = Timer::new(&event_loop, {
            let fired = fired.clone();
            let timer = timer.clone();
            let handle = event_loop.clone();
            move || {
                *fired.borrow_mut() += 1;
                if *fired.borrow() < 3 {
                    // re-arm to an already-passed deadline; must fire on a
                    // later cycle, not this one
                    timer.borrow().as_ref().unwrap().set_at(handle.event_time());
                } else {
                    handle.stop();
                }
            }
        });
        t.set_after(Duration::from_millis(1));
        *timer.borrow_mut() = Some(t);

        event_loop.run().unwrap();
        assert_eq!(*fired.borrow(), 3);
    }

    #[test]
    fn test_event_time_non_decreasing() {
        let event_loop = EventLoop::new().unwrap();
        let times = Rc::new(RefCell::new(Vec::new()));

        let timer: Rc<RefCell<Option<Timer>>> = Rc::new(RefCell::new(None));
        let t = Timer::new(&event_loop, {
            let times = times.clone();
            let timer = timer.clone();
            let handle = event_loop.clone();
            move || {
                times.borrow_mut().push(handle.event_time());
                if times.borrow().len() < 4 {
                    timer
                        .borrow()
                        .as_ref()
                        .unwrap()
                        .set_after(Duration::from_millis(1));
                } else {
                    handle.stop();
                }
            }
        });
        t.set_after(Duration::from_millis(1));
        *timer.borrow_mut() = Some(t);

        event_loop.run().unwrap();
        let times = times.borrow();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_async_signal_from_other_thread() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(RefCell::new(0u32));

        let asig = AsyncSignal::new(&event_loop, {
            let fired = fired.clone();
            let handle = event_loop.clone();
            move || {
                *fired.borrow_mut() += 1;
                handle.stop();
            }
        });
        let trigger = asig.trigger();
        let thread = std::thread::spawn(move || {
            trigger.signal();
            trigger.signal();
        });

        let _stop = stop_after(&event_loop, Duration::from_millis(500));
        event_loop.run().unwrap();
        thread.join().unwrap();
        // signals collapse
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn test_fd_watcher_readiness() {
        let event_loop = EventLoop::new().unwrap();
        let got = Rc::new(RefCell::new(Vec::new()));

        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        let watcher = FdWatcher::new(&event_loop, {
            let got = got.clone();
            let handle = event_loop.clone();
            move |events| {
                let mut byte = 0u8;
                unsafe { libc::read(rd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
                got.borrow_mut().push((byte, events));
                handle.stop();
            }
        });
        watcher.init_fd(rd, FdEvents::READ).unwrap();

        let byte = 0x5au8;
        unsafe { libc::write(wr, &byte as *const u8 as *const libc::c_void, 1) };

        let _stop = stop_after(&event_loop, Duration::from_millis(500));
        event_loop.run().unwrap();

        let got = got.borrow();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, 0x5a);
        assert!(got[0].1.contains(FdEvents::READ));

        drop(watcher);
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_signal_watcher_restores_mask() {
        let event_loop = EventLoop::new().unwrap();
        let watcher = SignalWatcher::new(&event_loop, &[libc::SIGUSR2], |_| {}).unwrap();

        let mut current: libc::sigset_t = unsafe { core::mem::zeroed() };
        unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, core::ptr::null(), &mut current);
            assert_eq!(libc::sigismember(&current, libc::SIGUSR2), 1);
        }
        drop(watcher);
        unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, core::ptr::null(), &mut current);
            assert_eq!(libc::sigismember(&current, libc::SIGUSR2), 0);
        }
    }
}
