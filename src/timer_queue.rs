//! Timer management over a single timerfd.
//!
//! All pending timers live in one ordered map keyed by `(expiration,
//! sequence)`, so timers with equal expirations fire in creation order. The
//! timerfd is always armed for the earliest pending expiration (or left
//! disarmed when the map is empty). Cancellation is id-based and handles
//! the awkward case of a repeating timer canceling itself from inside its
//! own callback.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::metrics::TIMERS_FIRED;
use crate::sockets;

pub(crate) type TimerCallback = Box<dyn FnMut() + Send>;

/// Process-wide timer sequence numbers. Never reused, so a stale
/// [`TimerId`] can never cancel a different timer.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Opaque handle to a scheduled timer, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct TimerEntry {
    sequence: u64,
    expiration: Instant,
    /// `Some` for repeating timers.
    interval: Option<Duration>,
    callback: TimerCallback,
}

#[derive(Default)]
struct TimerQueueInner {
    timers: BTreeMap<(Instant, u64), TimerEntry>,
    /// sequence -> expiration, for O(1) cancel lookup.
    active: HashMap<u64, Instant>,
    /// Sequences canceled while their callback batch is running; consulted
    /// before re-scheduling repeats.
    canceling: HashSet<u64>,
}

impl TimerQueueInner {
    /// Insert an entry, reporting whether it became the new earliest.
    fn insert(&mut self, entry: TimerEntry) -> bool {
        let key = (entry.expiration, entry.sequence);
        let earliest_changed = match self.timers.keys().next() {
            Some(first) => key < *first,
            None => true,
        };
        self.active.insert(entry.sequence, entry.expiration);
        self.timers.insert(key, entry);
        earliest_changed
    }

    fn next_expiration(&self) -> Option<Instant> {
        self.timers.keys().next().map(|(when, _)| *when)
    }
}

pub(crate) struct TimerQueue {
    timer_fd: RawFd,
    channel: Arc<Channel>,
    inner: Mutex<TimerQueueInner>,
    /// True while the expired-callback batch runs.
    calling_expired: AtomicBool,
}

impl TimerQueue {
    pub(crate) fn new(handle: &LoopHandle) -> io::Result<Arc<TimerQueue>> {
        let timer_fd = create_timerfd()?;
        let queue = Arc::new(TimerQueue {
            timer_fd,
            channel: Channel::new(handle.clone(), timer_fd),
            inner: Mutex::new(TimerQueueInner::default()),
            calling_expired: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&queue);
        queue.channel.set_read_callback(Box::new(move |_| {
            if let Some(queue) = weak.upgrade() {
                queue.handle_read();
            }
        }));
        queue.channel.enable_reading();
        Ok(queue)
    }

    /// Schedule a timer. Callable from any thread; the insertion is
    /// marshaled onto the loop.
    pub(crate) fn add_timer(
        queue: Arc<TimerQueue>,
        handle: &LoopHandle,
        callback: TimerCallback,
        when: Instant,
        interval: Option<Duration>,
    ) -> TimerId {
        let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = TimerEntry {
            sequence,
            expiration: when,
            interval,
            callback,
        };
        handle.run_in_loop(move || queue.add_timer_in_loop(entry));
        TimerId(sequence)
    }

    /// Cancel a timer by id. Callable from any thread.
    pub(crate) fn cancel(queue: Arc<TimerQueue>, handle: &LoopHandle, id: TimerId) {
        handle.run_in_loop(move || queue.cancel_in_loop(id.0));
    }

    fn add_timer_in_loop(&self, entry: TimerEntry) {
        let expiration = entry.expiration;
        let earliest_changed = self.inner.lock().unwrap().insert(entry);
        if earliest_changed {
            reset_timerfd(self.timer_fd, expiration);
        }
    }

    fn cancel_in_loop(&self, sequence: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(expiration) = inner.active.remove(&sequence) {
            inner.timers.remove(&(expiration, sequence));
        } else if self.calling_expired.load(Ordering::Acquire) {
            // Canceled from inside its own callback batch; suppress the
            // re-schedule of a repeat.
            inner.canceling.insert(sequence);
        }
        // Unknown ids fall through: already fired one-shots.
    }

    fn handle_read(&self) {
        read_timerfd(self.timer_fd);
        let now = Instant::now();

        let expired = {
            let mut inner = self.inner.lock().unwrap();
            inner.canceling.clear();
            let expired = extract_expired(&mut inner.timers, now);
            for entry in &expired {
                inner.active.remove(&entry.sequence);
            }
            expired
        };
        trace!("{} timers expired", expired.len());

        // Callbacks run without the lock so they can add or cancel timers.
        self.calling_expired.store(true, Ordering::Release);
        let mut expired = expired;
        for entry in expired.iter_mut() {
            TIMERS_FIRED.increment();
            (entry.callback)();
        }
        self.calling_expired.store(false, Ordering::Release);

        self.reschedule(expired, now);
    }

    /// Re-insert surviving repeats and re-arm the timerfd for the new
    /// earliest expiration.
    fn reschedule(&self, expired: Vec<TimerEntry>, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        for mut entry in expired {
            if let Some(interval) = entry.interval {
                if !inner.canceling.contains(&entry.sequence) {
                    entry.expiration = now + interval;
                    inner.insert(entry);
                }
            }
        }
        inner.canceling.clear();
        let next = inner.next_expiration();
        drop(inner);
        if let Some(when) = next {
            reset_timerfd(self.timer_fd, when);
        }
    }

    /// Unregister the timer channel; called from the loop's teardown.
    pub(crate) fn detach(&self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        sockets::close(self.timer_fd);
    }
}

/// Split off every entry with `expiration <= now`, preserving order.
fn extract_expired(
    timers: &mut BTreeMap<(Instant, u64), TimerEntry>,
    now: Instant,
) -> Vec<TimerEntry> {
    let sentry = (now, u64::MAX);
    let remaining = timers.split_off(&sentry);
    let expired = std::mem::replace(timers, remaining);
    expired.into_values().collect()
}

fn create_timerfd() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn read_timerfd(fd: RawFd) {
    let mut howmany: u64 = 0;
    let n = unsafe { libc::read(fd, &mut howmany as *mut u64 as *mut libc::c_void, 8) };
    if n != 8 {
        // Spurious wakeups leave the counter at zero and read fails with
        // EAGAIN; anything else is worth logging.
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EAGAIN) {
            error!("timerfd read returned {}: {}", n, err);
        }
    } else {
        trace!("timerfd fired {} times", howmany);
    }
}

/// Arm the timerfd for a single shot at `when`. Expirations already in the
/// past are clamped to a small positive delay so the fd still fires.
fn reset_timerfd(fd: RawFd, when: Instant) {
    let delay = when
        .saturating_duration_since(Instant::now())
        .max(Duration::from_micros(100));
    let new_value = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: delay.as_secs() as libc::time_t,
            tv_nsec: delay.subsec_nanos() as libc::c_long,
        },
    };
    let ret = unsafe { libc::timerfd_settime(fd, 0, &new_value, ptr::null_mut()) };
    if ret < 0 {
        error!("timerfd_settime: {}", io::Error::last_os_error());
    }
}
