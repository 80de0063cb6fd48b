//! Per-descriptor event registration and dispatch.
//!
//! A [`Channel`] binds one fd to a set of interest flags and four callback
//! slots (readable, writable, closed, error). It never owns the fd; the
//! object that created it (connection, acceptor, connector, timer queue,
//! wakeup source) does. A channel belongs to exactly one loop and all
//! interest mutation happens on that loop's thread.

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::{trace, warn};

use crate::event_loop::LoopHandle;

/// Callback invoked on read readiness, with the poll-return timestamp.
pub(crate) type ReadCallback = Box<dyn FnMut(Instant) + Send>;
/// Callback invoked on write/close/error events.
pub(crate) type EventCallback = Box<dyn FnMut() + Send>;

pub(crate) const EVENT_NONE: u32 = 0;
pub(crate) const EVENT_READ: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const EVENT_WRITE: u32 = libc::EPOLLOUT as u32;

/// Demultiplexer bookkeeping states, see `Poller`.
pub(crate) const STATE_NEW: i32 = -1;
pub(crate) const STATE_ADDED: i32 = 1;
pub(crate) const STATE_DETACHED: i32 = 2;

#[derive(Default)]
struct Callbacks {
    read: Option<ReadCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// One fd's registration with its owning event loop.
pub(crate) struct Channel {
    self_weak: Weak<Channel>,
    handle: LoopHandle,
    fd: RawFd,
    /// Interest flags (EVENT_READ | EVENT_WRITE).
    events: AtomicU32,
    /// Readiness reported by the most recent poll.
    revents: AtomicU32,
    /// Poller bookkeeping state (STATE_NEW / STATE_ADDED / STATE_DETACHED).
    index: AtomicI32,
    event_handling: AtomicBool,
    added_to_loop: AtomicBool,
    /// Weak back-reference to the logical owner; consulted before dispatch
    /// so a dead owner turns the activation into a no-op instead of a
    /// use-after-free.
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    callbacks: Mutex<Callbacks>,
}

impl Channel {
    pub(crate) fn new(handle: LoopHandle, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|weak| Channel {
            self_weak: weak.clone(),
            handle,
            fd,
            events: AtomicU32::new(EVENT_NONE),
            revents: AtomicU32::new(EVENT_NONE),
            index: AtomicI32::new(STATE_NEW),
            event_handling: AtomicBool::new(false),
            added_to_loop: AtomicBool::new(false),
            tie: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn events(&self) -> u32 {
        self.events.load(Ordering::Acquire)
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Release);
    }

    pub(crate) fn index(&self) -> i32 {
        self.index.load(Ordering::Acquire)
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.index.store(index, Ordering::Release);
    }

    pub(crate) fn is_none_event(&self) -> bool {
        self.events() == EVENT_NONE
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.events() & EVENT_READ != 0
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.events() & EVENT_WRITE != 0
    }

    pub(crate) fn set_read_callback(&self, cb: ReadCallback) {
        self.callbacks.lock().unwrap().read = Some(cb);
    }

    pub(crate) fn set_write_callback(&self, cb: EventCallback) {
        self.callbacks.lock().unwrap().write = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: EventCallback) {
        self.callbacks.lock().unwrap().close = Some(cb);
    }

    pub(crate) fn set_error_callback(&self, cb: EventCallback) {
        self.callbacks.lock().unwrap().error = Some(cb);
    }

    /// Bind this channel's lifetime to its logical owner. Dispatch upgrades
    /// the weak reference and holds the resulting strong reference for the
    /// whole callback frame.
    pub(crate) fn tie(&self, owner: Weak<dyn Any + Send + Sync>) {
        *self.tie.lock().unwrap() = Some(owner);
    }

    pub(crate) fn enable_reading(&self) {
        self.events.fetch_or(EVENT_READ, Ordering::AcqRel);
        self.update();
    }

    pub(crate) fn disable_reading(&self) {
        self.events.fetch_and(!EVENT_READ, Ordering::AcqRel);
        self.update();
    }

    pub(crate) fn enable_writing(&self) {
        self.events.fetch_or(EVENT_WRITE, Ordering::AcqRel);
        self.update();
    }

    pub(crate) fn disable_writing(&self) {
        self.events.fetch_and(!EVENT_WRITE, Ordering::AcqRel);
        self.update();
    }

    pub(crate) fn disable_all(&self) {
        self.events.store(EVENT_NONE, Ordering::Release);
        self.update();
    }

    fn update(&self) {
        self.added_to_loop.store(true, Ordering::Release);
        let channel = self.self_weak.upgrade().expect("channel dropped mid-update");
        self.handle.update_channel(&channel);
    }

    /// Unregister from the loop. Must only be called with all interest
    /// disabled, from the owning loop's thread.
    pub(crate) fn remove(&self) {
        if !self.added_to_loop.swap(false, Ordering::AcqRel) {
            return;
        }
        assert!(self.is_none_event(), "removing channel with live interest");
        let channel = self.self_weak.upgrade().expect("channel dropped mid-remove");
        self.handle.remove_channel(&channel);
    }

    /// Dispatch the callbacks matching the last observed readiness.
    pub(crate) fn handle_event(&self, receive_time: Instant) {
        let tied = self.tie.lock().unwrap().clone();
        let _guard: Option<Arc<dyn Any + Send + Sync>> = match tied {
            Some(weak) => match weak.upgrade() {
                Some(owner) => Some(owner),
                // Owner already destroyed; stale activation.
                None => return,
            },
            None => None,
        };
        self.handle_event_with_guard(receive_time);
    }

    fn handle_event_with_guard(&self, receive_time: Instant) {
        self.event_handling.store(true, Ordering::Release);
        let revents = self.revents.load(Ordering::Acquire);
        trace!("fd={} handling {}", self.fd, events_to_string(revents));

        let mut cbs = self.callbacks.lock().unwrap();
        if revents & libc::EPOLLHUP as u32 != 0 && revents & libc::EPOLLIN as u32 == 0 {
            warn!("fd={} hangup", self.fd);
            if let Some(cb) = cbs.close.as_mut() {
                cb();
            }
        }
        if revents & libc::EPOLLERR as u32 != 0 {
            if let Some(cb) = cbs.error.as_mut() {
                cb();
            }
        }
        if revents & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0 {
            if let Some(cb) = cbs.read.as_mut() {
                cb(receive_time);
            }
        }
        if revents & libc::EPOLLOUT as u32 != 0 {
            if let Some(cb) = cbs.write.as_mut() {
                cb();
            }
        }
        drop(cbs);
        self.event_handling.store(false, Ordering::Release);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Destroying a still-registered or mid-dispatch channel is a
        // programming error in the owning object's teardown order.
        debug_assert!(!self.event_handling.load(Ordering::Acquire));
        debug_assert!(!self.added_to_loop.load(Ordering::Acquire));
    }
}

fn events_to_string(events: u32) -> String {
    let mut out = String::new();
    for (bit, name) in [
        (libc::EPOLLIN as u32, "IN "),
        (libc::EPOLLPRI as u32, "PRI "),
        (libc::EPOLLOUT as u32, "OUT "),
        (libc::EPOLLHUP as u32, "HUP "),
        (libc::EPOLLRDHUP as u32, "RDHUP "),
        (libc::EPOLLERR as u32, "ERR "),
    ] {
        if events & bit != 0 {
            out.push_str(name);
        }
    }
    out
}
