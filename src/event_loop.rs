//! The reactor core: one event loop per thread.
//!
//! [`EventLoop`] is the owning, non-`Send` half that actually runs the
//! poll/dispatch cycle. [`LoopHandle`] is the cheap, clonable, `Send` half
//! that any thread uses to marshal work onto the loop (`run_in_loop`,
//! `queue_in_loop`), schedule timers, and request shutdown. Everything the
//! handle touches cross-thread goes through atomics, mutex-protected
//! queues, or the eventfd wakeup; channel and poller mutation is restricted
//! to the loop's own thread and asserted as such.

use std::cell::Cell;
use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error, trace};

use crate::channel::Channel;
use crate::error::Error;
use crate::metrics::LOOP_WAKEUPS;
use crate::poller::Poller;
use crate::sockets;
use crate::timer_queue::{TimerCallback, TimerId, TimerQueue};

/// Upper bound on one poll, so a quiescent loop still notices `quit`.
const POLL_TIME_MS: i32 = 10_000;

pub(crate) type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    /// Guards the one-loop-per-thread invariant.
    static LOOP_IN_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// State shared between the loop and its handles.
struct LoopShared {
    thread_id: ThreadId,
    wakeup_fd: RawFd,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending: AtomicBool,
    /// fd of the channel currently being dispatched, -1 outside dispatch.
    current_active_fd: AtomicI32,
    /// fds of all channels in the current dispatch batch.
    active_fds: Mutex<Vec<RawFd>>,
    iteration: AtomicU64,
    pending: Mutex<Vec<Task>>,
    poller: Mutex<Poller>,
    /// Weak so the loop's drop is what tears the timer queue down.
    timers: OnceLock<Weak<TimerQueue>>,
}

/// Clonable, thread-safe handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Panic unless called from the owning loop's thread.
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "loop owned by {:?} was accessed from {:?}",
            self.shared.thread_id,
            thread::current().id()
        );
    }

    /// Run `task` on the loop thread: immediately when already there,
    /// otherwise queued for the end of the current (or next) iteration.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` for the pending-task phase of the loop, waking the loop
    /// if it might otherwise sleep past it.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.pending.lock().unwrap().push(Box::new(task));
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    pub fn queue_size(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Completed poll iterations so far.
    pub fn iteration(&self) -> u64 {
        self.shared.iteration.load(Ordering::Relaxed)
    }

    /// Ask the loop to stop after its current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Force the loop out of `epoll_wait`.
    pub(crate) fn wakeup(&self) {
        LOOP_WAKEUPS.increment();
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.shared.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!("wakeup write returned {}", n);
        }
    }

    /// Schedule `callback` to fire once at `when`.
    pub fn run_at<F>(&self, when: Instant, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.add_timer(when, None, Box::new(callback))
    }

    /// Schedule `callback` to fire once after `delay`.
    pub fn run_after<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.add_timer(Instant::now() + delay, None, Box::new(callback))
    }

    /// Schedule `callback` to fire every `interval`, first after one
    /// `interval` from now.
    pub fn run_every<F>(&self, interval: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        assert!(interval > Duration::ZERO, "interval must be positive");
        self.add_timer(Instant::now() + interval, Some(interval), Box::new(callback))
    }

    /// Cancel a timer. Safe against already-fired, repeating, and
    /// self-canceling timers; unknown ids are ignored.
    pub fn cancel(&self, id: TimerId) {
        TimerQueue::cancel(self.timer_queue(), self, id);
    }

    fn add_timer(&self, when: Instant, interval: Option<Duration>, callback: TimerCallback) -> TimerId {
        TimerQueue::add_timer(self.timer_queue(), self, callback, when, interval)
    }

    fn timer_queue(&self) -> Arc<TimerQueue> {
        self.shared
            .timers
            .get()
            .and_then(Weak::upgrade)
            .expect("event loop destroyed")
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.shared.poller.lock().unwrap().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        if self.shared.event_handling.load(Ordering::Acquire) {
            // Removal during dispatch is only safe for the channel being
            // dispatched or one not in the current batch at all.
            debug_assert!(
                self.shared.current_active_fd.load(Ordering::Acquire) == channel.fd()
                    || !self
                        .shared
                        .active_fds
                        .lock()
                        .unwrap()
                        .contains(&channel.fd())
            );
        }
        self.shared.poller.lock().unwrap().remove_channel(channel);
    }
}

/// A single-threaded reactor. Owns the poller, the timer queue, and the
/// cross-thread wakeup channel; not `Send`, it runs on the thread that
/// created it.
pub struct EventLoop {
    handle: LoopHandle,
    wakeup_channel: Arc<Channel>,
    timer_queue: Arc<TimerQueue>,
    active: Vec<Arc<Channel>>,
    looping: bool,
    _not_send: PhantomData<*const ()>,
}

impl EventLoop {
    /// Create the loop for the current thread.
    ///
    /// Panics if this thread already owns a loop; fails with an error if
    /// the kernel resources (epoll, eventfd, timerfd) cannot be created.
    pub fn new() -> Result<EventLoop, Error> {
        assert!(
            !LOOP_IN_THREAD.get(),
            "another EventLoop already exists in thread {:?}",
            thread::current().id()
        );

        let poller = Poller::new()?;
        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let shared = Arc::new(LoopShared {
            thread_id: thread::current().id(),
            wakeup_fd,
            quit: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            current_active_fd: AtomicI32::new(-1),
            active_fds: Mutex::new(Vec::new()),
            iteration: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            poller: Mutex::new(poller),
            timers: OnceLock::new(),
        });
        let handle = LoopHandle { shared };

        let timer_queue = match TimerQueue::new(&handle) {
            Ok(queue) => queue,
            Err(e) => {
                sockets::close(wakeup_fd);
                return Err(Error::Io(e));
            }
        };
        let _ = handle.shared.timers.set(Arc::downgrade(&timer_queue));

        let wakeup_channel = Channel::new(handle.clone(), wakeup_fd);
        wakeup_channel.set_read_callback(Box::new(move |_| {
            let mut one: u64 = 0;
            let n = unsafe { libc::read(wakeup_fd, &mut one as *mut u64 as *mut libc::c_void, 8) };
            if n != 8 {
                error!("wakeup read returned {}", n);
            }
        }));
        wakeup_channel.enable_reading();

        LOOP_IN_THREAD.set(true);
        debug!("EventLoop created in {:?}", thread::current().id());
        Ok(EventLoop {
            handle,
            wakeup_channel,
            timer_queue,
            active: Vec::new(),
            looping: false,
            _not_send: PhantomData,
        })
    }

    /// Handle for marshaling work onto this loop from other threads.
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Run the poll/dispatch cycle until [`LoopHandle::quit`] is called.
    pub fn run(&mut self) {
        self.handle.assert_in_loop_thread();
        assert!(!self.looping, "loop is already running");
        self.looping = true;
        let shared = Arc::clone(&self.handle.shared);
        shared.quit.store(false, Ordering::Release);
        trace!("EventLoop start looping");

        while !shared.quit.load(Ordering::Acquire) {
            self.active.clear();
            let receive_time = {
                let mut poller = shared.poller.lock().unwrap();
                poller.poll(POLL_TIME_MS, &mut self.active)
            };
            shared.iteration.fetch_add(1, Ordering::Relaxed);

            {
                let mut active_fds = shared.active_fds.lock().unwrap();
                active_fds.clear();
                active_fds.extend(self.active.iter().map(|c| c.fd()));
            }
            shared.event_handling.store(true, Ordering::Release);
            for channel in &self.active {
                shared
                    .current_active_fd
                    .store(channel.fd(), Ordering::Release);
                channel.handle_event(receive_time);
            }
            shared.current_active_fd.store(-1, Ordering::Release);
            shared.event_handling.store(false, Ordering::Release);

            self.do_pending_tasks();
        }

        // Drain teardown work queued during the final iteration (deferred
        // connection unregistration chains up to two tasks deep).
        for _ in 0..16 {
            if self.handle.queue_size() == 0 {
                break;
            }
            self.do_pending_tasks();
        }

        trace!("EventLoop stop looping");
        self.looping = false;
    }

    /// Drain the queued tasks. The queue is swapped out under the lock and
    /// executed outside it, so tasks can queue further tasks freely; those
    /// run in the next iteration.
    fn do_pending_tasks(&mut self) {
        let shared = &self.handle.shared;
        shared.calling_pending.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *shared.pending.lock().unwrap());
        for task in tasks {
            task();
        }
        shared.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!("EventLoop in {:?} destructs", thread::current().id());
        self.timer_queue.detach();
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
        sockets::close(self.handle.shared.wakeup_fd);
        LOOP_IN_THREAD.set(false);
    }
}
