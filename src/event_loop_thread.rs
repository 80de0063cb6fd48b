//! Event loops on dedicated threads, and the round-robin pool built from
//! them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::debug;

use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};

/// Runs once on each pool thread before its loop starts, for per-thread
/// setup (thread-local caches, priorities, ...).
pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

/// A thread running one event loop. The loop starts before `start`
/// returns and stops when the `EventLoopThread` is dropped.
pub struct EventLoopThread {
    handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn start(name: &str, init: Option<ThreadInitCallback>) -> Result<EventLoopThread, Error> {
        let (tx, rx) = crossbeam_channel::bounded::<Result<LoopHandle, Error>>(1);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                let handle = event_loop.handle().clone();
                if let Some(init) = &init {
                    init(&handle);
                }
                let _ = tx.send(Ok(handle));
                event_loop.run();
                debug!("loop thread {:?} exiting", thread::current().name());
            })
            .map_err(Error::Io)?;
        let handle = rx
            .recv()
            .map_err(|_| Error::LoopSetup("loop thread exited during startup".into()))??;
        Ok(EventLoopThread {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Round-robin pool of I/O loops fronted by a base loop.
///
/// With zero threads every `next_loop` returns the base loop, giving
/// single-threaded operation with no special casing in the callers.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    started: AtomicBool,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    handles: Mutex<Vec<LoopHandle>>,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.to_string(),
            started: AtomicBool::new(false),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self, num_threads: usize, init: Option<ThreadInitCallback>) -> Result<(), Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut threads = self.threads.lock().unwrap();
        let mut handles = self.handles.lock().unwrap();
        for i in 0..num_threads {
            let thread = EventLoopThread::start(&format!("{}-io-{}", self.name, i), init.clone())?;
            handles.push(thread.handle().clone());
            threads.push(thread);
        }
        if num_threads == 0 {
            if let Some(init) = &init {
                init(&self.base);
            }
        }
        Ok(())
    }

    /// Pick the loop for the next connection. Called from the base loop.
    pub fn next_loop(&self) -> LoopHandle {
        self.base.assert_in_loop_thread();
        let handles = self.handles.lock().unwrap();
        if handles.is_empty() {
            self.base.clone()
        } else {
            let i = self.next.fetch_add(1, Ordering::Relaxed) % handles.len();
            handles[i].clone()
        }
    }

    pub fn base_loop(&self) -> &LoopHandle {
        &self.base
    }
}
