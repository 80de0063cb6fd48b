//! epoll-backed readiness demultiplexer.
//!
//! Owned by an [`EventLoop`](crate::EventLoop) and only ever touched from
//! that loop's thread. Registration state per channel is tracked with the
//! channel's `index` field: `STATE_NEW` (never seen), `STATE_ADDED`
//! (registered with the kernel), `STATE_DETACHED` (known but currently
//! without interest, so removed from the kernel set).

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;

use log::{error, trace};

use crate::channel::{Channel, STATE_ADDED, STATE_DETACHED, STATE_NEW};
use crate::sockets;

const INIT_EVENT_LIST_SIZE: usize = 16;

pub(crate) struct Poller {
    epoll_fd: RawFd,
    /// Kernel-filled event buffer, grown when a poll fills it completely.
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller {
            epoll_fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        })
    }

    /// Block for up to `timeout_ms` waiting for readiness, pushing the
    /// channels with pending events onto `active`. Returns the poll-return
    /// timestamp.
    pub(crate) fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let receive_time = Instant::now();
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!("epoll_wait: {}", err);
            }
            return receive_time;
        }
        let n = n as usize;
        if n > 0 {
            trace!("{} events ready", n);
            for event in &self.events[..n] {
                let fd = event.u64 as RawFd;
                if let Some(channel) = self.channels.get(&fd) {
                    channel.set_revents(event.events);
                    active.push(channel.clone());
                }
            }
            if n == self.events.len() {
                self.events
                    .resize(n * 2, libc::epoll_event { events: 0, u64: 0 });
            }
        } else {
            trace!("nothing ready");
        }
        receive_time
    }

    /// Sync a channel's interest set with the kernel.
    pub(crate) fn update_channel(&mut self, channel: &Arc<Channel>) {
        let state = channel.index();
        let fd = channel.fd();
        trace!("update fd={} events={:#x} state={}", fd, channel.events(), state);
        if state == STATE_NEW || state == STATE_DETACHED {
            if state == STATE_NEW {
                debug_assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, channel.clone());
            } else {
                debug_assert!(self.channels.contains_key(&fd));
            }
            channel.set_index(STATE_ADDED);
            self.ctl(libc::EPOLL_CTL_ADD, channel);
        } else {
            debug_assert!(self.channels.contains_key(&fd));
            debug_assert_eq!(state, STATE_ADDED);
            if channel.is_none_event() {
                self.ctl(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(STATE_DETACHED);
            } else {
                self.ctl(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    /// Forget a channel entirely. Interest must already be cleared.
    pub(crate) fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        trace!("remove fd={}", fd);
        debug_assert!(channel.is_none_event());
        let state = channel.index();
        self.channels.remove(&fd);
        if state == STATE_ADDED {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(STATE_NEW);
    }

    fn ctl(&self, op: libc::c_int, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: channel.events(),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if ret < 0 {
            error!(
                "epoll_ctl op={} fd={}: {}",
                op,
                fd,
                io::Error::last_os_error()
            );
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        sockets::close(self.epoll_fd);
    }
}
