use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::{io, mem};

use crate::config::EVENT_BATCH_COUNT;
use crate::event::{FdEvents, WAKE_TOKEN};
use crate::time::Duration;

fn cvt(res: libc::c_int) -> io::Result<libc::c_int> {
    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

/// Owned file descriptor, closed on drop.
#[derive(Debug)]
pub(crate) struct FdWrapper(RawFd);

impl FdWrapper {
    pub(crate) fn new(fd: RawFd) -> FdWrapper {
        debug_assert!(fd >= 0);
        FdWrapper(fd)
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for FdWrapper {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

fn events_to_epoll(events: FdEvents) -> u32 {
    let mut raw = 0;
    if events.contains(FdEvents::READ) {
        raw |= libc::EPOLLIN as u32;
    }
    if events.contains(FdEvents::WRITE) {
        raw |= libc::EPOLLOUT as u32;
    }
    raw
}

fn epoll_to_events(raw: u32) -> FdEvents {
    let mut events = FdEvents::empty();
    if raw & libc::EPOLLIN as u32 != 0 {
        events |= FdEvents::READ;
    }
    if raw & libc::EPOLLOUT as u32 != 0 {
        events |= FdEvents::WRITE;
    }
    if raw & libc::EPOLLERR as u32 != 0 {
        events |= FdEvents::ERR;
    }
    if raw & libc::EPOLLHUP as u32 != 0 {
        events |= FdEvents::HUP;
    }
    events
}

/// Cross-thread wakeup primitive shared with [`Poller`].
#[derive(Debug, Clone)]
pub(crate) struct WakeHandle {
    wake: Arc<FdWrapper>,
}

impl WakeHandle {
    /// Interrupt a concurrent or future [`Poller::wait`].
    pub(crate) fn wake(&self) {
        let one: u64 = 1;
        // A full eventfd counter still leaves the descriptor readable, so
        // a short or failed write cannot lose the wakeup.
        unsafe {
            libc::write(
                self.wake.fd(),
                &one as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };
    }
}

/// epoll-backed readiness provider with an eventfd wakeup channel.
#[derive(Debug)]
pub(crate) struct Poller {
    epfd: FdWrapper,
    wake: Arc<FdWrapper>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let epfd = FdWrapper::new(cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?);
        let wake = FdWrapper::new(cvt(unsafe {
            libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)
        })?);

        let poller = Poller {
            epfd,
            wake: Arc::new(wake),
        };
        poller.ctl(libc::EPOLL_CTL_ADD, poller.wake.fd(), WAKE_TOKEN, FdEvents::READ)?;
        Ok(poller)
    }

    pub(crate) fn wake_handle(&self) -> WakeHandle {
        WakeHandle {
            wake: self.wake.clone(),
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, events: FdEvents) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: events_to_epoll(events),
            u64: token,
        };
        cvt(unsafe { libc::epoll_ctl(self.epfd.fd(), op, fd, &mut ev) })?;
        Ok(())
    }

    pub(crate) fn add(&self, fd: RawFd, token: u64, events: FdEvents) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, events)
    }

    pub(crate) fn modify(&self, fd: RawFd, token: u64, events: FdEvents) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, events)
    }

    pub(crate) fn del(&self, fd: RawFd) -> io::Result<()> {
        cvt(unsafe {
            libc::epoll_ctl(
                self.epfd.fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                core::ptr::null_mut(),
            )
        })?;
        Ok(())
    }

    /// Block until a watched descriptor is ready, the timeout elapses, or
    /// the wake channel is signaled. Readiness is appended to `out`; the
    /// wake channel is drained internally.
    pub(crate) fn wait(
        &mut self,
        timeout: Option<Duration>,
        out: &mut Vec<(u64, FdEvents)>,
    ) -> io::Result<()> {
        let millis = match timeout {
            // round up so we never spin before a timer deadline
            Some(t) => t.total_micros().div_ceil(1000).min(i32::MAX as u64) as libc::c_int,
            None => -1,
        };

        let mut events: [libc::epoll_event; EVENT_BATCH_COUNT] = unsafe { mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.fd(),
                events.as_mut_ptr(),
                EVENT_BATCH_COUNT as libc::c_int,
                millis,
            )
        };
        let n = match n {
            -1 if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted => 0,
            other => cvt(other)?,
        };

        for ev in &events[..n as usize] {
            if ev.u64 == WAKE_TOKEN {
                let mut count: u64 = 0;
                unsafe {
                    libc::read(
                        self.wake.fd(),
                        &mut count as *mut u64 as *mut libc::c_void,
                        mem::size_of::<u64>(),
                    )
                };
            } else {
                out.push((ev.u64, epoll_to_events(ev.events)));
            }
        }
        Ok(())
    }
}
