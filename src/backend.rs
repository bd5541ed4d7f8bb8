//! The pluggable OS readiness mechanisms.
//!
//! The loop itself doesn't care how the kernel tells us about ready file
//! descriptors. Anything implementing [Multiplexer](trait.Multiplexer.html)
//! can sit below it. Construction of the concrete type plays the role of the
//! init hook and dropping it is the teardown.
//!
//! Two mechanisms are built in and tried in order of preference. The mio
//! poller fronts for whatever is best on the platform (epoll, kqueue, ...).
//! Plain `poll(2)` is the fallback that works about anywhere, at the price
//! of rebuilding its fd array on every wait.

use std::collections::HashMap;
use std::env;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use libc::c_int;
use mio::unix::{EventedFd, UnixReady};
use mio::{Events, Poll, PollOpt, Ready, Token};
use nix;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use error::{Error, Result};
use mask::EventSet;

/// Readiness gathered during one backend dispatch: the token the interest
/// was registered under and what happened to it.
pub type ReadyList = Vec<(usize, EventSet)>;

/// What the loop requires of an OS readiness mechanism.
pub trait Multiplexer {
    /// A short name for diagnostics.
    fn name(&self) -> &'static str;
    /// Does the mechanism hold kernel state that doesn't survive a fork?
    fn needs_reinit(&self) -> bool;
    /// Start watching the fd for the readable/writable part of the interest,
    /// reporting under the given token.
    fn add(&mut self, fd: RawFd, token: usize, interest: EventSet) -> Result<()>;
    /// Stop watching the part of the interest registered under the token.
    fn del(&mut self, fd: RawFd, token: usize, interest: EventSet) -> Result<()>;
    /// Wait for readiness, at most for the given time (`None` blocks without
    /// a limit, zero just polls). Everything that became ready is appended
    /// to the list. Being interrupted by a signal is a normal return, not an
    /// error.
    fn dispatch(&mut self, deadline: Option<Duration>, ready: &mut ReadyList) -> Result<()>;
}

/// Which tokens are interested in one fd.
///
/// A single fd may carry a read event and a write event owned by different
/// registrations, while the kernel mechanisms want one registration per fd.
/// This is the merge point.
#[derive(Debug, Clone, Copy, Default)]
struct FdSlots {
    read: Option<usize>,
    write: Option<usize>,
}

impl FdSlots {
    fn vacant(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

pub struct MioMultiplexer {
    poll: Poll,
    events: Events,
    fds: HashMap<RawFd, FdSlots>,
}

impl MioMultiplexer {
    pub fn boxed() -> Result<Box<Multiplexer>> {
        Ok(Box::new(MioMultiplexer {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            fds: HashMap::new(),
        }))
    }

    fn interest(slots: &FdSlots) -> Ready {
        let mut ready = Ready::empty();
        if slots.read.is_some() {
            ready = ready | Ready::readable();
        }
        if slots.write.is_some() {
            ready = ready | Ready::writable();
        }
        ready
    }
}

impl Multiplexer for MioMultiplexer {
    fn name(&self) -> &'static str {
        "mio"
    }
    fn needs_reinit(&self) -> bool {
        true
    }
    fn add(&mut self, fd: RawFd, token: usize, interest: EventSet) -> Result<()> {
        let mut slots = self.fds.get(&fd).map(|s| *s).unwrap_or_default();
        let had = !slots.vacant();
        if interest.is_readable() {
            slots.read = Some(token);
        }
        if interest.is_writable() {
            slots.write = Some(token);
        }
        // The token registered with mio is the fd itself; our own tokens are
        // resolved through the slots when readiness comes back.
        let registration = Self::interest(&slots);
        if had {
            self.poll
                .reregister(&EventedFd(&fd), Token(fd as usize), registration, PollOpt::level())?;
        } else {
            self.poll
                .register(&EventedFd(&fd), Token(fd as usize), registration, PollOpt::level())?;
        }
        self.fds.insert(fd, slots);
        Ok(())
    }
    fn del(&mut self, fd: RawFd, token: usize, interest: EventSet) -> Result<()> {
        let mut slots = match self.fds.get(&fd).map(|s| *s) {
            Some(slots) => slots,
            None => return Ok(()),
        };
        if interest.is_readable() && slots.read == Some(token) {
            slots.read = None;
        }
        if interest.is_writable() && slots.write == Some(token) {
            slots.write = None;
        }
        if slots.vacant() {
            self.fds.remove(&fd);
            self.poll.deregister(&EventedFd(&fd))?;
        } else {
            self.fds.insert(fd, slots);
            self.poll
                .reregister(&EventedFd(&fd), Token(fd as usize), Self::interest(&slots), PollOpt::level())?;
        }
        Ok(())
    }
    fn dispatch(&mut self, deadline: Option<Duration>, ready: &mut ReadyList) -> Result<()> {
        match self.poll.poll(&mut self.events, deadline) {
            Ok(_) => (),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        }
        for event in self.events.iter() {
            let fd = event.token().0 as RawFd;
            let slots = match self.fds.get(&fd) {
                Some(slots) => *slots,
                None => continue,
            };
            let what = event.readiness();
            let unix = UnixReady::from(what);
            // A hung-up or failed fd wakes both directions so whoever is
            // waiting notices the condition from read()/write() itself.
            let broken = unix.is_hup() || unix.is_error();
            if let Some(token) = slots.read {
                if what.is_readable() || broken {
                    ready.push((token, EventSet::readable()));
                }
            }
            if let Some(token) = slots.write {
                if what.is_writable() || broken {
                    ready.push((token, EventSet::writable()));
                }
            }
        }
        Ok(())
    }
}

pub struct PollMultiplexer {
    fds: HashMap<RawFd, FdSlots>,
}

impl PollMultiplexer {
    pub fn boxed() -> Result<Box<Multiplexer>> {
        Ok(Box::new(PollMultiplexer {
            fds: HashMap::new(),
        }))
    }

    fn timeout_ms(deadline: Option<Duration>) -> c_int {
        let deadline = match deadline {
            Some(deadline) => deadline,
            None => return -1,
        };
        // Round sub-millisecond tails up, a busy wait until the deadline
        // actually passes is worse than oversleeping a bit.
        let mut ms = deadline.as_secs().saturating_mul(1000);
        let nanos = deadline.subsec_nanos() as u64;
        ms = ms.saturating_add(nanos / 1_000_000);
        if nanos % 1_000_000 != 0 {
            ms = ms.saturating_add(1);
        }
        if ms > c_int::max_value() as u64 {
            c_int::max_value()
        } else {
            ms as c_int
        }
    }
}

impl Multiplexer for PollMultiplexer {
    fn name(&self) -> &'static str {
        "poll"
    }
    fn needs_reinit(&self) -> bool {
        false
    }
    fn add(&mut self, fd: RawFd, token: usize, interest: EventSet) -> Result<()> {
        let slots = self.fds.entry(fd).or_insert_with(FdSlots::default);
        if interest.is_readable() {
            slots.read = Some(token);
        }
        if interest.is_writable() {
            slots.write = Some(token);
        }
        Ok(())
    }
    fn del(&mut self, fd: RawFd, token: usize, interest: EventSet) -> Result<()> {
        let vacant = match self.fds.get_mut(&fd) {
            Some(slots) => {
                if interest.is_readable() && slots.read == Some(token) {
                    slots.read = None;
                }
                if interest.is_writable() && slots.write == Some(token) {
                    slots.write = None;
                }
                slots.vacant()
            },
            None => return Ok(()),
        };
        if vacant {
            self.fds.remove(&fd);
        }
        Ok(())
    }
    fn dispatch(&mut self, deadline: Option<Duration>, ready: &mut ReadyList) -> Result<()> {
        let mut polled = Vec::with_capacity(self.fds.len());
        let mut pollfds = Vec::with_capacity(self.fds.len());
        for (&fd, slots) in self.fds.iter() {
            let mut flags = PollFlags::empty();
            if slots.read.is_some() {
                flags |= PollFlags::POLLIN;
            }
            if slots.write.is_some() {
                flags |= PollFlags::POLLOUT;
            }
            polled.push(fd);
            pollfds.push(PollFd::new(fd, flags));
        }
        match poll(&mut pollfds, Self::timeout_ms(deadline)) {
            Ok(_) => (),
            Err(nix::Error::Sys(Errno::EINTR)) => return Ok(()),
            Err(e) => return Err(Error::Nix(e)),
        }
        for (i, pollfd) in pollfds.iter().enumerate() {
            let revents = match pollfd.revents() {
                Some(revents) => revents,
                None => continue,
            };
            let slots = self.fds[&polled[i]];
            let broken = revents
                .intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL);
            if let Some(token) = slots.read {
                if revents.contains(PollFlags::POLLIN) || broken {
                    ready.push((token, EventSet::readable()));
                }
            }
            if let Some(token) = slots.write {
                if revents.contains(PollFlags::POLLOUT) || broken {
                    ready.push((token, EventSet::writable()));
                }
            }
        }
        Ok(())
    }
}

/// Pick the first mechanism that comes up.
///
/// With `EVENT_SHOW_METHOD` set in the environment, the chosen name is
/// reported to the log. There's no way to override the order from outside,
/// embedders wanting a specific one can construct it themselves.
pub fn select() -> Result<Box<Multiplexer>> {
    let methods: [fn() -> Result<Box<Multiplexer>>; 2] =
        [MioMultiplexer::boxed, PollMultiplexer::boxed];
    for method in methods.iter() {
        match method() {
            Ok(backend) => {
                if env::var_os("EVENT_SHOW_METHOD").is_some() {
                    info!("evloop using: {}", backend.name());
                }
                return Ok(backend);
            },
            Err(err) => debug!("event mechanism unavailable: {}", err),
        }
    }
    Err(Error::NoMechanism)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd;
    use mask::EventSet;

    fn run_pipe_test(mut backend: Box<Multiplexer>) {
        let (read_fd, write_fd) = unistd::pipe().unwrap();
        backend.add(read_fd, 7, EventSet::readable()).unwrap();

        // Nothing there yet
        let mut ready = Vec::new();
        backend.dispatch(Some(Duration::new(0, 0)), &mut ready).unwrap();
        assert!(ready.is_empty());

        // A byte in the pipe shows up under our token
        unistd::write(write_fd, b"x").unwrap();
        backend.dispatch(Some(Duration::new(0, 0)), &mut ready).unwrap();
        assert_eq!(vec![(7, EventSet::readable())], ready);

        // After removal it doesn't
        backend.del(read_fd, 7, EventSet::readable()).unwrap();
        ready.clear();
        backend.dispatch(Some(Duration::new(0, 0)), &mut ready).unwrap();
        assert!(ready.is_empty());

        let _ = unistd::close(read_fd);
        let _ = unistd::close(write_fd);
    }

    #[test]
    fn mio_pipe() {
        run_pipe_test(MioMultiplexer::boxed().unwrap());
    }

    #[test]
    fn poll_pipe() {
        run_pipe_test(PollMultiplexer::boxed().unwrap());
    }

    /// Separate read and write registrations on one fd resolve to their own
    /// tokens.
    #[test]
    fn split_directions() {
        let mut backend = PollMultiplexer::boxed().unwrap();
        let (read_fd, write_fd) = unistd::pipe().unwrap();
        backend.add(write_fd, 1, EventSet::writable()).unwrap();
        backend.add(write_fd, 2, EventSet::readable()).unwrap();
        let mut ready = Vec::new();
        backend.dispatch(Some(Duration::new(0, 0)), &mut ready).unwrap();
        // An empty pipe is writable, not readable
        assert_eq!(vec![(1, EventSet::writable())], ready);
        let _ = unistd::close(read_fd);
        let _ = unistd::close(write_fd);
    }

    #[test]
    fn milliseconds() {
        assert_eq!(-1, PollMultiplexer::timeout_ms(None));
        assert_eq!(0, PollMultiplexer::timeout_ms(Some(Duration::new(0, 0))));
        assert_eq!(1, PollMultiplexer::timeout_ms(Some(Duration::new(0, 1))));
        assert_eq!(1500, PollMultiplexer::timeout_ms(Some(Duration::from_millis(1500))));
    }
}
