//! The bridge between asynchronous signal delivery and the loop.
//!
//! A signal handler may interrupt the program at any point, so almost
//! nothing is allowed to happen inside it. The handler here only bumps a
//! per-signal counter, raises one global flag and writes a byte into the
//! wakeup pipe of the loop currently handling signals. That write is what
//! kicks the backend out of its sleep; everything else happens on the loop
//! thread once the backend reports the pipe readable.
//!
//! Signal dispositions are installed lazily, when the first event subscribes
//! to a signal, and the previous disposition is put back when the last
//! subscriber leaves.

use std::cmp;
use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

use libc::{self, c_int};
use nix;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd;

use error::Result;

/// Signals at and above this don't go through the bridge (realtime signals
/// are out of scope).
const NSIG: usize = 32;

const COUNTER_INIT: AtomicUsize = AtomicUsize::new(0);

// How many times each signal arrived since the loop last looked.
static CAUGHT: [AtomicUsize; NSIG] = [COUNTER_INIT; NSIG];
// Some signal arrived. The sig_atomic_t of the C world.
static GOT_SIGNAL: AtomicBool = AtomicBool::new(false);
// Write end of the wakeup pipe of the loop that handles signals, -1 if none.
static WAKEUP_FD: AtomicIsize = AtomicIsize::new(-1);

extern "C" fn wakeup_handler(signum: c_int) {
    if signum < 0 || signum as usize >= NSIG {
        return;
    }
    CAUGHT[signum as usize].fetch_add(1, Ordering::SeqCst);
    GOT_SIGNAL.store(true, Ordering::SeqCst);
    let fd = WAKEUP_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        // write(2) is async-signal-safe. A full pipe means a wakeup is
        // already waiting in there, so the lost byte doesn't matter.
        let byte = [0u8; 1];
        unsafe {
            libc::write(fd as c_int, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// Consume the got-a-signal flag.
pub fn take_flag() -> bool {
    GOT_SIGNAL.swap(false, Ordering::SeqCst)
}

/// Peek at the got-a-signal flag without consuming it.
pub fn flag_raised() -> bool {
    GOT_SIGNAL.load(Ordering::SeqCst)
}

/// The per-loop side of the bridge.
pub struct SignalBridge {
    read_fd: RawFd,
    write_fd: RawFd,
    /// Index of the internal event watching the pipe's read end, once the
    /// first subscription put it in place.
    pub wakeup: Option<usize>,
    recipients: HashMap<c_int, HashSet<usize>>,
    old_actions: HashMap<c_int, (Signal, SigAction)>,
}

impl SignalBridge {
    pub fn new() -> Result<SignalBridge> {
        let (read_fd, write_fd) = SignalBridge::pipe()?;
        Ok(SignalBridge {
            read_fd: read_fd,
            write_fd: write_fd,
            wakeup: None,
            recipients: HashMap::new(),
            old_actions: HashMap::new(),
        })
    }

    fn pipe() -> Result<(RawFd, RawFd)> {
        let (read_fd, write_fd) = unistd::pipe()?;
        for &fd in [read_fd, write_fd].iter() {
            fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        }
        Ok((read_fd, write_fd))
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn has_recipients(&self) -> bool {
        self.recipients.values().any(|set| !set.is_empty())
    }

    /// Deliver the signal to the event with the given index from now on.
    ///
    /// The first subscriber of a signal switches its disposition to our
    /// handler; the original disposition is remembered.
    pub fn subscribe(&mut self, signal: Signal, idx: usize) -> Result<()> {
        let signum = signal as c_int;
        assert!(signum >= 0 && (signum as usize) < NSIG);
        if !self.old_actions.contains_key(&signum) {
            let action = SigAction::new(
                SigHandler::Handler(wakeup_handler),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            let old = unsafe { sigaction(signal, &action) }?;
            self.old_actions.insert(signum, (signal, old));
        }
        self.recipients
            .entry(signum)
            .or_insert_with(HashSet::new)
            .insert(idx);
        WAKEUP_FD.store(self.write_fd as isize, Ordering::SeqCst);
        Ok(())
    }

    /// Stop delivering the signal to the event.
    ///
    /// When nobody is interested in the signal any more, the previous
    /// disposition comes back.
    pub fn unsubscribe(&mut self, signal: Signal, idx: usize) -> Result<()> {
        let signum = signal as c_int;
        let emptied = match self.recipients.get_mut(&signum) {
            Some(set) => {
                set.remove(&idx);
                set.is_empty()
            },
            None => return Ok(()),
        };
        if emptied {
            self.recipients.remove(&signum);
            if let Some((signal, old)) = self.old_actions.remove(&signum) {
                unsafe { sigaction(signal, &old) }?;
            }
        }
        Ok(())
    }

    /// Drain the wakeup pipe and collect who gets woken and how many times.
    ///
    /// A signal arriving several times between two looks coalesces into one
    /// activation with the occurrence count, for every subscribed event.
    pub fn collect(&mut self) -> Vec<(usize, u16)> {
        let mut buf = [0u8; 64];
        loop {
            match unistd::read(self.read_fd, &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(_) => break, // EAGAIN, drained
            }
        }
        let mut woken = Vec::new();
        for (&signum, recipients) in self.recipients.iter() {
            let count = CAUGHT[signum as usize].swap(0, Ordering::SeqCst);
            if count == 0 {
                continue;
            }
            let ncalls = cmp::min(count, u16::max_value() as usize) as u16;
            for &idx in recipients.iter() {
                woken.push((idx, ncalls));
            }
        }
        woken
    }

    /// Throw the pipe away and make a fresh one.
    ///
    /// The old one is shared with the parent process after a fork, so the
    /// child must not keep using it.
    pub fn repipe(&mut self) -> Result<()> {
        self.forget_wakeup_fd();
        let _ = unistd::close(self.read_fd);
        let _ = unistd::close(self.write_fd);
        let (read_fd, write_fd) = SignalBridge::pipe()?;
        self.read_fd = read_fd;
        self.write_fd = write_fd;
        self.wakeup = None;
        if self.has_recipients() {
            WAKEUP_FD.store(write_fd as isize, Ordering::SeqCst);
        }
        Ok(())
    }

    fn forget_wakeup_fd(&self) {
        let _ = WAKEUP_FD.compare_exchange(
            self.write_fd as isize,
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        for &(signal, ref old) in self.old_actions.values() {
            let _ = unsafe { sigaction(signal, old) };
        }
        self.forget_wakeup_fd();
        let _ = unistd::close(self.read_fd);
        let _ = unistd::close(self.write_fd);
    }
}
