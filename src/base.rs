//! The event loop itself.

use std::cell::Cell;
use std::collections::VecDeque;
use std::mem::replace;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, SystemTime};

use linked_hash_map::LinkedHashMap;
use nix::sys::signal::Signal;

use arena::{Arena, Handle};
use backend::{self, Multiplexer, ReadyList};
use clock::Clock;
use error::{Error, Result};
use heap::TimerHeap;
use mask::{DispatchFlags, EventSet};
use signals::{self, SignalBridge};

/// The type of the callbacks invoked when an event fires.
///
/// The closure receives the loop (so it can add, delete or re-arm events,
/// including the one it belongs to), the handle of the firing event and the
/// set of things that triggered it. What C event libraries pass around as a
/// user data pointer is simply captured by the closure.
pub type Callback = Box<FnMut(&mut Loop, Handle, EventSet)>;

/// Why `dispatch` returned.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Exit {
    /// The loop was asked to terminate, or the requested amount of work is
    /// done.
    Normal,
    /// There was nothing left to wait for.
    Empty,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Fd(RawFd),
    Sig(Signal),
    Timer,
}

/// A description of an interest, ready to be registered in a
/// [Loop](struct.Loop.html).
///
/// This is just the builder part. Nothing happens until the event is
/// [registered](struct.Loop.html#method.register) and
/// [added](struct.Loop.html#method.add).
pub struct Event {
    target: Target,
    interest: EventSet,
    callback: Callback,
}

impl Event {
    /// An event watching a file descriptor.
    ///
    /// The interest may combine `readable`, `writable` and `persist`;
    /// anything else in it is ignored.
    pub fn io<F: FnMut(&mut Loop, Handle, EventSet) + 'static>(fd: RawFd, interest: EventSet, f: F) -> Event {
        let interest = interest & (EventSet::readable() | EventSet::writable() | EventSet::persist());
        Event {
            target: Target::Fd(fd),
            interest: interest,
            callback: Box::new(f),
        }
    }
    /// An event waking up on a unix signal.
    ///
    /// Signal events are persistent: once added, the callback runs on every
    /// delivery until the event is deleted.
    pub fn signal<F: FnMut(&mut Loop, Handle, EventSet) + 'static>(signal: Signal, f: F) -> Event {
        Event {
            target: Target::Sig(signal),
            interest: EventSet::signal() | EventSet::persist(),
            callback: Box::new(f),
        }
    }
    /// A pure timer event. The deadline is supplied to each
    /// [add](struct.Loop.html#method.add).
    pub fn timer<F: FnMut(&mut Loop, Handle, EventSet) + 'static>(f: F) -> Event {
        Event {
            target: Target::Timer,
            interest: EventSet::empty(),
            callback: Box::new(f),
        }
    }
    /// Keep the event registered when it fires.
    ///
    /// A firing timeout still unschedules the timer part; persistence means
    /// the event doesn't lose its place in the loop and its fd registration.
    pub fn persist(mut self) -> Event {
        self.interest |= EventSet::persist();
        self
    }
}

struct EvHolder {
    target: Target,
    interest: EventSet,
    // Taken out while the callback runs, so the callback can get the loop
    callback: Option<Callback>,
    pri: usize,
    inserted: bool,
    active: bool,
    queued_timeout: bool,
    internal: bool,
    deadline: Duration,
    res: EventSet,
    ncalls: u16,
    // While a drain runs the event's callbacks, this points at the drain's
    // remaining-call counter. Deleting or re-arming the event zeroes the
    // counter through it, stopping the drain before the next invocation.
    pncalls: Option<Weak<Cell<u16>>>,
}

/// The event loop.
///
/// One loop belongs to one thread. All state lives inside, events are
/// referred to by [handles](struct.Handle.html) and their callbacks get the
/// loop back as an argument, so they can manipulate it freely, including
/// deleting themselves.
///
/// The loop multiplexes three kinds of interests onto one dispatch cycle:
/// file descriptor readiness, unix signals and timeouts. Events carry a
/// priority; a smaller number means running earlier, and as long as a higher
/// priority has work, lower ones don't get a turn at all.
pub struct Loop {
    backend: Box<Multiplexer>,
    events: Arena<EvHolder>,
    // Inserted events in registration order; walked when rebuilding the
    // backend after a fork.
    registered: LinkedHashMap<usize, ()>,
    heap: TimerHeap,
    queues: Vec<VecDeque<usize>>,
    event_count: usize,
    event_count_active: usize,
    clock: Clock,
    // Time cached between the backend return and the next sleep
    tv_cache: Option<Duration>,
    // When we last went to look for events; the clock correction compares
    // against it
    event_tv: Duration,
    gotterm: bool,
    brk: bool,
    sig_callback: Option<Box<FnMut() -> Result<()>>>,
    signals: SignalBridge,
    // Recycled buffer for backend readiness
    ready: ReadyList,
}

impl Loop {
    /// Create a new loop with the best clock and readiness mechanism
    /// available.
    pub fn new() -> Result<Loop> {
        Loop::with_clock(Clock::detect())
    }

    /// Create a new loop driven by the given time source.
    ///
    /// With a clock that can jump backwards, the loop compensates by
    /// shifting all scheduled deadlines, so relative waits stay intact.
    pub fn with_clock(clock: Clock) -> Result<Loop> {
        let backend = backend::select()?;
        let signals = SignalBridge::new()?;
        let event_tv = clock.read();
        Ok(Loop {
            backend: backend,
            events: Arena::new(),
            registered: LinkedHashMap::new(),
            heap: TimerHeap::new(),
            queues: vec![VecDeque::new()],
            event_count: 0,
            event_count_active: 0,
            clock: clock,
            tv_cache: None,
            event_tv: event_tv,
            gotterm: false,
            brk: false,
            sig_callback: None,
            signals: signals,
            ready: Vec::new(),
        })
    }

    /// The name of the readiness mechanism in use.
    pub fn method(&self) -> &'static str {
        self.backend.name()
    }

    /// How many events are added (watching an fd or signal, or waiting for a
    /// timeout)?
    pub fn event_count(&self) -> usize {
        self.event_count
    }

    /// How many events wait in the active queues for their callback?
    pub fn event_count_active(&self) -> usize {
        self.event_count_active
    }

    /// Is the handle still pointing at a registered event?
    pub fn alive(&self, handle: Handle) -> bool {
        self.events.contains(handle)
    }

    /// The loop's current time.
    ///
    /// Returns the time cached when the backend last returned, if there is
    /// one; that is cheaper than reading the clock for every callback, at
    /// the price of being a bit stale after long callbacks.
    pub fn now(&self) -> Duration {
        match self.tv_cache {
            Some(now) => now,
            None => self.clock.read(),
        }
    }

    /// Put the event into the loop, getting back its identity.
    ///
    /// The event doesn't watch anything yet; call
    /// [add](#method.add) for that. It starts at the middle priority.
    pub fn register(&mut self, event: Event) -> Handle {
        let pri = self.queues.len() / 2;
        self.events.insert(EvHolder {
            target: event.target,
            interest: event.interest,
            callback: Some(event.callback),
            pri: pri,
            inserted: false,
            active: false,
            queued_timeout: false,
            internal: false,
            deadline: Duration::new(0, 0),
            res: EventSet::empty(),
            ncalls: 0,
            pncalls: None,
        })
    }

    /// Remove the event from the loop entirely, invalidating the handle.
    ///
    /// The event is deleted first if it is still added somewhere. Safe to
    /// call from the event's own callback.
    pub fn unregister(&mut self, handle: Handle) -> Result<()> {
        let idx = self.live(handle)?;
        let res = self.del_idx(idx);
        self.events.remove(handle);
        res
    }

    /// Start watching for the event's interests.
    ///
    /// With a timeout, the event additionally fires after the given time; a
    /// later `add` with a new timeout replaces the old deadline (this is the
    /// way to re-arm a timer, even from its own callback). The operation
    /// either fully succeeds or leaves the event untouched.
    pub fn add(&mut self, handle: Handle, timeout: Option<Duration>) -> Result<()> {
        let idx = self.live(handle)?;
        trace!(
            "add: event {:?} with {:?}{}",
            handle,
            self.events[idx].interest,
            if timeout.is_some() { " +timeout" } else { "" }
        );
        // Make the heap slot ready first. Everything past the backend
        // registration must not fail, or we would leave the event half-added.
        if timeout.is_some() && !self.events[idx].queued_timeout {
            self.heap.reserve(1);
        }
        let (target, interest, present) = {
            let ev = &self.events[idx];
            (ev.target, ev.interest, ev.inserted || ev.active)
        };
        let io_interest = EventSet::readable() | EventSet::writable() | EventSet::signal();
        if interest.intersects(io_interest) && !present {
            match target {
                Target::Fd(fd) => self.backend.add(fd, idx, interest)?,
                Target::Sig(signal) => {
                    self.wakeup_register()?;
                    self.signals.subscribe(signal, idx)?;
                },
                Target::Timer => (),
            }
            self.queue_insert_inserted(idx);
        }
        if let Some(timeout) = timeout {
            if self.events[idx].queued_timeout {
                self.queue_remove_timeout(idx);
            }
            // The previous timeout may have fired already and put the event
            // into an active queue, possibly even half-way through a callback
            // sequence. Re-arming takes it back out.
            if self.events[idx].active && self.events[idx].res.is_timeout() {
                self.callback_abort(idx);
                self.queue_remove_active(idx);
            }
            let deadline = self.now() + timeout;
            self.events[idx].deadline = deadline;
            self.queue_insert_timeout(idx);
            trace!("add: timeout in {:?} on {:?}", timeout, handle);
        }
        Ok(())
    }

    /// Stop watching for the event's interests.
    ///
    /// Takes the event out of the backend, the timer heap and the active
    /// queues, whichever apply; a callback sequence in flight is aborted.
    /// Deleting an event that isn't anywhere is a no-op. The handle stays
    /// valid and the event can be added again.
    pub fn del(&mut self, handle: Handle) -> Result<()> {
        let idx = self.live(handle)?;
        trace!("del: event {:?}", handle);
        self.del_idx(idx)
    }

    /// What is the event waiting for right now?
    ///
    /// Reports the subset of `what` the event is watching or was triggered
    /// with. If `what` asks about timeouts and one is scheduled, the second
    /// part of the result carries the deadline mapped onto the wall clock.
    pub fn pending(&self, handle: Handle, what: EventSet) -> Result<(EventSet, Option<SystemTime>)> {
        let idx = self.live(handle)?;
        let ev = &self.events[idx];
        let mut flags = EventSet::empty();
        if ev.inserted {
            flags |= ev.interest & (EventSet::readable() | EventSet::writable() | EventSet::signal());
        }
        if ev.active {
            flags |= ev.res;
        }
        if ev.queued_timeout {
            flags |= EventSet::timeout();
        }
        let flags = flags & what;
        let deadline = if flags.is_timeout() {
            let remaining = ev
                .deadline
                .checked_sub(self.now())
                .unwrap_or(Duration::new(0, 0));
            Some(SystemTime::now() + remaining)
        } else {
            None
        };
        Ok((flags, deadline))
    }

    /// Move the event to the given priority level.
    ///
    /// Fails on an event that is currently active; its place in the queue is
    /// already taken.
    pub fn priority_set(&mut self, handle: Handle, pri: usize) -> Result<()> {
        let idx = self.live(handle)?;
        if self.events[idx].active {
            return Err(Error::Active);
        }
        if pri >= self.queues.len() {
            return Err(Error::BadPriority);
        }
        self.events[idx].pri = pri;
        Ok(())
    }

    /// Set the number of priority levels.
    ///
    /// Refused while any event waits in an active queue. Events registered
    /// afterwards default to the middle level; priorities of existing events
    /// are left alone, so shrinking below a priority somebody holds is the
    /// caller's mistake.
    pub fn priorities_set(&mut self, npriorities: usize) -> Result<()> {
        if npriorities == 0 {
            return Err(Error::BadPriority);
        }
        if self.has_active() {
            return Err(Error::Active);
        }
        if npriorities == self.queues.len() {
            return Ok(());
        }
        self.queues = vec![VecDeque::new(); npriorities];
        Ok(())
    }

    /// Make the event's callback run, as if `what` had happened to it,
    /// `ncalls` times in a row.
    ///
    /// Activating an event that is already active merges the new trigger
    /// into the one report; the callback then sees the union of the causes.
    pub fn activate(&mut self, handle: Handle, what: EventSet, ncalls: u16) -> Result<()> {
        let idx = self.live(handle)?;
        self.activate_idx(idx, what, ncalls);
        Ok(())
    }

    /// Make the loop return from `dispatch` at the next opportunity.
    ///
    /// That is before the next backend sleep, or between two callbacks if a
    /// drain is in progress. Events that were already active stay so and run
    /// in the next `dispatch`.
    pub fn break_now(&mut self) {
        self.brk = true;
    }

    /// Terminate the dispatch after the given time passes (or on the next
    /// iteration when no time is given).
    ///
    /// Just a one-shot timer with a callback flipping the termination flag,
    /// so it takes a slot in the event count like any other timer.
    pub fn exit_after(&mut self, after: Option<Duration>) -> Result<()> {
        self.once(None, EventSet::timeout(), |l: &mut Loop, _| l.gotterm = true, after)
    }

    /// Install a callback consulted whenever the signal flag was raised.
    ///
    /// It runs between backend calls, before anything else in the iteration.
    /// If it returns an error, `dispatch` aborts with
    /// [Interrupted](error/enum.Error.html).
    pub fn signal_callback_set(&mut self, callback: Option<Box<FnMut() -> Result<()>>>) {
        self.sig_callback = callback;
    }

    /// Run the event at most once and throw it away afterwards.
    ///
    /// Either an fd interest (with an optional timeout bound) or a pure
    /// timeout. Signal one-shots are refused: a signal event deleting itself
    /// from its own callback is something not every mechanism survives, so
    /// signal lifetimes stay in the caller's hands.
    pub fn once<F>(&mut self, fd: Option<RawFd>, what: EventSet, f: F, timeout: Option<Duration>) -> Result<()>
        where F: FnOnce(&mut Loop, EventSet) + 'static
    {
        if what.is_signal() {
            return Err(Error::Unsupported);
        }
        let mut f = Some(f);
        let callback = move |l: &mut Loop, handle: Handle, res: EventSet| {
            if let Some(f) = f.take() {
                f(l, res);
            }
            let _ = l.unregister(handle);
        };
        let io = what & (EventSet::readable() | EventSet::writable());
        let (event, timeout) = if !io.is_empty() {
            let fd = match fd {
                Some(fd) => fd,
                None => return Err(Error::Unsupported),
            };
            (Event::io(fd, io, callback), timeout)
        } else if what.is_timeout() {
            // No timeout means firing on the next iteration
            let timeout = timeout.unwrap_or(Duration::new(0, 0));
            (Event::timer(callback), Some(timeout))
        } else {
            return Err(Error::Unsupported);
        };
        let handle = self.register(event);
        if let Err(err) = self.add(handle, timeout) {
            let _ = self.unregister(handle);
            return Err(err);
        }
        Ok(())
    }

    /// Run the dispatch cycle.
    ///
    /// Waits for events, runs the due callbacks and repeats, until asked to
    /// stop ([break_now](#method.break_now), [exit_after](#method.exit_after))
    /// or until nothing is left to wait for. With
    /// [once](struct.DispatchFlags.html#method.once) it returns after one
    /// productive drain of the active queue, with
    /// [nonblock](struct.DispatchFlags.html#method.nonblock) it never sleeps
    /// in the backend.
    pub fn dispatch(&mut self, flags: DispatchFlags) -> Result<Exit> {
        self.tv_cache = None;
        let mut done = false;
        while !done {
            if self.gotterm {
                self.gotterm = false;
                break;
            }
            if self.brk {
                self.brk = false;
                break;
            }
            while signals::take_flag() {
                if let Some(mut callback) = self.sig_callback.take() {
                    let res = callback();
                    self.sig_callback = Some(callback);
                    if res.is_err() {
                        return Err(Error::Interrupted);
                    }
                }
            }
            self.timeout_correct();
            // With work already queued (or when asked not to block), just
            // poll; otherwise sleep at most until the nearest deadline.
            let deadline = if self.has_active() || flags.is_nonblock() {
                Some(Duration::new(0, 0))
            } else {
                self.timeout_next()
            };
            if self.event_count == 0 && !self.has_active() {
                debug!("dispatch: no events registered");
                return Ok(Exit::Empty);
            }
            self.event_tv = self.now();
            self.tv_cache = None;
            let mut ready = replace(&mut self.ready, Vec::new());
            ready.clear();
            let res = self.backend.dispatch(deadline, &mut ready);
            if let Err(err) = res {
                self.ready = ready;
                return Err(err);
            }
            for i in 0..ready.len() {
                let (token, what) = ready[i];
                self.activate_token(token, what);
            }
            self.ready = ready;
            self.tv_cache = Some(self.clock.read());
            self.timeout_process();
            if self.has_active() {
                self.process_active();
                if flags.is_once() && !self.brk && !self.gotterm {
                    done = true;
                }
            } else if flags.is_nonblock() {
                done = true;
            }
        }
        self.tv_cache = None;
        debug!("dispatch: asked to terminate loop");
        Ok(Exit::Normal)
    }

    /// Rebuild the backend state, to be called in the child after a fork.
    ///
    /// The old backend is torn down and a fresh one set up, with every
    /// inserted event re-registered. Scheduled timeouts and active events
    /// are untouched. The signal wakeup plumbing is always rebuilt, whether
    /// or not the mechanism itself would need it; the pipe is shared with
    /// the parent either way.
    pub fn reinit(&mut self) -> Result<()> {
        if let Some(idx) = self.signals.wakeup.take() {
            // Pruned without the usual deletion side-effects; there is no
            // point talking to the backend we are about to throw away.
            if self.events.valid(idx) {
                if self.events[idx].active {
                    self.queue_remove_active(idx);
                }
                self.events[idx].inserted = false;
                self.registered.remove(&idx);
                self.events.release(idx);
            }
        }
        self.signals.repipe()?;
        self.backend = backend::select()?;
        let mut res = Ok(());
        let registered: Vec<usize> = self.registered.keys().cloned().collect();
        for idx in registered {
            let (target, interest) = {
                let ev = &self.events[idx];
                (ev.target, ev.interest)
            };
            if let Target::Fd(fd) = target {
                if let Err(err) = self.backend.add(fd, idx, interest) {
                    res = Err(err);
                }
            }
        }
        if self.signals.has_recipients() {
            self.wakeup_register()?;
        }
        res
    }

    fn live(&self, handle: Handle) -> Result<usize> {
        if self.events.contains(handle) {
            Ok(handle.idx())
        } else {
            Err(Error::Missing)
        }
    }

    fn has_active(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
    }

    /// Zero a callback sequence in flight, if there is one.
    fn callback_abort(&mut self, idx: usize) {
        let ev = &mut self.events[idx];
        if ev.ncalls != 0 {
            if let Some(cell) = ev.pncalls.as_ref().and_then(|weak| weak.upgrade()) {
                cell.set(0);
            }
        }
    }

    fn del_idx(&mut self, idx: usize) -> Result<()> {
        self.callback_abort(idx);
        if self.events[idx].queued_timeout {
            self.queue_remove_timeout(idx);
        }
        if self.events[idx].active {
            self.queue_remove_active(idx);
        }
        if self.events[idx].inserted {
            self.queue_remove_inserted(idx);
            let (target, interest) = {
                let ev = &self.events[idx];
                (ev.target, ev.interest)
            };
            return match target {
                Target::Fd(fd) => self.backend.del(fd, idx, interest),
                Target::Sig(signal) => self.signals.unsubscribe(signal, idx),
                Target::Timer => Ok(()),
            };
        }
        Ok(())
    }

    fn activate_idx(&mut self, idx: usize, what: EventSet, ncalls: u16) {
        if self.events[idx].active {
            // Triggers arriving between two drains collapse into one
            // callback with the union of the causes
            self.events[idx].res |= what;
            return;
        }
        {
            let ev = &mut self.events[idx];
            ev.res = what;
            ev.ncalls = ncalls;
            ev.pncalls = None;
        }
        self.queue_insert_active(idx);
    }

    fn activate_token(&mut self, token: usize, what: EventSet) {
        if Some(token) == self.signals.wakeup {
            self.signal_process();
            return;
        }
        if !self.events.valid(token) {
            // The event went away while its readiness was in flight
            return;
        }
        self.activate_idx(token, what, 1);
    }

    fn signal_process(&mut self) {
        for (idx, ncalls) in self.signals.collect() {
            if self.events.valid(idx) {
                self.activate_idx(idx, EventSet::signal(), ncalls);
            }
        }
    }

    /// Put the internal event watching the wakeup pipe in place.
    fn wakeup_register(&mut self) -> Result<()> {
        if self.signals.wakeup.is_some() {
            return Ok(());
        }
        let fd = self.signals.read_fd();
        let handle = self.events.insert(EvHolder {
            target: Target::Fd(fd),
            interest: EventSet::readable() | EventSet::persist(),
            // Never invoked, wakeup readiness is intercepted in the loop
            callback: Some(Box::new(|_, _, _| ())),
            pri: 0,
            inserted: false,
            active: false,
            queued_timeout: false,
            internal: true,
            deadline: Duration::new(0, 0),
            res: EventSet::empty(),
            ncalls: 0,
            pncalls: None,
        });
        let idx = handle.idx();
        if let Err(err) = self.backend.add(fd, idx, EventSet::readable()) {
            self.events.remove(handle);
            return Err(err);
        }
        self.queue_insert_inserted(idx);
        self.signals.wakeup = Some(idx);
        Ok(())
    }

    /// Compensate for a wall clock that moved backwards.
    fn timeout_correct(&mut self) {
        if self.clock.is_monotonic() {
            return;
        }
        let now = self.now();
        if now >= self.event_tv {
            self.event_tv = now;
            return;
        }
        debug!("time is running backwards, corrected");
        let off = self.event_tv - now;
        self.heap.shift_back(off);
        self.event_tv = now;
    }

    /// How long may the backend sleep? `None` means no limit.
    fn timeout_next(&self) -> Option<Duration> {
        self.heap.peek().map(|(when, _)| {
            let now = self.now();
            if when <= now {
                Duration::new(0, 0)
            } else {
                when - now
            }
        })
    }

    /// Move all due timers onto the active queues.
    fn timeout_process(&mut self) {
        if self.heap.is_empty() {
            return;
        }
        let now = self.now();
        while let Some((when, idx)) = self.heap.peek() {
            if when > now {
                break;
            }
            // Out of every queue first, including the heap itself
            let _ = self.del_idx(idx);
            trace!("timeout_process: event {} is due", idx);
            self.activate_idx(idx, EventSet::timeout(), 1);
        }
    }

    /// Run the callbacks of the most urgent non-empty queue.
    ///
    /// Exactly one priority level is drained per iteration. Lower levels
    /// only get their turn in iterations where all higher ones are empty;
    /// the starvation is part of the contract.
    fn process_active(&mut self) {
        let pri = match self.queues.iter().position(|q| !q.is_empty()) {
            Some(pri) => pri,
            None => return,
        };
        loop {
            let idx = match self.queues[pri].front() {
                Some(&idx) => idx,
                None => break,
            };
            if self.events[idx].callback.is_none() {
                // Its callback already runs somewhere up the stack (we got
                // here from a nested dispatch). Leave it queued for the
                // outer drain.
                return;
            }
            if self.events[idx].interest.is_persist() {
                self.queue_remove_active(idx);
            } else {
                let _ = self.del_idx(idx);
            }
            let handle = match self.events.handle_at(idx) {
                Some(handle) => handle,
                None => continue,
            };
            // The drain owns the remaining-call counter; the event keeps a
            // weak link so del or re-add can zero it under us.
            let ncalls = Rc::new(Cell::new(self.events[idx].ncalls));
            self.events[idx].pncalls = Some(Rc::downgrade(&ncalls));
            while ncalls.get() > 0 {
                ncalls.set(ncalls.get() - 1);
                let (mut callback, res) = {
                    if !self.events.contains(handle) {
                        break;
                    }
                    let ev = &mut self.events[idx];
                    ev.ncalls = ncalls.get();
                    match ev.callback.take() {
                        Some(callback) => (callback, ev.res),
                        None => break,
                    }
                };
                callback(self, handle, res);
                if self.events.contains(handle) && self.events[idx].callback.is_none() {
                    self.events[idx].callback = Some(callback);
                }
                if signals::flag_raised() || self.brk {
                    if self.events.contains(handle) {
                        self.events[idx].pncalls = None;
                    }
                    return;
                }
            }
            if self.events.contains(handle) {
                self.events[idx].pncalls = None;
            }
        }
    }

    fn counted(ev: &EvHolder) -> bool {
        !ev.internal && (ev.inserted || ev.queued_timeout)
    }

    fn queue_insert_inserted(&mut self, idx: usize) {
        assert!(!self.events[idx].inserted);
        let was = Loop::counted(&self.events[idx]);
        self.events[idx].inserted = true;
        if !was && Loop::counted(&self.events[idx]) {
            self.event_count += 1;
        }
        self.registered.insert(idx, ());
    }

    fn queue_remove_inserted(&mut self, idx: usize) {
        assert!(self.events[idx].inserted);
        let was = Loop::counted(&self.events[idx]);
        self.events[idx].inserted = false;
        if was && !Loop::counted(&self.events[idx]) {
            self.event_count -= 1;
        }
        self.registered.remove(&idx);
    }

    fn queue_insert_timeout(&mut self, idx: usize) {
        assert!(!self.events[idx].queued_timeout);
        let was = Loop::counted(&self.events[idx]);
        self.events[idx].queued_timeout = true;
        if !was && Loop::counted(&self.events[idx]) {
            self.event_count += 1;
        }
        let deadline = self.events[idx].deadline;
        self.heap.push(deadline, idx);
    }

    fn queue_remove_timeout(&mut self, idx: usize) {
        assert!(self.events[idx].queued_timeout);
        let was = Loop::counted(&self.events[idx]);
        self.events[idx].queued_timeout = false;
        if was && !Loop::counted(&self.events[idx]) {
            self.event_count -= 1;
        }
        self.heap.erase(idx);
    }

    fn queue_insert_active(&mut self, idx: usize) {
        if self.events[idx].active {
            return;
        }
        self.events[idx].active = true;
        if !self.events[idx].internal {
            self.event_count_active += 1;
        }
        let pri = self.events[idx].pri;
        self.queues[pri].push_back(idx);
    }

    fn queue_remove_active(&mut self, idx: usize) {
        assert!(self.events[idx].active);
        self.events[idx].active = false;
        if !self.events[idx].internal {
            self.event_count_active -= 1;
        }
        let pri = self.events[idx].pri;
        if let Some(pos) = self.queues[pri].iter().position(|&i| i == idx) {
            self.queues[pri].remove(pos);
        }
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        if self.event_count > 0 {
            debug!("{} events were still set in the loop", self.event_count);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::{Duration, Instant, SystemTime};

    use nix::unistd;

    use super::*;
    use clock::Clock;
    use error::Error;
    use mask::{DispatchFlags, EventSet};

    macro_rules! err {
        ($result:expr, $err: pat) => (assert!(match $result { Err($err) => true, _ => false }))
    }

    fn counter() -> (Rc<Cell<usize>>, Rc<Cell<usize>>) {
        let c = Rc::new(Cell::new(0));
        (c.clone(), c)
    }

    /// A single 50ms timer fires exactly once, with a timeout result.
    #[test]
    fn pure_timer() {
        let mut l = Loop::new().unwrap();
        let (fired, f) = counter();
        let handle = l.register(Event::timer(move |_, _, res| {
            assert!(res.is_timeout());
            f.set(f.get() + 1);
        }));
        l.add(handle, Some(Duration::from_millis(50))).unwrap();
        assert_eq!(1, l.event_count());
        assert_eq!(Exit::Normal, l.dispatch(DispatchFlags::once()).unwrap());
        assert_eq!(1, fired.get());
        assert!(l.heap.is_empty());
        assert_eq!(0, l.event_count());
        // Quiescent, but still registered
        assert!(l.alive(handle));
    }

    /// Strict priorities: a busy priority 0 starves priority 1, by design.
    #[test]
    fn starvation() {
        let mut l = Loop::new().unwrap();
        l.priorities_set(2).unwrap();
        let (high_fired, hf) = counter();
        let (low_fired, lf) = counter();
        let high = l.register(Event::timer(move |l: &mut Loop, handle, _| {
            hf.set(hf.get() + 1);
            // Re-schedule ourselves right away
            l.add(handle, Some(Duration::new(0, 0))).unwrap();
        }));
        l.priority_set(high, 0).unwrap();
        let low = l.register(Event::timer(move |_, _, _| lf.set(lf.get() + 1)));
        l.priority_set(low, 1).unwrap();
        l.add(high, Some(Duration::new(0, 0))).unwrap();
        l.activate(low, EventSet::timeout(), 1).unwrap();
        for _ in 0..10 {
            l.dispatch(DispatchFlags::once()).unwrap();
        }
        assert_eq!(10, high_fired.get());
        assert_eq!(0, low_fired.get());
    }

    /// A non-persistent read event may delete itself from its own callback.
    #[test]
    fn self_delete() {
        let mut l = Loop::new().unwrap();
        let (read_fd, write_fd) = unistd::pipe().unwrap();
        let (fired, f) = counter();
        let handle = l.register(Event::io(read_fd, EventSet::readable(), move |l: &mut Loop, handle, res| {
            assert!(res.is_readable());
            f.set(f.get() + 1);
            // The drain already removed us, this must be a clean no-op
            l.del(handle).unwrap();
            l.unregister(handle).unwrap();
        }));
        l.add(handle, None).unwrap();
        assert_eq!(1, l.event_count());
        unistd::write(write_fd, b"x").unwrap();
        l.dispatch(DispatchFlags::once()).unwrap();
        assert_eq!(1, fired.get());
        assert_eq!(0, l.event_count());
        assert!(!l.alive(handle));
        let _ = unistd::close(read_fd);
        let _ = unistd::close(write_fd);
    }

    /// A persistent timer re-adding itself from the callback replaces the
    /// deadline without leaking heap slots.
    #[test]
    fn rearm_in_callback() {
        let mut l = Loop::new().unwrap();
        let (fired, f) = counter();
        let handle = l.register(Event::timer(move |l: &mut Loop, handle, _| {
            f.set(f.get() + 1);
            if f.get() < 3 {
                l.add(handle, Some(Duration::from_millis(1))).unwrap();
            }
        }).persist());
        l.add(handle, Some(Duration::from_millis(1))).unwrap();
        assert_eq!(1, l.heap.len());
        while fired.get() < 3 {
            l.dispatch(DispatchFlags::once()).unwrap();
            assert!(l.heap.len() <= 1);
        }
        assert_eq!(0, l.heap.len());
        assert_eq!(3, fired.get());
    }

    /// Re-arming an event that already fired on a timeout pulls it back out
    /// of the active queue and aborts its pending run.
    #[test]
    fn rearm_other_active() {
        let mut l = Loop::new().unwrap();
        l.priorities_set(2).unwrap();
        let (b_fired, bf) = counter();
        let b = l.register(Event::timer(move |_, _, _| bf.set(bf.get() + 1)));
        l.priority_set(b, 1).unwrap();
        let a = l.register(Event::timer(move |l: &mut Loop, _, _| {
            l.add(b, Some(Duration::from_secs(100))).unwrap();
        }));
        l.priority_set(a, 0).unwrap();
        // b already "fired" on a timeout, a runs first and re-arms it
        l.activate(b, EventSet::timeout(), 1).unwrap();
        l.add(a, Some(Duration::new(0, 0))).unwrap();
        l.dispatch(DispatchFlags::once()).unwrap();
        assert_eq!(0, b_fired.get());
        assert!(!l.events[b.idx()].active);
        assert!(l.heap.contains(b.idx()));
        assert_eq!(1, l.event_count());
    }

    /// With a non-monotonic clock, a backwards jump shifts the deadlines so
    /// relative waits stay intact.
    #[test]
    fn clock_jump_back() {
        let time = Rc::new(Cell::new(Duration::from_secs(1000)));
        let mut l = Loop::with_clock(Clock::Manual(time.clone())).unwrap();
        let (fired, f) = counter();
        let handle = l.register(Event::timer(move |_, _, _| f.set(f.get() + 1)));
        l.add(handle, Some(Duration::from_millis(100))).unwrap();
        // Prime the last-wait timestamp
        l.dispatch(DispatchFlags::nonblock()).unwrap();
        assert_eq!(0, fired.get());
        // The clock jumps back a whole second
        time.set(Duration::from_secs(999));
        l.dispatch(DispatchFlags::nonblock()).unwrap();
        assert_eq!(0, fired.get());
        // 100ms of simulated time later the timer is due; without the
        // correction it would sleep out the whole extra second
        time.set(Duration::from_secs(999) + Duration::from_millis(100));
        l.dispatch(DispatchFlags::nonblock()).unwrap();
        assert_eq!(1, fired.get());
    }

    /// break_now in a callback stops the drain before the next event runs.
    #[test]
    fn break_mid_drain() {
        let mut l = Loop::new().unwrap();
        let (first_fired, ff) = counter();
        let (second_fired, sf) = counter();
        let first = l.register(Event::timer(move |l: &mut Loop, _, _| {
            ff.set(ff.get() + 1);
            l.break_now();
        }));
        let second = l.register(Event::timer(move |_, _, _| sf.set(sf.get() + 1)));
        l.activate(first, EventSet::timeout(), 1).unwrap();
        l.activate(second, EventSet::timeout(), 1).unwrap();
        assert_eq!(Exit::Normal, l.dispatch(DispatchFlags::empty()).unwrap());
        assert_eq!(1, first_fired.get());
        assert_eq!(0, second_fired.get());
        // The second one survived and runs in the next dispatch
        assert_eq!(Exit::Normal, l.dispatch(DispatchFlags::once()).unwrap());
        assert_eq!(1, second_fired.get());
    }

    /// add and del return the event to where it started, del on a quiescent
    /// event is a no-op and re-adding replaces the timeout in place.
    #[test]
    fn add_del_round_trip() {
        let mut l = Loop::new().unwrap();
        let (read_fd, write_fd) = unistd::pipe().unwrap();
        let handle = l.register(Event::io(read_fd, EventSet::readable(), |_, _, _| ()));
        l.del(handle).unwrap();
        assert_eq!(0, l.event_count());
        l.add(handle, Some(Duration::from_secs(10))).unwrap();
        assert_eq!(1, l.event_count());
        assert_eq!(1, l.heap.len());
        // Replacing the timeout doesn't grow the heap or the count
        l.add(handle, Some(Duration::from_secs(20))).unwrap();
        assert_eq!(1, l.heap.len());
        assert_eq!(1, l.event_count());
        l.del(handle).unwrap();
        assert_eq!(0, l.event_count());
        assert!(l.heap.is_empty());
        assert!(l.alive(handle));
        let _ = unistd::close(read_fd);
        let _ = unistd::close(write_fd);
    }

    /// pending reports what the event waits for, with the deadline mapped to
    /// wall time.
    #[test]
    fn pending_reports() {
        let mut l = Loop::new().unwrap();
        let (read_fd, write_fd) = unistd::pipe().unwrap();
        let handle = l.register(Event::io(
            read_fd,
            EventSet::readable() | EventSet::persist(),
            |_, _, _| (),
        ));
        let everything = EventSet::readable() | EventSet::writable() | EventSet::timeout();
        let (flags, deadline) = l.pending(handle, everything).unwrap();
        assert!(flags.is_empty());
        assert!(deadline.is_none());
        l.add(handle, Some(Duration::from_secs(5))).unwrap();
        let (flags, deadline) = l.pending(handle, everything).unwrap();
        assert!(flags.is_readable());
        assert!(!flags.is_writable());
        assert!(flags.is_timeout());
        let remaining = deadline.unwrap().duration_since(SystemTime::now()).unwrap();
        assert!(remaining <= Duration::from_secs(5));
        assert!(remaining >= Duration::from_secs(4));
        let _ = unistd::close(read_fd);
        let _ = unistd::close(write_fd);
    }

    /// Priority plumbing: defaults, range checks and the active refusals.
    #[test]
    fn priorities() {
        let mut l = Loop::new().unwrap();
        let handle = l.register(Event::timer(|_, _, _| ()));
        // A single level by default, so there is nowhere to move
        err!(l.priority_set(handle, 1), Error::BadPriority);
        l.priorities_set(4).unwrap();
        // New events land in the middle
        let other = l.register(Event::timer(|_, _, _| ()));
        assert_eq!(2, l.events[other.idx()].pri);
        l.priority_set(handle, 3).unwrap();
        l.activate(handle, EventSet::timeout(), 1).unwrap();
        err!(l.priority_set(handle, 1), Error::Active);
        err!(l.priorities_set(2), Error::Active);
    }

    /// Operations on a stale handle answer Missing.
    #[test]
    fn missing() {
        let mut l = Loop::new().unwrap();
        let handle = l.register(Event::timer(|_, _, _| ()));
        l.unregister(handle).unwrap();
        err!(l.add(handle, None), Error::Missing);
        err!(l.del(handle), Error::Missing);
        err!(l.pending(handle, EventSet::timeout()), Error::Missing);
        err!(l.activate(handle, EventSet::timeout(), 1), Error::Missing);
        err!(l.unregister(handle), Error::Missing);
        assert!(!l.alive(handle));
    }

    /// A one-shot timer cleans up after itself.
    #[test]
    fn once_timer() {
        let mut l = Loop::new().unwrap();
        let (fired, f) = counter();
        l.once(None, EventSet::timeout(), move |_, res| {
            assert!(res.is_timeout());
            f.set(f.get() + 1);
        }, Some(Duration::from_millis(1))).unwrap();
        assert_eq!(1, l.event_count());
        l.dispatch(DispatchFlags::once()).unwrap();
        assert_eq!(1, fired.get());
        assert_eq!(0, l.event_count());
        assert!(l.events.is_empty());
    }

    /// A one-shot read fires once and goes away.
    #[test]
    fn once_io() {
        let mut l = Loop::new().unwrap();
        let (read_fd, write_fd) = unistd::pipe().unwrap();
        let (fired, f) = counter();
        unistd::write(write_fd, b"x").unwrap();
        l.once(Some(read_fd), EventSet::readable(), move |_, res| {
            assert!(res.is_readable());
            f.set(f.get() + 1);
        }, None).unwrap();
        l.dispatch(DispatchFlags::once()).unwrap();
        assert_eq!(1, fired.get());
        assert!(l.events.is_empty());
        let _ = unistd::close(read_fd);
        let _ = unistd::close(write_fd);
    }

    /// Signal one-shots are refused.
    #[test]
    fn once_signal_refused() {
        let mut l = Loop::new().unwrap();
        err!(l.once(None, EventSet::signal(), |_, _| (), None), Error::Unsupported);
        err!(l.once(None, EventSet::empty(), |_, _| (), None), Error::Unsupported);
    }

    /// exit_after terminates a loop that would otherwise run forever.
    #[test]
    fn exit_after_stops() {
        let mut l = Loop::new().unwrap();
        let (fired, f) = counter();
        let busy = l.register(Event::timer(move |l: &mut Loop, handle, _| {
            f.set(f.get() + 1);
            l.add(handle, Some(Duration::from_millis(1))).unwrap();
        }));
        l.add(busy, Some(Duration::from_millis(1))).unwrap();
        l.exit_after(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(Exit::Normal, l.dispatch(DispatchFlags::empty()).unwrap());
        assert!(fired.get() > 0);
    }

    /// nonblock polls instead of sleeping out the pending timer.
    #[test]
    fn nonblock_returns() {
        let mut l = Loop::new().unwrap();
        let handle = l.register(Event::timer(|_, _, _| ()));
        l.add(handle, Some(Duration::from_secs(10))).unwrap();
        let started = Instant::now();
        assert_eq!(Exit::Normal, l.dispatch(DispatchFlags::nonblock()).unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(1, l.event_count());
    }

    /// An empty loop reports it has nothing to do.
    #[test]
    fn empty() {
        let mut l = Loop::new().unwrap();
        assert_eq!(Exit::Empty, l.dispatch(DispatchFlags::empty()).unwrap());
    }

    /// Multiple activations before the drain collapse into one callback
    /// carrying the union of the causes.
    #[test]
    fn activate_coalesce() {
        let mut l = Loop::new().unwrap();
        let (fired, f) = counter();
        let handle = l.register(Event::timer(move |_, _, res| {
            assert!(res.is_readable());
            assert!(res.is_writable());
            f.set(f.get() + 1);
        }));
        l.activate(handle, EventSet::readable(), 1).unwrap();
        l.activate(handle, EventSet::writable(), 1).unwrap();
        l.dispatch(DispatchFlags::once()).unwrap();
        assert_eq!(1, fired.get());
    }

    /// An activation with several calls runs the callback repeatedly and a
    /// del from inside aborts the rest of the sequence.
    #[test]
    fn ncalls_abort() {
        let mut l = Loop::new().unwrap();
        let (fired, f) = counter();
        let handle = l.register(Event::timer(move |l: &mut Loop, handle, _| {
            f.set(f.get() + 1);
            if f.get() == 2 {
                l.del(handle).unwrap();
            }
        }));
        l.activate(handle, EventSet::timeout(), 5).unwrap();
        l.dispatch(DispatchFlags::once()).unwrap();
        assert_eq!(2, fired.get());
    }

    /// A persistent read event keeps firing without re-adding.
    #[test]
    fn persist_io() {
        let mut l = Loop::new().unwrap();
        let (read_fd, write_fd) = unistd::pipe().unwrap();
        let (fired, f) = counter();
        let handle = l.register(Event::io(
            read_fd,
            EventSet::readable() | EventSet::persist(),
            move |_, _, _| {
                let mut buf = [0u8; 1];
                unistd::read(read_fd, &mut buf).unwrap();
                f.set(f.get() + 1);
            },
        ));
        l.add(handle, None).unwrap();
        unistd::write(write_fd, b"x").unwrap();
        l.dispatch(DispatchFlags::once()).unwrap();
        assert_eq!(1, fired.get());
        assert_eq!(1, l.event_count());
        unistd::write(write_fd, b"y").unwrap();
        l.dispatch(DispatchFlags::once()).unwrap();
        assert_eq!(2, fired.get());
        assert_eq!(1, l.event_count());
        l.del(handle).unwrap();
        let _ = unistd::close(read_fd);
        let _ = unistd::close(write_fd);
    }

    /// reinit rebuilds the backend but keeps the registered events working
    /// and the scheduled timers scheduled.
    #[test]
    fn reinit_keeps_events() {
        let mut l = Loop::new().unwrap();
        let (read_fd, write_fd) = unistd::pipe().unwrap();
        let (fired, f) = counter();
        let handle = l.register(Event::io(
            read_fd,
            EventSet::readable() | EventSet::persist(),
            move |_, _, _| {
                let mut buf = [0u8; 1];
                unistd::read(read_fd, &mut buf).unwrap();
                f.set(f.get() + 1);
            },
        ));
        l.add(handle, None).unwrap();
        let timer = l.register(Event::timer(|_, _, _| ()));
        l.add(timer, Some(Duration::from_secs(100))).unwrap();
        assert_eq!(2, l.event_count());
        l.reinit().unwrap();
        assert_eq!(2, l.event_count());
        assert_eq!(1, l.heap.len());
        unistd::write(write_fd, b"x").unwrap();
        l.dispatch(DispatchFlags::once()).unwrap();
        assert_eq!(1, fired.get());
        let _ = unistd::close(read_fd);
        let _ = unistd::close(write_fd);
    }

    /// No event may sit in two active queues at once; re-activating while
    /// active only merges the result mask.
    #[test]
    fn single_queue_membership() {
        let mut l = Loop::new().unwrap();
        l.priorities_set(2).unwrap();
        let handle = l.register(Event::timer(|_, _, _| ()));
        l.activate(handle, EventSet::readable(), 1).unwrap();
        l.activate(handle, EventSet::writable(), 1).unwrap();
        let queued: usize = l.queues.iter().map(|q| q.len()).sum();
        assert_eq!(1, queued);
        assert_eq!(1, l.event_count_active());
    }
}
