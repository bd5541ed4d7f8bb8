extern crate evloop;
extern crate nix;

/**
 * Tests for signal delivery and the fork/reinit path. The usual test
 * harness runs tests on threads it owns, which signals interact with in
 * ways we can't control, so this runs as a plain program without the
 * harness. If anything here breaks, the whole thing just crashes, and
 * that's enough.
 */

use std::cell::Cell;
use std::process::exit;
use std::rc::Rc;

use nix::sys::signal::{raise, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};

use evloop::{DispatchFlags, Event, EventSet, Loop};

fn counter() -> (Rc<Cell<usize>>, Rc<Cell<usize>>) {
    let c = Rc::new(Cell::new(0));
    (c.clone(), c)
}

/// A signal event is persistent: it keeps firing without being re-added.
fn signal_delivery() {
    let mut l = Loop::new().unwrap();
    let (fired, f) = counter();
    let handle = l.register(Event::signal(Signal::SIGUSR1, move |_, _, res| {
        assert!(res.is_signal());
        f.set(f.get() + 1);
    }));
    l.add(handle, None).unwrap();
    assert_eq!(1, l.event_count());
    raise(Signal::SIGUSR1).unwrap();
    l.dispatch(DispatchFlags::once()).unwrap();
    assert_eq!(1, fired.get());
    raise(Signal::SIGUSR1).unwrap();
    l.dispatch(DispatchFlags::once()).unwrap();
    assert_eq!(2, fired.get());
    l.del(handle).unwrap();
    assert_eq!(0, l.event_count());
}

/// One signal reaches every event subscribed to it.
fn signal_broadcast() {
    let mut l = Loop::new().unwrap();
    let (fired, _) = counter();
    for _ in 0..3 {
        let f = fired.clone();
        let handle = l.register(Event::signal(Signal::SIGUSR2, move |_, _, _| {
            f.set(f.get() + 1);
        }));
        l.add(handle, None).unwrap();
    }
    assert_eq!(3, l.event_count());
    raise(Signal::SIGUSR2).unwrap();
    l.dispatch(DispatchFlags::once()).unwrap();
    assert_eq!(3, fired.get());
}

/// Signals coalesce, but the occurrence count survives: the callback runs
/// once per delivery even when they pile up before the loop looks.
fn signal_coalesce() {
    let mut l = Loop::new().unwrap();
    let (fired, f) = counter();
    let handle = l.register(Event::signal(Signal::SIGUSR1, move |_, _, _| {
        f.set(f.get() + 1);
    }));
    l.add(handle, None).unwrap();
    raise(Signal::SIGUSR1).unwrap();
    raise(Signal::SIGUSR1).unwrap();
    l.dispatch(DispatchFlags::once()).unwrap();
    assert_eq!(2, fired.get());
}

/// After a fork, reinit gives the child a working loop again, with the
/// signal plumbing rebuilt and all registered events still in place.
fn fork_reinit() {
    let mut l = Loop::new().unwrap();
    let (fired, f) = counter();
    let handle = l.register(Event::signal(Signal::SIGUSR2, move |_, _, _| {
        f.set(f.get() + 1);
    }));
    l.add(handle, None).unwrap();
    match fork() {
        Ok(ForkResult::Child) => {
            l.reinit().unwrap();
            raise(Signal::SIGUSR2).unwrap();
            l.dispatch(DispatchFlags::once()).unwrap();
            exit(if fired.get() == 1 { 42 } else { 1 });
        },
        Ok(ForkResult::Parent { child }) => {
            match waitpid(child, None).unwrap() {
                WaitStatus::Exited(_, code) => assert_eq!(42, code),
                status => panic!("child misbehaved: {:?}", status),
            }
        },
        Err(err) => panic!("not enough forks: {}", err),
    }
}

fn main() {
    signal_delivery();
    signal_broadcast();
    signal_coalesce();
    fork_reinit();
}
