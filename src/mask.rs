//! Small bit sets describing events and dispatch modes.
//!
//! These work much like mio's `Ready`. They are plain numbers inside, but
//! having distinct types keeps the interests, the trigger reports and the
//! dispatch flags from getting mixed up in the signatures.

use std::fmt::{self, Debug, Formatter};
use std::ops::{BitAnd, BitOr, BitOrAssign, Sub};

const TIMEOUT: u8 = 0x01;
const READ: u8 = 0x02;
const WRITE: u8 = 0x04;
const SIGNAL: u8 = 0x08;
const PERSIST: u8 = 0x10;

/// A set of things an event is interested in, or a set of things that
/// actually happened to it.
///
/// The same type serves both directions: the interests are passed in when
/// the event is created and a (possibly different) set arrives in the
/// callback, describing what triggered it. `persist` makes sense only on
/// the interest side and is never reported back.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventSet(u8);

impl EventSet {
    /// No interest at all. Pure timers start this way.
    pub fn empty() -> EventSet {
        EventSet(0)
    }
    /// A timeout expired.
    pub fn timeout() -> EventSet {
        EventSet(TIMEOUT)
    }
    /// The watched fd can be read.
    pub fn readable() -> EventSet {
        EventSet(READ)
    }
    /// The watched fd can be written.
    pub fn writable() -> EventSet {
        EventSet(WRITE)
    }
    /// A unix signal arrived.
    pub fn signal() -> EventSet {
        EventSet(SIGNAL)
    }
    /// Keep the event registered after it fires.
    ///
    /// Without this, the event is removed from the loop just before its
    /// callback runs and has to be added again to fire another time.
    pub fn persist() -> EventSet {
        EventSet(PERSIST)
    }
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
    pub fn is_timeout(self) -> bool {
        self.0 & TIMEOUT != 0
    }
    pub fn is_readable(self) -> bool {
        self.0 & READ != 0
    }
    pub fn is_writable(self) -> bool {
        self.0 & WRITE != 0
    }
    pub fn is_signal(self) -> bool {
        self.0 & SIGNAL != 0
    }
    pub fn is_persist(self) -> bool {
        self.0 & PERSIST != 0
    }
    /// Does this contain all the bits of the other set?
    pub fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }
    /// Do the two sets share at least one bit?
    pub fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }
    pub fn insert(&mut self, other: EventSet) {
        self.0 |= other.0;
    }
    pub fn remove(&mut self, other: EventSet) {
        self.0 &= !other.0;
    }
}

impl BitOr for EventSet {
    type Output = EventSet;
    fn bitor(self, other: EventSet) -> EventSet {
        EventSet(self.0 | other.0)
    }
}

impl BitOrAssign for EventSet {
    fn bitor_assign(&mut self, other: EventSet) {
        self.0 |= other.0;
    }
}

impl BitAnd for EventSet {
    type Output = EventSet;
    fn bitand(self, other: EventSet) -> EventSet {
        EventSet(self.0 & other.0)
    }
}

impl Sub for EventSet {
    type Output = EventSet;
    fn sub(self, other: EventSet) -> EventSet {
        EventSet(self.0 & !other.0)
    }
}

impl Debug for EventSet {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        let mut first = true;
        let names = [
            (TIMEOUT, "Timeout"),
            (READ, "Readable"),
            (WRITE, "Writable"),
            (SIGNAL, "Signal"),
            (PERSIST, "Persist"),
        ];
        for &(bit, name) in names.iter() {
            if self.0 & bit != 0 {
                if !first {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(fmt, "(empty)")?;
        }
        Ok(())
    }
}

const ONCE: u8 = 0x01;
const NONBLOCK: u8 = 0x02;

/// Modifiers of one `dispatch` invocation.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct DispatchFlags(u8);

impl DispatchFlags {
    /// Run until explicitly stopped or out of events.
    pub fn empty() -> DispatchFlags {
        DispatchFlags(0)
    }
    /// Return after one productive drain of the active queue.
    pub fn once() -> DispatchFlags {
        DispatchFlags(ONCE)
    }
    /// Never block inside the backend; poll and return.
    pub fn nonblock() -> DispatchFlags {
        DispatchFlags(NONBLOCK)
    }
    pub fn is_once(self) -> bool {
        self.0 & ONCE != 0
    }
    pub fn is_nonblock(self) -> bool {
        self.0 & NONBLOCK != 0
    }
}

impl BitOr for DispatchFlags {
    type Output = DispatchFlags;
    fn bitor(self, other: DispatchFlags) -> DispatchFlags {
        DispatchFlags(self.0 | other.0)
    }
}

impl Debug for DispatchFlags {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match (self.is_once(), self.is_nonblock()) {
            (false, false) => write!(fmt, "(default)"),
            (true, false) => write!(fmt, "Once"),
            (false, true) => write!(fmt, "Nonblock"),
            (true, true) => write!(fmt, "Once | Nonblock"),
        }
    }
}
