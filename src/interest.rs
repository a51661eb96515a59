use std::ops;

/// Readiness/registration bitset.
///
/// Bit layout mirrors libevent's `event.h` (`EV_TIMEOUT|EV_READ|EV_WRITE|
/// EV_SIGNAL|EV_PERSIST|EV_ET`) so that the numeric values in traces and
/// `on_event` masks match the header this spec was distilled from. Two
/// extra bits (`CLOSE_DETECT`, `FINALIZE_SAFE`) are mio-style non-portable
/// extensions, named the way `mio-common`'s `Ready` names its own
/// unix-only extras (`ERROR`, `HUP`, `PRIORITY`).
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct EventFlags(u32);

impl EventFlags {
    pub const EMPTY: EventFlags = EventFlags(0);
    pub const TIMEOUT: EventFlags = EventFlags(0x01);
    pub const READ: EventFlags = EventFlags(0x02);
    pub const WRITE: EventFlags = EventFlags(0x04);
    pub const SIGNAL: EventFlags = EventFlags(0x08);
    pub const PERSIST: EventFlags = EventFlags(0x10);
    pub const EDGE_TRIGGERED: EventFlags = EventFlags(0x20);
    pub const CLOSE_DETECT: EventFlags = EventFlags(0x40);
    pub const FINALIZE_SAFE: EventFlags = EventFlags(0x80);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: EventFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn intersects(self, other: EventFlags) -> bool {
        (self.0 & other.0) != 0
    }

    pub fn is_readable(self) -> bool {
        self.intersects(EventFlags::READ)
    }

    pub fn is_writable(self) -> bool {
        self.intersects(EventFlags::WRITE)
    }

    pub fn remove(self, other: EventFlags) -> EventFlags {
        EventFlags(self.0 & !other.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl ops::BitOr for EventFlags {
    type Output = EventFlags;
    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: EventFlags) {
        self.0 |= rhs.0;
    }
}

impl ops::BitAnd for EventFlags {
    type Output = EventFlags;
    fn bitand(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 & rhs.0)
    }
}

impl std::fmt::Debug for EventFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.contains(EventFlags::TIMEOUT) {
            parts.push("TIMEOUT");
        }
        if self.contains(EventFlags::READ) {
            parts.push("READ");
        }
        if self.contains(EventFlags::WRITE) {
            parts.push("WRITE");
        }
        if self.contains(EventFlags::SIGNAL) {
            parts.push("SIGNAL");
        }
        if self.contains(EventFlags::PERSIST) {
            parts.push("PERSIST");
        }
        if self.contains(EventFlags::EDGE_TRIGGERED) {
            parts.push("ET");
        }
        if parts.is_empty() {
            parts.push("EMPTY");
        }
        write!(f, "{}", parts.join("|"))
    }
}
