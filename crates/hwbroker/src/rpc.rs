//! RPC data types and constants.
//!
//! Every request starts with a one-byte [`Opcode`] followed by opcode-specific
//! fixed-width fields. Responses carry no opcode; their shape is implied by
//! the request they answer.

use std::fmt;

use enum_primitive::*;

/// Well-known TCP port the broker listens on.
pub const RPC_PORT: u16 = 54949;

/// Width of a serial on the wire, including the NUL terminator.
pub const SERIAL_LEN: usize = 7;

/// Default prefix for mailbox identities handed out by the broker.
pub const DEFAULT_MAILBOX_PREFIX: &str = "hwbroker";

/// `EventFilter.severity` value matching any severity.
pub const ANY_SEVERITY: u8 = 0xff;

/// Identity the server assigns to a connection at accept time.
pub type ClientId = u8;

/// Device-type identifier from the adapter library's catalog.
pub type DeviceType = u32;

/// Fixed-width, NUL padded serial as it travels on the wire.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Serial(pub [u8; SERIAL_LEN]);

impl Serial {
    /// Build a wire serial from a string, truncating to fit the terminator.
    pub fn new(serial: &str) -> Serial {
        let mut raw = [0u8; SERIAL_LEN];
        let len = serial.len().min(SERIAL_LEN - 1);
        raw[..len].copy_from_slice(&serial.as_bytes()[..len]);
        Serial(raw)
    }

    /// Whether every byte is zero.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// The serial up to its first NUL.
    pub fn as_string(&self) -> String {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(SERIAL_LEN);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial({:?})", self.as_string())
    }
}

/// Event record produced by the adapter library's event subsystem.
///
/// The broker only moves these records around, it never interprets them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Event {
    pub event_number: u32,
    pub severity: u8,
    pub serial: Serial,
    pub timestamp: u64,
}

/// Selects a subset of events for counting or discarding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventFilter {
    /// 0 matches any event number
    pub event_number: u32,
    /// [`ANY_SEVERITY`] matches any severity
    pub severity: u8,
    pub serial: Serial,
    /// Only compare `serial` when set
    pub match_serial: bool,
}

impl Default for EventFilter {
    fn default() -> Self {
        EventFilter {
            event_number: 0,
            severity: ANY_SEVERITY,
            serial: Serial::default(),
            match_serial: false,
        }
    }
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        (self.event_number == 0 || self.event_number == event.event_number)
            && (self.severity == ANY_SEVERITY || self.severity == event.severity)
            && (!self.match_serial || self.serial == event.serial)
    }
}

/// Mailbox identities of one bulk-transfer channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MailboxPair {
    /// Adapter to client direction; the client reads from it.
    pub reader: String,
    /// Client to adapter direction; the client writes into it.
    pub writer: String,
}

impl MailboxPair {
    /// Derive the identities for `serial` on connection `client`.
    pub fn derive(prefix: &str, serial: &str, client: ClientId) -> MailboxPair {
        MailboxPair {
            reader: format!("{prefix}-{serial}-o-{client}"),
            writer: format!("{prefix}-{serial}-i-{client}"),
        }
    }
}

enum_from_primitive! {
    #[doc = "Request opcode, the first byte of every request"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum Opcode {
        GetSupportedDevices = 0,
        FindAll,
        MailboxOpen,
        MailboxClose,
        DeviceOpen,
        DeviceGoOnline,
        DeviceGoOffline,
        DeviceClose,
        DeviceLock,
        DeviceUnlock,
        GetEvents,
        GetLastError,
        GetEventCount,
        DiscardEvents,
        GetEventLimit,
        SetEventLimit,
    }
}

impl Opcode {
    /// If the server writes a response for this opcode
    pub fn has_response(&self) -> bool {
        !matches!(*self, Opcode::DiscardEvents | Opcode::SetEventLimit)
    }
}

/// A decoded client request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    GetSupportedDevices,
    FindAll,
    MailboxOpen { serial: String },
    MailboxClose { serial: String },
    DeviceOpen { serial: String },
    DeviceGoOnline { serial: String },
    DeviceGoOffline { serial: String },
    DeviceClose { serial: String },
    DeviceLock { serial: String, max_duration_ms: i64 },
    DeviceUnlock { serial: String },
    GetEvents,
    GetLastError,
    GetEventCount { filter: EventFilter },
    DiscardEvents { filter: EventFilter },
    GetEventLimit,
    SetEventLimit { limit: u64 },
}

impl Request {
    /// The serial this request targets, if any.
    pub fn serial(&self) -> Option<&str> {
        use crate::Request::*;

        match self {
            MailboxOpen { serial }
            | MailboxClose { serial }
            | DeviceOpen { serial }
            | DeviceGoOnline { serial }
            | DeviceGoOffline { serial }
            | DeviceClose { serial }
            | DeviceLock { serial, .. }
            | DeviceUnlock { serial } => Some(serial),
            _ => None,
        }
    }
}

impl<'a> From<&'a Request> for Opcode {
    fn from(req: &'a Request) -> Opcode {
        match *req {
            Request::GetSupportedDevices => Opcode::GetSupportedDevices,
            Request::FindAll => Opcode::FindAll,
            Request::MailboxOpen { .. } => Opcode::MailboxOpen,
            Request::MailboxClose { .. } => Opcode::MailboxClose,
            Request::DeviceOpen { .. } => Opcode::DeviceOpen,
            Request::DeviceGoOnline { .. } => Opcode::DeviceGoOnline,
            Request::DeviceGoOffline { .. } => Opcode::DeviceGoOffline,
            Request::DeviceClose { .. } => Opcode::DeviceClose,
            Request::DeviceLock { .. } => Opcode::DeviceLock,
            Request::DeviceUnlock { .. } => Opcode::DeviceUnlock,
            Request::GetEvents => Opcode::GetEvents,
            Request::GetLastError => Opcode::GetLastError,
            Request::GetEventCount { .. } => Opcode::GetEventCount,
            Request::DiscardEvents { .. } => Opcode::DiscardEvents,
            Request::GetEventLimit => Opcode::GetEventLimit,
            Request::SetEventLimit { .. } => Opcode::SetEventLimit,
        }
    }
}

/// A response to one request. Which variant answers which opcode is fixed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// `GetSupportedDevices`
    SupportedDevices(Vec<DeviceType>),
    /// `FindAll`
    Serials(Vec<Serial>),
    /// `MailboxOpen`; `None` on failure
    MailboxOpened(Option<MailboxPair>),
    /// Every device operation and `MailboxClose`
    Status(bool),
    /// `GetEvents`
    Events(Vec<Event>),
    /// `GetLastError`
    LastError(Event),
    /// `GetEventCount`, `GetEventLimit`
    Count(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_is_truncated_and_terminated() {
        let s = Serial::new("ABCDEFGH");
        assert_eq!(s.as_string(), "ABCDEF");
        assert_eq!(s.0[SERIAL_LEN - 1], 0);
        assert_eq!(Serial::new("A1").as_string(), "A1");
    }

    #[test]
    fn opcode_from_primitive() {
        assert_eq!(Opcode::from_u8(0), Some(Opcode::GetSupportedDevices));
        assert_eq!(Opcode::from_u8(8), Some(Opcode::DeviceLock));
        assert_eq!(Opcode::from_u8(15), Some(Opcode::SetEventLimit));
        assert_eq!(Opcode::from_u8(16), None);
    }

    #[test]
    fn fire_and_forget_opcodes() {
        assert!(!Opcode::DiscardEvents.has_response());
        assert!(!Opcode::SetEventLimit.has_response());
        assert!(Opcode::DeviceLock.has_response());
    }

    #[test]
    fn mailbox_identities_are_distinct_per_connection() {
        let a = MailboxPair::derive("hwbroker", "A", 1);
        let b = MailboxPair::derive("hwbroker", "A", 2);
        assert_eq!(a.writer, "hwbroker-A-i-1");
        assert_eq!(a.reader, "hwbroker-A-o-1");
        assert_ne!(a.reader, a.writer);
        assert_ne!(a.reader, b.reader);
    }

    #[test]
    fn event_filter_matching() {
        let event = Event {
            event_number: 7,
            severity: 2,
            serial: Serial::new("A"),
            timestamp: 1,
        };
        assert!(EventFilter::default().matches(&event));
        let by_serial = EventFilter {
            serial: Serial::new("B"),
            match_serial: true,
            ..Default::default()
        };
        assert!(!by_serial.matches(&event));
        let by_number = EventFilter {
            event_number: 7,
            severity: 2,
            ..Default::default()
        };
        assert!(by_number.matches(&event));
    }
}
