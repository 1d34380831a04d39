//! Error type shared by every layer of the broker.

use std::io;

use thiserror::Error;

/// Errors produced by the broker.
///
/// State-consistency variants are reported back to the client as a failed
/// result and never end the connection. `Io` and `Protocol` end it.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no device context for serial '{0}'")]
    UnknownSerial(String),

    #[error("client {0} already opened the device")]
    AlreadyOpen(u8),

    #[error("client {0} has not opened the device")]
    NotOpen(u8),

    #[error("client {0} already brought the device online")]
    AlreadyOnline(u8),

    #[error("client {0} has not brought the device online")]
    NotOnline(u8),

    #[error("mailbox '{0}' is already registered")]
    DuplicateRegistration(String),

    #[error("mailbox '{0}' is not registered")]
    NotRegistered(String),

    #[error("a bulk channel for serial '{0}' is already open on this connection")]
    DuplicateChannel(String),

    #[error("no bulk channel for serial '{0}' on this connection")]
    NoChannel(String),

    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("mailbox '{0}' is closed")]
    MailboxClosed(String),

    #[error("mailbox '{0}' already exists")]
    MailboxExists(String),

    #[error("mailbox '{0}' does not exist")]
    MailboxNotFound(String),

    #[error("payload of {len} bytes exceeds frame capacity {capacity}")]
    FrameTooLarge { len: usize, capacity: usize },

    #[error("mailbox stayed full for {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("incomplete chunked message: expected {expected} bytes, received {received}")]
    IncompleteMessage { expected: usize, received: usize },

    #[error("message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("timed lock has been stopped")]
    LockStopped,

    #[error("all client identities are in use")]
    NoClientIds,
}

impl Error {
    /// Whether the error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Protocol(_))
    }
}
