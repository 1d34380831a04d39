//! Interprocess mailboxes.
//!
//! A mailbox is a one-writer/one-reader byte channel whose messages are
//! frames of at most [`Mailbox::frame_capacity`] payload bytes. Each frame
//! carries a length field next to its payload; the relay uses that field to
//! announce the true size of a message that spans several frames.

pub mod local;

pub use self::local::LocalMailboxes;

use {
    crate::utils::Result,
    async_trait::async_trait,
    bytes::Bytes,
    std::{sync::Arc, time::Duration},
};

/// One frame read from a mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Length field as written by the sender.
    pub length: u32,
    pub payload: Bytes,
}

/// Endpoint of an interprocess mailbox.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Name the mailbox was opened under.
    fn id(&self) -> &str;

    /// Maximum payload of a single frame.
    fn frame_capacity(&self) -> usize;

    /// Write one frame.
    ///
    /// Returns `Ok(false)` if the mailbox stayed full for `timeout`, and
    /// `Error::MailboxClosed` once the mailbox has been torn down.
    async fn write(&self, length: u32, payload: &[u8], timeout: Duration) -> Result<bool>;

    /// Read one frame, or `Ok(None)` if nothing arrived within `timeout`.
    async fn read(&self, timeout: Duration) -> Result<Option<Frame>>;

    fn is_closed(&self) -> bool;

    /// Tear the mailbox down, waking any blocked reader or writer.
    fn close(&self);
}

/// Opens mailbox endpoints by name.
#[async_trait]
pub trait MailboxProvider: Send + Sync {
    /// Open the mailbox named `id`. With `create` set the caller owns the
    /// mailbox and it must not already exist.
    async fn open(&self, id: &str, create: bool) -> Result<Arc<dyn Mailbox>>;
}
