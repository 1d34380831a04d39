//! In-process mailboxes.
//!
//! Honours the mailbox contract with a bounded frame queue per name. Useful
//! when the broker and its clients share a process, and as the mailbox
//! transport in tests.

use {
    super::{Frame, Mailbox, MailboxProvider},
    crate::{error::Error, utils::Result},
    async_trait::async_trait,
    bytes::Bytes,
    log::debug,
    std::{
        collections::{HashMap, VecDeque},
        sync::{
            Arc, Mutex, MutexGuard, PoisonError,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    },
    tokio::{
        sync::Notify,
        time::{Instant, timeout_at},
    },
};

/// Frames a mailbox holds before writers see it as full.
pub const DEFAULT_DEPTH: usize = 64;

/// Default payload capacity of one frame.
pub const DEFAULT_FRAME_CAPACITY: usize = 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Channel {
    frames: Mutex<VecDeque<Frame>>,
    depth: usize,
    frame_capacity: usize,
    closed: AtomicBool,
    readable: Notify,
    writable: Notify,
}

/// Named hub of in-process mailboxes.
pub struct LocalMailboxes {
    frame_capacity: usize,
    depth: usize,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl Default for LocalMailboxes {
    fn default() -> Self {
        LocalMailboxes::new(DEFAULT_FRAME_CAPACITY, DEFAULT_DEPTH)
    }
}

impl LocalMailboxes {
    pub fn new(frame_capacity: usize, depth: usize) -> LocalMailboxes {
        LocalMailboxes {
            frame_capacity: frame_capacity.max(1),
            depth: depth.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn frame_capacity(&self) -> usize {
        self.frame_capacity
    }

    /// Attach to an existing mailbox, as a client process would.
    pub fn connect(&self, id: &str) -> Result<Arc<LocalMailbox>> {
        let channels = lock(&self.channels);
        match channels.get(id) {
            Some(channel) if !channel.closed.load(Ordering::SeqCst) => Ok(Arc::new(LocalMailbox {
                id: id.to_owned(),
                channel: channel.clone(),
            })),
            _ => Err(Error::MailboxNotFound(id.to_owned())),
        }
    }

    fn create(&self, id: &str) -> Result<Arc<LocalMailbox>> {
        let mut channels = lock(&self.channels);
        if let Some(existing) = channels.get(id) {
            if !existing.closed.load(Ordering::SeqCst) {
                return Err(Error::MailboxExists(id.to_owned()));
            }
        }

        let channel = Arc::new(Channel {
            frames: Mutex::new(VecDeque::with_capacity(self.depth)),
            depth: self.depth,
            frame_capacity: self.frame_capacity,
            closed: AtomicBool::new(false),
            readable: Notify::new(),
            writable: Notify::new(),
        });
        channels.insert(id.to_owned(), channel.clone());
        debug!("created mailbox {}", id);

        Ok(Arc::new(LocalMailbox {
            id: id.to_owned(),
            channel,
        }))
    }
}

#[async_trait]
impl MailboxProvider for LocalMailboxes {
    async fn open(&self, id: &str, create: bool) -> Result<Arc<dyn Mailbox>> {
        let mailbox: Arc<dyn Mailbox> = if create {
            self.create(id)?
        } else {
            self.connect(id)?
        };
        Ok(mailbox)
    }
}

/// Endpoint of an in-process mailbox.
pub struct LocalMailbox {
    id: String,
    channel: Arc<Channel>,
}

impl LocalMailbox {
    fn check_open(&self) -> Result<()> {
        if self.channel.closed.load(Ordering::SeqCst) {
            return Err(Error::MailboxClosed(self.id.clone()));
        }
        Ok(())
    }

    /// Frames currently queued.
    pub fn pending(&self) -> usize {
        lock(&self.channel.frames).len()
    }
}

#[async_trait]
impl Mailbox for LocalMailbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn frame_capacity(&self) -> usize {
        self.channel.frame_capacity
    }

    async fn write(&self, length: u32, payload: &[u8], timeout: Duration) -> Result<bool> {
        if payload.len() > self.channel.frame_capacity {
            return Err(Error::FrameTooLarge {
                len: payload.len(),
                capacity: self.channel.frame_capacity,
            });
        }

        let deadline = Instant::now() + timeout;
        loop {
            let writable = self.channel.writable.notified();
            self.check_open()?;
            {
                let mut frames = lock(&self.channel.frames);
                if frames.len() < self.channel.depth {
                    frames.push_back(Frame {
                        length,
                        payload: Bytes::copy_from_slice(payload),
                    });
                    drop(frames);
                    self.channel.readable.notify_one();
                    return Ok(true);
                }
            }
            if timeout_at(deadline, writable).await.is_err() {
                return Ok(false);
            }
        }
    }

    async fn read(&self, timeout: Duration) -> Result<Option<Frame>> {
        let deadline = Instant::now() + timeout;
        loop {
            let readable = self.channel.readable.notified();
            self.check_open()?;
            let frame = lock(&self.channel.frames).pop_front();
            if let Some(frame) = frame {
                self.channel.writable.notify_one();
                return Ok(Some(frame));
            }
            if timeout_at(deadline, readable).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.channel.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.channel.closed.swap(true, Ordering::SeqCst) {
            debug!("closed mailbox {}", self.id);
        }
        self.channel.readable.notify_waiters();
        self.channel.writable.notify_waiters();
    }
}
