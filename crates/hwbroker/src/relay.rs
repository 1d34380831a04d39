//! Chunked relay between an adapter's raw stream and mailboxes.
//!
//! # Chunking
//!
//! A message of `L` bytes is written as one frame whose length field is `L`
//! and whose payload is the first `min(L, F)` bytes, where `F` is the frame
//! capacity. The remaining bytes follow in frames of at most `F` bytes, each
//! carrying its own chunk length. A reader that sees a length field larger
//! than the payload it received keeps reading continuation frames until `L`
//! bytes are assembled.

use {
    crate::{
        adapter::{Adapter, CallbackId},
        error::Error,
        mailbox::Mailbox,
        utils::Result,
    },
    bytes::{Bytes, BytesMut},
    log::{error, info, warn},
    std::{sync::Arc, time::Duration},
    tokio::{
        sync::mpsc::{self, error::TrySendError},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
};

/// Timeouts and retry budget of the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    /// Wait for the first frame of a message; bounds stop latency.
    pub poll_timeout: Duration,
    /// Wait for each continuation frame of a message already in flight.
    pub continuation_timeout: Duration,
    /// Wait for room in a full mailbox, per attempt.
    pub write_timeout: Duration,
    /// Attempts per frame before the message is dropped.
    pub write_attempts: u32,
    /// Adapter buffers waiting for the reader task; overflow is dropped.
    pub queue_depth: usize,
    /// Largest message a reader accepts.
    pub max_message_len: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            poll_timeout: Duration::from_millis(100),
            continuation_timeout: Duration::from_millis(10),
            write_timeout: Duration::from_millis(100),
            write_attempts: 50,
            queue_depth: 64,
            max_message_len: 16 * 1024 * 1024,
        }
    }
}

async fn write_frame(
    mailbox: &dyn Mailbox,
    length: u32,
    payload: &[u8],
    config: &RelayConfig,
) -> Result<()> {
    for _ in 0..config.write_attempts {
        if mailbox.write(length, payload, config.write_timeout).await? {
            return Ok(());
        }
    }
    Err(Error::RetriesExhausted {
        attempts: config.write_attempts,
    })
}

/// Write `data` to `mailbox` as one logical message.
///
/// Gives up on the message once a frame cannot be written within the retry
/// budget, or as soon as the mailbox is closed.
pub async fn write_message(mailbox: &dyn Mailbox, data: &[u8], config: &RelayConfig) -> Result<()> {
    let capacity = mailbox.frame_capacity();
    let length = u32::try_from(data.len()).map_err(|_| Error::FrameTooLarge {
        len: data.len(),
        capacity: u32::MAX as usize,
    })?;

    let (first, mut rest) = data.split_at(data.len().min(capacity));
    write_frame(mailbox, length, first, config).await?;

    while !rest.is_empty() {
        let (chunk, tail) = rest.split_at(rest.len().min(capacity));
        write_frame(mailbox, chunk.len() as u32, chunk, config).await?;
        rest = tail;
    }

    Ok(())
}

/// Read the next logical message from `mailbox`.
///
/// Returns `Ok(None)` if no message started within the poll timeout. A
/// message whose continuation frames stop arriving is abandoned with
/// `Error::IncompleteMessage`; the next call starts on a fresh message.
pub async fn read_message(mailbox: &dyn Mailbox, config: &RelayConfig) -> Result<Option<Bytes>> {
    let Some(first) = mailbox.read(config.poll_timeout).await? else {
        return Ok(None);
    };

    let total = first.length as usize;
    if total > config.max_message_len {
        return Err(Error::MessageTooLarge {
            len: total,
            max: config.max_message_len,
        });
    }
    if total <= first.payload.len() {
        return Ok(Some(first.payload.slice(..total)));
    }

    let mut assembled = BytesMut::with_capacity(total);
    assembled.extend_from_slice(&first.payload);
    while assembled.len() < total {
        let frame = match mailbox.read(config.continuation_timeout).await? {
            Some(frame) if !frame.payload.is_empty() => frame,
            _ => {
                return Err(Error::IncompleteMessage {
                    expected: total,
                    received: assembled.len(),
                });
            }
        };
        let take = frame.payload.len().min(total - assembled.len());
        assembled.extend_from_slice(&frame.payload[..take]);
    }

    Ok(Some(assembled.freeze()))
}

/// Adapter to mailbox relay.
///
/// The adapter's raw callback hands each buffer to a task which performs the
/// chunked write, so the adapter's delivery thread never blocks on a full
/// mailbox. At most `queue_depth` buffers wait for that task; anything
/// delivered beyond that is dropped and logged.
pub struct ReaderRelay {
    mailbox: Arc<dyn Mailbox>,
    callback: CallbackId,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ReaderRelay {
    pub fn spawn(adapter: &dyn Adapter, mailbox: Arc<dyn Mailbox>, config: RelayConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Bytes>(config.queue_depth.max(1));
        let id = mailbox.id().to_owned();
        let callback = adapter.add_raw_callback(Box::new(move |data: &[u8]| {
            match tx.try_send(Bytes::copy_from_slice(data)) {
                Ok(()) => {}
                Err(TrySendError::Full(data)) => {
                    warn!("relay queue for {} is full, dropping {} bytes", id, data.len())
                }
                // The receiver is gone only while the relay is being torn down
                Err(TrySendError::Closed(_)) => {}
            }
        }));

        let stop = CancellationToken::new();
        let task = tokio::spawn(run_reader(mailbox.clone(), rx, config, stop.clone()));

        ReaderRelay {
            mailbox,
            callback,
            stop,
            task,
        }
    }

    /// Deregister the callback and wait for the in-flight message, if any.
    pub async fn stop(self, adapter: &dyn Adapter) {
        if !adapter.remove_raw_callback(self.callback) {
            warn!(
                "raw callback for mailbox {} was already removed",
                self.mailbox.id()
            );
        }
        self.stop.cancel();
        if let Err(e) = self.task.await {
            error!("reader relay for {} panicked: {}", self.mailbox.id(), e);
        }
        self.mailbox.close();
    }
}

async fn run_reader(
    mailbox: Arc<dyn Mailbox>,
    mut rx: mpsc::Receiver<Bytes>,
    config: RelayConfig,
    stop: CancellationToken,
) {
    info!("reader relay for {} starting", mailbox.id());
    loop {
        // Stop is only observed between messages
        let data = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            data = rx.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        match write_message(&*mailbox, &data, &config).await {
            Ok(()) => {}
            Err(Error::MailboxClosed(_)) => {
                warn!("mailbox {} closed under the reader relay", mailbox.id());
                break;
            }
            Err(e) => error!("Unable to write message to {}: {}", mailbox.id(), e),
        }
    }
    info!("reader relay for {} stopping", mailbox.id());
}

/// Mailbox to adapter relay.
pub struct WriterRelay {
    mailbox: Arc<dyn Mailbox>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl WriterRelay {
    pub fn spawn(adapter: Arc<dyn Adapter>, mailbox: Arc<dyn Mailbox>, config: RelayConfig) -> Self {
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_writer(adapter, mailbox.clone(), config, stop.clone()));
        WriterRelay {
            mailbox,
            stop,
            task,
        }
    }

    /// Clear the run flag and join; latency is bounded by the poll timeout.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            error!("writer relay for {} panicked: {}", self.mailbox.id(), e);
        }
        self.mailbox.close();
    }
}

async fn run_writer(
    adapter: Arc<dyn Adapter>,
    mailbox: Arc<dyn Mailbox>,
    config: RelayConfig,
    stop: CancellationToken,
) {
    info!("writer relay for {} starting", mailbox.id());
    while !stop.is_cancelled() {
        match read_message(&*mailbox, &config).await {
            Ok(Some(data)) if !data.is_empty() => {
                if let Err(e) = adapter.raw_write(data).await {
                    error!("raw write to {} failed: {}", adapter.serial(), e);
                }
            }
            Ok(_) => {}
            Err(Error::MailboxClosed(_)) => break,
            Err(e) => error!("Failed to read message from {}: {}", mailbox.id(), e),
        }
    }
    info!("writer relay for {} stopping", mailbox.id());
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            loopback::LoopbackAdapter,
            mailbox::{LocalMailboxes, MailboxProvider},
        },
    };

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[tokio::test]
    async fn chunked_round_trip() {
        let config = RelayConfig::default();
        for capacity in [1usize, 2, 5, 16, 64] {
            let hub = LocalMailboxes::new(capacity, 4);
            let tx = hub.open("rt", true).await.unwrap();
            let rx = hub.connect("rt").unwrap();
            let data = pattern(3 * capacity + 17);

            let sent = data.clone();
            let config2 = config.clone();
            let writer = tokio::spawn(async move { write_message(&*tx, &sent, &config2).await });

            let received = read_message(&*rx, &config).await.unwrap().unwrap();
            writer.await.unwrap().unwrap();
            assert_eq!(&received[..], &data[..], "frame capacity {capacity}");
        }
    }

    #[tokio::test]
    async fn message_within_one_frame() {
        let hub = LocalMailboxes::new(16, 4);
        let tx = hub.open("small", true).await.unwrap();
        let rx = hub.connect("small").unwrap();

        write_message(&*tx, b"hello", &RelayConfig::default())
            .await
            .unwrap();
        assert_eq!(rx.pending(), 1);
        let received = read_message(&*rx, &RelayConfig::default()).await.unwrap();
        assert_eq!(received.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let hub = LocalMailboxes::new(4, 1);
        let tx = hub.open("stuck", true).await.unwrap();
        let config = RelayConfig {
            write_attempts: 3,
            ..Default::default()
        };

        write_message(&*tx, b"ab", &config).await.unwrap();
        let started = tokio::time::Instant::now();
        let err = write_message(&*tx, b"cd", &config).await.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3 }));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn closed_mailbox_aborts_write() {
        let hub = LocalMailboxes::new(4, 1);
        let tx = hub.open("gone", true).await.unwrap();
        tx.close();
        let err = write_message(&*tx, b"abcdefgh", &RelayConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MailboxClosed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn truncated_message_is_abandoned() {
        let hub = LocalMailboxes::new(4, 8);
        let tx = hub.open("trunc", true).await.unwrap();
        let rx = hub.connect("trunc").unwrap();
        let config = RelayConfig::default();

        // Announces 10 bytes but only the first chunk ever arrives
        assert!(tx.write(10, b"abcd", config.write_timeout).await.unwrap());
        let err = read_message(&*rx, &config).await.unwrap_err();
        assert!(matches!(
            err,
            Error::IncompleteMessage {
                expected: 10,
                received: 4
            }
        ));

        write_message(&*tx, b"next", &config).await.unwrap();
        let next = read_message(&*rx, &config).await.unwrap();
        assert_eq!(next.as_deref(), Some(&b"next"[..]));
    }

    #[tokio::test]
    async fn nothing_to_read() {
        let hub = LocalMailboxes::new(4, 8);
        let rx = hub.open("idle", true).await.unwrap();
        let config = RelayConfig {
            poll_timeout: Duration::from_millis(5),
            ..Default::default()
        };
        assert_eq!(read_message(&*rx, &config).await.unwrap(), None);
    }

    #[tokio::test]
    async fn writer_relay_reassembles_into_raw_writes() {
        let adapter = Arc::new(LoopbackAdapter::new("A"));
        adapter.open().await.unwrap();
        let hub = LocalMailboxes::new(8, 16);
        let server_side = hub.open("w", true).await.unwrap();
        let client_side = hub.connect("w").unwrap();

        let relay = WriterRelay::spawn(adapter.clone(), server_side, RelayConfig::default());
        let data = pattern(8 * 3 + 17);
        write_message(&*client_side, &data, &RelayConfig::default())
            .await
            .unwrap();

        let written = adapter.wait_for_raw_writes(1).await;
        assert_eq!(written.len(), 1);
        assert_eq!(&written[0][..], &data[..]);

        relay.stop().await;
        assert!(client_side.is_closed());
    }

    #[tokio::test]
    async fn reader_relay_chunks_adapter_data() {
        let adapter = LoopbackAdapter::new("A");
        let hub = LocalMailboxes::new(8, 16);
        let server_side = hub.open("r", true).await.unwrap();
        let client_side = hub.connect("r").unwrap();

        let relay = ReaderRelay::spawn(&adapter, server_side, RelayConfig::default());
        assert_eq!(adapter.callback_count(), 1);

        let data = pattern(8 * 3 + 17);
        adapter.deliver(&data);
        let received = read_message(&*client_side, &RelayConfig::default())
            .await
            .unwrap();
        assert_eq!(received.as_deref(), Some(&data[..]));

        relay.stop(&adapter).await;
        assert_eq!(adapter.callback_count(), 0);
        assert!(client_side.is_closed());
    }

    #[tokio::test]
    async fn oversized_message_is_refused() {
        let hub = LocalMailboxes::new(4, 8);
        let tx = hub.open("big", true).await.unwrap();
        let rx = hub.connect("big").unwrap();
        let config = RelayConfig {
            max_message_len: 8,
            ..Default::default()
        };

        assert!(tx.write(u32::MAX, b"abcd", config.write_timeout).await.unwrap());
        let err = read_message(&*rx, &config).await.unwrap_err();
        assert!(matches!(
            err,
            Error::MessageTooLarge {
                len,
                max: 8
            } if len == u32::MAX as usize
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reader_queue_overflow_is_dropped() {
        let adapter = LoopbackAdapter::new("A");
        let hub = LocalMailboxes::new(8, 1);
        let server_side = hub.open("q", true).await.unwrap();
        let client_side = hub.connect("q").unwrap();
        let config = RelayConfig {
            queue_depth: 2,
            ..Default::default()
        };

        let relay = ReaderRelay::spawn(&adapter, server_side, config.clone());
        // Nobody drains the mailbox, so the relay task parks on the first
        // message and the queue fills behind it
        for i in 0..10u8 {
            adapter.deliver(&[i]);
            tokio::task::yield_now().await;
        }

        let mut received = Vec::new();
        while let Some(message) = read_message(&*client_side, &config).await.unwrap() {
            received.push(message[0]);
        }
        // One in the mailbox, one in flight, `queue_depth` queued
        assert!(received.starts_with(&[0, 1]), "{received:?}");
        assert!(received.len() <= 4, "{received:?}");
        assert!(received.windows(2).all(|w| w[0] < w[1]));

        relay.stop(&adapter).await;
    }
}
