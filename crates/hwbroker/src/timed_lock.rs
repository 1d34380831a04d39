//! Single-holder advisory lock with a bounded hold time.
//!
//! A background task owns the state machine:
//!
//! 1. *Lockable*: wait for the next acquisition request.
//! 2. *Locked*: grant it, then wait for the hold duration to elapse or for an
//!    explicit unlock, whichever comes first.
//! 3. Back to *Lockable*.
//!
//! Requests queue up while the lock is held and are granted one at a time.
//! Stopping the task wakes it from either wait, and every caller still
//! waiting for a grant is released with `Error::LockStopped`.

use {
    crate::{error::Error, rpc::ClientId, utils::Result},
    log::{debug, error},
    std::{
        sync::{Arc, Mutex, MutexGuard, PoisonError},
        time::Duration,
    },
    tokio::{
        sync::{mpsc, oneshot},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LockRequest {
    holder: ClientId,
    duration: Duration,
    granted: oneshot::Sender<()>,
}

struct Hold {
    holder: ClientId,
    release: oneshot::Sender<()>,
}

pub struct TimedLock {
    requests: mpsc::Sender<LockRequest>,
    hold: Arc<Mutex<Option<Hold>>>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TimedLock {
    /// Spawn the background task. Must be called within a tokio runtime.
    pub fn new() -> TimedLock {
        let (requests, rx) = mpsc::channel(1);
        let hold = Arc::new(Mutex::new(None));
        let stop = CancellationToken::new();
        let task = tokio::spawn(run(rx, hold.clone(), stop.clone()));

        TimedLock {
            requests,
            hold,
            stop,
            task: Mutex::new(Some(task)),
        }
    }

    /// Block until the lock is granted to `holder` for at most `duration`.
    pub async fn lock(&self, holder: ClientId, duration: Duration) -> Result<()> {
        let (granted, rx) = oneshot::channel();
        self.requests
            .send(LockRequest {
                holder,
                duration,
                granted,
            })
            .await
            .map_err(|_| Error::LockStopped)?;
        rx.await.map_err(|_| Error::LockStopped)
    }

    /// Release the lock now, whoever holds it.
    ///
    /// Returns `false` if the lock was not held.
    pub fn unlock(&self) -> bool {
        match lock(&self.hold).take() {
            Some(hold) => {
                let _ = hold.release.send(());
                true
            }
            None => false,
        }
    }

    /// Release the lock only if `holder` holds it.
    pub fn release_if_held_by(&self, holder: ClientId) -> bool {
        let mut hold = lock(&self.hold);
        if hold.as_ref().map(|h| h.holder) != Some(holder) {
            return false;
        }
        if let Some(hold) = hold.take() {
            let _ = hold.release.send(());
        }
        true
    }

    pub fn holder(&self) -> Option<ClientId> {
        lock(&self.hold).as_ref().map(|h| h.holder)
    }

    pub fn is_locked(&self) -> bool {
        lock(&self.hold).is_some()
    }

    /// Stop the background task and wait for it to exit.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("timed lock task panicked: {}", e);
            }
        }
    }
}

impl Default for TimedLock {
    fn default() -> Self {
        TimedLock::new()
    }
}

impl Drop for TimedLock {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run(
    mut requests: mpsc::Receiver<LockRequest>,
    hold: Arc<Mutex<Option<Hold>>>,
    stop: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let (release, released) = oneshot::channel();
        *lock(&hold) = Some(Hold {
            holder: request.holder,
            release,
        });
        if request.granted.send(()).is_err() {
            // The caller gave up before the grant
            lock(&hold).take();
            continue;
        }
        debug!(
            "lock granted to client {} for {:?}",
            request.holder, request.duration
        );

        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                lock(&hold).take();
                break;
            }
            _ = released => {
                debug!("lock released by unlock");
            }
            _ = tokio::time::sleep(request.duration) => {
                if lock(&hold).take().is_some() {
                    debug!("lock held by client {} expired", request.holder);
                }
            }
        }
    }
    // Dropping the receiver fails every pending and queued request
    debug!("timed lock task stopping");
}
