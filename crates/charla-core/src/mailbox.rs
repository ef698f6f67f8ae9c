//! Per-login message queues.
//!
//! A [`Mailbox`] is created on login through a [`MailboxFactory`], fed by
//! other sessions (`add_message`, `add_notice`) and drained by a single
//! delivery task (`next`). Once [`Mailbox::shutdown`] is called nothing new
//! is accepted; anything still queued, and anything added afterwards, is
//! handed to the discard hook instead of being delivered.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

/// Kind of a delivery notice.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    /// A message we sent could not be delivered.
    Bounce,
    /// A message we sent was delivered.
    Received,
}

/// One queued item.
#[derive(Debug, Clone)]
pub enum MailboxEntry {
    Message {
        msgid: u32,
        /// Sender's mailbox, for receipts and bounces.
        from: Arc<Mailbox>,
        body: Bytes,
    },
    Notice { kind: NoticeKind, msgid: u32 },
}

/// Called for every entry that is dropped instead of delivered.
pub type DiscardHook = Arc<dyn Fn(&MailboxEntry) + Send + Sync>;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("mailbox limit reached")]
    LimitReached,

    #[error("mailbox rejected: {0}")]
    Rejected(String),
}

/// Creates mailboxes on login.
pub trait MailboxFactory: Send + Sync {
    fn create(&self, handle: &str) -> Result<Arc<Mailbox>, MailboxError>;
}

/// In-process mailboxes with no limit.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalMailboxFactory;

impl MailboxFactory for LocalMailboxFactory {
    fn create(&self, handle: &str) -> Result<Arc<Mailbox>, MailboxError> {
        Ok(Arc::new(Mailbox::new(handle)))
    }
}

#[derive(Default)]
struct MailboxState {
    entries: VecDeque<MailboxEntry>,
    defunct: bool,
}

pub struct Mailbox {
    handle: String,
    state: Mutex<MailboxState>,
    notify: Notify,
    discard_hook: Mutex<Option<DiscardHook>>,
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mailbox")
            .field("handle", &self.handle)
            .field("queued", &state.entries.len())
            .field("defunct", &state.defunct)
            .finish()
    }
}

impl Mailbox {
    pub fn new(handle: impl Into<String>) -> Self {
        Mailbox {
            handle: handle.into(),
            state: Mutex::new(MailboxState::default()),
            notify: Notify::new(),
            discard_hook: Mutex::new(None),
        }
    }

    /// Handle of the user this mailbox belongs to.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Install (or clear) the hook notified about discarded entries.
    pub fn set_discard_hook(&self, hook: Option<DiscardHook>) {
        *self.discard_hook.lock() = hook;
    }

    pub fn is_defunct(&self) -> bool {
        self.state.lock().defunct
    }

    /// Number of entries waiting for delivery.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Queue a message. Returns `false` if it was discarded instead.
    pub fn add_message(&self, msgid: u32, from: Arc<Mailbox>, body: Bytes) -> bool {
        self.push(MailboxEntry::Message { msgid, from, body })
    }

    /// Queue a notice. Returns `false` if it was discarded instead.
    pub fn add_notice(&self, kind: NoticeKind, msgid: u32) -> bool {
        self.push(MailboxEntry::Notice { kind, msgid })
    }

    fn push(&self, entry: MailboxEntry) -> bool {
        {
            let mut state = self.state.lock();
            if !state.defunct {
                state.entries.push_back(entry);
                drop(state);
                self.notify.notify_waiters();
                return true;
            }
        }

        debug!(handle = %self.handle, "mailbox defunct, discarding entry");
        self.discard(&entry);
        false
    }

    /// Wait for the next entry.
    ///
    /// Returns `None` once the mailbox has been shut down.
    pub async fn next(&self) -> Option<MailboxEntry> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.defunct {
                    return None;
                }
                if let Some(entry) = state.entries.pop_front() {
                    return Some(entry);
                }
            }

            notified.await;
        }
    }

    /// Stop accepting entries and discard whatever is still queued.
    ///
    /// Wakes a pending [`Mailbox::next`], which then returns `None`.
    pub fn shutdown(&self) {
        let leftover: Vec<MailboxEntry> = {
            let mut state = self.state.lock();
            if state.defunct {
                return;
            }
            state.defunct = true;
            state.entries.drain(..).collect()
        };
        self.notify.notify_waiters();

        debug!(handle = %self.handle, discarded = leftover.len(), "mailbox shut down");
        for entry in &leftover {
            self.discard(entry);
        }
    }

    fn discard(&self, entry: &MailboxEntry) {
        let hook = self.discard_hook.lock().clone();
        if let Some(hook) = hook {
            hook(entry);
        }
    }
}
