//! Event manager (spec.md §4.4): a single long-lived task owns the event
//! history and the live subscriber list; all interaction happens through
//! four channels (`events_so_far` is folded into the subscribe request
//! here, since a fresh subscriber always states its starting sequence up
//! front).
//!
//! Control messages travel over [`tokio::sync::mpsc`] (matching the
//! teacher's own channel-wrapper style in its `message_types` module); each
//! subscriber's event stream is an [`async_channel`] receiver so a slow
//! consumer can be evicted by simply dropping the sender without blocking
//! the event loop itself.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::path::Name;
use crate::store::entry::DirEntry;

/// `watch-start`: replay the entire retained history.
pub const WATCH_START: i64 = -1;
/// `watch-current`: snapshot the current tree under `root`, then stream live.
pub const WATCH_CURRENT: i64 = -2;
/// `watch-new`: only events committed after the subscription is installed.
pub const WATCH_NEW: i64 = -3;

/// One change record: the mutated entry, whether it was a deletion, and an
/// optional terminal error that accompanies subscription teardown.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub entry: DirEntry,
    pub delete: bool,
    pub error: Option<String>,
}

impl EventRecord {
    pub fn put(entry: DirEntry) -> Self {
        Self { entry, delete: false, error: None }
    }

    pub fn delete(entry: DirEntry) -> Self {
        Self { entry, delete: true, error: None }
    }
}

/// Evaluates whether a subscriber may observe (and whether it may see the
/// full contents of) a given entry. Implemented by [`crate::server::Server`]
/// so the same incomplete-masking and no-disclosure rules [`crate::store`]
/// applies to `Lookup` also apply to the event stream (spec.md §4.4).
#[async_trait::async_trait]
pub trait EventFilter: Send + Sync {
    /// Returns the (possibly masked) entry the subscriber may see, or
    /// `None` if the subscriber may not see this path at all.
    async fn filter(&self, subscriber: &str, entry: &DirEntry) -> Option<DirEntry>;
}

/// Per-subscriber channel capacity. Must be bounded: an unbounded
/// `async_channel` never blocks on `send`, which would make the
/// `tokio::time::timeout` around every delivery a no-op and defeat
/// slow-consumer eviction entirely (spec.md §8 property 8, §9 "watch
/// backpressure"). A subscriber that falls this far behind blocks sends
/// until it either catches up or the deadline evicts it.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 16;

struct Listener {
    subscriber: String,
    root: Name,
    filter: std::sync::Arc<dyn EventFilter>,
    sender: async_channel::Sender<EventRecord>,
}

type WatchReply = oneshot::Sender<Result<(u64, async_channel::Receiver<EventRecord>), Error>>;

enum Control {
    NewEvent(EventRecord),
    NewListener {
        subscriber: String,
        root: Name,
        sequence: i64,
        filter: std::sync::Arc<dyn EventFilter>,
        reply: WatchReply,
    },
    ListenerDone(u64),
    Snapshot {
        entries: Vec<DirEntry>,
        subscriber: String,
        root: Name,
        filter: std::sync::Arc<dyn EventFilter>,
        reply: WatchReply,
    },
}

/// Handle to the single event-manager task. Cheap to clone; every clone
/// shares the same background task and history.
#[derive(Clone)]
pub struct EventManager {
    control: mpsc::UnboundedSender<Control>,
    deadline: Duration,
    _task: std::sync::Arc<JoinHandle<()>>,
}

struct ListenerSlot {
    id: u64,
    listener: Listener,
}

struct State {
    history: VecDeque<EventRecord>,
    listeners: Vec<ListenerSlot>,
    next_id: u64,
}

impl EventManager {
    /// Spawn the event manager task. `deadline` bounds how long a send to
    /// a single subscriber may block before that subscriber is evicted
    /// (spec.md §4.4, default 10s).
    pub fn spawn(deadline: Duration) -> Self {
        let (control, mut recv) = mpsc::unbounded_channel::<Control>();

        let task = tokio::spawn(async move {
            let mut state = State { history: VecDeque::new(), listeners: Vec::new(), next_id: 0 };
            while let Some(msg) = recv.recv().await {
                match msg {
                    Control::NewEvent(record) => {
                        state.history.push_back(record.clone());
                        Self::broadcast(&mut state, &record, deadline).await;
                    }
                    Control::NewListener { subscriber, root, sequence, filter, reply } => {
                        let result =
                            Self::install_listener(&mut state, subscriber, root, sequence, filter, deadline)
                                .await;
                        let _ = reply.send(result);
                    }
                    Control::Snapshot { entries, subscriber, root, filter, reply } => {
                        let result = Self::install_snapshot(
                            &mut state, entries, subscriber, root, filter, deadline,
                        )
                        .await;
                        let _ = reply.send(result);
                    }
                    Control::ListenerDone(id) => {
                        state.listeners.retain(|slot| slot.id != id);
                    }
                }
            }
        });

        Self { control, deadline, _task: std::sync::Arc::new(task) }
    }

    async fn broadcast(state: &mut State, record: &EventRecord, deadline: Duration) {
        let mut evicted = Vec::new();
        for slot in state.listeners.iter() {
            if !Self::visible_to(&slot.listener.root, record) {
                continue;
            }
            let masked = slot.listener.filter.filter(&slot.listener.subscriber, &record.entry).await;
            let Some(masked) = masked else { continue };
            let mut masked_record = record.clone();
            masked_record.entry = masked;
            let send = tokio::time::timeout(deadline, slot.listener.sender.send(masked_record)).await;
            if send.is_err() || matches!(send, Ok(Err(_))) {
                evicted.push(slot.id);
            }
        }
        if !evicted.is_empty() {
            state.listeners.retain(|slot| !evicted.contains(&slot.id));
        }
    }

    async fn install_listener(
        state: &mut State,
        subscriber: String,
        root: Name,
        sequence: i64,
        filter: std::sync::Arc<dyn EventFilter>,
        deadline: Duration,
    ) -> Result<(u64, async_channel::Receiver<EventRecord>), Error> {
        if sequence != WATCH_START
            && sequence != WATCH_NEW
            && !state.history.iter().any(|r| r.entry.sequence == sequence)
        {
            return Err(crate::error::Error::new("watch", crate::error::Kind::Invalid)
                .with_detail(format!("sequence {sequence} is not in the retained history")));
        }

        let (sender, receiver) = async_channel::bounded(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut kept_up = true;

        if sequence != WATCH_NEW {
            // `WATCH_START` replays everything; any other (validated)
            // sequence replays only what came after it, approximating
            // "position" by comparing entry sequences to the caller's
            // watermark.
            for record in state.history.iter() {
                if sequence != WATCH_START && record.entry.sequence <= sequence {
                    continue;
                }
                if !Self::visible_to(&root, record) {
                    continue;
                }
                if let Some(masked) = filter.filter(&subscriber, &record.entry).await {
                    let mut r = record.clone();
                    r.entry = masked;
                    if tokio::time::timeout(deadline, sender.send(r)).await.is_err() {
                        // Subscriber could not keep up during replay: evict
                        // it exactly as a slow live consumer would (close
                        // the channel, no error record), rather than
                        // failing the whole `watch` call.
                        kept_up = false;
                        break;
                    }
                }
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        if kept_up {
            state.listeners.push(ListenerSlot { id, listener: Listener { subscriber, root, filter, sender } });
        }
        // `sender` is dropped here when `!kept_up`, closing `receiver` once
        // its already-queued records are drained.
        Ok((id, receiver))
    }

    async fn install_snapshot(
        state: &mut State,
        entries: Vec<DirEntry>,
        subscriber: String,
        root: Name,
        filter: std::sync::Arc<dyn EventFilter>,
        deadline: Duration,
    ) -> Result<(u64, async_channel::Receiver<EventRecord>), Error> {
        let (sender, receiver) = async_channel::bounded(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut kept_up = true;
        for entry in entries {
            if let Some(masked) = filter.filter(&subscriber, &entry).await {
                let record = EventRecord::put(masked);
                if tokio::time::timeout(deadline, sender.send(record)).await.is_err() {
                    kept_up = false;
                    break;
                }
            }
        }
        let id = state.next_id;
        state.next_id += 1;
        if kept_up {
            state.listeners.push(ListenerSlot { id, listener: Listener { subscriber, root, filter, sender } });
        }
        Ok((id, receiver))
    }

    fn visible_to(root: &Name, record: &EventRecord) -> bool {
        root.has_prefix(&record.entry.name)
    }

    /// Append a new event to the history and fan it out to matching,
    /// authorized subscribers. Called by [`crate::store::Store`] while its
    /// write lock is still held (spec.md §4.3.1 step 6), so that a
    /// concurrent `watch-current` snapshot can never observe this commit
    /// without this event already enqueued ahead of it.
    pub fn emit(&self, record: EventRecord) {
        let _ = self.control.send(Control::NewEvent(record));
    }

    /// Subscribe from `sequence` (one of [`WATCH_START`], [`WATCH_NEW`], or
    /// a previously observed sequence number).
    pub async fn watch(
        &self,
        subscriber: String,
        root: Name,
        sequence: i64,
        filter: std::sync::Arc<dyn EventFilter>,
    ) -> Result<Subscription, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control
            .send(Control::NewListener { subscriber, root, sequence, filter, reply: reply_tx })
            .map_err(|_| crate::error::Error::new("watch", crate::error::Kind::Internal))?;
        let (id, receiver) = reply_rx
            .await
            .map_err(|_| crate::error::Error::new("watch", crate::error::Kind::Internal))??;
        Ok(Subscription { id, receiver, control: self.control.clone() })
    }

    /// Install a `watch-current` subscription: `entries` is the synthetic
    /// initial traversal of the subtree rooted at `root` (spec.md §4.4.1);
    /// these are delivered first and do not advance the subscriber's
    /// sequence, then the subscriber is installed at the live tail.
    pub async fn watch_current(
        &self,
        subscriber: String,
        root: Name,
        entries: Vec<DirEntry>,
        filter: std::sync::Arc<dyn EventFilter>,
    ) -> Result<Subscription, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control
            .send(Control::Snapshot { entries, subscriber, root, filter, reply: reply_tx })
            .map_err(|_| crate::error::Error::new("watch", crate::error::Kind::Internal))?;
        let (id, receiver) = reply_rx
            .await
            .map_err(|_| crate::error::Error::new("watch", crate::error::Kind::Internal))??;
        Ok(Subscription { id, receiver, control: self.control.clone() })
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

/// A live subscription returned by [`EventManager::watch`]. This is the
/// `done` channel of spec.md §4.4.1: dropping it (the caller's equivalent
/// of closing `done`) tells the event-manager task to forget the listener,
/// and exhausting the receiver after server-side eviction (slow consumer)
/// observes the same teardown from the other direction.
pub struct Subscription {
    id: u64,
    receiver: async_channel::Receiver<EventRecord>,
    control: mpsc::UnboundedSender<Control>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<EventRecord> {
        self.receiver.recv().await.ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.control.send(Control::ListenerDone(self.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packing::PLAIN_WITH_INTEGRITY;
    use crate::path;
    use crate::store::entry::DirEntry;
    use std::sync::Arc;
    use std::time::Duration;

    struct AllowAll;

    #[async_trait::async_trait]
    impl EventFilter for AllowAll {
        async fn filter(&self, _subscriber: &str, entry: &DirEntry) -> Option<DirEntry> {
            Some(entry.clone())
        }
    }

    fn entry(path: &str, seq: i64) -> DirEntry {
        let name = path::parse(path).unwrap();
        let mut e = DirEntry::new_regular(name, "ann@example.com", PLAIN_WITH_INTEGRITY, vec![], None);
        e.sequence = seq;
        e
    }

    #[tokio::test]
    async fn watch_new_receives_only_future_events() {
        let mgr = EventManager::spawn(Duration::from_secs(1));
        let root = path::parse("ann@example.com/").unwrap();
        mgr.emit(EventRecord::put(entry("ann@example.com/old", 1)));

        let mut sub = mgr.watch("ann@example.com".into(), root, WATCH_NEW, Arc::new(AllowAll)).await.unwrap();
        mgr.emit(EventRecord::put(entry("ann@example.com/new", 2)));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.entry.name.to_string(), "ann@example.com/new");
    }

    #[tokio::test]
    async fn watch_start_replays_history() {
        let mgr = EventManager::spawn(Duration::from_secs(1));
        let root = path::parse("ann@example.com/").unwrap();
        mgr.emit(EventRecord::put(entry("ann@example.com/a", 1)));
        mgr.emit(EventRecord::put(entry("ann@example.com/b", 2)));

        let mut sub = mgr.watch("ann@example.com".into(), root, WATCH_START, Arc::new(AllowAll)).await.unwrap();
        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.entry.name.to_string(), "ann@example.com/a");
        assert_eq!(second.entry.name.to_string(), "ann@example.com/b");
    }

    #[tokio::test]
    async fn out_of_subtree_events_are_not_delivered() {
        let mgr = EventManager::spawn(Duration::from_secs(1));
        let root = path::parse("ann@example.com/sub").unwrap();
        let mut sub = mgr.watch("ann@example.com".into(), root, WATCH_NEW, Arc::new(AllowAll)).await.unwrap();
        mgr.emit(EventRecord::put(entry("ann@example.com/other", 1)));
        mgr.emit(EventRecord::put(entry("ann@example.com/sub/x", 2)));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.entry.name.to_string(), "ann@example.com/sub/x");
    }

    #[tokio::test]
    async fn watch_from_unretained_sequence_is_invalid() {
        let mgr = EventManager::spawn(Duration::from_secs(1));
        let root = path::parse("ann@example.com/").unwrap();
        mgr.emit(EventRecord::put(entry("ann@example.com/a", 1)));

        let err = mgr.watch("ann@example.com".into(), root, 777, Arc::new(AllowAll)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::Invalid);
    }

    #[tokio::test]
    async fn watch_current_delivers_snapshot_then_live() {
        let mgr = EventManager::spawn(Duration::from_secs(1));
        let root = path::parse("ann@example.com/").unwrap();
        let snapshot = vec![entry("ann@example.com/a", 1), entry("ann@example.com/b", 2)];

        let mut sub = mgr
            .watch_current("ann@example.com".into(), root, snapshot, Arc::new(AllowAll))
            .await
            .unwrap();
        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.entry.name.to_string(), "ann@example.com/a");
        assert_eq!(second.entry.name.to_string(), "ann@example.com/b");

        mgr.emit(EventRecord::put(entry("ann@example.com/c", 3)));
        let third = sub.recv().await.unwrap();
        assert_eq!(third.entry.name.to_string(), "ann@example.com/c");
    }

    #[tokio::test]
    async fn dropping_subscription_tears_down_listener() {
        let mgr = EventManager::spawn(Duration::from_secs(1));
        let root = path::parse("ann@example.com/").unwrap();
        let sub = mgr.watch("ann@example.com".into(), root, WATCH_NEW, Arc::new(AllowAll)).await.unwrap();
        drop(sub);
        // Emitting after the subscriber tore itself down must not panic or
        // hang the event loop; there is simply no one left to deliver to.
        mgr.emit(EventRecord::put(entry("ann@example.com/after", 1)));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
