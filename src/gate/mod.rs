//! Permission gate (spec.md §4.5): a server-wide policy, independent of the
//! per-path access evaluator, that authorizes root creation and blob-put
//! requests against a single "writers" group maintained in this server
//! instance's own tree.
//!
//! While `<server_user>/Group/Writers` does not exist, every caller is
//! allowed; once it exists, only the users it (transitively, through
//! nested groups and wildcards) names may create roots or put regular file
//! content. A background task keeps the gate's view of the policy current
//! by watching that path with the same [`crate::event::EventManager`]
//! [`crate::store::Store`] uses for every other subscriber.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::access::{ParsedAccess, Principal, Right};
use crate::error::{self, Error, Kind};
use crate::event::WATCH_START;
use crate::path::Name;
use crate::store::{Outcome, Store};

/// The fixed right [`ParsedAccess::with_grant`] is keyed on when wrapping
/// the `Writers` group body for reuse of [`crate::access::Evaluator::can`].
/// Any explicit right would do; `Write` reads naturally at call sites.
const WRITERS_RIGHT: Right = Right::Write;

/// Watches one server's `Group/Writers` policy file and answers "may
/// `user` create a root or put a blob on this server instance right now".
pub struct PermissionGate {
    store: Arc<Store>,
    policy: Arc<RwLock<Option<Vec<Principal>>>>,
    task: JoinHandle<()>,
}

impl PermissionGate {
    /// Spawn the background watcher and return a handle. `server_user`
    /// must already have a root (via [`Store::make_root`]) for the
    /// `Writers` policy file to ever be observable; until then (or while
    /// the file is simply absent) every caller is allowed.
    pub fn spawn(store: Arc<Store>, server_user: String, retry_backoff: Duration) -> Result<Self, Error> {
        let writers_path = Name::root(&server_user)?.join("Group/Writers")?;
        let policy = Arc::new(RwLock::new(None));

        let task_store = store.clone();
        let task_policy = policy.clone();
        let task = tokio::spawn(async move {
            Self::run(task_store, server_user, writers_path, task_policy, retry_backoff).await;
        });

        Ok(Self { store, policy, task })
    }

    /// `true` if `user` may create a new root or put regular file content
    /// on this server instance: the policy file is absent, or `user` is a
    /// (possibly transitive, possibly wildcard) member of `Writers`.
    pub async fn allowed(&self, user: &str) -> Result<bool, Error> {
        let policy = self.policy.read().await.clone();
        let Some(principals) = policy else { return Ok(true) };
        let access = ParsedAccess::with_grant(WRITERS_RIGHT, principals);
        self.store.evaluator().can(&access, user, WRITERS_RIGHT, self.store.as_ref()).await
    }

    /// Authorize `caller` for root creation, returning [`Kind::Permission`]
    /// if the `Writers` policy excludes them.
    pub async fn guard_make_root(&self, caller: &str, user: &str) -> Result<(), Error> {
        if self.allowed(caller).await? {
            Ok(())
        } else {
            Err(error::permission("make_root", Name::root(user)?))
        }
    }

    /// Authorize `writer` for a blob-carrying put, returning
    /// [`Kind::Permission`] if the `Writers` policy excludes them.
    pub async fn guard_put(&self, writer: &str, name: &Name) -> Result<(), Error> {
        if self.allowed(writer).await? {
            Ok(())
        } else {
            Err(error::permission("put", name.clone()))
        }
    }

    async fn run(
        store: Arc<Store>,
        server_user: String,
        writers_path: Name,
        policy: Arc<RwLock<Option<Vec<Principal>>>>,
        retry_backoff: Duration,
    ) {
        loop {
            Self::reload(&store, &server_user, &writers_path, &policy).await;

            let filter: Arc<dyn crate::event::EventFilter> = store.clone();
            let sub = store
                .events()
                .watch(server_user.clone(), writers_path.clone(), WATCH_START, filter)
                .await;
            let mut sub = match sub {
                Ok(sub) => sub,
                Err(e) => {
                    tracing::warn!(error = %e, "permission gate: failed to watch Writers policy, retrying");
                    tokio::time::sleep(retry_backoff).await;
                    continue;
                }
            };

            loop {
                match sub.recv().await {
                    Some(record) if record.entry.name == writers_path => {
                        // The policy file transitioned (created, updated,
                        // deleted, or started resolving through a link);
                        // refresh our view immediately rather than waiting
                        // for the next poll.
                        Self::reload(&store, &server_user, &writers_path, &policy).await;
                    }
                    Some(_) => {}
                    None => break, // evicted as a slow consumer; reopen the watch
                }
            }
            tokio::time::sleep(retry_backoff).await;
        }
    }

    async fn reload(
        store: &Store,
        server_user: &str,
        writers_path: &Name,
        policy: &RwLock<Option<Vec<Principal>>>,
    ) {
        match store.read_body(server_user, writers_path.clone()).await {
            Ok(Outcome::Value(body)) => match crate::access::parse_group(&body) {
                Ok(principals) => *policy.write().await = Some(principals),
                Err(e) => tracing::warn!(error = %e, "permission gate: malformed Writers group, leaving prior policy in place"),
            },
            Ok(Outcome::FollowLink(_)) => {
                tracing::warn!("permission gate: Writers group resolves through a link, treating as absent");
                *policy.write().await = None;
            }
            Err(e) if e.kind() == Kind::NotExist => {
                *policy.write().await = None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "permission gate: failed to read Writers group, leaving prior policy in place");
            }
        }
    }
}

impl Drop for PermissionGate {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemoryContentStore;
    use crate::event::EventManager;
    use crate::packing::PLAIN_WITH_INTEGRITY;
    use crate::store::entry::DirEntry;
    use crate::path;
    use std::time::Duration;

    async fn new_store() -> Arc<Store> {
        Arc::new(Store::new(Arc::new(MemoryContentStore::new()), EventManager::spawn(Duration::from_secs(5))))
    }

    #[tokio::test]
    async fn allows_everyone_while_writers_file_absent() {
        let store = new_store().await;
        store.make_root("dir@example.com").await.unwrap();
        let gate = PermissionGate::spawn(store, "dir@example.com".into(), Duration::from_millis(10)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(gate.allowed("anyone@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn restricts_to_listed_writers_once_file_exists() {
        let store = new_store().await;
        store.make_root("dir@example.com").await.unwrap();
        let group_dir =
            DirEntry::new_directory(path::parse("dir@example.com/Group").unwrap(), "dir@example.com", PLAIN_WITH_INTEGRITY);
        store.put(group_dir, crate::store::entry::SEQ_NOT_EXIST).await.unwrap();
        let block = store.pack_and_store(b"ann@example.com").await.unwrap();
        let writers = DirEntry::new_regular(
            path::parse("dir@example.com/Group/Writers").unwrap(),
            "dir@example.com",
            PLAIN_WITH_INTEGRITY,
            vec![block],
            None,
        );
        store.put(writers, crate::store::entry::SEQ_NOT_EXIST).await.unwrap();

        let gate = PermissionGate::spawn(store, "dir@example.com".into(), Duration::from_millis(10)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(gate.allowed("ann@example.com").await.unwrap());
        assert!(!gate.allowed("mallory@example.com").await.unwrap());
    }
}
