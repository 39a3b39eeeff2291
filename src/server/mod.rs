//! Server facade (spec.md §2, §4.6): the public operations (`Lookup`, `Put`,
//! `MakeDirectory`, `Delete`, `Glob`, `WhichAccess`, `Watch`), the permission
//! gate wiring, and the link-following contract every operation honors.
//!
//! Every traversal that crosses a link returns [`crate::store::Outcome::FollowLink`]
//! bundled with the link entry rather than resolving it server-side (spec.md
//! §4.6); this module does not add any further resolution on top of
//! [`crate::store::Store`] — it only adds the permission gate in front of
//! root creation and blob-carrying puts, and turns a raw [`EventManager`]
//! subscription into the `watch-current` snapshot-then-live sequence.

use std::sync::Arc;

use crate::error::Error;
use crate::event::{Subscription, WATCH_CURRENT};
use crate::gate::PermissionGate;
use crate::path::Name;
use crate::store::entry::{BlockRef, DirEntry};
use crate::store::{Outcome, Store};

/// A running directory server instance: one user's tree (the "server
/// user") plus every other user's tree this process happens to host, all
/// sharing one [`Store`] and one [`EventManager`].
pub struct Server {
    store: Arc<Store>,
    gate: PermissionGate,
    server_user: String,
}

impl Server {
    /// Boot a server for `server_user`, creating its root if it does not
    /// already exist and spawning the permission gate's background watch
    /// of `<server_user>/Group/Writers` (spec.md §4.5).
    pub async fn start(store: Arc<Store>, server_user: String, gate_retry_backoff: std::time::Duration) -> Result<Self, Error> {
        match store.make_root(&server_user).await {
            Ok(_) => {}
            Err(e) if e.kind() == crate::error::Kind::Exist => {}
            Err(e) => return Err(e),
        }
        let gate = PermissionGate::spawn(store.clone(), server_user.clone(), gate_retry_backoff)?;
        Ok(Self { store, gate, server_user })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn server_user(&self) -> &str {
        &self.server_user
    }

    /// Create a fresh root for `user`, gated by the writers policy: the
    /// caller requesting the new root and the user it is created for are
    /// the same identity here (spec.md never separates them for root
    /// creation).
    pub async fn make_root(&self, user: &str) -> Result<DirEntry, Error> {
        self.gate.guard_make_root(user, user).await?;
        tracing::debug!(user, "make_root");
        self.store.make_root(user).await
    }

    /// Create a new, empty directory at `name`, written by `caller`.
    /// Subject to the same parent-existence and right checks as any other
    /// [`Store::put`] (spec.md §4.3.1); not gated by the permission gate,
    /// which only authorizes root creation and blob-carrying puts.
    pub async fn make_directory(&self, caller: &str, name: Name, seq_constraint: i64) -> Result<Outcome<DirEntry>, Error> {
        tracing::debug!(%name, caller, "make_directory");
        let entry = DirEntry::new_directory(name, caller, crate::packing::PLAIN_WITH_INTEGRITY);
        self.store.put(entry, seq_constraint).await
    }

    /// Write a regular file's content, gated by the writers policy: a
    /// blob-carrying put is exactly the "put blobs" case spec.md §4.5
    /// authorizes against (directory and link puts are not gated, only the
    /// act of attaching content authored by `writer`).
    pub async fn put(
        &self,
        name: Name,
        writer: &str,
        blocks: Vec<BlockRef>,
        seq_constraint: i64,
    ) -> Result<Outcome<DirEntry>, Error> {
        self.gate.guard_put(writer, &name).await?;
        tracing::debug!(%name, writer, "put");
        let entry = DirEntry::new_regular(name, writer, crate::packing::PLAIN_WITH_INTEGRITY, blocks, None);
        self.store.put(entry, seq_constraint).await
    }

    /// Create a link at `name` pointing at `target`, written by `caller`.
    /// Not gated: link creation carries no content of its own.
    pub async fn make_link(&self, caller: &str, name: Name, target: Name, seq_constraint: i64) -> Result<Outcome<DirEntry>, Error> {
        tracing::debug!(%name, %target, caller, "make_link");
        let entry = DirEntry::new_link(name, target, caller, crate::packing::PLAIN_WITH_INTEGRITY);
        self.store.put(entry, seq_constraint).await
    }

    /// Write the content of an `Access` or `Group` control file. Control
    /// files are exempt from the writers-policy gate: a tree owner must
    /// always be able to manage its own access control regardless of the
    /// server-wide Writers policy, which exists to bound who may introduce
    /// arbitrary blob content, not who may administer their own tree.
    pub async fn put_control_file(
        &self,
        name: Name,
        writer: &str,
        body: &[u8],
        seq_constraint: i64,
    ) -> Result<Outcome<DirEntry>, Error> {
        tracing::debug!(%name, writer, "put_control_file");
        let block = self.store.pack_and_store(body).await?;
        let entry = DirEntry::new_regular(name, writer, crate::packing::PLAIN_WITH_INTEGRITY, vec![block], None);
        self.store.put(entry, seq_constraint).await
    }

    pub async fn delete(&self, caller: &str, name: Name, seq_constraint: i64) -> Result<Outcome<DirEntry>, Error> {
        tracing::debug!(%name, caller, "delete");
        self.store.delete(caller, name, seq_constraint).await
    }

    pub async fn lookup(&self, caller: &str, name: Name, follow_final: bool) -> Result<Outcome<DirEntry>, Error> {
        self.store.lookup(caller, name, follow_final).await
    }

    pub async fn glob(&self, caller: &str, pattern: Name) -> Result<crate::store::GlobResult, Error> {
        self.store.glob(caller, pattern).await
    }

    pub async fn which_access(&self, caller: &str, name: Name) -> Result<Option<DirEntry>, Error> {
        self.store.which_access(caller, name).await
    }

    /// Subscribe to changes under `root` from `sequence` (spec.md §4.4.1).
    /// [`WATCH_CURRENT`] is handled by [`Store::watch_current`] rather than
    /// here: snapshotting the subtree and installing the live listener must
    /// happen under one held read lock, or a mutation racing the cutover
    /// can be silently lost (absent from both the snapshot and the live
    /// stream).
    pub async fn watch(&self, caller: String, root: Name, sequence: i64) -> Result<Subscription, Error> {
        tracing::debug!(%root, caller, sequence, "watch");
        let filter: Arc<dyn crate::event::EventFilter> = self.store.clone();
        if sequence == WATCH_CURRENT {
            self.store.watch_current(caller, root, filter).await
        } else {
            self.store.events().watch(caller, root, sequence, filter).await
        }
    }

    /// Test-only bulk purge, bypassing every right check. Never exposed to
    /// an end-user caller.
    pub async fn delete_all(&self, user: &str) {
        self.store.delete_all(user).await;
    }
}
