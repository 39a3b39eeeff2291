//! The metadata store: the authoritative, in-memory directory tree for every
//! user the server hosts.
//!
//! Each user's tree is a Merkle structure of directory blocks: a directory's
//! own [`entry::DirEntry`] carries exactly one block reference pointing at
//! its encoded child list. Mutating a directory therefore means re-encoding
//! and re-storing every ancestor directory's block up to the user's root,
//! the same append-only rewrite a content-addressed filesystem uses for any
//! path update. All per-user state lives behind one [`tokio::sync::RwLock`];
//! this single lock is the store's correctness boundary, not a per-user or
//! per-subtree one.

pub mod block;
pub mod entry;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::access::{Evaluator, GroupLoader, ParsedAccess, Right};
use crate::content::ContentStore;
use crate::error::{self, Error, Kind};
use crate::event::{EventFilter, EventManager, EventRecord};
use crate::packing::{Packer, PlainWithIntegrity, PLAIN_WITH_INTEGRITY};
use crate::path::{self, Name};

use entry::{BlockRef, DirEntry, Time};

/// The result of an operation that may instead need the caller to follow a
/// link found somewhere along the path, rather than resolving it
/// server-side (every traversal crosses at most one server; following a
/// link to a different user's tree is the caller's job).
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Value(T),
    FollowLink(DirEntry),
}

impl<T> Outcome<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Outcome::Value(v) => Some(v),
            Outcome::FollowLink(_) => None,
        }
    }
}

/// Result of a [`Store::glob`]: matched, read-masked entries plus any links
/// encountered along the way, collected separately rather than followed.
#[derive(Debug, Clone)]
pub struct GlobResult {
    pub entries: Vec<DirEntry>,
    pub links: Vec<DirEntry>,
}

struct Ancestor {
    entry: DirEntry,
    children: Vec<DirEntry>,
}

enum Resolved<T> {
    Value(T),
    FollowLink(DirEntry),
}

struct State {
    roots: HashMap<String, DirEntry>,
    seq: HashMap<String, i64>,
}

pub struct Store {
    content: Arc<dyn ContentStore>,
    packer: PlainWithIntegrity,
    evaluator: Evaluator,
    events: EventManager,
    state: RwLock<State>,
}

/// Adapts an already-locked [`State`] reference to [`GroupLoader`] so group
/// expansion during a put/delete/lookup can resolve cross-user group files
/// without re-acquiring the store's lock (which would deadlock against the
/// write guard already held by the in-flight operation).
struct StateLoader<'a> {
    store: &'a Store,
    state: &'a State,
}

#[async_trait]
impl<'a> GroupLoader for StateLoader<'a> {
    async fn load_group_body(&self, path: &Name) -> Result<Vec<u8>, Error> {
        self.store.fetch_body_locked(self.state, path).await
    }
}

/// Lets external callers (the permission gate, tests) resolve group
/// membership against a live store without already holding its lock.
#[async_trait]
impl GroupLoader for Store {
    async fn load_group_body(&self, path: &Name) -> Result<Vec<u8>, Error> {
        let state = self.state.read().await;
        self.fetch_body_locked(&state, path).await
    }
}

impl Store {
    pub fn new(content: Arc<dyn ContentStore>, events: EventManager) -> Self {
        Self {
            content,
            packer: PlainWithIntegrity,
            evaluator: Evaluator::new(),
            events,
            state: RwLock::new(State { roots: HashMap::new(), seq: HashMap::new() }),
        }
    }

    pub fn events(&self) -> &EventManager {
        &self.events
    }

    /// The shared access/group evaluator, reused by [`crate::gate`] so the
    /// writers-group policy file shares the same process-wide group cache
    /// as ordinary access files (spec.md §9 "global cache invalidation").
    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// Pack and store an arbitrary body as a single content block,
    /// returning the [`BlockRef`] a caller can attach to a [`DirEntry`]
    /// before calling [`Store::put`]. The real system's packing happens
    /// off-server in the client library (spec.md §1 Non-goals); this
    /// helper exists so tests and the demonstration binary can build
    /// properly packed entries without duplicating that logic (spec.md
    /// §4.3.1 precondition 4 requires access and group files in particular
    /// to already use the unpackable-by-all codec).
    pub async fn pack_and_store(&self, body: &[u8]) -> Result<BlockRef, Error> {
        let packed = self.packer.pack(body);
        let refdata = self
            .content
            .put(packed)
            .await
            .map_err(|e| Error::new("pack_and_store", Kind::Io).with_source(e))?;
        Ok(BlockRef {
            store_endpoint: "memory".into(),
            reference: refdata.reference,
            offset: 0,
            size: body.len() as u64,
            pack_data: Vec::new(),
        })
    }

    /// Read and unpack the full body of the entry at `name`, following the
    /// same link-opacity and no-disclosure rules as [`Store::lookup`]
    /// (spec.md §4.6): a link along the path is reported as
    /// [`Outcome::FollowLink`] rather than resolved, and a caller who can
    /// see an entry exists but lacks read right gets [`Kind::Permission`]
    /// rather than its bytes.
    pub async fn read_body(&self, caller: &str, name: Name) -> Result<Outcome<Vec<u8>>, Error> {
        match self.lookup(caller, name.clone(), true).await? {
            Outcome::FollowLink(link) => Ok(Outcome::FollowLink(link)),
            Outcome::Value(entry) => {
                if entry.is_incomplete() {
                    return Err(error::permission("read_body", name));
                }
                Ok(Outcome::Value(self.read_entry_body_locked(&entry).await?))
            }
        }
    }

    /// Breadth-first snapshot of every entry under `root` that `caller` may
    /// see right now, used to seed a `watch-current` subscription (spec.md
    /// §4.4.1). Directories the caller lacks `list` on are not descended
    /// into, mirroring [`Store::glob`]; links are included (masked, like
    /// any other entry) but never followed.
    pub async fn snapshot_subtree(&self, caller: &str, root: Name) -> Result<Vec<DirEntry>, Error> {
        let state = self.state.read().await;
        self.snapshot_subtree_locked(&state, caller, root).await
    }

    async fn snapshot_subtree_locked(
        &self,
        state: &State,
        caller: &str,
        root: Name,
    ) -> Result<Vec<DirEntry>, Error> {
        let start = if root.is_root() {
            state
                .roots
                .get(root.user())
                .cloned()
                .ok_or_else(|| error::not_exist("watch", root.clone()))?
        } else {
            match self.dir_listing_locked(state, &root).await? {
                Some((entry, _)) => entry,
                None => return Err(error::not_exist("watch", root)),
            }
        };

        let mut out = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);
        while let Some(current) = queue.pop_front() {
            let is_dir = current.is_dir();
            let masked = match self.mask_for_caller(state, caller, &current).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            out.push(masked);

            if is_dir && !current.is_link() {
                let access = self.access_for_locked(state, &current.name).await?;
                let loader = StateLoader { store: self, state };
                if self.evaluator.can(&access, caller, Right::List, &loader).await? {
                    for child in self.fetch_children(&current).await? {
                        queue.push_back(child);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Atomically seed and install a `watch-current` subscription (spec.md
    /// §4.4.1's "no loss and no duplication around the cutover"). The
    /// metadata read lock is held across both the snapshot and the listener
    /// registration with the event manager: since every mutation commits
    /// and emits its event while holding the write lock (see [`Store::put`]
    /// / [`Store::delete`]), no writer can observe this read lock held and
    /// no mutation can land in the gap between "snapshot taken" and
    /// "listener installed" — it either committed-and-emitted strictly
    /// before the snapshot (so the snapshot already reflects it) or it is
    /// blocked until the listener is live (so it will be delivered live).
    pub async fn watch_current(
        &self,
        caller: String,
        root: Name,
        filter: std::sync::Arc<dyn EventFilter>,
    ) -> Result<crate::event::Subscription, Error> {
        let state = self.state.read().await;
        let entries = self.snapshot_subtree_locked(&state, &caller, root.clone()).await?;
        let subscription = self.events.watch_current(caller, root, entries, filter).await;
        drop(state);
        subscription
    }

    /// Create a fresh, empty root for `user`. `exist` if one is already
    /// present.
    pub async fn make_root(&self, user: &str) -> Result<DirEntry, Error> {
        path::validate_user(user).map_err(|_| {
            Error::new("make_root", Kind::Invalid).with_detail(format!("bad user: {user}"))
        })?;
        let name = Name::root(user)?;

        let mut state = self.state.write().await;
        if state.roots.contains_key(user) {
            return Err(Error::new("make_root", Kind::Exist).with_name(name));
        }

        let mut root_entry = DirEntry::new_directory(name.clone(), user, PLAIN_WITH_INTEGRITY);
        let block_ref = self.store_children(&[]).await?;
        root_entry.blocks = vec![block_ref];
        root_entry.sequence = entry::SEQ_BASE;
        root_entry.time = Time::now();

        state.seq.insert(user.to_string(), entry::SEQ_BASE);
        state.roots.insert(user.to_string(), root_entry.clone());
        // Emitted while the write lock is still held, so a concurrent
        // `watch-current` snapshot can never observe this commit without
        // also observing its event already enqueued (see
        // `Store::watch_current`'s doc comment).
        self.events.emit(EventRecord::put(root_entry.clone()));
        drop(state);

        Ok(root_entry)
    }

    /// Install `new_entry` at `new_entry.name`, subject to `seq_constraint`
    /// ([`entry::SEQ_IGNORE`], [`entry::SEQ_NOT_EXIST`], or an explicit
    /// expected sequence). The caller performing the write is
    /// `new_entry.writer`.
    pub async fn put(&self, mut new_entry: DirEntry, seq_constraint: i64) -> Result<Outcome<DirEntry>, Error> {
        let name = new_entry.name.clone();
        let caller = new_entry.writer.clone();

        if name.is_root() {
            return Err(Error::new("put", Kind::Invalid)
                .with_detail("use make_root to create a user root")
                .with_name(name));
        }
        if (new_entry.is_access_file() || new_entry.is_group_file()) && new_entry.is_link() {
            return Err(Error::new("put", Kind::Invalid)
                .with_detail("access and group files may not be links")
                .with_name(name));
        }
        if (new_entry.is_access_file() || new_entry.is_group_file())
            && new_entry.packing != PLAIN_WITH_INTEGRITY
        {
            return Err(Error::new("put", Kind::Invalid)
                .with_detail("access and group files must use the unpackable-by-all codec")
                .with_name(name));
        }

        let mut state = self.state.write().await;

        let root_entry = state
            .roots
            .get(name.user())
            .cloned()
            .ok_or_else(|| error::not_exist("put", name.clone()))?;

        let parent_name = name.parent().expect("checked above: name is not root");

        let ancestors = match self.walk_to_parent(&root_entry, &name).await? {
            Resolved::FollowLink(link) => return Ok(Outcome::FollowLink(link)),
            Resolved::Value(a) => a,
        };
        let parent = ancestors.last().expect("walk always yields at least the root");
        let existing = parent.children.iter().find(|c| c.name.base() == name.base()).cloned();

        {
            let access = self.access_for_locked(&state, &parent_name).await?;
            let loader = StateLoader { store: self, state: &state };
            let right = if existing.is_some() { Right::Write } else { Right::Create };
            if !self.evaluator.can(&access, &caller, Right::Any, &loader).await? {
                return Err(error::private("put", name));
            }
            if !self.evaluator.can(&access, &caller, right, &loader).await? {
                return Err(error::permission("put", name));
            }
        }

        if let Some(existing) = &existing {
            if existing.is_link() {
                return Ok(Outcome::FollowLink(existing.clone()));
            }
            if existing.is_dir() {
                return Err(Error::new("put", Kind::IsDir).with_name(name));
            }
        }

        match seq_constraint {
            entry::SEQ_IGNORE => {}
            entry::SEQ_NOT_EXIST => {
                if existing.is_some() {
                    return Err(Error::new("put", Kind::Exist).with_name(name));
                }
            }
            want => match &existing {
                Some(e) if e.sequence == want => {}
                Some(_) => return Err(Error::new("put", Kind::SequenceMismatch).with_name(name)),
                None => return Err(error::not_exist("put", name)),
            },
        }

        if new_entry.is_dir() {
            new_entry.packing = PLAIN_WITH_INTEGRITY;
            if new_entry.blocks.is_empty() {
                let block_ref = self.store_children(&[]).await?;
                new_entry.blocks = vec![block_ref];
            }
        }

        // Validate before committing anything: a malformed Access body must
        // leave no trace in the tree, so this has to run before `rewrite_up`
        // and the `state.roots`/`state.seq` commit below, not after.
        if new_entry.is_access_file() {
            let body = self.read_entry_body_locked(&new_entry).await?;
            self.evaluator.parse_and_cache_access(&name, &body).map_err(|e| {
                Error::new("put", Kind::Invalid).with_detail(e.to_string()).with_name(name.clone())
            })?;
        }

        let user = name.user().to_string();
        let next_seq = state.seq.get(&user).copied().unwrap_or(entry::SEQ_BASE - 1) + 1;
        new_entry.sequence = next_seq;
        new_entry.time = Time::now();
        new_entry.signed_name = new_entry.name.clone();

        let mut parent_children = parent.children.clone();
        match parent_children.iter().position(|c| c.name.base() == name.base()) {
            Some(pos) => parent_children[pos] = new_entry.clone(),
            None => parent_children.push(new_entry.clone()),
        }

        let new_root = self.rewrite_up(ancestors, parent_children, next_seq).await?;
        state.seq.insert(user, next_seq);
        state.roots.insert(name.user().to_string(), new_root);

        if new_entry.is_group_file() {
            self.evaluator.remove_group(&name);
        }

        // Emitted before the write lock is released (see `make_root` and
        // `Store::watch_current`'s doc comment): otherwise a racing
        // `watch-current` could take its snapshot after this commit but
        // observe the event only later, or not at all.
        self.events.emit(EventRecord::put(new_entry.clone()));
        drop(state);

        Ok(Outcome::Value(DirEntry::sequence_only(name, next_seq)))
    }

    /// Remove the entry at `name`. Directories must be empty. The root
    /// itself is never removed this way (see [`Store::delete_all`]).
    pub async fn delete(&self, caller: &str, name: Name, seq_constraint: i64) -> Result<Outcome<DirEntry>, Error> {
        if name.is_root() {
            return Err(Error::new("delete", Kind::Invalid)
                .with_detail("the root cannot be removed through delete")
                .with_name(name));
        }

        let mut state = self.state.write().await;
        let root_entry = state
            .roots
            .get(name.user())
            .cloned()
            .ok_or_else(|| error::not_exist("delete", name.clone()))?;

        let parent_name = name.parent().expect("checked above: name is not root");
        let ancestors = match self.walk_to_parent(&root_entry, &name).await? {
            Resolved::FollowLink(link) => return Ok(Outcome::FollowLink(link)),
            Resolved::Value(a) => a,
        };
        let parent = ancestors.last().expect("walk always yields at least the root");

        let existing = parent.children.iter().find(|c| c.name.base() == name.base()).cloned();
        let Some(existing) = existing else {
            let access = self.access_for_locked(&state, &parent_name).await?;
            let loader = StateLoader { store: self, state: &state };
            if !self.evaluator.can(&access, caller, Right::Any, &loader).await? {
                return Err(error::private("delete", name));
            }
            return Err(error::not_exist("delete", name));
        };

        if existing.is_link() {
            return Ok(Outcome::FollowLink(existing));
        }
        if existing.is_dir() {
            let children = self.fetch_children(&existing).await?;
            if !children.is_empty() {
                return Err(Error::new("delete", Kind::NotEmpty).with_name(name));
            }
        }

        {
            let access = self.access_for_locked(&state, &parent_name).await?;
            let loader = StateLoader { store: self, state: &state };
            if !self.evaluator.can(&access, caller, Right::Any, &loader).await? {
                return Err(error::private("delete", name));
            }
            if !self.evaluator.can(&access, caller, Right::Delete, &loader).await? {
                return Err(error::permission("delete", name));
            }
        }

        match seq_constraint {
            entry::SEQ_IGNORE => {}
            entry::SEQ_NOT_EXIST => return Err(Error::new("delete", Kind::Exist).with_name(name)),
            want if want == existing.sequence => {}
            _ => return Err(Error::new("delete", Kind::SequenceMismatch).with_name(name)),
        }

        let user = name.user().to_string();
        let next_seq = state.seq.get(&user).copied().unwrap_or(entry::SEQ_BASE - 1) + 1;

        let mut parent_children = parent.children.clone();
        parent_children.retain(|c| c.name.base() != name.base());

        let new_root = self.rewrite_up(ancestors, parent_children, next_seq).await?;
        state.seq.insert(user, next_seq);
        state.roots.insert(name.user().to_string(), new_root);

        if existing.is_access_file() {
            self.evaluator.invalidate_access(&name);
        }
        if existing.is_group_file() {
            self.evaluator.remove_group(&name);
        }

        let mut deleted = existing;
        deleted.sequence = next_seq;
        // Emitted before the write lock is released; see `put`'s equivalent
        // comment.
        self.events.emit(EventRecord::delete(deleted.clone()));
        drop(state);
        Ok(Outcome::Value(deleted))
    }

    /// Resolve `name`. `follow_final` controls whether a link named exactly
    /// by `name` is itself returned (`false`) or reported as
    /// [`Outcome::FollowLink`] (`true`); intermediate links are always
    /// reported as [`Outcome::FollowLink`] regardless.
    pub async fn lookup(&self, caller: &str, name: Name, follow_final: bool) -> Result<Outcome<DirEntry>, Error> {
        let state = self.state.read().await;
        let root_entry = state
            .roots
            .get(name.user())
            .cloned()
            .ok_or_else(|| error::not_exist("lookup", name.clone()))?;

        if name.is_root() {
            let masked = self.mask_for_caller(&state, caller, &root_entry).await?;
            return Ok(Outcome::Value(masked));
        }

        let elems = name.elems();
        let mut current = root_entry;
        for (i, elem) in elems.iter().enumerate() {
            let is_last = i == elems.len() - 1;
            let children = self.fetch_children(&current).await?;
            let next = children.into_iter().find(|c| c.name.base() == elem.as_str());
            match next {
                Some(e) if e.is_link() && (!is_last || follow_final) => {
                    return Ok(Outcome::FollowLink(e));
                }
                Some(e) => {
                    if !is_last && !e.is_dir() {
                        return Err(Error::new("lookup", Kind::NotDir).with_name(name.first(i + 1)));
                    }
                    current = e;
                }
                None => {
                    let parent = name.first(i);
                    let access = self.access_for_locked(&state, &parent).await?;
                    let loader = StateLoader { store: self, state: &state };
                    if !self.evaluator.can(&access, caller, Right::Any, &loader).await? {
                        return Err(error::private("lookup", name));
                    }
                    return Err(error::not_exist("lookup", name));
                }
            }
        }

        let masked = self.mask_for_caller(&state, caller, &current).await?;
        Ok(Outcome::Value(masked))
    }

    /// Breadth-first elementwise expansion of a (possibly glob) path.
    /// Directories the caller lacks `list` on are silently skipped, not
    /// reported as an error; links encountered along the way are collected
    /// separately rather than expanded through.
    pub async fn glob(&self, caller: &str, pattern: Name) -> Result<GlobResult, Error> {
        let state = self.state.read().await;
        let root_entry = state
            .roots
            .get(pattern.user())
            .cloned()
            .ok_or_else(|| error::not_exist("glob", pattern.clone()))?;

        let elems = pattern.elems().to_vec();
        let mut candidates = vec![root_entry];
        let mut links = Vec::new();

        for (i, elem) in elems.iter().enumerate() {
            let is_last = i == elems.len() - 1;
            let mut next_candidates = Vec::new();

            for dir in candidates {
                let access = self.access_for_locked(&state, &dir.name).await?;
                let loader = StateLoader { store: self, state: &state };
                if !self.evaluator.can(&access, caller, Right::List, &loader).await? {
                    continue;
                }
                let children = self.fetch_children(&dir).await?;
                for child in children {
                    let matches = if path::is_glob_elem(elem) {
                        glob_match(elem, child.name.base())
                    } else {
                        child.name.base() == elem.as_str()
                    };
                    if !matches {
                        continue;
                    }
                    if child.is_link() {
                        links.push(child);
                        continue;
                    }
                    if is_last || child.is_dir() {
                        next_candidates.push(child);
                    }
                }
            }

            candidates = next_candidates;
            if candidates.is_empty() {
                break;
            }
        }

        let mut entries = Vec::with_capacity(candidates.len());
        for entry in candidates {
            entries.push(self.mask_for_caller(&state, caller, &entry).await?);
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        links.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(GlobResult { entries, links })
    }

    /// The `Access` entry governing `name` (climbing upward), or `None` if
    /// no `Access` file exists anywhere above it (the implicit
    /// owner-only default applies). Deliberately textual: an ancestor
    /// directory reached only through a link is not consulted (see the
    /// module-level note on `WhichAccess` in the crate's design notes).
    pub async fn which_access(&self, caller: &str, name: Name) -> Result<Option<DirEntry>, Error> {
        let state = self.state.read().await;
        if !state.roots.contains_key(name.user()) {
            return Err(error::not_exist("which_access", name));
        }

        let governing = self.which_access_locked(&state, &name).await?;

        let access = match &governing {
            Some((_, parsed)) => parsed.clone(),
            None => Arc::new(ParsedAccess::owner_default(name.user())),
        };
        let loader = StateLoader { store: self, state: &state };
        if !self.evaluator.can(&access, caller, Right::Any, &loader).await? {
            return Err(error::private("which_access", name));
        }

        let Some((path, _)) = governing else {
            return Ok(None);
        };
        let parent = path.parent().expect("access file paths are never root");
        if let Some((_, children)) = self.dir_listing_locked(&state, &parent).await? {
            if let Some(access_entry) = children.into_iter().find(|c| c.name == path) {
                return Ok(Some(access_entry));
            }
        }
        Ok(None)
    }

    /// Test-only bulk purge of a user's entire tree, bypassing access
    /// control. Not reachable through the server facade's public API.
    pub async fn delete_all(&self, user: &str) {
        let mut state = self.state.write().await;
        state.roots.remove(user);
        state.seq.remove(user);
    }

    async fn mask_for_caller(&self, state: &State, caller: &str, entry: &DirEntry) -> Result<DirEntry, Error> {
        if entry.is_access_file() {
            return Ok(entry.clone());
        }
        let governing_dir = if entry.name.is_root() { entry.name.clone() } else { entry.name.parent().unwrap() };
        let access = self.access_for_locked(state, &governing_dir).await?;
        let loader = StateLoader { store: self, state };
        if !self.evaluator.can(&access, caller, Right::Any, &loader).await? {
            return Err(error::private("lookup", entry.name.clone()));
        }
        if self.evaluator.can(&access, caller, Right::Read, &loader).await? {
            Ok(entry.clone())
        } else {
            Ok(entry.to_incomplete())
        }
    }

    async fn access_for_locked(&self, state: &State, dir: &Name) -> Result<Arc<ParsedAccess>, Error> {
        match self.which_access_locked(state, dir).await? {
            Some((_, parsed)) => Ok(parsed),
            None => Ok(Arc::new(ParsedAccess::owner_default(dir.user()))),
        }
    }

    async fn which_access_locked(&self, state: &State, dir: &Name) -> Result<Option<(Name, Arc<ParsedAccess>)>, Error> {
        let mut cur = dir.clone();
        loop {
            let access_path = cur.join("Access")?;
            if let Some(cached) = self.evaluator.cached_access(&access_path) {
                return Ok(Some((access_path, cached)));
            }
            if let Some((_, children)) = self.dir_listing_locked(state, &cur).await? {
                if let Some(found) = children.iter().find(|c| c.name.base() == "Access") {
                    if !found.is_link() {
                        let body = self.read_entry_body_locked(found).await?;
                        let parsed = self.evaluator.parse_and_cache_access(&access_path, &body).map_err(|e| {
                            Error::new("which_access", Kind::Invalid)
                                .with_detail(e.to_string())
                                .with_name(access_path.clone())
                        })?;
                        return Ok(Some((access_path, parsed)));
                    }
                }
            }
            match cur.parent() {
                Some(p) => cur = p,
                None => return Ok(None),
            }
        }
    }

    async fn dir_listing_locked(&self, state: &State, dir_name: &Name) -> Result<Option<(DirEntry, Vec<DirEntry>)>, Error> {
        let Some(root_entry) = state.roots.get(dir_name.user()).cloned() else {
            return Ok(None);
        };
        let mut current = root_entry;
        for elem in dir_name.elems() {
            let children = self.fetch_children(&current).await?;
            match children.into_iter().find(|c| c.name.base() == elem.as_str()) {
                Some(e) if e.is_dir() => current = e,
                _ => return Ok(None),
            }
        }
        let children = self.fetch_children(&current).await?;
        Ok(Some((current, children)))
    }

    async fn fetch_body_locked(&self, state: &State, path: &Name) -> Result<Vec<u8>, Error> {
        let parent = path.parent().expect("group and access file paths are never root");
        if let Some((_, children)) = self.dir_listing_locked(state, &parent).await? {
            if let Some(found) = children.iter().find(|c| c.name.base() == path.base()) {
                if found.is_link() {
                    return Err(Error::new("load_group", Kind::Invalid)
                        .with_detail("group path resolves through a link")
                        .with_name(path.clone()));
                }
                return self.read_entry_body_locked(found).await;
            }
        }
        Err(error::not_exist("load_group", path.clone()))
    }

    async fn read_entry_body_locked(&self, entry: &DirEntry) -> Result<Vec<u8>, Error> {
        if entry.packing != PLAIN_WITH_INTEGRITY {
            return Err(Error::new("read_entry_body", Kind::NotSupported).with_name(entry.name.clone()));
        }
        let mut body = Vec::new();
        for block in &entry.blocks {
            let (bytes, _) = self
                .content
                .get(&block.reference)
                .await
                .map_err(|e| Error::new("read_entry_body", Kind::Io).with_name(entry.name.clone()).with_source(e))?;
            let unpacked = self.packer.unpack(&bytes).map_err(|e| {
                Error::new("read_entry_body", Kind::Internal).with_name(entry.name.clone()).with_detail(e.to_string())
            })?;
            body.extend_from_slice(&unpacked);
        }
        Ok(body)
    }

    async fn fetch_children(&self, entry: &DirEntry) -> Result<Vec<DirEntry>, Error> {
        if entry.blocks.is_empty() {
            return Ok(Vec::new());
        }
        let (bytes, _) = self
            .content
            .get(&entry.blocks[0].reference)
            .await
            .map_err(|e| Error::new("fetch_children", Kind::Io).with_name(entry.name.clone()).with_source(e))?;
        let unpacked = self.packer.unpack(&bytes).map_err(|e| {
            Error::new("fetch_children", Kind::Internal).with_name(entry.name.clone()).with_detail(e.to_string())
        })?;
        block::decode_block(&unpacked).map_err(|e| {
            Error::new("fetch_children", Kind::Internal).with_name(entry.name.clone()).with_detail(e.to_string())
        })
    }

    async fn store_children(&self, children: &[DirEntry]) -> Result<BlockRef, Error> {
        let bytes = block::encode_block(children);
        let size = bytes.len() as u64;
        let packed = self.packer.pack(&bytes);
        let refdata = self
            .content
            .put(packed)
            .await
            .map_err(|e| Error::new("store_children", Kind::Io).with_source(e))?;
        Ok(BlockRef { store_endpoint: "memory".into(), reference: refdata.reference, offset: 0, size, pack_data: Vec::new() })
    }

    /// Walk from `root_entry` down to (not including) the entry named by
    /// `name`, collecting each directory level's own entry and decoded
    /// child list. Stops early with [`Resolved::FollowLink`] if any
    /// intermediate segment is a link.
    async fn walk_to_parent(&self, root_entry: &DirEntry, name: &Name) -> Result<Resolved<Vec<Ancestor>>, Error> {
        let elems = name.elems();
        let mut ancestors = Vec::with_capacity(elems.len());
        let mut current = root_entry.clone();

        for i in 0..elems.len().saturating_sub(1) {
            let children = self.fetch_children(&current).await?;
            let next = children.iter().find(|c| c.name.base() == elems[i].as_str()).cloned();
            ancestors.push(Ancestor { entry: current.clone(), children });
            match next {
                Some(e) if e.is_link() => return Ok(Resolved::FollowLink(e)),
                Some(e) if e.is_dir() => current = e,
                Some(_) => return Err(Error::new("put", Kind::NotDir).with_name(name.first(i + 1))),
                None => return Err(error::not_exist("put", name.first(i + 1))),
            }
        }

        let children = self.fetch_children(&current).await?;
        ancestors.push(Ancestor { entry: current, children });
        Ok(Resolved::Value(ancestors))
    }

    /// Re-encode and re-store every directory level from the deepest
    /// ancestor (the target's parent) up to the root, given the parent's
    /// already-updated child list. Returns the new root entry.
    async fn rewrite_up(&self, ancestors: Vec<Ancestor>, children_at_parent: Vec<DirEntry>, seq: i64) -> Result<DirEntry, Error> {
        let mut iter = ancestors.into_iter().rev();
        let deepest = iter.next().expect("walk always yields at least the root");

        let block_ref = self.store_children(&children_at_parent).await?;
        let mut current_new_entry = deepest.entry;
        current_new_entry.blocks = vec![block_ref];
        current_new_entry.sequence = seq;
        current_new_entry.time = Time::now();

        for ancestor in iter {
            let base_name = current_new_entry.name.base().to_string();
            let mut new_children = ancestor.children;
            match new_children.iter().position(|c| c.name.base() == base_name) {
                Some(pos) => new_children[pos] = current_new_entry.clone(),
                None => new_children.push(current_new_entry.clone()),
            }
            let block_ref = self.store_children(&new_children).await?;
            let mut new_entry = ancestor.entry;
            new_entry.blocks = vec![block_ref];
            new_entry.sequence = seq;
            new_entry.time = Time::now();
            current_new_entry = new_entry;
        }

        Ok(current_new_entry)
    }
}

/// Lets the store act as its own [`EventFilter`]: a subscriber sees exactly
/// the (possibly incomplete-masked) entry that [`Store::lookup`] would hand
/// it, and nothing at all if it has no right on the path (spec.md §4.4).
#[async_trait]
impl EventFilter for Store {
    async fn filter(&self, subscriber: &str, entry: &DirEntry) -> Option<DirEntry> {
        let state = self.state.read().await;
        self.mask_for_caller(&state, subscriber, entry).await.ok()
    }
}

/// Minimal shell-style matcher for `* ? [...]`, applied one path element at
/// a time (no element ever contains `/`, so there is no need to special-case
/// path separators the way a filesystem glob would).
fn glob_match(pattern: &str, text: &str) -> bool {
    fn go(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => go(&p[1..], t) || (!t.is_empty() && go(p, &t[1..])),
            (Some(b'?'), Some(_)) => go(&p[1..], &t[1..]),
            (Some(b'['), _) => match p.iter().position(|&c| c == b']') {
                Some(close) if close > 0 => {
                    let class = &p[1..close];
                    !t.is_empty() && class.contains(&t[0]) && go(&p[close + 1..], &t[1..])
                }
                _ => false,
            },
            (Some(pc), Some(tc)) if pc == tc => go(&p[1..], &t[1..]),
            _ => false,
        }
    }
    go(pattern.as_bytes(), text.as_bytes())
}
