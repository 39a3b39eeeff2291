//! Shared fixture for the integration suite, mirroring the teacher's own
//! `tests/shadow_fs/common.rs` fixture shape: one setup type plus a handful
//! of thin convenience methods, no fixture-internal assertions.

use std::sync::Arc;
use std::time::Duration;

use dirserve::content::MemoryContentStore;
use dirserve::error::Error;
use dirserve::event::EventManager;
use dirserve::path::{self, Name};
use dirserve::server::Server;
use dirserve::store::entry::{BlockRef, SEQ_NOT_EXIST};
use dirserve::store::{Outcome, Store};

pub struct Fixture {
    pub server: Server,
}

impl Fixture {
    /// A server instance hosted by `server_user`, with a permission gate
    /// that has not yet (and by default never will) restrict writers: the
    /// tests that care about the Writers policy set it up explicitly.
    pub async fn new(server_user: &str) -> Self {
        let store = Arc::new(Store::new(
            Arc::new(MemoryContentStore::new()),
            EventManager::spawn(Duration::from_secs(5)),
        ));
        let server = Server::start(store, server_user.to_string(), Duration::from_millis(20)).await.unwrap();
        Self { server }
    }

    pub fn name(&self, s: &str) -> Name {
        path::parse(s).unwrap()
    }

    pub async fn block(&self, body: &[u8]) -> BlockRef {
        self.server.store().pack_and_store(body).await.unwrap()
    }

    /// Put a regular file at `path`, written by `writer`, under
    /// `seq_constraint`, returning the resulting incomplete
    /// sequence-carrying entry on success.
    pub async fn put(&self, path: &str, writer: &str, body: &[u8], seq_constraint: i64) -> Result<Outcome<dirserve::store::entry::DirEntry>, Error> {
        let block = self.block(body).await;
        self.server.put(self.name(path), writer, vec![block], seq_constraint).await
    }

    pub async fn put_ok(&self, path: &str, writer: &str, body: &[u8]) -> i64 {
        match self.put(path, writer, body, SEQ_NOT_EXIST).await.unwrap() {
            Outcome::Value(e) => e.sequence,
            Outcome::FollowLink(_) => panic!("expected direct put, got follow-link"),
        }
    }

    pub async fn make_directory(&self, path: &str, caller: &str) {
        self.server.make_directory(caller, self.name(path), SEQ_NOT_EXIST).await.unwrap();
    }

    pub async fn lookup_ok(&self, path: &str, caller: &str) -> dirserve::store::entry::DirEntry {
        match self.server.lookup(caller, self.name(path), true).await.unwrap() {
            Outcome::Value(e) => e,
            Outcome::FollowLink(_) => panic!("expected direct lookup, got follow-link"),
        }
    }
}
