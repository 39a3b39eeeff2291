//! Access evaluator (spec.md §4.2): parses access-file and group-file
//! bodies and evaluates `(user, right, path)` against a parsed access file,
//! recursively expanding group membership through a caller-supplied
//! loader.

mod parser;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use moka::sync::Cache;

use crate::error::Error;
use crate::path::Name;

pub use parser::{parse_access, parse_group, ParseError};

/// Rights an access file can grant. `Any` is synthetic: "does the caller
/// have any right at all", used to decide whether an unauthorized caller
/// gets `private` rather than a more specific error (spec.md §3, §7).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Right {
    Read,
    Write,
    Create,
    Delete,
    List,
    Any,
}

/// All rights an access file can explicitly grant (excludes the synthetic
/// [`Right::Any`]).
pub const EXPLICIT_RIGHTS: [Right; 5] =
    [Right::Read, Right::Write, Right::Create, Right::Delete, Right::List];

/// One principal named on the right-hand side of an access- or group-file
/// line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    User(String),
    DomainWildcard(String),
    All,
    Group(Name),
}

impl Principal {
    fn matches_user(&self, user: &str) -> bool {
        match self {
            Principal::User(u) => u == user,
            Principal::DomainWildcard(domain) => {
                user.rsplit_once('@').map(|(_, d)| d == domain).unwrap_or(false)
            }
            Principal::All => true,
            Principal::Group(_) => false,
        }
    }
}

/// A parsed `Access` file: the set of principals granted each explicit
/// right.
#[derive(Debug, Clone, Default)]
pub struct ParsedAccess {
    grants: std::collections::HashMap<Right, Vec<Principal>>,
}

impl ParsedAccess {
    fn principals_for(&self, right: Right) -> Vec<&Principal> {
        if right == Right::Any {
            EXPLICIT_RIGHTS
                .iter()
                .flat_map(|r| self.grants.get(r).into_iter().flatten())
                .collect()
        } else {
            self.grants.get(&right).into_iter().flatten().collect()
        }
    }

    /// An access file granting every explicit right to `owner` alone, used
    /// as the implicit default when no `Access` file governs a path
    /// (spec.md §4.3 `rootAccess`).
    pub fn owner_default(owner: impl Into<String>) -> Self {
        let owner = owner.into();
        let mut grants = std::collections::HashMap::new();
        for right in EXPLICIT_RIGHTS {
            grants.insert(right, vec![Principal::User(owner.clone())]);
        }
        Self { grants }
    }

    /// A synthetic access file granting only `right` to `principals`, used
    /// to reuse [`Evaluator::can`]'s group-expansion logic for policy files
    /// that aren't really access files (e.g. [`crate::gate`]'s `Writers`
    /// group).
    pub fn with_grant(right: Right, principals: Vec<Principal>) -> Self {
        let mut grants = std::collections::HashMap::new();
        grants.insert(right, principals);
        Self { grants }
    }
}

/// Fetches a group file's raw body given its path. Implemented by
/// [`crate::store::Store`] so group files may live in another user's tree
/// (spec.md §4.2).
#[async_trait]
pub trait GroupLoader: Send + Sync {
    async fn load_group_body(&self, path: &Name) -> Result<Vec<u8>, Error>;
}

/// Owns the process-wide access-file and group-file caches and evaluates
/// grants against them.
///
/// Caches are invalidated explicitly: [`Evaluator::invalidate_access`] and
/// [`Evaluator::remove_group`] are called by [`crate::store::Store`] on
/// every successful put or delete of a matching path (spec.md §4.2, §9).
pub struct Evaluator {
    access_cache: Cache<Name, Arc<ParsedAccess>>,
    group_cache: Cache<Name, Arc<Vec<Principal>>>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Self {
            access_cache: Cache::new(10_000),
            group_cache: Cache::new(10_000),
        }
    }

    /// Parse `body` as an access file governing `path`, caching the result.
    pub fn parse_and_cache_access(
        &self,
        path: &Name,
        body: &[u8],
    ) -> Result<Arc<ParsedAccess>, ParseError> {
        let parsed = Arc::new(parse_access(body)?);
        self.access_cache.insert(path.clone(), parsed.clone());
        Ok(parsed)
    }

    pub fn cached_access(&self, path: &Name) -> Option<Arc<ParsedAccess>> {
        self.access_cache.get(path)
    }

    /// Drop a cached access file, e.g. because it was deleted or
    /// overwritten (spec.md §9 "global cache invalidation").
    pub fn invalidate_access(&self, path: &Name) {
        self.access_cache.invalidate(path);
    }

    /// Drop a cached group's expansion, both on an explicit `RemoveGroup`
    /// request and whenever the store commits a put/delete of the group
    /// file itself (spec.md §4.2, §9).
    pub fn remove_group(&self, path: &Name) {
        self.group_cache.invalidate(path);
    }

    async fn load_group(
        &self,
        path: &Name,
        loader: &dyn GroupLoader,
    ) -> Result<Arc<Vec<Principal>>, Error> {
        if let Some(cached) = self.group_cache.get(path) {
            return Ok(cached);
        }
        let body = loader.load_group_body(path).await?;
        let principals = parse_group(&body)
            .map_err(|e| crate::error::invalid("load_group", e.to_string()).with_name(path.clone()))?;
        let principals = Arc::new(principals);
        self.group_cache.insert(path.clone(), principals.clone());
        Ok(principals)
    }

    /// Evaluate whether `user` holds `right` under `access`, expanding
    /// group references breadth-first through `loader`. A group reference
    /// that is revisited during one evaluation (a cycle) is treated as an
    /// empty group rather than an error (spec.md §9).
    pub async fn can(
        &self,
        access: &ParsedAccess,
        user: &str,
        right: Right,
        loader: &dyn GroupLoader,
    ) -> Result<bool, Error> {
        let mut queue: VecDeque<Name> = VecDeque::new();
        for p in access.principals_for(right) {
            match p {
                Principal::Group(g) => queue.push_back(g.clone()),
                other => {
                    if other.matches_user(user) {
                        return Ok(true);
                    }
                }
            }
        }

        let mut visited: HashSet<Name> = HashSet::new();
        while let Some(group_path) = queue.pop_front() {
            if !visited.insert(group_path.clone()) {
                continue;
            }
            let members = self.load_group(&group_path, loader).await?;
            for m in members.iter() {
                match m {
                    Principal::Group(g) => queue.push_back(g.clone()),
                    other => {
                        if other.matches_user(user) {
                            return Ok(true);
                        }
                    }
                }
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeLoader {
        bodies: Mutex<HashMap<Name, Vec<u8>>>,
    }

    #[async_trait]
    impl GroupLoader for FakeLoader {
        async fn load_group_body(&self, path: &Name) -> Result<Vec<u8>, Error> {
            self.bodies
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| crate::error::not_exist("load_group_body", path.clone()))
        }
    }

    fn loader(pairs: &[(&str, &str)]) -> FakeLoader {
        let mut bodies = HashMap::new();
        for (path, body) in pairs {
            bodies.insert(path::parse(path).unwrap(), body.as_bytes().to_vec());
        }
        FakeLoader { bodies: Mutex::new(bodies) }
    }

    #[tokio::test]
    async fn direct_user_grant() {
        let access = parse_access(b"read: ann@example.com\n").unwrap();
        let ev = Evaluator::new();
        let ld = loader(&[]);
        assert!(ev.can(&access, "ann@example.com", Right::Read, &ld).await.unwrap());
        assert!(!ev.can(&access, "bob@example.com", Right::Read, &ld).await.unwrap());
    }

    #[tokio::test]
    async fn domain_wildcard_grant() {
        let access = parse_access(b"read: *@example.com\n").unwrap();
        let ev = Evaluator::new();
        let ld = loader(&[]);
        assert!(ev.can(&access, "anyone@example.com", Right::Read, &ld).await.unwrap());
        assert!(!ev.can(&access, "anyone@other.com", Right::Read, &ld).await.unwrap());
    }

    #[tokio::test]
    async fn group_expansion() {
        let access = parse_access(b"read: ann@example.com/Group/friends\n").unwrap();
        let ev = Evaluator::new();
        let ld = loader(&[("ann@example.com/Group/friends", "bob@example.com")]);
        assert!(ev.can(&access, "bob@example.com", Right::Read, &ld).await.unwrap());
        assert!(!ev.can(&access, "carol@example.com", Right::Read, &ld).await.unwrap());
    }

    #[tokio::test]
    async fn nested_group_cycle_is_empty_not_error() {
        let access = parse_access(b"read: ann@example.com/Group/a\n").unwrap();
        let ev = Evaluator::new();
        let ld = loader(&[
            ("ann@example.com/Group/a", "ann@example.com/Group/b"),
            ("ann@example.com/Group/b", "ann@example.com/Group/a"),
        ]);
        // neither group ever names a concrete user; the cycle must terminate.
        assert!(!ev.can(&access, "mallory@example.com", Right::Read, &ld).await.unwrap());
    }

    #[tokio::test]
    async fn any_right_is_union_of_explicit_rights() {
        let access = parse_access(b"list: ann@example.com\nwrite: bob@example.com\n").unwrap();
        let ev = Evaluator::new();
        let ld = loader(&[]);
        assert!(ev.can(&access, "ann@example.com", Right::Any, &ld).await.unwrap());
        assert!(ev.can(&access, "bob@example.com", Right::Any, &ld).await.unwrap());
        assert!(!ev.can(&access, "carol@example.com", Right::Any, &ld).await.unwrap());
    }

    #[test]
    fn owner_default_grants_all_explicit_rights() {
        let access = ParsedAccess::owner_default("ann@example.com");
        for right in EXPLICIT_RIGHTS {
            assert_eq!(access.principals_for(right).len(), 1);
        }
    }
}
