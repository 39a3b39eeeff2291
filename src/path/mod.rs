//! Path name parsing and the name algebra: `<user>/<elem1>/<elem2>/…`.
//!
//! `<user>` is a `local@domain` identifier. Paths are cleaned on parse: no
//! `.`, `..`, or redundant slashes survive. The root path of a user is
//! exactly `<user>/`.

use std::fmt;

use crate::error::{Error, Kind};

const GLOB_META: &[char] = &['*', '?', '[', ']'];

/// A cleaned, user-qualified path.
///
/// `Name` is cheap to clone (an owned user string plus an owned element
/// vector) and is used as a map key throughout [`crate::store`] and
/// [`crate::access`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name {
    user: String,
    elems: Vec<String>,
}

impl Name {
    /// Build a `Name` directly from an already-validated user and element
    /// list. Used internally once a path has been parsed or joined.
    fn from_parts(user: String, elems: Vec<String>) -> Self {
        Self { user, elems }
    }

    /// The root name for `user` (`user/`).
    pub fn root(user: impl Into<String>) -> Result<Self, Error> {
        let user = user.into();
        validate_user(&user)?;
        Ok(Self { user, elems: Vec::new() })
    }

    /// The user component, e.g. `ann@example.com`.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The cleaned path elements, e.g. `["dir", "file"]`.
    pub fn elems(&self) -> &[String] {
        &self.elems
    }

    /// Number of elements (0 for the root).
    pub fn nelem(&self) -> usize {
        self.elems.len()
    }

    /// `true` if this is the user's root (`user/`).
    pub fn is_root(&self) -> bool {
        self.elems.is_empty()
    }

    /// The `i`th element, if present.
    pub fn elem(&self, i: usize) -> Option<&str> {
        self.elems.get(i).map(String::as_str)
    }

    /// The first `n` elements of this name, as a new `Name` rooted at the
    /// same user. `n` is clamped to [`Name::nelem`].
    pub fn first(&self, n: usize) -> Name {
        let n = n.min(self.elems.len());
        Name::from_parts(self.user.clone(), self.elems[..n].to_vec())
    }

    /// All but the first `n` elements, as a new `Name` whose user is
    /// unchanged. Used by [`crate::access`] to re-root group references.
    pub fn drop(&self, n: usize) -> Name {
        let n = n.min(self.elems.len());
        Name::from_parts(self.user.clone(), self.elems[n..].to_vec())
    }

    /// The parent of this name. `None` for the root.
    pub fn parent(&self) -> Option<Name> {
        if self.elems.is_empty() {
            None
        } else {
            Some(self.first(self.elems.len() - 1))
        }
    }

    /// The final element's name, or the empty string for the root.
    pub fn base(&self) -> &str {
        self.elems.last().map(String::as_str).unwrap_or("")
    }

    /// Join additional slash-separated elements onto this name, cleaning the
    /// result (rejecting `.`/`..`/empty segments).
    pub fn join(&self, suffix: &str) -> Result<Name, Error> {
        let mut elems = self.elems.clone();
        for seg in suffix.split('/') {
            if seg.is_empty() || seg == "." {
                continue;
            }
            if seg == ".." {
                return Err(invalid_path("join", format!("{self}/{suffix}")));
            }
            elems.push(seg.to_string());
        }
        Ok(Name::from_parts(self.user.clone(), elems))
    }

    /// `true` if `self` names `other` or an ancestor of `other`.
    pub fn has_prefix(&self, other: &Name) -> bool {
        self.user == other.user
            && self.elems.len() <= other.elems.len()
            && self.elems == other.elems[..self.elems.len()]
    }

    /// `true` if any element of this name contains a glob metacharacter.
    pub fn is_glob(&self) -> bool {
        self.elems.iter().any(|e| is_glob_elem(e))
    }

    /// Path string usable as a local filesystem path fragment: elements
    /// joined with `/`, no leading slash, no user component.
    pub fn file_path(&self) -> String {
        self.elems.join("/")
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.elems.join("/"))
    }
}

/// `true` if `elem` contains any of `* ? [ ]`.
pub fn is_glob_elem(elem: &str) -> bool {
    elem.chars().any(|c| GLOB_META.contains(&c))
}

fn invalid_path(op: &'static str, path: impl Into<String>) -> Error {
    Error::new(op, Kind::Invalid).with_detail(path.into())
}

/// Parse a full path string of the form `user@domain/elem1/elem2/…` into a
/// cleaned [`Name`].
///
/// Fails with [`Kind::Invalid`] if the user part is not a syntactically
/// valid `local@domain` identifier. Empty interior elements (`//`, trailing
/// `/.`) are dropped by cleaning rather than rejected, mirroring ordinary
/// path-cleaning semantics; `.` is a no-op and `..` is rejected outright
/// since the directory tree has no notion of escaping the root.
pub fn parse(s: &str) -> Result<Name, Error> {
    let mut parts = s.splitn(2, '/');
    let user = parts.next().unwrap_or("");
    validate_user(user).map_err(|_| invalid_path("parse", s))?;

    let rest = parts.next().unwrap_or("");
    let mut elems = Vec::new();
    for seg in rest.split('/') {
        if seg.is_empty() || seg == "." {
            continue;
        }
        if seg == ".." {
            return Err(invalid_path("parse", s));
        }
        elems.push(seg.to_string());
    }
    Ok(Name::from_parts(user.to_string(), elems))
}

/// Validate a bare `local@domain` user identifier (no path component).
pub fn validate_user(user: &str) -> Result<(), Error> {
    let mut at = user.splitn(2, '@');
    let local = at.next().unwrap_or("");
    let domain = at.next();
    let domain = match domain {
        Some(d) if !d.is_empty() => d,
        _ => return Err(invalid_path("validate_user", user)),
    };
    if local.is_empty() {
        return Err(invalid_path("validate_user", user));
    }
    if domain.contains('/') || local.contains('/') {
        return Err(invalid_path("validate_user", user));
    }
    if !domain.contains('.') {
        return Err(invalid_path("validate_user", user));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_root() {
        let n = parse("ann@example.com/").unwrap();
        assert!(n.is_root());
        assert_eq!(n.user(), "ann@example.com");
        assert_eq!(n.to_string(), "ann@example.com/");
    }

    #[test]
    fn parses_nested_path_and_cleans() {
        let n = parse("ann@example.com//dir//file/./").unwrap();
        assert_eq!(n.elems(), &["dir".to_string(), "file".to_string()]);
    }

    #[test]
    fn rejects_dotdot() {
        assert!(parse("ann@example.com/dir/../file").is_err());
    }

    #[test]
    fn rejects_malformed_user() {
        assert!(parse("ann/file").is_err());
        assert!(parse("ann@/file").is_err());
        assert!(parse("@example.com/file").is_err());
    }

    #[test]
    fn join_cleans_and_rejects_dotdot() {
        let root = parse("ann@example.com/").unwrap();
        let child = root.join("a/b").unwrap();
        assert_eq!(child.to_string(), "ann@example.com/a/b");
        assert!(root.join("a/../b").is_err());
    }

    #[test]
    fn first_and_drop_partition_elements() {
        let n = parse("ann@example.com/a/b/c").unwrap();
        assert_eq!(n.first(2).to_string(), "ann@example.com/a/b");
        assert_eq!(n.drop(2).elems(), &["c".to_string()]);
    }

    #[test]
    fn has_prefix_checks_ancestry() {
        let parent = parse("ann@example.com/a").unwrap();
        let child = parse("ann@example.com/a/b").unwrap();
        let other = parse("ann@example.com/x").unwrap();
        assert!(parent.has_prefix(&child));
        assert!(!child.has_prefix(&parent));
        assert!(!parent.has_prefix(&other));
    }

    #[test]
    fn glob_detection() {
        assert!(is_glob_elem("*.txt"));
        assert!(is_glob_elem("file?"));
        assert!(is_glob_elem("[abc]"));
        assert!(!is_glob_elem("plain"));
        let n = parse("ann@example.com/dir/*.txt").unwrap();
        assert!(n.is_glob());
    }

    #[test]
    fn parent_of_root_is_none() {
        let root = parse("ann@example.com/").unwrap();
        assert!(root.parent().is_none());
        let child = parse("ann@example.com/a").unwrap();
        assert_eq!(child.parent().unwrap(), root);
    }
}
