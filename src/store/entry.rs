//! The directory entry: the metadata record for one path (spec.md §3).

use std::time::{SystemTime, UNIX_EPOCH};

use crate::content::Reference;
use crate::packing::PackTag;
use crate::path::Name;

/// `seq-ignore`: accept any existing sequence.
pub const SEQ_IGNORE: i64 = -1;
/// `seq-not-exist`: require the target name to be absent.
pub const SEQ_NOT_EXIST: i64 = -2;
/// Starting sequence value for a freshly created user root.
pub const SEQ_BASE: i64 = 1;

/// The kind of node a [`DirEntry`] names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attr {
    Regular,
    Directory,
    Link,
    Incomplete,
}

/// One block of a (possibly multi-block) entry's content: a byte range
/// stored under `reference` at `store_endpoint`, with per-block packer
/// state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRef {
    pub store_endpoint: String,
    pub reference: Reference,
    pub offset: u64,
    pub size: u64,
    pub pack_data: Vec<u8>,
}

/// Wall-clock timestamp, monotone-best-effort, never used for ordering
/// (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Time(pub i64);

impl Time {
    pub fn now() -> Self {
        let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        Time(secs as i64)
    }
}

/// The metadata record for one path (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Name,
    pub signed_name: Name,
    pub attr: Attr,
    pub link: Option<Name>,
    pub packing: PackTag,
    pub sequence: i64,
    pub writer: String,
    pub blocks: Vec<BlockRef>,
    pub pack_data: Option<Vec<u8>>,
    pub time: Time,
}

impl DirEntry {
    /// A new, empty directory entry (its one zero-sized block is added by
    /// the store once the serialized empty child list is known).
    pub fn new_directory(name: Name, writer: impl Into<String>, packing: PackTag) -> Self {
        Self {
            signed_name: name.clone(),
            name,
            attr: Attr::Directory,
            link: None,
            packing,
            sequence: 0,
            writer: writer.into(),
            blocks: Vec::new(),
            pack_data: None,
            time: Time::now(),
        }
    }

    pub fn new_link(
        name: Name,
        target: Name,
        writer: impl Into<String>,
        packing: PackTag,
    ) -> Self {
        Self {
            signed_name: name.clone(),
            name,
            attr: Attr::Link,
            link: Some(target),
            packing,
            sequence: 0,
            writer: writer.into(),
            blocks: Vec::new(),
            pack_data: None,
            time: Time::now(),
        }
    }

    pub fn new_regular(
        name: Name,
        writer: impl Into<String>,
        packing: PackTag,
        blocks: Vec<BlockRef>,
        pack_data: Option<Vec<u8>>,
    ) -> Self {
        Self {
            signed_name: name.clone(),
            name,
            attr: Attr::Regular,
            link: None,
            packing,
            sequence: 0,
            writer: writer.into(),
            blocks,
            pack_data,
            time: Time::now(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.attr, Attr::Directory)
    }

    pub fn is_link(&self) -> bool {
        matches!(self.attr, Attr::Link)
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self.attr, Attr::Incomplete)
    }

    pub fn size(&self) -> u64 {
        self.blocks.iter().map(|b| b.size).sum()
    }

    /// `true` if this entry names an access-control file (`.../Access`).
    /// Access-control files are never masked to incomplete (spec.md §3):
    /// the access evaluator must always be able to fetch them.
    pub fn is_access_file(&self) -> bool {
        self.name.base() == "Access"
    }

    /// `true` if this entry names a group file (`<user>/Group/<name>`).
    pub fn is_group_file(&self) -> bool {
        self.name.elems().len() >= 2 && self.name.elems()[0] == "Group"
    }

    /// Produce the masked, content-free copy returned to callers who may
    /// see that an entry exists but may not read it (spec.md §3).
    pub fn to_incomplete(&self) -> DirEntry {
        DirEntry {
            attr: Attr::Incomplete,
            blocks: Vec::new(),
            pack_data: None,
            ..self.clone()
        }
    }

    /// An incomplete stand-in entry carrying only a path and a sequence
    /// number, as returned by `Put` (spec.md §4.3.1 step 7): the caller
    /// already owns the full entry it just wrote.
    pub fn sequence_only(name: Name, sequence: i64) -> DirEntry {
        DirEntry {
            signed_name: name.clone(),
            name,
            attr: Attr::Incomplete,
            link: None,
            packing: crate::packing::PLAIN_WITH_INTEGRITY,
            sequence,
            writer: String::new(),
            blocks: Vec::new(),
            pack_data: None,
            time: Time::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;

    #[test]
    fn incomplete_masks_blocks_and_packdata() {
        let name = path::parse("ann@example.com/file").unwrap();
        let mut entry = DirEntry::new_regular(
            name,
            "ann@example.com",
            PackTag(1),
            vec![BlockRef {
                store_endpoint: "store".into(),
                reference: Reference(vec![1, 2, 3]),
                offset: 0,
                size: 3,
                pack_data: vec![],
            }],
            Some(vec![9, 9]),
        );
        entry.sequence = 4;
        let incomplete = entry.to_incomplete();
        assert!(incomplete.is_incomplete());
        assert!(incomplete.blocks.is_empty());
        assert!(incomplete.pack_data.is_none());
        assert_eq!(incomplete.sequence, 4);
    }

    #[test]
    fn detects_access_and_group_files() {
        let access = path::parse("ann@example.com/Access").unwrap();
        let regular = DirEntry::new_regular(access, "ann@example.com", PackTag(1), vec![], None);
        assert!(regular.is_access_file());

        let group = path::parse("ann@example.com/Group/friends").unwrap();
        let regular = DirEntry::new_regular(group, "ann@example.com", PackTag(1), vec![], None);
        assert!(regular.is_group_file());
    }
}
