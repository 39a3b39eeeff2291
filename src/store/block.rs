//! Directory block encoding: the byte serialization of a directory is the
//! length-prefixed concatenation of its child entries' marshalled form,
//! self-delimiting so a truncated tail is detectable as corruption
//! (spec.md §3).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::content::Reference;
use crate::packing::PackTag;
use crate::path::{self, Name};

use super::entry::{Attr, BlockRef, DirEntry, Time};

fn write_str(w: &mut impl Write, s: &str) -> io::Result<()> {
    w.write_u16::<LittleEndian>(s.len() as u16)?;
    w.write_all(s.as_bytes())
}

fn read_str(r: &mut impl Read) -> io::Result<String> {
    let len = r.read_u16::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_bytes(w: &mut impl Write, b: &[u8]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(b.len() as u32)?;
    w.write_all(b)
}

fn read_bytes(r: &mut impl Read) -> io::Result<Vec<u8>> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_name(w: &mut impl Write, name: &Name) -> io::Result<()> {
    write_str(w, name.user())?;
    w.write_u16::<LittleEndian>(name.elems().len() as u16)?;
    for e in name.elems() {
        write_str(w, e)?;
    }
    Ok(())
}

fn read_name(r: &mut impl Read) -> io::Result<Name> {
    let user = read_str(r)?;
    let mut name = path::Name::root(&user)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad user in block"))?;
    let n = r.read_u16::<LittleEndian>()?;
    for _ in 0..n {
        let elem = read_str(r)?;
        name = name
            .join(&elem)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad elem in block"))?;
    }
    Ok(name)
}

/// Marshal one directory entry.
///
/// `SignedName` is not persisted separately: it equals `Name` at rest
/// (spec.md §3), so only `Name` is encoded and `SignedName` is restored
/// equal to it on decode.
pub fn encode_entry(entry: &DirEntry) -> Vec<u8> {
    let mut w = Vec::new();
    write_name(&mut w, &entry.name).unwrap();
    let attr_tag: u8 = match entry.attr {
        Attr::Regular => 0,
        Attr::Directory => 1,
        Attr::Link => 2,
        Attr::Incomplete => 3,
    };
    w.write_u8(attr_tag).unwrap();
    match &entry.link {
        Some(target) => {
            w.write_u8(1).unwrap();
            write_name(&mut w, target).unwrap();
        }
        None => w.write_u8(0).unwrap(),
    }
    w.write_u8(entry.packing.0).unwrap();
    w.write_i64::<LittleEndian>(entry.sequence).unwrap();
    write_str(&mut w, &entry.writer).unwrap();
    w.write_u16::<LittleEndian>(entry.blocks.len() as u16).unwrap();
    for b in &entry.blocks {
        write_str(&mut w, &b.store_endpoint).unwrap();
        write_bytes(&mut w, &b.reference.0).unwrap();
        w.write_u64::<LittleEndian>(b.offset).unwrap();
        w.write_u64::<LittleEndian>(b.size).unwrap();
        write_bytes(&mut w, &b.pack_data).unwrap();
    }
    match &entry.pack_data {
        Some(pd) => {
            w.write_u8(1).unwrap();
            write_bytes(&mut w, pd).unwrap();
        }
        None => w.write_u8(0).unwrap(),
    }
    w.write_i64::<LittleEndian>(entry.time.0).unwrap();
    w
}

/// Unmarshal one directory entry previously produced by [`encode_entry`].
pub fn decode_entry(bytes: &[u8]) -> io::Result<DirEntry> {
    let mut r = Cursor::new(bytes);
    let name = read_name(&mut r)?;
    let attr_tag = r.read_u8()?;
    let attr = match attr_tag {
        0 => Attr::Regular,
        1 => Attr::Directory,
        2 => Attr::Link,
        3 => Attr::Incomplete,
        _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "bad attr tag")),
    };
    let link = match r.read_u8()? {
        1 => Some(read_name(&mut r)?),
        _ => None,
    };
    let packing = PackTag(r.read_u8()?);
    let sequence = r.read_i64::<LittleEndian>()?;
    let writer = read_str(&mut r)?;
    let nblocks = r.read_u16::<LittleEndian>()?;
    let mut blocks = Vec::with_capacity(nblocks as usize);
    for _ in 0..nblocks {
        let store_endpoint = read_str(&mut r)?;
        let reference = Reference(read_bytes(&mut r)?);
        let offset = r.read_u64::<LittleEndian>()?;
        let size = r.read_u64::<LittleEndian>()?;
        let pack_data = read_bytes(&mut r)?;
        blocks.push(BlockRef { store_endpoint, reference, offset, size, pack_data });
    }
    let pack_data = match r.read_u8()? {
        1 => Some(read_bytes(&mut r)?),
        _ => None,
    };
    let time = Time(r.read_i64::<LittleEndian>()?);

    Ok(DirEntry {
        signed_name: name.clone(),
        name,
        attr,
        link,
        packing,
        sequence,
        writer,
        blocks,
        pack_data,
        time,
    })
}

/// Marshal a directory's children into one self-delimiting block: each
/// entry is prefixed with its own byte length.
pub fn encode_block(entries: &[DirEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        let bytes = encode_entry(entry);
        out.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
        out.extend_from_slice(&bytes);
    }
    out
}

/// Unmarshal a directory block. A truncated trailing record (a length
/// prefix with fewer bytes following than it claims) is reported as
/// corruption rather than silently dropped.
pub fn decode_block(bytes: &[u8]) -> io::Result<Vec<DirEntry>> {
    let mut r = Cursor::new(bytes);
    let mut entries = Vec::new();
    loop {
        let len = match r.read_u32::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf)
            .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "truncated directory block"))?;
        entries.push(decode_entry(&buf)?);
    }
    Ok(entries)
}
