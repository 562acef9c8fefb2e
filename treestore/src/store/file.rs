// SPDX-License-Identifier: AGPL-3.0-only

//! (ADDED) The on-disk datastore file format (spec.md §6 "On-disk files",
//! SPEC_FULL.md §6.1): `<root>/data/<module>.<datastore>` holds one
//! module's persisted data tree. Grounded on the teacher's
//! `engine::storage` journal/SDSS file header discipline — a small fixed
//! header carrying a magic, a format version and a CRC32, followed by the
//! payload — and on `storage::v1::flush`'s write-temp-then-rename target
//! naming (a trailing marker on the in-progress file, renamed over the
//! real target only once the write (and its `fsync`) succeeded).

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::{Error, StoreResult};
use crate::tree::{codec, SchemaRef, Tree};

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const MAGIC: &[u8; 4] = b"TSDS";
const FORMAT_VERSION: u8 = 1;

/// Where `<module>.<datastore>` lives under the repository root (spec.md §6).
pub fn datastore_path(repository_path: &Path, module: &str, datastore: &str) -> PathBuf {
    repository_path.join("data").join(format!("{module}.{datastore}"))
}

fn temp_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().expect("datastore path always has a file name").to_os_string();
    name.push(".tmp");
    target.with_file_name(name)
}

/// Writes `tree` to `<module>.<datastore>` atomically: the whole file is
/// built in memory, written to a `.tmp` sibling, `fsync`'d, then renamed
/// over the target (spec.md §6 "rewritten atomically (temp + rename)").
pub fn write_datastore(
    repository_path: &Path,
    module: &str,
    datastore: &str,
    revision: u32,
    tree: &Tree,
) -> StoreResult<()> {
    let target = datastore_path(repository_path, module, datastore);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = codec::encode(tree);

    let mut body = Vec::with_capacity(payload.len() + module.len() + 16);
    body.extend_from_slice(&(module.len() as u32).to_le_bytes());
    body.extend_from_slice(module.as_bytes());
    body.extend_from_slice(&revision.to_le_bytes());
    body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    body.extend_from_slice(&payload);

    let checksum = CRC.checksum(&body);

    let mut out = Vec::with_capacity(body.len() + 9);
    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(&body);

    let tmp = temp_path(&target);
    let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?;
    file.write_all(&out)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, &target)?;
    Ok(())
}

/// Reads and validates `<module>.<datastore>`, returning `None` if the
/// file does not exist (a fresh module with no persisted state). Every
/// node's schema is resolved through `resolve_root`/the tree's own
/// `child()` walk performed by [`codec::decode`].
pub fn read_datastore(
    repository_path: &Path,
    module: &str,
    datastore: &str,
    resolve_root: impl Fn(&str, &str) -> Option<SchemaRef>,
) -> StoreResult<Option<(u32, Tree)>> {
    let target = datastore_path(repository_path, module, datastore);
    let mut file = match File::open(&target) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    if raw.len() < 9 || &raw[0..4] != MAGIC {
        return Err(Error::validation_failed(format!("{}: not a treestore datastore file", target.display())));
    }
    let version = raw[4];
    if version != FORMAT_VERSION {
        return Err(Error::validation_failed(format!(
            "{}: unsupported datastore file format version {version}",
            target.display()
        )));
    }
    let stored_checksum = u32::from_le_bytes(raw[5..9].try_into().unwrap());
    let body = &raw[9..];
    if CRC.checksum(body) != stored_checksum {
        return Err(Error::validation_failed(format!("{}: checksum mismatch, file is corrupt", target.display())));
    }

    let mut pos = 0usize;
    let name_len = read_u32(body, &mut pos)? as usize;
    let name_bytes = body.get(pos..pos + name_len).ok_or_else(|| Error::internal("truncated datastore file"))?;
    pos += name_len;
    let stored_module = std::str::from_utf8(name_bytes).map_err(|_| Error::internal("datastore file module name is not utf-8"))?;
    if stored_module != module {
        return Err(Error::validation_failed(format!(
            "{}: file header names module '{stored_module}', expected '{module}'",
            target.display()
        )));
    }
    let revision = read_u32(body, &mut pos)?;
    let payload_len = read_u32(body, &mut pos)? as usize;
    let payload = body.get(pos..pos + payload_len).ok_or_else(|| Error::internal("truncated datastore file"))?;

    let tree = codec::decode(payload, resolve_root)?;
    Ok(Some((revision, tree)))
}

fn read_u32(buf: &[u8], pos: &mut usize) -> StoreResult<u32> {
    let bytes: [u8; 4] = buf
        .get(*pos..*pos + 4)
        .ok_or_else(|| Error::internal("truncated datastore file"))?
        .try_into()
        .unwrap();
    *pos += 4;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{NodeKind, SchemaBuilder};

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_datastore(dir.path(), "ietf-interfaces", "running", |_, _| None).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn round_trips_through_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let leaf = SchemaBuilder::new("m", "name", NodeKind::Leaf).build();
        let mut tree = Tree::new();
        let n = tree.create_node(leaf.clone(), Some("eth0")).unwrap();
        tree.attach_last(None, n);

        write_datastore(dir.path(), "m", "running", 7, &tree).unwrap();
        let (revision, decoded) = read_datastore(dir.path(), "m", "running", |module, name| {
            (module == "m" && name == "name").then(|| leaf.clone())
        })
        .unwrap()
        .unwrap();
        assert_eq!(revision, 7);
        assert_eq!(decoded.get(decoded.roots[0]).value(), Some("eth0"));
    }

    #[test]
    fn corrupt_checksum_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::new();
        write_datastore(dir.path(), "m", "running", 1, &tree).unwrap();
        let path = datastore_path(dir.path(), "m", "running");
        let mut bytes = fs::read(&path).unwrap();
        *bytes.last_mut().unwrap() ^= 0xff;
        fs::write(&path, bytes).unwrap();
        assert!(read_datastore(dir.path(), "m", "running", |_, _| None).is_err());
    }
}
