use std::fs;
use std::io::Write;
use std::path::Path;

use bstr::ByteSlice;
use gitref_hash::ObjectId;
use gitref_utils::FileSnapshot;
use tracing::debug;

use crate::error::RefError;
use crate::list::{RefList, RefListBuilder};
use crate::name::RefName;
use crate::{Ref, Storage};

/// Canonical header. The `peeled` flag promises that tag refs carry their
/// `^`-line and that refs without one are known non-tags.
const HEADER: &[u8] = b"# pack-refs with: peeled\n";

/// The parsed `packed-refs` file plus the snapshot it was read under.
#[derive(Debug, Clone)]
pub(crate) struct PackedRefList {
    pub(crate) list: RefList<Ref>,
    pub(crate) snapshot: FileSnapshot,
}

impl PackedRefList {
    /// Cache sentinel for "never read": an empty list whose missing-file
    /// snapshot forces a (re-)read as soon as the file exists.
    pub(crate) fn none() -> Self {
        Self {
            list: RefList::empty(),
            snapshot: FileSnapshot::missing(),
        }
    }
}

/// Read and parse `packed-refs`. A missing file is the empty list.
pub(crate) fn read_packed_refs(path: &Path) -> Result<PackedRefList, RefError> {
    let snapshot = FileSnapshot::save(path);
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(PackedRefList {
                list: RefList::empty(),
                snapshot,
            })
        }
        Err(source) => {
            return Err(RefError::IoPath {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    Ok(PackedRefList {
        list: parse(path, &data)?,
        snapshot,
    })
}

/// Parse the body of a `packed-refs` file.
///
/// Lines are `<40-hex> SP <name>`, with `^<40-hex>` immediately after a tag
/// ref carrying its peeled target. Under the `peeled` header, refs without a
/// `^`-line are known non-tags. Out-of-order input is accepted and sorted.
pub(crate) fn parse(path: &Path, data: &[u8]) -> Result<RefList<Ref>, RefError> {
    let mut builder: RefListBuilder<Ref> = RefListBuilder::new();
    let mut peeled_header = false;
    let mut sorted = true;

    for line in data.lines() {
        if line.is_empty() {
            continue;
        }

        if line.starts_with(b"#") {
            if let Some(flags) = line.strip_prefix(b"# pack-refs with:") {
                // Unknown flags are ignored.
                peeled_header = flags.fields().any(|f| f == b"peeled");
            }
            continue;
        }

        if let Some(hex) = line.strip_prefix(b"^") {
            let peeled = ObjectId::from_hex_bytes(hex.trim()).map_err(|_| malformed(path, line))?;
            // A peeled line is only meaningful directly after a ref line.
            let Some(prev) = builder.pop() else {
                return Err(malformed(path, line));
            };
            let (name, id) = match prev {
                Ref::Unpeeled { name, id: Some(id), .. }
                | Ref::PeeledNonTag { name, id, .. }
                | Ref::PeeledTag { name, id, .. } => (name, id),
                _ => return Err(malformed(path, line)),
            };
            builder.push(Ref::PeeledTag {
                storage: Storage::Packed,
                name,
                id,
                peeled,
            });
            continue;
        }

        if line.len() < ObjectId::HEX_LEN + 2 || line[ObjectId::HEX_LEN] != b' ' {
            return Err(malformed(path, line));
        }
        let id = ObjectId::from_hex_bytes(&line[..ObjectId::HEX_LEN])
            .map_err(|_| malformed(path, line))?;
        let name_bytes = line[ObjectId::HEX_LEN + 1..].trim();
        let name_str = std::str::from_utf8(name_bytes).map_err(|_| malformed(path, line))?;
        let name = RefName::new(name_str).map_err(|_| malformed(path, line))?;

        if let Some(prev) = builder.last() {
            if crate::list::RefItem::name(prev) >= name.as_str() {
                sorted = false;
            }
        }
        builder.push(if peeled_header {
            Ref::PeeledNonTag {
                storage: Storage::Packed,
                name,
                id,
            }
        } else {
            Ref::Unpeeled {
                storage: Storage::Packed,
                name,
                id: Some(id),
            }
        });
    }

    if !sorted {
        debug!(path = %path.display(), "packed-refs out of order, sorting");
        builder.sort();
        builder.dedupe();
    }
    Ok(builder.to_ref_list())
}

fn malformed(path: &Path, line: &[u8]) -> RefError {
    RefError::Malformed {
        path: path.to_path_buf(),
        content: String::from_utf8_lossy(&line[..line.len().min(32)]).into_owned(),
    }
}

/// Serialize `list` in canonical form: header, one line per ref, a `^`-line
/// after each peeled tag. Symbolic refs are never packed and are skipped.
pub(crate) fn write_packed_refs(list: &RefList<Ref>, out: &mut impl Write) -> std::io::Result<()> {
    out.write_all(HEADER)?;
    for r in list.iter() {
        match r {
            Ref::Unpeeled {
                name, id: Some(id), ..
            }
            | Ref::PeeledNonTag { name, id, .. } => {
                writeln!(out, "{} {}", id.to_hex(), name)?;
            }
            Ref::PeeledTag {
                name, id, peeled, ..
            } => {
                writeln!(out, "{} {}", id.to_hex(), name)?;
                writeln!(out, "^{}", peeled.to_hex())?;
            }
            Ref::Unpeeled { id: None, .. } | Ref::Symbolic { .. } => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn parse_str(data: &str) -> RefList<Ref> {
        parse(&PathBuf::from("packed-refs"), data.as_bytes()).unwrap()
    }

    fn oid(hex: &str) -> ObjectId {
        ObjectId::from_hex(hex).unwrap()
    }

    #[test]
    fn parse_empty() {
        assert!(parse_str("").is_empty());
    }

    #[test]
    fn parse_peeled_header_and_sideline() {
        let list = parse_str(
            "# pack-refs with: peeled\n\
             1111111111111111111111111111111111111111 refs/heads/a\n\
             2222222222222222222222222222222222222222 refs/tags/v1\n\
             ^3333333333333333333333333333333333333333\n",
        );
        assert_eq!(list.len(), 2);

        let a = list.get("refs/heads/a").unwrap();
        assert!(matches!(a, Ref::PeeledNonTag { .. }));
        assert_eq!(
            a.peeled_id(),
            Some(oid("1111111111111111111111111111111111111111"))
        );

        let v1 = list.get("refs/tags/v1").unwrap();
        assert!(matches!(v1, Ref::PeeledTag { .. }));
        assert_eq!(
            v1.object_id(),
            Some(oid("2222222222222222222222222222222222222222"))
        );
        assert_eq!(
            v1.peeled_id(),
            Some(oid("3333333333333333333333333333333333333333"))
        );
        assert_eq!(v1.storage(), Storage::Packed);
    }

    #[test]
    fn parse_without_header_leaves_unpeeled() {
        let list = parse_str("1111111111111111111111111111111111111111 refs/heads/a\n");
        let a = list.get("refs/heads/a").unwrap();
        assert!(matches!(a, Ref::Unpeeled { .. }));
        assert!(!a.is_peeled());
    }

    #[test]
    fn unknown_header_flags_ignored() {
        let list = parse_str(
            "# pack-refs with: peeled fully-peeled sorted\n\
             1111111111111111111111111111111111111111 refs/heads/a\n",
        );
        assert!(matches!(
            list.get("refs/heads/a").unwrap(),
            Ref::PeeledNonTag { .. }
        ));
    }

    #[test]
    fn peeled_line_before_any_ref_is_error() {
        let err = parse(
            &PathBuf::from("packed-refs"),
            b"# pack-refs with: peeled\n^1111111111111111111111111111111111111111\n",
        )
        .unwrap_err();
        assert!(matches!(err, RefError::Malformed { .. }));
    }

    #[test]
    fn out_of_order_input_is_sorted() {
        let list = parse_str(
            "2222222222222222222222222222222222222222 refs/tags/v1\n\
             1111111111111111111111111111111111111111 refs/heads/a\n",
        );
        assert_eq!(list.at(0).name().as_str(), "refs/heads/a");
        assert_eq!(list.at(1).name().as_str(), "refs/tags/v1");
    }

    #[test]
    fn malformed_line_is_error() {
        for bad in [
            "not-a-ref-line\n",
            "1111 refs/heads/short-oid\n",
            "1111111111111111111111111111111111111111refs/heads/no-space\n",
        ] {
            let err = parse(&PathBuf::from("packed-refs"), bad.as_bytes()).unwrap_err();
            assert!(
                matches!(err, RefError::Malformed { .. }),
                "expected Malformed for {bad:?}"
            );
        }
    }

    #[test]
    fn canonical_roundtrip_is_bytewise_equal() {
        let input = "# pack-refs with: peeled\n\
                     1111111111111111111111111111111111111111 refs/heads/a\n\
                     2222222222222222222222222222222222222222 refs/tags/v1\n\
                     ^3333333333333333333333333333333333333333\n";
        let list = parse_str(input);
        let mut out = Vec::new();
        write_packed_refs(&list, &mut out).unwrap();
        assert_eq!(out, input.as_bytes());
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let packed = read_packed_refs(&dir.path().join("packed-refs")).unwrap();
        assert!(packed.list.is_empty());
        assert!(packed.snapshot.is_missing_file());
    }
}
