//! SDB snapshot format (§4.10): header, a typed value-stream body, and a
//! SHA-3-256 footer, backed uniformly by a file or an in-memory buffer.

pub mod body;
pub mod io;

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::hierarchy::Hierarchy;

fn current_version() -> String {
    format!("selva-{}", env!("CARGO_PKG_VERSION"))
}

fn save<W: io::SdbWriter>(h: &Hierarchy, backend: W) -> Result<W> {
    let mut w = io::HashingWriter::new(backend);
    let version = current_version();
    w.init(&version, &version)?;
    let body = body::encode_body(h);
    w.write(&body)?;
    w.end()
}

/// Render a hierarchy as a complete SDB file in memory.
pub fn save_to_bytes(h: &Hierarchy) -> Result<Vec<u8>> {
    Ok(save(h, io::StringIo::default())?.buf)
}

/// Parse and validate a complete SDB byte buffer into a fresh hierarchy.
pub fn load_from_bytes(raw: &[u8]) -> Result<Hierarchy> {
    let (_created_with, _updated_with, body_bytes) = io::verify_and_extract_body(raw)?;
    body::decode_body(body_bytes)
}

/// Save `h` to `path` as a complete SDB file.
pub fn save_to_file(h: &Hierarchy, path: &Path) -> Result<()> {
    save(h, io::FileIo::create(path)?)?;
    Ok(())
}

/// Load a hierarchy from an SDB file on disk.
pub fn load_from_file(path: &Path) -> Result<Hierarchy> {
    let raw = io::read_file(path)?;
    load_from_bytes(&raw)
}

const LAST_GOOD_NAME: &str = "dump.sdb";

/// Atomically point `dump.sdb` (in `dir`) at `target`: write to a temp name
/// in the same directory, then rename over the old symlink so a crash mid
/// update never leaves `dump.sdb` missing or half-written.
pub fn promote_last_good(dir: &Path, target: &Path) -> Result<()> {
    let link_path = dir.join(LAST_GOOD_NAME);
    let tmp_path = dir.join(format!(".{LAST_GOOD_NAME}.tmp"));
    if tmp_path.exists() {
        std::fs::remove_file(&tmp_path)?;
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(target, &tmp_path)?;
    #[cfg(not(unix))]
    std::fs::copy(target, &tmp_path)?;
    std::fs::rename(&tmp_path, &link_path)?;
    Ok(())
}

/// Attempt to load `dir/dump.sdb` at startup; a missing or unverifiable
/// last-good snapshot is not fatal, the server just starts empty (§4.10).
pub fn load_last_good(dir: &Path) -> Option<Hierarchy> {
    let link_path = dir.join(LAST_GOOD_NAME);
    match load_from_file(&link_path) {
        Ok(h) => Some(h),
        Err(e) => {
            tracing::warn!(error = %e, path = %link_path.display(), "failed to load last-good sdb, starting empty");
            None
        }
    }
}

/// Retain the `keep` most recently modified `*.sdb` files in `dir` (besides
/// `dump.sdb` itself, which is never counted or removed), unlinking the
/// rest.
pub fn purge(dir: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let mut candidates: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()) == Some(LAST_GOOD_NAME) {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("sdb") {
            continue;
        }
        let meta = entry.metadata()?;
        if meta.file_type().is_symlink() {
            continue;
        }
        candidates.push((meta.modified()?, path));
    }
    candidates.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = Vec::new();
    for (_, path) in candidates.into_iter().skip(keep) {
        std::fs::remove_file(&path)?;
        removed.push(path);
    }
    Ok(removed)
}

#[cfg(test)]
mod sdb_tests {
    use super::*;
    use crate::nodeid::{NodeId, ROOT_ID};
    use tempfile::tempdir;

    fn id(s: &str) -> NodeId {
        NodeId::from_str_padded(s)
    }

    fn sample() -> Hierarchy {
        let mut h = Hierarchy::new();
        h.add_children(ROOT_ID, &[id("ma00000001")]).unwrap();
        h.node_mut(&id("ma00000001")).unwrap().object.set_str("name", "alice").unwrap();
        h
    }

    #[test]
    fn save_then_load_round_trips_observable_content() {
        let h = sample();
        let bytes = save_to_bytes(&h).unwrap();
        let restored = load_from_bytes(&bytes).unwrap();
        assert!(restored.contains(&id("ma00000001")));
        assert_eq!(
            restored.node(&id("ma00000001")).unwrap().object.get("name").unwrap().as_str(),
            Some(b"alice".as_slice())
        );
    }

    #[test]
    fn saved_file_hash_matches_recomputation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.sdb");
        save_to_file(&sample(), &path).unwrap();
        let raw = std::fs::read(&path).unwrap();
        assert!(io::verify_and_extract_body(&raw).is_ok());
    }

    #[test]
    fn corrupted_file_is_rejected_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.sdb");
        save_to_file(&sample(), &path).unwrap();
        let mut raw = std::fs::read(&path).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();
        assert!(load_from_file(&path).is_err());
    }

    #[test]
    fn promote_last_good_points_dump_sdb_at_target() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("1234.sdb");
        save_to_file(&sample(), &target).unwrap();
        promote_last_good(dir.path(), &target).unwrap();
        let restored = load_last_good(dir.path()).unwrap();
        assert!(restored.contains(&id("ma00000001")));
    }

    #[test]
    fn purge_keeps_the_n_most_recent_dumps() {
        let dir = tempdir().unwrap();
        for i in 0..5 {
            let path = dir.path().join(format!("{i}.sdb"));
            save_to_file(&sample(), &path).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let removed = purge(dir.path(), 2).unwrap();
        assert_eq!(removed.len(), 3);
        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(remaining.len(), 2);
    }
}
