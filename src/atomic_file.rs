//! Write-temp-then-rename helpers shared by every on-disk store (§9
//! "Ownership for caches and stores"). Every mutable file the core owns
//! goes through [`write_json_atomic`] so a crash mid-write never leaves a
//! half-written file behind.

use std::path::Path;

use serde::Serialize;

use crate::error::Result;

/// Serialize `value` and atomically replace the file at `path`.
///
/// Writes to `<path>.tmp` in the same directory first, then renames over
/// the target — the rename is atomic on the same filesystem, so readers
/// never observe a partially-written file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension(tmp_extension(path));
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_extension(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        value: u32,
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");
        write_json_atomic(&path, &Sample { value: 42 }).unwrap();
        let read_back: Sample = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read_back, Sample { value: 42 });
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn second_write_overwrites_first() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");
        write_json_atomic(&path, &Sample { value: 1 }).unwrap();
        write_json_atomic(&path, &Sample { value: 2 }).unwrap();
        let read_back: Sample = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read_back, Sample { value: 2 });
    }
}
