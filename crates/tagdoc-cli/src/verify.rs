use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use tagdoc_core::{Document, EditorConfig, Format, Verification};
use walkdir::WalkDir;

/// Outcome of checking one file.
#[derive(Debug)]
pub struct Report {
    pub path: PathBuf,
    pub outcome: Result<Verification, String>,
}

impl Report {
    pub fn is_verified(&self) -> bool {
        matches!(&self.outcome, Ok(v) if v.verified)
    }
}

/// Files under `root`, sorted, optionally filtered by extension
/// (case-insensitive, without the dot).
pub fn find_files(root: &Path, ext: Option<&str>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| match ext {
            None => true,
            Some(want) => p
                .extension()
                .and_then(|s| s.to_str())
                .is_some_and(|x| x.eq_ignore_ascii_case(want)),
        })
        .collect();
    out.sort();
    out
}

pub fn verify_file(format: &Arc<Format>, path: &Path) -> Report {
    let outcome = fs::read(path)
        .map_err(|e| format!("read error: {e}"))
        .and_then(|bytes| {
            let config = EditorConfig {
                verify_on_open: false,
                ..EditorConfig::default()
            };
            let doc = Document::parse_with(Arc::clone(format), &bytes, config).map_err(|e| e.to_string())?;
            Ok(doc.verify(&bytes))
        });
    debug!("{}: {outcome:?}", path.display());
    Report {
        path: path.to_path_buf(),
        outcome,
    }
}

/// Verify a single file, or every matching file below a directory.
pub fn verify_path(format: &Arc<Format>, path: &Path, ext: Option<&str>) -> Vec<Report> {
    if path.is_file() {
        return vec![verify_file(format, path)];
    }
    find_files(path, ext)
        .iter()
        .map(|p| verify_file(format, p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagdoc_core::formats;

    fn avfx() -> Arc<Format> {
        Arc::new(formats::avfx().unwrap())
    }

    fn sample_bytes() -> Vec<u8> {
        let mut doc = Document::new(avfx()).unwrap();
        doc.add_entity("particles").unwrap();
        doc.add_entity("textures").unwrap();
        doc.serialize()
    }

    #[test]
    fn walks_directories_and_reports_each_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("vfx").join("common");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("fire.avfx"), sample_bytes()).unwrap();
        fs::write(dir.path().join("broken.AVFX"), b"not a container").unwrap();
        fs::write(dir.path().join("notes.txt"), b"skip me").unwrap();

        let reports = verify_path(&avfx(), dir.path(), Some("avfx"));
        assert_eq!(reports.len(), 2);
        let broken = reports.iter().find(|r| r.path.ends_with("broken.AVFX")).unwrap();
        assert!(broken.outcome.is_err());
        let fire = reports.iter().find(|r| r.path.ends_with("fire.avfx")).unwrap();
        assert!(fire.is_verified(), "{:?}", fire.outcome);
    }

    #[test]
    fn single_file_is_checked_directly() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("one.bin");
        let mut bytes = sample_bytes();
        // the texture's string is followed by padding; make it non-zero
        let last = bytes.len() - 1;
        bytes[last] = 0xAA;
        fs::write(&p, &bytes).unwrap();

        let reports = verify_path(&avfx(), &p, Some("avfx"));
        assert_eq!(reports.len(), 1);
        match &reports[0].outcome {
            Ok(v) => {
                assert!(v.verified, "{}", v.message);
                assert!(v.message.starts_with("verified; 1 diagnostic(s)"), "{}", v.message);
                assert!(v.message.contains("NonZeroPadding"), "{}", v.message);
            }
            Err(e) => panic!("expected a parsed document, got {e}"),
        }
    }

    #[test]
    fn truncated_file_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("cut.avfx");
        let bytes = sample_bytes();
        fs::write(&p, &bytes[..bytes.len() - 4]).unwrap();

        let report = verify_file(&avfx(), &p);
        assert!(!report.is_verified());
    }
}
