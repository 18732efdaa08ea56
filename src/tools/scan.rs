//! Purpose: Built-in literal text scan over a directory tree, with no external binaries.
//! Exports: `ScanOptions`, `ScanOutcome`, `literal_scan`, `literal_scan_blocking`.
//! Role: Engine behind the degraded search fallbacks.
//! Invariants: Output is `path:line:text`, paths relative to the display base, sorted by path
//! then line.
//! Invariants: Hidden entries, `node_modules`, `target`, binary files, and very large files
//! are skipped; inside a git checkout `.gitignore` rules apply as they do for ripgrep.
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;

use crate::core::error::{Error, ErrorKind};

const MAX_FILE_BYTES: u64 = 4 * 1024 * 1024;
const BINARY_SNIFF_BYTES: usize = 8 * 1024;
const SKIPPED_DIRS: &[&str] = &["node_modules", "target"];

#[derive(Clone, Debug)]
pub struct ScanOptions {
    pub needle: String,
    pub case_insensitive: bool,
    pub max_results: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub lines: Vec<String>,
    pub truncated: bool,
    pub files_scanned: usize,
}

pub async fn literal_scan(
    root: PathBuf,
    display_base: PathBuf,
    options: ScanOptions,
) -> Result<ScanOutcome, Error> {
    tokio::task::spawn_blocking(move || literal_scan_blocking(&root, &display_base, &options))
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("literal scan task failed")
                .with_source(err)
        })?
}

pub fn literal_scan_blocking(
    root: &Path,
    display_base: &Path,
    options: &ScanOptions,
) -> Result<ScanOutcome, Error> {
    if options.needle.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("scan pattern must not be empty"));
    }
    let metadata = fs::metadata(root).map_err(|err| {
        Error::from_io(err, format!("search root `{}` does not exist", root.display()))
            .with_path(root)
            .with_hint("Verify the path exists and is spelled correctly.")
    })?;

    let needle = if options.case_insensitive {
        options.needle.to_lowercase()
    } else {
        options.needle.clone()
    };
    let mut files = Vec::new();
    if metadata.is_file() {
        files.push(root.to_path_buf());
    } else {
        collect_files(root, &mut files);
    }
    files.sort();

    let mut outcome = ScanOutcome::default();
    for file in files {
        let Some(text) = read_text(&file) else {
            continue;
        };
        outcome.files_scanned += 1;
        let shown = display_path(&file, display_base);
        for (idx, line) in text.lines().enumerate() {
            let hit = if options.case_insensitive {
                line.to_lowercase().contains(&needle)
            } else {
                line.contains(&needle)
            };
            if !hit {
                continue;
            }
            if outcome.lines.len() >= options.max_results {
                outcome.truncated = true;
                return Ok(outcome);
            }
            outcome.lines.push(format!("{shown}:{}:{line}", idx + 1));
        }
    }
    Ok(outcome)
}

fn collect_files(root: &Path, out: &mut Vec<PathBuf>) {
    let mut builder = WalkBuilder::new(root);
    builder.hidden(true).filter_entry(|entry| {
        entry
            .file_name()
            .to_str()
            .is_none_or(|name| !SKIPPED_DIRS.contains(&name))
    });
    for entry in builder.build() {
        let entry = match entry {
            Ok(value) => value,
            Err(_) => continue,
        };
        if entry.file_type().is_some_and(|ft| ft.is_file()) {
            out.push(entry.into_path());
        }
    }
}

fn read_text(path: &Path) -> Option<String> {
    let metadata = fs::metadata(path).ok()?;
    if metadata.len() > MAX_FILE_BYTES {
        return None;
    }
    let mut bytes = Vec::with_capacity(metadata.len() as usize);
    fs::File::open(path).ok()?.read_to_end(&mut bytes).ok()?;
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if sniff.contains(&0) {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn display_path(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(needle: &str, case_insensitive: bool) -> ScanOptions {
        ScanOptions {
            needle: needle.to_string(),
            case_insensitive,
            max_results: 100,
        }
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("src/nested")).expect("mkdir");
        fs::create_dir_all(dir.path().join(".git")).expect("mkdir");
        fs::create_dir_all(dir.path().join("node_modules/pkg")).expect("mkdir");
        fs::write(dir.path().join("src/a.rs"), "fn alpha() {}\nlet Needle = 1;\n").expect("a");
        fs::write(dir.path().join("src/nested/b.rs"), "needle here\nnone\nneedle again\n")
            .expect("b");
        fs::write(dir.path().join(".git/config"), "needle").expect("git");
        fs::write(dir.path().join("node_modules/pkg/x.js"), "needle").expect("nm");
        fs::write(dir.path().join("blob.bin"), b"needle\0\x01\x02").expect("bin");
        dir
    }

    #[test]
    fn finds_matches_in_sorted_order_and_skips_noise() {
        let dir = fixture();
        let outcome =
            literal_scan_blocking(dir.path(), dir.path(), &options("needle", false)).expect("scan");
        assert_eq!(
            outcome.lines,
            vec![
                "src/nested/b.rs:1:needle here".to_string(),
                "src/nested/b.rs:3:needle again".to_string(),
            ]
        );
        assert!(!outcome.truncated);
    }

    #[test]
    fn gitignored_files_are_skipped() {
        let dir = fixture();
        fs::write(dir.path().join(".gitignore"), "generated.rs\n").expect("gitignore");
        fs::write(dir.path().join("src/generated.rs"), "needle generated\n").expect("gen");
        let outcome =
            literal_scan_blocking(dir.path(), dir.path(), &options("needle", false)).expect("scan");
        assert!(outcome.lines.iter().all(|line| !line.contains("generated")));
        assert_eq!(outcome.lines.len(), 2);
    }

    #[test]
    fn case_insensitive_and_truncation() {
        let dir = fixture();
        let mut opts = options("NEEDLE", true);
        opts.max_results = 2;
        let outcome = literal_scan_blocking(dir.path(), dir.path(), &opts).expect("scan");
        assert_eq!(outcome.lines.len(), 2);
        assert_eq!(outcome.lines[0], "src/a.rs:2:let Needle = 1;");
        assert!(outcome.truncated);
    }

    #[test]
    fn missing_root_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("gone");
        let err = literal_scan_blocking(&missing, dir.path(), &options("x", false))
            .expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.message().unwrap_or_default().contains("does not exist"));
    }

    #[tokio::test]
    async fn async_wrapper_runs_on_blocking_pool() {
        let dir = fixture();
        let outcome = literal_scan(
            dir.path().join("src"),
            dir.path().to_path_buf(),
            options("alpha", false),
        )
        .await
        .expect("scan");
        assert_eq!(outcome.lines, vec!["src/a.rs:1:fn alpha() {}".to_string()]);
        assert_eq!(outcome.files_scanned, 2);
    }
}
