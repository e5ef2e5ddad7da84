// `agentest init`: a starter case file plus a small program with known
// formatting bugs to run it against.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

pub const CASES_FILE: &str = "tests.json";
pub const PROGRAM_FILE: &str = "sample_prog.py";

const SAMPLE_CASES: &str = r#"{
  "add_small": {
    "input": "2 3\n",
    "expected": "5\n",
    "timeout": 2,
    "normalizers": ["strip", "collapse_ws"],
    "tags": ["arith"]
  },
  "add_big": {
    "input": "10 20\n",
    "expected": "30\n",
    "timeout": 2,
    "normalizers": ["strip"],
    "tags": ["arith"]
  },
  "format_tolerance": {
    "input": "001  2\n",
    "expected": "3",
    "timeout": 2,
    "normalizers": ["strip", "collapse_ws"],
    "tags": ["format"]
  },
  "empty_input": {
    "input": "",
    "expected": { "stdout": "0", "exit_code": 0 },
    "normalizers": ["strip"],
    "tags": ["edge"]
  }
}
"#;

const SAMPLE_PROGRAM: &str = r#"#!/usr/bin/env python3
# Adds two integers read from stdin. Run: python3 sample_prog.py < input.txt
import sys

line = sys.stdin.read().strip()
if not line:
    print(0)
    sys.exit(0)

parts = [p for p in line.split(' ') if p]
try:
    a, b = map(int, parts[:2])
    print(a + b)
except Exception as e:
    print(f"ERR: {e}", file=sys.stderr)
    sys.exit(1)
"#;

/// Writes the sample files into `dir`. Existing files are left alone
/// unless `force` is set.
pub fn init(dir: &Path, force: bool) -> io::Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;

    let files = [(CASES_FILE, SAMPLE_CASES), (PROGRAM_FILE, SAMPLE_PROGRAM)];
    if !force {
        if let Some(path) = files.iter().map(|(name, _)| dir.join(name)).find(|p| p.exists()) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists (use --force to overwrite)", path.display()),
            ));
        }
    }

    let mut written = Vec::new();
    for (name, body) in files {
        let path = dir.join(name);
        fs::write(&path, body)?;
        written.push(path);
    }

    make_executable(&dir.join(PROGRAM_FILE))?;
    info!(dir = %dir.display(), "sample files written");
    Ok(written)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::load_file;

    #[test]
    fn sample_cases_load() {
        let dir = tempfile::tempdir().unwrap();
        let written = init(dir.path(), false).unwrap();
        assert_eq!(written.len(), 2);

        let cases = load_file(&dir.path().join(CASES_FILE)).unwrap();
        let ids: Vec<&str> = cases.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["add_small", "add_big", "format_tolerance", "empty_input"]);
    }

    #[test]
    fn refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        init(dir.path(), false).unwrap();
        let err = init(dir.path(), false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(init(dir.path(), true).is_ok());
    }

    #[test]
    fn existing_program_leaves_nothing_half_written() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PROGRAM_FILE), "print('mine')\n").unwrap();

        let err = init(dir.path(), false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(!dir.path().join(CASES_FILE).exists());
        assert_eq!(
            fs::read_to_string(dir.path().join(PROGRAM_FILE)).unwrap(),
            "print('mine')\n"
        );
    }
}
