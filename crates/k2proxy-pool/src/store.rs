//! On-disk token and account stores.
//!
//! Both files are line-oriented UTF-8: the token file holds one opaque
//! bearer token per line, the accounts file one JSON object per line.
//! Blank lines and `#` comments are ignored in both. The token file is
//! only ever rewritten via a temp-file-plus-rename in the same directory,
//! so readers never observe a partial write.

use std::io::Write;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::{PoolError, Result};

/// One upstream account used to mint bearer tokens.
/// Extra JSON fields on the line are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountRecord {
    pub email: String,
    pub password: String,
}

/// Read token values in file order, skipping blanks and `#` comments.
pub fn read_tokens(path: &str) -> Result<Vec<String>> {
    let data = std::fs::read_to_string(path).map_err(|source| PoolError::ReadFile {
        path: path.to_string(),
        source,
    })?;
    Ok(data
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Read account records, one JSON object per line. Lines that fail to
/// parse are skipped with a warning rather than failing the whole read.
pub fn read_accounts(path: &str) -> Result<Vec<AccountRecord>> {
    let data = std::fs::read_to_string(path).map_err(|source| PoolError::ReadFile {
        path: path.to_string(),
        source,
    })?;
    let mut accounts = Vec::new();
    for (lineno, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<AccountRecord>(line) {
            Ok(account) => accounts.push(account),
            Err(e) => warn!(path, line = lineno + 1, error = %e, "skipping bad account line"),
        }
    }
    Ok(accounts)
}

/// Write the token file atomically: temp file in the target directory,
/// then rename over the destination.
pub fn write_tokens(path: &str, tokens: &[String]) -> Result<()> {
    let target = Path::new(path);
    let dir = target.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir),
        None => tempfile::NamedTempFile::new_in("."),
    }
    .map_err(|source| PoolError::WriteFile {
        path: path.to_string(),
        source,
    })?;

    for token in tokens {
        writeln!(tmp, "{token}").map_err(|source| PoolError::WriteFile {
            path: path.to_string(),
            source,
        })?;
    }

    tmp.persist(target).map_err(|e| PoolError::WriteFile {
        path: path.to_string(),
        source: e.error,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_skip_blanks_and_comments_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.txt");
        std::fs::write(&path, "# pool\ntok-a\n\n  tok-b  \n#tok-c\ntok-d\n").unwrap();

        let tokens = read_tokens(path.to_str().unwrap()).unwrap();
        assert_eq!(tokens, ["tok-a", "tok-b", "tok-d"]);
    }

    #[test]
    fn empty_token_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.txt");
        std::fs::write(&path, "").unwrap();
        assert!(read_tokens(path.to_str().unwrap()).unwrap().is_empty());
    }

    #[test]
    fn missing_token_file_is_an_error() {
        assert!(read_tokens("/nonexistent/tokens.txt").is_err());
    }

    #[test]
    fn accounts_tolerate_extras_and_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.txt");
        std::fs::write(
            &path,
            concat!(
                "# accounts\n",
                r#"{"email":"a@x.io","password":"p1","note":"ignored"}"#,
                "\n",
                "not json\n",
                r#"  {"email":"b@x.io","password":"p2"}  "#,
                "\n",
                r#"{"email":"missing-password@x.io"}"#,
                "\n",
            ),
        )
        .unwrap();

        let accounts = read_accounts(path.to_str().unwrap()).unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].email, "a@x.io");
        assert_eq!(accounts[1].password, "p2");
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.txt");
        let path = path.to_str().unwrap();

        write_tokens(path, &["one".to_string(), "two".to_string()]).unwrap();
        assert_eq!(read_tokens(path).unwrap(), ["one", "two"]);

        // Overwrite is atomic and replaces the full contents.
        write_tokens(path, &["three".to_string()]).unwrap();
        assert_eq!(read_tokens(path).unwrap(), ["three"]);
    }
}
