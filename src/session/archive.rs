//! Project tree archiving for workspace sync.

use std::path::Path;

use anyhow::{Context, Result};

/// Tar up a project directory, preserving symlinks as entries rather than
/// following them. Entry names are workspace-relative with forward slashes.
pub fn tar_directory(src: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", src)
        .with_context(|| format!("archiving {}", src.display()))?;
    builder.into_inner().context("finalizing archive")
}

/// Render `KEY=VALUE` pairs as dotenv file contents.
pub fn generate_env_file(env_vars: &[String]) -> Vec<u8> {
    let mut contents = String::new();
    for entry in env_vars {
        contents.push_str(entry);
        contents.push('\n');
    }
    contents.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn env_file_is_newline_terminated_pairs() {
        let env = vec!["API_KEY=secret".to_string(), "DEBUG=1".to_string()];
        assert_eq!(generate_env_file(&env), b"API_KEY=secret\nDEBUG=1\n");
        assert!(generate_env_file(&[]).is_empty());
    }

    #[test]
    fn tar_preserves_tree_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.py"), b"print('hi')\n").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("src/main.py", dir.path().join("entry.py")).unwrap();

        let archive = tar_directory(dir.path()).unwrap();
        let mut reader = tar::Archive::new(archive.as_slice());

        let mut saw_file = false;
        let mut saw_symlink = false;
        for entry in reader.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            if path.ends_with("src/main.py") && entry.header().entry_type().is_file() {
                let mut contents = String::new();
                entry.read_to_string(&mut contents).unwrap();
                assert_eq!(contents, "print('hi')\n");
                saw_file = true;
            }
            if path.ends_with("entry.py") && entry.header().entry_type().is_symlink() {
                saw_symlink = true;
            }
        }
        assert!(saw_file);
        #[cfg(unix)]
        assert!(saw_symlink);
    }
}
