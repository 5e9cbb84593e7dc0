use std::path::{Component, Path, PathBuf};

use anyhow::Context as _;

/// Rejects config paths that climb out of the working tree via `..`
/// components.
pub fn validate_config_path(path: &str) -> anyhow::Result<()> {
    if path.is_empty() {
        anyhow::bail!("config path cannot be empty");
    }
    if lexical_clean(Path::new(path))
        .components()
        .any(|component| component == Component::ParentDir)
    {
        anyhow::bail!("config path contains directory traversal sequences");
    }
    Ok(())
}

/// Rejects snapshot paths that resolve outside the snapshot directory, so
/// load/diff/update cannot be pointed at arbitrary files.
pub fn validate_snapshot_path(path: &str, snapshot_dir: &str) -> anyhow::Result<()> {
    if path.is_empty() {
        anyhow::bail!("snapshot path cannot be empty");
    }

    let abs_path = absolute(Path::new(path)).context("resolve snapshot path")?;
    let abs_dir = absolute(Path::new(snapshot_dir)).context("resolve snapshot directory")?;

    if abs_path != abs_dir && !abs_path.starts_with(&abs_dir) {
        anyhow::bail!(
            "snapshot path {} escapes the snapshot directory {}",
            path,
            snapshot_dir
        );
    }
    Ok(())
}

/// Lexically absolute form of a path: current-dir-joined and cleaned, with
/// no filesystem access (the target may not exist yet).
fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("determine current directory")?
            .join(path)
    };
    Ok(lexical_clean(&joined))
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = cleaned.pop();
                // A leading run of `..` has nothing to pop; keep it so the
                // traversal stays visible to validators.
                if !popped {
                    cleaned.push(Component::ParentDir);
                }
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::{validate_config_path, validate_snapshot_path};

    #[test]
    fn plain_config_paths_are_accepted() {
        validate_config_path("snaptest.toml").unwrap();
        validate_config_path("configs/prod.toml").unwrap();
        validate_config_path("/etc/snaptest/config.toml").unwrap();
    }

    #[test]
    fn traversal_config_paths_are_rejected() {
        assert!(validate_config_path("../secrets.toml").is_err());
        assert!(validate_config_path("configs/../../etc/passwd").is_err());
        assert!(validate_config_path("").is_err());
    }

    #[test]
    fn dot_segments_that_stay_inside_are_fine() {
        validate_config_path("configs/./prod.toml").unwrap();
        validate_config_path("configs/staging/../prod.toml").unwrap();
    }

    #[test]
    fn snapshot_paths_must_stay_inside_the_snapshot_dir() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();

        let inside = format!("{base}/svc/GET_x/001_a.snapshot.json");
        validate_snapshot_path(&inside, base).unwrap();

        validate_snapshot_path(base, base).unwrap();

        let outside = format!("{base}/../escape.snapshot.json");
        assert!(validate_snapshot_path(&outside, base).is_err());

        assert!(validate_snapshot_path("/etc/passwd", base).is_err());
        assert!(validate_snapshot_path("", base).is_err());
    }

    #[test]
    fn sibling_directory_with_shared_prefix_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("snapshots");
        let sibling = dir.path().join("snapshots_evil").join("x.snapshot.json");
        assert!(
            validate_snapshot_path(
                sibling.to_str().unwrap(),
                base.to_str().unwrap()
            )
            .is_err()
        );
    }
}
