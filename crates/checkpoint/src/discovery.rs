//! Locating checkpoints on disk
//!
//! Sessions live at `<root>/<session_type>/<session_time>/` and hold
//! artifacts named `model_<step>.<ext>`.

use chrono::NaiveDateTime;
use regex::Regex;
use runtime_core::{Error, Result, Step, SESSION_TIME_FORMAT};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the checkpoint artifact for `step`
pub fn artifact_file_name(step: Step, extension: &str) -> String {
    format!("model_{}.{}", step, extension)
}

fn artifact_pattern(extension: &str) -> Result<Regex> {
    let pattern = format!(r"^model_(\d+)\.{}$", regex::escape(extension));
    Regex::new(&pattern).map_err(|e| Error::Internal {
        message: format!("invalid artifact pattern {}: {}", pattern, e),
    })
}

/// Step encoded in an artifact file name, if it is one
pub fn parse_artifact_step(file_name: &str, extension: &str) -> Option<Step> {
    artifact_pattern(extension)
        .ok()?
        .captures(file_name)
        .and_then(|caps| caps[1].parse().ok())
}

/// Parse a session directory name
pub fn parse_session_time(name: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(name, SESSION_TIME_FORMAT).ok()
}

/// Largest step among the artifacts directly inside `dir`
pub fn latest_step_in(dir: &Path, extension: &str) -> Result<Option<Step>> {
    let pattern = artifact_pattern(extension)?;
    let mut latest = None;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let step = pattern
            .captures(&name.to_string_lossy())
            .and_then(|caps| caps[1].parse::<Step>().ok());
        if let Some(step) = step {
            latest = latest.max(Some(step));
        }
    }
    Ok(latest)
}

/// Most recent session under `type_dir` that holds at least one artifact
pub fn latest_session_in(type_dir: &Path, extension: &str) -> Result<Option<(String, Step)>> {
    let mut sessions = Vec::new();
    for entry in std::fs::read_dir(type_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(time) = parse_session_time(&name) {
            sessions.push((time, name));
        }
    }
    sessions.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, name) in sessions {
        if let Some(step) = latest_step_in(&type_dir.join(&name), extension)? {
            return Ok(Some((name, step)));
        }
        debug!(session = %name, "Skipping session without checkpoints");
    }
    Ok(None)
}

/// Where a restore path points
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePoint {
    pub root: PathBuf,
    pub session_type: String,
    pub session_time: String,
    pub step: Step,
}

/// Resolve a restore path of the form
/// `<root>/<session_type>[/<session_time>][/model_<step>.<ext>]`
pub fn resolve_restore_path(path: &Path, extension: &str) -> Result<RestorePoint> {
    let invalid = |reason: String| Error::InvalidRestorePath {
        path: path.display().to_string(),
        reason,
    };

    let resolved = std::fs::canonicalize(path).map_err(|e| invalid(e.to_string()))?;

    let (time_dir, step) = if resolved.is_file() {
        let name = file_name(&resolved).ok_or_else(|| invalid("no file name".to_string()))?;
        let step = parse_artifact_step(name, extension).ok_or_else(|| {
            invalid(format!("{:?} is not named model_<step>.{}", name, extension))
        })?;
        let parent = resolved
            .parent()
            .ok_or_else(|| invalid("artifact has no parent directory".to_string()))?;
        (parent.to_path_buf(), step)
    } else if let Some(step) = latest_step_in(&resolved, extension)? {
        (resolved, step)
    } else {
        let (session_time, step) = latest_session_in(&resolved, extension)?
            .ok_or_else(|| invalid("no session with a checkpoint found".to_string()))?;
        (resolved.join(session_time), step)
    };

    let session_time = file_name(&time_dir)
        .filter(|name| parse_session_time(name).is_some())
        .ok_or_else(|| {
            invalid(format!(
                "session directory {:?} is not a {} timestamp",
                time_dir, SESSION_TIME_FORMAT
            ))
        })?
        .to_string();

    let type_dir = time_dir
        .parent()
        .ok_or_else(|| invalid("missing session type directory".to_string()))?;
    let session_type = file_name(type_dir)
        .ok_or_else(|| invalid("missing session type directory".to_string()))?
        .to_string();
    let root = type_dir
        .parent()
        .ok_or_else(|| invalid("missing root directory".to_string()))?
        .to_path_buf();

    Ok(RestorePoint {
        root,
        session_type,
        session_time,
        step,
    })
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_parse_artifact_step() {
        assert_eq!(parse_artifact_step("model_120.bin", "bin"), Some(120));
        assert_eq!(parse_artifact_step("model_120.json", "bin"), None);
        assert_eq!(parse_artifact_step("model_.bin", "bin"), None);
        assert_eq!(parse_artifact_step("xmodel_1.bin", "bin"), None);
        assert_eq!(parse_artifact_step("model_1xbin", "bin"), None);
    }

    #[test]
    fn test_latest_step_is_numeric() {
        let dir = TempDir::new().unwrap();
        for step in [9, 10, 100, 20] {
            touch(&dir.path().join(artifact_file_name(step, "bin")));
        }
        touch(&dir.path().join("checkpoints.json"));
        assert_eq!(latest_step_in(dir.path(), "bin").unwrap(), Some(100));
    }

    #[test]
    fn test_resolve_artifact_path() {
        let root = TempDir::new().unwrap();
        let artifact = root
            .path()
            .join("train")
            .join("2024-03-01 12:00:00")
            .join("model_40.bin");
        touch(&artifact);

        let point = resolve_restore_path(&artifact, "bin").unwrap();
        assert_eq!(point.session_type, "train");
        assert_eq!(point.session_time, "2024-03-01 12:00:00");
        assert_eq!(point.step, 40);
        assert_eq!(point.root, std::fs::canonicalize(root.path()).unwrap());
    }

    #[test]
    fn test_resolve_type_dir_picks_newest_session_with_checkpoint() {
        let root = TempDir::new().unwrap();
        let type_dir = root.path().join("train");
        touch(&type_dir.join("2024-01-01 00:00:00").join("model_5.bin"));
        touch(&type_dir.join("2024-02-01 00:00:00").join("model_7.bin"));
        touch(&type_dir.join("2024-02-01 00:00:00").join("model_12.bin"));
        std::fs::create_dir_all(type_dir.join("2024-03-01 00:00:00")).unwrap();
        std::fs::create_dir_all(type_dir.join("scratch")).unwrap();

        let point = resolve_restore_path(&type_dir, "bin").unwrap();
        assert_eq!(point.session_time, "2024-02-01 00:00:00");
        assert_eq!(point.step, 12);
    }

    #[test]
    fn test_resolve_rejects_malformed_paths() {
        let root = TempDir::new().unwrap();
        let stray = root.path().join("train").join("notes.txt");
        touch(&stray);

        assert!(matches!(
            resolve_restore_path(&stray, "bin"),
            Err(Error::InvalidRestorePath { .. })
        ));
        assert!(matches!(
            resolve_restore_path(&root.path().join("missing"), "bin"),
            Err(Error::InvalidRestorePath { .. })
        ));

        let bad_time = root.path().join("train").join("latest").join("model_1.bin");
        touch(&bad_time);
        assert!(matches!(
            resolve_restore_path(&bad_time, "bin"),
            Err(Error::InvalidRestorePath { .. })
        ));
    }
}
