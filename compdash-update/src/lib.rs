//! Bundle-swap self-update, shared by the agent and the collector.
//!
//! A running bundle can never replace itself in-process on every platform we
//! ship to, so the swap is delegated to a trampoline: a short detached shell
//! script that outlives this process, waits for our PID to disappear, moves
//! the staged bundle into place, relaunches it, and cleans up after itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::info;
use uuid::Uuid;

/// Hard cap on a release archive.
pub const MAX_UPDATE_BYTES: u64 = 50 * 1024 * 1024;

#[cfg(target_os = "macos")]
const BUNDLE_EXTENSION: &str = ".app";
#[cfg(target_os = "macos")]
const EXECUTABLE_SUBDIR: &str = "Contents/MacOS";

#[cfg(not(target_os = "macos"))]
const BUNDLE_EXTENSION: &str = ".bundle";
#[cfg(not(target_os = "macos"))]
const EXECUTABLE_SUBDIR: &str = "bin";

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("update archive exceeds {MAX_UPDATE_BYTES} bytes")]
    FileTooLarge,
    #[error("unzip exited with failure")]
    UnzipFailed,
    #[error("no app bundle found in update archive")]
    NoAppBundleFound,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Stage `archive` and hand the swap to a detached trampoline.
///
/// On success this terminates the process after a short flush delay; it only
/// ever *returns* an error. The staging directory is removed on failure.
pub async fn apply_archive(archive: &[u8]) -> Result<(), SwapError> {
    if archive.len() as u64 > MAX_UPDATE_BYTES {
        return Err(SwapError::FileTooLarge);
    }

    let staging = std::env::temp_dir().join(format!("compdash-update-{}", Uuid::new_v4()));
    tokio::fs::create_dir_all(&staging).await?;

    let result = stage_and_launch(&staging, archive).await;
    if result.is_err() {
        let _ = tokio::fs::remove_dir_all(&staging).await;
    }
    result
}

async fn stage_and_launch(staging: &Path, archive: &[u8]) -> Result<(), SwapError> {
    let zip_path = staging.join("update.zip");
    tokio::fs::write(&zip_path, archive).await?;

    let extracted = staging.join("extracted");
    tokio::fs::create_dir_all(&extracted).await?;
    let unzip = Command::new("unzip")
        .arg("-o")
        .arg(&zip_path)
        .arg("-d")
        .arg(&extracted)
        .status()
        .await?;
    if !unzip.success() {
        return Err(SwapError::UnzipFailed);
    }

    let bundle = find_bundle(&extracted).ok_or(SwapError::NoAppBundleFound)?;
    let installed = installed_bundle_path()?;

    let trampoline_path = staging.join("trampoline.sh");
    let script = trampoline_script(
        std::process::id(),
        &bundle.path,
        &installed,
        &bundle.executable,
        staging,
    );
    tokio::fs::write(&trampoline_path, script).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(&trampoline_path).await?.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&trampoline_path, perms).await?;
    }

    std::process::Command::new(&trampoline_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;

    info!("update staged, handing off to trampoline");
    tokio::time::sleep(Duration::from_millis(500)).await;
    std::process::exit(0);
}

struct BundleLocation {
    path: PathBuf,
    /// Name of the executable inside [`EXECUTABLE_SUBDIR`].
    executable: String,
}

/// Recursively locate the new bundle inside the extracted archive: a
/// directory named `*{BUNDLE_EXTENSION}` containing a populated
/// `{EXECUTABLE_SUBDIR}`.
fn find_bundle(root: &Path) -> Option<BundleLocation> {
    let entries = std::fs::read_dir(root).ok()?;

    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let is_bundle = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(BUNDLE_EXTENSION));
        if is_bundle {
            if let Some(executable) = first_file_name(&path.join(EXECUTABLE_SUBDIR)) {
                return Some(BundleLocation { path, executable });
            }
        }
        subdirs.push(path);
    }

    subdirs.into_iter().find_map(|dir| find_bundle(&dir))
}

fn first_file_name(dir: &Path) -> Option<String> {
    std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .find(|entry| entry.path().is_file())
        .and_then(|entry| entry.file_name().into_string().ok())
}

/// Where the currently running bundle lives.
fn installed_bundle_path() -> std::io::Result<PathBuf> {
    let exe = std::env::current_exe()?.canonicalize()?;

    if let Some(bundle) = exe.ancestors().find(|p| {
        p.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(BUNDLE_EXTENSION))
    }) {
        return Ok(bundle.to_path_buf());
    }

    // Not installed as a bundle (dev build): swap the directory holding the
    // executable.
    Ok(exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/")))
}

/// Escape a path for interpolation inside double quotes in the trampoline.
/// Newlines cannot be represented in the template and are stripped.
fn shell_escape(path: &Path) -> String {
    let mut out = String::new();
    for c in path.to_string_lossy().chars() {
        match c {
            '\\' | '$' | '"' | '`' | '!' => {
                out.push('\\');
                out.push(c);
            }
            '\n' | '\r' => {}
            c => out.push(c),
        }
    }
    out
}

fn trampoline_script(
    parent_pid: u32,
    new_bundle: &Path,
    installed: &Path,
    executable: &str,
    staging: &Path,
) -> String {
    let new_bundle = shell_escape(new_bundle);
    let installed = shell_escape(installed);
    let staging = shell_escape(staging);

    let launch = if cfg!(target_os = "macos") {
        format!(
            "codesign --force --deep --sign - \"{installed}\" >/dev/null 2>&1\n\
             open \"{installed}\"\n"
        )
    } else {
        let executable = shell_escape(Path::new(executable));
        format!("\"{installed}/{EXECUTABLE_SUBDIR}/{executable}\" &\n")
    };

    format!(
        "#!/bin/sh\n\
         while kill -0 {parent_pid} 2>/dev/null; do sleep 0.5; done\n\
         rm -rf \"{installed}\"\n\
         mv \"{new_bundle}\" \"{installed}\"\n\
         {launch}\
         rm -rf \"{staging}\"\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oversized_archive_is_rejected_before_staging() {
        let archive = vec![0u8; (MAX_UPDATE_BYTES + 1) as usize];
        let err = apply_archive(&archive).await.unwrap_err();
        assert!(matches!(err, SwapError::FileTooLarge));
    }

    #[test]
    fn shell_escape_covers_the_dangerous_set() {
        let escaped = shell_escape(Path::new(r#"a"b$c`d\e!f"#));
        assert_eq!(escaped, r#"a\"b\$c\`d\\e\!f"#);
    }

    #[test]
    fn shell_escape_strips_newlines() {
        let escaped = shell_escape(Path::new("line1\nline2\rend"));
        assert_eq!(escaped, "line1line2end");
    }

    #[test]
    fn trampoline_waits_then_swaps_then_cleans() {
        let script = trampoline_script(
            4242,
            Path::new("/tmp/stage/extracted/New.app"),
            Path::new("/Applications/Thing.app"),
            "thing",
            Path::new("/tmp/stage"),
        );
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("while kill -0 4242"));
        assert!(script.contains("rm -rf \"/Applications/Thing.app\""));
        assert!(script.contains("mv \"/tmp/stage/extracted/New.app\" \"/Applications/Thing.app\""));
        assert!(script.trim_end().ends_with("rm -rf \"/tmp/stage\""));
    }

    #[test]
    fn trampoline_escapes_hostile_paths() {
        let script = trampoline_script(
            1,
            Path::new("/tmp/a$b/New.app"),
            Path::new("/Apps/we\"ird.app"),
            "thing",
            Path::new("/tmp/a$b"),
        );
        assert!(script.contains(r#"rm -rf "/Apps/we\"ird.app""#));
        assert!(script.contains(r#""/tmp/a\$b""#));
    }

    #[test]
    fn bundle_discovery_requires_executable_subdir() {
        let root = tempfile::tempdir().unwrap();

        // A decoy bundle with no executable subdirectory.
        let decoy = root.path().join(format!("Decoy{BUNDLE_EXTENSION}"));
        std::fs::create_dir_all(&decoy).unwrap();

        // The real bundle, nested one level down as unzip tends to produce.
        let nested = root.path().join("payload");
        let bundle = nested.join(format!("Dash{BUNDLE_EXTENSION}"));
        let exec_dir = bundle.join(EXECUTABLE_SUBDIR);
        std::fs::create_dir_all(&exec_dir).unwrap();
        std::fs::write(exec_dir.join("dash"), b"#!").unwrap();

        let found = find_bundle(root.path()).unwrap();
        assert_eq!(found.path, bundle);
        assert_eq!(found.executable, "dash");
    }

    #[test]
    fn bundle_discovery_fails_on_empty_archive() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("docs")).unwrap();
        assert!(find_bundle(root.path()).is_none());
    }
}
