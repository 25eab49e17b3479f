//! Virtual input backends.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use crate::types::InjectorKind;

/// Emits Linux key codes as a virtual key stroke. Codes are pressed in order
/// and released in reverse, so `[KEY_LEFTCTRL, KEY_C]` is a chord.
pub trait KeyInjector: Send + Sync + fmt::Debug {
    fn inject(&self, keys: &[u16]);
}

/// Logs the stroke without emitting it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogInjector;

impl KeyInjector for LogInjector {
    fn inject(&self, keys: &[u16]) {
        tracing::info!(linux_key_codes = ?keys, "Virtual key stroke");
    }
}

/// Emits strokes with `ydotool key`.
#[derive(Debug, Clone)]
pub struct YdotoolInjector {
    binary: PathBuf,
}

impl YdotoolInjector {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// `key 29:1 46:1 46:0 29:0` for `[29, 46]`.
    pub fn args(keys: &[u16]) -> Vec<String> {
        let mut args = Vec::with_capacity(keys.len() * 2 + 1);
        args.push("key".to_string());
        args.extend(keys.iter().map(|k| format!("{}:1", k)));
        args.extend(keys.iter().rev().map(|k| format!("{}:0", k)));
        args
    }
}

impl Default for YdotoolInjector {
    fn default() -> Self {
        Self::new("ydotool")
    }
}

impl KeyInjector for YdotoolInjector {
    fn inject(&self, keys: &[u16]) {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::error!("ydotool injection needs a tokio runtime");
            return;
        }

        let spawned = tokio::process::Command::new(&self.binary)
            .args(Self::args(keys))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(binary = %self.binary.display(), error = %e, "Failed to send key event");
                return;
            }
        };

        let keys = keys.to_vec();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => tracing::error!(%status, linux_key_codes = ?keys, "ydotool failed"),
                Err(e) => tracing::error!(error = %e, "Failed to wait for ydotool"),
            }
        });
    }
}

const YDOTOOL: &str = "ydotool";

pub fn build_injector(kind: InjectorKind) -> Arc<dyn KeyInjector> {
    match kind {
        InjectorKind::Log => Arc::new(LogInjector),
        InjectorKind::Ydotool => Arc::new(YdotoolInjector::default()),
        InjectorKind::Auto => match find_in_path(YDOTOOL, std::env::var_os("PATH")) {
            Some(binary) => {
                tracing::info!(binary = %binary.display(), "Injecting keys with ydotool");
                Arc::new(YdotoolInjector::new(binary))
            }
            None => {
                tracing::warn!("ydotool not found on PATH, key presses will only be logged");
                Arc::new(LogInjector)
            }
        },
    }
}

/// First regular file called `name` in the `PATH`-style list `path`.
fn find_in_path(name: &str, path: Option<OsString>) -> Option<PathBuf> {
    std::env::split_paths(&path?)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ydotool_args_press_then_release_in_reverse() {
        assert_eq!(YdotoolInjector::args(&[28]), vec!["key", "28:1", "28:0"]);
        assert_eq!(
            YdotoolInjector::args(&[29, 46]),
            vec!["key", "29:1", "46:1", "46:0", "29:0"]
        );
    }

    #[test]
    fn test_ydotool_is_found_on_path() {
        let empty = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        std::fs::write(bin.path().join(YDOTOOL), b"").unwrap();
        let path = std::env::join_paths([empty.path(), bin.path()]).unwrap();

        assert_eq!(
            find_in_path(YDOTOOL, Some(path)),
            Some(bin.path().join(YDOTOOL))
        );
        assert_eq!(
            find_in_path(YDOTOOL, Some(empty.path().as_os_str().to_os_string())),
            None
        );
        assert_eq!(find_in_path(YDOTOOL, None), None);
    }

    #[tokio::test]
    async fn test_missing_ydotool_is_logged_not_fatal() {
        YdotoolInjector::new("/nonexistent/ydotool").inject(&[28]);
    }
}
