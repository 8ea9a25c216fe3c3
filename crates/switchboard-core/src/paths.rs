use std::env;
use std::path::{Component, Path, PathBuf};

/// Return the user's home directory path.
///
/// Uses HOME on Unix-like systems and USERPROFILE on Windows.
pub fn get_home_dir() -> Option<PathBuf> {
    ["HOME", "USERPROFILE"]
        .iter()
        .filter_map(|key| env::var(key).ok())
        .find(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Expand a leading `~` to the home directory.
///
/// `~user` forms are left untouched.
pub fn expand_home(raw: &str) -> PathBuf {
    let home = match get_home_dir() {
        Some(home) => home,
        None => return PathBuf::from(raw),
    };

    if raw == "~" {
        home
    } else if let Some(rest) = raw.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(raw)
    }
}

/// Resolve the working directory for a new stream.
///
/// Falls back to the home directory when the path does not exist, and to the
/// current directory when there is no home either. Never fails.
pub fn resolve_working_dir(raw: &str) -> PathBuf {
    let expanded = expand_home(raw.trim());
    if !raw.trim().is_empty() && expanded.is_dir() {
        return expanded;
    }

    log::debug!(
        "Working directory '{}' does not exist, falling back to home",
        raw
    );
    get_home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Check that an identifier can be used as a single file name component.
pub fn is_safe_file_stem(component: &str) -> bool {
    if component.is_empty() {
        return false;
    }

    let mut components = Path::new(component).components();
    matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env<F: FnOnce()>(home: Option<&str>, userprofile: Option<&str>, f: F) {
        let _guard = ENV_LOCK.lock().unwrap();
        let prev_home = env::var("HOME").ok();
        let prev_userprofile = env::var("USERPROFILE").ok();

        match home {
            Some(value) => env::set_var("HOME", value),
            None => env::remove_var("HOME"),
        }
        match userprofile {
            Some(value) => env::set_var("USERPROFILE", value),
            None => env::remove_var("USERPROFILE"),
        }

        f();

        match prev_home {
            Some(value) => env::set_var("HOME", value),
            None => env::remove_var("HOME"),
        }
        match prev_userprofile {
            Some(value) => env::set_var("USERPROFILE", value),
            None => env::remove_var("USERPROFILE"),
        }
    }

    #[test]
    fn get_home_dir_prefers_home() {
        with_env(Some("/tmp/home"), Some("/tmp/profile"), || {
            assert_eq!(get_home_dir(), Some(PathBuf::from("/tmp/home")));
        });
    }

    #[test]
    fn get_home_dir_falls_back_to_userprofile() {
        with_env(None, Some("/tmp/profile"), || {
            assert_eq!(get_home_dir(), Some(PathBuf::from("/tmp/profile")));
        });
    }

    #[test]
    fn expand_home_handles_tilde_forms() {
        with_env(Some("/home/ada"), None, || {
            assert_eq!(expand_home("~"), PathBuf::from("/home/ada"));
            assert_eq!(expand_home("~/src/app"), PathBuf::from("/home/ada/src/app"));
            assert_eq!(expand_home("/opt/app"), PathBuf::from("/opt/app"));
            assert_eq!(expand_home("~other/app"), PathBuf::from("~other/app"));
        });
    }

    #[test]
    fn resolve_working_dir_keeps_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().to_str().unwrap().to_string();
        with_env(Some("/tmp"), None, || {
            assert_eq!(resolve_working_dir(&raw), dir.path());
        });
    }

    #[test]
    fn resolve_working_dir_falls_back_to_home() {
        let home = tempfile::tempdir().unwrap();
        let home_str = home.path().to_str().unwrap().to_string();
        with_env(Some(&home_str), None, || {
            assert_eq!(
                resolve_working_dir("/definitely/not/a/real/dir"),
                home.path()
            );
            assert_eq!(resolve_working_dir(""), home.path());
        });
    }

    #[test]
    fn safe_file_stems() {
        assert!(is_safe_file_stem("conv-123"));
        assert!(!is_safe_file_stem(""));
        assert!(!is_safe_file_stem(".."));
        assert!(!is_safe_file_stem("a/b"));
        assert!(!is_safe_file_stem("/etc"));
    }
}
