//! Cgroup v2 Subsystem Controller
//!
//! The unified hierarchy has a single mount, so the control directory is the
//! mount path joined with the process's cgroup path. Limits use the literal
//! token `max` for "no limit".
//!
//! | File | Example |
//! |------|---------|
//! | `memory.max` | `max` or `268435456` |
//! | `cpu.max` | `max 100000` or `50000 100000` |
//! | `cpu.weight` | `100` |
//! | `cpu.stat` | `usage_usec 1234` |

use std::path::{Path, PathBuf};

use crate::cgroup::{convert_to_long, read_keyed_value, CgroupSubsystemController, LONG_RETVAL_UNLIMITED};

/// The unified v2 hierarchy
#[derive(Debug, Clone)]
pub struct CgroupV2SubsystemController {
    mount_path: PathBuf,
    path: PathBuf,
}

impl CgroupV2SubsystemController {
    /// Controller for `cgroup_path` under `mount_path`
    pub fn new(mount_path: impl Into<PathBuf>, cgroup_path: &str) -> Self {
        let mount_path = mount_path.into();
        // An absolute path would replace the mount on join
        let relative = cgroup_path.trim_start_matches('/');
        let path = if relative.is_empty() {
            mount_path.clone()
        } else {
            mount_path.join(relative)
        };
        Self { mount_path, path }
    }

    /// Mount path of the unified hierarchy
    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    /// `max` is unlimited; overflow and garbage are too
    pub fn convert_string_to_long(value: &str) -> i64 {
        if value == "max" {
            return LONG_RETVAL_UNLIMITED;
        }
        convert_to_long(value, LONG_RETVAL_UNLIMITED, LONG_RETVAL_UNLIMITED)
    }

    /// Keyed entry with `max` handling
    pub fn get_long_entry(&self, file: &str, key: &str) -> i64 {
        read_keyed_value(self, file, key)
            .map_or(LONG_RETVAL_UNLIMITED, |value| Self::convert_string_to_long(&value))
    }
}

impl CgroupSubsystemController for CgroupV2SubsystemController {
    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_path_joins_under_mount() {
        let ctrl = CgroupV2SubsystemController::new("/sys/fs/cgroup", "/system.slice/app.service");
        assert_eq!(
            ctrl.path(),
            Some(Path::new("/sys/fs/cgroup/system.slice/app.service"))
        );

        let root = CgroupV2SubsystemController::new("/sys/fs/cgroup", "/");
        assert_eq!(root.path(), Some(Path::new("/sys/fs/cgroup")));
        assert_eq!(root.mount_path(), Path::new("/sys/fs/cgroup"));
    }

    #[test]
    fn test_convert_string_to_long() {
        assert_eq!(CgroupV2SubsystemController::convert_string_to_long("max"), -1);
        assert_eq!(CgroupV2SubsystemController::convert_string_to_long("100000"), 100000);
        assert_eq!(
            CgroupV2SubsystemController::convert_string_to_long("99999999999999999999"),
            -1
        );
        assert_eq!(CgroupV2SubsystemController::convert_string_to_long("bogus"), -1);
    }

    #[test]
    fn test_get_long_entry() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("memory.stat"),
            "anon 8192\nfile max\n",
        )
        .unwrap();

        let ctrl = CgroupV2SubsystemController::new(dir.path(), "/");
        assert_eq!(ctrl.get_long_entry("memory.stat", "anon"), 8192);
        assert_eq!(ctrl.get_long_entry("memory.stat", "file"), -1);
        assert_eq!(ctrl.get_long_entry("memory.stat", "absent"), -1);
        assert_eq!(ctrl.get_long_entry("missing", "anon"), -1);
    }
}
