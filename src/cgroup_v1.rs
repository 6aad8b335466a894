//! Cgroup v1 Subsystem Controllers
//!
//! Each v1 subsystem (memory, cpu, cpuset, ...) has its own mount. The
//! process's cgroup path is reported relative to the hierarchy root, which
//! may itself be a subtree when the mount was bind-mounted into a container.
//!
//! ## Path Translation
//!
//! | Hierarchy root | Cgroup path | Control directory |
//! |----------------|-------------|-------------------|
//! | `/` | `/` | mount point |
//! | `/` | `/a/b` | mount point + `/a/b` |
//! | `/a` | `/a` | mount point |
//! | `/a` | `/a/b` | mount point + `/b` |
//! | anything else | | unresolved |
//!
//! v1 reports "no limit" as a page-aligned value near `i64::MAX`; values
//! above [`UNLIMITED_MIN`] are normalized to [`LONG_RETVAL_UNLIMITED`].

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::cgroup::{
    convert_to_long, read_double_value, read_keyed_entry, read_long_value, read_matching_line,
    CgroupSubsystemController, DOUBLE_RETVAL_UNLIMITED, LONG_RETVAL_UNLIMITED,
};

/// Values above this are treated as unlimited
pub const UNLIMITED_MIN: i64 = 0x7FFF_FFFF_FF00_0000;

/// One mounted v1 subsystem
#[derive(Debug, Clone)]
pub struct CgroupV1SubsystemController {
    root: String,
    mount_point: String,
    path: Option<PathBuf>,
}

impl CgroupV1SubsystemController {
    /// Controller for a hierarchy rooted at `root` mounted on `mount_point`
    ///
    /// The control directory is unresolved until [`set_path`](Self::set_path).
    pub fn new(root: impl Into<String>, mount_point: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            mount_point: mount_point.into(),
            path: None,
        }
    }

    /// Hierarchy root as mounted
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Mount point of the hierarchy
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    /// Resolve the control directory for `cgroup_path`
    pub fn set_path(&mut self, cgroup_path: &str) {
        let resolved = if self.root == "/" {
            if cgroup_path == "/" {
                Some(self.mount_point.clone())
            } else {
                Some(format!("{}{}", self.mount_point, cgroup_path))
            }
        } else if self.root == cgroup_path {
            Some(self.mount_point.clone())
        } else if cgroup_path.len() > self.root.len() && cgroup_path.starts_with(&self.root) {
            Some(format!("{}{}", self.mount_point, &cgroup_path[self.root.len()..]))
        } else {
            debug!(
                root = %self.root,
                cgroup_path,
                "cgroup path outside hierarchy root"
            );
            None
        };

        self.path = resolved.map(PathBuf::from);
    }

    // ------------------------------------------------------------------------
    // Conversions
    // ------------------------------------------------------------------------

    /// Normalize near-max values to [`LONG_RETVAL_UNLIMITED`]
    pub fn long_val_or_unlimited(value: i64) -> i64 {
        if value > UNLIMITED_MIN {
            LONG_RETVAL_UNLIMITED
        } else {
            value
        }
    }

    /// Overflow becomes `i64::MAX`, anything unparsable unlimited
    pub fn convert_string_to_long(value: &str) -> i64 {
        convert_to_long(value, i64::MAX, LONG_RETVAL_UNLIMITED)
    }

    /// Second token of a `name value` line
    ///
    /// Lines with any other token count yield a value just past
    /// [`UNLIMITED_MIN`] so the caller's normalization maps them to unlimited.
    pub fn convert_hierarchical_limit_line(line: &str) -> i64 {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [_, value] => Self::convert_string_to_long(value),
            _ => UNLIMITED_MIN + 1,
        }
    }

    // ------------------------------------------------------------------------
    // Readers
    // ------------------------------------------------------------------------

    /// Single-value file, normalized
    pub fn get_long_value(&self, file: &str) -> i64 {
        Self::long_val_or_unlimited(read_long_value(
            self,
            file,
            Self::convert_string_to_long,
            LONG_RETVAL_UNLIMITED,
        ))
    }

    /// Keyed entry, normalized
    pub fn get_long_entry(&self, file: &str, key: &str) -> i64 {
        Self::long_val_or_unlimited(read_keyed_entry(self, file, key, LONG_RETVAL_UNLIMITED))
    }

    /// Single-value float file
    pub fn get_double_value(&self, file: &str) -> f64 {
        read_double_value(self, file, DOUBLE_RETVAL_UNLIMITED)
    }

    /// `prefix value` line, normalized
    pub fn get_long_value_matching_line(&self, file: &str, prefix: &str) -> i64 {
        Self::long_val_or_unlimited(read_matching_line(
            self,
            file,
            prefix,
            Self::convert_hierarchical_limit_line,
            LONG_RETVAL_UNLIMITED,
        ))
    }
}

impl CgroupSubsystemController for CgroupV1SubsystemController {
    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn resolved(root: &str, mount_point: &str, cgroup_path: &str) -> Option<PathBuf> {
        let mut ctrl = CgroupV1SubsystemController::new(root, mount_point);
        ctrl.set_path(cgroup_path);
        ctrl.path().map(Path::to_path_buf)
    }

    #[test]
    fn test_set_path_subtree_root() {
        assert_eq!(
            resolved("/user.slice", "/sys/fs/cgroup/memory", "/user.slice/foo"),
            Some(PathBuf::from("/sys/fs/cgroup/memory/foo"))
        );
    }

    #[test]
    fn test_set_path_filesystem_root() {
        assert_eq!(
            resolved("/", "/sys/fs/cgroup/cpu", "/"),
            Some(PathBuf::from("/sys/fs/cgroup/cpu"))
        );
        assert_eq!(
            resolved("/", "/sys/fs/cgroup/cpu", "/docker/abc"),
            Some(PathBuf::from("/sys/fs/cgroup/cpu/docker/abc"))
        );
    }

    #[test]
    fn test_set_path_same_as_root() {
        assert_eq!(
            resolved("/docker/abc", "/sys/fs/cgroup/memory", "/docker/abc"),
            Some(PathBuf::from("/sys/fs/cgroup/memory"))
        );
    }

    #[test]
    fn test_set_path_unmatched_stays_unresolved() {
        assert_eq!(resolved("/docker/abc", "/sys/fs/cgroup/memory", "/other"), None);
        assert_eq!(resolved("/docker/abc", "/sys/fs/cgroup/memory", "/docker"), None);
    }

    #[test]
    fn test_long_val_or_unlimited() {
        assert_eq!(CgroupV1SubsystemController::long_val_or_unlimited(1024), 1024);
        assert_eq!(
            CgroupV1SubsystemController::long_val_or_unlimited(UNLIMITED_MIN),
            UNLIMITED_MIN
        );
        assert_eq!(
            CgroupV1SubsystemController::long_val_or_unlimited(0x7FFF_FFFF_FFFF_F000),
            LONG_RETVAL_UNLIMITED
        );
    }

    #[test]
    fn test_convert_string_to_long() {
        assert_eq!(CgroupV1SubsystemController::convert_string_to_long("512"), 512);
        assert_eq!(
            CgroupV1SubsystemController::convert_string_to_long("18446744073709551615"),
            i64::MAX
        );
        assert_eq!(CgroupV1SubsystemController::convert_string_to_long("max"), -1);
    }

    #[test]
    fn test_convert_hierarchical_limit_line() {
        assert_eq!(
            CgroupV1SubsystemController::convert_hierarchical_limit_line(
                "hierarchical_memory_limit 2048"
            ),
            2048
        );
        assert_eq!(
            CgroupV1SubsystemController::convert_hierarchical_limit_line("hierarchical_memory_limit"),
            UNLIMITED_MIN + 1
        );
    }

    #[test]
    fn test_readers_over_fake_hierarchy() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().to_str().unwrap().to_string();
        let leaf = dir.path().join("docker");
        fs::create_dir(&leaf).unwrap();
        fs::write(leaf.join("memory.limit_in_bytes"), "9223372036854771712\n").unwrap();
        fs::write(leaf.join("memory.usage_in_bytes"), "4096\n").unwrap();
        fs::write(
            leaf.join("memory.stat"),
            "cache 0\nhierarchical_memory_limit 1048576\ntotal_rss 12\n",
        )
        .unwrap();
        fs::write(leaf.join("cpu.rate"), "0.25\n").unwrap();

        let mut ctrl = CgroupV1SubsystemController::new("/", mount);
        ctrl.set_path("/docker");

        assert_eq!(ctrl.get_long_value("memory.limit_in_bytes"), LONG_RETVAL_UNLIMITED);
        assert_eq!(ctrl.get_long_value("memory.usage_in_bytes"), 4096);
        assert_eq!(ctrl.get_long_value("missing"), LONG_RETVAL_UNLIMITED);
        assert_eq!(ctrl.get_long_entry("memory.stat", "total_rss"), 12);
        assert_eq!(
            ctrl.get_long_value_matching_line("memory.stat", "hierarchical_memory_limit"),
            1048576
        );
        assert_eq!(
            ctrl.get_long_value_matching_line("memory.stat", "nope"),
            LONG_RETVAL_UNLIMITED
        );
        assert_eq!(ctrl.get_double_value("cpu.rate"), 0.25);
    }
}
