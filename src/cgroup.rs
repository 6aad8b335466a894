//! Cgroup Subsystem Controllers
//!
//! Best-effort readers for the pseudo-files a cgroup controller exposes.
//! Nothing here returns an error: a missing controller, an unreadable file
//! or malformed content degrades to a caller-supplied default.
//!
//! ## File Shapes
//!
//! | Shape | Example | Reader |
//! |-------|---------|--------|
//! | single value | `268435456` | [`read_long_value`], [`read_double_value`] |
//! | keyed lines | `usage_usec 1234` | [`read_keyed_entry`] |
//! | prefixed line | `hierarchical_memory_limit 9223372036854771712` | [`read_matching_line`] |
//! | range list | `0-3,8,10-11` | [`parse_range_list`] |
//!
//! ## Sentinels
//!
//! [`LONG_RETVAL_UNLIMITED`] and [`DOUBLE_RETVAL_UNLIMITED`] mean "no limit"
//! or "not available"; callers treat both the same.

use core::fmt;
use core::num::IntErrorKind;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Integer "unlimited / not available"
pub const LONG_RETVAL_UNLIMITED: i64 = -1;

/// Floating-point "unlimited / not available"
pub const DOUBLE_RETVAL_UNLIMITED: f64 = -1.0;

/// A cgroup controller whose control files live under [`path`](Self::path)
pub trait CgroupSubsystemController: fmt::Debug + Send + Sync {
    /// Directory holding the control files, if resolved
    fn path(&self) -> Option<&Path>;
}

fn control_file(controller: &dyn CgroupSubsystemController, file: &str) -> Option<PathBuf> {
    controller
        .path()
        .map(|dir| dir.join(file.trim_start_matches('/')))
}

fn read_to_string(controller: &dyn CgroupSubsystemController, file: &str) -> Option<String> {
    let path = control_file(controller, file)?;
    match fs::read_to_string(&path) {
        Ok(contents) => Some(contents),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "cgroup file unreadable");
            None
        }
    }
}

// ============================================================================
// File Readers
// ============================================================================

/// First line of `file`, without the line terminator
///
/// `None` when the controller has no path or the file cannot be read.
pub fn read_first_line(controller: &dyn CgroupSubsystemController, file: &str) -> Option<String> {
    let contents = read_to_string(controller, file)?;
    Some(contents.lines().next().unwrap_or("").to_string())
}

/// Convert the first line of `file` starting with `prefix`
///
/// The whole line is passed to `convert`.
pub fn read_matching_line<T>(
    controller: &dyn CgroupSubsystemController,
    file: &str,
    prefix: &str,
    convert: impl Fn(&str) -> T,
    default: T,
) -> T {
    let contents = match read_to_string(controller, file) {
        Some(contents) => contents,
        None => return default,
    };

    match contents.lines().find(|line| line.starts_with(prefix)) {
        Some(line) => convert(line),
        None => {
            debug!(file, prefix, "no matching line");
            default
        }
    }
}

/// Convert the first line of `file`
pub fn read_long_value(
    controller: &dyn CgroupSubsystemController,
    file: &str,
    convert: impl Fn(&str) -> i64,
    default: i64,
) -> i64 {
    match read_first_line(controller, file) {
        Some(line) => convert(line.trim()),
        None => default,
    }
}

/// First line of `file` as a float
pub fn read_double_value(
    controller: &dyn CgroupSubsystemController,
    file: &str,
    default: f64,
) -> f64 {
    let line = match read_first_line(controller, file) {
        Some(line) => line,
        None => return default,
    };

    match line.trim().parse::<f64>() {
        Ok(value) => value,
        Err(e) => {
            debug!(file, value = %line, error = %e, "not a number");
            default
        }
    }
}

/// Raw value paired with `key` in a `key value` per-line file
pub fn read_keyed_value(
    controller: &dyn CgroupSubsystemController,
    file: &str,
    key: &str,
) -> Option<String> {
    let contents = read_to_string(controller, file)?;
    contents.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        match (tokens.next(), tokens.next()) {
            (Some(k), Some(v)) if k == key => Some(v.to_string()),
            _ => None,
        }
    })
}

/// Integer paired with `key` in a `key value` per-line file
///
/// `default` when the key is absent, the value is not an integer, or the
/// file cannot be read.
pub fn read_keyed_entry(
    controller: &dyn CgroupSubsystemController,
    file: &str,
    key: &str,
    default: i64,
) -> i64 {
    match read_keyed_value(controller, file, key) {
        Some(value) => value.parse().unwrap_or_else(|e| {
            debug!(file, key, %value, error = %e, "keyed entry not an integer");
            default
        }),
        None => default,
    }
}

// ============================================================================
// Conversions
// ============================================================================

/// Parse a list like `0-3,8,10-11` into sorted integers
///
/// Returns `None` for empty input or a non-numeric token. Segments with
/// more than one `-` are skipped. A reversed range such as `5-3` yields
/// nothing. Duplicates are kept.
pub fn parse_range_list(list: &str) -> Option<Vec<i32>> {
    let list = list.trim();
    if list.is_empty() {
        return None;
    }

    let mut values = Vec::new();
    for segment in list.split(',') {
        let bounds: Vec<&str> = segment.split('-').collect();
        match bounds.as_slice() {
            [single] => values.push(parse_bound(single)?),
            [lo, hi] => {
                let (lo, hi) = (parse_bound(lo)?, parse_bound(hi)?);
                values.extend(lo..=hi);
            }
            _ => debug!(segment, "skipping malformed range segment"),
        }
    }

    values.sort_unstable();
    Some(values)
}

fn parse_bound(token: &str) -> Option<i32> {
    match token.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(token, error = %e, "range bound not an integer");
            None
        }
    }
}

/// Parse a decimal `i64`
///
/// A value above `i64::MAX` returns `overflow_default`; any other failure
/// (including values below `i64::MIN`) returns `error_default`.
pub fn convert_to_long(value: &str, overflow_default: i64, error_default: i64) -> i64 {
    match value.parse::<i64>() {
        Ok(parsed) => parsed,
        Err(e) if *e.kind() == IntErrorKind::PosOverflow => overflow_default,
        Err(_) => error_default,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug)]
    struct FakeController {
        path: Option<PathBuf>,
    }

    impl CgroupSubsystemController for FakeController {
        fn path(&self) -> Option<&Path> {
            self.path.as_deref()
        }
    }

    fn controller_with(files: &[(&str, &str)]) -> (TempDir, FakeController) {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            fs::write(dir.path().join(name), contents).unwrap();
        }
        let controller = FakeController {
            path: Some(dir.path().to_path_buf()),
        };
        (dir, controller)
    }

    #[test]
    fn test_parse_range_list() {
        assert_eq!(parse_range_list("1,3-4,6"), Some(vec![1, 3, 4, 6]));
        assert_eq!(parse_range_list("2-2"), Some(vec![2]));
        assert_eq!(parse_range_list("8,0-2\n"), Some(vec![0, 1, 2, 8]));
        assert_eq!(parse_range_list("1-2,2"), Some(vec![1, 2, 2]));
    }

    #[test]
    fn test_parse_range_list_empty_and_invalid() {
        assert_eq!(parse_range_list(""), None);
        assert_eq!(parse_range_list("  \n"), None);
        assert_eq!(parse_range_list("1,x"), None);
        assert_eq!(parse_range_list("1-2-3,5"), Some(vec![5]));
    }

    #[test]
    fn test_parse_range_list_reversed_range_is_empty() {
        assert_eq!(parse_range_list("5-3"), Some(vec![]));
        assert_eq!(parse_range_list("5-3,7"), Some(vec![7]));
    }

    #[test]
    fn test_convert_to_long() {
        assert_eq!(convert_to_long("42", -2, -3), 42);
        assert_eq!(convert_to_long("99999999999999999999", -2, -3), -2);
        assert_eq!(convert_to_long("abc", -2, -3), -3);
        assert_eq!(convert_to_long("-99999999999999999999", -2, -3), -3);
        assert_eq!(convert_to_long("", -2, -3), -3);
    }

    #[test]
    fn test_read_first_line() {
        let (_dir, ctrl) = controller_with(&[("memory.max", "1024\nignored\n")]);
        assert_eq!(read_first_line(&ctrl, "memory.max").as_deref(), Some("1024"));
        assert_eq!(read_first_line(&ctrl, "/memory.max").as_deref(), Some("1024"));
        assert_eq!(read_first_line(&ctrl, "missing"), None);

        let detached = FakeController { path: None };
        assert_eq!(read_first_line(&detached, "memory.max"), None);
    }

    #[test]
    fn test_read_long_and_double_values() {
        let (_dir, ctrl) = controller_with(&[
            ("cpu.cfs_quota_us", "50000\n"),
            ("cpu.rate", "1.5\n"),
            ("garbage", "xyz\n"),
        ]);
        let convert = |s: &str| convert_to_long(s, i64::MAX, -1);

        assert_eq!(read_long_value(&ctrl, "cpu.cfs_quota_us", convert, -7), 50000);
        assert_eq!(read_long_value(&ctrl, "missing", convert, -7), -7);
        assert_eq!(read_double_value(&ctrl, "cpu.rate", -1.0), 1.5);
        assert_eq!(read_double_value(&ctrl, "garbage", -1.0), -1.0);
        assert_eq!(read_double_value(&ctrl, "missing", DOUBLE_RETVAL_UNLIMITED), -1.0);
    }

    #[test]
    fn test_read_matching_line() {
        let (_dir, ctrl) = controller_with(&[(
            "memory.stat",
            "cache 10\nhierarchical_memory_limit 4096\nhierarchical_memsw_limit 1\n",
        )]);
        let second = |line: &str| {
            line.split_whitespace()
                .nth(1)
                .map_or(-9, |v| convert_to_long(v, -8, -9))
        };

        assert_eq!(
            read_matching_line(&ctrl, "memory.stat", "hierarchical_memory_limit", second, -1),
            4096
        );
        assert_eq!(read_matching_line(&ctrl, "memory.stat", "swap", second, -1), -1);
        assert_eq!(read_matching_line(&ctrl, "missing", "cache", second, -1), -1);
    }

    #[test]
    fn test_read_keyed_entry() {
        let (_dir, ctrl) = controller_with(&[(
            "cpu.stat",
            "usage_usec 1500\nuser_usec notanumber\nnr_periods 7\n",
        )]);

        assert_eq!(read_keyed_entry(&ctrl, "cpu.stat", "usage_usec", -1), 1500);
        assert_eq!(read_keyed_entry(&ctrl, "cpu.stat", "nr_periods", -1), 7);
        assert_eq!(read_keyed_entry(&ctrl, "cpu.stat", "user_usec", -1), -1);
        assert_eq!(read_keyed_entry(&ctrl, "cpu.stat", "absent", -1), -1);
        assert_eq!(read_keyed_entry(&ctrl, "missing", "usage_usec", -1), -1);
        assert_eq!(
            read_keyed_value(&ctrl, "cpu.stat", "user_usec").as_deref(),
            Some("notanumber")
        );
    }
}
