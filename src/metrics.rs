//! Container Resource Metrics
//!
//! Detects which cgroup hierarchy the current process lives in and answers
//! resource-limit queries through the v1 or v2 controllers.
//!
//! ## Detection
//!
//! | `/proc/self/mountinfo` | `/proc/self/cgroup` | Result |
//! |------------------------|---------------------|--------|
//! | has `cgroup2` mount | only `0::<path>` | v2 |
//! | has `cgroup` mounts | `<id>:<controllers>:<path>` lines | v1 |
//! | neither | | `None` |
//!
//! ## Queries
//!
//! Every query returns [`LONG_RETVAL_UNLIMITED`] when the limit is absent or
//! cannot be read.
//!
//! | Query | v1 file | v2 file |
//! |-------|---------|---------|
//! | `memory_limit` | `memory.limit_in_bytes` | `memory.max` |
//! | `memory_usage` | `memory.usage_in_bytes` | `memory.current` |
//! | `cpu_quota` / `cpu_period` | `cpu.cfs_quota_us` / `cpu.cfs_period_us` | `cpu.max` |
//! | `cpu_shares` | `cpu.shares` | `cpu.weight` |
//! | `cpu_usage` | `cpuacct.usage` | `cpu.stat` |
//! | `cpuset_cpus` | `cpuset.cpus` | `cpuset.cpus` |

use std::collections::HashMap;
use std::fs;
use std::sync::OnceLock;

use tracing::debug;

use crate::cgroup::{parse_range_list, read_first_line, LONG_RETVAL_UNLIMITED};
use crate::cgroup_v1::CgroupV1SubsystemController;
use crate::cgroup_v2::CgroupV2SubsystemController;

/// Mount table of the current process
pub const PROC_SELF_MOUNTINFO: &str = "/proc/self/mountinfo";

/// Cgroup membership of the current process
pub const PROC_SELF_CGROUP: &str = "/proc/self/cgroup";

/// CPU shares granted to a container with no explicit setting
const PER_CPU_SHARES: i64 = 1024;

/// Largest `cpu.weight` the kernel accepts
const MAX_CPU_WEIGHT: i64 = 10_000;

/// v1 subsystems consulted for metrics
const V1_SUBSYSTEMS: [&str; 4] = ["memory", "cpu", "cpuacct", "cpuset"];

/// Cgroup hierarchy version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    /// Per-subsystem hierarchies
    V1,
    /// Unified hierarchy
    V2,
}

#[derive(Debug, Default)]
struct V1Controllers {
    memory: Option<CgroupV1SubsystemController>,
    cpu: Option<CgroupV1SubsystemController>,
    cpuacct: Option<CgroupV1SubsystemController>,
    cpuset: Option<CgroupV1SubsystemController>,
}

impl V1Controllers {
    fn slot(&mut self, subsystem: &str) -> Option<&mut Option<CgroupV1SubsystemController>> {
        match subsystem {
            "memory" => Some(&mut self.memory),
            "cpu" => Some(&mut self.cpu),
            "cpuacct" => Some(&mut self.cpuacct),
            "cpuset" => Some(&mut self.cpuset),
            _ => None,
        }
    }

    fn is_empty(&self) -> bool {
        self.memory.is_none() && self.cpu.is_none() && self.cpuacct.is_none() && self.cpuset.is_none()
    }
}

#[derive(Debug)]
enum Hierarchy {
    V1(V1Controllers),
    V2(CgroupV2SubsystemController),
}

/// Resource limits of the cgroup containing this process
#[derive(Debug)]
pub struct CgroupMetrics {
    hierarchy: Hierarchy,
}

// ============================================================================
// Detection
// ============================================================================

struct MountInfo<'a> {
    root: &'a str,
    mount_point: &'a str,
    fs_type: &'a str,
    super_options: &'a str,
}

/// `id parent dev root mount_point opts [optional...] - fstype source super_opts`
fn parse_mountinfo_line(line: &str) -> Option<MountInfo<'_>> {
    let (left, right) = line.split_once(" - ")?;
    let fields: Vec<&str> = left.split_whitespace().collect();
    let mut right = right.split_whitespace();
    let fs_type = right.next()?;
    let _source = right.next();
    Some(MountInfo {
        root: fields.get(3)?,
        mount_point: fields.get(4)?,
        fs_type,
        super_options: right.next().unwrap_or(""),
    })
}

/// `hierarchy_id:controller_list:cgroup_path`
fn parse_cgroup_line(line: &str) -> Option<(&str, &str, &str)> {
    let mut parts = line.splitn(3, ':');
    Some((parts.next()?, parts.next()?, parts.next()?))
}

fn read_proc(path: &str) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(contents) => Some(contents),
        Err(e) => {
            debug!(path, error = %e, "cannot read cgroup membership");
            None
        }
    }
}

impl CgroupMetrics {
    /// Detect from `/proc/self`
    pub fn detect() -> Option<Self> {
        let mountinfo = read_proc(PROC_SELF_MOUNTINFO)?;
        let proc_cgroup = read_proc(PROC_SELF_CGROUP)?;
        Self::detect_from(&mountinfo, &proc_cgroup)
    }

    /// Detect from the text of a mount table and a cgroup membership file
    pub fn detect_from(mountinfo: &str, proc_cgroup: &str) -> Option<Self> {
        let mounts: Vec<MountInfo<'_>> = mountinfo.lines().filter_map(parse_mountinfo_line).collect();
        let memberships: Vec<(&str, &str, &str)> = proc_cgroup
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(parse_cgroup_line)
            .collect();

        let unified_only = !memberships.is_empty()
            && memberships
                .iter()
                .all(|(id, controllers, _)| *id == "0" && controllers.is_empty());

        if unified_only {
            let mount = mounts.iter().find(|m| m.fs_type == "cgroup2")?;
            let (_, _, path) = memberships[0];
            debug!(mount_point = mount.mount_point, cgroup_path = path, "cgroup v2 detected");
            return Some(Self {
                hierarchy: Hierarchy::V2(CgroupV2SubsystemController::new(mount.mount_point, path)),
            });
        }

        let mut subsystem_mounts: HashMap<&str, &MountInfo<'_>> = HashMap::new();
        for mount in mounts.iter().filter(|m| m.fs_type == "cgroup") {
            for option in mount.super_options.split(',') {
                if V1_SUBSYSTEMS.contains(&option) {
                    subsystem_mounts.insert(option, mount);
                }
            }
        }

        let mut controllers = V1Controllers::default();
        for (_, names, path) in &memberships {
            for name in names.split(',') {
                let mount = match subsystem_mounts.get(name) {
                    Some(mount) => mount,
                    None => continue,
                };
                if let Some(slot) = controllers.slot(name) {
                    let mut controller = CgroupV1SubsystemController::new(mount.root, mount.mount_point);
                    controller.set_path(path);
                    *slot = Some(controller);
                }
            }
        }

        if controllers.is_empty() {
            debug!("no usable cgroup hierarchy");
            return None;
        }
        debug!(?controllers, "cgroup v1 detected");
        Some(Self {
            hierarchy: Hierarchy::V1(controllers),
        })
    }

    /// Hierarchy version in use
    pub fn version(&self) -> CgroupVersion {
        match self.hierarchy {
            Hierarchy::V1(_) => CgroupVersion::V1,
            Hierarchy::V2(_) => CgroupVersion::V2,
        }
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Memory limit in bytes
    pub fn memory_limit(&self) -> i64 {
        match &self.hierarchy {
            Hierarchy::V1(v1) => {
                let Some(memory) = &v1.memory else {
                    return LONG_RETVAL_UNLIMITED;
                };
                let limit = memory.get_long_value("memory.limit_in_bytes");
                if limit == LONG_RETVAL_UNLIMITED && memory.get_long_value("memory.use_hierarchy") > 0 {
                    memory.get_long_value_matching_line("memory.stat", "hierarchical_memory_limit")
                } else {
                    limit
                }
            }
            Hierarchy::V2(v2) => v2_long_value(v2, "memory.max"),
        }
    }

    /// Memory in use in bytes
    pub fn memory_usage(&self) -> i64 {
        match &self.hierarchy {
            Hierarchy::V1(v1) => v1_long_value(&v1.memory, "memory.usage_in_bytes"),
            Hierarchy::V2(v2) => v2_long_value(v2, "memory.current"),
        }
    }

    // ========================================================================
    // CPU
    // ========================================================================

    /// CFS quota in microseconds per period
    pub fn cpu_quota(&self) -> i64 {
        match &self.hierarchy {
            Hierarchy::V1(v1) => v1_long_value(&v1.cpu, "cpu.cfs_quota_us"),
            Hierarchy::V2(v2) => v2_cpu_max_field(v2, 0),
        }
    }

    /// CFS period in microseconds
    pub fn cpu_period(&self) -> i64 {
        match &self.hierarchy {
            Hierarchy::V1(v1) => v1_long_value(&v1.cpu, "cpu.cfs_period_us"),
            Hierarchy::V2(v2) => v2_cpu_max_field(v2, 1),
        }
    }

    /// Relative CPU shares; the default weight reports unlimited
    pub fn cpu_shares(&self) -> i64 {
        match &self.hierarchy {
            Hierarchy::V1(v1) => match v1_long_value(&v1.cpu, "cpu.shares") {
                PER_CPU_SHARES => LONG_RETVAL_UNLIMITED,
                shares => shares,
            },
            Hierarchy::V2(v2) => weight_to_shares(v2_long_value(v2, "cpu.weight")),
        }
    }

    /// Total CPU time consumed in nanoseconds
    pub fn cpu_usage(&self) -> i64 {
        match &self.hierarchy {
            Hierarchy::V1(v1) => v1_long_value(&v1.cpuacct, "cpuacct.usage"),
            Hierarchy::V2(v2) => match v2.get_long_entry("cpu.stat", "usage_usec") {
                LONG_RETVAL_UNLIMITED => LONG_RETVAL_UNLIMITED,
                usec => usec.saturating_mul(1000),
            },
        }
    }

    /// Times the group was throttled
    pub fn cpu_throttled_count(&self) -> i64 {
        match &self.hierarchy {
            Hierarchy::V1(v1) => v1
                .cpu
                .as_ref()
                .map_or(LONG_RETVAL_UNLIMITED, |cpu| cpu.get_long_entry("cpu.stat", "nr_throttled")),
            Hierarchy::V2(v2) => v2.get_long_entry("cpu.stat", "nr_throttled"),
        }
    }

    /// CPUs the group may run on
    pub fn cpuset_cpus(&self) -> Option<Vec<i32>> {
        match &self.hierarchy {
            Hierarchy::V1(v1) => {
                let cpuset = v1.cpuset.as_ref()?;
                parse_range_list(&read_first_line(cpuset, "cpuset.cpus")?)
            }
            Hierarchy::V2(v2) => read_first_line(v2, "cpuset.cpus")
                .and_then(|line| parse_range_list(&line))
                .or_else(|| parse_range_list(&read_first_line(v2, "cpuset.cpus.effective")?)),
        }
    }

    /// Processors usable by this process given `host` online processors
    ///
    /// The minimum of `host`, the quota ceiling and the cpuset size; never
    /// less than one.
    pub fn effective_cpu_count(&self, host: usize) -> usize {
        let mut count = host;

        let (quota, period) = (self.cpu_quota(), self.cpu_period());
        if quota > 0 && period > 0 {
            let ceiling = (quota as u64).div_ceil(period as u64) as usize;
            count = count.min(ceiling);
        }

        if let Some(cpus) = self.cpuset_cpus() {
            if !cpus.is_empty() {
                count = count.min(cpus.len());
            }
        }

        count.max(1)
    }
}

fn v1_long_value(controller: &Option<CgroupV1SubsystemController>, file: &str) -> i64 {
    controller
        .as_ref()
        .map_or(LONG_RETVAL_UNLIMITED, |c| c.get_long_value(file))
}

fn v2_long_value(controller: &CgroupV2SubsystemController, file: &str) -> i64 {
    read_first_line(controller, file).map_or(LONG_RETVAL_UNLIMITED, |line| {
        CgroupV2SubsystemController::convert_string_to_long(line.trim())
    })
}

/// `cpu.max` is `<quota|max> <period>`
fn v2_cpu_max_field(controller: &CgroupV2SubsystemController, index: usize) -> i64 {
    read_first_line(controller, "cpu.max")
        .and_then(|line| {
            line.split_whitespace()
                .nth(index)
                .map(CgroupV2SubsystemController::convert_string_to_long)
        })
        .unwrap_or(LONG_RETVAL_UNLIMITED)
}

/// Map a v2 `cpu.weight` back to v1 shares, rounded to a multiple of 1024
///
/// Inverse of the OCI runtime mapping `weight = 1 + ((shares - 2) * 9999) / 262142`.
/// Weights above the kernel maximum of 10000 count as 10000.
fn weight_to_shares(weight: i64) -> i64 {
    if weight == 100 || weight <= 0 {
        return LONG_RETVAL_UNLIMITED;
    }

    let weight = weight.min(MAX_CPU_WEIGHT);
    let shares = ((262_142 * weight - 1) as f64 / 9999.0) as i64 + 2;
    if shares <= PER_CPU_SHARES {
        return PER_CPU_SHARES;
    }

    let lower = (shares / PER_CPU_SHARES) * PER_CPU_SHARES;
    let upper = lower + PER_CPU_SHARES;
    if shares - lower <= upper - shares {
        lower
    } else {
        upper
    }
}

// ============================================================================
// Process-wide View
// ============================================================================

static SYSTEM: OnceLock<Option<CgroupMetrics>> = OnceLock::new();

/// Metrics for this process, detected once
pub fn system() -> Option<&'static CgroupMetrics> {
    SYSTEM.get_or_init(CgroupMetrics::detect).as_ref()
}

/// Online processors, bounded by the container's CPU limits
pub fn available_processors() -> usize {
    let host = host_processors();
    system().map_or(host, |metrics| metrics.effective_cpu_count(host))
}

#[cfg(unix)]
fn host_processors() -> usize {
    // SAFETY: sysconf reads a system constant and has no preconditions
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if online > 0 {
        online as usize
    } else {
        1
    }
}

#[cfg(not(unix))]
fn host_processors() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_files(dir: &Path, files: &[(&str, &str)]) {
        fs::create_dir_all(dir).unwrap();
        for (name, contents) in files {
            fs::write(dir.join(name), contents).unwrap();
        }
    }

    fn v2_tree(files: &[(&str, &str)]) -> (TempDir, CgroupMetrics) {
        let dir = tempfile::tempdir().unwrap();
        write_files(&dir.path().join("app.slice"), files);
        let mountinfo = format!(
            "35 25 0:30 / {} rw,nosuid shared:9 - cgroup2 cgroup2 rw,nsdelegate\n",
            dir.path().display()
        );
        let metrics = CgroupMetrics::detect_from(&mountinfo, "0::/app.slice\n").unwrap();
        (dir, metrics)
    }

    #[test]
    fn test_detect_v2() {
        let (_dir, metrics) = v2_tree(&[
            ("memory.max", "max\n"),
            ("memory.current", "1000\n"),
            ("cpu.max", "50000 100000\n"),
            ("cpu.weight", "79\n"),
            ("cpu.stat", "usage_usec 5\nnr_throttled 2\n"),
            ("cpuset.cpus", "\n"),
            ("cpuset.cpus.effective", "0-3\n"),
        ]);

        assert_eq!(metrics.version(), CgroupVersion::V2);
        assert_eq!(metrics.memory_limit(), LONG_RETVAL_UNLIMITED);
        assert_eq!(metrics.memory_usage(), 1000);
        assert_eq!(metrics.cpu_quota(), 50000);
        assert_eq!(metrics.cpu_period(), 100000);
        assert_eq!(metrics.cpu_shares(), 2048);
        assert_eq!(metrics.cpu_usage(), 5000);
        assert_eq!(metrics.cpu_throttled_count(), 2);
        assert_eq!(metrics.cpuset_cpus(), Some(vec![0, 1, 2, 3]));
        assert_eq!(metrics.effective_cpu_count(8), 1);
    }

    #[test]
    fn test_v2_unlimited_quota_uses_cpuset() {
        let (_dir, metrics) = v2_tree(&[
            ("cpu.max", "max 100000\n"),
            ("cpuset.cpus", "0-1,4\n"),
        ]);
        assert_eq!(metrics.cpu_quota(), LONG_RETVAL_UNLIMITED);
        assert_eq!(metrics.cpu_shares(), LONG_RETVAL_UNLIMITED);
        assert_eq!(metrics.effective_cpu_count(8), 3);
        assert_eq!(metrics.effective_cpu_count(2), 2);
    }

    #[test]
    fn test_detect_v1() {
        let dir = tempfile::tempdir().unwrap();
        let memory = dir.path().join("memory");
        let cpu = dir.path().join("cpu,cpuacct");
        let cpuset = dir.path().join("cpuset");

        write_files(
            &memory.join("abc"),
            &[
                ("memory.limit_in_bytes", "9223372036854771712\n"),
                ("memory.use_hierarchy", "1\n"),
                ("memory.stat", "cache 0\nhierarchical_memory_limit 536870912\n"),
                ("memory.usage_in_bytes", "4096\n"),
            ],
        );
        write_files(
            &cpu.join("abc"),
            &[
                ("cpu.cfs_quota_us", "150000\n"),
                ("cpu.cfs_period_us", "100000\n"),
                ("cpu.shares", "1024\n"),
                ("cpu.stat", "nr_periods 10\nnr_throttled 3\n"),
                ("cpuacct.usage", "123456\n"),
            ],
        );
        write_files(&cpuset.join("abc"), &[("cpuset.cpus", "0-5\n")]);

        let mountinfo = format!(
            "30 25 0:26 /docker {} rw shared:13 - cgroup cgroup rw,memory\n\
             31 25 0:27 / {} rw shared:14 - cgroup cgroup rw,cpu,cpuacct\n\
             32 25 0:28 / {} rw shared:15 - cgroup cgroup rw,cpuset\n\
             33 25 0:29 / /sys/fs/cgroup/unified rw shared:16 - cgroup2 cgroup2 rw\n",
            memory.display(),
            cpu.display(),
            cpuset.display()
        );
        let proc_cgroup = "12:memory:/docker/abc\n\
                           11:cpu,cpuacct:/abc\n\
                           10:cpuset:/abc\n\
                           1:name=systemd:/abc\n\
                           0::/abc\n";

        let metrics = CgroupMetrics::detect_from(&mountinfo, proc_cgroup).unwrap();
        assert_eq!(metrics.version(), CgroupVersion::V1);
        assert_eq!(metrics.memory_limit(), 536870912);
        assert_eq!(metrics.memory_usage(), 4096);
        assert_eq!(metrics.cpu_quota(), 150000);
        assert_eq!(metrics.cpu_period(), 100000);
        assert_eq!(metrics.cpu_shares(), LONG_RETVAL_UNLIMITED);
        assert_eq!(metrics.cpu_usage(), 123456);
        assert_eq!(metrics.cpu_throttled_count(), 3);
        assert_eq!(metrics.cpuset_cpus(), Some(vec![0, 1, 2, 3, 4, 5]));
        assert_eq!(metrics.effective_cpu_count(16), 2);
    }

    #[test]
    fn test_detect_nothing() {
        assert!(CgroupMetrics::detect_from("", "").is_none());
        let mountinfo = "22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw\n";
        assert!(CgroupMetrics::detect_from(mountinfo, "0::/\n").is_none());
    }

    #[test]
    fn test_v1_missing_controllers_are_unlimited() {
        let mountinfo = "30 25 0:26 / /nonexistent/memory rw - cgroup cgroup rw,memory\n";
        let metrics = CgroupMetrics::detect_from(mountinfo, "4:memory:/\n").unwrap();
        assert_eq!(metrics.memory_limit(), LONG_RETVAL_UNLIMITED);
        assert_eq!(metrics.cpu_quota(), LONG_RETVAL_UNLIMITED);
        assert_eq!(metrics.cpuset_cpus(), None);
        assert_eq!(metrics.effective_cpu_count(4), 4);
    }

    #[test]
    fn test_weight_to_shares() {
        assert_eq!(weight_to_shares(100), LONG_RETVAL_UNLIMITED);
        assert_eq!(weight_to_shares(0), LONG_RETVAL_UNLIMITED);
        assert_eq!(weight_to_shares(1), PER_CPU_SHARES);
        assert_eq!(weight_to_shares(39), PER_CPU_SHARES);
        assert_eq!(weight_to_shares(79), 2048);
        assert_eq!(weight_to_shares(10000), 262144);
        assert_eq!(weight_to_shares(10001), 262144);
    }

    #[test]
    fn test_v2_out_of_range_weight() {
        let (_dir, metrics) = v2_tree(&[("cpu.weight", "9223372036854775807
")]);
        assert_eq!(metrics.cpu_shares(), 262144);

        let (_dir, metrics) = v2_tree(&[("cpu.weight", "99999999999999999999
")]);
        assert_eq!(metrics.cpu_shares(), 262144);
    }

    #[test]
    fn test_available_processors_positive() {
        assert!(available_processors() >= 1);
        assert!(available_processors() <= host_processors());
    }
}
