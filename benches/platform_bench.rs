use alice_platform::cgroup::{convert_to_long, parse_range_list};
use alice_platform::cgroup_v1::CgroupV1SubsystemController;
use alice_platform::metrics::CgroupMetrics;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_parse_range_list(c: &mut Criterion) {
    c.bench_function("parse_range_list_short", |b| {
        b.iter(|| parse_range_list(black_box("0-3,8,10-11")))
    });

    c.bench_function("parse_range_list_wide", |b| {
        b.iter(|| parse_range_list(black_box("0-63,128-191")))
    });
}

fn bench_convert_to_long(c: &mut Criterion) {
    c.bench_function("convert_to_long_value", |b| {
        b.iter(|| convert_to_long(black_box("268435456"), i64::MAX, -1))
    });

    c.bench_function("convert_to_long_overflow", |b| {
        b.iter(|| convert_to_long(black_box("18446744073709551615"), i64::MAX, -1))
    });
}

fn bench_v1_set_path(c: &mut Criterion) {
    c.bench_function("cgroup_v1_set_path", |b| {
        b.iter(|| {
            let mut ctrl = CgroupV1SubsystemController::new("/user.slice", "/sys/fs/cgroup/memory");
            ctrl.set_path(black_box("/user.slice/session-1.scope"));
            ctrl
        })
    });
}

fn bench_detect_from(c: &mut Criterion) {
    let mountinfo = "35 25 0:30 / /sys/fs/cgroup rw,nosuid shared:9 - cgroup2 cgroup2 rw\n\
                     22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw\n";
    c.bench_function("cgroup_detect_v2", |b| {
        b.iter(|| CgroupMetrics::detect_from(black_box(mountinfo), black_box("0::/app.slice\n")))
    });
}

#[cfg(target_os = "linux")]
fn bench_select_now(c: &mut Criterion) {
    use alice_platform::selection_key::OP_READ;
    use alice_platform::selector::EPollSelector;
    use std::os::unix::io::RawFd;

    let selector = match EPollSelector::open() {
        Ok(selector) => selector,
        Err(_) => return,
    };

    let mut pipes: Vec<(RawFd, RawFd)> = Vec::new();
    for _ in 0..64 {
        let mut fds = [0; 2];
        // SAFETY: fds is a valid two-element array
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            break;
        }
        if selector.register(fds[0], OP_READ).is_ok() {
            pipes.push((fds[0], fds[1]));
        }
    }

    c.bench_function("select_now_64_idle", |b| {
        b.iter(|| black_box(selector.select_now()))
    });

    c.bench_function("wakeup_then_select_now", |b| {
        b.iter(|| {
            let _ = selector.wakeup();
            black_box(selector.select_now())
        })
    });

    let _ = selector.close();
    for (r, w) in pipes {
        // SAFETY: both ends were opened above and are closed once
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn bench_select_now(_c: &mut Criterion) {}

criterion_group!(
    benches,
    bench_parse_range_list,
    bench_convert_to_long,
    bench_v1_set_path,
    bench_detect_from,
    bench_select_now,
);
criterion_main!(benches);
