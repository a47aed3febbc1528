use crate::pmu::{attr_struct_size, scale_reading, PmuReading};
use crate::{monotonic_ns, read_process_name};

#[test]
fn attr_matches_ver1_size_boundary() {
    // PERF_ATTR_SIZE_VER1: the kernel validates the size field against the
    // known historical boundaries.
    assert_eq!(attr_struct_size(), 72);
}

#[test]
fn scaling_zero_running_time_reads_zero() {
    assert_eq!(scale_reading(123_456, 1_000_000, 0), 0);
}

#[test]
fn scaling_full_schedule_passes_through() {
    assert_eq!(scale_reading(42, 1_000, 1_000), 42);
    assert_eq!(scale_reading(42, 1_000, 2_000), 42);
}

#[test]
fn scaling_multiplexed_counter_scales_up() {
    // Counter ran half the window: estimate doubles.
    assert_eq!(scale_reading(500, 1_000, 500), 1_000);
    // Quarter of the window.
    assert_eq!(scale_reading(100, 4_000, 1_000), 400);
}

#[test]
fn scaling_large_counts_do_not_overflow() {
    let value = u64::MAX / 2;
    let scaled = scale_reading(value, 3, 2);
    assert!(scaled > value);
}

#[test]
fn reading_delta_is_per_slot() {
    let prev = PmuReading {
        cycles: 100,
        instructions: 50,
        cache_misses: 10,
        branch_misses: 5,
        branch_instructions: 40,
        cache_references: 30,
    };
    let cur = PmuReading {
        cycles: 300,
        instructions: 170,
        cache_misses: 12,
        branch_misses: 9,
        branch_instructions: 90,
        cache_references: 61,
    };
    let delta = cur.delta_since(&prev);
    assert_eq!(delta.cycles, 200);
    assert_eq!(delta.instructions, 120);
    assert_eq!(delta.cache_misses, 2);
    assert_eq!(delta.branch_misses, 4);
    assert_eq!(delta.branch_instructions, 50);
    assert_eq!(delta.cache_references, 31);
}

#[test]
fn monotonic_clock_never_goes_backwards() {
    let mut last = monotonic_ns();
    assert!(last > 0);
    for _ in 0..1_000 {
        let now = monotonic_ns();
        assert!(now >= last);
        last = now;
    }
}

#[test]
fn own_process_name_resolves() {
    let name = read_process_name(std::process::id() as i32);
    assert!(name.is_some());
    let name = name.unwrap();
    assert!(!name.is_empty());
    assert!(!name.ends_with('\n'));
}

#[test]
fn invalid_pid_has_no_name() {
    assert_eq!(read_process_name(-1), None);
    assert_eq!(read_process_name(0), None);
}
