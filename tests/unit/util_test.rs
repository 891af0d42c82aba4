//! Tests for utility functions

use prometheus_task_engine::util::{Clock, IdGenerator, ManualClock, Priority, SequentialIds, TaskId};
use std::time::Duration;

#[test]
fn test_priority_ordering() {
    assert!(Priority::Critical > Priority::High);
    assert!(Priority::High > Priority::Normal);
    assert!(Priority::Normal > Priority::Low);
}

#[test]
fn test_priority_boost_saturates() {
    assert_eq!(Priority::Low.boosted(), Priority::Normal);
    assert_eq!(Priority::High.boosted(), Priority::Critical);
    assert_eq!(Priority::Critical.boosted(), Priority::Critical);
}

#[test]
fn test_sequential_ids() {
    let ids = SequentialIds::starting_at(100);
    let a: TaskId = ids.next_id();
    let b: TaskId = ids.next_id();
    assert_eq!(a, 100);
    assert_eq!(b, 101);
}

#[test]
fn test_manual_clock_only_moves_when_advanced() {
    let clock = ManualClock::new();
    let t0 = clock.now_ms();
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(clock.now_ms(), t0);
    clock.advance(Duration::from_secs(2));
    assert_eq!(clock.now_ms(), t0 + 2000);
}
