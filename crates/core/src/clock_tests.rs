// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn fake_clock_advance_moves_instant_and_epoch() {
    let clock = FakeClock::new();
    let start = clock.now();
    clock.advance(Duration::from_secs(3));
    assert_eq!(clock.now() - start, Duration::from_secs(3));
    assert_eq!(clock.epoch_ms(), FakeClock::START_EPOCH_MS + 3_000);
}

#[test]
fn fake_clock_clones_share_time() {
    let clock = FakeClock::new();
    let other = clock.clone();
    other.set_epoch_ms(42);
    assert_eq!(clock.epoch_ms(), 42);
}

#[test]
fn system_clock_epoch_is_recent() {
    // 2020-01-01 in epoch ms
    assert!(SystemClock.epoch_ms() > 1_577_836_800_000);
}
