// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serial_test::serial;

fn clear() {
    for key in [
        "OT_STATE_DIR",
        "XDG_STATE_HOME",
        "OT_GRACE_PERIOD_MS",
        "OT_BUILTIN_RUNNER",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
#[serial]
fn state_dir_prefers_explicit_override() {
    clear();
    std::env::set_var("XDG_STATE_HOME", "/xdg");
    std::env::set_var("OT_STATE_DIR", "/srv/ot");
    assert_eq!(state_dir().unwrap(), PathBuf::from("/srv/ot"));
    clear();
}

#[test]
#[serial]
fn state_dir_falls_back_to_xdg_then_home() {
    clear();
    std::env::set_var("XDG_STATE_HOME", "/xdg");
    assert_eq!(state_dir().unwrap(), PathBuf::from("/xdg/ot"));

    std::env::remove_var("XDG_STATE_HOME");
    let home = std::env::var("HOME").unwrap();
    assert_eq!(
        state_dir().unwrap(),
        PathBuf::from(home).join(".local/state/ot")
    );
}

#[test]
#[serial]
fn blank_override_is_ignored() {
    clear();
    std::env::set_var("OT_STATE_DIR", "  ");
    std::env::set_var("XDG_STATE_HOME", "/xdg");
    assert_eq!(state_dir().unwrap(), PathBuf::from("/xdg/ot"));
    clear();
}

#[test]
#[serial]
fn durations_parse_or_are_ignored() {
    clear();
    std::env::set_var("OT_GRACE_PERIOD_MS", "2500");
    assert_eq!(grace_period(), Some(Duration::from_millis(2500)));
    std::env::set_var("OT_GRACE_PERIOD_MS", "soon");
    assert_eq!(grace_period(), None);
    clear();
}

#[yare::parameterized(
    one   = { "1", Some(true) },
    yes   = { "YES", Some(true) },
    zero  = { "0", Some(false) },
    false_ = { "false", Some(false) },
    junk  = { "maybe", None },
)]
#[serial]
fn builtin_runner_flag(value: &str, expected: Option<bool>) {
    clear();
    std::env::set_var("OT_BUILTIN_RUNNER", value);
    assert_eq!(builtin_runner(), expected);
    clear();
}
