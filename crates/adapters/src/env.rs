// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the adapters crate.

/// IaC engine binary (default: `terraform`).
pub fn engine_bin() -> String {
    std::env::var("OT_ENGINE_BIN")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "terraform".to_string())
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
