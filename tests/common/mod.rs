//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::path::PathBuf;

use assert_cmd::Command;

/// Command for the ozonewatch binary with config discovery isolated
pub fn ozonewatch_cmd() -> Command {
    let mut cmd = Command::cargo_bin("ozonewatch").unwrap();
    for (key, _) in std::env::vars() {
        if key.starts_with("OZONEWATCH_") {
            cmd.env_remove(key);
        }
    }
    cmd
}

/// Get the path to the test fixtures directory
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

/// Get the valid config fixture path
pub fn valid_config_fixture() -> PathBuf {
    fixtures_dir().join("valid_config.toml")
}

/// Get the invalid config fixture path
pub fn invalid_config_fixture() -> PathBuf {
    fixtures_dir().join("invalid_config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_exist() {
        assert!(valid_config_fixture().exists(), "Valid config fixture should exist");
        assert!(invalid_config_fixture().exists(), "Invalid config fixture should exist");
    }
}
