//! Build script for ozonewatch
//!
//! Embeds the git revision and build details that `ozonewatch version`
//! prints.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = command_output("git", &["rev-parse", "--short=8", "HEAD"]);
    let git_dirty = match Command::new("git").args(["status", "--porcelain"]).output() {
        Ok(out) if out.status.success() => (!out.stdout.is_empty()).to_string(),
        _ => "unknown".to_string(),
    };

    let build_timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());

    for (key, value) in [
        ("GIT_HASH", &git_hash),
        ("GIT_DIRTY", &git_dirty),
        ("BUILD_TIMESTAMP", &build_timestamp),
        ("TARGET", &target),
        ("PROFILE", &profile),
    ] {
        println!("cargo:rustc-env=OZONEWATCH_{}={}", key, value);
    }
}

/// Trimmed stdout of a successful command, or "unknown"
fn command_output(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
