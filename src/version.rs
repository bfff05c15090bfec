//! Build information for `ozonewatch version`
//!
//! The git and target values come from `build.rs`.

use std::fmt;

/// What `ozonewatch version` reports about this binary
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub git_hash: &'static str,
    /// "true", "false" or "unknown"
    git_dirty: &'static str,
    pub built_at: &'static str,
    pub target: &'static str,
    pub profile: &'static str,
}

const BUILD: BuildInfo = BuildInfo {
    name: env!("CARGO_PKG_NAME"),
    version: env!("CARGO_PKG_VERSION"),
    git_hash: env!("OZONEWATCH_GIT_HASH"),
    git_dirty: env!("OZONEWATCH_GIT_DIRTY"),
    built_at: env!("OZONEWATCH_BUILD_TIMESTAMP"),
    target: env!("OZONEWATCH_TARGET"),
    profile: env!("OZONEWATCH_PROFILE"),
};

impl BuildInfo {
    /// `0.1.0-abc1234`, with `-dirty` appended for uncommitted builds
    pub fn full_version(&self) -> String {
        let suffix = if self.git_dirty == "true" { "-dirty" } else { "" };
        format!("{}-{}{}", self.version, self.git_hash, suffix)
    }

    /// `ozonewatch 0.1.0 (abc1234)`
    pub fn short_version(&self) -> String {
        format!("{} {} ({})", self.name, self.version, self.git_hash)
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "Build Information:")?;
        for (label, value) in [
            ("Git Hash", self.git_hash),
            ("Built", self.built_at),
            ("Profile", self.profile),
            ("Target", self.target),
        ] {
            writeln!(f, "  {:<10}{}", format!("{}:", label), value)?;
        }
        Ok(())
    }
}

pub fn build_info() -> BuildInfo {
    BUILD
}
