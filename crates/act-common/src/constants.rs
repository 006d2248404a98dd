// Well-known names, paths and environment variables shared by the runner crates.

use std::fmt;

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// CPU architecture reported to steps through `RUNNER_ARCH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86,
    X64,
    Arm,
    Arm64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86 => write!(f, "X86"),
            Architecture::X64 => write!(f, "X64"),
            Architecture::Arm => write!(f, "ARM"),
            Architecture::Arm64 => write!(f, "ARM64"),
        }
    }
}

impl Architecture {
    /// Map a docker-style platform string (`linux/arm64`, `linux/amd64`) to an architecture.
    /// Unknown or empty values fall back to the architecture of this build.
    pub fn from_platform(platform: &str) -> Self {
        let arch = platform
            .split_once('/')
            .map(|(_, arch)| arch)
            .unwrap_or(platform);
        match arch {
            "amd64" | "x86_64" => Architecture::X64,
            "386" | "i386" => Architecture::X86,
            "arm" | "arm/v6" | "arm/v7" | "armv7" => Architecture::Arm,
            "arm64" | "aarch64" => Architecture::Arm64,
            _ => CURRENT_ARCHITECTURE,
        }
    }
}

/// The architecture of this build, detected at compile time.
#[cfg(target_arch = "x86")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::X86;
#[cfg(target_arch = "x86_64")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::X64;
#[cfg(target_arch = "arm")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::Arm;
#[cfg(target_arch = "aarch64")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::Arm64;
#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "arm",
    target_arch = "aarch64"
)))]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::X64;

// ---------------------------------------------------------------------------
// Runner identity
// ---------------------------------------------------------------------------

/// Platform image value that selects the host environment instead of a container.
/// Compared case-insensitively.
pub const SELF_HOSTED_IMAGE: &str = "-self-hosted";

/// Default actor when none is configured.
pub const DEFAULT_ACTOR: &str = "nektos/act";

/// Trigger name used when a job calls a reusable workflow.
pub const WORKFLOW_CALL_EVENT: &str = "workflow_call";

/// Maximum depth of nested composite actions.
pub const COMPOSITE_ACTIONS_MAX_DEPTH: usize = 9;

/// Default lifetime of an idle job container (`/bin/sleep <secs>`).
pub const DEFAULT_CONTAINER_MAX_LIFETIME_SECS: u64 = 3 * 60 * 60;

// ---------------------------------------------------------------------------
// Container layout
// ---------------------------------------------------------------------------

pub mod container {
    /// Path the daemon socket is bound to inside job containers.
    pub const DOCKER_SOCKET_PATH: &str = "/var/run/docker.sock";

    /// Config value that disables mounting the daemon socket.
    pub const NO_DOCKER_SOCKET: &str = "-";

    /// State directory inside Linux containers.
    pub const ACT_PATH: &str = "/var/run/act";

    /// Shared named volume holding tool caches.
    pub const TOOLCACHE_VOLUME: &str = "act-toolcache";
    pub const TOOLCACHE_PATH: &str = "/toolcache";

    /// Shared named volume holding fetched actions for service containers.
    pub const ACTIONS_VOLUME: &str = "act-actions";
    pub const ACTIONS_PATH: &str = "/actions";

    pub const DEFAULT_PATH: &str =
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

    pub const HOSTED_TOOL_CACHE: &str = "/opt/hostedtoolcache";
    pub const RUNNER_TEMP: &str = "/tmp";
}

// ---------------------------------------------------------------------------
// State files
// ---------------------------------------------------------------------------

/// Files under the environment's state directory.
pub mod state_files {
    pub const EVENT_JSON: &str = "workflow/event.json";
    pub const ENV: &str = "workflow/envs.txt";
    pub const PATH: &str = "workflow/pathcmd.txt";
    pub const OUTPUT: &str = "workflow/outputcmd.txt";
    pub const STATE: &str = "workflow/statecmd.txt";
    pub const STEP_SUMMARY: &str = "workflow/SUMMARY.md";
}

// ---------------------------------------------------------------------------
// Environment variables
// ---------------------------------------------------------------------------

pub mod variables {
    pub const ACT: &str = "ACT";
    pub const CI: &str = "CI";
    pub const PATH: &str = "PATH";
    pub const XDG_CACHE_HOME: &str = "XDG_CACHE_HOME";

    pub const GITHUB_ENV: &str = "GITHUB_ENV";
    pub const GITHUB_PATH: &str = "GITHUB_PATH";
    pub const GITHUB_OUTPUT: &str = "GITHUB_OUTPUT";
    pub const GITHUB_STATE: &str = "GITHUB_STATE";
    pub const GITHUB_STEP_SUMMARY: &str = "GITHUB_STEP_SUMMARY";

    pub const ACTIONS_RUNTIME_URL: &str = "ACTIONS_RUNTIME_URL";
    pub const ACTIONS_RUNTIME_TOKEN: &str = "ACTIONS_RUNTIME_TOKEN";

    pub const DOCKER_USERNAME_SECRET: &str = "DOCKER_USERNAME";
    pub const DOCKER_PASSWORD_SECRET: &str = "DOCKER_PASSWORD";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_from_platform() {
        assert_eq!(Architecture::from_platform("linux/amd64"), Architecture::X64);
        assert_eq!(Architecture::from_platform("linux/arm64"), Architecture::Arm64);
        assert_eq!(Architecture::from_platform(""), CURRENT_ARCHITECTURE);
    }

    #[test]
    fn test_architecture_display() {
        assert_eq!(Architecture::X64.to_string(), "X64");
        assert_eq!(Architecture::Arm64.to_string(), "ARM64");
    }
}
