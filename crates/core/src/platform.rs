//! Capability selection: which polling and threading model a build target uses.
//!
//! The target's tag is fixed at compile time from `target_os` and the
//! `hidraw` cargo feature. Mapping a tag to its [`PlatformProfile`] is a pure
//! `const` function, so the selection for every target can be tested on any
//! host.

use crate::error::{Error, Result};
use serde::Serialize;
use std::str::FromStr;

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
compile_error!(
    "unsupported target platform: hidport has no polling/threading backend pair for this target_os"
);

/// How a backend learns that a device has data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollModel {
    /// The OS reports that a descriptor is readable; the caller then reads.
    Readiness,
    /// The OS performs the read and signals when it has finished.
    Completion,
}

/// Which family of synchronisation primitives a backend uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadModel {
    /// Portable lock/condition primitives.
    Posix,
    /// The host OS's own lock/condition objects.
    Native,
}

/// A supported build target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformTag {
    /// Linux using the generic (libusb-style) driver path.
    LinuxLibusb,
    /// Linux with the raw-driver (`hidraw`) variant selected.
    LinuxHidraw,
    Darwin,
    Windows,
}

impl PlatformTag {
    /// All supported tags.
    pub const ALL: &'static [PlatformTag] = &[
        PlatformTag::LinuxLibusb,
        PlatformTag::LinuxHidraw,
        PlatformTag::Darwin,
        PlatformTag::Windows,
    ];

    /// The tag of the target this crate was compiled for.
    pub const fn current() -> Self {
        #[cfg(all(target_os = "linux", feature = "hidraw"))]
        {
            PlatformTag::LinuxHidraw
        }
        #[cfg(all(target_os = "linux", not(feature = "hidraw")))]
        {
            PlatformTag::LinuxLibusb
        }
        #[cfg(target_os = "macos")]
        {
            PlatformTag::Darwin
        }
        #[cfg(target_os = "windows")]
        {
            PlatformTag::Windows
        }
    }

    /// Resolve a tag from an OS name and the raw-driver flag.
    ///
    /// The raw-driver flag only selects a variant on Linux and is ignored
    /// elsewhere.
    pub fn from_target(os: &str, raw_driver: bool) -> Result<Self> {
        match os.to_lowercase().as_str() {
            "linux" if raw_driver => Ok(PlatformTag::LinuxHidraw),
            "linux" => Ok(PlatformTag::LinuxLibusb),
            "darwin" | "macos" => Ok(PlatformTag::Darwin),
            "windows" => Ok(PlatformTag::Windows),
            other => Err(Error::Configuration(format!(
                "unrecognized platform '{other}'"
            ))),
        }
    }

    /// Stable name, also accepted by [`FromStr`].
    pub fn name(&self) -> &'static str {
        match self {
            Self::LinuxLibusb => "linux",
            Self::LinuxHidraw => "linux-hidraw",
            Self::Darwin => "darwin",
            Self::Windows => "windows",
        }
    }
}

impl FromStr for PlatformTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "linux-hidraw" | "hidraw" => Ok(PlatformTag::LinuxHidraw),
            "linux-libusb" | "libusb" => Ok(PlatformTag::LinuxLibusb),
            other => PlatformTag::from_target(other, false),
        }
    }
}

impl std::fmt::Display for PlatformTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The backend choices for one build target.
///
/// The empty profile (no poll model, no thread model) marks a target whose
/// driver supplies its own polling and threading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PlatformProfile {
    poll_model: Option<PollModel>,
    thread_model: Option<ThreadModel>,
    has_monotonic_clock: bool,
}

static CURRENT: PlatformProfile = PlatformProfile::resolve(PlatformTag::current());

impl PlatformProfile {
    /// Profile of a target whose driver brings its own polling and threading.
    pub const EMPTY: PlatformProfile = PlatformProfile {
        poll_model: None,
        thread_model: None,
        has_monotonic_clock: false,
    };

    /// Map a tag to its profile.
    pub const fn resolve(tag: PlatformTag) -> Self {
        match tag {
            PlatformTag::LinuxLibusb => PlatformProfile {
                poll_model: Some(PollModel::Readiness),
                thread_model: Some(ThreadModel::Posix),
                has_monotonic_clock: true,
            },
            PlatformTag::LinuxHidraw => Self::EMPTY,
            PlatformTag::Darwin => PlatformProfile {
                poll_model: Some(PollModel::Readiness),
                thread_model: Some(ThreadModel::Posix),
                has_monotonic_clock: false,
            },
            PlatformTag::Windows => PlatformProfile {
                poll_model: Some(PollModel::Completion),
                thread_model: Some(ThreadModel::Native),
                has_monotonic_clock: false,
            },
        }
    }

    /// The process-wide profile of the compiled target.
    pub fn current() -> &'static PlatformProfile {
        &CURRENT
    }

    pub fn poll_model(&self) -> Option<PollModel> {
        self.poll_model
    }

    pub fn thread_model(&self) -> Option<ThreadModel> {
        self.thread_model
    }

    /// Whether the target guarantees a monotonic clock primitive.
    ///
    /// Informational: `std::time::Instant` is monotonic on every supported
    /// target, so timed waits do not change behaviour on this flag.
    pub fn has_monotonic_clock(&self) -> bool {
        self.has_monotonic_clock
    }

    /// True for the empty profile.
    pub fn is_self_contained(&self) -> bool {
        self.poll_model.is_none() && self.thread_model.is_none()
    }
}
