//! Static capability table mapping a host to its python-build-standalone target.

use std::env;
use std::path::{Path, PathBuf};

use crate::ProvisionError;

/// Target triple and path conventions for one operating system and CPU architecture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
    pub triple: &'static str,
    /// Interpreter location relative to an extracted runtime root.
    pub runtime_python: &'static str,
    /// Directory holding executables inside a virtual environment.
    pub venv_bin_dir: &'static str,
    /// Interpreter name inside [`Platform::venv_bin_dir`].
    pub venv_python: &'static str,
    pub exe_suffix: &'static str,
}

const fn unix(os: &'static str, arch: &'static str, triple: &'static str) -> Platform {
    Platform {
        os,
        arch,
        triple,
        runtime_python: "bin/python3",
        venv_bin_dir: "bin",
        venv_python: "python",
        exe_suffix: "",
    }
}

const fn windows(arch: &'static str, triple: &'static str) -> Platform {
    Platform {
        os: "windows",
        arch,
        triple,
        runtime_python: "python.exe",
        venv_bin_dir: "Scripts",
        venv_python: "python.exe",
        exe_suffix: ".exe",
    }
}

pub const PLATFORMS: &[Platform] = &[
    unix("macos", "x86_64", "x86_64-apple-darwin"),
    unix("macos", "aarch64", "aarch64-apple-darwin"),
    windows("x86_64", "x86_64-pc-windows-msvc-shared"),
    windows("x86", "i686-pc-windows-msvc-shared"),
    unix("linux", "x86_64", "x86_64-unknown-linux-gnu"),
    unix("linux", "x86", "i686-unknown-linux-gnu"),
    unix("linux", "aarch64", "aarch64-unknown-linux-gnu"),
];

impl Platform {
    /// Look up the table entry for an OS/architecture pair (`std::env::consts` spelling).
    pub fn lookup(os: &str, arch: &str) -> Result<&'static Platform, ProvisionError> {
        PLATFORMS
            .iter()
            .find(|platform| platform.os == os && platform.arch == arch)
            .ok_or_else(|| ProvisionError::UnsupportedPlatform {
                os: os.to_string(),
                arch: arch.to_string(),
            })
    }

    pub fn current() -> Result<&'static Platform, ProvisionError> {
        Self::lookup(env::consts::OS, env::consts::ARCH)
    }

    #[must_use]
    pub fn runtime_python_path(&self, install_root: &Path) -> PathBuf {
        install_root.join(self.runtime_python)
    }

    #[must_use]
    pub fn venv_bin_path(&self, env_root: &Path) -> PathBuf {
        env_root.join(self.venv_bin_dir)
    }

    #[must_use]
    pub fn venv_python_path(&self, env_root: &Path) -> PathBuf {
        self.venv_bin_path(env_root).join(self.venv_python)
    }

    #[must_use]
    pub fn executable_name(&self, program: &str) -> String {
        if self.exe_suffix.is_empty() || program.ends_with(self.exe_suffix) {
            program.to_string()
        } else {
            format!("{program}{}", self.exe_suffix)
        }
    }
}
