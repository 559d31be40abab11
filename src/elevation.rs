//! Privilege elevation for enforcement commands
//!
//! zonefw may run as an unprivileged user and only elevates the two programs
//! that touch kernel state:
//!
//! - **nft**: packet-filter table, chains, rules and sets
//! - **tc**: traffic-control qdiscs, classes and filters
//!
//! # Elevation Strategy
//!
//! - Running as root: no elevation
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `ZONEFW_ELEVATION_METHOD`: force `sudo`, `run0` or `pkexec`. Useful for
//!   service units with sudoers NOPASSWD rules.
//! - `ZONEFW_TEST_NO_ELEVATION`: bypass elevation entirely (testing only).
//!
//! # Security
//!
//! - Only [`Program::Nft`] and [`Program::Tc`] can be elevated
//! - Arguments are passed as a vector, never through a shell
//!
//! # Example
//!
//! ```no_run
//! use zonefw::core::directive::Program;
//! use zonefw::elevation::create_elevated_command;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let args = vec!["list".to_string(), "tables".to_string()];
//! let mut cmd = create_elevated_command(Program::Nft, "nft", &args)?;
//! let output = cmd.output().await?;
//! # Ok(())
//! # }
//! ```

use crate::core::directive::Program;
use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `ZONEFW_ELEVATION_METHOD`
    #[error("Invalid ZONEFW_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                full_path.is_file().then_some(full_path)
            })
        })
        .is_some()
}

fn wrapped(wrapper: &str, binary: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(wrapper);
    cmd.arg(binary).args(args);
    cmd
}

fn direct(binary: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(binary);
    cmd.args(args);
    cmd
}

/// Builds a command running `binary` (the configured path of `program`)
/// with root privileges.
///
/// # Errors
///
/// Returns `Err` when the forced or detected elevation wrapper is missing.
pub fn create_elevated_command(
    program: Program,
    binary: &str,
    args: &[String],
) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    tracing::trace!(%program, binary, "building command");

    if std::env::var("ZONEFW_TEST_NO_ELEVATION").is_ok() || nix::unistd::getuid().is_root() {
        return Ok(direct(binary, args));
    }

    if let Ok(method) = std::env::var("ZONEFW_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if !binary_exists(&method) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    Ok(wrapped(&method, binary, args))
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    if binary_exists("run0") {
        return Ok(wrapped("run0", binary, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(wrapped("sudo", binary, args))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(wrapped("pkexec", binary, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    #[test]
    fn test_binary_exists() {
        assert!(binary_exists("sh"));
        assert!(!binary_exists("zonefw_nonexistent_binary_xyz"));
    }

    #[test]
    fn test_test_mode_runs_binary_directly() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var("ZONEFW_TEST_NO_ELEVATION", "1");
        }

        let cmd = create_elevated_command(Program::Tc, "tc", &["-V".to_string()]).unwrap();
        assert_eq!(cmd.as_std().get_program(), "tc");
    }

    #[test]
    fn test_invalid_elevation_method() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        if nix::unistd::getuid().is_root() {
            return;
        }
        unsafe {
            std::env::remove_var("ZONEFW_TEST_NO_ELEVATION");
            std::env::set_var("ZONEFW_ELEVATION_METHOD", "doas");
        }

        let result = create_elevated_command(Program::Nft, "nft", &[]);

        unsafe {
            std::env::set_var("ZONEFW_TEST_NO_ELEVATION", "1");
            std::env::remove_var("ZONEFW_ELEVATION_METHOD");
        }

        assert!(matches!(result, Err(ElevationError::InvalidMethod(_))));
    }

    #[test]
    fn test_elevation_method_case_insensitive() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::remove_var("ZONEFW_TEST_NO_ELEVATION");
            std::env::set_var("ZONEFW_ELEVATION_METHOD", "SUDO");
        }

        let result = create_elevated_command(Program::Nft, "nft", &[]);

        unsafe {
            std::env::set_var("ZONEFW_TEST_NO_ELEVATION", "1");
            std::env::remove_var("ZONEFW_ELEVATION_METHOD");
        }

        assert!(!matches!(result, Err(ElevationError::InvalidMethod(_))));
    }
}
