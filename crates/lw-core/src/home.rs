//! Home directory resolution for loopwatch
//!
//! # Precedence
//!
//! 1. `LW_HOME` environment variable (if set and non-empty)
//! 2. `dirs::home_dir()` platform default
//!
//! Tests and sandboxed deployments point `LW_HOME` at a temporary directory
//! so the global config lookup never touches the real home.

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Get the home directory used for global configuration.
///
/// # Errors
///
/// Returns an error if `LW_HOME` is unset and the platform home directory
/// cannot be determined.
pub fn get_home_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("LW_HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    dirs::home_dir().context("Could not determine home directory")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn with_lw_home<F: FnOnce()>(value: Option<&str>, f: F) {
        let original = env::var("LW_HOME").ok();
        unsafe {
            match value {
                Some(v) => env::set_var("LW_HOME", v),
                None => env::remove_var("LW_HOME"),
            }
        }
        f();
        unsafe {
            match original {
                Some(v) => env::set_var("LW_HOME", v),
                None => env::remove_var("LW_HOME"),
            }
        }
    }

    #[test]
    #[serial]
    fn lw_home_wins() {
        with_lw_home(Some("/custom/home"), || {
            assert_eq!(get_home_dir().unwrap(), PathBuf::from("/custom/home"));
        });
    }

    #[test]
    #[serial]
    fn lw_home_is_trimmed() {
        with_lw_home(Some("  /custom/home  "), || {
            assert_eq!(get_home_dir().unwrap(), PathBuf::from("/custom/home"));
        });
    }

    #[test]
    #[serial]
    fn blank_lw_home_falls_back_to_platform() {
        with_lw_home(Some("   "), || {
            assert_eq!(get_home_dir().unwrap(), dirs::home_dir().unwrap());
        });
    }

    #[test]
    #[serial]
    fn unset_lw_home_uses_platform_default() {
        with_lw_home(None, || {
            assert_eq!(get_home_dir().unwrap(), dirs::home_dir().unwrap());
        });
    }
}
