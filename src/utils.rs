//! Directory helpers following the XDG Base Directory specification
//!
//! - Config: `~/.config/zonefw/` - engine configuration
//! - Data: `~/.local/share/zonefw/` - policy file
//! - State: `~/.local/state/zonefw/` - directive log, status file, tracing log
//!
//! # Example
//!
//! ```
//! use zonefw::utils::{ensure_dirs, get_state_dir};
//!
//! ensure_dirs().expect("Failed to create directories");
//! if let Some(state) = get_state_dir() {
//!     let _log = state.join("directives.log");
//! }
//! ```

use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "zonefw", "zonefw")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_data_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    use std::fs::DirBuilder;
    #[cfg(unix)]
    use std::os::unix::fs::DirBuilderExt;

    let mut builder = DirBuilder::new();
    #[cfg(unix)]
    builder.mode(0o700);
    builder.recursive(true);

    for dir in [get_config_dir(), get_data_dir(), get_state_dir()]
        .into_iter()
        .flatten()
    {
        builder.create(dir)?;
    }
    Ok(())
}

/// Network interfaces present on this host, excluding loopback
pub fn list_interfaces() -> Vec<String> {
    let mut interfaces = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
        for entry in entries.flatten() {
            if let Ok(name) = entry.file_name().into_string()
                && name != "lo"
            {
                interfaces.push(name);
            }
        }
    }
    interfaces.sort();
    interfaces
}
