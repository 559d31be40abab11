//! Script export and live-table diffing
//!
//! `export` writes the compiled policy as an `nft -f` script followed by a
//! `tc -batch` section. `diff` compares the desired managed-table listing
//! with `nft list table` output, after dropping the engine-owned base chains
//! and the declaration lines nft adds to sets and chains. `restore` loads an
//! exported script back through the engine.

use crate::core::compiler::Compilation;
use crate::core::directive::{render_nft_script, render_tc_batch};
use crate::core::engine::{CommandRunner, Engine};
use crate::core::error::{Error, Result};
use std::fmt::Write as _;
use std::path::Path;

/// Header of the commented tc section in an exported script
const TC_MARKER: &str = "# tc -batch";

/// Chains created with the namespace rather than compiled
const BASE_CHAINS: [&str; 2] = ["input", "forward"];

/// Full export text: the nft script, then the tc batch as a commented section
pub fn render_script(table: &str, compilation: &Compilation) -> String {
    let mut out = render_nft_script(table, &compilation.directives);
    let tc = render_tc_batch(&compilation.directives);
    if !tc.is_empty() {
        let _ = writeln!(out, "\n{TC_MARKER}");
        for line in tc.lines() {
            let _ = writeln!(out, "# {line}");
        }
    }
    out
}

/// Writes `text` to `path` through a 0600 temp file in the same directory
pub fn save_script(path: &Path, text: &str) -> Result<()> {
    use std::io::Write;
    use tempfile::NamedTempFile;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    temp.write_all(text.as_bytes())?;
    temp.flush()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// The tc batch embedded in an exported script, uncommented
pub fn tc_section(script: &str) -> Option<String> {
    let (_, tail) = script.split_once(TC_MARKER)?;
    let mut batch = String::new();
    for line in tail.lines() {
        if let Some(command) = line.strip_prefix("# ") {
            batch.push_str(command);
            batch.push('\n');
        }
    }
    (!batch.is_empty()).then_some(batch)
}

/// Applies a script written by `save_script`
///
/// nft reads the whole file and skips the commented tc section; that section
/// goes to `tc -batch` through a temp file.
pub async fn restore<R: CommandRunner>(engine: &Engine<R>, path: &Path) -> Result<()> {
    let script = std::fs::read_to_string(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("{}: {e}", path.display()),
        ))
    })?;

    let batch = match tc_section(&script) {
        Some(text) => {
            use std::io::Write;
            let mut temp = tempfile::NamedTempFile::new()?;
            temp.write_all(text.as_bytes())?;
            temp.flush()?;
            Some(temp)
        }
        None => None,
    };

    engine.restore(path, batch.as_ref().map(|t| t.path())).await
}

/// Reduces `nft list table` output to what the compiler produces
pub fn managed_listing(live: &str) -> String {
    let mut out = String::new();
    let mut skipping = false;
    for line in live.lines() {
        let trimmed = line.trim();
        if let Some(name) = trimmed
            .strip_prefix("chain ")
            .and_then(|rest| rest.strip_suffix(" {"))
        {
            skipping = BASE_CHAINS.contains(&name);
        }
        if skipping {
            if trimmed == "}" {
                skipping = false;
            }
            continue;
        }
        if trimmed.is_empty()
            || ["type ", "typeof ", "flags ", "policy "]
                .iter()
                .any(|p| trimmed.starts_with(p))
        {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Line diff of `current` against `desired`, or `None` when they match
pub fn unified_diff(current: &str, desired: &str) -> Option<String> {
    let diff = similar::TextDiff::from_lines(current, desired);
    if diff.ratio() >= 1.0 {
        return None;
    }
    let mut result = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => "- ",
            similar::ChangeTag::Insert => "+ ",
            similar::ChangeTag::Equal => "  ",
        };
        let _ = write!(result, "{sign}{change}");
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compiler::{PriorityOrder, compile};
    use crate::core::model::PolicySnapshot;
    use crate::core::test_helpers::{qos_class, qos_config, rule, zone};

    fn snapshot() -> PolicySnapshot {
        let mut s = PolicySnapshot::default();
        s.zones.push(zone(1, "lan", 0, &["eth1"]));
        s.rules.push(rule(2, "lan", 0, "tcp", "22"));
        s.qos_configs.push(qos_config(3, "eth0", 10_000, "bulk"));
        s.qos_classes.push(qos_class(4, 3, "bulk", 7, 10, 100));
        s
    }

    #[test]
    fn test_script_has_nft_and_commented_tc_sections() {
        let compilation = compile(&snapshot(), PriorityOrder::Ascending);
        let script = render_script("zonefw", &compilation);
        assert!(script.starts_with("#!/usr/sbin/nft -f"));
        assert!(script.contains("add table inet zonefw"));
        assert!(script.contains("zonefw:rule:2"));
        assert!(script.contains("# tc -batch"));
        assert!(script.contains("# qdisc del dev eth0 root"));
    }

    #[test]
    fn test_tc_section_uncomments_batch() {
        let compilation = compile(&snapshot(), PriorityOrder::Ascending);
        let script = render_script("zonefw", &compilation);
        let batch = tc_section(&script).unwrap();
        assert!(batch.starts_with("qdisc del dev eth0 root\n"));
        assert!(batch.lines().all(|l| !l.starts_with('#')));
        assert!(!batch.contains("zonefw:rule:2"));

        let mut s = snapshot();
        s.qos_configs.clear();
        s.qos_classes.clear();
        let script = render_script("zonefw", &compile(&s, PriorityOrder::Ascending));
        assert!(tc_section(&script).is_none());
    }

    #[test]
    fn test_save_script_is_private() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zonefw.nft");
        save_script(&path, "flush ruleset\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "flush ruleset\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_managed_listing_drops_base_chains_and_declarations() {
        let live = "table inet zonefw {\n\
                    \tset blocked {\n\
                    \t\ttype ipv4_addr\n\
                    \t\tflags interval\n\
                    \t\telements = { 10.0.0.0/8 }\n\
                    \t}\n\
                    \tchain input {\n\
                    \t\ttype filter hook input priority filter; policy accept;\n\
                    \t\tct state invalid drop\n\
                    \t}\n\
                    \tchain zones {\n\
                    \t\tiifname \"eth1\" tcp dport 22 accept\n\
                    \t}\n\
                    }\n";
        let listing = managed_listing(live);
        assert!(!listing.contains("chain input"));
        assert!(!listing.contains("ct state invalid"));
        assert!(!listing.contains("type ipv4_addr"));
        assert!(listing.contains("elements = { 10.0.0.0/8 }"));
        assert!(listing.contains("chain zones {"));
        assert!(listing.contains("tcp dport 22 accept"));
    }

    #[test]
    fn test_unified_diff_marks_changes() {
        assert!(unified_diff("a\nb\n", "a\nb\n").is_none());
        let diff = unified_diff("a\nb\n", "a\nc\n").unwrap();
        assert!(diff.contains("- b"));
        assert!(diff.contains("+ c"));
        assert!(diff.contains("  a"));
    }
}
