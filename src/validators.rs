//! Input validation and sanitization functions for zonefw
//!
//! Everything that ends up inside an nft or tc argument vector passes through
//! one of these checks first. Argument vectors are never joined into a shell
//! string, but nft still parses each argument, so names and labels are kept
//! to a conservative ASCII subset.

/// Sanitizes free text for use inside an nftables comment or log prefix.
///
/// Removes control characters, quotes, and shell metacharacters.
/// Limits length to 64 bytes (ASCII characters only).
///
/// # Examples
///
/// ```
/// use zonefw::validators::sanitize_label;
///
/// let safe = sanitize_label("Normal Label");
/// assert_eq!(safe, "Normal Label");
///
/// let unsafe_label = "Test\nNewline\"Quote";
/// let safe = sanitize_label(unsafe_label);
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_label(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':'))
        .take(64)
        .collect()
}

/// Validates a network interface name.
///
/// Linux interface names:
/// - 1-15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > 15 {
        return Err(format!("Interface name '{name}' too long (max 15 characters)"));
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(format!("Interface name '{name}' contains invalid characters"));
    }

    Ok(name.to_string())
}

/// Validates a zone name: 2-32 characters of letters, digits and underscore.
///
/// # Errors
///
/// Returns `Err` describing the first violated constraint.
pub fn validate_zone_name(name: &str) -> Result<(), String> {
    if name.len() < 2 || name.len() > 32 {
        return Err(format!("Zone name '{name}' must be 2-32 characters"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!(
            "Zone name '{name}' may only contain letters, numbers and underscore"
        ));
    }
    Ok(())
}

/// Validates an ipset name: 1-64 characters, starting with a letter,
/// then letters, digits, dash or underscore.
///
/// # Errors
///
/// Returns `Err` describing the first violated constraint.
pub fn validate_set_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > 64 {
        return Err("Set name must be 1-64 characters".to_string());
    }
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(format!("Set name '{name}' must start with a letter"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err(format!("Set name '{name}' contains invalid characters"));
    }
    Ok(())
}

/// Validates a managed table name (same constraints as a set name, max 32).
///
/// # Errors
///
/// Returns `Err` if the name would not be accepted by nft.
pub fn validate_table_name(name: &str) -> Result<(), String> {
    if name.len() > 32 {
        return Err("Table name too long (max 32 characters)".to_string());
    }
    validate_set_name(name).map_err(|e| e.replace("Set", "Table"))
}

/// Builds an nft log prefix, truncated to the kernel's 127-byte limit and
/// terminated with ": " so log lines stay readable.
pub fn log_prefix(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .map(|p| sanitize_label(p))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let mut prefix: String = joined.chars().take(125).collect();
    prefix.push_str(": ");
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_label_strips_quotes() {
        assert_eq!(sanitize_label("allow \"ssh\"; rm -rf"), "allow ssh rm -rf");
    }

    #[test]
    fn test_validate_interface() {
        assert!(validate_interface("eth0").is_ok());
        assert!(validate_interface("wg-office.10").is_ok());
        assert!(validate_interface("").is_err());
        assert!(validate_interface("averyveryverylongname").is_err());
        assert!(validate_interface("eth0;ls").is_err());
        assert!(validate_interface("..").is_err());
    }

    #[test]
    fn test_validate_zone_name() {
        assert!(validate_zone_name("wan").is_ok());
        assert!(validate_zone_name("guest_wifi").is_ok());
        assert!(validate_zone_name("w").is_err());
        assert!(validate_zone_name("my-zone").is_err());
    }

    #[test]
    fn test_validate_set_name() {
        assert!(validate_set_name("blocklist").is_ok());
        assert!(validate_set_name("bad-hosts_v2").is_ok());
        assert!(validate_set_name("1st").is_err());
        assert!(validate_set_name("a b").is_err());
        assert!(validate_set_name("").is_err());
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("zonefw").is_ok());
        let err = validate_table_name("zone fw").unwrap_err();
        assert!(err.starts_with("Table"));
    }

    #[test]
    fn test_log_prefix() {
        assert_eq!(log_prefix(&["zonefw", "wan", "r3"]), "zonefw wan r3: ");
        let long = "x".repeat(300);
        assert!(log_prefix(&[&long]).len() <= 127);
    }
}
