//! Reader for `.env` style files feeding [`crate::config::ManagerConfig`].

use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Reads `KEY=value` pairs from `path`. A missing file yields no variables.
pub fn read_vars(path: &Path) -> Result<HashMap<String, String>, String> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let contents = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read dotenv file {}: {err}", path.display()))?;
    let mut vars = HashMap::new();

    for (index, line) in contents.lines().enumerate() {
        let Some((key, value)) = parse_line(line).map_err(|err| {
            format!(
                "Failed to parse dotenv file {} at line {}: {err}",
                path.display(),
                index + 1
            )
        })?
        else {
            continue;
        };

        if vars.insert(key.clone(), value).is_some() {
            return Err(format!(
                "Duplicate variable '{key}' in dotenv file {}",
                path.display()
            ));
        }
    }

    Ok(vars)
}

/// Parses one line. Blank lines and comments yield `None`.
fn parse_line(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let assignment = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let (key, raw_value) = assignment
        .split_once('=')
        .ok_or_else(|| "Invalid dotenv line, missing '='".to_string())?;

    if key.is_empty() {
        return Err("Invalid dotenv line, missing key".to_string());
    }
    if key.ends_with(char::is_whitespace) || raw_value.starts_with(char::is_whitespace) {
        return Err("Whitespace around '=' is not allowed".to_string());
    }
    if !is_valid_key(key) {
        return Err(format!("Invalid dotenv variable name '{key}'"));
    }

    Ok(Some((key.to_string(), unquote(raw_value)?.to_string())))
}

fn unquote(value: &str) -> Result<&str, String> {
    let Some(quote) = value.chars().next().filter(|ch| *ch == '"' || *ch == '\'') else {
        return Ok(value);
    };
    if value.len() == 1 || !value.ends_with(quote) {
        return Err("Invalid quoted value".to_string());
    }
    Ok(&value[1..value.len() - 1])
}

fn is_valid_key(key: &str) -> bool {
    key.chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reads_plain_quoted_and_exported_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        fs::write(
            &path,
            "# comment\nOPTIFLUX_PORT=9000\n\nexport OPTIFLUX_HOST=\"127.0.0.1\"\nOPTIFLUX_LOG_DIR='/tmp/logs'\n",
        )
        .unwrap();

        let vars = read_vars(&path).unwrap();
        assert_eq!(vars.len(), 3);
        assert_eq!(vars["OPTIFLUX_PORT"], "9000");
        assert_eq!(vars["OPTIFLUX_HOST"], "127.0.0.1");
        assert_eq!(vars["OPTIFLUX_LOG_DIR"], "/tmp/logs");
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_vars(&dir.path().join(".env.prod")).unwrap().is_empty());
    }

    #[test]
    fn rejects_duplicates_and_spaced_assignments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "A=1\nA=2\n").unwrap();
        assert!(read_vars(&path).unwrap_err().contains("Duplicate variable 'A'"));

        fs::write(&path, "A = 1\n").unwrap();
        assert!(read_vars(&path).unwrap_err().contains("line 1"));
    }
}
