//! Parse a `.env` file into a key-value map. Applying (without overwriting
//! existing env) happens in the crate root.

use std::collections::HashMap;
use std::path::Path;

/// Path of `.env`: `override_dir` if given, else the current directory.
fn dotenv_path(override_dir: Option<&Path>) -> Option<std::path::PathBuf> {
    let dir = override_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())?;
    let path = dir.join(".env");
    if path.is_file() {
        Some(path)
    } else {
        None
    }
}

/// Minimal .env parser: `KEY=VALUE` lines, skip blank lines and `#` comments,
/// trim key and value. Double-quoted values support `\"`; single-quoted values
/// are stripped verbatim. No multiline values.
fn parse_dotenv(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim().to_string();
        let value = v.trim().to_string();
        let value = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value[1..value.len() - 1].replace("\\\"", "\"")
        } else {
            value
        };
        let value = value
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .map(str::to_string)
            .unwrap_or(value);
        if !key.is_empty() {
            out.insert(key, value);
        }
    }
    out
}

/// Loads `.env` into a map. A missing file yields an empty map.
pub fn load_env_map(override_dir: Option<&Path>) -> std::io::Result<HashMap<String, String>> {
    let path = match dotenv_path(override_dir) {
        Some(p) => p,
        None => return Ok(HashMap::new()),
    };
    let content = std::fs::read_to_string(&path)?;
    Ok(parse_dotenv(&content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_pairs() {
        let m = parse_dotenv("FOO=bar\nBAZ=quux\n");
        assert_eq!(m.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(m.get("BAZ"), Some(&"quux".to_string()));
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let m = parse_dotenv("\n# comment\nKEY=val\n  \n");
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("KEY"), Some(&"val".to_string()));
    }

    #[test]
    fn strips_double_quotes_with_escape() {
        let m = parse_dotenv(r#"KEY="say \"hi\"""#);
        assert_eq!(m.get("KEY"), Some(&"say \"hi\"".to_string()));
    }

    #[test]
    fn strips_single_quotes() {
        let m = parse_dotenv("KEY='single quoted'");
        assert_eq!(m.get("KEY"), Some(&"single quoted".to_string()));
    }

    #[test]
    fn line_without_equals_and_empty_key_skipped() {
        let m = parse_dotenv("JUST_A_WORD\n=value_only\nKEY=ok\n");
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("KEY"), Some(&"ok".to_string()));
    }

    #[test]
    fn empty_value_kept() {
        let m = parse_dotenv("KEY=\nOTHER=val\n");
        assert_eq!(m.get("KEY"), Some(&String::new()));
        assert_eq!(m.get("OTHER"), Some(&"val".to_string()));
    }

    #[test]
    fn missing_file_returns_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let m = load_env_map(Some(dir.path())).unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn reads_file_from_override_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "A=1\nB=2\n").unwrap();
        let m = load_env_map(Some(dir.path())).unwrap();
        assert_eq!(m.get("A"), Some(&"1".to_string()));
        assert_eq!(m.get("B"), Some(&"2".to_string()));
    }
}
