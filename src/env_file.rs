//! `.env` file support: `KEY=value` lines, optional `export`, quoting and
//! trailing comments. Variables already present in the process environment
//! win over file entries.

use std::path::Path;

/// Parse a whole file body into assignments, in file order.
pub fn parse(contents: &str) -> Result<Vec<(String, String)>, String> {
    let mut out = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if let Some(pair) = parse_line(line).map_err(|e| format!("line {}: {}", index + 1, e))? {
            out.push(pair);
        }
    }
    Ok(out)
}

/// Load `path` into the process environment without overriding existing
/// variables. Returns the number of variables set.
pub fn load(path: &Path) -> Result<usize, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let pairs = parse(&contents).map_err(|e| format!("{}: {}", path.display(), e))?;

    let mut applied = 0;
    for (key, value) in pairs {
        if std::env::var_os(&key).is_none() {
            // Called before any other thread is spawned.
            unsafe {
                std::env::set_var(key, value);
            }
            applied += 1;
        }
    }
    Ok(applied)
}

fn parse_line(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let assignment = trimmed.strip_prefix("export ").map(str::trim_start).unwrap_or(trimmed);
    let (key, raw) = assignment
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();

    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    Ok(Some((key.to_string(), parse_value(raw)?)))
}

fn parse_value(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('"') {
        quoted(rest, '"', true)
    } else if let Some(rest) = trimmed.strip_prefix('\'') {
        quoted(rest, '\'', false)
    } else {
        Ok(trimmed.split('#').next().unwrap_or_default().trim_end().to_string())
    }
}

/// Read up to the closing `quote`; only trailing whitespace or a comment
/// may follow it.
fn quoted(input: &str, quote: char, escapes: bool) -> Result<String, String> {
    let mut result = String::new();
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        if escapes && ch == '\\' {
            let escaped = chars
                .next()
                .ok_or_else(|| "unterminated escape sequence in double-quoted value".to_string())?;
            result.push(match escaped {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
        } else if ch == quote {
            let remainder = chars.as_str().trim();
            return if remainder.is_empty() || remainder.starts_with('#') {
                Ok(result)
            } else {
                Err(format!("unexpected characters after closing {} quote", quote))
            };
        } else {
            result.push(ch);
        }
    }

    Err(format!("unterminated {}-quoted value", quote))
}
