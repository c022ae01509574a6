//! Trait paths: `plan`, `address.city`, `items[0].sku`, `$.a["dotted.key"]`.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parses a dotted/bracketed path. An optional leading `$` or `$.` is
/// accepted and ignored.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, String> {
    let trimmed = path.trim();
    let body = trimmed
        .strip_prefix("$.")
        .or_else(|| trimmed.strip_prefix('$'))
        .unwrap_or(trimmed);
    if body.is_empty() {
        return Err(format!("empty path '{}'", path));
    }

    let chars: Vec<char> = body.chars().collect();
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                if current.is_empty() {
                    // Only a closing bracket may directly precede a dot.
                    if i == 0 || chars[i - 1] != ']' {
                        return Err(format!("empty segment in path '{}'", path));
                    }
                } else {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                i += 1;
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                let close = chars[i..]
                    .iter()
                    .position(|&c| c == ']')
                    .map(|offset| i + offset)
                    .ok_or_else(|| format!("unbalanced '[' in path '{}'", path))?;
                let inner: String = chars[i + 1..close].iter().collect();
                segments.push(parse_bracket(&inner, path)?);
                i = close + 1;
            }
            ']' => return Err(format!("unbalanced ']' in path '{}'", path)),
            c => {
                current.push(c);
                i += 1;
            }
        }
    }
    if !current.is_empty() {
        segments.push(PathSegment::Key(current));
    } else if chars.last() == Some(&'.') {
        return Err(format!("trailing '.' in path '{}'", path));
    }
    Ok(segments)
}

fn parse_bracket(inner: &str, path: &str) -> Result<PathSegment, String> {
    let inner = inner.trim();
    for quote in ['"', '\''] {
        if let Some(key) = inner
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return Ok(PathSegment::Key(key.to_string()));
        }
    }
    inner
        .parse::<usize>()
        .map(PathSegment::Index)
        .map_err(|_| format!("invalid index '[{}]' in path '{}'", inner, path))
}

/// Follows the segments into `root`. `None` means the path is absent, which
/// is distinct from a present `null`.
pub fn resolve<'a>(root: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |value, segment| match segment {
        PathSegment::Key(key) => value.as_object()?.get(key),
        PathSegment::Index(index) => value.as_array()?.get(*index),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(k: &str) -> PathSegment {
        PathSegment::Key(k.to_string())
    }

    #[test]
    fn test_parse_dotted_and_bracketed() {
        assert_eq!(parse_path("plan").unwrap(), vec![key("plan")]);
        assert_eq!(
            parse_path("$.address.city").unwrap(),
            vec![key("address"), key("city")]
        );
        assert_eq!(
            parse_path("items[1].sku").unwrap(),
            vec![key("items"), PathSegment::Index(1), key("sku")]
        );
        assert_eq!(
            parse_path("meta[\"a.b\"]").unwrap(),
            vec![key("meta"), key("a.b")]
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_path("").is_err());
        assert!(parse_path("$").is_err());
        assert!(parse_path("a..b").is_err());
        assert!(parse_path("a[0").is_err());
        assert!(parse_path("a]").is_err());
        assert!(parse_path("a[x]").is_err());
        assert!(parse_path("a.").is_err());
    }

    #[test]
    fn test_resolve_absent_vs_null() {
        let traits = json!({"plan": null, "items": [{"sku": "A1"}]});
        assert_eq!(
            resolve(&traits, &parse_path("plan").unwrap()),
            Some(&Value::Null)
        );
        assert_eq!(resolve(&traits, &parse_path("missing").unwrap()), None);
        assert_eq!(
            resolve(&traits, &parse_path("items[0].sku").unwrap()),
            Some(&json!("A1"))
        );
        assert_eq!(resolve(&traits, &parse_path("items[3].sku").unwrap()), None);
    }
}
