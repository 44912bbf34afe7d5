//! `<< .Path >>` placeholders over a JSON scope

use apolo_core::{AppError, AppResult};
use serde_json::Value;

fn lookup<'v>(scope: &'v Value, path: &str) -> Option<&'v Value> {
    let path = path.strip_prefix('.')?;
    if path.is_empty() {
        return Some(scope);
    }
    path.split('.').try_fold(scope, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Replace every placeholder of `template` by the value at its path in `scope`
///
/// Strings are inserted verbatim, null as nothing, anything else as JSON.
///
/// # Errors
///
/// Returns `AppError::Parser` for unclosed placeholders and unknown paths
pub(crate) fn render(template: &str, scope: &Value) -> AppResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("<<") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find(">>")
            .ok_or_else(|| AppError::Parser(format!("unclosed placeholder in {}", template)))?;
        let path = after[..close].trim();
        let value = lookup(scope, path)
            .ok_or_else(|| AppError::Parser(format!("unknown template path {}", path)))?;
        match value {
            Value::String(s) => out.push_str(s),
            Value::Null => {}
            other => out.push_str(&other.to_string()),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
