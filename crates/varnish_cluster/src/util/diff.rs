use serde_json::Value;

/// JSON pointer paths where `desired` is not reflected in `observed`.
///
/// Only what `desired` sets is compared, so fields the API server adds on its own do
/// not count. Null in `desired` means "not managed". An empty list or map in `desired`
/// requires the observed field to be absent or empty, which is how a removal is noticed.
pub fn semantic_diff(desired: &Value, observed: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    walk("", desired, observed, &mut paths);
    paths
}

pub fn is_semantic_subset(desired: &Value, observed: &Value) -> bool {
    semantic_diff(desired, observed).is_empty()
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn walk(path: &str, desired: &Value, observed: &Value, out: &mut Vec<String>) {
    match (desired, observed) {
        (Value::Null, _) => {}
        (d, o) if is_empty(d) => {
            if !is_empty(o) {
                out.push(pointer(path));
            }
        }
        (Value::Object(d), Value::Object(o)) => {
            for (key, value) in d {
                let child = format!("{path}/{}", key.replace('~', "~0").replace('/', "~1"));
                walk(&child, value, o.get(key).unwrap_or(&Value::Null), out);
            }
        }
        (Value::Array(d), Value::Array(o)) if d.len() == o.len() => {
            for (i, (dv, ov)) in d.iter().zip(o).enumerate() {
                walk(&format!("{path}/{i}"), dv, ov, out);
            }
        }
        (d, o) if d != o => out.push(pointer(path)),
        _ => {}
    }
}

fn pointer(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}
