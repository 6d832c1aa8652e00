//! `varnishd` command line for the cache containers.
//!
//! The list is user arguments (sorted by flag), then the defaults the user did not
//! override (sorted by flag), then a fixed block the container depends on. The fixed
//! block is appended even when the user passed the same flag with another value, which
//! leaves both entries on the command line.

use crate::api::v1alpha1::VARNISH_ADMIN_ADDRESS;
use crate::util::config::VCL_CONFIG_DIR;

/// One `(flag, value)` pair of the command line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgEntry {
    pub key: String,
    pub value: Option<String>,
}

impl ArgEntry {
    fn new(key: &str, value: Option<String>) -> Self {
        Self {
            key: key.to_string(),
            value,
        }
    }
}

/// `-` followed by a word character.
fn is_flag(token: &str) -> bool {
    let mut chars = token.chars();
    chars.next() == Some('-') && chars.next().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Groups tokens into entries. A flag takes the next token as its value unless that
/// token is a flag itself. A stray value with no preceding flag becomes its own entry.
pub fn parse_args(tokens: &[String]) -> Vec<ArgEntry> {
    let mut entries = Vec::new();
    let mut iter = tokens.iter().peekable();
    while let Some(key) = iter.next() {
        let value = match iter.peek() {
            Some(next) if is_flag(key) && !is_flag(next) => iter.next().cloned(),
            _ => None,
        };
        entries.push(ArgEntry::new(key, value));
    }
    entries
}

fn default_args(memory_limit_bytes: Option<i64>) -> Vec<ArgEntry> {
    let mut defaults = vec![
        ArgEntry::new("-p", Some("default_ttl=3600".to_string())),
        ArgEntry::new("-p", Some("default_grace=3600".to_string())),
        ArgEntry::new("-T", Some(VARNISH_ADMIN_ADDRESS.to_string())),
    ];
    if let Some(bytes) = memory_limit_bytes {
        // 90% of the limit, in whole mebibytes
        let mebibytes = i128::from(bytes) * 9 / (10 * 1024 * 1024);
        defaults.push(ArgEntry::new("-s", Some(format!("malloc,{mebibytes}M"))));
    }
    defaults
}

fn override_args(port: i32, default_file: &str) -> Vec<ArgEntry> {
    vec![
        ArgEntry::new("-F", None),
        ArgEntry::new("-a", Some(format!("0.0.0.0:{port}"))),
        ArgEntry::new("-S", Some(format!("{VCL_CONFIG_DIR}/secret"))),
        ArgEntry::new("-f", Some(format!("{VCL_CONFIG_DIR}/{default_file}"))),
    ]
}

/// Builds the full `varnishd` argument list.
///
/// Feeding the output back in as `user_args` yields the same list: copies of the fixed
/// block are dropped and exact copies of defaults are kept, once, as defaults.
pub fn synthesize_args(
    user_args: &[String],
    memory_limit_bytes: Option<i64>,
    port: i32,
    default_file: &str,
) -> Vec<String> {
    let overrides = override_args(port, default_file);
    let defaults = default_args(memory_limit_bytes);

    let (copied_defaults, mut user): (Vec<ArgEntry>, Vec<ArgEntry>) = parse_args(user_args)
        .into_iter()
        .filter(|entry| !overrides.contains(entry))
        .partition(|entry| defaults.contains(entry));

    // Any user entry drops every default sharing its key. Exact copies stand in for
    // themselves, so they stay once, in the defaults block.
    let user_keys: Vec<&str> = user.iter().chain(&copied_defaults).map(|e| e.key.as_str()).collect();
    let mut remaining: Vec<ArgEntry> = defaults
        .iter()
        .filter(|d| copied_defaults.contains(d) || !user_keys.contains(&d.key.as_str()))
        .cloned()
        .collect();

    user.sort_by(|a, b| a.key.cmp(&b.key));
    remaining.sort_by(|a, b| a.key.cmp(&b.key));

    user.into_iter()
        .chain(remaining)
        .chain(overrides)
        .flat_map(|entry| std::iter::once(entry.key).chain(entry.value))
        .collect()
}
