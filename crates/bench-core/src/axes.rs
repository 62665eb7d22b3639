//! Parsing of sweep axis lists and server argument strings
//!
//! Lists accept commas, whitespace or both as separators. Optional axes
//! (batch, ubatch) accept the literal `default`, meaning "leave the server
//! flag unset".

use crate::{Error, Result};

fn split_items(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|item| !item.is_empty())
}

/// Parse a list of integers such as `"1,2,4 8"`
pub fn parse_int_list<T>(raw: &str) -> Result<Vec<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    split_items(raw)
        .map(|item| {
            item.parse::<T>()
                .map_err(|e| Error::config(format!("invalid list entry '{}': {}", item, e)))
        })
        .collect()
}

/// Parse a list of optional integers such as `"default,512,1024"`.
///
/// An empty list yields `[None]`.
pub fn parse_optional_int_list(raw: &str) -> Result<Vec<Option<u32>>> {
    let mut values = Vec::new();
    for item in split_items(raw) {
        if item.eq_ignore_ascii_case("default") {
            values.push(None);
        } else {
            let value = item
                .parse::<u32>()
                .map_err(|e| Error::config(format!("invalid list entry '{}': {}", item, e)))?;
            values.push(Some(value));
        }
    }

    if values.is_empty() {
        values.push(None);
    }
    Ok(values)
}

/// Split comma-separated extra server arguments (`"--threads,8,--mlock"`)
pub fn parse_comma_args(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|arg| !arg.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a boolean flag the permissive way: anything but `0`, `false`
/// or `no` counts as enabled.
pub fn parse_flag(raw: &str) -> bool {
    !matches!(raw.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no")
}
