//! Server launch argument building

use bench_core::axes::parse_comma_args;

/// Flags the sweep owns; user-supplied copies are stripped before launch.
/// Each takes a value as the following argument.
const OWNED_FLAGS: [&str; 4] = ["--parallel", "--batch-size", "--ubatch", "-b"];

/// Split comma-separated extra server arguments
pub fn parse_server_args(raw: &str) -> Vec<String> {
    parse_comma_args(raw)
}

fn is_owned_assignment(arg: &str) -> bool {
    OWNED_FLAGS
        .iter()
        .any(|flag| arg.starts_with(flag) && arg[flag.len()..].starts_with('='))
}

/// Remove the sweep-owned flags from `base`, then append `--batch-size`
/// and `--ubatch` when set
pub fn build_server_args(base: &[String], batch: Option<u32>, ubatch: Option<u32>) -> Vec<String> {
    let mut cleaned = Vec::with_capacity(base.len() + 4);
    let mut skip_next = false;

    for arg in base {
        if skip_next {
            skip_next = false;
            continue;
        }
        if OWNED_FLAGS.contains(&arg.as_str()) {
            skip_next = true;
            continue;
        }
        if is_owned_assignment(arg) {
            continue;
        }
        cleaned.push(arg.clone());
    }

    if let Some(batch) = batch {
        cleaned.push("--batch-size".to_string());
        cleaned.push(batch.to_string());
    }
    if let Some(ubatch) = ubatch {
        cleaned.push("--ubatch".to_string());
        cleaned.push(ubatch.to_string());
    }
    cleaned
}
