//! Token accounting over completion responses
//!
//! Servers disagree on where they report generated tokens, so extraction
//! sits behind [`TokenExtractor`]. [`LlamaTokenExtractor`] understands the
//! llama.cpp layout and the OpenAI-style `usage` object.

use serde_json::Value;

/// Keys holding a generated-token count, highest priority first
const COUNT_KEYS: [&str; 3] = ["predicted_n", "tokens_predicted", "completion_tokens"];

/// Keys under `timings` holding a server-measured generation rate
const RATE_KEYS: [&str; 2] = ["predicted_per_second", "tokens_per_second"];

/// Reads token figures out of a completion response
pub trait TokenExtractor: Send + Sync {
    /// Generated tokens, 0 when the response carries no recognised field
    fn token_count(&self, response: &Value) -> u64;

    /// Server-reported generation rate of this one request
    fn tokens_per_second(&self, _response: &Value) -> Option<f64> {
        None
    }
}

/// Interpret a JSON number or numeric string as a count; fractions truncate
fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f as u64)
            })
        }
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

/// llama.cpp server responses.
///
/// For each key in `predicted_n`, `tokens_predicted`, `completion_tokens`
/// the `timings` object is checked before the top level; the `usage`
/// object is the last resort.
#[derive(Debug, Clone, Copy, Default)]
pub struct LlamaTokenExtractor;

impl TokenExtractor for LlamaTokenExtractor {
    fn token_count(&self, response: &Value) -> u64 {
        let timings = response.get("timings");

        for key in COUNT_KEYS {
            let found = timings
                .and_then(|t| t.get(key))
                .or_else(|| response.get(key))
                .and_then(as_count);
            if let Some(count) = found {
                return count;
            }
        }

        response
            .get("usage")
            .and_then(|usage| usage.get("completion_tokens"))
            .and_then(as_count)
            .unwrap_or(0)
    }

    fn tokens_per_second(&self, response: &Value) -> Option<f64> {
        let timings = response.get("timings")?;

        if let Some(rate) = RATE_KEYS
            .iter()
            .find_map(|key| timings.get(*key).and_then(as_float))
        {
            return Some(rate);
        }

        let predicted_n = timings.get("predicted_n").and_then(as_float)?;
        let predicted_ms = timings.get("predicted_ms").and_then(as_float)?;
        if predicted_n > 0.0 && predicted_ms > 0.0 {
            Some(predicted_n / (predicted_ms / 1000.0))
        } else {
            None
        }
    }
}

/// Token count at the first of several dotted paths that is present,
/// e.g. `["usage.output_tokens", "meta.tokens"]`
#[derive(Debug, Clone)]
pub struct FieldPathExtractor {
    paths: Vec<Vec<String>>,
}

impl FieldPathExtractor {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            paths: paths
                .into_iter()
                .map(|path| path.as_ref().split('.').map(str::to_string).collect())
                .collect(),
        }
    }
}

impl TokenExtractor for FieldPathExtractor {
    fn token_count(&self, response: &Value) -> u64 {
        self.paths
            .iter()
            .find_map(|path| {
                path.iter()
                    .try_fold(response, |node, key| node.get(key))
                    .and_then(as_count)
            })
            .unwrap_or(0)
    }
}

/// Token count under the llama.cpp policy
pub fn extract_token_count(response: &Value) -> u64 {
    LlamaTokenExtractor.token_count(response)
}

/// Per-request generation rate under the llama.cpp policy
pub fn extract_tokens_per_second(response: &Value) -> Option<f64> {
    LlamaTokenExtractor.tokens_per_second(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timings_predicted_n_wins() {
        let response = json!({
            "completion_tokens": 99,
            "usage": { "completion_tokens": 77 },
            "timings": { "predicted_n": 12 },
        });
        assert_eq!(extract_token_count(&response), 12);
    }

    #[test]
    fn test_top_level_before_later_timing_keys() {
        // predicted_n at the top level outranks tokens_predicted in timings
        let response = json!({
            "predicted_n": 5,
            "timings": { "tokens_predicted": 8 },
        });
        assert_eq!(extract_token_count(&response), 5);

        let response = json!({ "tokens_predicted": 9 });
        assert_eq!(extract_token_count(&response), 9);
    }

    #[test]
    fn test_usage_fallback_and_default() {
        assert_eq!(extract_token_count(&json!({ "usage": { "completion_tokens": 4 } })), 4);
        assert_eq!(extract_token_count(&json!({ "content": "hi" })), 0);
        assert_eq!(extract_token_count(&json!({ "timings": null })), 0);
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(extract_token_count(&json!({ "timings": { "predicted_n": "17" } })), 17);
        assert_eq!(extract_token_count(&json!({ "timings": { "predicted_n": 6.9 } })), 6);
        // Unusable values fall through to the next key
        assert_eq!(
            extract_token_count(&json!({ "timings": { "predicted_n": "n/a" }, "completion_tokens": 3 })),
            3
        );
    }

    #[test]
    fn test_tokens_per_second() {
        let reported = json!({ "timings": { "predicted_per_second": 42.5, "predicted_n": 10, "predicted_ms": 1000 } });
        assert_eq!(extract_tokens_per_second(&reported), Some(42.5));

        let derived = json!({ "timings": { "predicted_n": 10, "predicted_ms": 500 } });
        assert_eq!(extract_tokens_per_second(&derived), Some(20.0));

        let zero = json!({ "timings": { "predicted_n": 0, "predicted_ms": 500 } });
        assert_eq!(extract_tokens_per_second(&zero), None);
        assert_eq!(extract_tokens_per_second(&json!({})), None);
    }

    #[test]
    fn test_field_path_extractor() {
        let extractor = FieldPathExtractor::new(["meta.generated", "usage.output_tokens"]);
        assert_eq!(extractor.token_count(&json!({ "usage": { "output_tokens": 11 } })), 11);
        assert_eq!(
            extractor.token_count(&json!({ "meta": { "generated": 2 }, "usage": { "output_tokens": 11 } })),
            2
        );
        assert_eq!(extractor.token_count(&json!({ "timings": { "predicted_n": 5 } })), 0);
        assert_eq!(extractor.tokens_per_second(&json!({})), None);
    }
}
