//! Cache key generation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

impl CacheKey {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            tool: None,
        }
    }

    /// Key for one tool invocation. Object keys are sorted first, so argument order does
    /// not matter.
    pub fn for_tool(name: &str, arguments: &Value, salt: Option<&str>) -> Self {
        let mut canonical = String::new();
        write_canonical(arguments, &mut canonical);
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());
        if let Some(salt) = salt {
            hasher.update([0u8]);
            hasher.update(salt.as_bytes());
        }
        let hash: String = hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect();
        Self {
            hash,
            tool: Some(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.hash
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ignores_argument_order() {
        let a = CacheKey::for_tool("search", &json!({"query": "rust", "limit": 5}), None);
        let b = CacheKey::for_tool("search", &json!({"limit": 5, "query": "rust"}), None);
        assert_eq!(a, b);
        assert_eq!(a.hash.len(), 64);
        assert_eq!(a.tool.as_deref(), Some("search"));
    }

    #[test]
    fn test_key_separates_tools_and_salts() {
        let args = json!({"query": "rust"});
        let search = CacheKey::for_tool("search", &args, None);
        assert_ne!(search, CacheKey::for_tool("scrape", &args, None));
        assert_ne!(search, CacheKey::for_tool("search", &args, Some("user-42")));
        assert_ne!(search, CacheKey::for_tool("search", &json!({"query": "go"}), None));
    }
}
