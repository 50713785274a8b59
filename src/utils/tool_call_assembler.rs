use crate::drivers::{new_call_id, parse_arguments};
use crate::types::ToolCall;
use serde_json::Value;
use tracing::warn;

#[derive(Debug)]
struct PartialCall {
    index: u32,
    id: Option<String>,
    name: String,
    fragments: String,
    /// Set when the vendor delivered the call whole.
    arguments: Option<Value>,
}

/// Collects streamed tool-call pieces (start + argument fragments, or whole calls) into
/// final [`ToolCall`]s, in order of first appearance.
/// This is intentionally tolerant: arguments are parsed leniently and kept as a raw
/// string when they are not JSON.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: Vec<PartialCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn open(&mut self, index: u32) -> &mut PartialCall {
        // Only the latest streamed call with this index is still open.
        let pos = self
            .calls
            .iter()
            .rposition(|c| c.index == index && c.arguments.is_none());
        match pos {
            Some(pos) => &mut self.calls[pos],
            None => {
                self.calls.push(PartialCall {
                    index,
                    id: None,
                    name: String::new(),
                    fragments: String::new(),
                    arguments: None,
                });
                let last = self.calls.len() - 1;
                &mut self.calls[last]
            }
        }
    }

    pub fn on_started(&mut self, index: u32, id: Option<String>, name: String) {
        let call = self.open(index);
        if call.id.is_none() {
            call.id = id;
        }
        if call.name.is_empty() {
            call.name = name;
        }
    }

    pub fn on_partial(&mut self, index: u32, fragment: &str) {
        self.open(index).fragments.push_str(fragment);
    }

    pub fn on_complete(&mut self, index: u32, id: Option<String>, name: String, arguments: Value) {
        self.calls.push(PartialCall {
            index,
            id,
            name,
            fragments: String::new(),
            arguments: Some(arguments),
        });
    }

    pub fn finalize(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .filter_map(|c| {
                if c.name.is_empty() {
                    warn!(index = c.index, "dropping streamed tool call without a name");
                    return None;
                }
                let arguments = match c.arguments {
                    Some(v) => v,
                    None => parse_arguments(&Value::String(c.fragments)),
                };
                Some(ToolCall {
                    id: c.id.unwrap_or_else(new_call_id),
                    name: c.name,
                    arguments,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interleaved_fragments() {
        let mut asm = ToolCallAssembler::new();
        asm.on_started(0, Some("a".into()), "search".into());
        asm.on_started(1, Some("b".into()), "fetch".into());
        asm.on_partial(0, "{\"q\":");
        asm.on_partial(1, "{\"url\":\"x\"}");
        asm.on_partial(0, "\"rust\"}");
        let calls = asm.finalize();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments, json!({"q": "rust"}));
        assert_eq!(calls[1].id, "b");
    }

    #[test]
    fn test_whole_calls_with_repeated_index() {
        let mut asm = ToolCallAssembler::new();
        asm.on_complete(0, None, "a".into(), json!({}));
        asm.on_complete(0, None, "b".into(), json!({"n": 1}));
        let calls = asm.finalize();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].id.starts_with("call_"));
        assert_ne!(calls[0].id, calls[1].id);
    }

    #[test]
    fn test_empty_and_broken_arguments() {
        let mut asm = ToolCallAssembler::new();
        asm.on_started(0, None, "noargs".into());
        asm.on_started(1, None, "broken".into());
        asm.on_partial(1, "{\"a\": 1,");
        asm.on_partial(2, "orphan");
        let calls = asm.finalize();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments, json!({}));
        assert_eq!(calls[1].arguments, json!({"a": 1}));
    }
}
