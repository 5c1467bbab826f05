use crate::error::ExecutionError;
use crate::ids::SubscriptionHandle;
use crate::message::{ExecutionResult, OperationPayload};
use crate::sequence::{ExecutionOutcome, PushSender};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Values pushed by a callback-driven subscription.
pub type ResultSink = PushSender<ExecutionResult>;

/// Everything the executor needs to run one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionParams {
    pub query: String,
    pub variables: Map<String, Value>,
    pub operation_name: Option<String>,
    pub context: Map<String, Value>,
}

impl ExecutionParams {
    pub fn from_payload(payload: &OperationPayload, context: Map<String, Value>) -> Self {
        ExecutionParams {
            query: payload.query.clone(),
            variables: payload.variables.clone().unwrap_or_default(),
            operation_name: payload.operation_name.clone(),
            context,
        }
    }
}

/// The GraphQL engine behind the server.
///
/// Queries and mutations go through [`Executor::execute`]. Operations for
/// which [`Executor::is_subscription`] is true go through
/// [`Executor::subscribe`] instead: the returned handle identifies the live
/// subscription and every result is pushed into the sink.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, params: ExecutionParams) -> ExecutionOutcome<ExecutionResult>;

    async fn subscribe(
        &self,
        params: ExecutionParams,
        sink: ResultSink,
    ) -> Result<SubscriptionHandle, ExecutionError> {
        let _ = (params, sink);
        Err(ExecutionError::bad_request("Subscriptions are not supported"))
    }

    /// Releases a handle returned by [`Executor::subscribe`].
    fn unsubscribe(&self, handle: SubscriptionHandle) {
        let _ = handle;
    }

    fn is_subscription(&self, params: &ExecutionParams) -> bool {
        is_subscription_document(&params.query, params.operation_name.as_deref())
    }
}

/// Cheap operation-type sniffing that avoids a full parse.
///
/// Only operation definitions at the top level of the document count;
/// comments, string literals and nested selections are skipped. With an
/// operation name, looks for `subscription <name>`; otherwise checks the
/// first operation in the document. Shorthand `{ ... }` is a query.
pub fn is_subscription_document(query: &str, operation_name: Option<&str>) -> bool {
    let operations = top_level_operations(query);
    match operation_name {
        Some(name) => operations
            .iter()
            .any(|(kind, op_name)| *kind == "subscription" && *op_name == Some(name)),
        None => operations
            .iter()
            .find(|(kind, _)| *kind != "fragment")
            .is_some_and(|(kind, _)| *kind == "subscription"),
    }
}

/// `(keyword, name)` of every top-level definition, in document order.
fn top_level_operations(document: &str) -> Vec<(&str, Option<&str>)> {
    let bytes = document.as_bytes();
    let mut definitions: Vec<(&str, Option<&str>)> = Vec::new();
    let mut braces = 0usize;
    let mut parens = 0usize;
    let mut expect_definition = true;
    let mut naming = false;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'"' => {
                i = skip_string(bytes, i);
                continue;
            }
            b'(' => {
                parens += 1;
                naming = false;
            }
            b')' => parens = parens.saturating_sub(1),
            // Object values inside arguments or variable defaults.
            b'{' | b'}' if parens > 0 => {}
            b'{' => {
                if braces == 0 && expect_definition {
                    definitions.push(("query", None));
                    expect_definition = false;
                }
                naming = false;
                braces += 1;
            }
            b'}' => {
                braces = braces.saturating_sub(1);
                if braces == 0 {
                    expect_definition = true;
                }
            }
            b if b == b'_' || b.is_ascii_alphabetic() => {
                let start = i;
                while i < bytes.len() && (bytes[i] == b'_' || bytes[i].is_ascii_alphanumeric()) {
                    i += 1;
                }
                let word = &document[start..i];
                if braces == 0 && parens == 0 {
                    if expect_definition {
                        definitions.push((word, None));
                        expect_definition = false;
                        naming = true;
                    } else if naming {
                        if let Some(last) = definitions.last_mut() {
                            last.1 = Some(word);
                        }
                        naming = false;
                    }
                }
                continue;
            }
            b if b.is_ascii_whitespace() || b == b',' => {}
            _ => naming = false,
        }
        i += 1;
    }
    definitions
}

// Index just past the string literal opening at `start`.
fn skip_string(bytes: &[u8], start: usize) -> usize {
    if bytes[start..].starts_with(b"\"\"\"") {
        let mut i = start + 3;
        while i < bytes.len() {
            if bytes[i] == b'\\' {
                i += 2;
            } else if bytes[i..].starts_with(b"\"\"\"") {
                return i + 3;
            } else {
                i += 1;
            }
        }
        return bytes.len();
    }

    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return i + 1,
            b'\n' => return i,
            _ => i += 1,
        }
    }
    bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_detection() {
        assert!(is_subscription_document("subscription X { field }", None));
        assert!(is_subscription_document("subscription{field}", None));
        assert!(!is_subscription_document("{ field }", None));
        assert!(!is_subscription_document("query Q { field }", None));
        assert!(!is_subscription_document("mutation M { run }", None));
    }

    #[test]
    fn test_subscription_detection_with_operation_name() {
        let doc = "query A { a } subscription B { b }";
        assert!(is_subscription_document(doc, Some("B")));
        assert!(!is_subscription_document(doc, Some("A")));
        assert!(!is_subscription_document(doc, None));
    }

    #[test]
    fn test_fields_named_subscription_are_not_operations() {
        assert!(!is_subscription_document("{ subscription }", None));
        assert!(!is_subscription_document("{ user { subscription { plan } } }", None));
        assert!(!is_subscription_document(
            "query Q { account { subscription { renewsAt } } }",
            None
        ));
    }

    #[test]
    fn test_comments_and_strings_are_ignored() {
        assert!(!is_subscription_document("# no subscription here\nquery Q { a }", None));
        assert!(!is_subscription_document(
            r#"{ search(text: "subscription { x }") { id } }"#,
            None
        ));
        assert!(!is_subscription_document(
            "{ doc(body: \"\"\"subscription \"\"\") }",
            None
        ));
        assert!(is_subscription_document(
            "# query first?\nsubscription S { tick }",
            None
        ));
    }

    #[test]
    fn test_variable_defaults_do_not_end_the_definition() {
        let doc = "query Q($f: Filter = {kind: \"subscription\"}) { a } subscription S { b }";
        assert!(!is_subscription_document(doc, None));
        assert!(is_subscription_document(doc, Some("S")));
        assert!(!is_subscription_document(doc, Some("Q")));
    }

    #[test]
    fn test_leading_fragment_is_skipped() {
        let doc = "fragment F on Tick { n } subscription { tick { ...F } }";
        assert!(is_subscription_document(doc, None));
        assert!(!is_subscription_document("fragment F on T { n } { t { ...F } }", None));
    }

    #[test]
    fn test_params_from_payload() {
        let mut payload = OperationPayload::new("{ a }");
        payload.operation_name = Some("A".to_string());
        let mut context = Map::new();
        context.insert("user".to_string(), Value::from("u1"));

        let params = ExecutionParams::from_payload(&payload, context);
        assert_eq!(params.query, "{ a }");
        assert!(params.variables.is_empty());
        assert_eq!(params.operation_name.as_deref(), Some("A"));
        assert_eq!(params.context["user"], Value::from("u1"));
    }
}
