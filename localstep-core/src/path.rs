//! Reference paths into JSON documents.
//!
//! Only the subset of JSONPath that the States language needs for reference
//! paths is supported:
//!
//! - `$` - the whole document
//! - `$.field.nested` - object field access
//! - `$.items[2]` - array index access
//! - `$['field with spaces']` - bracketed field access
//! - `$$.Execution.Id` - lookups in the context object
//!
//! Resolution never fails: a missing key, an out-of-range index or a type
//! mismatch on the way yields `None`.

use crate::error::CoreError;
use serde_json::{Map, Value};
use std::fmt;

/// Which document a path is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRoot {
    /// The state's data (`$`).
    Data,
    /// The context object (`$$`).
    Context,
}

/// One step of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(usize),
}

/// A parsed reference path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    root: PathRoot,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// The root path `$`.
    pub fn root() -> Self {
        Self {
            raw: "$".to_string(),
            root: PathRoot::Data,
            segments: Vec::new(),
        }
    }

    /// Parses a path expression.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        PathParser::new(s).parse()
    }

    /// Returns the path as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn root_kind(&self) -> PathRoot {
        self.root
    }

    /// Returns the parsed segments after the root.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns true for `$`.
    pub fn is_root(&self) -> bool {
        self.root == PathRoot::Data && self.segments.is_empty()
    }

    /// Resolves a `$`-rooted path against a document.
    ///
    /// Context paths (`$$.`) resolve to nothing here; use
    /// [`resolve`](Self::resolve) for those.
    pub fn get<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        match self.root {
            PathRoot::Data => self.walk(doc),
            PathRoot::Context => None,
        }
    }

    /// Resolves the path against the data or the context object, depending
    /// on its root.
    pub fn resolve<'a>(&self, data: &'a Value, context: &'a Value) -> Option<&'a Value> {
        match self.root {
            PathRoot::Data => self.walk(data),
            PathRoot::Context => self.walk(context),
        }
    }

    fn walk<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        let mut current = doc;
        for segment in &self.segments {
            current = match (segment, current) {
                (Segment::Field(name), Value::Object(map)) => map.get(name)?,
                (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Writes `value` at this path inside `target`.
    ///
    /// Missing intermediate fields are created as objects. Writing through a
    /// scalar or past the end of an array is an error.
    pub fn set(&self, target: &mut Value, value: Value) -> Result<(), CoreError> {
        if self.root == PathRoot::Context {
            return Err(self.error("cannot write into the context object"));
        }

        let Some((last, parents)) = self.segments.split_last() else {
            *target = value;
            return Ok(());
        };

        let mut current = target;
        for segment in parents {
            current = match segment {
                Segment::Field(name) => {
                    if current.is_null() {
                        *current = Value::Object(Map::new());
                    }
                    match current {
                        Value::Object(map) => map
                            .entry(name.clone())
                            .or_insert_with(|| Value::Object(Map::new())),
                        _ => return Err(self.error(format!("'{}' is not an object", name))),
                    }
                }
                Segment::Index(i) => match current {
                    Value::Array(items) if *i < items.len() => &mut items[*i],
                    _ => return Err(self.error(format!("index {} is out of range", i))),
                },
            };
        }

        match last {
            Segment::Field(name) => {
                if current.is_null() {
                    *current = Value::Object(Map::new());
                }
                match current {
                    Value::Object(map) => {
                        map.insert(name.clone(), value);
                        Ok(())
                    }
                    _ => Err(self.error(format!("cannot set '{}' on a non-object", name))),
                }
            }
            Segment::Index(i) => match current {
                Value::Array(items) if *i < items.len() => {
                    items[*i] = value;
                    Ok(())
                }
                _ => Err(self.error(format!("index {} is out of range", i))),
            },
        }
    }

    fn error(&self, reason: impl Into<String>) -> CoreError {
        CoreError::InvalidPath {
            path: self.raw.clone(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

struct PathParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> PathParser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse(mut self) -> Result<JsonPath, CoreError> {
        let root = if self.peek_str("$$") {
            self.pos += 2;
            PathRoot::Context
        } else if self.peek_str("$") {
            self.pos += 1;
            PathRoot::Data
        } else {
            return Err(self.error("path must start with '$'"));
        };

        let mut segments = Vec::new();
        while let Some(c) = self.peek_char() {
            match c {
                '.' => {
                    self.pos += 1;
                    segments.push(Segment::Field(self.parse_name()?));
                }
                '[' => {
                    self.pos += 1;
                    segments.push(self.parse_bracket()?);
                }
                other => return Err(self.error(format!("unexpected character '{}'", other))),
            }
        }

        Ok(JsonPath {
            raw: self.input.to_string(),
            root,
            segments,
        })
    }

    fn parse_name(&mut self) -> Result<String, CoreError> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c == '.' || c == '[' {
                break;
            }
            self.pos += c.len_utf8();
        }

        let name = &self.input[start..self.pos];
        if name.is_empty() {
            return Err(self.error("empty field name"));
        }
        if name.contains(['*', '?', '@', ']']) {
            return Err(self.error(format!("unsupported path syntax in '{}'", name)));
        }
        Ok(name.to_string())
    }

    fn parse_bracket(&mut self) -> Result<Segment, CoreError> {
        let segment = match self.peek_char() {
            Some(quote @ ('\'' | '"')) => {
                self.pos += 1;
                let start = self.pos;
                while let Some(c) = self.peek_char() {
                    if c == quote {
                        break;
                    }
                    self.pos += c.len_utf8();
                }
                let name = self.input[start..self.pos].to_string();
                if self.peek_char() != Some(quote) {
                    return Err(self.error("unterminated quoted field"));
                }
                self.pos += 1;
                Segment::Field(name)
            }
            _ => {
                let start = self.pos;
                while let Some(c) = self.peek_char() {
                    if c.is_ascii_digit() {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                let digits = &self.input[start..self.pos];
                let index = digits
                    .parse::<usize>()
                    .map_err(|_| self.error("expected array index"))?;
                Segment::Index(index)
            }
        };

        if self.peek_char() != Some(']') {
            return Err(self.error("expected ']'"));
        }
        self.pos += 1;
        Ok(segment)
    }

    fn error(&self, reason: impl Into<String>) -> CoreError {
        CoreError::InvalidPath {
            path: self.input.to_string(),
            reason: reason.into(),
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_parse_segments() {
        let path = JsonPath::parse("$.order.items[2]['unit price']").unwrap();
        assert_eq!(path.root_kind(), PathRoot::Data);
        assert_eq!(
            path.segments(),
            &[
                Segment::Field("order".to_string()),
                Segment::Field("items".to_string()),
                Segment::Index(2),
                Segment::Field("unit price".to_string()),
            ]
        );
        assert_eq!(path.as_str(), "$.order.items[2]['unit price']");
    }

    #[test]
    fn test_parse_context_root() {
        let path = JsonPath::parse("$$.Map.Item.Value").unwrap();
        assert_eq!(path.root_kind(), PathRoot::Context);
        assert_eq!(path.segments().len(), 3);
    }

    #[test]
    fn test_parse_errors() {
        assert!(JsonPath::parse("").is_err());
        assert!(JsonPath::parse("a.b").is_err());
        assert!(JsonPath::parse("$.").is_err());
        assert!(JsonPath::parse("$.a[").is_err());
        assert!(JsonPath::parse("$.a[x]").is_err());
        assert!(JsonPath::parse("$.a[*]").is_err());
        assert!(JsonPath::parse("$['open").is_err());
    }

    #[test]
    fn test_get() {
        let doc = json!({"a": {"b": [10, 20, 30]}, "flag": false});
        assert_eq!(JsonPath::parse("$").unwrap().get(&doc), Some(&doc));
        assert_eq!(
            JsonPath::parse("$.a.b[1]").unwrap().get(&doc),
            Some(&json!(20))
        );
        assert_eq!(
            JsonPath::parse("$.flag").unwrap().get(&doc),
            Some(&json!(false))
        );
    }

    #[test]
    fn test_context_path_needs_context() {
        let data = json!({"Execution": {"Name": "from-data"}});
        let context = json!({"Execution": {"Name": "from-context"}});
        let path = JsonPath::parse("$$.Execution.Name").unwrap();
        assert!(path.get(&data).is_none());
        assert_eq!(path.resolve(&data, &context), Some(&json!("from-context")));

        let data_path = JsonPath::parse("$.Execution.Name").unwrap();
        assert_eq!(data_path.resolve(&data, &context), Some(&json!("from-data")));
    }

    #[test]
    fn test_get_missing_is_none() {
        let doc = json!({"a": {"b": [10]}});
        assert!(JsonPath::parse("$.x").unwrap().get(&doc).is_none());
        assert!(JsonPath::parse("$.a.b[5]").unwrap().get(&doc).is_none());
        assert!(JsonPath::parse("$.a.b.c").unwrap().get(&doc).is_none());
        assert!(JsonPath::parse("$.a[0]").unwrap().get(&doc).is_none());
    }

    #[test]
    fn test_set_creates_intermediates() {
        let mut doc = json!({"keep": 1});
        JsonPath::parse("$.result.value")
            .unwrap()
            .set(&mut doc, json!("x"))
            .unwrap();
        assert_eq!(doc, json!({"keep": 1, "result": {"value": "x"}}));
    }

    #[test]
    fn test_set_root_replaces() {
        let mut doc = json!({"keep": 1});
        JsonPath::root().set(&mut doc, json!([1, 2])).unwrap();
        assert_eq!(doc, json!([1, 2]));
    }

    #[test]
    fn test_set_array_index() {
        let mut doc = json!({"items": [1, 2, 3]});
        JsonPath::parse("$.items[1]")
            .unwrap()
            .set(&mut doc, json!("two"))
            .unwrap();
        assert_eq!(doc, json!({"items": [1, "two", 3]}));

        let result = JsonPath::parse("$.items[9]")
            .unwrap()
            .set(&mut doc, json!(0));
        assert!(matches!(result, Err(CoreError::InvalidPath { .. })));
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut doc = json!({"a": 5});
        let result = JsonPath::parse("$.a.b").unwrap().set(&mut doc, json!(1));
        assert!(result.is_err());
    }

    #[test]
    fn test_set_context_fails() {
        let mut doc = json!({});
        let result = JsonPath::parse("$$.Execution")
            .unwrap()
            .set(&mut doc, json!(1));
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn prop_set_then_get(key in "[a-zA-Z_][a-zA-Z0-9_]{0,12}", inner in "[a-z]{1,8}", n in any::<i64>()) {
            let path = JsonPath::parse(&format!("$.{}.{}", key, inner)).unwrap();
            let mut doc = json!({"other": true});
            path.set(&mut doc, json!(n)).unwrap();
            prop_assert_eq!(path.get(&doc), Some(&json!(n)));
            prop_assert_eq!(&doc["other"], &json!(true));
        }

        #[test]
        fn prop_index_in_range(len in 1usize..20, idx in 0usize..40) {
            let items: Vec<usize> = (0..len).collect();
            let doc = json!({"items": items});
            let path = JsonPath::parse(&format!("$.items[{}]", idx)).unwrap();
            if idx < len {
                prop_assert_eq!(path.get(&doc), Some(&json!(idx)));
            } else {
                prop_assert!(path.get(&doc).is_none());
            }
        }
    }
}
