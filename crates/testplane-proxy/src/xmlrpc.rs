// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Minimal XML-RPC codec for the local facade.
//!
//! Covers the subset the test harness speaks: scalars, arrays, structs and
//! `<nil/>`. Values map losslessly onto `serde_json::Value` for transport
//! through the proxy slots. `dateTime.iso8601` and `base64` payloads pass
//! through as strings.

use std::fmt::Write as _;

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use thiserror::Error;

/// Codec errors.
#[derive(Debug, Error)]
pub enum XmlRpcError {
    /// The document is not well-formed XML.
    #[error("XML parse error: {0}")]
    Parse(String),

    /// The document is XML but not a valid method call.
    #[error("malformed XML-RPC call: {0}")]
    Malformed(String),
}

/// An XML-RPC value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `<nil/>` extension.
    Nil,
    /// `<boolean>`.
    Bool(bool),
    /// `<int>` / `<i4>` / `<i8>`.
    Int(i64),
    /// `<double>`.
    Double(f64),
    /// `<string>` or untyped text.
    Str(String),
    /// `<array>`.
    Array(Vec<Value>),
    /// `<struct>`, member order preserved.
    Struct(Vec<(String, Value)>),
}

/// A parsed `<methodCall>`.
#[derive(Debug, Clone)]
pub struct MethodCall {
    /// Method name.
    pub method: String,
    /// Positional parameters.
    pub params: Vec<Value>,
}

#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }
}

fn parse_tree(xml: &str) -> Result<Node, XmlRpcError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack = vec![Node::default()];
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                stack.push(Node::named(&String::from_utf8_lossy(e.name().as_ref())));
            }
            Ok(Event::Empty(ref e)) => {
                let child = Node::named(&String::from_utf8_lossy(e.name().as_ref()));
                stack
                    .last_mut()
                    .expect("stack never empties before EOF")
                    .children
                    .push(child);
            }
            Ok(Event::Text(ref t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| XmlRpcError::Parse(e.to_string()))?;
                stack
                    .last_mut()
                    .expect("stack never empties before EOF")
                    .text
                    .push_str(&text);
            }
            Ok(Event::End(_)) => {
                let node = stack.pop().expect("stack never empties before EOF");
                let parent = stack
                    .last_mut()
                    .ok_or_else(|| XmlRpcError::Malformed("unbalanced end tag".to_string()))?;
                parent.children.push(node);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(XmlRpcError::Parse(e.to_string())),
        }
        buf.clear();
    }

    if stack.len() != 1 {
        return Err(XmlRpcError::Malformed("unclosed elements".to_string()));
    }
    Ok(stack.pop().expect("root checked above"))
}

fn value_from_node(node: &Node) -> Result<Value, XmlRpcError> {
    let Some(typed) = node.children.first() else {
        // Untyped <value> content defaults to string.
        return Ok(Value::Str(node.text.clone()));
    };
    let text = typed.text.trim();
    match typed.name.as_str() {
        "nil" => Ok(Value::Nil),
        "boolean" => Ok(Value::Bool(text == "1" || text.eq_ignore_ascii_case("true"))),
        "int" | "i4" | "i8" => text
            .parse()
            .map(Value::Int)
            .map_err(|_| XmlRpcError::Malformed(format!("bad integer '{}'", text))),
        "double" => text
            .parse()
            .map(Value::Double)
            .map_err(|_| XmlRpcError::Malformed(format!("bad double '{}'", text))),
        "string" => Ok(Value::Str(typed.text.clone())),
        "dateTime.iso8601" | "base64" => Ok(Value::Str(typed.text.clone())),
        "array" => {
            let data = typed
                .child("data")
                .ok_or_else(|| XmlRpcError::Malformed("array without <data>".to_string()))?;
            data.children
                .iter()
                .filter(|c| c.name == "value")
                .map(value_from_node)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        "struct" => {
            let mut members = Vec::new();
            for member in typed.children.iter().filter(|c| c.name == "member") {
                let name = member
                    .child("name")
                    .map(|n| n.text.clone())
                    .ok_or_else(|| XmlRpcError::Malformed("member without <name>".to_string()))?;
                let value = member
                    .child("value")
                    .ok_or_else(|| XmlRpcError::Malformed("member without <value>".to_string()))?;
                members.push((name, value_from_node(value)?));
            }
            Ok(Value::Struct(members))
        }
        other => Err(XmlRpcError::Malformed(format!(
            "unsupported value type '{}'",
            other
        ))),
    }
}

/// Parse a `<methodCall>` document.
pub fn parse_method_call(xml: &str) -> Result<MethodCall, XmlRpcError> {
    let tree = parse_tree(xml)?;
    let call = tree
        .child("methodCall")
        .ok_or_else(|| XmlRpcError::Malformed("missing <methodCall>".to_string()))?;
    let method = call
        .child("methodName")
        .map(|n| n.text.trim().to_string())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| XmlRpcError::Malformed("missing <methodName>".to_string()))?;

    let mut params = Vec::new();
    if let Some(param_list) = call.child("params") {
        for param in param_list.children.iter().filter(|c| c.name == "param") {
            let value = param
                .child("value")
                .ok_or_else(|| XmlRpcError::Malformed("param without <value>".to_string()))?;
            params.push(value_from_node(value)?);
        }
    }
    Ok(MethodCall { method, params })
}

fn write_value(value: &Value, out: &mut String) {
    out.push_str("<value>");
    match value {
        Value::Nil => out.push_str("<nil/>"),
        Value::Bool(b) => {
            let _ = write!(out, "<boolean>{}</boolean>", if *b { 1 } else { 0 });
        }
        Value::Int(i) => {
            let _ = write!(out, "<int>{}</int>", i);
        }
        Value::Double(d) => {
            let _ = write!(out, "<double>{}</double>", d);
        }
        Value::Str(s) => {
            let _ = write!(out, "<string>{}</string>", escape(s.as_str()));
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                write_value(item, out);
            }
            out.push_str("</data></array>");
        }
        Value::Struct(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                let _ = write!(out, "<member><name>{}</name>", escape(name.as_str()));
                write_value(member, out);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

/// Render a successful `<methodResponse>`.
pub fn render_response(value: &Value) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodResponse><params><param>");
    write_value(value, &mut out);
    out.push_str("</param></params></methodResponse>");
    out
}

/// Render a `<fault>` response.
pub fn render_fault(code: i64, message: &str) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodResponse><fault>");
    write_value(
        &Value::Struct(vec![
            ("faultCode".to_string(), Value::Int(code)),
            ("faultString".to_string(), Value::Str(message.to_string())),
        ]),
        &mut out,
    );
    out.push_str("</fault></methodResponse>");
    out
}

/// XML-RPC value -> JSON value.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Double(d) => serde_json::Number::from_f64(*d)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Struct(members) => serde_json::Value::Object(
            members
                .iter()
                .map(|(name, member)| (name.clone(), to_json(member)))
                .collect(),
        ),
    }
}

/// JSON value -> XML-RPC value.
pub fn from_json(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        serde_json::Value::Object(members) => Value::Struct(
            members
                .iter()
                .map(|(name, member)| (name.clone(), from_json(member)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_method_call_with_params() {
        let xml = r#"<?xml version="1.0"?>
            <methodCall>
              <methodName>run_keyword</methodName>
              <params>
                <param><value><string>ping</string></value></param>
                <param><value><array><data>
                  <value><int>1</int></value>
                  <value>bare text</value>
                </data></array></value></param>
                <param><value><struct>
                  <member><name>retries</name><value><i4>3</i4></value></member>
                  <member><name>strict</name><value><boolean>1</boolean></value></member>
                </struct></value></param>
              </params>
            </methodCall>"#;

        let call = parse_method_call(xml).unwrap();
        assert_eq!(call.method, "run_keyword");
        assert_eq!(call.params.len(), 3);
        assert_eq!(call.params[0], Value::Str("ping".to_string()));
        assert_eq!(
            call.params[1],
            Value::Array(vec![Value::Int(1), Value::Str("bare text".to_string())])
        );
        assert_eq!(
            call.params[2],
            Value::Struct(vec![
                ("retries".to_string(), Value::Int(3)),
                ("strict".to_string(), Value::Bool(true)),
            ])
        );
    }

    #[test]
    fn test_parse_call_without_params() {
        let xml = "<methodCall><methodName>get_keyword_names</methodName></methodCall>";
        let call = parse_method_call(xml).unwrap();
        assert_eq!(call.method, "get_keyword_names");
        assert!(call.params.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_method_call("<methodCall>").is_err());
        assert!(parse_method_call("<other/>").is_err());
        assert!(
            parse_method_call("<methodCall><methodName></methodName></methodCall>").is_err()
        );
    }

    #[test]
    fn test_render_response_escapes_text() {
        let rendered = render_response(&Value::Str("a < b & c".to_string()));
        assert!(rendered.contains("<string>a &lt; b &amp; c</string>"));
        assert!(rendered.starts_with("<?xml"));
        assert!(rendered.ends_with("</methodResponse>"));
    }

    #[test]
    fn test_render_fault_shape() {
        let rendered = render_fault(1, "endpoint gone");
        assert!(rendered.contains("<fault>"));
        assert!(rendered.contains("<name>faultCode</name><value><int>1</int></value>"));
        assert!(rendered.contains("endpoint gone"));
    }

    #[test]
    fn test_json_roundtrip() {
        let json = serde_json::json!({
            "status": "PASS",
            "return": [1, 2.5, "x", null, true],
        });
        let xml_value = from_json(&json);
        assert_eq!(to_json(&xml_value), json);
    }

    #[test]
    fn test_response_parse_render_roundtrip() {
        let value = Value::Array(vec![
            Value::Str("ping".to_string()),
            Value::Str("reboot".to_string()),
        ]);
        let rendered = render_response(&value);
        // Re-parse through the tree to confirm the rendering is well-formed.
        let tree = parse_tree(&rendered).unwrap();
        let reparsed = value_from_node(
            tree.child("methodResponse")
                .unwrap()
                .child("params")
                .unwrap()
                .child("param")
                .unwrap()
                .child("value")
                .unwrap(),
        )
        .unwrap();
        assert_eq!(reparsed, value);
    }
}
