//! XML-RPC value model and envelope codec.
//!
//! Serialisation is plain string building with escaping; parsing goes
//! through a small element tree built from `quick-xml` events. Only the
//! value kinds the bus uses are supported: int, boolean, string, double,
//! base64, array, struct.

use super::WireError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use quick_xml::escape::unescape;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;

/// An XML-RPC value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Str(String),
    Double(f64),
    Base64(Vec<u8>),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Base64(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// A fault returned in a methodResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: i64,
    pub message: String,
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn push_value(value: &Value, out: &mut String) {
    out.push_str("<value>");
    match value {
        Value::Int(v) => {
            out.push_str("<int>");
            out.push_str(&v.to_string());
            out.push_str("</int>");
        }
        Value::Bool(v) => {
            out.push_str("<boolean>");
            out.push_str(if *v { "1" } else { "0" });
            out.push_str("</boolean>");
        }
        Value::Str(s) => {
            out.push_str("<string>");
            out.push_str(&escape(s));
            out.push_str("</string>");
        }
        Value::Double(v) => {
            out.push_str("<double>");
            out.push_str(&v.to_string());
            out.push_str("</double>");
        }
        Value::Base64(bytes) => {
            out.push_str("<base64>");
            out.push_str(&BASE64.encode(bytes));
            out.push_str("</base64>");
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                push_value(item, out);
            }
            out.push_str("</data></array>");
        }
        Value::Struct(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                out.push_str("<member><name>");
                out.push_str(&escape(name));
                out.push_str("</name>");
                push_value(member, out);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

/// Serialise a methodCall envelope.
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for p in params {
        out.push_str("<param>");
        push_value(p, &mut out);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

/// Serialise a successful methodResponse envelope.
pub fn encode_response(value: &Value) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodResponse><params><param>");
    push_value(value, &mut out);
    out.push_str("</param></params></methodResponse>");
    out
}

/// Serialise a fault methodResponse envelope.
pub fn encode_fault(fault: &Fault) -> String {
    let mut members = BTreeMap::new();
    members.insert("faultCode".to_string(), Value::Int(fault.code));
    members.insert("faultString".to_string(), Value::Str(fault.message.clone()));
    let mut out = String::from("<?xml version=\"1.0\"?><methodResponse><fault>");
    push_value(&Value::Struct(members), &mut out);
    out.push_str("</fault></methodResponse>");
    out
}

/// A parsed element: name, accumulated text, child elements.
#[derive(Debug, Default)]
struct Elem {
    name: String,
    text: String,
    children: Vec<Elem>,
}

impl Elem {
    fn child(&self, name: &str) -> Option<&Elem> {
        self.children.iter().find(|c| c.name == name)
    }
}

fn parse_doc(xml: &str) -> Result<Elem, WireError> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Elem> = Vec::new();
    loop {
        let event = reader
            .read_event()
            .map_err(|e| WireError::Xml(e.to_string()))?;
        match event {
            Event::Start(e) => {
                stack.push(Elem {
                    name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                    ..Elem::default()
                });
            }
            Event::Empty(e) => {
                let elem = Elem {
                    name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                    ..Elem::default()
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(elem),
                    None => return Ok(elem),
                }
            }
            Event::Text(t) => {
                let decoded = t.decode().map_err(|e| WireError::Xml(e.to_string()))?;
                let text = unescape(&decoded).map_err(|e| WireError::Xml(e.to_string()))?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Event::GeneralRef(r) => {
                let ch = match r.resolve_char_ref().map_err(|e| WireError::Xml(e.to_string()))? {
                    Some(ch) => Some(ch),
                    None => {
                        let name = r.decode().map_err(|e| WireError::Xml(e.to_string()))?;
                        match name.as_ref() {
                            "lt" => Some('<'),
                            "gt" => Some('>'),
                            "amp" => Some('&'),
                            "quot" => Some('"'),
                            "apos" => Some('\''),
                            other => {
                                return Err(WireError::Xml(format!(
                                    "unknown entity reference: {other}"
                                )))
                            }
                        }
                    }
                };
                if let (Some(ch), Some(top)) = (ch, stack.last_mut()) {
                    top.text.push(ch);
                }
            }
            Event::CData(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text
                        .push_str(&String::from_utf8_lossy(t.into_inner().as_ref()));
                }
            }
            Event::End(_) => {
                let elem = stack
                    .pop()
                    .ok_or_else(|| WireError::Xml("unbalanced end tag".into()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(elem),
                    None => return Ok(elem),
                }
            }
            Event::Eof => {
                return Err(WireError::Xml("unexpected end of document".into()));
            }
            _ => {}
        }
    }
}

fn parse_value(elem: &Elem) -> Result<Value, WireError> {
    if elem.name != "value" {
        return Err(WireError::Xml(format!("expected <value>, got <{}>", elem.name)));
    }
    // A bare <value>text</value> is a string per the XML-RPC spec.
    let Some(typed) = elem.children.first() else {
        return Ok(Value::Str(elem.text.clone()));
    };
    match typed.name.as_str() {
        "int" | "i4" | "i8" => typed
            .text
            .trim()
            .parse()
            .map(Value::Int)
            .map_err(|_| WireError::Xml(format!("bad int {:?}", typed.text))),
        "boolean" => match typed.text.trim() {
            "1" | "true" => Ok(Value::Bool(true)),
            "0" | "false" => Ok(Value::Bool(false)),
            other => Err(WireError::Xml(format!("bad boolean {other:?}"))),
        },
        "string" => Ok(Value::Str(typed.text.clone())),
        "double" => typed
            .text
            .trim()
            .parse()
            .map(Value::Double)
            .map_err(|_| WireError::Xml(format!("bad double {:?}", typed.text))),
        "base64" => {
            let compact: String = typed.text.split_whitespace().collect();
            BASE64
                .decode(compact.as_bytes())
                .map(Value::Base64)
                .map_err(|e| WireError::Xml(format!("bad base64: {e}")))
        }
        "array" => {
            let data = typed
                .child("data")
                .ok_or_else(|| WireError::Xml("array without <data>".into()))?;
            data.children.iter().map(parse_value).collect::<Result<_, _>>().map(Value::Array)
        }
        "struct" => {
            let mut members = BTreeMap::new();
            for member in &typed.children {
                if member.name != "member" {
                    continue;
                }
                let name = member
                    .child("name")
                    .map(|n| n.text.clone())
                    .ok_or_else(|| WireError::Xml("member without <name>".into()))?;
                let value = member
                    .child("value")
                    .ok_or_else(|| WireError::Xml("member without <value>".into()))?;
                members.insert(name, parse_value(value)?);
            }
            Ok(Value::Struct(members))
        }
        other => Err(WireError::Xml(format!("unsupported value type <{other}>"))),
    }
}

/// Parse a methodCall envelope into method name and parameters.
pub fn decode_call(xml: &str) -> Result<(String, Vec<Value>), WireError> {
    let doc = parse_doc(xml)?;
    if doc.name != "methodCall" {
        return Err(WireError::Xml(format!("expected <methodCall>, got <{}>", doc.name)));
    }
    let method = doc
        .child("methodName")
        .map(|m| m.text.trim().to_string())
        .ok_or_else(|| WireError::Xml("missing <methodName>".into()))?;
    let mut params = Vec::new();
    if let Some(ps) = doc.child("params") {
        for param in &ps.children {
            let value = param
                .child("value")
                .ok_or_else(|| WireError::Xml("param without <value>".into()))?;
            params.push(parse_value(value)?);
        }
    }
    Ok((method, params))
}

/// Parse a methodResponse envelope into its value or fault.
pub fn decode_response(xml: &str) -> Result<Result<Value, Fault>, WireError> {
    let doc = parse_doc(xml)?;
    if doc.name != "methodResponse" {
        return Err(WireError::Xml(format!(
            "expected <methodResponse>, got <{}>",
            doc.name
        )));
    }
    if let Some(fault) = doc.child("fault") {
        let value = fault
            .child("value")
            .ok_or_else(|| WireError::Xml("fault without <value>".into()))?;
        let Value::Struct(members) = parse_value(value)? else {
            return Err(WireError::Xml("fault value is not a struct".into()));
        };
        let code = members.get("faultCode").and_then(Value::as_int).unwrap_or(0);
        let message = members
            .get("faultString")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        return Ok(Err(Fault { code, message }));
    }
    let value = doc
        .child("params")
        .and_then(|ps| ps.children.first())
        .and_then(|p| p.child("value"))
        .ok_or_else(|| WireError::Xml("response without value".into()))?;
    Ok(Ok(parse_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_round_trip() {
        let params = vec![
            Value::Str("ancestor(bill, Y)".into()),
            Value::Int(-3),
            Value::Bool(true),
            Value::Base64(vec![0, 1, 2, 255]),
            Value::Array(vec![Value::Str("a".into()), Value::Int(1)]),
        ];
        let xml = encode_call("etb.query", &params);
        let (method, decoded) = decode_call(&xml).unwrap();
        assert_eq!(method, "etb.query");
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_response_round_trip() {
        let mut members = BTreeMap::new();
        members.insert("id".to_string(), Value::Str("abc".into()));
        members.insert("n".to_string(), Value::Int(2));
        let value = Value::Struct(members);
        let xml = encode_response(&value);
        assert_eq!(decode_response(&xml).unwrap().unwrap(), value);
    }

    #[test]
    fn test_fault_round_trip() {
        let fault = Fault {
            code: 400,
            message: "parse error: trailing input".into(),
        };
        let xml = encode_fault(&fault);
        assert_eq!(decode_response(&xml).unwrap().unwrap_err(), fault);
    }

    #[test]
    fn test_escaping() {
        let params = vec![Value::Str("a < b && c > \"d\"".into())];
        let xml = encode_call("m", &params);
        let (_, decoded) = decode_call(&xml).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_bare_value_is_string() {
        let xml = "<methodCall><methodName>m</methodName><params><param><value>plain</value></param></params></methodCall>";
        let (_, params) = decode_call(xml).unwrap();
        assert_eq!(params, vec![Value::Str("plain".into())]);
    }

    #[test]
    fn test_malformed_is_rejected() {
        assert!(decode_call("<notxmlrpc/>").is_err());
        assert!(decode_call("<methodCall><params>").is_err());
        assert!(decode_response("<methodResponse></methodResponse>").is_err());
    }
}
