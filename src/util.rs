use once_cell::sync::Lazy;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::{Captures, Regex};
use serde_json::{Map, Value};

static ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[0-9]+|#[xX][0-9a-fA-F]+|[A-Za-z][A-Za-z0-9]*);").expect("entity regex is valid"));

fn resolve_entity(name: &str) -> Option<String> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse::<u32>().ok()?,
        };
        return char::from_u32(code).map(String::from);
    }
    let ch = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        _ => return None,
    };
    Some(ch.to_string())
}

/// Decode HTML/XML character references (`&amp;`, `&#x27;`, ...).
/// Each reference is decoded on its own; a bare `&` or an unknown entity is
/// left untouched.
pub fn decode_html_entities(text: &str) -> String {
    ENTITY
        .replace_all(text, |caps: &Captures| {
            resolve_entity(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Loose numeric view of a JSON value: numbers, numeric strings and booleans.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Convert an XML document into JSON.
///
/// Elements become objects; attributes are stored under `@name`, text under
/// `#text`, repeated children collapse into arrays, and an element that only
/// holds text becomes a plain string.
pub fn xml_to_json(xml: &str) -> Result<Value, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    // (element name, children/attributes, accumulated text)
    let mut stack: Vec<(String, Map<String, Value>, String)> =
        vec![(String::new(), Map::new(), String::new())];

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let (name, attrs) = open_element(&e)?;
                stack.push((name, attrs, String::new()));
            }
            Ok(Event::Empty(e)) => {
                let (name, attrs) = open_element(&e)?;
                let value = finish_element(attrs, String::new());
                if let Some(parent) = stack.last_mut() {
                    insert_child(&mut parent.1, name, value);
                }
            }
            Ok(Event::End(_)) => {
                if stack.len() < 2 {
                    return Err("unbalanced closing tag".to_string());
                }
                if let Some((name, attrs, text)) = stack.pop() {
                    let value = finish_element(attrs, text);
                    if let Some(parent) = stack.last_mut() {
                        insert_child(&mut parent.1, name, value);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map_err(|e| e.to_string())?;
                if let Some(top) = stack.last_mut() {
                    top.2.push_str(&text);
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(top) = stack.last_mut() {
                    top.2.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err("unexpected end of document".to_string());
    }
    let (_, root, _) = stack.remove(0);
    if root.is_empty() {
        return Err("document has no root element".to_string());
    }
    Ok(Value::Object(root))
}

fn open_element(e: &BytesStart<'_>) -> Result<(String, Map<String, Value>), String> {
    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
    let mut attrs = Map::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
        let value = attr.unescape_value().map_err(|e| e.to_string())?;
        attrs.insert(key, Value::String(value.into_owned()));
    }
    Ok((name, attrs))
}

fn finish_element(mut map: Map<String, Value>, text: String) -> Value {
    if map.is_empty() {
        return Value::String(text);
    }
    if !text.is_empty() {
        map.insert("#text".to_string(), Value::String(text));
    }
    Value::Object(map)
}

fn insert_child(parent: &mut Map<String, Value>, name: String, value: Value) {
    match parent.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            parent.insert(name, value);
        }
    }
}
