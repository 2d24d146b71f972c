use std::collections::HashMap;

use memdex_error::{MemdexError, Result};
use memdex_types::{DocNode, TagsMatcher, Variant};

// Node type bits of a ctag (low 3 bits; the tag id sits above them).
const TAG_NULL: u64 = 0;
const TAG_BOOL: u64 = 1;
const TAG_INT: u64 = 2;
const TAG_DOUBLE: u64 = 3;
const TAG_STRING: u64 = 4;
const TAG_OBJECT: u64 = 5;
const TAG_ARRAY: u64 = 6;
const TAG_END: u64 = 7;

// ---------------------------------------------------------------------------
// Varint primitives
// ---------------------------------------------------------------------------

fn put_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn get_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut out = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| MemdexError::parse_json("truncated cjson varint"))?;
        *pos += 1;
        out |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(out);
        }
        shift += 7;
        if shift > 63 {
            return Err(MemdexError::parse_json("cjson varint overflow"));
        }
    }
}

const fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

const fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a document to CJSON with its tag dictionary delta embedded.
///
/// The header lists every `(tag, name)` the document references, so a
/// decoder with a diverged dictionary can remap tags while merging the
/// names into its own tagsmatcher.
#[must_use]
pub fn encode(doc: &DocNode, tm: &TagsMatcher) -> Vec<u8> {
    let mut used = Vec::new();
    collect_tags(doc, &mut used);
    used.sort_unstable();
    used.dedup();

    let mut out = Vec::new();
    put_varint(&mut out, used.len() as u64);
    for tag in used {
        put_varint(&mut out, u64::from(tag));
        let name = tm.tag2name(tag).unwrap_or("");
        put_varint(&mut out, name.len() as u64);
        out.extend_from_slice(name.as_bytes());
    }
    encode_node(&mut out, doc, 0);
    out
}

fn collect_tags(node: &DocNode, out: &mut Vec<u32>) {
    match node {
        DocNode::Object(members) => {
            for (tag, child) in members {
                out.push(*tag);
                collect_tags(child, out);
            }
        }
        DocNode::Array(items) => {
            for item in items {
                collect_tags(item, out);
            }
        }
        DocNode::Scalar(_) | DocNode::Empty => {}
    }
}

fn ctag(kind: u64, tag: u32) -> u64 {
    kind | (u64::from(tag) << 3)
}

fn encode_node(out: &mut Vec<u8>, node: &DocNode, tag: u32) {
    match node {
        DocNode::Empty => put_varint(out, ctag(TAG_NULL, tag)),
        DocNode::Scalar(value) => encode_scalar(out, value, tag),
        DocNode::Array(items) => {
            put_varint(out, ctag(TAG_ARRAY, tag));
            put_varint(out, items.len() as u64);
            for item in items {
                encode_node(out, item, 0);
            }
        }
        DocNode::Object(members) => {
            put_varint(out, ctag(TAG_OBJECT, tag));
            for (member_tag, child) in members {
                encode_node(out, child, *member_tag);
            }
            put_varint(out, ctag(TAG_END, 0));
        }
    }
}

fn encode_scalar(out: &mut Vec<u8>, value: &Variant, tag: u32) {
    match value {
        Variant::Null => put_varint(out, ctag(TAG_NULL, tag)),
        Variant::Bool(v) => {
            put_varint(out, ctag(TAG_BOOL, tag));
            out.push(u8::from(*v));
        }
        Variant::Int(v) => {
            put_varint(out, ctag(TAG_INT, tag));
            put_varint(out, zigzag(i64::from(*v)));
        }
        Variant::Int64(v) => {
            put_varint(out, ctag(TAG_INT, tag));
            put_varint(out, zigzag(*v));
        }
        Variant::Double(v) => {
            put_varint(out, ctag(TAG_DOUBLE, tag));
            out.extend_from_slice(&v.to_le_bytes());
        }
        Variant::String(v) => {
            put_varint(out, ctag(TAG_STRING, tag));
            put_varint(out, v.len() as u64);
            out.extend_from_slice(v.as_bytes());
        }
        // Composite and tuple values never appear in documents.
        Variant::Tuple(_) | Variant::Composite(_) => put_varint(out, ctag(TAG_NULL, tag)),
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a CJSON document, merging its tag dictionary into `tm` and
/// remapping tags to the local ids.
pub fn decode(buf: &[u8], tm: &mut TagsMatcher) -> Result<DocNode> {
    let mut pos = 0usize;
    let dict_len = get_varint(buf, &mut pos)?;
    let mut remap: HashMap<u32, u32> = HashMap::new();
    for _ in 0..dict_len {
        let remote_tag = get_varint(buf, &mut pos)? as u32;
        let name_len = get_varint(buf, &mut pos)? as usize;
        let name = std::str::from_utf8(
            buf.get(pos..pos + name_len)
                .ok_or_else(|| MemdexError::parse_json("truncated cjson dictionary"))?,
        )
        .map_err(|_| MemdexError::parse_json("invalid utf-8 in cjson tag name"))?;
        pos += name_len;
        remap.insert(remote_tag, tm.name2tag_or_add(name));
    }
    let (node, _) = decode_node(buf, &mut pos, &remap)?;
    Ok(node)
}

fn decode_node(
    buf: &[u8],
    pos: &mut usize,
    remap: &HashMap<u32, u32>,
) -> Result<(DocNode, Option<u32>)> {
    let ctag = get_varint(buf, pos)?;
    let kind = ctag & 0x7;
    let remote_tag = (ctag >> 3) as u32;
    let tag = remap.get(&remote_tag).copied().unwrap_or(remote_tag);
    let node = match kind {
        TAG_NULL => DocNode::Scalar(Variant::Null),
        TAG_BOOL => {
            let byte = *buf
                .get(*pos)
                .ok_or_else(|| MemdexError::parse_json("truncated cjson bool"))?;
            *pos += 1;
            DocNode::Scalar(Variant::Bool(byte != 0))
        }
        TAG_INT => DocNode::Scalar(Variant::Int64(unzigzag(get_varint(buf, pos)?))),
        TAG_DOUBLE => {
            let bytes: [u8; 8] = buf
                .get(*pos..*pos + 8)
                .ok_or_else(|| MemdexError::parse_json("truncated cjson double"))?
                .try_into()
                .expect("slice of 8");
            *pos += 8;
            DocNode::Scalar(Variant::Double(f64::from_le_bytes(bytes)))
        }
        TAG_STRING => {
            let len = get_varint(buf, pos)? as usize;
            let s = std::str::from_utf8(
                buf.get(*pos..*pos + len)
                    .ok_or_else(|| MemdexError::parse_json("truncated cjson string"))?,
            )
            .map_err(|_| MemdexError::parse_json("invalid utf-8 in cjson string"))?;
            *pos += len;
            DocNode::Scalar(Variant::string(s))
        }
        TAG_ARRAY => {
            let count = get_varint(buf, pos)? as usize;
            let mut items = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                items.push(decode_node(buf, pos, remap)?.0);
            }
            DocNode::Array(items)
        }
        TAG_OBJECT => {
            let mut members = Vec::new();
            loop {
                let save = *pos;
                let next = get_varint(buf, pos)?;
                if next & 0x7 == TAG_END {
                    break;
                }
                *pos = save;
                let (child, child_tag) = decode_node(buf, pos, remap)?;
                members.push((child_tag.unwrap_or(0), child));
            }
            DocNode::Object(members)
        }
        other => {
            return Err(MemdexError::parse_json(format!(
                "unknown cjson node type {other}"
            )))
        }
    };
    Ok((node, Some(tag)))
}

// ---------------------------------------------------------------------------
// JSON bridge
// ---------------------------------------------------------------------------

/// Build a document tree from parsed JSON, allocating tags as needed.
pub fn doc_from_json(value: &serde_json::Value, tm: &mut TagsMatcher) -> DocNode {
    match value {
        serde_json::Value::Null => DocNode::Scalar(Variant::Null),
        serde_json::Value::Bool(v) => DocNode::Scalar(Variant::Bool(*v)),
        serde_json::Value::Number(v) => {
            if let Some(i) = v.as_i64() {
                DocNode::Scalar(Variant::Int64(i))
            } else {
                DocNode::Scalar(Variant::Double(v.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(v) => DocNode::Scalar(Variant::string(v)),
        serde_json::Value::Array(items) => {
            DocNode::Array(items.iter().map(|v| doc_from_json(v, tm)).collect())
        }
        serde_json::Value::Object(members) => DocNode::Object(
            members
                .iter()
                .map(|(name, v)| (tm.name2tag_or_add(name), doc_from_json(v, tm)))
                .collect(),
        ),
    }
}

/// Render a document tree back to JSON.
pub fn doc_to_json(node: &DocNode, tm: &TagsMatcher) -> serde_json::Value {
    match node {
        DocNode::Empty => serde_json::Value::Null,
        DocNode::Scalar(v) => match v {
            Variant::Null => serde_json::Value::Null,
            Variant::Bool(b) => serde_json::Value::Bool(*b),
            Variant::Int(i) => serde_json::Value::from(*i),
            Variant::Int64(i) => serde_json::Value::from(*i),
            Variant::Double(d) => serde_json::Value::from(*d),
            Variant::String(s) => serde_json::Value::String(s.to_string()),
            Variant::Tuple(_) | Variant::Composite(_) => serde_json::Value::Null,
        },
        DocNode::Array(items) => {
            serde_json::Value::Array(items.iter().map(|n| doc_to_json(n, tm)).collect())
        }
        DocNode::Object(members) => {
            let mut map = serde_json::Map::new();
            for (tag, child) in members {
                let name = tm.tag2name(*tag).unwrap_or("?").to_owned();
                map.insert(name, doc_to_json(child, tm));
            }
            serde_json::Value::Object(map)
        }
    }
}
