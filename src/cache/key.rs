//! Stable hashing of composite lookup parameters into storage keys.

use serde_json::Value;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Separator placed between parts before hashing (ASCII unit separator).
const PART_SEPARATOR: char = '\u{1f}';

/// Compute a storage key from an ordered list of lookup parts.
///
/// Strings, numbers and booleans are rendered directly, `null` becomes the
/// empty string and arrays/objects are JSON encoded. Object keys serialize in
/// sorted order, but callers are still responsible for passing the parts
/// themselves in a canonical order.
///
/// ```ignore
/// let key = compute_key(&[json!("json"), json!("/Items"), json!({ "UserId": "u1" })]);
/// assert_eq!(key.len(), 8);
/// ```
pub fn compute_key(parts: &[Value]) -> String {
  let joined = parts
    .iter()
    .map(render_part)
    .collect::<Vec<_>>()
    .join(&PART_SEPARATOR.to_string());

  format!("{:08x}", fnv1a_32(joined.as_bytes()))
}

fn render_part(part: &Value) -> String {
  match part {
    Value::Null => String::new(),
    Value::String(s) => s.clone(),
    Value::Bool(b) => b.to_string(),
    Value::Number(n) => n.to_string(),
    structured => structured.to_string(),
  }
}

/// 32-bit FNV-1a over raw bytes.
fn fnv1a_32(bytes: &[u8]) -> u32 {
  bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
    (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
  })
}
