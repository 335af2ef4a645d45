//! Merge a desired object into a live one.
//!
//! The live object carries server-populated fields (defaults, status,
//! metadata) that the desired object never sets. Merging the desired JSON
//! over the live JSON and comparing the result with the live object tells
//! whether the desired state is already in place.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Merge `desired` into `live` in place.
///
/// Objects merge key by key. Arrays of equal length merge element-wise;
/// otherwise the desired array replaces the live one. Any other desired
/// value overwrites. `null` in `desired` leaves the live value untouched.
pub fn merge_json(live: &mut Value, desired: &Value) {
    match (live, desired) {
        (_, Value::Null) => {}
        (Value::Object(live), Value::Object(desired)) => {
            for (key, value) in desired {
                match live.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        if !value.is_null() {
                            live.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
        }
        (Value::Array(live), Value::Array(desired)) if live.len() == desired.len() => {
            for (existing, value) in live.iter_mut().zip(desired) {
                merge_json(existing, value);
            }
        }
        (live, desired) => *live = desired.clone(),
    }
}

/// Result of merging a desired object into a live one.
pub struct Merged<K> {
    pub object: K,
    pub changed: bool,
}

/// Merge `desired` over `live`, reporting whether anything changed.
pub fn merge_into<K>(live: &K, desired: &K) -> Result<Merged<K>>
where
    K: Serialize + DeserializeOwned,
{
    let before = serde_json::to_value(live)?;
    let mut after = before.clone();
    merge_json(&mut after, &serde_json::to_value(desired)?);

    let changed = after != before;
    Ok(Merged {
        object: serde_json::from_value(after)?,
        changed,
    })
}
