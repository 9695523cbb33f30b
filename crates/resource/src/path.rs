//! Dotted field paths such as `Status.Phase` or `Spec.Items[2].Name`.
//!
//! Segments resolve against existing keys exactly first, then
//! case-insensitively, so the Go-style `Spec.LargeConfig` finds the JSON
//! key `largeConfig`. Keys created by a write use the lowerCamel form.

use serde_json::{Map, Value};

use crate::error::FieldPathError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self, FieldPathError> {
        if raw.trim().is_empty() {
            return Err(FieldPathError::Empty);
        }
        let malformed = |reason: &str| FieldPathError::Malformed {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        for part in raw.split('.') {
            let (key, mut rest) = match part.find('[') {
                Some(pos) => part.split_at(pos),
                None => (part, ""),
            };
            if key.is_empty() && (segments.is_empty() || rest.is_empty()) {
                return Err(malformed("empty segment"));
            }
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }
            while !rest.is_empty() {
                let close = rest.find(']').ok_or_else(|| malformed("unclosed `[`"))?;
                let index = rest[1..close]
                    .parse::<usize>()
                    .map_err(|_| malformed("index is not a non-negative integer"))?;
                segments.push(Segment::Index(index));
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(malformed("unexpected characters after `]`"));
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub(crate) fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match segment {
                Segment::Key(key) => {
                    let map = current.as_object()?;
                    map.get(resolve_key(map, key)?.as_str())?
                }
                Segment::Index(index) => current.as_array()?.get(*index)?,
            };
        }
        Some(current)
    }

    pub(crate) fn set(&self, root: &mut Value, value: Value) -> Result<(), FieldPathError> {
        set_in(root, &self.segments, value, &self.raw)
    }

    pub(crate) fn remove(&self, root: &mut Value) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut current = root;
        for segment in parents {
            current = match segment {
                Segment::Key(key) => {
                    let map = current.as_object_mut()?;
                    let resolved = resolve_key(map, key)?;
                    map.get_mut(resolved.as_str())?
                }
                Segment::Index(index) => current.as_array_mut()?.get_mut(*index)?,
            };
        }
        match last {
            Segment::Key(key) => {
                let map = current.as_object_mut()?;
                let resolved = resolve_key(map, key)?;
                map.remove(resolved.as_str())
            }
            Segment::Index(index) => {
                let items = current.as_array_mut()?;
                (*index < items.len()).then(|| items.remove(*index))
            }
        }
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn set_in(
    target: &mut Value,
    segments: &[Segment],
    value: Value,
    path: &str,
) -> Result<(), FieldPathError> {
    let Some((head, rest)) = segments.split_first() else {
        *target = value;
        return Ok(());
    };

    match head {
        Segment::Key(key) => {
            if target.is_null() {
                *target = Value::Object(Map::new());
            }
            let map = target
                .as_object_mut()
                .ok_or_else(|| FieldPathError::NotAnObject {
                    path: path.to_string(),
                    segment: key.clone(),
                })?;
            let resolved = resolve_key(map, key).unwrap_or_else(|| lower_camel(key));
            let child = map.entry(resolved).or_insert(Value::Null);
            set_in(child, rest, value, path)
        }
        Segment::Index(index) => {
            let items = target
                .as_array_mut()
                .ok_or_else(|| FieldPathError::NotAnArray {
                    path: path.to_string(),
                    index: *index,
                })?;
            let len = items.len();
            let slot = items
                .get_mut(*index)
                .ok_or_else(|| FieldPathError::IndexOutOfBounds {
                    path: path.to_string(),
                    index: *index,
                    len,
                })?;
            set_in(slot, rest, value, path)
        }
    }
}

fn resolve_key(map: &Map<String, Value>, key: &str) -> Option<String> {
    if map.contains_key(key) {
        return Some(key.to_string());
    }
    map.keys().find(|k| k.eq_ignore_ascii_case(key)).cloned()
}

/// `LargeConfig` -> `largeConfig`, `APIVersion` -> `apiVersion`, `URL` -> `url`.
pub fn lower_camel(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let upper_run = chars.iter().take_while(|c| c.is_ascii_uppercase()).count();
    let lowered = match upper_run {
        0 => return key.to_string(),
        n if n == chars.len() || n == 1 => n,
        n => {
            if chars[n].is_ascii_lowercase() {
                n - 1
            } else {
                n
            }
        }
    };
    chars
        .iter()
        .enumerate()
        .map(|(i, c)| if i < lowered { c.to_ascii_lowercase() } else { *c })
        .collect()
}

/// `phase` -> `Phase`; the inverse direction used when describing fields.
pub fn upper_camel(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_keys_and_indexes() {
        let path = FieldPath::parse("Spec.Items[2].Name").unwrap();
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("Spec".into()),
                Segment::Key("Items".into()),
                Segment::Index(2),
                Segment::Key("Name".into()),
            ]
        );
    }

    #[test]
    fn rejects_malformed_paths() {
        assert_eq!(FieldPath::parse(""), Err(FieldPathError::Empty));
        assert!(FieldPath::parse("Spec..Name").is_err());
        assert!(FieldPath::parse("Spec.Items[x]").is_err());
        assert!(FieldPath::parse("Spec.Items[1").is_err());
        assert!(FieldPath::parse("Spec.Items[1]x").is_err());
    }

    #[test]
    fn get_matches_keys_case_insensitively() {
        let doc = json!({"spec": {"largeConfig": "x", "items": [{"name": "a"}]}});
        let path = FieldPath::parse("Spec.LargeConfig").unwrap();
        assert_eq!(path.get(&doc), Some(&json!("x")));
        let path = FieldPath::parse("Spec.Items[0].Name").unwrap();
        assert_eq!(path.get(&doc), Some(&json!("a")));
        let path = FieldPath::parse("Spec.Items[3].Name").unwrap();
        assert_eq!(path.get(&doc), None);
    }

    #[test]
    fn set_creates_lower_camel_keys() {
        let mut doc = json!({});
        FieldPath::parse("Status.LastSyncTime")
            .unwrap()
            .set(&mut doc, json!("now"))
            .unwrap();
        assert_eq!(doc, json!({"status": {"lastSyncTime": "now"}}));
    }

    #[test]
    fn set_reuses_existing_key_spelling() {
        let mut doc = json!({"status": {"phase": "Pending"}});
        FieldPath::parse("Status.Phase")
            .unwrap()
            .set(&mut doc, json!("Ready"))
            .unwrap();
        assert_eq!(doc, json!({"status": {"phase": "Ready"}}));
    }

    #[test]
    fn set_through_scalar_fails() {
        let mut doc = json!({"spec": "flat"});
        let err = FieldPath::parse("Spec.Replicas")
            .unwrap()
            .set(&mut doc, json!(3))
            .unwrap_err();
        assert!(matches!(err, FieldPathError::NotAnObject { .. }));

        let mut doc = json!({"spec": {"items": []}});
        let err = FieldPath::parse("Spec.Items[0]")
            .unwrap()
            .set(&mut doc, json!(1))
            .unwrap_err();
        assert!(matches!(err, FieldPathError::IndexOutOfBounds { len: 0, .. }));
    }

    #[test]
    fn remove_returns_previous_value() {
        let mut doc = json!({"metadata": {"selfLink": "/x", "name": "a"}});
        let path = FieldPath::parse("Metadata.SelfLink").unwrap();
        assert_eq!(path.remove(&mut doc), Some(json!("/x")));
        assert_eq!(path.remove(&mut doc), None);
        assert_eq!(doc, json!({"metadata": {"name": "a"}}));
    }

    #[test]
    fn camel_case_conversions() {
        assert_eq!(lower_camel("LargeConfig"), "largeConfig");
        assert_eq!(lower_camel("APIVersion"), "apiVersion");
        assert_eq!(lower_camel("URL"), "url");
        assert_eq!(lower_camel("phase"), "phase");
        assert_eq!(upper_camel("phase"), "Phase");
        assert_eq!(upper_camel(""), "");
    }
}
