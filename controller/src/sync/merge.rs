//! Merge builds JSON merge patches (RFC 7386) between two snapshots of the
//! same object.
//!
//! The `json-patch` crate only applies merge patches; building one from a
//! before/after pair is done here. Deleted keys become explicit `null`
//! members so the apply removes them.

use serde_json::Value;

/// Create_merge_patch computes the patch turning `old` into `new`.
///
/// Equal documents produce an empty object. Arrays and scalars are replaced
/// wholesale, objects recurse.
pub fn create_merge_patch(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(o), Value::Object(n)) => {
            let mut patch = serde_json::Map::new();
            for (k, ov) in o {
                match n.get(k) {
                    None => {
                        patch.insert(k.clone(), Value::Null);
                    }
                    Some(nv) if nv != ov => {
                        if ov.is_object() && nv.is_object() {
                            let sub = create_merge_patch(ov, nv);
                            if !is_empty(&sub) {
                                patch.insert(k.clone(), sub);
                            }
                        } else {
                            patch.insert(k.clone(), nv.clone());
                        }
                    }
                    Some(_) => (),
                }
            }
            for (k, nv) in n {
                if !o.contains_key(k) {
                    patch.insert(k.clone(), nv.clone());
                }
            }
            Value::Object(patch)
        }
        _ if old == new => Value::Object(Default::default()),
        _ => new.clone(),
    }
}

/// Is_empty reports whether a patch would change nothing.
pub fn is_empty(patch: &Value) -> bool {
    patch.as_object().is_some_and(|m| m.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_documents_produce_empty_patch() {
        let doc = json!({"spec": {"a": 1, "b": [1, 2]}});
        let patch = create_merge_patch(&doc, &doc);
        assert!(is_empty(&patch));
    }

    #[test]
    fn changed_and_added_fields() {
        let old = json!({"spec": {"cronSpec": "* * *", "image": "ubuntu:latest"}});
        let new = json!({"spec": {"cronSpec": "* * *", "image": "debian:12", "extra": true}});
        let patch = create_merge_patch(&old, &new);
        assert_eq!(patch, json!({"spec": {"image": "debian:12", "extra": true}}));
    }

    #[test]
    fn removed_fields_become_null() {
        let old = json!({"spec": {"a": 1, "b": 2}});
        let new = json!({"spec": {"a": 1}});
        let patch = create_merge_patch(&old, &new);
        assert_eq!(patch, json!({"spec": {"b": null}}));
    }

    #[test]
    fn arrays_replace_wholesale() {
        let old = json!({"spec": {"list": [1, 2, 3]}});
        let new = json!({"spec": {"list": [1, 3]}});
        let patch = create_merge_patch(&old, &new);
        assert_eq!(patch, json!({"spec": {"list": [1, 3]}}));
    }

    #[test]
    fn patch_applies_cleanly() {
        // The patch fed back through the crate's merge must reproduce `new`.
        let old = json!({"spec": {"a": 1, "b": {"c": 2, "d": 3}}, "top": "x"});
        let new = json!({"spec": {"a": 9, "b": {"c": 2}}, "other": true});
        let patch = create_merge_patch(&old, &new);
        let mut doc = old.clone();
        json_patch::merge(&mut doc, &patch);
        assert_eq!(doc, new);
    }

    #[test]
    fn patch_preserves_untracked_destination_fields() {
        // A field the source never set (locally defaulted) survives a patch
        // built from source snapshots alone.
        let last = json!({"spec": {"image": "ubuntu:latest"}});
        let current = json!({"spec": {"image": "debian:12"}});
        let patch = create_merge_patch(&last, &current);
        let mut dest = json!({"spec": {"image": "ubuntu:latest", "cronSpec": "locally-defaulted"}});
        json_patch::merge(&mut dest, &patch);
        assert_eq!(
            dest,
            json!({"spec": {"image": "debian:12", "cronSpec": "locally-defaulted"}}),
        );
    }
}
