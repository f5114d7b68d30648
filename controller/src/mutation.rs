//! Mutation applies the ordered, user-declared transforms of a
//! PublishedResource over a JSON document.
//!
//! Mutations are functions: the same input document and context always yield
//! the same output. The spec and status chains of a publication are
//! independent and each chain feeds the output of one step into the next.

use serde_json::Value;

use api::v1alpha1::{
    RegularExpression, ResourceMutation, ResourceMutationRegex, ResourceMutationTemplate,
};

use crate::{Error, Result};

/// MutationContext exposes both sides of the sync to template mutations.
#[derive(Clone, Copy, Debug, Default)]
pub struct MutationContext<'a> {
    /// The service-side object, if it exists yet.
    pub local_object: Option<&'a Value>,
    /// The platform-side object.
    pub remote_object: Option<&'a Value>,
}

/// Apply runs the mutation chain over the document and returns the result.
pub fn apply(mutations: &[ResourceMutation], doc: &Value, ctx: &MutationContext) -> Result<Value> {
    let mut doc = doc.clone();
    for m in mutations {
        apply_one(m, &mut doc, ctx)?;
    }
    Ok(doc)
}

fn apply_one(m: &ResourceMutation, doc: &mut Value, ctx: &MutationContext) -> Result<()> {
    match (&m.regex, &m.template, &m.delete) {
        (Some(rx), None, None) => apply_regex(rx, doc),
        (None, Some(tpl), None) => apply_template(tpl, doc, ctx),
        (None, None, Some(del)) => delete_path(doc, &del.path),
        _ => Err(Error::InvalidMutation(
            "exactly one of regex, template or delete must be set".into(),
        )),
    }
}

fn apply_regex(rx: &ResourceMutationRegex, doc: &mut Value) -> Result<()> {
    // An empty pattern turns the mutation into a plain assignment.
    if rx.pattern.is_empty() {
        return set_path(doc, &rx.path, Value::String(rx.replacement.clone()));
    }
    let re = regex::Regex::new(&rx.pattern)?;
    let cur = get_path(doc, &rx.path).cloned().unwrap_or(Value::Null);
    let s = coerce_string(&cur);
    let out = re.replace_all(&s, rx.replacement.as_str()).into_owned();
    set_path(doc, &rx.path, Value::String(out))
}

fn apply_template(
    tpl: &ResourceMutationTemplate,
    doc: &mut Value,
    ctx: &MutationContext,
) -> Result<()> {
    let cur = get_path(doc, &tpl.path).cloned().unwrap_or(Value::Null);
    let mut tctx = tera::Context::new();
    tctx.insert("value", &cur);
    tctx.insert("localObject", ctx.local_object.unwrap_or(&Value::Null));
    tctx.insert("remoteObject", ctx.remote_object.unwrap_or(&Value::Null));
    let out = tera::Tera::one_off(&tpl.template, &tctx, false)?;
    let out = out.trim();
    // Rendered output that looks like a JSON container is decoded, so a
    // template can replace a string with an object or array.
    let val = if out.starts_with('{') || out.starts_with('[') {
        serde_json::from_str(out).unwrap_or_else(|_| Value::String(out.to_string()))
    } else {
        Value::String(out.to_string())
    };
    set_path(doc, &tpl.path, val)
}

/// Rewrite applies a [RegularExpression] to one input value.
///
/// An empty pattern replaces the input with the literal replacement.
pub fn rewrite(rx: &RegularExpression, input: &str) -> Result<String> {
    if rx.pattern.is_empty() {
        return Ok(rx.replacement.clone());
    }
    let re = regex::Regex::new(&rx.pattern)?;
    Ok(re.replace_all(input, rx.replacement.as_str()).into_owned())
}

fn coerce_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Get_path reads the value at a dotted path, descending through objects by
/// key and arrays by index.
pub fn get_path<'v>(doc: &'v Value, path: &str) -> Option<&'v Value> {
    let mut cur = doc;
    for seg in path.split('.') {
        cur = match cur {
            Value::Object(map) => map.get(seg)?,
            Value::Array(arr) => arr.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Set_path writes the value at a dotted path, creating intermediate objects
/// as needed. Array segments must address an existing index or the one just
/// past the end.
pub fn set_path(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    if path.is_empty() {
        return Err(Error::InvalidMutation("empty path".into()));
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut cur = doc;
    for (i, seg) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        if last {
            return match cur {
                Value::Object(map) => {
                    map.insert((*seg).to_string(), value);
                    Ok(())
                }
                Value::Array(arr) => {
                    let idx = parse_index(seg, path)?;
                    if idx < arr.len() {
                        arr[idx] = value;
                    } else if idx == arr.len() {
                        arr.push(value);
                    } else {
                        return Err(Error::InvalidMutation(format!(
                            "index {idx} out of bounds in path {path:?}"
                        )));
                    }
                    Ok(())
                }
                _ => Err(Error::InvalidMutation(format!(
                    "cannot write {seg:?} into a non-container value in path {path:?}"
                ))),
            };
        }
        cur = match cur {
            Value::Object(map) => map
                .entry((*seg).to_string())
                .or_insert_with(|| Value::Object(Default::default())),
            Value::Array(arr) => {
                let idx = parse_index(seg, path)?;
                arr.get_mut(idx).ok_or_else(|| {
                    Error::InvalidMutation(format!("index {idx} out of bounds in path {path:?}"))
                })?
            }
            _ => {
                return Err(Error::InvalidMutation(format!(
                    "cannot descend into a non-container value at {seg:?} in path {path:?}"
                )))
            }
        };
    }
    unreachable!("the last segment returns")
}

/// Delete_path removes the addressed element. A missing path is a no-op.
pub fn delete_path(doc: &mut Value, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::InvalidMutation("empty path".into()));
    }
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments.split_last().expect("path is non-empty");
    let mut cur = doc;
    for seg in parents {
        cur = match cur {
            Value::Object(map) => match map.get_mut(*seg) {
                Some(v) => v,
                None => return Ok(()),
            },
            Value::Array(arr) => {
                let idx = parse_index(seg, path)?;
                match arr.get_mut(idx) {
                    Some(v) => v,
                    None => return Ok(()),
                }
            }
            _ => return Ok(()),
        };
    }
    match cur {
        Value::Object(map) => {
            map.remove(*last);
        }
        Value::Array(arr) => {
            let idx = parse_index(last, path)?;
            if idx < arr.len() {
                arr.remove(idx);
            }
        }
        _ => (),
    }
    Ok(())
}

fn parse_index(seg: &str, path: &str) -> Result<usize> {
    seg.parse::<usize>().map_err(|_| {
        Error::InvalidMutation(format!("segment {seg:?} in path {path:?} is not an array index"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use api::v1alpha1::{ResourceMutationDelete, ResourceMutationRegex, ResourceMutationTemplate};

    fn regex(path: &str, pattern: &str, replacement: &str) -> ResourceMutation {
        ResourceMutation {
            regex: Some(ResourceMutationRegex {
                path: path.into(),
                pattern: pattern.into(),
                replacement: replacement.into(),
            }),
            ..Default::default()
        }
    }

    fn template(path: &str, body: &str) -> ResourceMutation {
        ResourceMutation {
            template: Some(ResourceMutationTemplate {
                path: path.into(),
                template: body.into(),
            }),
            ..Default::default()
        }
    }

    fn delete(path: &str) -> ResourceMutation {
        ResourceMutation {
            delete: Some(ResourceMutationDelete { path: path.into() }),
            ..Default::default()
        }
    }

    #[test]
    fn empty_pattern_is_assignment() {
        let doc = json!({"spec": {"cronSpec": "* * *"}});
        let out = apply(
            &[regex("spec.cronSpec", "", "overridden")],
            &doc,
            &MutationContext::default(),
        )
        .expect("mutation applies");
        assert_eq!(out, json!({"spec": {"cronSpec": "overridden"}}));
    }

    #[test]
    fn regex_replaces_all() {
        let doc = json!({"spec": {"image": "ubuntu:latest"}});
        let out = apply(
            &[regex("spec.image", "latest", "24.04")],
            &doc,
            &MutationContext::default(),
        )
        .expect("mutation applies");
        assert_eq!(out, json!({"spec": {"image": "ubuntu:24.04"}}));
    }

    #[test]
    fn regex_coerces_numbers() {
        let doc = json!({"spec": {"replicas": 3}});
        let out = apply(
            &[regex("spec.replicas", "^3$", "many")],
            &doc,
            &MutationContext::default(),
        )
        .expect("mutation applies");
        assert_eq!(out, json!({"spec": {"replicas": "many"}}));
    }

    #[test]
    fn delete_removes_key_and_index() {
        let doc = json!({"spec": {"secret": "hunter2", "list": ["a", "b", "c"]}});
        let out = apply(
            &[delete("spec.secret"), delete("spec.list.1")],
            &doc,
            &MutationContext::default(),
        )
        .expect("mutation applies");
        assert_eq!(out, json!({"spec": {"list": ["a", "c"]}}));
        // Missing paths are a no-op.
        apply(&[delete("spec.absent.deep")], &out, &MutationContext::default())
            .expect("no-op delete");
    }

    #[test]
    fn template_sees_value_and_context() {
        let remote = json!({"metadata": {"name": "my-crontab"}});
        let doc = json!({"spec": {"cronSpec": "daily"}});
        let out = apply(
            &[template(
                "spec.cronSpec",
                "{{ value | upper }}-{{ remoteObject.metadata.name }}",
            )],
            &doc,
            &MutationContext {
                remote_object: Some(&remote),
                local_object: None,
            },
        )
        .expect("mutation applies");
        assert_eq!(out, json!({"spec": {"cronSpec": "DAILY-my-crontab"}}));
    }

    #[test]
    fn template_can_change_type() {
        let doc = json!({"spec": {"cronSpec": "daily"}});
        let out = apply(
            &[template("spec.cronSpec", r#"{"interval": "{{ value }}"}"#)],
            &doc,
            &MutationContext::default(),
        )
        .expect("mutation applies");
        assert_eq!(out, json!({"spec": {"cronSpec": {"interval": "daily"}}}));
    }

    #[test]
    fn chain_feeds_forward() {
        let doc = json!({"spec": {"cronSpec": "aaa"}});
        let out = apply(
            &[
                regex("spec.cronSpec", "a", "b"),
                regex("spec.cronSpec", "bbb", "done"),
            ],
            &doc,
            &MutationContext::default(),
        )
        .expect("mutation applies");
        assert_eq!(out, json!({"spec": {"cronSpec": "done"}}));
    }

    #[test]
    fn ambiguous_mutation_is_rejected() {
        let m = ResourceMutation {
            regex: Some(ResourceMutationRegex::default()),
            delete: Some(ResourceMutationDelete { path: "spec".into() }),
            ..Default::default()
        };
        let err = apply(&[m], &json!({}), &MutationContext::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidMutation(_)));
    }

    #[test]
    fn rewrite_rules() {
        let rx = RegularExpression {
            pattern: "".into(),
            replacement: "my-credentials".into(),
        };
        assert_eq!(rewrite(&rx, "unknown-name").expect("rewrites"), "my-credentials");

        let rx = RegularExpression {
            pattern: "^(.+)-suffix$".into(),
            replacement: "$1".into(),
        };
        assert_eq!(rewrite(&rx, "name-suffix").expect("rewrites"), "name");
    }

    #[test]
    fn set_path_creates_intermediates() {
        let mut doc = json!({});
        set_path(&mut doc, "spec.nested.value", json!(1)).expect("set succeeds");
        assert_eq!(doc, json!({"spec": {"nested": {"value": 1}}}));
    }
}
