//! Field-level comparison of desired and live payloads.
//!
//! Desired state is matched as a subset: every field the desired payload sets
//! must be present and equal live, while extra live fields (server defaults)
//! are ignored. Fields a previous revision set and the desired payload drops
//! count as changes while live still carries them.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use yoke_core::ResourceDocument;

/// One differing field. `None` means absent on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// JSON pointer.
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<Json>,
}

fn push_path(base: &str, key: &str) -> String {
    format!("{base}/{}", key.replace('~', "~0").replace('/', "~1"))
}

fn subset(desired: &Json, live: &Json, path: &str, out: &mut Vec<FieldChange>) {
    match (desired, live) {
        (Json::Object(d), Json::Object(l)) => {
            for (k, dv) in d {
                let p = push_path(path, k);
                match l.get(k) {
                    Some(lv) if lv == dv => {}
                    Some(lv) => subset(dv, lv, &p, out),
                    None => out.push(FieldChange { path: p, desired: Some(dv.clone()), live: None }),
                }
            }
        }
        (Json::Array(d), Json::Array(l)) if d.len() == l.len() => {
            for (i, (dv, lv)) in d.iter().zip(l).enumerate() {
                if dv != lv {
                    subset(dv, lv, &format!("{path}/{i}"), out);
                }
            }
        }
        (d, l) => {
            if d != l {
                out.push(FieldChange { path: path.to_string(), desired: Some(d.clone()), live: Some(l.clone()) });
            }
        }
    }
}

fn dropped(previous: &Json, desired: &Json, live: &Json, path: &str, out: &mut Vec<FieldChange>) {
    match (previous, desired, live) {
        (Json::Object(p), Json::Object(d), Json::Object(l)) => {
            for (k, pv) in p {
                let Some(lv) = l.get(k) else { continue };
                let path = push_path(path, k);
                match d.get(k) {
                    None => out.push(FieldChange { path, desired: None, live: Some(lv.clone()) }),
                    Some(dv) => dropped(pv, dv, lv, &path, out),
                }
            }
        }
        // Elements pair up by index only while all three sides agree on length.
        (Json::Array(p), Json::Array(d), Json::Array(l)) if p.len() == d.len() && d.len() == l.len() => {
            for (i, ((pv, dv), lv)) in p.iter().zip(d).zip(l).enumerate() {
                dropped(pv, dv, lv, &format!("{path}/{i}"), out);
            }
        }
        _ => {}
    }
}

fn exact(from: &Json, to: &Json, path: &str, out: &mut Vec<FieldChange>) {
    match (from, to) {
        (Json::Object(f), Json::Object(t)) => {
            for (k, tv) in t {
                let p = push_path(path, k);
                match f.get(k) {
                    Some(fv) if fv == tv => {}
                    Some(fv) => exact(fv, tv, &p, out),
                    None => out.push(FieldChange { path: p, desired: Some(tv.clone()), live: None }),
                }
            }
            for (k, fv) in f {
                if !t.contains_key(k) {
                    out.push(FieldChange { path: push_path(path, k), desired: None, live: Some(fv.clone()) });
                }
            }
        }
        (Json::Array(f), Json::Array(t)) if f.len() == t.len() => {
            for (i, (fv, tv)) in f.iter().zip(t).enumerate() {
                if fv != tv {
                    exact(fv, tv, &format!("{path}/{i}"), out);
                }
            }
        }
        (f, t) => {
            if f != t {
                out.push(FieldChange { path: path.to_string(), desired: Some(t.clone()), live: Some(f.clone()) });
            }
        }
    }
}

/// Field changes needed to take `live` to `desired`. Payloads are compared as given.
pub fn field_diff(desired: &Json, live: &Json, previous: Option<&Json>) -> Vec<FieldChange> {
    let mut out = Vec::new();
    subset(desired, live, "", &mut out);
    if let Some(prev) = previous {
        dropped(prev, desired, live, "", &mut out);
    }
    out
}

/// [`field_diff`] over normalized documents.
pub fn diff_documents(desired: &ResourceDocument, live: &ResourceDocument, previous: Option<&ResourceDocument>) -> Vec<FieldChange> {
    let previous = previous.map(ResourceDocument::normalized);
    field_diff(&desired.normalized(), &live.normalized(), previous.as_ref())
}

/// Two-way field diff for stored payloads, where nothing is a server default.
/// `desired` holds the `to` side and `live` the `from` side.
pub fn exact_diff(from: &Json, to: &Json) -> Vec<FieldChange> {
    let mut out = Vec::new();
    exact(from, to, "", &mut out);
    out
}
