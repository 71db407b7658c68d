//! Turns raw render output into an ordered, identified `ResourceSet`.

use serde::Deserialize;
use serde_json::Value as Json;

use crate::{Error, ResourceDocument, ResourceIdentifier, ResourceSet, Result};
use crate::{MANAGED_BY_LABEL, RELEASE_LABEL, RELEASE_NAMESPACE_LABEL, REVISION_ANNOTATION};

/// Kinds that never live in a namespace.
pub const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PersistentVolume",
    "StorageClass",
    "PriorityClass",
    "IngressClass",
    "RuntimeClass",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
    "APIService",
    "CSIDriver",
];

const SERVER_METADATA: &[&str] = &[
    "managedFields",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "uid",
    "selfLink",
    "deletionTimestamp",
];

const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Lower ranks are applied first and pruned last.
pub fn apply_rank(kind: &str) -> u8 {
    match kind {
        "CustomResourceDefinition" | "Namespace" => 0,
        _ => 1,
    }
}

/// Decode a render stream: JSON (array, object, or concatenated values) or
/// YAML multi-document. Arrays are flattened one level and `kind: List`
/// wrappers are unwrapped. Empty output yields no documents.
pub fn decode_stream(raw: &[u8]) -> Result<Vec<Json>> {
    let first = raw.iter().copied().find(|b| !b.is_ascii_whitespace());
    let Some(first) = first else { return Ok(Vec::new()) };

    let values = if first == b'[' || first == b'{' {
        match decode_json(raw) {
            Ok(v) => v,
            Err(json_err) => decode_yaml(raw).map_err(|_| Error::DecodeFailure(json_err))?,
        }
    } else {
        decode_yaml(raw).map_err(Error::DecodeFailure)?
    };

    let mut out = Vec::with_capacity(values.len());
    for v in values {
        flatten_into(v, &mut out, 0);
    }
    Ok(out)
}

fn decode_json(raw: &[u8]) -> std::result::Result<Vec<Json>, String> {
    serde_json::Deserializer::from_slice(raw)
        .into_iter::<Json>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid JSON: {e}"))
}

fn decode_yaml(raw: &[u8]) -> std::result::Result<Vec<Json>, String> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_slice(raw) {
        let v = Json::deserialize(doc).map_err(|e| format!("invalid YAML: {e}"))?;
        out.push(v);
    }
    Ok(out)
}

fn flatten_into(v: Json, out: &mut Vec<Json>, depth: usize) {
    match v {
        Json::Null => {}
        Json::Array(items) if depth < 2 => {
            for item in items { flatten_into(item, out, depth + 1); }
        }
        Json::Object(mut obj)
            if obj.get("kind").and_then(Json::as_str) == Some("List") && obj.get("items").is_some_and(Json::is_array) =>
        {
            if let Some(Json::Array(items)) = obj.remove("items") {
                for item in items { flatten_into(item, out, depth + 1); }
            }
        }
        other => out.push(other),
    }
}

/// Identifier of a manifest. Requires apiVersion, kind and metadata.name.
pub fn identify(payload: &Json) -> Result<ResourceIdentifier> {
    identify_at(payload, 0)
}

fn identify_at(payload: &Json, index: usize) -> Result<ResourceIdentifier> {
    let invalid = |reason: &str| Error::InvalidResource { index, reason: reason.to_string() };
    if !payload.is_object() {
        return Err(invalid("document is not an object"));
    }
    let api_version = payload.get("apiVersion").and_then(Json::as_str).filter(|s| !s.is_empty()).ok_or_else(|| invalid("missing apiVersion"))?;
    let kind = payload.get("kind").and_then(Json::as_str).filter(|s| !s.is_empty()).ok_or_else(|| invalid("missing kind"))?;
    let meta = payload.get("metadata");
    let name = meta.and_then(|m| m.get("name")).and_then(Json::as_str).filter(|s| !s.is_empty()).ok_or_else(|| invalid("missing metadata.name"))?;
    let namespace = meta.and_then(|m| m.get("namespace")).and_then(Json::as_str).unwrap_or("");
    Ok(ResourceIdentifier::new(name, namespace, kind, api_version))
}

/// Assign namespaces, identify, check uniqueness and order for apply.
///
/// Namespaced kinds without a namespace get `default_namespace`; cluster-scoped
/// kinds have any namespace cleared. The sort is stable, so render order is
/// kept within each apply rank.
pub fn normalize(docs: Vec<Json>, default_namespace: &str) -> Result<ResourceSet> {
    let mut out = Vec::with_capacity(docs.len());
    for (index, mut doc) in docs.into_iter().enumerate() {
        let kind = doc.get("kind").and_then(Json::as_str).map(str::to_string);
        if let (Some(kind), Some(obj)) = (kind, doc.as_object_mut()) {
            if let Some(meta) = obj.get_mut("metadata").and_then(Json::as_object_mut) {
                if is_cluster_scoped(&kind) {
                    meta.remove("namespace");
                } else if meta.get("namespace").and_then(Json::as_str).map_or(true, str::is_empty) {
                    meta.insert("namespace".into(), Json::String(default_namespace.to_string()));
                }
            }
        }
        let id = identify_at(&doc, index)?;
        out.push(ResourceDocument { id, payload: doc });
    }
    let set = ResourceSet::from_documents(out)?;
    let mut docs: Vec<ResourceDocument> = set.into();
    docs.sort_by_key(|d| apply_rank(d.id.kind()));
    ResourceSet::from_documents(docs)
}

/// `decode_stream` followed by `normalize`.
pub fn decode_and_normalize(raw: &[u8], default_namespace: &str) -> Result<ResourceSet> {
    normalize(decode_stream(raw)?, default_namespace)
}

/// Copy of `v` without server-populated fields and ownership stamps.
pub fn strip_server_fields(v: &Json) -> Json {
    let mut v = v.clone();
    if let Some(obj) = v.as_object_mut() {
        // Status is server-populated; ignore it during diffs
        obj.remove("status");
        if let Some(meta) = obj.get_mut("metadata").and_then(Json::as_object_mut) {
            for key in SERVER_METADATA { meta.remove(*key); }
            prune_map(meta, "labels", &[MANAGED_BY_LABEL, RELEASE_LABEL, RELEASE_NAMESPACE_LABEL]);
            prune_map(meta, "annotations", &[REVISION_ANNOTATION, LAST_APPLIED]);
        }
    }
    v
}

fn prune_map(meta: &mut serde_json::Map<String, Json>, field: &str, keys: &[&str]) {
    let empty = match meta.get_mut(field).and_then(Json::as_object_mut) {
        Some(map) => {
            for k in keys { map.remove(*k); }
            map.is_empty()
        }
        None => false,
    };
    if empty { meta.remove(field); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_json_array_concatenation_and_yaml() {
        let arr = br#"[{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"a"}}, [{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"b"}}]]"#;
        assert_eq!(decode_stream(arr).unwrap().len(), 2);

        let concat = b"{\"kind\":\"A\"}\n{\"kind\":\"B\"}\n";
        assert_eq!(decode_stream(concat).unwrap().len(), 2);

        let yaml = b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: b\n---\n";
        let docs = decode_stream(yaml).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["kind"], "Secret");

        let list = br#"{"kind":"List","apiVersion":"v1","items":[{"kind":"A"},{"kind":"B"},{"kind":"C"}]}"#;
        assert_eq!(decode_stream(list).unwrap().len(), 3);
    }

    #[test]
    fn empty_output_is_an_empty_set() {
        assert!(decode_stream(b"").unwrap().is_empty());
        assert!(decode_stream(b"  \n\t").unwrap().is_empty());
        assert!(decode_stream(b"[]").unwrap().is_empty());
        assert!(decode_and_normalize(b"null", "default").unwrap().is_empty());
    }

    #[test]
    fn garbage_is_a_decode_failure() {
        let err = decode_stream(b"{not json").unwrap_err();
        assert!(matches!(err, Error::DecodeFailure(_)), "err={err}");
    }

    #[test]
    fn rejects_missing_kind_or_api_version() {
        let err = normalize(vec![json!({"kind": "ConfigMap", "metadata": {"name": "x"}})], "ns").unwrap_err();
        assert!(err.to_string().contains("missing apiVersion"), "err={err}");
        let err = normalize(vec![json!({"apiVersion": "v1", "metadata": {"name": "x"}})], "ns").unwrap_err();
        assert!(err.to_string().contains("missing kind"), "err={err}");
        let err = normalize(vec![json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}})], "ns").unwrap_err();
        assert!(err.to_string().contains("missing metadata.name"), "err={err}");
    }

    #[test]
    fn duplicates_are_ambiguous_not_last_wins() {
        let docs = vec![
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x"}, "data": {"a": "1"}}),
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x", "namespace": "ns"}, "data": {"a": "2"}}),
        ];
        // Both land in "ns" once the default namespace is applied.
        assert!(matches!(normalize(docs, "ns"), Err(Error::AmbiguousResource(_))));
    }

    #[test]
    fn one_object_under_two_api_versions_is_ambiguous() {
        let docs = vec![
            json!({"apiVersion": "autoscaling/v1", "kind": "HorizontalPodAutoscaler", "metadata": {"name": "h"}}),
            json!({"apiVersion": "autoscaling/v2", "kind": "HorizontalPodAutoscaler", "metadata": {"name": "h"}}),
        ];
        match normalize(docs, "ns") {
            Err(Error::AmbiguousResource(id)) => assert_eq!(id.api_version(), "autoscaling/v2"),
            other => panic!("unexpected {other:?}"),
        }

        // Same kind name in different groups is fine.
        let docs = vec![
            json!({"apiVersion": "a.example.com/v1", "kind": "Widget", "metadata": {"name": "w"}}),
            json!({"apiVersion": "b.example.com/v1", "kind": "Widget", "metadata": {"name": "w"}}),
        ];
        assert_eq!(normalize(docs, "ns").unwrap().len(), 2);
    }

    #[test]
    fn namespaces_and_crds_go_first_and_scopes_are_fixed_up() {
        let docs = vec![
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg", "namespace": "ns-a"}}),
            json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web"}}),
            json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "ns-a", "namespace": "bogus"}}),
        ];
        let set = normalize(docs, "default").unwrap();
        let kinds: Vec<_> = set.ids().map(|i| i.kind().to_string()).collect();
        assert_eq!(kinds, vec!["Namespace", "ConfigMap", "Deployment"]);
        let ids: Vec<_> = set.ids().cloned().collect();
        assert_eq!(ids[0].namespace(), "");
        assert_eq!(ids[2].namespace(), "default");
    }

    #[test]
    fn strips_server_fields_and_ownership() {
        let live = json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {
                "name": "x", "namespace": "ns", "uid": "u", "resourceVersion": "9",
                "creationTimestamp": "2020-01-01T00:00:00Z", "managedFields": [],
                "labels": { MANAGED_BY_LABEL: "yoke", RELEASE_LABEL: "r", RELEASE_NAMESPACE_LABEL: "ns", "app": "x" },
                "annotations": { REVISION_ANNOTATION: "3" }
            },
            "status": { "phase": "x" },
            "data": { "k": "v" }
        });
        let s = strip_server_fields(&live);
        assert_eq!(s, json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "x", "namespace": "ns", "labels": { "app": "x" } },
            "data": { "k": "v" }
        }));
    }
}
