use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;

use crate::kube::AppliedResourceRef;

/// Splits a YAML (or JSON) multi-document stream into non-empty objects.
pub fn manifest_documents(manifest: &[u8]) -> Result<Vec<Value>> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_slice(manifest) {
        let value = Value::deserialize(document)?;
        if value.as_object().is_some_and(|object| !object.is_empty()) {
            documents.push(value);
        }
    }
    Ok(documents)
}

fn str_field<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value.pointer(pointer).and_then(Value::as_str).unwrap_or("").trim()
}

pub fn object_ref(object: &Value, namespace_override: &str) -> AppliedResourceRef {
    let namespace = match str_field(object, "/metadata/namespace") {
        "" => namespace_override.trim(),
        namespace => namespace,
    };
    AppliedResourceRef {
        api_version: str_field(object, "/apiVersion").to_string(),
        kind: str_field(object, "/kind").to_string(),
        namespace: namespace.to_string(),
        name: str_field(object, "/metadata/name").to_string(),
    }
}

/// Object identities in `manifest`, skipping objects without a name.
pub fn parse_manifest_refs(
    manifest: &[u8],
    namespace_override: &str,
) -> Result<Vec<AppliedResourceRef>> {
    let refs = manifest_documents(manifest)?
        .iter()
        .map(|object| object_ref(object, namespace_override))
        .filter(|r| !r.name.is_empty())
        .collect();
    Ok(refs)
}
