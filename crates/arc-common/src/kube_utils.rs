//! Kubernetes helpers shared by the controller and its clients
//!
//! API error classification, finalizer list manipulation, optimistic-concurrency
//! patch bodies, and a stable content hash.

use kube::core::ObjectMeta;
use serde::Serialize;

use crate::Error;

/// HTTP status code of a Kubernetes API error, if the error came from the API server
pub fn api_error_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(ae) => Some(ae.code),
        _ => None,
    }
}

/// Whether the API server answered 404
pub fn is_not_found(err: &kube::Error) -> bool {
    api_error_code(err) == Some(404)
}

/// Whether the API server rejected a write due to a stale resourceVersion
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason != "AlreadyExists")
}

/// Whether a create failed because the object is already present
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}

/// Whether the object carries the given finalizer
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == finalizer))
}

/// Finalizer list with `finalizer` appended, or `None` when already present
pub fn with_finalizer(meta: &ObjectMeta, finalizer: &str) -> Option<Vec<String>> {
    if has_finalizer(meta, finalizer) {
        return None;
    }
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    finalizers.push(finalizer.to_string());
    Some(finalizers)
}

/// Finalizer list with `finalizer` removed, or `None` when it was absent
pub fn without_finalizer(meta: &ObjectMeta, finalizer: &str) -> Option<Vec<String>> {
    if !has_finalizer(meta, finalizer) {
        return None;
    }
    Some(
        meta.finalizers
            .iter()
            .flatten()
            .filter(|s| *s != finalizer)
            .cloned()
            .collect(),
    )
}

/// Build a merge-patch body guarded by `resourceVersion`
///
/// The API server rejects the patch with 409 Conflict if the object changed
/// since `resource_version` was observed.
pub fn versioned_merge_patch(
    resource_version: Option<&str>,
    body: serde_json::Value,
) -> serde_json::Value {
    let mut patch = body;
    if let (Some(rv), Some(obj)) = (resource_version, patch.as_object_mut()) {
        let metadata = obj
            .entry("metadata")
            .or_insert_with(|| serde_json::json!({}));
        if let Some(metadata) = metadata.as_object_mut() {
            metadata.insert(
                "resourceVersion".to_string(),
                serde_json::Value::String(rv.to_string()),
            );
        }
    }
    patch
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 for stability across Rust toolchain versions.
/// `DefaultHasher` is NOT guaranteed stable across Rust releases, so this
/// function should be used whenever the hash is persisted (e.g., pod labels).
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Hash the JSON encoding of a serializable value
///
/// Maps in k8s-openapi types are `BTreeMap`, so key order is stable.
pub fn hash_object<T: Serialize>(value: &T) -> Result<String, Error> {
    let encoded = serde_json::to_string(value)?;
    Ok(deterministic_hash(&encoded))
}
