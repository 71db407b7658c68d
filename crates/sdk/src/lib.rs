//! Yoke SDK: guest side of the flight ABI.
//!
//! A flight built for `wasm32-wasip1` reads its values from stdin, may call
//! [`lookup`] to read live objects, and writes its resources to stdout with
//! [`emit`]. The crate exports `yoke_malloc` so the host can hand results back.

#![deny(unsafe_code)]

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;
use yoke_core::abi::Status;

pub use yoke_core::ResourceIdentifier;

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("{0}")]
    Other(String),
    #[error("decoding lookup result: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Interpret a raw status and result buffer.
///
/// # Panics
/// On a status outside the protocol: host and guest are out of sync and no
/// answer can be trusted.
pub fn decode_response<T: DeserializeOwned>(state: u32, body: &[u8]) -> Result<T, LookupError> {
    let status = match Status::from_raw(state) {
        Ok(s) => s,
        Err(e) => panic!("{e}"),
    };
    let message = || String::from_utf8_lossy(body).into_owned();
    match status {
        Status::Ok => Ok(serde_json::from_slice(body)?),
        Status::Forbidden => Err(LookupError::Forbidden(message())),
        Status::NotFound => Err(LookupError::NotFound(message())),
        Status::Unauthenticated => Err(LookupError::Unauthenticated(message())),
        Status::Error => Err(LookupError::Other(message())),
    }
}

/// Read one live object through the host.
pub fn lookup<T: DeserializeOwned>(id: &ResourceIdentifier) -> Result<T, LookupError> {
    let (state, body) = ffi::lookup(id.name(), id.namespace(), id.kind(), id.api_version());
    decode_response(state, &body)
}

/// Like [`lookup`], with absence as `None`.
pub fn try_lookup<T: DeserializeOwned>(id: &ResourceIdentifier) -> Result<Option<T>, LookupError> {
    match lookup(id) {
        Ok(v) => Ok(Some(v)),
        Err(LookupError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Input values piped by the host; empty stdin yields `T::default()`.
pub fn values<T: DeserializeOwned + Default>() -> Result<T, serde_json::Error> {
    let mut raw = Vec::new();
    std::io::stdin().read_to_end(&mut raw).map_err(serde_json::Error::io)?;
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&raw)
}

/// Write the rendered resources to stdout.
pub fn emit<T: Serialize + ?Sized>(resources: &T) -> std::io::Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer(&mut out, resources)?;
    out.flush()
}

pub fn release() -> String { std::env::var("YOKE_RELEASE").unwrap_or_default() }
pub fn namespace() -> String { std::env::var("YOKE_NAMESPACE").unwrap_or_default() }

#[cfg(target_arch = "wasm32")]
#[allow(unsafe_code)]
mod ffi {
    use std::alloc::{alloc, Layout};

    use yoke_core::abi::{pack, unpack};

    #[link(wasm_import_module = "host")]
    extern "C" {
        fn k8s_lookup(state: *mut u32, name: u64, namespace: u64, kind: u64, api_version: u64) -> u64;
    }

    fn handle(s: &str) -> u64 {
        if s.is_empty() { 0 } else { pack(s.as_ptr() as u32, s.len() as u32) }
    }

    /// Take ownership of a host-written buffer allocated by `yoke_malloc`.
    fn take(h: u64) -> Vec<u8> {
        let (ptr, len) = unpack(h);
        if len == 0 {
            return Vec::new();
        }
        unsafe { Vec::from_raw_parts(ptr as *mut u8, len as usize, len as usize) }
    }

    pub(crate) fn lookup(name: &str, namespace: &str, kind: &str, api_version: &str) -> (u32, Vec<u8>) {
        let mut state = u32::MAX;
        let h = unsafe { k8s_lookup(&mut state, handle(name), handle(namespace), handle(kind), handle(api_version)) };
        (state, take(h))
    }

    #[no_mangle]
    pub extern "C" fn yoke_malloc(size: u32) -> u32 {
        match Layout::array::<u8>(size as usize) {
            Ok(layout) if size > 0 => unsafe { alloc(layout) as u32 },
            _ => 0,
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
mod ffi {
    use yoke_core::abi::Status;

    pub(crate) fn lookup(_: &str, _: &str, _: &str, _: &str) -> (u32, Vec<u8>) {
        (Status::Error.as_raw(), b"host capabilities are only available inside a flight".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn status_maps_to_typed_errors() {
        let v: Value = decode_response(0, br#"{"kind":"ConfigMap"}"#).unwrap();
        assert_eq!(v, json!({"kind": "ConfigMap"}));
        assert!(matches!(decode_response::<Value>(1, b"boom"), Err(LookupError::Other(m)) if m == "boom"));
        assert!(matches!(decode_response::<Value>(2, b""), Err(LookupError::Forbidden(_))));
        assert!(matches!(decode_response::<Value>(3, b""), Err(LookupError::NotFound(_))));
        assert!(matches!(decode_response::<Value>(4, b""), Err(LookupError::Unauthenticated(_))));
        assert!(matches!(decode_response::<Value>(0, b"not json"), Err(LookupError::Decode(_))));
    }

    #[test]
    #[should_panic(expected = "unknown status code 9")]
    fn unknown_status_aborts() {
        let _ = decode_response::<Value>(9, b"");
    }

    #[test]
    fn lookup_outside_a_flight_is_an_error() {
        let id = ResourceIdentifier::new("cfg", "ns", "ConfigMap", "v1");
        assert!(matches!(lookup::<Value>(&id), Err(LookupError::Other(_))));
        assert!(try_lookup::<Value>(&id).is_err());
    }
}
