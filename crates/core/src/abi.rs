//! Guest memory protocol shared by the host runtime and the guest SDK.
//!
//! Strings and buffers cross the boundary as a `u64` handle packing a
//! `(ptr, len)` pair of guest linear memory: `ptr` in the high 32 bits,
//! `len` in the low 32 bits. The zero handle is the empty buffer.
//!
//! A capability call receives a pointer to a `u32` status slot followed by one
//! handle per string argument, and returns one handle for its result buffer.
//! The host writes the result into memory obtained from the guest's exported
//! allocator; it never allocates guest memory itself.

use crate::Error;

/// Import module every capability is linked under.
pub const HOST_MODULE: &str = "host";
/// Capability resolving a live resource by identifier.
pub const LOOKUP_CAPABILITY: &str = "k8s_lookup";
/// Exported allocator names, tried in order.
pub const ALLOCATOR_EXPORTS: [&str; 2] = ["yoke_malloc", "malloc"];
pub const MEMORY_EXPORT: &str = "memory";

/// Closed set of call outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    Error = 1,
    Forbidden = 2,
    NotFound = 3,
    Unauthenticated = 4,
}

impl Status {
    pub const fn as_raw(self) -> u32 { self as u32 }

    /// Any value outside the enumeration means host and guest disagree on the protocol.
    pub fn from_raw(raw: u32) -> Result<Self, Error> {
        match raw {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Error),
            2 => Ok(Status::Forbidden),
            3 => Ok(Status::NotFound),
            4 => Ok(Status::Unauthenticated),
            other => Err(Error::ProtocolViolation(format!("unknown status code {other}"))),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Error => "error",
            Status::Forbidden => "forbidden",
            Status::NotFound => "not_found",
            Status::Unauthenticated => "unauthenticated",
        }
    }
}

pub const fn pack(ptr: u32, len: u32) -> u64 {
    ((ptr as u64) << 32) | len as u64
}

pub const fn unpack(handle: u64) -> (u32, u32) {
    ((handle >> 32) as u32, handle as u32)
}
