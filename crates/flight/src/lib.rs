//! Yoke flight: runs untrusted flight modules in a wasmtime sandbox whose only
//! window on the cluster is the capability bridge, and turns their output into
//! a `ResourceSet`.

#![forbid(unsafe_code)]

pub mod bridge;
mod memory;
pub mod producer;
pub mod runtime;

pub use bridge::{Bridge, Capability, ExecutionContext, LookupCapability, LookupRecord, Response};
pub use producer::{FlightProducer, ManifestProducer, Producer, Rendered};
pub use runtime::{ExecutionOutput, FlightRuntime, Invocation, RuntimeLimits, WASMTIME_VERSION};
