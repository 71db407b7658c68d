//! Capability bridge: the only path from a running flight to the outside world.
//!
//! Each capability is linked as `host.<name>(state_ptr: i32, args: i64 * arity) -> i64`.
//! Arguments are string handles, the result is a buffer handle and the status
//! lands in the caller's slot. New capabilities implement [`Capability`] and
//! reuse the same encoding.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::debug;
use uuid::Uuid;
use wasmtime::{Caller, FuncType, Linker, Val, ValType};
use yoke_core::abi::{Status, HOST_MODULE, LOOKUP_CAPABILITY};
use yoke_core::{ReleaseRef, ResourceIdentifier};
use yoke_kubehub::{Cluster, ClusterError};

use crate::memory::{read_bytes, write_bytes, write_status};
use crate::runtime::HostState;

/// Who is executing: every capability call is attributed to this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionContext {
    pub release: ReleaseRef,
    /// Unique per render attempt.
    pub attempt: Uuid,
}

impl ExecutionContext {
    pub fn new(release: ReleaseRef) -> Self {
        Self { release, attempt: Uuid::new_v4() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub body: Vec<u8>,
}

impl Response {
    pub fn ok(body: Vec<u8>) -> Self { Self { status: Status::Ok, body } }
    pub fn error(message: impl Into<String>) -> Self { Self::with(Status::Error, message) }

    pub fn with(status: Status, message: impl Into<String>) -> Self {
        Self { status, body: message.into().into_bytes() }
    }
}

impl From<ClusterError> for Response {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::NotFound(m) => Response::with(Status::NotFound, m),
            ClusterError::Forbidden(m) => Response::with(Status::Forbidden, m),
            ClusterError::Unauthenticated(m) => Response::with(Status::Unauthenticated, m),
            other => Response::error(other.to_string()),
        }
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    /// Import name under the `host` module.
    fn name(&self) -> &'static str;
    /// Number of string arguments.
    fn arity(&self) -> usize;
    async fn invoke(&self, ctx: &ExecutionContext, args: Vec<String>) -> Response;
}

/// `k8s_lookup(name, namespace, kind, apiVersion)`: read-only fetch of one live resource.
pub struct LookupCapability {
    cluster: Arc<dyn Cluster>,
}

impl LookupCapability {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self { Self { cluster } }
}

#[async_trait]
impl Capability for LookupCapability {
    fn name(&self) -> &'static str { LOOKUP_CAPABILITY }
    fn arity(&self) -> usize { 4 }

    async fn invoke(&self, _ctx: &ExecutionContext, args: Vec<String>) -> Response {
        let [name, namespace, kind, api_version]: [String; 4] = match args.try_into() {
            Ok(a) => a,
            Err(_) => return Response::error("lookup expects name, namespace, kind and apiVersion"),
        };
        if kind.is_empty() || api_version.is_empty() {
            return Response::error("lookup requires kind and apiVersion");
        }
        if name.is_empty() {
            return Response::error("lookup requires a name");
        }
        let id = ResourceIdentifier::new(name, namespace, kind, api_version);
        match self.cluster.get(&id).await {
            Ok(doc) => match serde_json::to_vec(&doc.payload) {
                Ok(body) => Response::ok(body),
                Err(e) => Response::error(format!("encoding {id}: {e}")),
            },
            Err(e) => e.into(),
        }
    }
}

/// One capability invocation, kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LookupRecord {
    pub capability: String,
    pub args: Vec<String>,
    pub status: String,
    pub release: ReleaseRef,
    pub attempt: Uuid,
}

pub struct Bridge {
    ctx: Arc<ExecutionContext>,
    capabilities: Vec<Arc<dyn Capability>>,
}

impl Bridge {
    pub fn new(ctx: ExecutionContext) -> Self {
        Self { ctx: Arc::new(ctx), capabilities: Vec::new() }
    }

    /// Bridge with the built-in capabilities.
    pub fn standard(ctx: ExecutionContext, cluster: Arc<dyn Cluster>) -> Self {
        Self::new(ctx).with(Arc::new(LookupCapability::new(cluster)))
    }

    pub fn with(mut self, capability: Arc<dyn Capability>) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn context(&self) -> &ExecutionContext { &self.ctx }

    pub(crate) fn link(&self, linker: &mut Linker<HostState>, handle: Handle) -> anyhow::Result<()> {
        for cap in &self.capabilities {
            let params = std::iter::once(ValType::I32).chain(std::iter::repeat(ValType::I64).take(cap.arity()));
            let ty = FuncType::new(linker.engine(), params, [ValType::I64]);
            let cap = cap.clone();
            let ctx = self.ctx.clone();
            let handle = handle.clone();
            let name = cap.name();
            linker.func_new(HOST_MODULE, name, ty, move |mut caller: Caller<'_, HostState>, params: &[Val], results: &mut [Val]| {
                let state_ptr = params.first().and_then(Val::i32).ok_or_else(|| anyhow!("{name}: missing status pointer"))? as u32;
                let mut args = Vec::with_capacity(params.len().saturating_sub(1));
                let mut malformed = None;
                for (i, p) in params.iter().skip(1).enumerate() {
                    let h = p.i64().ok_or_else(|| anyhow!("{name}: argument {i} is not a handle"))? as u64;
                    match String::from_utf8(read_bytes(&mut caller, h)?) {
                        Ok(s) => args.push(s),
                        Err(_) => malformed = Some(format!("argument {i} is not valid UTF-8")),
                    }
                }

                let response = match malformed {
                    Some(msg) => Response::error(msg),
                    None => {
                        let interrupt = caller.data().interrupt.clone();
                        let call = cap.invoke(&ctx, args.clone());
                        handle
                            .block_on(async {
                                tokio::select! {
                                    r = call => Some(r),
                                    _ = interrupt.cancelled() => None,
                                }
                            })
                            .ok_or_else(|| anyhow!("{name}: interrupted"))?
                    }
                };

                debug!(
                    capability = name, release = %ctx.release, attempt = %ctx.attempt,
                    args = ?args, status = response.status.as_str(), "capability call"
                );
                counter!("flight_capability_calls_total", 1u64, "capability" => name, "status" => response.status.as_str());
                caller.data_mut().audit.push(LookupRecord {
                    capability: name.to_string(),
                    args,
                    status: response.status.as_str().to_string(),
                    release: ctx.release.clone(),
                    attempt: ctx.attempt,
                });

                let out = write_bytes(&mut caller, &response.body)?;
                write_status(&mut caller, state_ptr, response.status)?;
                if let Some(slot) = results.first_mut() {
                    *slot = Val::I64(out as i64);
                }
                Ok(())
            })?;
        }
        Ok(())
    }
}
