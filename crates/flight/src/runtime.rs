//! Flight runtime: one sandboxed `_start` per render.
//!
//! Each execution gets a fresh engine and store, so nothing survives between
//! renders. The guest sees its args, two env vars, an in-memory stdin and the
//! capability imports. No preopened directories and no sockets.
//!
//! Termination:
//! - wall-clock timeout and cancellation bump the engine epoch, which traps
//!   the guest at its next epoch check;
//! - fuel bounds the instruction count, `StoreLimits` the linear memory;
//! - a capability call in progress races the same interrupt token.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wasmtime::{Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap};
use wasmtime_wasi::preview1::{self as p1, WasiP1Ctx};
use wasmtime_wasi::p2::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};
use yoke_core::{Error, Result, Settings};

use crate::bridge::{Bridge, LookupRecord};
use crate::memory::ProtocolError;

/// Release line of the embedded engine, in step with the workspace `wasmtime` requirement.
pub const WASMTIME_VERSION: &str = "36";

const STDERR_CAP: usize = 1024 * 1024;
const STDERR_TAIL: usize = 2048;

const RUNNING: u8 = 0;
const TIMED_OUT: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLimits {
    pub timeout: Duration,
    pub fuel: u64,
    pub max_memory_bytes: usize,
    pub max_module_bytes: usize,
    pub max_output_bytes: usize,
}

impl Default for RuntimeLimits {
    fn default() -> Self { Self::from(&Settings::default()) }
}

impl From<&Settings> for RuntimeLimits {
    fn from(s: &Settings) -> Self {
        Self {
            timeout: s.flight_timeout,
            fuel: s.flight_fuel,
            max_memory_bytes: s.flight_max_memory_bytes,
            max_module_bytes: s.max_module_bytes,
            max_output_bytes: s.max_output_bytes,
        }
    }
}

/// Inputs of one render beyond the module itself.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Passed after the release name.
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub lookups: Vec<LookupRecord>,
    pub elapsed: Duration,
}

pub(crate) struct HostState {
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) limits: StoreLimits,
    pub(crate) audit: Vec<LookupRecord>,
    /// Fires on timeout or cancellation.
    pub(crate) interrupt: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct FlightRuntime {
    limits: RuntimeLimits,
}

impl FlightRuntime {
    pub fn new(limits: RuntimeLimits) -> Self { Self { limits } }

    pub fn limits(&self) -> &RuntimeLimits { &self.limits }

    /// Run `module` (binary or text format) to completion and capture its output.
    pub async fn execute(&self, module: &[u8], invocation: Invocation, bridge: Bridge, cancel: &CancellationToken) -> Result<ExecutionOutput> {
        if module.len() > self.limits.max_module_bytes {
            return Err(Error::RenderFailure(format!(
                "module is {} bytes, limit is {}",
                module.len(),
                self.limits.max_module_bytes
            )));
        }
        if cancel.is_cancelled() {
            return Err(Error::RenderCancelled);
        }

        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(|e| Error::RenderFailure(format!("engine: {e:#}")))?;

        let interrupt = cancel.child_token();
        let done = CancellationToken::new();
        let reason = Arc::new(AtomicU8::new(RUNNING));
        let ticker = tokio::spawn({
            let (engine, interrupt, done, reason, cancel) = (engine.clone(), interrupt.clone(), done.clone(), reason.clone(), cancel.clone());
            let timeout = self.limits.timeout;
            async move {
                tokio::select! {
                    _ = done.cancelled() => return,
                    _ = tokio::time::sleep(timeout) => reason.store(TIMED_OUT, Ordering::SeqCst),
                    _ = cancel.cancelled() => reason.store(CANCELLED, Ordering::SeqCst),
                }
                interrupt.cancel();
                engine.increment_epoch();
            }
        });

        let release = bridge.context().release.clone();
        let attempt = bridge.context().attempt;
        let limits = self.limits.clone();
        let module = module.to_vec();
        let handle = Handle::current();
        let t0 = Instant::now();
        let joined =
            tokio::task::spawn_blocking(move || run_guest(&engine, &module, invocation, &bridge, &limits, interrupt, handle)).await;
        done.cancel();
        let _ = ticker.await;
        let elapsed = t0.elapsed();
        histogram!("flight_render_ms", elapsed.as_secs_f64() * 1000.0);

        let outcome = match joined {
            Ok(run) => run,
            Err(e) => return Err(Error::RenderFailure(format!("flight task: {e}"))),
        };
        let result = match reason.load(Ordering::SeqCst) {
            TIMED_OUT => Err(Error::RenderTimeout(self.limits.timeout)),
            CANCELLED => Err(Error::RenderCancelled),
            _ => outcome.classify(self.limits.max_output_bytes),
        };
        let label = match &result {
            Ok(_) => "ok",
            Err(Error::RenderTimeout(_)) => "timeout",
            Err(Error::RenderCancelled) => "cancelled",
            Err(_) => "failed",
        };
        counter!("flight_renders_total", 1u64, "outcome" => label);
        debug!(release = %release, attempt = %attempt, elapsed_ms = elapsed.as_millis() as u64, outcome = label, "flight executed");
        result.map(|(stdout, stderr, lookups)| ExecutionOutput { stdout, stderr, lookups, elapsed })
    }
}

struct GuestRun {
    exit: std::result::Result<(), anyhow::Error>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    lookups: Vec<LookupRecord>,
}

impl GuestRun {
    fn setup_failure(e: anyhow::Error) -> Self {
        Self { exit: Err(e), stdout: Vec::new(), stderr: Vec::new(), lookups: Vec::new() }
    }

    fn classify(self, max_output: usize) -> Result<(Vec<u8>, Vec<u8>, Vec<LookupRecord>)> {
        let GuestRun { exit, stdout, stderr, lookups } = self;
        if let Err(e) = exit {
            if let Some(code) = e.downcast_ref::<I32Exit>().map(|x| x.0) {
                if code != 0 {
                    return Err(failure(format!("flight exited with code {code}"), &stderr));
                }
            } else if let Some(p) = e.downcast_ref::<ProtocolError>() {
                return Err(Error::ProtocolViolation(p.0.clone()));
            } else if let Some(Trap::OutOfFuel) = e.downcast_ref::<Trap>() {
                return Err(failure("flight ran out of fuel".to_string(), &stderr));
            } else {
                return Err(failure(format!("{e:#}"), &stderr));
            }
        }
        if stdout.len() > max_output {
            return Err(failure(format!("flight output exceeds {max_output} bytes"), &stderr));
        }
        Ok((stdout, stderr, lookups))
    }
}

fn failure(reason: String, stderr: &[u8]) -> Error {
    let tail = &stderr[stderr.len().saturating_sub(STDERR_TAIL)..];
    let tail = String::from_utf8_lossy(tail);
    let tail = tail.trim();
    if tail.is_empty() {
        Error::RenderFailure(reason)
    } else {
        Error::RenderFailure(format!("{reason}\n{tail}"))
    }
}

fn run_guest(
    engine: &Engine,
    module: &[u8],
    invocation: Invocation,
    bridge: &Bridge,
    limits: &RuntimeLimits,
    interrupt: CancellationToken,
    handle: Handle,
) -> GuestRun {
    let module = match Module::new(engine, module) {
        Ok(m) => m,
        Err(e) => return GuestRun::setup_failure(e.context("compiling flight module")),
    };

    // Writes past the cap fail inside the guest; the cap plus one byte tells overflow apart.
    let stdout = MemoryOutputPipe::new(limits.max_output_bytes.saturating_add(1));
    let stderr = MemoryOutputPipe::new(STDERR_CAP);
    let ctx = bridge.context();
    let mut args = Vec::with_capacity(invocation.args.len() + 1);
    args.push(ctx.release.name.clone());
    args.extend(invocation.args);

    let mut wasi = WasiCtxBuilder::new();
    wasi.args(&args)
        .env("YOKE_RELEASE", &ctx.release.name)
        .env("YOKE_NAMESPACE", &ctx.release.namespace)
        .stdin(MemoryInputPipe::new(invocation.stdin.unwrap_or_default()))
        .stdout(stdout.clone())
        .stderr(stderr.clone());

    let state = HostState {
        wasi: wasi.build_p1(),
        limits: StoreLimitsBuilder::new().memory_size(limits.max_memory_bytes).trap_on_grow_failure(true).build(),
        audit: Vec::new(),
        interrupt,
    };
    let mut store = Store::new(engine, state);
    store.limiter(|s| &mut s.limits);
    store.set_epoch_deadline(1);
    // An interrupt that fired before the deadline was armed bumped an older epoch.
    if store.data().interrupt.is_cancelled() {
        return GuestRun::setup_failure(anyhow::anyhow!("interrupted before start"));
    }
    if let Err(e) = store.set_fuel(limits.fuel) {
        return GuestRun::setup_failure(e);
    }

    let exit = (|| {
        let mut linker: Linker<HostState> = Linker::new(engine);
        p1::add_to_linker_sync(&mut linker, |s: &mut HostState| &mut s.wasi)?;
        bridge.link(&mut linker, handle)?;
        let instance = linker.instantiate(&mut store, &module)?;
        match instance.get_typed_func::<(), ()>(&mut store, "_start") {
            Ok(start) => start.call(&mut store, ()),
            // A module without `_start` renders nothing.
            Err(_) => Ok(()),
        }
    })();

    GuestRun {
        exit,
        stdout: stdout.contents().to_vec(),
        stderr: stderr.contents().to_vec(),
        lookups: std::mem::take(&mut store.data_mut().audit),
    }
}
