//! Host side of the guest memory protocol. Any out-of-bounds handle or a
//! misbehaving allocator is a [`ProtocolError`], which traps the guest.

use anyhow::{Context, Result};
use wasmtime::{Caller, Memory};
use yoke_core::abi::{self, Status, ALLOCATOR_EXPORTS, MEMORY_EXPORT};

/// Host and guest disagree on the memory protocol. Surfaces as `ProtocolViolation`.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub(crate) struct ProtocolError(pub String);

fn violation(msg: impl Into<String>) -> anyhow::Error {
    ProtocolError(msg.into()).into()
}

fn memory<T>(caller: &mut Caller<'_, T>) -> Result<Memory> {
    caller
        .get_export(MEMORY_EXPORT)
        .and_then(|e| e.into_memory())
        .ok_or_else(|| violation(format!("guest does not export `{MEMORY_EXPORT}`")))
}

pub(crate) fn read_bytes<T>(caller: &mut Caller<'_, T>, handle: u64) -> Result<Vec<u8>> {
    let (ptr, len) = abi::unpack(handle);
    if len == 0 {
        return Ok(Vec::new());
    }
    let mem = memory(caller)?;
    let mut buf = vec![0u8; len as usize];
    mem.read(&*caller, ptr as usize, &mut buf)
        .map_err(|_| violation(format!("guest buffer {ptr:#x}+{len} is out of bounds")))?;
    Ok(buf)
}

/// Copy `bytes` into memory obtained from the guest allocator and return its handle.
pub(crate) fn write_bytes<T>(caller: &mut Caller<'_, T>, bytes: &[u8]) -> Result<u64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    let len = u32::try_from(bytes.len()).map_err(|_| violation("buffer exceeds guest address space"))?;
    let alloc = ALLOCATOR_EXPORTS
        .iter()
        .find_map(|name| caller.get_export(name).and_then(|e| e.into_func()))
        .ok_or_else(|| violation(format!("guest exports none of the allocators {ALLOCATOR_EXPORTS:?}")))?;
    let alloc = alloc
        .typed::<u32, u32>(&*caller)
        .map_err(|e| violation(format!("guest allocator has the wrong signature: {e}")))?;
    // A trap inside the allocator is the guest's own failure, not skew.
    let ptr = alloc.call(&mut *caller, len).context("guest allocator failed")?;
    if ptr == 0 {
        return Err(violation(format!("guest allocator returned null for {len} bytes")));
    }
    let mem = memory(caller)?;
    let end = ptr as usize + len as usize;
    if end > mem.data_size(&*caller) {
        return Err(violation(format!("guest allocator returned out-of-bounds region {ptr:#x}+{len}")));
    }
    mem.write(&mut *caller, ptr as usize, bytes)
        .map_err(|_| violation(format!("guest region {ptr:#x}+{len} is not writable")))?;
    Ok(abi::pack(ptr, len))
}

pub(crate) fn write_status<T>(caller: &mut Caller<'_, T>, ptr: u32, status: Status) -> Result<()> {
    let mem = memory(caller)?;
    mem.write(&mut *caller, ptr as usize, &status.as_raw().to_le_bytes())
        .map_err(|_| violation(format!("status slot {ptr:#x} is out of bounds")))
}
