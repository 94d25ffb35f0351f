//! Native-callable function pointers backed by Rust closures
//!
//! Every callback is owned by the thread that created it and its handler
//! only ever runs there:
//!
//! - [`Tier::Direct`] trampolines run the handler synchronously and must be
//!   invoked on the owning thread.
//! - [`Tier::ThreadSafe`] trampolines may be invoked from any thread. Off the
//!   owning thread they queue the call on a [`CallbackHost`] and block until
//!   the owning thread pumps it or the timeout elapses.
//!
//! A failing, panicking or released callback hands native code a zero-filled
//! return value; the failure is kept in [`CallbackHandle::last_error`].
//!
//! # Example
//!
//! ```
//! # use ffikit_runtime::{callback, CType, Value};
//! let handle = callback::direct(
//!     |args| Ok(Value::Int(args[0].as_i64().unwrap_or(0) * 2)),
//!     CType::Int32,
//!     [CType::Int32],
//! )
//! .unwrap();
//! let twice: extern "C" fn(i32) -> i32 =
//!     unsafe { std::mem::transmute(handle.pointer().unwrap() as usize) };
//! assert_eq!(twice(21), 42);
//! ```

mod host;
mod thread_bound;
mod trampoline;

pub use host::CallbackHost;

use crate::error::{FfiError, FfiResult};
use crate::native::Signature;
use crate::types::CType;
use crate::value::Value;
use host::HostLink;
use std::fmt;
use std::sync::Arc;
use trampoline::{Handler, StatusCell, Trampoline, TrampolineShared};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Direct,
    ThreadSafe,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Direct => f.write_str("direct"),
            Tier::ThreadSafe => f.write_str("thread-safe"),
        }
    }
}

/// A Direct callback that needs no host
pub fn direct<F>(
    handler: F,
    return_type: CType,
    arg_types: impl Into<Vec<CType>>,
) -> FfiResult<CallbackHandle>
where
    F: Fn(&[Value]) -> FfiResult<Value> + 'static,
{
    CallbackHandle::build(
        Box::new(handler),
        Signature::new(arg_types, return_type),
        Tier::Direct,
        None,
    )
}

/// Owner of one trampoline
///
/// The code pointer stays valid until [`CallbackHandle::release`] or drop.
pub struct CallbackHandle {
    shared: Arc<TrampolineShared>,
    trampoline: Trampoline,
}

impl CallbackHandle {
    pub(crate) fn build(
        handler: Handler,
        signature: Signature,
        tier: Tier,
        link: Option<HostLink>,
    ) -> FfiResult<Self> {
        signature.validate()?;
        let shared = TrampolineShared::new(handler, signature, tier, link);
        let trampoline = Trampoline::new(Arc::clone(&shared));
        debug!(
            callback = shared.id(),
            %tier,
            signature = %shared.signature(),
            "Callback created"
        );
        Ok(Self { shared, trampoline })
    }

    /// Native code pointer for the trampoline
    pub fn pointer(&self) -> FfiResult<u64> {
        if self.is_released() {
            return Err(released());
        }
        Ok(self.trampoline.code())
    }

    pub fn tier(&self) -> Tier {
        self.shared.tier()
    }

    pub fn signature(&self) -> &Signature {
        self.shared.signature()
    }

    pub fn is_released(&self) -> bool {
        self.shared.status().is_released()
    }

    /// Free the trampoline; only the first release succeeds
    pub fn release(&mut self) -> FfiResult<()> {
        if !self.shared.status().mark_released() {
            return Err(released());
        }
        self.trampoline.release();
        debug!(callback = self.shared.id(), "Callback released");
        Ok(())
    }

    /// Called with the message of every handler failure on the owning thread
    pub fn set_error_handler(&self, report: impl Fn(&str) + 'static) -> FfiResult<()> {
        if self.is_released() {
            return Err(released());
        }
        self.shared.set_error_handler(Box::new(report))
    }

    /// Most recent handler or handshake failure
    pub fn last_error(&self) -> Option<String> {
        self.shared.status().last_error()
    }

    /// Failure/release state that can be read from other threads
    pub fn status(&self) -> CallbackStatus {
        CallbackStatus(Arc::clone(self.shared.status()))
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        self.shared.status().mark_released();
    }
}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("id", &self.shared.id())
            .field("tier", &self.tier())
            .field("signature", &self.signature().to_string())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Thread-safe view of a callback's state
#[derive(Debug, Clone)]
pub struct CallbackStatus(Arc<StatusCell>);

impl CallbackStatus {
    pub fn last_error(&self) -> Option<String> {
        self.0.last_error()
    }

    pub fn is_released(&self) -> bool {
        self.0.is_released()
    }
}

fn released() -> FfiError {
    FfiError::CallbackLifecycle("callback already released".to_string())
}
