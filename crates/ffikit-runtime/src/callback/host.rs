//! Owning-thread side of ThreadSafe callbacks
//!
//! A foreign thread that enters a ThreadSafe trampoline copies its
//! arguments, queues an [`Invocation`] and blocks on a private runtime until
//! the owning thread answers or the configured timeout elapses. The owning
//! thread answers whenever it calls [`CallbackHost::pump`] or
//! [`CallbackHost::pump_for`].

use super::trampoline::TrampolineShared;
use super::{CallbackHandle, Tier};
use crate::context::FfiContext;
use crate::error::{FfiError, FfiResult};
use crate::native::Signature;
use crate::types::CType;
use crate::value::Value;
use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// One queued call from a foreign thread
pub(crate) struct Invocation {
    shared: Arc<TrampolineShared>,
    args: Vec<Vec<u8>>,
    caller: ThreadId,
    reply: oneshot::Sender<FfiResult<Vec<u8>>>,
}

/// Runtime shared by the host and every trampoline it created
struct HostRuntime(Option<Runtime>);

impl HostRuntime {
    fn block_on<F: Future>(&self, future: F) -> Option<F::Output> {
        self.0.as_ref().map(|runtime| runtime.block_on(future))
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

/// Foreign-thread handle onto a host queue
#[derive(Clone)]
pub(crate) struct HostLink {
    sender: mpsc::Sender<Invocation>,
    runtime: Arc<HostRuntime>,
    timeout: Duration,
}

impl HostLink {
    /// Queue one invocation and wait for the owning thread's answer
    pub(crate) fn request(
        &self,
        shared: Arc<TrampolineShared>,
        args: Vec<Vec<u8>>,
    ) -> FfiResult<Vec<u8>> {
        let (reply, answer) = oneshot::channel();
        let invocation = Invocation {
            shared,
            args,
            caller: thread::current().id(),
            reply,
        };
        let sender = self.sender.clone();
        let timeout = self.timeout;

        let outcome = self.runtime.block_on(async move {
            tokio::time::timeout(timeout, async move {
                sender.send(invocation).await.map_err(|_| {
                    FfiError::CallbackLifecycle("callback host has shut down".to_string())
                })?;
                answer.await.unwrap_or_else(|_| {
                    Err(FfiError::CallbackLifecycle(
                        "callback host dropped the invocation".to_string(),
                    ))
                })
            })
            .await
        });

        match outcome {
            Some(Ok(result)) => result,
            Some(Err(_elapsed)) => Err(FfiError::CallbackLifecycle(format!(
                "owning thread did not answer within {:?}",
                timeout
            ))),
            None => Err(FfiError::CallbackLifecycle(
                "callback host has shut down".to_string(),
            )),
        }
    }
}

/// Creates callbacks and services ThreadSafe invocations on its thread
///
/// The host is bound to the thread that created it. Dropping it closes the
/// queue: waiting and later foreign invocations fail and return zero.
pub struct CallbackHost {
    runtime: Arc<HostRuntime>,
    sender: mpsc::Sender<Invocation>,
    receiver: RefCell<mpsc::Receiver<Invocation>>,
    timeout: Duration,
    _owner: PhantomData<Rc<()>>,
}

impl CallbackHost {
    pub fn new(ctx: &FfiContext) -> FfiResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ffikit-callback")
            .enable_time()
            .build()
            .map_err(|e| {
                FfiError::CallbackLifecycle(format!("cannot start callback runtime: {}", e))
            })?;
        let capacity = ctx.callback_queue_capacity().max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        debug!(
            capacity,
            timeout_ms = ctx.callback_timeout().as_millis() as u64,
            "Callback host started"
        );
        Ok(Self {
            runtime: Arc::new(HostRuntime(Some(runtime))),
            sender,
            receiver: RefCell::new(receiver),
            timeout: ctx.callback_timeout(),
            _owner: PhantomData,
        })
    }

    /// Build a trampoline owned by this thread
    ///
    /// `Direct` callbacks must only be invoked on this thread; `ThreadSafe`
    /// ones may be invoked anywhere and are serviced through `pump*`.
    pub fn create<F>(
        &self,
        handler: F,
        return_type: CType,
        arg_types: impl Into<Vec<CType>>,
        tier: Tier,
    ) -> FfiResult<CallbackHandle>
    where
        F: Fn(&[Value]) -> FfiResult<Value> + 'static,
    {
        let link = match tier {
            Tier::Direct => None,
            Tier::ThreadSafe => Some(HostLink {
                sender: self.sender.clone(),
                runtime: Arc::clone(&self.runtime),
                timeout: self.timeout,
            }),
        };
        CallbackHandle::build(
            Box::new(handler),
            Signature::new(arg_types, return_type),
            tier,
            link,
        )
    }

    /// Invocations waiting to be serviced
    pub fn pending(&self) -> usize {
        self.receiver.borrow().len()
    }

    /// Service every queued invocation without blocking
    ///
    /// Returns how many were serviced; stops at the first handler failure.
    pub fn pump(&self) -> FfiResult<usize> {
        let mut serviced = 0;
        loop {
            let next = self.receiver.borrow_mut().try_recv();
            match next {
                Ok(invocation) => {
                    serviced += 1;
                    service(invocation)?;
                }
                Err(_) => return Ok(serviced),
            }
        }
    }

    /// Service invocations as they arrive until `duration` has elapsed
    pub fn pump_for(&self, duration: Duration) -> FfiResult<usize> {
        let deadline = Instant::now() + duration;
        let mut serviced = self.pump()?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(serviced);
            }
            let next = {
                let mut receiver = self.receiver.borrow_mut();
                self.runtime.block_on(async {
                    tokio::time::timeout(remaining, receiver.recv()).await
                })
            };
            match next {
                Some(Ok(Some(invocation))) => {
                    serviced += 1;
                    service(invocation)?;
                }
                _ => return Ok(serviced),
            }
        }
    }
}

fn service(invocation: Invocation) -> FfiResult<()> {
    let Invocation {
        shared,
        args,
        caller,
        reply,
    } = invocation;
    trace!(callback = shared.id(), "Servicing queued invocation");

    if shared.status().is_released() {
        let _ = reply.send(Err(FfiError::CallbackLifecycle(
            "invoked after release".to_string(),
        )));
        return Ok(());
    }

    match shared.invoke_local(&args, caller) {
        Ok(image) => {
            if reply.send(Ok(image)).is_err() {
                debug!(callback = shared.id(), "Foreign caller stopped waiting");
            }
            Ok(())
        }
        Err(message) => {
            shared.fail(&message);
            let _ = reply.send(Err(FfiError::CallbackHandler(message.clone())));
            Err(FfiError::CallbackHandler(message))
        }
    }
}
