//! libffi closures and the shared state behind them
//!
//! The closure's userdata is an `Arc<TrampolineShared>` turned into a raw
//! pointer. It is turned back into an `Arc` only after the closure has been
//! freed, so native code never observes dangling userdata while the code
//! pointer is valid.

use super::host::HostLink;
use super::thread_bound::ThreadBound;
use super::Tier;
use crate::error::{FfiError, FfiResult};
use crate::marshal::{cstring, encode, encode_wide, from_native};
use crate::platform::WCHAR_WIDTH;
use crate::native::Signature;
use crate::types::CType;
use crate::value::Value;
use libffi::low;
use libffi::middle::Closure;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::size_of;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use tracing::{trace, warn};

pub(crate) type Handler = Box<dyn Fn(&[Value]) -> FfiResult<Value>>;
pub(crate) type ErrorHandler = Box<dyn Fn(&str)>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// State readable from any thread
#[derive(Debug, Default)]
pub(crate) struct StatusCell {
    last_error: Mutex<Option<String>>,
    released: AtomicBool,
}

impl StatusCell {
    pub(crate) fn last_error(&self) -> Option<String> {
        match self.last_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_last_error(&self, message: &str) {
        let mut guard = match self.last_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(message.to_string());
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }
}

/// Text handed back to native code for a `string`/`wstring` result
///
/// Stored in whole words so wide units are aligned.
struct ReturnedText(Box<[u64]>);

impl ReturnedText {
    fn new(bytes: &[u8]) -> Self {
        let mut words = vec![0u64; (bytes.len() + 7) / 8].into_boxed_slice();
        for (word, chunk) in words.iter_mut().zip(bytes.chunks(8)) {
            let mut raw = [0u8; 8];
            raw[..chunk.len()].copy_from_slice(chunk);
            *word = u64::from_ne_bytes(raw);
        }
        ReturnedText(words)
    }

    fn address(&self) -> u64 {
        self.0.as_ptr() as usize as u64
    }
}

pub(crate) struct TrampolineShared {
    id: u64,
    signature: Signature,
    tier: Tier,
    handler: ThreadBound<Handler>,
    error_handler: ThreadBound<RefCell<Option<ErrorHandler>>>,
    /// Text returned for a `string`/`wstring` result, one per calling thread,
    /// valid until that thread calls again or the callback is dropped
    returned: Mutex<HashMap<ThreadId, ReturnedText>>,
    status: Arc<StatusCell>,
    link: Option<HostLink>,
}

impl TrampolineShared {
    pub(crate) fn new(
        handler: Handler,
        signature: Signature,
        tier: Tier,
        link: Option<HostLink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            signature,
            tier,
            handler: ThreadBound::new(handler),
            error_handler: ThreadBound::new(RefCell::new(None)),
            returned: Mutex::new(HashMap::new()),
            status: Arc::new(StatusCell::default()),
            link,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn signature(&self) -> &Signature {
        &self.signature
    }

    pub(crate) fn tier(&self) -> Tier {
        self.tier
    }

    pub(crate) fn status(&self) -> &Arc<StatusCell> {
        &self.status
    }

    pub(crate) fn set_error_handler(&self, handler: ErrorHandler) -> FfiResult<()> {
        let slot = self.error_handler.get().ok_or_else(|| {
            FfiError::CallbackLifecycle("error handler set off the owning thread".to_string())
        })?;
        *slot.borrow_mut() = Some(handler);
        Ok(())
    }

    /// Record a failure seen on any thread
    pub(crate) fn record(&self, message: &str) {
        self.status.set_last_error(message);
        warn!(callback = self.id, error = message, "Callback failed");
    }

    /// Record a handler failure on the owning thread and report it
    pub(crate) fn fail(&self, message: &str) {
        self.status.set_last_error(message);
        if let Some(slot) = self.error_handler.get() {
            if let Some(report) = slot.borrow().as_ref() {
                report(message);
                return;
            }
        }
        warn!(callback = self.id, error = message, "Callback handler failed");
    }

    /// Run the handler on the owning thread on behalf of `caller`
    pub(crate) fn invoke_local(
        &self,
        images: &[Vec<u8>],
        caller: ThreadId,
    ) -> Result<Vec<u8>, String> {
        let handler = self
            .handler
            .get()
            .ok_or_else(|| "handler reached off its owning thread".to_string())?;
        let args = images
            .iter()
            .zip(self.signature.args.iter())
            .map(|(image, ty)| from_native(*ty, image))
            .collect::<FfiResult<Vec<_>>>()
            .map_err(|e| e.to_string())?;

        let value = match panic::catch_unwind(AssertUnwindSafe(|| handler(&args))) {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(payload) => return Err(panic_message(payload.as_ref())),
        };
        self.encode_return(&value, caller).map_err(|e| e.to_string())
    }

    pub(crate) fn zero_return(&self) -> Vec<u8> {
        vec![0; self.signature.ret.size() as usize]
    }

    fn encode_return(&self, value: &Value, caller: ThreadId) -> FfiResult<Vec<u8>> {
        let ret = self.signature.ret;
        match (ret, value) {
            (CType::Void, _) => Ok(Vec::new()),
            (CType::CString | CType::WString, Value::Str(text)) => {
                let bytes = if ret == CType::CString {
                    cstring(text)?.to_vec()
                } else {
                    encode_wide(text, WCHAR_WIDTH)
                };
                let text = ReturnedText::new(&bytes);
                let image = encode(ret, &Value::Pointer(text.address()))?;
                self.returned_texts().insert(caller, text);
                Ok(image)
            }
            _ => encode(ret, value),
        }
    }

    fn returned_texts(&self) -> MutexGuard<'_, HashMap<ThreadId, ReturnedText>> {
        match self.returned.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Route one native invocation and produce the return image
    fn dispatch(&self, images: Vec<Vec<u8>>) -> Vec<u8> {
        trace!(callback = self.id, tier = ?self.tier, "Callback invoked");
        if self.status.is_released() {
            self.record(&FfiError::CallbackLifecycle("invoked after release".to_string()).to_string());
            return self.zero_return();
        }

        if self.handler.is_owner() {
            return match self.invoke_local(&images, thread::current().id()) {
                Ok(image) => image,
                Err(message) => {
                    self.fail(&message);
                    self.zero_return()
                }
            };
        }

        let outcome = match &self.link {
            Some(link) => {
                // SAFETY: every TrampolineShared is created inside an Arc and
                // this one is still referenced by its closure
                let shared = unsafe { reacquire(self) };
                link.request(shared, images)
            }
            None => Err(FfiError::CallbackLifecycle(
                "direct callback invoked from a foreign thread".to_string(),
            )),
        };
        match outcome {
            Ok(image) => image,
            // Already reported on the owning thread
            Err(FfiError::CallbackHandler(_)) => self.zero_return(),
            Err(e) => {
                self.record(&e.to_string());
                self.zero_return()
            }
        }
    }
}

unsafe fn reacquire(shared: &TrampolineShared) -> Arc<TrampolineShared> {
    let raw = shared as *const TrampolineShared;
    Arc::increment_strong_count(raw);
    Arc::from_raw(raw)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".to_string());
    format!("handler panicked: {}", detail)
}

unsafe extern "C" fn entry(
    _cif: &low::ffi_cif,
    result: &mut usize,
    args: *const *const c_void,
    shared: &TrampolineShared,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let images = capture_args(&shared.signature.args, args);
        shared.dispatch(images)
    }));
    let image = match outcome {
        Ok(image) => image,
        Err(payload) => {
            shared.record(&panic_message(payload.as_ref()));
            shared.zero_return()
        }
    };
    write_return(shared.signature.ret, result, &image);
}

/// Copy every argument out of native storage before anything can block
unsafe fn capture_args(types: &[CType], args: *const *const c_void) -> Vec<Vec<u8>> {
    types
        .iter()
        .enumerate()
        .map(|(index, ty)| {
            let source = *args.add(index) as *const u8;
            std::slice::from_raw_parts(source, ty.size() as usize).to_vec()
        })
        .collect()
}

/// Store a return image where libffi expects it
///
/// Integral results narrower than a register are widened to a full word.
unsafe fn write_return(ret: CType, result: &mut usize, image: &[u8]) {
    let size = ret.size() as usize;
    if size == 0 {
        return;
    }
    let mut padded = vec![0u8; size];
    let available = image.len().min(size);
    padded[..available].copy_from_slice(&image[..available]);

    if (ret.is_integer() || ret == CType::WChar) && size < size_of::<usize>() {
        let mut word = [0u8; 8];
        word[..size].copy_from_slice(&padded);
        let raw = u64::from_le_bytes(word);
        let shift = 64 - 8 * size as u32;
        let widened = if ret.is_signed() {
            (((raw << shift) as i64) >> shift) as u64
        } else {
            raw
        };
        *result = widened as usize;
    } else {
        std::ptr::copy_nonoverlapping(padded.as_ptr(), result as *mut usize as *mut u8, size);
    }
}

/// A live libffi closure
pub(crate) struct Trampoline {
    closure: Option<Closure<'static>>,
    shared: *const TrampolineShared,
    code: u64,
}

impl Trampoline {
    pub(crate) fn new(shared: Arc<TrampolineShared>) -> Self {
        let cif = shared.signature.cif();
        let raw = Arc::into_raw(shared);
        // SAFETY: `raw` stays valid until `release`, which frees the closure first
        let userdata: &'static TrampolineShared = unsafe { &*raw };
        let closure = Closure::new(cif, entry, userdata);
        let code = *closure.code_ptr() as usize as u64;
        Self {
            closure: Some(closure),
            shared: raw,
            code,
        }
    }

    pub(crate) fn code(&self) -> u64 {
        self.code
    }

    pub(crate) fn release(&mut self) {
        if let Some(closure) = self.closure.take() {
            drop(closure);
            // SAFETY: balances the `into_raw` in `new`; no code pointer remains
            unsafe { drop(Arc::from_raw(self.shared)) };
        }
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        self.release();
    }
}
