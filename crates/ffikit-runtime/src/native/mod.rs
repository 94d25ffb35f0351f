//! Calling native functions
//!
//! A [`ForeignFunction`] pairs an address with a [`Signature`]. Calls marshal
//! [`Value`]s into byte images, hand them to a [`NativeDispatcher`] and decode
//! the returned image. [`LibffiDispatcher`] is the default dispatcher.
//!
//! Variadic functions declare their fixed arguments only; each call infers a
//! type for every extra argument from its value, after C's default argument
//! promotions. [`ForeignFunction::call_async`] runs the native call on tokio's
//! blocking pool.
//!
//! # Safety
//!
//! Nothing can verify that a signature matches the code behind an address,
//! so binding one (`ForeignFunction::new`, `Library::function`) is `unsafe`.

pub mod library;

pub use library::{default_search_paths, Library, LoadError};

use crate::buffer::NativeBuffer;
use crate::context::{errno, FfiContext};
use crate::error::{FfiError, FfiResult};
use crate::marshal::MarshalContext;
use crate::types::CType;
use crate::value::Value;
use libffi::middle::{Cif, CodePtr};
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

/// Calling convention tag
///
/// Every tag currently maps to the platform default convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Abi {
    #[default]
    Default,
    Cdecl,
    Stdcall,
    Fastcall,
}

/// Argument and return types of a C function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub args: Vec<CType>,
    pub ret: CType,
    /// Number of fixed arguments when the function is variadic
    pub variadic: Option<usize>,
}

impl Signature {
    pub fn new(args: impl Into<Vec<CType>>, ret: CType) -> Self {
        Self {
            args: args.into(),
            ret,
            variadic: None,
        }
    }

    /// Variadic prototype such as `int printf(const char *, ...)`
    ///
    /// `fixed` lists the declared arguments only.
    pub fn variadic(fixed: impl Into<Vec<CType>>, ret: CType) -> Self {
        let args = fixed.into();
        Self {
            variadic: Some(args.len()),
            args,
            ret,
        }
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    pub fn is_variadic(&self) -> bool {
        self.variadic.is_some()
    }

    /// Concrete signature for one call with `args`
    ///
    /// Fixed signatures must match the argument count exactly. Variadic ones
    /// need at least the fixed arguments and gain one inferred type per extra
    /// value.
    pub fn resolve(&self, args: &[Value]) -> FfiResult<Signature> {
        let Some(fixed) = self.variadic else {
            if args.len() != self.args.len() {
                return Err(FfiError::ArityMismatch {
                    expected: self.args.len(),
                    got: args.len(),
                });
            }
            return Ok(self.clone());
        };
        let fixed = fixed.min(self.args.len());
        if args.len() < fixed {
            return Err(FfiError::ArityMismatch {
                expected: fixed,
                got: args.len(),
            });
        }

        let mut types = self.args[..fixed].to_vec();
        for extra in &args[fixed..] {
            types.push(promoted_type(extra)?);
        }
        Ok(Signature {
            args: types,
            ret: self.ret,
            variadic: Some(fixed),
        })
    }

    /// `void` is only meaningful as a return type
    pub fn validate(&self) -> FfiResult<()> {
        match self.args.iter().position(|ty| *ty == CType::Void) {
            Some(index) => Err(FfiError::type_mismatch(
                format!("a sized type for argument {}", index),
                "void",
            )),
            None => Ok(()),
        }
    }

    pub(crate) fn cif(&self) -> Cif {
        let args = self.args.iter().map(|ty| ty.ffi_type());
        match self.variadic {
            Some(fixed) => Cif::new_variadic(args, fixed, self.ret.ffi_type()),
            None => Cif::new(args, self.ret.ffi_type()),
        }
    }
}

/// Type a value travels as through a `...` parameter
///
/// Integers that fit stay `int`/`unsigned int`, wider ones become 64-bit;
/// floats are promoted to `double`, text to `char *`, addresses to `void *`.
pub fn promoted_type(value: &Value) -> FfiResult<CType> {
    Ok(match value {
        Value::Bool(_) => CType::Int32,
        Value::Int(i) if i32::try_from(*i).is_ok() => CType::Int32,
        Value::Int(_) => CType::Int64,
        Value::UInt(u) if u32::try_from(*u).is_ok() => CType::UInt32,
        Value::UInt(_) => CType::UInt64,
        Value::Float(_) => CType::Double,
        Value::Str(_) => CType::CString,
        Value::Null | Value::Pointer(_) | Value::Buffer(_) => CType::Pointer,
        other => {
            return Err(FfiError::type_mismatch(
                "a scalar variadic argument",
                other.type_name(),
            ))
        }
    })
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut args: Vec<&str> = self.args.iter().map(|ty| ty.name()).collect();
        if let Some(fixed) = self.variadic {
            args.truncate(fixed);
            args.push("...");
        }
        write!(f, "({}) -> {}", args.join(", "), self.ret)
    }
}

/// Performs one native call from raw byte images
pub trait NativeDispatcher {
    /// Call `address` with one little-endian image per argument and return
    /// the return value's image (`ret.size()` bytes, empty for `void`)
    ///
    /// # Safety
    ///
    /// `address` must be a function whose prototype matches `signature`.
    unsafe fn dispatch(
        &self,
        address: u64,
        args: &[Vec<u8>],
        signature: &Signature,
        abi: Abi,
    ) -> FfiResult<Vec<u8>>;
}

/// Dispatch through libffi's `ffi_call`
#[derive(Debug, Clone, Copy, Default)]
pub struct LibffiDispatcher;

impl NativeDispatcher for LibffiDispatcher {
    unsafe fn dispatch(
        &self,
        address: u64,
        args: &[Vec<u8>],
        signature: &Signature,
        abi: Abi,
    ) -> FfiResult<Vec<u8>> {
        if address == 0 {
            return Err(FfiError::NullPointer);
        }
        if args.len() != signature.arity() {
            return Err(FfiError::ArityMismatch {
                expected: signature.arity(),
                got: args.len(),
            });
        }
        if abi != Abi::Default {
            trace!(?abi, "Calling convention mapped to the platform default");
        }

        let cif = signature.cif();

        // Word-aligned copies of every argument
        let mut storage: Vec<Vec<u64>> = args.iter().map(|image| to_words(image)).collect();
        let mut arg_ptrs: Vec<*mut c_void> = storage
            .iter_mut()
            .map(|words| words.as_mut_ptr() as *mut c_void)
            .collect();

        // libffi widens small integral returns to a full register
        let ret_size = signature.ret.size() as usize;
        let mut ret = vec![0u64; word_count(ret_size.max(8))];

        let code = CodePtr(address as usize as *mut c_void);
        libffi::raw::ffi_call(
            cif.as_raw_ptr(),
            Some(*code.as_safe_fun()),
            ret.as_mut_ptr() as *mut c_void,
            arg_ptrs.as_mut_ptr(),
        );

        let bytes: Vec<u8> = ret.iter().flat_map(|word| word.to_le_bytes()).collect();
        Ok(bytes[..ret_size].to_vec())
    }
}

fn to_words(image: &[u8]) -> Vec<u64> {
    let mut words = vec![0u64; word_count(image.len().max(1))];
    for (index, chunk) in image.chunks(8).enumerate() {
        let mut word = [0u8; 8];
        word[..chunk.len()].copy_from_slice(chunk);
        words[index] = u64::from_le_bytes(word);
    }
    words
}

fn word_count(bytes: usize) -> usize {
    (bytes + 7) / 8
}

/// Post-call hook: sees the decoded result and the original arguments and
/// may replace the result or fail the call
pub type ErrCheck = Arc<dyn Fn(Value, &[Value]) -> FfiResult<Value> + Send + Sync>;

/// A native function bound to a signature
#[derive(Clone)]
pub struct ForeignFunction {
    address: u64,
    signature: Signature,
    abi: Abi,
    errcheck: Option<ErrCheck>,
    /// Library the address lives in, kept mapped
    _library: Option<Arc<libloading::Library>>,
}

impl ForeignFunction {
    /// Bind `address` to `signature`
    ///
    /// # Safety
    ///
    /// `address` must stay a function whose prototype matches `signature`
    /// for as long as this value (or a clone) can be called.
    pub unsafe fn new(address: u64, signature: Signature) -> Self {
        Self {
            address,
            signature,
            abi: Abi::Default,
            errcheck: None,
            _library: None,
        }
    }

    pub fn with_abi(mut self, abi: Abi) -> Self {
        self.abi = abi;
        self
    }

    pub fn with_errcheck(
        mut self,
        errcheck: impl Fn(Value, &[Value]) -> FfiResult<Value> + Send + Sync + 'static,
    ) -> Self {
        self.errcheck = Some(Arc::new(errcheck));
        self
    }

    pub(crate) fn keep_alive(mut self, library: Arc<libloading::Library>) -> Self {
        self._library = Some(library);
        self
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn abi(&self) -> Abi {
        self.abi
    }

    /// Call with the default dispatcher
    pub fn call(&self, ctx: &FfiContext, args: &[Value]) -> FfiResult<Value> {
        self.call_with(&LibffiDispatcher, ctx, args)
    }

    /// Call through `dispatcher`
    ///
    /// Temporary C strings made for `string`/`wstring` arguments live until
    /// the call returns. errno is captured into `ctx` straight after the call.
    pub fn call_with(
        &self,
        dispatcher: &dyn NativeDispatcher,
        ctx: &FfiContext,
        args: &[Value],
    ) -> FfiResult<Value> {
        let (signature, marshal, images) = self.prepare(args)?;
        // SAFETY: the binding constructors carry the prototype contract
        let raw = unsafe { dispatcher.dispatch(self.address, &images, &signature, self.abi) };
        ctx.record_errno(errno());
        self.finish(&signature, marshal, raw?, args)
    }

    /// Call on tokio's blocking pool without blocking the current task
    ///
    /// Must be awaited inside a tokio runtime. Arguments are marshaled on the
    /// calling thread, which keeps every buffer the call can reach alive until
    /// the worker returns. errno is read on the worker and recorded into
    /// `ctx`. Dropping the future does not stop the native call; the buffers
    /// it uses are then leaked instead of freed.
    pub async fn call_async(&self, ctx: &FfiContext, args: &[Value]) -> FfiResult<Value> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| FfiError::Call(format!("async call outside a tokio runtime: {}", e)))?;
        let (signature, marshal, images) = self.prepare(args)?;
        let in_flight = InFlight {
            marshal: Some(marshal),
            borrowed: args.iter().filter_map(Value::as_buffer).cloned().collect(),
        };

        let address = self.address;
        let abi = self.abi;
        let worker_signature = signature.clone();
        let task = runtime.spawn_blocking(move || {
            // SAFETY: prototype contract as in `call_with`; the memory behind
            // every image is held by `in_flight` on the calling side
            let raw = unsafe { LibffiDispatcher.dispatch(address, &images, &worker_signature, abi) };
            (raw, errno())
        });
        let (raw, code) = task
            .await
            .map_err(|e| FfiError::Call(format!("async call worker failed: {}", e)))?;
        ctx.record_errno(code);

        let marshal = in_flight.complete();
        self.finish(&signature, marshal, raw?, args)
    }

    /// Resolve the call signature and build one image per argument
    fn prepare(&self, args: &[Value]) -> FfiResult<(Signature, MarshalContext, Vec<Vec<u8>>)> {
        let signature = self.signature.resolve(args)?;
        signature.validate()?;

        let mut marshal = MarshalContext::new();
        let images = args
            .iter()
            .zip(signature.args.iter())
            .map(|(arg, ty)| marshal.argument(arg, *ty))
            .collect::<FfiResult<Vec<_>>>()?;

        trace!(
            address = self.address,
            signature = %signature,
            extra = signature.arity() - self.signature.arity(),
            temporaries = marshal.allocated_count(),
            "Foreign call"
        );
        Ok((signature, marshal, images))
    }

    fn finish(
        &self,
        signature: &Signature,
        marshal: MarshalContext,
        raw: Vec<u8>,
        args: &[Value],
    ) -> FfiResult<Value> {
        let result = marshal.return_value(signature.ret, &raw)?;
        drop(marshal);

        match &self.errcheck {
            Some(check) => check(result, args),
            None => Ok(result),
        }
    }
}

/// Buffers an async call reaches through raw addresses
///
/// Dropped before the worker finishes, it leaks them rather than free memory
/// native code may still be using.
struct InFlight {
    marshal: Option<MarshalContext>,
    borrowed: Vec<NativeBuffer>,
}

impl InFlight {
    fn complete(mut self) -> MarshalContext {
        self.borrowed.clear();
        self.marshal.take().unwrap_or_default()
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(marshal) = self.marshal.take() {
            warn!(
                buffers = self.borrowed.len() + marshal.allocated_count(),
                "Async foreign call abandoned, leaking its argument buffers"
            );
            std::mem::forget(marshal);
            std::mem::forget(std::mem::take(&mut self.borrowed));
        }
    }
}

impl fmt::Debug for ForeignFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignFunction")
            .field("address", &format_args!("0x{:x}", self.address))
            .field("signature", &self.signature.to_string())
            .field("abi", &self.abi)
            .field("errcheck", &self.errcheck.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::raw::{c_double, c_int};

    extern "C" fn test_add(a: c_int, b: c_int) -> c_int {
        a + b
    }

    extern "C" fn test_scale(x: c_double, factor: f32) -> c_double {
        x * factor as c_double
    }

    extern "C" fn test_negate(x: i8) -> i8 {
        -x
    }

    fn bind(address: usize, args: Vec<CType>, ret: CType) -> ForeignFunction {
        unsafe { ForeignFunction::new(address as u64, Signature::new(args, ret)) }
    }

    #[test]
    fn test_call_add() {
        let func = bind(
            test_add as usize,
            vec![CType::Int32, CType::Int32],
            CType::Int32,
        );
        let result = func
            .call(&FfiContext::default(), &[Value::Int(10), Value::Int(20)])
            .unwrap();
        assert_eq!(result, Value::Int(30));
    }

    #[test]
    fn test_call_mixed_floats() {
        let func = bind(
            test_scale as usize,
            vec![CType::Double, CType::Float],
            CType::Double,
        );
        let result = func
            .call(&FfiContext::default(), &[Value::Float(1.5), Value::Int(4)])
            .unwrap();
        assert_eq!(result, Value::Float(6.0));
    }

    #[test]
    fn test_narrow_signed_return() {
        let func = bind(test_negate as usize, vec![CType::Int8], CType::Int8);
        let result = func.call(&FfiContext::default(), &[Value::Int(5)]).unwrap();
        assert_eq!(result, Value::Int(-5));
    }

    #[test]
    fn test_arity_mismatch() {
        let func = bind(
            test_add as usize,
            vec![CType::Int32, CType::Int32],
            CType::Int32,
        );
        let err = func
            .call(&FfiContext::default(), &[Value::Int(1)])
            .unwrap_err();
        assert!(matches!(
            err,
            FfiError::ArityMismatch {
                expected: 2,
                got: 1
            }
        ));
    }

    #[test]
    fn test_errcheck_replaces_result() {
        let func = bind(
            test_add as usize,
            vec![CType::Int32, CType::Int32],
            CType::Int32,
        )
        .with_errcheck(|result, args| match result {
            Value::Int(n) if n < 0 => Err(FfiError::Call(format!("negative sum of {:?}", args))),
            other => Ok(other),
        });
        let ctx = FfiContext::default();
        assert_eq!(
            func.call(&ctx, &[Value::Int(2), Value::Int(3)]).unwrap(),
            Value::Int(5)
        );
        assert!(matches!(
            func.call(&ctx, &[Value::Int(-2), Value::Int(-3)]),
            Err(FfiError::Call(_))
        ));
    }

    #[test]
    fn test_void_argument_rejected() {
        let func = bind(test_add as usize, vec![CType::Void], CType::Int32);
        assert!(matches!(
            func.call(&FfiContext::default(), &[Value::Null]),
            Err(FfiError::Type { .. })
        ));
    }

    #[test]
    fn test_null_address() {
        let func = bind(0, vec![], CType::Int32);
        assert!(matches!(
            func.call(&FfiContext::default(), &[]),
            Err(FfiError::NullPointer)
        ));
    }

    #[test]
    fn test_signature_display() {
        let signature = Signature::new([CType::Pointer, CType::SizeT], CType::Void);
        assert_eq!(signature.to_string(), "(pointer, size_t) -> void");
        let printf = Signature::variadic([CType::CString], CType::Int32);
        assert_eq!(printf.to_string(), "(string, ...) -> int32");
    }

    #[rstest::rstest]
    #[case(Value::Int(-7), CType::Int32)]
    #[case(Value::Int(i64::from(i32::MAX) + 1), CType::Int64)]
    #[case(Value::UInt(7), CType::UInt32)]
    #[case(Value::UInt(u64::MAX), CType::UInt64)]
    #[case(Value::Bool(true), CType::Int32)]
    #[case(Value::Float(0.5), CType::Double)]
    #[case(Value::from("x"), CType::CString)]
    #[case(Value::Null, CType::Pointer)]
    #[case(Value::Pointer(16), CType::Pointer)]
    fn test_promoted_type(#[case] value: Value, #[case] expected: CType) {
        assert_eq!(promoted_type(&value).unwrap(), expected);
    }

    #[test]
    fn test_variadic_resolution() {
        let printf = Signature::variadic([CType::CString], CType::Int32);
        let resolved = printf
            .resolve(&[Value::from("%d %f"), Value::Int(1), Value::Float(2.0)])
            .unwrap();
        assert_eq!(
            resolved.args,
            vec![CType::CString, CType::Int32, CType::Double]
        );
        assert_eq!(resolved.variadic, Some(1));

        assert!(matches!(
            printf.resolve(&[]),
            Err(FfiError::ArityMismatch {
                expected: 1,
                got: 0
            })
        ));
        assert!(matches!(
            printf.resolve(&[Value::from("%s"), Value::Array(vec![])]),
            Err(FfiError::Type { .. })
        ));
    }
}
