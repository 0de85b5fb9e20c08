use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::error;
use txc_core::{Result, TxcError};

use crate::buffer::TCStr;
use crate::ffi::Api;

/// Install `f` as the connector's `SetCallbackEx` handler.
///
/// The returned box is the callback context; it must outlive every call the
/// connector may still make into it.
pub(crate) fn install<F>(api: &Arc<Api>, mut f: F) -> Result<BoxT>
where
    F: FnMut(TCStr) + Send + 'static,
{
    let owner = Arc::clone(api);
    register(api, move |ptr: NonNull<u8>| f(TCStr::new(ptr, Arc::clone(&owner))))
}

fn register<H>(api: &Api, handler: H) -> Result<BoxT>
where
    H: FnMut(NonNull<u8>) + Send + 'static,
{
    let ctx = BoxT::new(handler);
    // SAFETY: `trampoline::<H>` casts the context back to `H`, and the
    // caller keeps `ctx` alive while the callback can fire.
    if unsafe { api.set_callback_ex(trampoline::<H>, ctx.as_raw_ptr()) } {
        Ok(ctx)
    } else {
        Err(TxcError::Connector("SetCallbackEx rejected the callback".into()))
    }
}

// Registered via `SetCallbackEx` and executed on the connector's own thread.
extern "C" fn trampoline<H: FnMut(NonNull<u8>)>(buffer: *const u8, ctx: *mut c_void) -> bool {
    let Some(ptr) = NonNull::new(buffer.cast_mut()) else {
        error!("connector delivered a null buffer, skipping");
        return true;
    };

    // SAFETY: `ctx` is the `BoxT` created for exactly this `H` in `register`.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe { (*ctx.cast::<H>())(ptr) }));
    if let Err(payload) = outcome {
        abort_on_panic(payload);
    }
    true
}

#[cold]
#[inline(never)]
fn abort_on_panic(payload: Box<dyn std::any::Any + Send>) -> ! {
    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    error!("panic in connector callback: {reason}; aborting");
    std::process::abort()
}

/// `Box<T>` with the type erased, so closures of any type can serve as a
/// callback context.
#[derive(Debug)]
pub(crate) struct BoxT {
    boxed_ptr: *mut c_void,
    drop_fn: unsafe fn(*mut c_void),
}

// SAFETY: only constructed from `T: Send`.
unsafe impl Send for BoxT {}

impl BoxT {
    pub(crate) fn new<T: Send>(value: T) -> Self {
        Self { boxed_ptr: Box::into_raw(Box::new(value)).cast(), drop_fn: drop_t::<T> }
    }

    #[inline]
    pub(crate) fn as_raw_ptr(&self) -> *mut c_void {
        self.boxed_ptr
    }
}

impl Drop for BoxT {
    fn drop(&mut self) {
        // SAFETY: `drop_fn` was instantiated for the boxed type.
        unsafe { (self.drop_fn)(self.boxed_ptr) };
    }
}

unsafe fn drop_t<T>(ptr: *mut c_void) {
    debug_assert!(!ptr.is_null());
    drop(unsafe { Box::from_raw(ptr.cast::<T>()) });
}
