//! C ABI over the MedGemma runtime.
//!
//! The host app (Dart/Flutter via `dart:ffi`) drives everything through the
//! functions in this crate. Nothing here panics or unwinds across the
//! boundary: failures surface as null returns, zero counts, or bracketed
//! diagnostic strings delivered through the per-token callback.

use std::{
    ffi::{CStr, CString, c_char, c_int},
    panic::{AssertUnwindSafe, catch_unwind},
    path::Path,
    slice,
};

use medgemma_core::{MedGemmaEngine, inference, logging};
use tracing::{error, info};

/// Host-provided sink for decoded token fragments and diagnostics.
pub type TokenCallback = Option<unsafe extern "C" fn(*const c_char)>;

/// Attach (or with a null/empty path, detach) the file half of the log sink.
/// Call right after loading the library, before anything worth logging.
#[no_mangle]
pub extern "C" fn set_log_path(path: *const c_char) {
    logging::init();
    let path = unsafe { opt_str(path) };
    let result = match path.as_deref() {
        Some(p) if !p.is_empty() => logging::set_log_file(Some(Path::new(p))),
        _ => logging::set_log_file(None),
    };
    if let Err(err) = result {
        error!("set_log_path failed: {err:#}");
    }
}

/// Load the model from `model_dir` and return an opaque engine handle, or
/// null on failure. The handle must be released with [`unload_medgemma`].
#[no_mangle]
pub extern "C" fn load_medgemma_4bit(model_dir: *const c_char) -> *mut MedGemmaEngine {
    logging::init();
    let Some(model_dir) = (unsafe { opt_str(model_dir) }) else {
        error!("load_medgemma_4bit called with null path");
        return std::ptr::null_mut();
    };
    match catch_unwind(|| MedGemmaEngine::load(&model_dir)) {
        Ok(Ok(engine)) => {
            let handle = Box::into_raw(Box::new(engine));
            info!("engine ready, handle={handle:p}");
            handle
        }
        Ok(Err(err)) => {
            error!("load_medgemma_4bit failed: {err:#}");
            std::ptr::null_mut()
        }
        Err(_) => {
            error!("load_medgemma_4bit panicked");
            std::ptr::null_mut()
        }
    }
}

/// Free an engine handle. Null is a no-op.
#[no_mangle]
pub extern "C" fn unload_medgemma(handle: *mut MedGemmaEngine) {
    if handle.is_null() {
        return;
    }
    info!("unload_medgemma");
    drop(unsafe { Box::from_raw(handle) });
}

/// Tokenize `text` into `out_tokens` (capacity `max_tokens`); returns the
/// number of ids written. Null arguments yield 0.
#[no_mangle]
pub extern "C" fn medgemma_tokenize(
    handle: *mut MedGemmaEngine,
    text: *const c_char,
    out_tokens: *mut i64,
    max_tokens: c_int,
) -> c_int {
    if handle.is_null() || out_tokens.is_null() || max_tokens <= 0 {
        return 0;
    }
    let Some(text) = (unsafe { opt_str(text) }) else {
        return 0;
    };
    let engine = unsafe { &mut *handle };
    match engine.encode_prompt(&text) {
        Ok(ids) => {
            let count = ids.len().min(max_tokens as usize);
            unsafe { std::ptr::copy_nonoverlapping(ids.as_ptr(), out_tokens, count) };
            count as c_int
        }
        Err(err) => {
            error!("medgemma_tokenize failed: {err:#}");
            0
        }
    }
}

/// Run one complete inference. `image_bytes` may be null (or `image_len`
/// zero) for text-only generation; `max_tokens <= 0` selects the default
/// limit. The callback receives each decoded fragment in generation order,
/// plus diagnostics tagged `[IMG_ERR]`, `[WARN]`, `[ERR]` or `[EXCEPTION]`.
#[no_mangle]
pub extern "C" fn run_medgemma_inference(
    handle: *mut MedGemmaEngine,
    image_bytes: *const u8,
    image_len: c_int,
    prompt: *const c_char,
    max_tokens: c_int,
    callback: TokenCallback,
) {
    logging::init();
    let mut emit = |text: &str| {
        let Some(callback) = callback else { return };
        let sanitized;
        let text = if text.contains('\0') {
            sanitized = text.replace('\0', "");
            sanitized.as_str()
        } else {
            text
        };
        if let Ok(text) = CString::new(text) {
            unsafe { callback(text.as_ptr()) };
        }
    };

    if handle.is_null() {
        emit("[ERR] Engine handle is null");
        return;
    }

    lower_thread_priority();

    let engine = unsafe { &mut *handle };
    let prompt = unsafe { opt_str(prompt) }.unwrap_or_default();
    let image = if !image_bytes.is_null() && image_len > 0 {
        Some(unsafe { slice::from_raw_parts(image_bytes, image_len as usize) })
    } else {
        None
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        inference::run_inference(engine, image, &prompt, max_tokens, &mut emit);
    }));
    if outcome.is_err() {
        error!("inference panicked");
        emit("[EXCEPTION] inference worker panicked");
    }
}

/// Reload any vision session that was released to reclaim RAM during a
/// previous inference. Null is a no-op; errors are logged.
#[no_mangle]
pub extern "C" fn reset_inference_state(handle: *mut MedGemmaEngine) {
    if handle.is_null() {
        return;
    }
    info!("reset_inference_state");
    let engine = unsafe { &mut *handle };
    match catch_unwind(AssertUnwindSafe(|| engine.reset_inference_state())) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("reset_inference_state failed: {err:#}"),
        Err(_) => error!("reset_inference_state panicked"),
    }
}

/// Borrow a C string as an owned Rust string, if the pointer is non-null.
///
/// # Safety
/// `ptr` must be null or point at a NUL-terminated string.
unsafe fn opt_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// The generation loop saturates every core it is given; on Android drop to
/// batch scheduling so the host UI thread keeps its frame budget.
#[cfg(target_os = "android")]
fn lower_thread_priority() {
    unsafe {
        let param: libc::sched_param = std::mem::zeroed();
        libc::sched_setscheduler(0, libc::SCHED_BATCH, &param);
        libc::setpriority(libc::PRIO_PROCESS as _, 0, 10);
    }
}

#[cfg(not(target_os = "android"))]
fn lower_thread_priority() {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::sync::Mutex;

    static CAPTURED: Mutex<Vec<String>> = Mutex::new(Vec::new());

    unsafe extern "C" fn capture(text: *const c_char) {
        let text = unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned();
        CAPTURED.lock().unwrap().push(text);
    }

    #[test]
    fn null_handle_reports_error_through_callback() {
        CAPTURED.lock().unwrap().clear();
        run_medgemma_inference(ptr::null_mut(), ptr::null(), 0, ptr::null(), 8, Some(capture));
        assert_eq!(
            CAPTURED.lock().unwrap().as_slice(),
            ["[ERR] Engine handle is null"]
        );
    }

    #[test]
    fn null_handle_without_callback_does_not_crash() {
        run_medgemma_inference(ptr::null_mut(), ptr::null(), 0, ptr::null(), 8, None);
    }

    #[test]
    fn tokenize_rejects_null_arguments() {
        let mut out = [0i64; 4];
        assert_eq!(
            medgemma_tokenize(ptr::null_mut(), ptr::null(), out.as_mut_ptr(), 4),
            0
        );
        assert_eq!(medgemma_tokenize(ptr::null_mut(), ptr::null(), ptr::null_mut(), 4), 0);
    }

    #[test]
    fn unload_and_reset_tolerate_null() {
        unload_medgemma(ptr::null_mut());
        reset_inference_state(ptr::null_mut());
    }
}
