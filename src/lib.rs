//! Rebinding of Mach-O dynamically linked symbols in a running process.
//!
//! Calls to dynamically imported functions go through writable indirection
//! tables (the lazy and non-lazy symbol pointer sections of `__DATA` and
//! `__DATA_CONST`). This crate walks every loaded image, resolves the symbol
//! behind each indirect slot through the image's `__LINKEDIT` tables, and
//! swaps the slots of registered names for caller-supplied replacements,
//! handing back the previously bound address so a replacement can chain to
//! the original. Executable code is never modified.
//!
//! [`rebind_symbols`] registers process-wide: it patches every currently
//! loaded image and installs a loader callback so images loaded later are
//! patched as well. [`rebind_symbols_image`] patches exactly one image and
//! leaves no trace in the process-wide registry.
//!
//! Registered rebindings accumulate for the lifetime of the process; there is
//! no way to unregister. When the same name is registered more than once the
//! most recent registration wins.
//!
//! The walker and rewriter operate on plain memory and compile anywhere; the
//! registration entry points, which talk to the dynamic loader, exist only on
//! macOS.

mod apply;
mod errors;
pub mod macho;
mod registry;

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        mod dyld;
        mod mach;
    }
}

pub use errors::RebindError;

use std::ffi::c_void;
use std::ptr;

/// One requested interception of a dynamically imported function.
#[derive(Debug, Clone)]
pub struct Rebinding {
    /// The imported symbol's name as the image's string table stores it,
    /// minus the leading underscore the linker prepends. Matched exactly.
    pub name: String,
    /// The function pointer to install in matching indirect slots.
    pub replacement: *const c_void,
    /// Out-location that receives the previously bound address the first
    /// time a slot is rewritten, or null to forfeit chaining.
    pub original: *mut *const c_void,
}

impl Rebinding {
    /// A rebinding that discards the previously bound address.
    pub fn new(name: impl Into<String>, replacement: *const c_void) -> Self {
        Self {
            name: name.into(),
            replacement,
            original: ptr::null_mut(),
        }
    }

    /// A rebinding that stores the previously bound address through
    /// `original`, so the replacement can call through to it.
    pub fn with_original(
        name: impl Into<String>,
        replacement: *const c_void,
        original: *mut *const c_void,
    ) -> Self {
        Self {
            name: name.into(),
            replacement,
            original,
        }
    }
}

/// Registers `rebindings` process-wide: every currently loaded image is
/// patched, and images loaded from now on are patched as the loader announces
/// them.
///
/// The slice is copied; the caller may drop it on return. On allocation
/// failure nothing has been registered or patched.
///
/// # Safety
///
/// - Each `replacement` must be an `extern "C"` function pointer
///   ABI-compatible with the import it replaces.
/// - Each non-null `original` must point to writable pointer-sized storage
///   that outlives every use of the captured address.
/// - Registrations must be serialized by the caller; this crate performs no
///   locking of its own.
#[cfg(target_os = "macos")]
pub unsafe fn rebind_symbols(rebindings: &[Rebinding]) -> Result<(), RebindError> {
    let first = registry::prepend_global(rebindings)?;

    if first {
        // Installing the callback makes the loader invoke it once for every
        // image already loaded, then once per image loaded later, so the
        // initial sweep needs no explicit iteration
        dyld::install_add_image_hook();
    } else if let Some(head) = registry::global() {
        for (header, slide) in dyld::loaded_images() {
            apply::rebind_image(head, header, slide);
        }
    }

    Ok(())
}

/// Patches exactly the image identified by `header` and `slide` against
/// `rebindings`, without touching the process-wide registry or images loaded
/// later.
///
/// `header` and `slide` are typically obtained from the loader's image list
/// or from its add-image notifications.
///
/// # Safety
///
/// Same contract as [`rebind_symbols`], and `header`/`slide` must describe an
/// image currently mapped by the dynamic loader.
#[cfg(target_os = "macos")]
pub unsafe fn rebind_symbols_image(
    header: *const c_void,
    slide: isize,
    rebindings: &[Rebinding],
) -> Result<(), RebindError> {
    let batch = registry::Batch::copy_of(rebindings, ptr::null())?;
    apply::rebind_image(&batch, header.cast(), slide);
    Ok(())
}
