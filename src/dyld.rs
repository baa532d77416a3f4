//! Integration with the dynamic loader: image enumeration, the add-image
//! callback, and the gate that keeps anonymous mappings out of the walk.

use std::mem::MaybeUninit;
use std::sync::Once;

use crate::macho::MachHeader;
use crate::{apply, registry};

extern "C" {
    fn _dyld_register_func_for_add_image(
        callback: extern "C" fn(header: *const MachHeader, slide: isize),
    );
    fn _dyld_image_count() -> u32;
    fn _dyld_get_image_header(index: u32) -> *const MachHeader;
    fn _dyld_get_image_vmaddr_slide(index: u32) -> isize;
}

/// Invoked by the loader for every image already loaded at installation time
/// and for every image mapped afterwards, with the loader serializing the
/// calls. Applies the registry as it stands at invocation time.
extern "C" fn on_image_added(header: *const MachHeader, slide: isize) {
    if let Some(head) = registry::global() {
        // SAFETY: the loader hands us a currently mapped image
        unsafe { apply::rebind_image(head, header, slide) };
    }
}

/// Installs the add-image callback, at most once per process.
pub(crate) fn install_add_image_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // SAFETY: the callback is a static function and stays valid forever
        unsafe { _dyld_register_func_for_add_image(on_image_added) };
    });
}

/// Snapshot of the loader's current image list by count and index.
pub(crate) fn loaded_images() -> impl Iterator<Item = (*const MachHeader, isize)> {
    // SAFETY: indexed loader queries; an index gone stale after an unload
    // yields a null header, which the resolver gate rejects
    let count = unsafe { _dyld_image_count() };
    (0..count).map(|index| unsafe {
        (
            _dyld_get_image_header(index),
            _dyld_get_image_vmaddr_slide(index),
        )
    })
}

/// Whether the resolver can attribute `header` to a loaded file. Anonymous
/// or transient mappings fail this and are left alone.
pub(crate) fn image_resolvable(header: *const MachHeader) -> bool {
    let mut info = MaybeUninit::<libc::Dl_info>::uninit();
    // SAFETY: dladdr only writes the out-param
    unsafe { libc::dladdr(header.cast(), info.as_mut_ptr()) != 0 }
}
