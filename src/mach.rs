//! Helpers over the `mach2` VM bindings for writing through pages that are
//! read-only at rest.

use std::ffi::c_void;
use std::mem;

use mach2::{
    kern_return::KERN_SUCCESS,
    message::mach_msg_type_number_t,
    port::mach_port_t,
    traps::mach_task_self,
    vm::mach_vm_region,
    vm_prot::{vm_prot_t, VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE},
    vm_region::{vm_region_basic_info_data_64_t, VM_REGION_BASIC_INFO_64},
    vm_types::{mach_vm_address_t, mach_vm_size_t},
};

/// The kernel's protection for the region containing `addr`. Falls back to
/// read-only when the query fails or reports an unwritable region.
fn protection_at(addr: *const c_void) -> vm_prot_t {
    let mut address = addr as mach_vm_address_t;
    let mut size: mach_vm_size_t = 0;
    let mut info = mem::MaybeUninit::<vm_region_basic_info_data_64_t>::uninit();
    let mut count = (mem::size_of::<vm_region_basic_info_data_64_t>()
        / mem::size_of::<libc::c_int>()) as mach_msg_type_number_t;
    let mut object_name: mach_port_t = 0;

    // SAFETY: syscall
    let kr = unsafe {
        mach_vm_region(
            mach_task_self(),
            &mut address,
            &mut size,
            VM_REGION_BASIC_INFO_64,
            info.as_mut_ptr().cast(),
            &mut count,
            &mut object_name,
        )
    };

    if kr == KERN_SUCCESS {
        // SAFETY: the kernel filled the info on success
        let info = unsafe { info.assume_init() };
        if info.protection & VM_PROT_WRITE != 0 {
            return info.protection;
        }
    }

    VM_PROT_READ
}

/// Translates kernel `VM_PROT_*` bits into the `PROT_*` bits `mprotect`
/// takes.
fn as_posix_prot(prot: vm_prot_t) -> libc::c_int {
    let mut posix = 0;
    if prot & VM_PROT_READ != 0 {
        posix |= libc::PROT_READ;
    }
    if prot & VM_PROT_WRITE != 0 {
        posix |= libc::PROT_WRITE;
    }
    if prot & VM_PROT_EXECUTE != 0 {
        posix |= libc::PROT_EXEC;
    }
    posix
}

/// Scoped read|write access to a pointer-table range. Dropping the guard
/// restores the protection captured at open time, so every exit path out of
/// a rewrite puts the pages back.
pub(crate) struct WritableRange {
    start: *mut c_void,
    len: usize,
    restore: libc::c_int,
}

impl WritableRange {
    /// Opens `start..start + len` for writing. The protection to restore is
    /// sampled from `reference`, which must be an address that is already
    /// mapped writable.
    ///
    /// # Safety
    ///
    /// The range must cover memory this process owns; a failed transition
    /// surfaces as a fault on the subsequent slot write, not here.
    pub(crate) unsafe fn open(start: *mut c_void, len: usize, reference: *const c_void) -> Self {
        let restore = as_posix_prot(protection_at(reference));
        libc::mprotect(start, len, libc::PROT_READ | libc::PROT_WRITE);
        Self {
            start,
            len,
            restore,
        }
    }
}

impl Drop for WritableRange {
    fn drop(&mut self) {
        // SAFETY: restoring the protection captured at open time over the
        // same range
        unsafe {
            libc::mprotect(self.start, self.len, self.restore);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn translates_each_protection_bit() {
        assert_eq!(as_posix_prot(VM_PROT_READ), libc::PROT_READ);
        assert_eq!(as_posix_prot(VM_PROT_WRITE), libc::PROT_WRITE);
        assert_eq!(as_posix_prot(VM_PROT_EXECUTE), libc::PROT_EXEC);
    }

    #[test]
    fn translates_combined_protections() {
        assert_eq!(
            as_posix_prot(VM_PROT_READ | VM_PROT_WRITE),
            libc::PROT_READ | libc::PROT_WRITE
        );
        assert_eq!(
            as_posix_prot(VM_PROT_READ | VM_PROT_WRITE | VM_PROT_EXECUTE),
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
        );
        assert_eq!(as_posix_prot(0), 0);
    }

    #[test]
    fn ignores_bits_mprotect_does_not_take() {
        // VM_PROT_COPY and friends live above the rwx bits
        let exotic = (VM_PROT_READ | VM_PROT_WRITE) | 0x10;
        assert_eq!(as_posix_prot(exotic), libc::PROT_READ | libc::PROT_WRITE);
    }

    #[test]
    fn writable_query_reports_a_writable_region() {
        // The restore protection sampled from heap memory must at least
        // allow the write access the query saw
        let probe = Box::new(0u64);
        let prot = protection_at((&*probe as *const u64).cast());
        assert_ne!(prot & VM_PROT_WRITE, 0);
        assert_ne!(as_posix_prot(prot) & libc::PROT_WRITE, 0);
    }
}
