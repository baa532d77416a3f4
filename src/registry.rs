//! The process-wide set of registered rebindings, kept as a prepend-only
//! linked list of immutable batches.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::errors::RebindError;
use crate::Rebinding;

/// One copied rebinding row.
pub(crate) struct Entry {
    /// Symbol name without the leading underscore the linker prepends.
    name: Box<[u8]>,
    replacement: *const c_void,
    original: *mut *const c_void,
}

impl Entry {
    fn copy_of(rebinding: &Rebinding) -> Result<Self, RebindError> {
        let mut name = Vec::new();
        name.try_reserve_exact(rebinding.name.len())?;
        name.extend_from_slice(rebinding.name.as_bytes());

        Ok(Self {
            name: name.into_boxed_slice(),
            replacement: rebinding.replacement,
            original: rebinding.original,
        })
    }

    /// Whether this entry names `stripped`, the string-table bytes following
    /// the linker's leading underscore.
    pub(crate) fn matches(&self, stripped: &[u8]) -> bool {
        *self.name == *stripped
    }

    pub(crate) fn replacement(&self) -> *const c_void {
        self.replacement
    }

    /// Hands the previously-bound address to the caller's out-slot, if one
    /// was provided.
    ///
    /// # Safety
    ///
    /// The out-slot pointer registered for this entry must still point to
    /// writable storage (the registration contract).
    pub(crate) unsafe fn capture_original(&self, bound: *const c_void) {
        if !self.original.is_null() {
            *self.original = bound;
        }
    }
}

/// An immutable copy of one registration, linked to the next-older batch.
pub(crate) struct Batch {
    entries: Box<[Entry]>,
    next: *const Batch,
}

// The raw pointers inside entries are covered by the safety contract of the
// registration entry points, and a batch is never mutated once constructed.
unsafe impl Send for Batch {}
unsafe impl Sync for Batch {}

impl Batch {
    /// Copies the caller's slice; the caller may drop it on return.
    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    pub(crate) fn copy_of(
        rebindings: &[Rebinding],
        next: *const Batch,
    ) -> Result<Self, RebindError> {
        let mut entries = Vec::new();
        entries.try_reserve_exact(rebindings.len())?;
        for rebinding in rebindings {
            entries.push(Entry::copy_of(rebinding)?);
        }

        Ok(Self {
            entries: entries.into_boxed_slice(),
            next,
        })
    }

    /// Flat iteration over every registered entry, newest batch first and in
    /// registration order within a batch, so the first match during a slot
    /// scan is the most recent registration for that name.
    pub(crate) fn entries(&self) -> Entries<'_> {
        Entries {
            batch: Some(self),
            index: 0,
        }
    }
}

pub(crate) struct Entries<'reg> {
    batch: Option<&'reg Batch>,
    index: usize,
}

impl<'reg> Iterator for Entries<'reg> {
    type Item = &'reg Entry;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let batch = self.batch?;
            if let Some(entry) = batch.entries.get(self.index) {
                self.index += 1;
                return Some(entry);
            }

            // SAFETY: `next` is null or a batch that stays alive as long as
            // the list it was linked into
            self.batch = unsafe { batch.next.as_ref() };
            self.index = 0;
        }
    }
}

/// Head of the process-wide registry. Nodes linked here are leaked: a
/// patched slot may be mid-call through a replacement that lives in one of
/// them, so they must outlive everything.
static HEAD: AtomicPtr<Batch> = AtomicPtr::new(ptr::null_mut());

/// Copies `rebindings` into a new node and publishes it as the new head.
/// Returns whether the registry was empty beforehand. On allocation failure
/// the head is left as it was.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) fn prepend_global(rebindings: &[Rebinding]) -> Result<bool, RebindError> {
    let old = HEAD.load(Ordering::Acquire);
    let node = Box::into_raw(Box::new(Batch::copy_of(rebindings, old)?));
    HEAD.store(node, Ordering::Release);
    Ok(old.is_null())
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) fn global() -> Option<&'static Batch> {
    // SAFETY: the head only ever moves from null to fully constructed nodes,
    // and nodes are never freed
    unsafe { HEAD.load(Ordering::Acquire).as_ref() }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rebinding(name: &str, replacement: usize) -> Rebinding {
        Rebinding {
            name: name.into(),
            replacement: replacement as *const c_void,
            original: ptr::null_mut(),
        }
    }

    #[test]
    fn entries_iterate_newest_batch_first() {
        let older = Batch::copy_of(
            &[rebinding("open", 0x10), rebinding("close", 0x20)],
            ptr::null(),
        )
        .unwrap();
        let newer = Batch::copy_of(&[rebinding("close", 0x30)], &older).unwrap();

        let replacements: Vec<_> = newer.entries().map(|e| e.replacement() as usize).collect();
        assert_eq!(replacements, [0x30, 0x10, 0x20]);

        // A head-first scan for "close" hits the newer registration
        let winner = newer
            .entries()
            .find(|e| e.matches(b"close"))
            .expect("close is registered");
        assert_eq!(winner.replacement() as usize, 0x30);
    }

    #[test]
    fn match_is_exact() {
        let batch = Batch::copy_of(&[rebinding("close", 0x10)], ptr::null()).unwrap();
        let entry = batch.entries().next().unwrap();

        assert!(entry.matches(b"close"));
        assert!(!entry.matches(b"clos"));
        assert!(!entry.matches(b"close$NOCANCEL"));
    }

    #[test]
    fn copies_are_independent_of_the_callers_slice() {
        let caller = vec![rebinding("getpid", 0x40)];
        let batch = Batch::copy_of(&caller, ptr::null()).unwrap();
        drop(caller);

        let entry = batch.entries().next().unwrap();
        assert!(entry.matches(b"getpid"));
        assert_eq!(entry.replacement() as usize, 0x40);
    }

    #[test]
    fn prepend_reports_first_registration_once() {
        // The only test that touches the process-wide head
        assert!(prepend_global(&[rebinding("first", 0x1)]).unwrap());
        assert!(!prepend_global(&[rebinding("second", 0x2)]).unwrap());

        let head = global().expect("head was published");
        let names: Vec<_> = head.entries().map(|e| e.replacement() as usize).collect();
        assert_eq!(names, [0x2, 0x1]);
    }
}
