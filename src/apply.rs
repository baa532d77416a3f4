//! The image walker and section rewriter: locates the `__LINKEDIT` tables of
//! one loaded image, filters the indirect pointer sections of its data
//! segments, and swaps every slot whose symbol is registered.

use std::ffi::{c_void, CStr};

use crate::macho::{
    fixed_name, load_commands, LoadCommand, MachHeader, Nlist, Section, INDIRECT_SYMBOL_ABS,
    INDIRECT_SYMBOL_LOCAL, SECTION_TYPE, SEG_DATA, SEG_DATA_CONST, SEG_LINKEDIT,
    S_LAZY_SYMBOL_POINTERS, S_NON_LAZY_SYMBOL_POINTERS,
};
use crate::registry::Batch;

/// Pointers into an image's `__LINKEDIT` metadata, derived once per walk.
struct ImageView {
    symtab: *const Nlist,
    strtab: *const u8,
    indirect_symtab: *const u32,
}

/// Applies every entry reachable from `registry` to one loaded image.
///
/// # Safety
///
/// `header` and `slide` must describe an image currently mapped by the
/// dynamic loader.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) unsafe fn rebind_image(registry: &Batch, header: *const MachHeader, slide: isize) {
    #[cfg(target_os = "macos")]
    if !crate::dyld::image_resolvable(header) {
        log::trace!("skipping image at {header:p}: not attributable to a loaded file");
        return;
    }

    rebind_image_unchecked(registry, header, slide);
}

/// The walk itself, past the resolver gate.
///
/// # Safety
///
/// `header` must point to a Mach-O header whose load commands and referenced
/// tables are mapped at the addresses its fields and `slide` imply.
unsafe fn rebind_image_unchecked(registry: &Batch, header: *const MachHeader, slide: isize) {
    let mut linkedit = None;
    let mut symtab_cmd = None;
    let mut dysymtab_cmd = None;

    for cmd in load_commands(header) {
        match cmd {
            LoadCommand::Segment(seg) if fixed_name(&seg.segment_name) == SEG_LINKEDIT => {
                linkedit = Some(seg);
            }
            LoadCommand::Symtab(symtab) => symtab_cmd = Some(symtab),
            LoadCommand::Dysymtab(dysymtab) => dysymtab_cmd = Some(dysymtab),
            _ => {}
        }
    }

    let (Some(linkedit), Some(symtab_cmd), Some(dysymtab_cmd)) =
        (linkedit, symtab_cmd, dysymtab_cmd)
    else {
        log::trace!("skipping image at {header:p}: linker metadata incomplete");
        return;
    };

    if dysymtab_cmd.num_indirect_syms == 0 {
        log::trace!("skipping image at {header:p}: no indirect symbols");
        return;
    }

    // __LINKEDIT contents are addressed relative to where the segment landed,
    // not relative to the image header
    let linkedit_base = (slide as usize)
        .wrapping_add(linkedit.vm_addr as usize)
        .wrapping_sub(linkedit.file_off as usize);
    let view = ImageView {
        symtab: linkedit_base.wrapping_add(symtab_cmd.sym_offset as usize) as *const Nlist,
        strtab: linkedit_base.wrapping_add(symtab_cmd.str_offset as usize) as *const u8,
        indirect_symtab: linkedit_base.wrapping_add(dysymtab_cmd.indirect_sym_offset as usize)
            as *const u32,
    };

    for cmd in load_commands(header) {
        let LoadCommand::Segment(seg) = cmd else {
            continue;
        };
        let seg_name = fixed_name(&seg.segment_name);
        if seg_name != SEG_DATA && seg_name != SEG_DATA_CONST {
            continue;
        }

        for section in seg.sections() {
            match section.flags & SECTION_TYPE {
                S_LAZY_SYMBOL_POINTERS | S_NON_LAZY_SYMBOL_POINTERS => {
                    rebind_section(registry, section, slide, &view);
                }
                _ => {}
            }
        }
    }
}

/// Rewrites the slots of one lazy or non-lazy pointer section.
unsafe fn rebind_section(registry: &Batch, section: &Section, slide: isize, view: &ImageView) {
    let indices = view.indirect_symtab.add(section.reserved1 as usize);
    let slots = (slide as usize).wrapping_add(section.addr as usize) as *mut *const c_void;
    let num_slots = section.size as usize / std::mem::size_of::<*const c_void>();

    // __DATA_CONST pages are read-only at rest and have to be opened up for
    // the duration of the rewrite
    #[cfg(target_os = "macos")]
    let _writable = (fixed_name(&section.segment_name) == SEG_DATA_CONST).then(|| {
        crate::mach::WritableRange::open(
            slots.cast(),
            section.size as usize,
            (registry as *const Batch).cast(),
        )
    });

    'slots: for i in 0..num_slots {
        let sym_index = *indices.add(i);
        if sym_index == INDIRECT_SYMBOL_ABS
            || sym_index == INDIRECT_SYMBOL_LOCAL
            || sym_index == (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS)
        {
            continue;
        }

        let str_offset = (*view.symtab.add(sym_index as usize)).str_offset;
        let name = view.strtab.add(str_offset as usize);
        // The first byte is the underscore the linker prepends; a one-byte
        // name carries nothing to match
        if *name == 0 || *name.add(1) == 0 {
            continue;
        }
        let stripped = CStr::from_ptr(name.add(1).cast()).to_bytes();

        for entry in registry.entries() {
            if entry.matches(stripped) {
                let slot = slots.add(i);
                let bound = *slot;
                if bound != entry.replacement() {
                    entry.capture_original(bound);
                }
                *slot = entry.replacement();
                log::debug!("rebound _{} at {slot:p}", stripped.escape_ascii());
                continue 'slots;
            }
        }
    }
}
