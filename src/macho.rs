//! Raw `usr/include/mach-o/loader.h` layouts and constants needed to walk a
//! loaded image's load-command stream in place.
//!
//! The 32-bit and 64-bit records are structurally identical but differ in
//! field widths and in the load-command code used for segments, so the
//! width-dependent layouts are selected once here and the rest of the crate
//! is written against the aliases.

use std::marker::PhantomData;

// usr/include/mach-o/loader.h, load command codes
pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_SEGMENT_64: u32 = 0x19;

// usr/include/mach-o/loader.h, mask for the type bits of a section's flags
pub const SECTION_TYPE: u32 = 0x000000ff;
// usr/include/mach-o/loader.h, section with only non-lazy symbol pointers
pub const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;
// usr/include/mach-o/loader.h, section with only lazy symbol pointers
pub const S_LAZY_SYMBOL_POINTERS: u32 = 0x7;

// usr/include/mach-o/loader.h, indirect symbol table sentinels for entries
// that don't name an external symbol
pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
pub const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;

// usr/include/mach-o/loader.h, segment names
pub const SEG_DATA: &[u8] = b"__DATA";
pub const SEG_DATA_CONST: &[u8] = b"__DATA_CONST";
pub const SEG_LINKEDIT: &[u8] = b"__LINKEDIT";

/// A segment or section name field, trimmed at the first nul. Names that
/// fill all 16 bytes carry no terminator.
pub fn fixed_name(raw: &[u8; 16]) -> &[u8] {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    &raw[..len]
}

// usr/include/mach-o/loader.h
#[repr(C)]
pub struct LoadCommandBase {
    pub cmd: u32,      // type of load command
    pub cmd_size: u32, // total size of the command in bytes
}

/// The symtab command describes the `nlist` symbol table and its companion
/// string table, both of which live in `__LINKEDIT`.
#[repr(C)]
pub struct SymtabCommand {
    pub cmd: u32,        // LC_SYMTAB
    pub cmd_size: u32,   // sizeof(struct symtab_command)
    pub sym_offset: u32, // file offset of the symbol table
    pub num_syms: u32,   // number of nlist entries
    pub str_offset: u32, // file offset of the string table
    pub str_size: u32,   // string table size in bytes
}

/// The dysymtab command; only the indirect symbol table members matter for
/// rebinding, the rest describe tables this crate never touches.
#[repr(C)]
pub struct DysymtabCommand {
    pub cmd: u32,      // LC_DYSYMTAB
    pub cmd_size: u32, // sizeof(struct dysymtab_command)
    pub local_sym_index: u32,
    pub num_local_syms: u32,
    pub ext_def_sym_index: u32,
    pub num_ext_def_syms: u32,
    pub undef_sym_index: u32,
    pub num_undef_syms: u32,
    pub toc_offset: u32,
    pub num_toc_entries: u32,
    pub mod_tab_offset: u32,
    pub num_modules: u32,
    pub ext_ref_sym_offset: u32,
    pub num_ext_ref_syms: u32,
    pub indirect_sym_offset: u32, // file offset of the indirect symbol table
    pub num_indirect_syms: u32,   // number of indirect symbol table entries
    pub ext_rel_offset: u32,
    pub num_ext_rels: u32,
    pub local_rel_offset: u32,
    pub num_local_rels: u32,
}

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// The segment load-command code matching this target's layouts.
        pub const LC_SEGMENT_NATIVE: u32 = LC_SEGMENT_64;

        // usr/include/mach-o/loader.h
        #[repr(C)]
        pub struct MachHeader {
            pub magic: u32,         // mach magic number identifier
            pub cpu_type: i32,      // cpu_type_t cpu specifier
            pub cpu_sub_type: i32,  // cpu_subtype_t machine specifier
            pub file_type: u32,     // type of file
            pub num_commands: u32,  // number of load commands
            pub size_commands: u32, // size of all the load commands
            pub flags: u32,
            __reserved: u32,
        }

        /*
         * The 64-bit segment load command indicates that a part of this file
         * is to be mapped into a 64-bit task's address space.  If the segment
         * has sections then section_64 structures directly follow the command
         * and their size is reflected in cmd_size.
         */
        #[repr(C)]
        pub struct SegmentCommand {
            pub cmd: u32,               // LC_SEGMENT_64
            pub cmd_size: u32,          // includes sizeof section_64 structs
            pub segment_name: [u8; 16], // string name of the segment
            pub vm_addr: u64,           // memory address the segment is mapped to
            pub vm_size: u64,           // total size of the segment
            pub file_off: u64,          // file offset of the segment
            pub file_size: u64,         // amount mapped from the file
            pub max_prot: i32,          // maximum VM protection
            pub init_prot: i32,         // initial VM protection
            pub num_sections: u32,      // number of sections in the segment
            pub flags: u32,
        }

        // usr/include/mach-o/loader.h
        #[repr(C)]
        pub struct Section {
            pub section_name: [u8; 16], // name of this section
            pub segment_name: [u8; 16], // segment this section goes in
            pub addr: u64,              // memory address of this section
            pub size: u64,              // size in bytes of this section
            pub offset: u32,            // file offset of this section
            pub align: u32,             // section alignment (power of 2)
            pub reloc_offset: u32,      // file offset of relocation entries
            pub num_relocs: u32,        // number of relocation entries
            pub flags: u32,             // flags (section type and attributes)
            pub reserved1: u32,         // reserved (for offset or index)
            pub reserved2: u32,         // reserved (for count or sizeof)
            pub reserved3: u32,         // reserved
        }

        // usr/include/mach-o/nlist.h
        #[repr(C)]
        pub struct Nlist {
            pub str_offset: u32, // n_strx, byte offset into the string table
            pub kind: u8,        // n_type, type flag
            pub section: u8,     // n_sect, section number or NO_SECT
            pub desc: u16,       // n_desc, see <mach-o/stab.h>
            pub value: u64,      // n_value, value of this symbol
        }
    } else {
        /// The segment load-command code matching this target's layouts.
        pub const LC_SEGMENT_NATIVE: u32 = LC_SEGMENT;

        // usr/include/mach-o/loader.h
        #[repr(C)]
        pub struct MachHeader {
            pub magic: u32,         // mach magic number identifier
            pub cpu_type: i32,      // cpu_type_t cpu specifier
            pub cpu_sub_type: i32,  // cpu_subtype_t machine specifier
            pub file_type: u32,     // type of file
            pub num_commands: u32,  // number of load commands
            pub size_commands: u32, // size of all the load commands
            pub flags: u32,
        }

        // usr/include/mach-o/loader.h
        #[repr(C)]
        pub struct SegmentCommand {
            pub cmd: u32,               // LC_SEGMENT
            pub cmd_size: u32,          // includes sizeof section structs
            pub segment_name: [u8; 16], // string name of the segment
            pub vm_addr: u32,           // memory address the segment is mapped to
            pub vm_size: u32,           // total size of the segment
            pub file_off: u32,          // file offset of the segment
            pub file_size: u32,         // amount mapped from the file
            pub max_prot: i32,          // maximum VM protection
            pub init_prot: i32,         // initial VM protection
            pub num_sections: u32,      // number of sections in the segment
            pub flags: u32,
        }

        // usr/include/mach-o/loader.h
        #[repr(C)]
        pub struct Section {
            pub section_name: [u8; 16], // name of this section
            pub segment_name: [u8; 16], // segment this section goes in
            pub addr: u32,              // memory address of this section
            pub size: u32,              // size in bytes of this section
            pub offset: u32,            // file offset of this section
            pub align: u32,             // section alignment (power of 2)
            pub reloc_offset: u32,      // file offset of relocation entries
            pub num_relocs: u32,        // number of relocation entries
            pub flags: u32,             // flags (section type and attributes)
            pub reserved1: u32,         // reserved (for offset or index)
            pub reserved2: u32,         // reserved (for count or sizeof)
        }

        // usr/include/mach-o/nlist.h
        #[repr(C)]
        pub struct Nlist {
            pub str_offset: u32, // n_strx, byte offset into the string table
            pub kind: u8,        // n_type, type flag
            pub section: u8,     // n_sect, section number or NO_SECT
            pub desc: i16,       // n_desc, see <mach-o/stab.h>
            pub value: u32,      // n_value, value of this symbol
        }
    }
}

impl SegmentCommand {
    /// The sections of a segment directly follow its load command.
    ///
    /// # Safety
    ///
    /// `self` must point into a mapped load-command stream whose `cmd_size`
    /// covers `num_sections` trailing section records.
    pub unsafe fn sections(&self) -> &[Section] {
        let first = (self as *const SegmentCommand).add(1).cast::<Section>();
        std::slice::from_raw_parts(first, self.num_sections as usize)
    }
}

/// The load commands this crate cares about; everything else in the stream
/// is skipped.
pub enum LoadCommand<'img> {
    Segment(&'img SegmentCommand),
    Symtab(&'img SymtabCommand),
    Dysymtab(&'img DysymtabCommand),
}

/// Walks the load-command stream that directly follows a mapped image's
/// header, advancing by each command's declared size.
pub struct LoadCommandsIter<'img> {
    next: *const u8,
    remaining_cmds: u32,
    remaining_bytes: usize,
    _img: PhantomData<&'img MachHeader>,
}

/// Builds an iterator over the load commands of a loaded image.
///
/// # Safety
///
/// `header` must point to the mapped header of a loaded image whose
/// `size_commands` bytes of load commands follow it in memory.
pub unsafe fn load_commands<'img>(header: *const MachHeader) -> LoadCommandsIter<'img> {
    LoadCommandsIter {
        next: header.add(1).cast(),
        remaining_cmds: (*header).num_commands,
        remaining_bytes: (*header).size_commands as usize,
        _img: PhantomData,
    }
}

impl<'img> Iterator for LoadCommandsIter<'img> {
    type Item = LoadCommand<'img>;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: we're interpreting raw image memory as C structs, bounded
        // by the sizes the header declared
        unsafe {
            loop {
                if self.remaining_cmds == 0
                    || self.remaining_bytes < std::mem::size_of::<LoadCommandBase>()
                {
                    return None;
                }

                let base = &*self.next.cast::<LoadCommandBase>();

                // The header lied about either size_commands or num_commands;
                // nothing past this point can be trusted
                let size = base.cmd_size as usize;
                if size < std::mem::size_of::<LoadCommandBase>() || size > self.remaining_bytes {
                    return None;
                }

                let cmd = match base.cmd {
                    LC_SEGMENT_NATIVE => {
                        Some(LoadCommand::Segment(&*self.next.cast::<SegmentCommand>()))
                    }
                    LC_SYMTAB => Some(LoadCommand::Symtab(&*self.next.cast::<SymtabCommand>())),
                    LC_DYSYMTAB => {
                        Some(LoadCommand::Dysymtab(&*self.next.cast::<DysymtabCommand>()))
                    }
                    // Just ignore any other load commands
                    _ => None,
                };

                self.remaining_cmds -= 1;
                self.remaining_bytes -= size;
                self.next = self.next.add(size);

                if let Some(cmd) = cmd {
                    return Some(cmd);
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining_cmds as usize))
    }
}
