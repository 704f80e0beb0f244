//! Synthetic 64-bit little-endian Mach-O dylib builder for this crate's
//! unit tests, extending `macho-view`'s own test fixture shape with the
//! `LC_SEGMENT_SPLIT_INFO` + `MH_TWOLEVEL` bits the dependency graph and
//! placer need to see a "cache ready" candidate.

const LC_ID_DYLIB: u32 = 0xd;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_SEGMENT_64: u32 = 0x19;
const LC_SEGMENT_SPLIT_INFO: u32 = 0x1e;
const LC_SYMTAB: u32 = 0x2;
const MH_MAGIC_64: u32 = 0xfeedfacf;
const MH_DYLIB: u32 = 0x6;
const MH_TWOLEVEL: u32 = 0x80;
const CPU_TYPE_X86_64: u32 = 0x0100_0007;
const VM_PROT_READ: u32 = 0x1;
const VM_PROT_WRITE: u32 = 0x2;
const VM_PROT_EXECUTE: u32 = 0x4;

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_segment(out: &mut Vec<u8>, name: &str, vmaddr: u64, vmsize: u64, prot: u32) {
    let mut name16 = [0u8; 16];
    name16[..name.len()].copy_from_slice(name.as_bytes());
    push_u32(out, LC_SEGMENT_64);
    push_u32(out, 72);
    out.extend_from_slice(&name16);
    push_u64(out, vmaddr);
    push_u64(out, vmsize);
    push_u64(out, 0);
    push_u64(out, 0);
    push_u32(out, prot);
    push_u32(out, prot);
    push_u32(out, 0);
    push_u32(out, 0);
}

fn push_dylib_cmd(out: &mut Vec<u8>, cmd: u32, name: &str) {
    let mut name_bytes = name.as_bytes().to_vec();
    name_bytes.push(0);
    while !(24 + name_bytes.len()).is_multiple_of(8) {
        name_bytes.push(0);
    }
    push_u32(out, cmd);
    push_u32(out, (24 + name_bytes.len()) as u32);
    push_u32(out, 24);
    push_u32(out, 0);
    push_u32(out, 0);
    push_u32(out, 0);
    out.extend_from_slice(&name_bytes);
}

fn push_linkedit_data(out: &mut Vec<u8>, cmd: u32, dataoff: u32, datasize: u32) {
    push_u32(out, cmd);
    push_u32(out, 16);
    push_u32(out, dataoff);
    push_u32(out, datasize);
}

fn push_symtab(out: &mut Vec<u8>, symoff: u32, nsyms: u32, stroff: u32, strsize: u32) {
    push_u32(out, LC_SYMTAB);
    push_u32(out, 24);
    push_u32(out, symoff);
    push_u32(out, nsyms);
    push_u32(out, stroff);
    push_u32(out, strsize);
}

/// A minimal "shareable candidate" dylib: two-level namespace, split-seg
/// info present, TEXT executable-only, DATA writable, LINKEDIT last.
pub fn build_cache_ready_dylib(install_name: &str, deps: &[&str]) -> Vec<u8> {
    let mut commands = Vec::new();
    push_dylib_cmd(&mut commands, LC_ID_DYLIB, install_name);
    for dep in deps {
        push_dylib_cmd(&mut commands, LC_LOAD_DYLIB, dep);
    }
    push_segment(&mut commands, "__TEXT", 0x1000, 0x1000, VM_PROT_READ | VM_PROT_EXECUTE);
    push_segment(&mut commands, "__DATA", 0x2000, 0x1000, VM_PROT_READ | VM_PROT_WRITE);
    push_segment(&mut commands, "__LINKEDIT", 0x3000, 0x1000, VM_PROT_READ);
    push_linkedit_data(&mut commands, LC_SEGMENT_SPLIT_INFO, 0x3000, 0x10);
    push_symtab(&mut commands, 0x3010, 0, 0x3010, 0);

    let ncmds = 2 + deps.len() as u32 + 3;
    let mut data = Vec::new();
    push_u32(&mut data, MH_MAGIC_64);
    push_u32(&mut data, CPU_TYPE_X86_64);
    push_u32(&mut data, 3);
    push_u32(&mut data, MH_DYLIB);
    push_u32(&mut data, ncmds);
    push_u32(&mut data, commands.len() as u32);
    push_u32(&mut data, MH_TWOLEVEL);
    push_u32(&mut data, 0);
    data.extend_from_slice(&commands);
    while data.len() < 0x3010 {
        data.push(0);
    }
    data
}

/// A cache-ready dylib carrying `syms` as `N_SECT|N_EXT` defined-external
/// nlist_64 entries, for exercising the LINKEDIT merger's symbol handling.
pub fn build_dylib_with_symbols(syms: &[(&str, u64)]) -> Vec<u8> {
    const N_SECT: u8 = 0xe;
    const N_EXT: u8 = 0x1;

    let mut commands = Vec::new();
    push_dylib_cmd(&mut commands, LC_ID_DYLIB, "/usr/lib/libSyms.dylib");
    push_segment(&mut commands, "__TEXT", 0x1000, 0x1000, VM_PROT_READ | VM_PROT_EXECUTE);
    push_segment(&mut commands, "__DATA", 0x2000, 0x1000, VM_PROT_READ | VM_PROT_WRITE);
    push_segment(&mut commands, "__LINKEDIT", 0x3000, 0x1000, VM_PROT_READ);
    push_linkedit_data(&mut commands, LC_SEGMENT_SPLIT_INFO, 0x3000, 0x10);

    let mut strtab = vec![0u8];
    let mut symtab_bytes = Vec::new();
    for (name, value) in syms {
        let strx = strtab.len() as u32;
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
        push_u32(&mut symtab_bytes, strx);
        symtab_bytes.push(N_SECT | N_EXT);
        symtab_bytes.push(1);
        symtab_bytes.extend_from_slice(&0u16.to_le_bytes());
        push_u64(&mut symtab_bytes, *value);
    }
    let symoff = 0x3010u32;
    let stroff = symoff + symtab_bytes.len() as u32;
    push_symtab(&mut commands, symoff, syms.len() as u32, stroff, strtab.len() as u32);

    push_u32(&mut commands, 0xb); // LC_DYSYMTAB
    push_u32(&mut commands, 80);
    push_u32(&mut commands, 0); // ilocalsym
    push_u32(&mut commands, 0); // nlocalsym
    push_u32(&mut commands, 0); // iextdefsym
    push_u32(&mut commands, syms.len() as u32); // nextdefsym
    push_u32(&mut commands, syms.len() as u32); // iundefsym
    push_u32(&mut commands, 0); // nundefsym
    for _ in 0..12 {
        push_u32(&mut commands, 0);
    }

    let ncmds = 7u32;
    let mut data = Vec::new();
    push_u32(&mut data, MH_MAGIC_64);
    push_u32(&mut data, CPU_TYPE_X86_64);
    push_u32(&mut data, 3);
    push_u32(&mut data, MH_DYLIB);
    push_u32(&mut data, ncmds);
    push_u32(&mut data, commands.len() as u32);
    push_u32(&mut data, MH_TWOLEVEL);
    push_u32(&mut data, 0);
    data.extend_from_slice(&commands);

    while data.len() < symoff as usize {
        data.push(0);
    }
    data.extend_from_slice(&symtab_bytes);
    data.extend_from_slice(&strtab);
    data
}
