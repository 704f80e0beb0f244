//! Tiny synthetic Mach-O builders shared by unit tests across this crate.
//! Produces 64-bit little-endian dylib slices with no real section data —
//! just enough load-command structure for the parsers under test.

use crate::macho_const::*;

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_segment(out: &mut Vec<u8>, name: &str, vmaddr: u64, vmsize: u64) {
    let mut name16 = [0u8; 16];
    name16[..name.len()].copy_from_slice(name.as_bytes());
    push_u32(out, LC_SEGMENT_64);
    push_u32(out, 72);
    out.extend_from_slice(&name16);
    push_u64(out, vmaddr);
    push_u64(out, vmsize);
    push_u64(out, 0); // fileoff
    push_u64(out, 0); // filesize
    push_u32(out, VM_PROT_READ | VM_PROT_WRITE);
    push_u32(out, VM_PROT_READ | VM_PROT_WRITE);
    push_u32(out, 0); // nsects
    push_u32(out, 0); // flags
}

fn push_dylib_cmd(out: &mut Vec<u8>, cmd: u32, name: &str) {
    let mut name_bytes = name.as_bytes().to_vec();
    name_bytes.push(0);
    while (24 + name_bytes.len()) % 8 != 0 {
        name_bytes.push(0);
    }
    push_u32(out, cmd);
    push_u32(out, (24 + name_bytes.len()) as u32);
    push_u32(out, 24); // name_offset
    push_u32(out, 0); // timestamp
    push_u32(out, 0); // current_version
    push_u32(out, 0); // compatibility_version
    out.extend_from_slice(&name_bytes);
}

/// Builds a minimal 64-bit x86_64 dylib slice with an `LC_ID_DYLIB` of
/// `install_name`, one `LC_LOAD_DYLIB` per entry in `deps`, and
/// `__TEXT`/`__DATA`/`__LINKEDIT` segments.
pub fn build_dylib(install_name: &str, deps: &[&str], _extra: &[u8]) -> Vec<u8> {
    let mut commands = Vec::new();
    push_dylib_cmd(&mut commands, LC_ID_DYLIB, install_name);
    for dep in deps {
        push_dylib_cmd(&mut commands, LC_LOAD_DYLIB, dep);
    }
    push_segment(&mut commands, "__TEXT", 0x1000, 0x1000);
    push_segment(&mut commands, "__DATA", 0x2000, 0x1000);
    push_segment(&mut commands, "__LINKEDIT", 0x3000, 0x1000);

    let ncmds = 1 + deps.len() as u32 + 3;
    let mut data = Vec::new();
    push_u32(&mut data, MH_MAGIC_64);
    push_u32(&mut data, CPU_TYPE_X86_64);
    push_u32(&mut data, 3);
    push_u32(&mut data, MH_DYLIB);
    push_u32(&mut data, ncmds);
    push_u32(&mut data, commands.len() as u32);
    push_u32(&mut data, MH_TWOLEVEL);
    push_u32(&mut data, 0); // reserved
    data.extend_from_slice(&commands);
    data
}

/// Appends an `LC_RPATH` command to a slice built by [`build_dylib`], fixing
/// up `ncmds`/`sizeofcmds` in the header. Only valid for slices with no file
/// data after their load commands, which is all `build_dylib` produces.
pub fn append_rpath(data: &mut Vec<u8>, path: &str) {
    let mut path_bytes = path.as_bytes().to_vec();
    path_bytes.push(0);
    while (12 + path_bytes.len()) % 8 != 0 {
        path_bytes.push(0);
    }
    let mut cmd = Vec::new();
    push_u32(&mut cmd, LC_RPATH);
    push_u32(&mut cmd, (12 + path_bytes.len()) as u32);
    push_u32(&mut cmd, 12); // path offset
    cmd.extend_from_slice(&path_bytes);

    let ncmds = u32::from_le_bytes(data[16..20].try_into().unwrap());
    let sizeofcmds = u32::from_le_bytes(data[20..24].try_into().unwrap());
    data[16..20].copy_from_slice(&(ncmds + 1).to_le_bytes());
    data[20..24].copy_from_slice(&(sizeofcmds + cmd.len() as u32).to_le_bytes());
    data.extend_from_slice(&cmd);
}
