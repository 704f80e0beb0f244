//! Cache file header, mapping table, and image table encoding.
//!
//! Grounded on `dyld_cache_header`/`dyld_cache_mapping_info`/
//! `dyld_cache_image_info` in `launch-cache/dyld_cache_format.h`. The magic
//! is always `"dyld_v1"` followed by a right-justified, NUL-padded
//! architecture name filling out 16 bytes total, matching the real format's
//! per-architecture magic strings (`"dyld_v1  x86_64"`, `"dyld_v1   arm64"`,
//! ...).

use crate::placer::Mapping;
use macho_view::arch::{Arch, CpuFamily};

pub const MAGIC_LEN: usize = 16;
pub const HEADER_SIZE: usize = 0x100;

fn arch_name(arch: &Arch) -> &'static str {
    match (arch.family, arch.is_64()) {
        (CpuFamily::X86, false) => "i386",
        (CpuFamily::X86_64, true) => "x86_64",
        (CpuFamily::Arm, false) => "arm",
        (CpuFamily::Arm64, true) => "arm64",
        _ => "unknown",
    }
}

pub fn magic(arch: &Arch) -> [u8; MAGIC_LEN] {
    let mut out = [0u8; MAGIC_LEN];
    let prefix = b"dyld_v1";
    out[..prefix.len()].copy_from_slice(prefix);
    let name = arch_name(arch);
    let start = MAGIC_LEN - name.len();
    out[start..].copy_from_slice(name.as_bytes());
    out
}

/// One `dyld_cache_image_info` entry: a dylib's install path (stored as an
/// offset into the string pool trailing the mapping/image tables) plus its
/// placed address and per-dylib modification stamp.
#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub address: u64,
    pub mod_time: u64,
    pub inode: u64,
    pub path_offset: u32,
}

/// An install-name alias (§4.3's alias table): a second path string that
/// resolves to the same image, recorded as its own entry sharing the
/// target's address.
#[derive(Debug, Clone)]
pub struct AliasEntry {
    pub address: u64,
    pub mod_time: u64,
    pub inode: u64,
    pub path_offset: u32,
}

pub struct CacheHeaderInputs<'a> {
    pub arch: &'a Arch,
    pub mappings: &'a [Mapping],
    pub images: &'a [ImageEntry],
    pub aliases: &'a [AliasEntry],
    pub dyld_base_address: u64,
    pub code_signature_off: u64,
    pub code_signature_size: u64,
    pub slide_info_off: u64,
    pub slide_info_size: u64,
    pub local_symbols_off: u64,
    pub local_symbols_size: u64,
    pub uuid: [u8; 16],
}

/// Serializes the header, mapping table, and combined image+alias table.
/// Returns `(bytes, image_table_offset)`; the caller appends the path
/// string pool immediately after and is responsible for keeping
/// `path_offset` consistent with where it actually lands.
pub fn build(inputs: &CacheHeaderInputs) -> Vec<u8> {
    let mut out = vec![0u8; HEADER_SIZE];
    out[0..MAGIC_LEN].copy_from_slice(&magic(inputs.arch));

    let mapping_offset = HEADER_SIZE as u32;
    let mapping_count = inputs.mappings.len() as u32;
    let image_offset = mapping_offset + mapping_count * mapping_entry_size() as u32;
    let image_count = (inputs.images.len() + inputs.aliases.len()) as u32;

    write_u32(&mut out, 0x10, mapping_offset);
    write_u32(&mut out, 0x14, mapping_count);
    write_u32(&mut out, 0x18, image_offset);
    write_u32(&mut out, 0x1c, image_count);
    write_u64(&mut out, 0x20, inputs.dyld_base_address);
    write_u64(&mut out, 0x28, inputs.code_signature_off);
    write_u64(&mut out, 0x30, inputs.code_signature_size);
    write_u64(&mut out, 0x38, inputs.slide_info_off);
    write_u64(&mut out, 0x40, inputs.slide_info_size);
    write_u64(&mut out, 0x48, inputs.local_symbols_off);
    write_u64(&mut out, 0x50, inputs.local_symbols_size);
    out[0x58..0x68].copy_from_slice(&inputs.uuid);

    for mapping in inputs.mappings {
        out.extend_from_slice(&mapping.start_va.to_le_bytes());
        out.extend_from_slice(&mapping.size.to_le_bytes());
        out.extend_from_slice(&mapping.file_off.to_le_bytes());
        out.extend_from_slice(&mapping.max_prot.to_le_bytes());
        out.extend_from_slice(&mapping.init_prot.to_le_bytes());
    }

    for img in inputs.images {
        out.extend_from_slice(&img.address.to_le_bytes());
        out.extend_from_slice(&img.mod_time.to_le_bytes());
        out.extend_from_slice(&img.inode.to_le_bytes());
        out.extend_from_slice(&img.path_offset.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // padding to 8-byte align next entry
    }
    for alias in inputs.aliases {
        out.extend_from_slice(&alias.address.to_le_bytes());
        out.extend_from_slice(&alias.mod_time.to_le_bytes());
        out.extend_from_slice(&alias.inode.to_le_bytes());
        out.extend_from_slice(&alias.path_offset.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
    }

    out
}

fn mapping_entry_size() -> usize {
    8 + 8 + 8 + 4 + 4
}

fn write_u32(out: &mut [u8], off: usize, v: u32) {
    out[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
fn write_u64(out: &mut [u8], off: usize, v: u64) {
    out[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// MD5 of the whole pre-signing cache buffer, with the RFC 4122 §4.3
/// version-3 variant bits forced in, matching the real cache's UUID
/// derivation (a name-based UUID over the file's own bytes rather than a
/// randomly generated one, so two builds from identical inputs agree).
pub fn derive_uuid(data: &[u8]) -> [u8; 16] {
    let mut digest = md5(data);
    digest[6] = (digest[6] & 0x0f) | 0x30; // version 3
    digest[8] = (digest[8] & 0x3f) | 0x80; // RFC 4122 variant
    digest
}

fn md5(data: &[u8]) -> [u8; 16] {
    const S: [u32; 64] = [
        7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 5, 9, 14, 20, 5, 9, 14, 20, 5, 9, 14, 20, 5, 9, 14, 20, 4, 11, 16, 23,
        4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21,
    ];
    const K: [u32; 64] = [
        0xd76aa478, 0xe8c7b756, 0x242070db, 0xc1bdceee, 0xf57c0faf, 0x4787c62a, 0xa8304613, 0xfd469501, 0x698098d8, 0x8b44f7af,
        0xffff5bb1, 0x895cd7be, 0x6b901122, 0xfd987193, 0xa679438e, 0x49b40821, 0xf61e2562, 0xc040b340, 0x265e5a51, 0xe9b6c7aa,
        0xd62f105d, 0x02441453, 0xd8a1e681, 0xe7d3fbc8, 0x21e1cde6, 0xc33707d6, 0xf4d50d87, 0x455a14ed, 0xa9e3e905, 0xfcefa3f8,
        0x676f02d9, 0x8d2a4c8a, 0xfffa3942, 0x8771f681, 0x6d9d6122, 0xfde5380c, 0xa4beea44, 0x4bdecfa9, 0xf6bb4b60, 0xbebfbc70,
        0x289b7ec6, 0xeaa127fa, 0xd4ef3085, 0x04881d05, 0xd9d4d039, 0xe6db99e5, 0x1fa27cf8, 0xc4ac5665, 0xf4292244, 0x432aff97,
        0xab9423a7, 0xfc93a039, 0x655b59c3, 0x8f0ccc92, 0xffeff47d, 0x85845dd1, 0x6fa87e4f, 0xfe2ce6e0, 0xa3014314, 0x4e0811a1,
        0xf7537e82, 0xbd3af235, 0x2ad7d2bb, 0xeb86d391,
    ];
    let mut a0: u32 = 0x67452301;
    let mut b0: u32 = 0xefcdab89;
    let mut c0: u32 = 0x98badcfe;
    let mut d0: u32 = 0x10325476;

    let mut msg = data.to_vec();
    let bit_len = (data.len() as u64).wrapping_mul(8);
    msg.push(0x80);
    while msg.len() % 64 != 56 {
        msg.push(0);
    }
    msg.extend_from_slice(&bit_len.to_le_bytes());

    for chunk in msg.chunks(64) {
        let mut m = [0u32; 16];
        for (i, word) in chunk.chunks(4).enumerate() {
            m[i] = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        }
        let (mut a, mut b, mut c, mut d) = (a0, b0, c0, d0);
        for i in 0..64 {
            let (f, g) = match i {
                0..=15 => ((b & c) | (!b & d), i),
                16..=31 => ((d & b) | (!d & c), (5 * i + 1) % 16),
                32..=47 => (b ^ c ^ d, (3 * i + 5) % 16),
                _ => (c ^ (b | !d), (7 * i) % 16),
            };
            let f = f.wrapping_add(a).wrapping_add(K[i]).wrapping_add(m[g]);
            a = d;
            d = c;
            c = b;
            b = b.wrapping_add(f.rotate_left(S[i]));
        }
        a0 = a0.wrapping_add(a);
        b0 = b0.wrapping_add(b);
        c0 = c0.wrapping_add(c);
        d0 = d0.wrapping_add(d);
    }

    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&a0.to_le_bytes());
    out[4..8].copy_from_slice(&b0.to_le_bytes());
    out[8..12].copy_from_slice(&c0.to_le_bytes());
    out[12..16].copy_from_slice(&d0.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_matches_known_vector() {
        assert_eq!(hex(&md5(b"")), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(hex(&md5(b"abc")), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn uuid_has_v3_variant_bits() {
        let uuid = derive_uuid(b"some cache bytes");
        assert_eq!(uuid[6] >> 4, 3);
        assert_eq!(uuid[8] >> 6, 0b10);
    }

    #[test]
    fn magic_is_right_justified() {
        let arch = Arch::from_cpu(0x0100_0007, 3).unwrap();
        let m = magic(&arch);
        assert_eq!(&m[..7], b"dyld_v1");
        assert_eq!(&m[m.len() - 6..], b"x86_64");
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
