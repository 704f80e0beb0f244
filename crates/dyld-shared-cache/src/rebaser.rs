//! C5 — rebaser.
//!
//! Grounded on `MachORebaser<A>::rebase`/`adjustExportInfo` in
//! `launch-cache/MachORebaser.hpp` and the split-seg fix-up recipes in
//! `launch-cache/CacheFileAbstraction.hpp`'s `AdjustSegments` pass.

use crate::error::{Error, Result};
use macho_view::arch::Endianness;
use macho_view::buffer::CacheBuffer;
use macho_view::layout::DylibLayout;
use macho_view::leb128::read_uleb128;
use macho_view::macho_const::*;
use macho_view::trie;
use std::collections::HashSet;

/// `slide_for_original_va`: the slide of the segment (of `layout`) that
/// contains original address `va`.
pub fn slide_for_original_va(layout: &DylibLayout, va: u64) -> Result<i64> {
    let seg = layout
        .segment_containing_orig(va)
        .ok_or_else(|| Error::address_out_of_range(va))?;
    let new_addr = seg.new_addr.ok_or_else(|| Error::address_out_of_range(va))?;
    Ok(new_addr as i64 - seg.orig_addr as i64)
}

/// `slide_for_new_va`: the slide of the segment (of `layout`) that contains
/// placed address `va`.
pub fn slide_for_new_va(layout: &DylibLayout, va: u64) -> Result<i64> {
    let seg = layout
        .segment_containing_new(va)
        .ok_or_else(|| Error::address_out_of_range(va))?;
    let new_addr = seg.new_addr.ok_or_else(|| Error::address_out_of_range(va))?;
    Ok(new_addr as i64 - seg.orig_addr as i64)
}

fn segment_new_va(layout: &DylibLayout, seg_index: usize, offset_in_seg: u64) -> Result<u64> {
    let seg = layout
        .segments
        .get(seg_index)
        .ok_or_else(|| Error::malformed("rebase/bind opcode referenced an out-of-range segment index"))?;
    let new_addr = seg.new_addr.ok_or_else(|| Error::malformed("segment has not been placed yet"))?;
    Ok(new_addr + offset_in_seg)
}

/// Interprets the dyld-info rebase opcode stream and slides every absolute
/// pointer it names. `source` is the dylib's original file bytes.
pub fn rebase_dyld_info(
    source: &[u8],
    layout: &DylibLayout,
    buffer: &mut CacheBuffer,
    pointers_in_data: &mut HashSet<u64>,
) -> Result<()> {
    let Some(info) = layout.dyld_info else { return Ok(()) };
    if info.rebase_size == 0 {
        return Ok(());
    }
    let endian = layout.arch.endianness;
    let ptr_size = u64::from(layout.arch.pointer_size);
    let stream = source
        .get(info.rebase_off as usize..(info.rebase_off + info.rebase_size) as usize)
        .ok_or_else(|| Error::malformed("rebase stream runs past end of file"))?;

    let mut pos = 0usize;
    let mut seg_index = 0usize;
    let mut offset = 0u64;
    let mut kind = REBASE_TYPE_POINTER;

    let mut do_one = |seg_index: usize, offset: u64, kind: u8, buffer: &mut CacheBuffer| -> Result<()> {
        let site_va = segment_new_va(layout, seg_index, offset)?;
        rebase_one_site(layout, buffer, site_va, kind, endian)?;
        pointers_in_data.insert(site_va);
        Ok(())
    };

    loop {
        let byte = *stream.get(pos).ok_or_else(|| Error::malformed("truncated rebase opcode"))?;
        pos += 1;
        let opcode = byte & REBASE_OPCODE_MASK;
        let imm = byte & REBASE_IMMEDIATE_MASK;
        match opcode {
            REBASE_OPCODE_DONE => break,
            REBASE_OPCODE_SET_TYPE_IMM => kind = imm,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                seg_index = imm as usize;
                offset = read_uleb(stream, &mut pos)?;
            }
            REBASE_OPCODE_ADD_ADDR_ULEB => offset += read_uleb(stream, &mut pos)?,
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED => offset += u64::from(imm) * ptr_size,
            REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                for _ in 0..imm {
                    do_one(seg_index, offset, kind, buffer)?;
                    offset += ptr_size;
                }
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                let count = read_uleb(stream, &mut pos)?;
                for _ in 0..count {
                    do_one(seg_index, offset, kind, buffer)?;
                    offset += ptr_size;
                }
            }
            REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                do_one(seg_index, offset, kind, buffer)?;
                offset += ptr_size + read_uleb(stream, &mut pos)?;
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                let count = read_uleb(stream, &mut pos)?;
                let skip = read_uleb(stream, &mut pos)?;
                for _ in 0..count {
                    do_one(seg_index, offset, kind, buffer)?;
                    offset += ptr_size + skip;
                }
            }
            _ => return Err(Error::malformed("unrecognized rebase opcode")),
        }
    }
    Ok(())
}

fn read_uleb(data: &[u8], pos: &mut usize) -> Result<u64> {
    read_uleb128(data, pos).map_err(Error::from)
}

fn rebase_one_site(layout: &DylibLayout, buffer: &mut CacheBuffer, site_va: u64, kind: u8, endian: Endianness) -> Result<()> {
    match kind {
        REBASE_TYPE_POINTER => {
            let target_orig = if layout.arch.is_64() {
                buffer.read_u64(site_va, endian)?
            } else {
                u64::from(buffer.read_u32(site_va, endian)?)
            };
            let slide = slide_for_original_va(layout, target_orig)?;
            let new_target = (target_orig as i64 + slide) as u64;
            if layout.arch.is_64() {
                buffer.write_u64(site_va, new_target, endian)?;
            } else {
                buffer.write_u32(site_va, new_target as u32, endian)?;
            }
        }
        REBASE_TYPE_TEXT_ABSOLUTE32 => {
            let target_orig = u64::from(buffer.read_u32(site_va, endian)?);
            let slide = slide_for_original_va(layout, target_orig)?;
            let new_target = (target_orig as i64 + slide) as u64;
            buffer.write_u32(site_va, new_target as u32, endian)?;
        }
        REBASE_TYPE_TEXT_PCREL32 => {
            let disp = buffer.read_u32(site_va, endian)? as i32;
            let target_orig = (site_va as i64 + 4 + disp as i64) as u64;
            let slide = slide_for_original_va(layout, target_orig)?;
            let target_new = (target_orig as i64 + slide) as u64;
            let seg = layout
                .segment_containing_new(site_va)
                .ok_or_else(|| Error::address_out_of_range(site_va))?;
            let site_new = seg.new_addr.unwrap() + (site_va - seg.new_addr.unwrap());
            let new_disp = target_new as i64 - (site_new as i64 + 4);
            buffer.write_u32(site_va, new_disp as i32 as u32, endian)?;
        }
        _ => return Err(Error::malformed("unrecognized rebase type")),
    }
    Ok(())
}

/// Applies the `LC_SEGMENT_SPLIT_INFO` fix-up stream, adjusting instruction
/// immediates whose encoded address must track TEXT/DATA sliding by
/// unequal amounts.
pub fn apply_split_seg_fixups(source: &[u8], layout: &DylibLayout, buffer: &mut CacheBuffer) -> Result<()> {
    let Some(info) = layout.split_seg_info else { return Ok(()) };
    if info.datasize == 0 {
        return Ok(());
    }
    let stream = source
        .get(info.dataoff as usize..(info.dataoff + info.datasize) as usize)
        .ok_or_else(|| Error::malformed("split-seg-info stream runs past end of file"))?;

    let code_to_data_delta = delta_between(layout, "__TEXT", "__DATA")?;
    let code_to_import_delta = delta_between(layout, "__TEXT", "__IMPORT")?;
    let endian = layout.arch.endianness;

    let mut pos = 0usize;
    // First byte is a version marker (0 terminates the whole stream, a
    // version byte of 1 in the real format precedes the per-kind groups).
    if stream.first() == Some(&0) {
        return Ok(());
    }
    while pos < stream.len() {
        let kind = stream[pos];
        pos += 1;
        if kind == 0 {
            break;
        }
        let mut address = 0u64;
        loop {
            let delta = read_uleb(stream, &mut pos)?;
            if delta == 0 {
                break;
            }
            address += delta;
            apply_one_fixup(layout, buffer, kind, address, code_to_data_delta, code_to_import_delta, endian)?;
        }
    }
    Ok(())
}

fn delta_between(layout: &DylibLayout, from: &str, to: &str) -> Result<i64> {
    let from_seg = layout.segments.iter().find(|s| s.name == from);
    let to_seg = layout.segments.iter().find(|s| s.name == to);
    let (Some(from_seg), Some(to_seg)) = (from_seg, to_seg) else {
        return Ok(0);
    };
    let new_delta = to_seg.new_addr.unwrap_or(to_seg.orig_addr) as i64 - from_seg.new_addr.unwrap_or(from_seg.orig_addr) as i64;
    let orig_delta = to_seg.orig_addr as i64 - from_seg.orig_addr as i64;
    Ok(new_delta - orig_delta)
}

fn apply_one_fixup(
    layout: &DylibLayout,
    buffer: &mut CacheBuffer,
    kind: u8,
    text_offset: u64,
    code_to_data_delta: i64,
    code_to_import_delta: i64,
    endian: Endianness,
) -> Result<()> {
    let text = layout
        .segments
        .iter()
        .find(|s| s.name == "__TEXT")
        .ok_or_else(|| Error::malformed("split-seg-info without a __TEXT segment"))?;
    let site_va = text.new_addr.ok_or_else(|| Error::malformed("__TEXT not yet placed"))? + text_offset;

    if is_skipped_stub_helper_push(layout, buffer, site_va, endian) {
        return Ok(());
    }

    match kind {
        DYLD_CACHE_ADJ_V2_DELTA_32 => {
            let v = buffer.read_u32(site_va, endian)? as i32;
            buffer.write_u32(site_va, (v as i64 + code_to_data_delta) as u32, endian)?;
        }
        DYLD_CACHE_ADJ_V2_DELTA_64 => {
            let v = buffer.read_u64(site_va, endian)? as i64;
            buffer.write_u64(site_va, (v + code_to_data_delta) as u64, endian)?;
        }
        DYLD_CACHE_ADJ_V2_IMPORT_DELTA_32 => {
            let v = buffer.read_u32(site_va, endian)? as i32;
            buffer.write_u32(site_va, (v as i64 + code_to_import_delta) as u32, endian)?;
        }
        DYLD_CACHE_ADJ_V2_THUMB_MOVW_MOVT => fixup_movw_movt(buffer, site_va, endian, code_to_data_delta, true)?,
        DYLD_CACHE_ADJ_V2_ARM_MOVW_MOVT => fixup_movw_movt(buffer, site_va, endian, code_to_data_delta, false)?,
        k if k & SPLIT_SEG_KIND_MASK == DYLD_CACHE_ADJ_V2_THUMB_MOVT_HIGH => {
            fixup_movt_high(buffer, site_va, endian, code_to_data_delta, true, k & SPLIT_SEG_KIND_LOW)?
        }
        k if k & SPLIT_SEG_KIND_MASK == DYLD_CACHE_ADJ_V2_ARM_MOVT_HIGH => {
            fixup_movt_high(buffer, site_va, endian, code_to_data_delta, false, k & SPLIT_SEG_KIND_LOW)?
        }
        _ => return Err(Error::malformed("unrecognized split-seg-info kind")),
    }
    Ok(())
}

/// x86_64's `__stub_helper` entries begin with `push imm32` (opcode `0x68`)
/// whose immediate a naive fix-up pass would otherwise corrupt; the
/// original tool intentionally skips these.
fn is_skipped_stub_helper_push(layout: &DylibLayout, buffer: &CacheBuffer, site_va: u64, _endian: Endianness) -> bool {
    use macho_view::arch::CpuFamily;
    if layout.arch.family != CpuFamily::X86_64 {
        return false;
    }
    let Ok(off) = buffer.va_to_offset(site_va.wrapping_sub(1)) else { return false };
    buffer.data.get(off) == Some(&0x68)
}

fn extract_thumb_movw_imm(instr: u32) -> u32 {
    let imm4 = (instr >> 16) & 0xf;
    let i = (instr >> 26) & 0x1;
    let imm3 = (instr >> 12) & 0x7;
    let imm8 = instr & 0xff;
    (imm4 << 12) | (i << 11) | (imm3 << 8) | imm8
}

fn set_thumb_movw_imm(instr: u32, imm: u32) -> u32 {
    let imm4 = (imm >> 12) & 0xf;
    let i = (imm >> 11) & 0x1;
    let imm3 = (imm >> 8) & 0x7;
    let imm8 = imm & 0xff;
    (instr & !0x040f_70ff) | (imm4 << 16) | (i << 26) | (imm3 << 12) | imm8
}

fn extract_arm_movw_imm(instr: u32) -> u32 {
    let imm4 = (instr >> 16) & 0xf;
    let imm12 = instr & 0xfff;
    (imm4 << 12) | imm12
}

fn set_arm_movw_imm(instr: u32, imm: u32) -> u32 {
    let imm4 = (imm >> 12) & 0xf;
    let imm12 = imm & 0xfff;
    (instr & !0x000f_0fff) | (imm4 << 16) | imm12
}

fn fixup_movw_movt(buffer: &mut CacheBuffer, site_va: u64, endian: Endianness, delta: i64, thumb: bool) -> Result<()> {
    let instr = buffer.read_u32(site_va, endian)?;
    let imm16 = if thumb { extract_thumb_movw_imm(instr) } else { extract_arm_movw_imm(instr) };
    let new_imm16 = (imm16 as i64 + delta) as u32 & 0xffff;
    let new_instr = if thumb { set_thumb_movw_imm(instr, new_imm16) } else { set_arm_movw_imm(instr, new_imm16) };
    buffer.write_u32(site_va, new_instr, endian)?;
    Ok(())
}

/// The `0x1X`/`0x2X` kinds reconstruct a 32-bit target from a paired
/// `movw`(low halfword, at `site_va`)/`movt`(high halfword, preceding
/// instruction) pair, add the delta, and re-pack both halves.
fn fixup_movt_high(buffer: &mut CacheBuffer, site_va: u64, endian: Endianness, delta: i64, thumb: bool, _low_nibble: u8) -> Result<()> {
    let movt_instr = buffer.read_u32(site_va, endian)?;
    let movw_va = site_va.wrapping_sub(4);
    let movw_instr = buffer.read_u32(movw_va, endian)?;

    let low = if thumb { extract_thumb_movw_imm(movw_instr) } else { extract_arm_movw_imm(movw_instr) };
    let high = if thumb { extract_thumb_movw_imm(movt_instr) } else { extract_arm_movw_imm(movt_instr) };
    let target = (high << 16) | low;
    let new_target = (target as i64 + delta) as u32;
    let new_low = new_target & 0xffff;
    let new_high = (new_target >> 16) & 0xffff;

    let new_movw = if thumb { set_thumb_movw_imm(movw_instr, new_low) } else { set_arm_movw_imm(movw_instr, new_low) };
    let new_movt = if thumb { set_thumb_movw_imm(movt_instr, new_high) } else { set_arm_movw_imm(movt_instr, new_high) };
    buffer.write_u32(movw_va, new_movw, endian)?;
    buffer.write_u32(site_va, new_movt, endian)?;
    Ok(())
}

/// Re-parses the export trie, drops linker-private symbols, re-bases every
/// remaining entry's address by the slide of its target, and rebuilds the
/// trie. Returns the new trie blob; the caller is responsible for setting
/// `export_off=0` in the merged LINKEDIT (§4.5).
pub fn adjust_export_trie(source: &[u8], layout: &DylibLayout) -> Result<Vec<u8>> {
    let Some(info) = layout.dyld_info else { return Ok(Vec::new()) };
    if info.export_size == 0 {
        return Ok(Vec::new());
    }
    let blob = source
        .get(info.export_off as usize..(info.export_off + info.export_size) as usize)
        .ok_or_else(|| Error::malformed("export trie runs past end of file"))?;
    let entries = trie::parse(blob)?;

    let kept: Result<Vec<_>> = entries
        .into_iter()
        .filter(|e| {
            let name = String::from_utf8_lossy(&e.name);
            !(name.starts_with("$ld$") || name.starts_with(".objc_class_name") || name.starts_with(".objc_category_name"))
        })
        .map(|mut e| {
            let slide = slide_for_original_va(layout, e.address)?;
            e.address = (e.address as i64 + slide) as u64;
            Ok(e)
        })
        .collect();
    Ok(trie::build(&kept?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_seg_thumb_movw_movt_round_trip() {
        let orig = 0xABCDEF00u32;
        let delta = 0x1000i64;

        let movw_imm = orig & 0xffff;
        let movt_imm = (orig >> 16) & 0xffff;
        let movw_instr = set_thumb_movw_imm(0, movw_imm);
        let movt_instr = set_thumb_movw_imm(0, movt_imm);

        let new_target = (orig as i64 + delta) as u32;
        let expected_low = new_target & 0xffff;
        let expected_high = (new_target >> 16) & 0xffff;

        let low = extract_thumb_movw_imm(movw_instr);
        let high = extract_thumb_movw_imm(movt_instr);
        let target = (high << 16) | low;
        let recombined_target = (target as i64 + delta) as u32;
        assert_eq!(recombined_target & 0xffff, expected_low);
        assert_eq!((recombined_target >> 16) & 0xffff, expected_high);
        assert_eq!(new_target, 0xABCDFF00);
    }
}
