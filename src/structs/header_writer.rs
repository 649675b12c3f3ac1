/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Writes the JPEG headers that precede the entropy coded data produced by
//! the encoder. The hardware only emits the scan, everything up to and
//! including SOF comes from here.

use byteorder::{BigEndian, WriteBytesExt};

use crate::jpeg_code;
use crate::jpu_error::{err_exit_code, ErrorCode, Result};
use crate::structs::frame_format::{FrameFormat, Rotation};
use crate::structs::huffman_tables::{slot_class, HuffmanTable, HuffmanTableSet};
use crate::structs::quantization_tables::{QuantPrecision, QuantizationTable, QuantizationTableSet};

/// Whether tables go into one segment each or share a single segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableMode {
    #[default]
    Normal,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderOptions {
    pub disable_soi: bool,
    pub disable_app: bool,
    pub quant_mode: TableMode,
    pub huffman_mode: TableMode,

    /// pads the header with a filler segment so the scan starts 8-byte aligned
    pub sof_stuffing: bool,
}

/// What the header describes
#[derive(Debug, Clone, Copy)]
pub struct HeaderSource<'a> {
    pub frame_index: u32,
    pub restart_interval: u32,
    pub twelve_bit: bool,
    pub format: FrameFormat,

    /// source picture size, before rotation
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,

    pub quant_tables: &'a QuantizationTableSet,
    pub huffman_tables: &'a HuffmanTableSet,
}

/// marker of the filler segment used for SOF stuffing
const FILL_MARKER: u8 = 0xFF;

pub fn write_header(source: &HeaderSource, options: &HeaderOptions) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(1024);

    if !options.disable_soi {
        out.write_u8(0xFF)?;
        out.write_u8(jpeg_code::SOI)?;
    }

    if !options.disable_app {
        out.write_u8(0xFF)?;
        out.write_u8(jpeg_code::APP9)?;
        out.write_u16::<BigEndian>(4)?;
        out.write_u16::<BigEndian>(source.frame_index as u16)?;
    }

    if source.restart_interval != 0 {
        out.write_u8(0xFF)?;
        out.write_u8(jpeg_code::DRI)?;
        out.write_u16::<BigEndian>(4)?;
        out.write_u16::<BigEndian>(u16::try_from(source.restart_interval)?)?;
    }

    write_quant_tables(&mut out, source, options.quant_mode)?;
    write_huffman_tables(&mut out, source, options.huffman_mode)?;
    write_frame(&mut out, source)?;

    if options.sof_stuffing && out.len() % 8 != 0 {
        let mut pad = 8 - out.len() % 8;
        if pad < 4 {
            pad += 8;
        }
        pad -= 4;

        out.write_u8(0xFF)?;
        out.write_u8(FILL_MARKER)?;
        out.write_u16::<BigEndian>(pad as u16 + 2)?;
        out.resize(out.len() + pad, 0xFF);
    }

    Ok(out)
}

fn quant_table<'a>(source: &HeaderSource<'a>, index: usize) -> Result<&'a QuantizationTable> {
    match source.quant_tables.get(index).and_then(|t| t.as_ref()) {
        Some(t) => Ok(t),
        None => err_exit_code(
            ErrorCode::InvalidParameter,
            format!("quantization table {0} is not set", index),
        ),
    }
}

fn write_quant_body(out: &mut Vec<u8>, index: usize, table: &QuantizationTable) -> Result<()> {
    let sixteen_bit = table.precision() == QuantPrecision::Bits16;
    out.write_u8(u8::from(sixteen_bit) << 4 | index as u8)?;
    for v in table.to_zigzag() {
        if sixteen_bit {
            out.write_u16::<BigEndian>(v)?;
        } else {
            out.write_u8(v as u8)?;
        }
    }
    Ok(())
}

fn quant_body_len(table: &QuantizationTable) -> u16 {
    if table.precision() == QuantPrecision::Bits16 {
        1 + 128
    } else {
        1 + 64
    }
}

fn write_quant_tables(out: &mut Vec<u8>, source: &HeaderSource, mode: TableMode) -> Result<()> {
    let count = if source.format == FrameFormat::Yuv400 { 1 } else { 2 };
    let mut tables = Vec::with_capacity(count);
    for i in 0..count {
        tables.push(quant_table(source, i)?);
    }

    match mode {
        TableMode::Normal => {
            for (i, t) in tables.iter().enumerate() {
                out.write_u8(0xFF)?;
                out.write_u8(jpeg_code::DQT)?;
                out.write_u16::<BigEndian>(2 + quant_body_len(t))?;
                write_quant_body(out, i, t)?;
            }
        }
        TableMode::Merged => {
            let len: u16 = 2 + tables.iter().map(|t| quant_body_len(t)).sum::<u16>();
            out.write_u8(0xFF)?;
            out.write_u8(jpeg_code::DQT)?;
            out.write_u16::<BigEndian>(len)?;
            for (i, t) in tables.iter().enumerate() {
                write_quant_body(out, i, t)?;
            }
        }
    }
    Ok(())
}

/// Table slots the header carries: DC0, AC0 and for color pictures DC1,
/// AC1, plus DC2, AC2 for 12-bit color pictures
fn huffman_slots(source: &HeaderSource) -> &'static [usize] {
    match (source.format == FrameFormat::Yuv400, source.twelve_bit) {
        (true, _) => &[0, 1],
        (false, false) => &[0, 1, 2, 3],
        (false, true) => &[0, 1, 2, 3, 4, 5],
    }
}

fn write_huffman_body(out: &mut Vec<u8>, slot: usize, table: &HuffmanTable) -> Result<()> {
    // Tc in the high nibble, Th in the low one
    out.write_u8((slot_class(slot) as u8) << 4 | (slot >> 1) as u8)?;
    out.extend_from_slice(table.bits());
    out.extend_from_slice(table.values());
    Ok(())
}

fn write_huffman_tables(out: &mut Vec<u8>, source: &HeaderSource, mode: TableMode) -> Result<()> {
    let mut tables = Vec::new();
    for &slot in huffman_slots(source) {
        match source.huffman_tables.resolved(slot, source.twelve_bit) {
            Some(t) => tables.push((slot, t)),
            None => {
                return err_exit_code(
                    ErrorCode::InvalidHuffmanTable,
                    format!("no huffman table for slot {0}", slot),
                )
            }
        }
    }

    let body_len = |t: &HuffmanTable| 1 + 16 + t.values().len();

    match mode {
        TableMode::Normal => {
            for (slot, t) in &tables {
                out.write_u8(0xFF)?;
                out.write_u8(jpeg_code::DHT)?;
                out.write_u16::<BigEndian>(u16::try_from(2 + body_len(t))?)?;
                write_huffman_body(out, *slot, t)?;
            }
        }
        TableMode::Merged => {
            let len: usize = 2 + tables.iter().map(|(_, t)| body_len(t)).sum::<usize>();
            out.write_u8(0xFF)?;
            out.write_u8(jpeg_code::DHT)?;
            out.write_u16::<BigEndian>(u16::try_from(len)?)?;
            for (slot, t) in &tables {
                write_huffman_body(out, *slot, t)?;
            }
        }
    }
    Ok(())
}

fn write_frame(out: &mut Vec<u8>, source: &HeaderSource) -> Result<()> {
    let (width, height, format) = if source.rotation.swaps_axes() {
        (source.height, source.width, source.format.transposed())
    } else {
        (source.width, source.height, source.format)
    };

    let component_count = source.format.component_count();

    out.write_u8(0xFF)?;
    out.write_u8(if source.twelve_bit {
        jpeg_code::SOF1
    } else {
        jpeg_code::SOF0
    })?;
    out.write_u16::<BigEndian>(8 + 3 * component_count as u16)?;
    out.write_u8(if source.twelve_bit { 12 } else { 8 })?;
    out.write_u16::<BigEndian>(u16::try_from(height)?)?;
    out.write_u16::<BigEndian>(u16::try_from(width)?)?;
    out.write_u8(component_count as u8)?;

    for (i, c) in format.components().iter().take(component_count).enumerate() {
        out.write_u8(i as u8 + 1)?;
        out.write_u8((c.sfh << 4) | (c.sfv & 0xF))?;
        out.write_u8(c.q_table_index)?;
    }
    Ok(())
}

/// Length of an encoded picture without the 0xFF fill the hardware leaves
/// behind the EOI marker
pub fn trim_encoded_bitstream(bytes: &[u8]) -> usize {
    let mut end = bytes.len();
    while end > 0 && bytes[end - 1] == 0xFF {
        end -= 1;
    }

    match bytes[..end]
        .windows(2)
        .rposition(|w| w[0] == 0xFF && w[1] == jpeg_code::EOI)
    {
        Some(p) => p + 2,
        None => end,
    }
}
