/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Marker driven parser for the frame headers in the decoder's stream ring.
//!
//! The parser only looks at the headers. It stops at the SOS marker and
//! records where the entropy coded segment starts, the hardware does the rest.
//! Running out of data is not an error the session has to give up on: the
//! caller feeds more and parses again, or moves a wrapped frame to the front
//! of the ring with `relocate_wrapped_frame` when told to.

use crate::enabled_features::EnabledFeatures;
use crate::helpers::{lbits, rbits};
use crate::jpeg_code;
use crate::jpu_error::{err_exit_code, AddContext, ErrorCode, Result};
use crate::structs::bit_reader::BitReader;
use crate::structs::component_info::ComponentInfo;
use crate::structs::frame_format::FrameFormat;
use crate::structs::huffman_tables::{table_slot, HuffmanTable, HuffmanTableSet, TableClass};
use crate::structs::quantization_tables::{
    QuantPrecision, QuantizationTable, QuantizationTableSet,
};
use crate::structs::stream_buffer::StreamRing;

/// Everything the headers of one frame told us
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JpegHeader {
    /// extended sequential with 12 bit samples (SOF1)
    pub twelve_bit: bool,

    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub component_count: usize,
    pub components: [ComponentInfo; 3],

    /// MCUs between restart markers, 0 if the stream has none
    pub restart_interval: u32,

    pub quant_tables: QuantizationTableSet,
    pub huffman_tables: HuffmanTableSet,

    /// end of the SOS segment relative to the frame's SOI marker
    pub ecs_offset: u32,

    sof_seen: bool,
}

enum ParseSegmentResult {
    Continue,
    EOI,
    SOS,
}

/// Result of scanning the ring for the next frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameScan {
    /// headers up to and including SOS
    Header(JpegHeader),

    /// the frame ended with EOI before any scan
    EmptyFrame,
}

/// Position of the entropy coded segment as the bit buffer unit wants it:
/// 256 byte page, 32 bit word within the double buffered page pair, bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EcsPointer {
    pub page: u32,
    pub word: u32,
    pub bit: u32,
}

impl EcsPointer {
    /// `offset` is the byte offset of the entropy coded segment from the ring start
    pub fn from_offset(offset: u32) -> Self {
        let page = offset >> 8;
        let mut word = (offset & 0xF0) >> 2;
        if page & 1 == 1 {
            word += 64;
        }

        EcsPointer {
            page,
            word,
            bit: (offset & 0xF) << 3,
        }
    }
}

impl JpegHeader {
    /// Parses the segments of one frame. `data` must start at or before the
    /// frame's SOI marker. Tables defined by earlier frames stay in effect,
    /// motion JPEG streams usually send them only once.
    ///
    /// Returns `None` if the frame ends without a scan. Running out of data
    /// fails with `InsufficientBits`.
    pub fn parse(
        data: &[u8],
        previous: Option<&JpegHeader>,
        enabled_features: &EnabledFeatures,
    ) -> Result<Option<JpegHeader>> {
        let mut header = JpegHeader::default();
        if let Some(p) = previous {
            header.quant_tables = p.quant_tables;
            header.huffman_tables = p.huffman_tables.clone();
        }

        let mut reader = BitReader::new(data, data.len() * 8);

        loop {
            if !find_marker(&mut reader)? {
                return err_exit_code(
                    ErrorCode::InsufficientBits,
                    "stream ended before the start of scan",
                );
            }

            match header.parse_next_segment(&mut reader, enabled_features)? {
                ParseSegmentResult::Continue => {}
                ParseSegmentResult::EOI => return Ok(None),
                ParseSegmentResult::SOS => break,
            }
        }

        header.verify_tables()?;
        Ok(Some(header))
    }

    fn parse_next_segment(
        &mut self,
        reader: &mut BitReader,
        enabled_features: &EnabledFeatures,
    ) -> Result<ParseSegmentResult> {
        let code = reader.take_u16()?;
        let btype = (code & 0xFF) as u8;

        match btype {
            jpeg_code::SOI => {}

            jpeg_code::EOI => return Ok(ParseSegmentResult::EOI),

            jpeg_code::RST0..=jpeg_code::RST7 => {
                // restart markers out of place carry no payload
            }

            jpeg_code::DRI => {
                let len = reader.take_u16()?;
                if len != 4 {
                    return err_exit_code(
                        ErrorCode::MalformedHeader,
                        format!("DRI segment length {0}, expected 4", len),
                    );
                }
                self.restart_interval = u32::from(reader.take_u16()?);
            }

            jpeg_code::DQT => {
                reader.take_u16()?;
                loop {
                    let tmp = reader.take_u8()?;
                    let pq = lbits(tmp, 4);
                    let tq = usize::from(rbits(tmp, 4));
                    if tq > 3 {
                        return err_exit_code(
                            ErrorCode::MalformedHeader,
                            format!("DQT has invalid index {0}", tq),
                        );
                    }

                    let mut zigzag = [0u16; 64];
                    for v in zigzag.iter_mut() {
                        *v = if pq != 0 {
                            reader.take_u16()?
                        } else {
                            u16::from(reader.take_u8()?)
                        };
                    }

                    self.quant_tables[tq] = Some(QuantizationTable::from_zigzag(
                        QuantPrecision::from_pq(pq),
                        &zigzag,
                    ));

                    if reader.peek(8)? == u32::from(jpeg_code::MARKER) {
                        break;
                    }
                }
            }

            jpeg_code::DHT => {
                reader.take_u16()?;
                loop {
                    let tmp = reader.take_u8()?;
                    let tc = lbits(tmp, 4);
                    let th = rbits(tmp, 4);
                    if tc > 1 || th > 3 {
                        return err_exit_code(
                            ErrorCode::MalformedHeader,
                            format!("DHT has invalid class {0} or id {1}", tc, th),
                        );
                    }

                    let mut bits = [0u8; 16];
                    for b in bits.iter_mut() {
                        *b = reader.take_u8()?;
                    }

                    let count: usize = bits.iter().map(|&b| usize::from(b)).sum();
                    if count > 256 {
                        return err_exit_code(
                            ErrorCode::MalformedHeader,
                            format!("DHT table defines {0} codes", count),
                        );
                    }

                    let mut values = Vec::with_capacity(count);
                    for _ in 0..count {
                        values.push(reader.take_u8()?);
                    }

                    let class = if tc == 0 {
                        TableClass::Dc
                    } else {
                        TableClass::Ac
                    };
                    self.huffman_tables
                        .set(table_slot(th, class), HuffmanTable::new(bits, &values)?)?;

                    if reader.peek(8)? == u32::from(jpeg_code::MARKER) {
                        break;
                    }
                }
            }

            jpeg_code::SOF0 | jpeg_code::SOF1 => {
                self.parse_sof(reader, enabled_features).context()?;
            }

            jpeg_code::SOS => {
                self.parse_sos(reader).context()?;
                return Ok(ParseSegmentResult::SOS);
            }

            0xE0..=0xFF => {
                // APPn, COM and reserved segments are skipped
                let len = reader.take_u16()?;
                if len < 2 {
                    return err_exit_code(
                        ErrorCode::MalformedHeader,
                        format!("segment FF {0:X} is too short", btype),
                    );
                }
                reader.skip_bytes(usize::from(len) - 2)?;
            }

            _ => {
                return err_exit_code(
                    ErrorCode::MalformedHeader,
                    format!("unknown marker found: FF {0:X}", btype),
                );
            }
        }

        Ok(ParseSegmentResult::Continue)
    }

    fn parse_sof(
        &mut self,
        reader: &mut BitReader,
        enabled_features: &EnabledFeatures,
    ) -> Result<()> {
        reader.take_u16()?;

        match reader.take_u8()? {
            8 => self.twelve_bit = false,
            12 => self.twelve_bit = true,
            p => {
                return err_exit_code(
                    ErrorCode::UnsupportedPicture,
                    format!("{0} bit data precision is not supported", p),
                );
            }
        }

        self.height = u32::from(reader.take_u16()?);
        self.width = u32::from(reader.take_u16()?);

        if self.width == 0 || self.height == 0 {
            return err_exit_code(
                ErrorCode::UnsupportedPicture,
                "image dimensions can't be zero",
            );
        }

        if self.width > enabled_features.max_picture_width
            || self.height > enabled_features.max_picture_height
        {
            return err_exit_code(
                ErrorCode::UnsupportedPicture,
                format!(
                    "image dimensions {0}x{1} larger than {2}x{3}",
                    self.width,
                    self.height,
                    enabled_features.max_picture_width,
                    enabled_features.max_picture_height
                ),
            );
        }

        let count = usize::from(reader.take_u8()?);
        if count == 0 {
            return err_exit_code(ErrorCode::MalformedHeader, "frame has no components");
        }
        if count > 3 {
            return err_exit_code(
                ErrorCode::UnsupportedPicture,
                format!("image has {0} components, max 3 are supported", count),
            );
        }

        self.components = [ComponentInfo::default(); 3];
        for c in self.components[..count].iter_mut() {
            c.jid = reader.take_u8()?;
            let sampling = reader.take_u8()?;
            c.sfh = lbits(sampling, 4);
            c.sfv = rbits(sampling, 4);
            c.q_table_index = reader.take_u8()?;
            if c.q_table_index > 3 {
                return err_exit_code(
                    ErrorCode::MalformedHeader,
                    format!("quantization table index {0} too big", c.q_table_index),
                );
            }
        }
        self.component_count = count;

        self.format = match FrameFormat::from_sampling(count, &self.components[0]) {
            Some(f) => f,
            None => {
                return err_exit_code(
                    ErrorCode::UnsupportedPicture,
                    format!(
                        "sampling {0:X} with {1} components is not supported",
                        self.components[0].sampling_byte(),
                        count
                    ),
                );
            }
        };

        self.sof_seen = true;
        Ok(())
    }

    fn parse_sos(&mut self, reader: &mut BitReader) -> Result<()> {
        if !self.sof_seen {
            return err_exit_code(ErrorCode::MalformedHeader, "scan before frame header");
        }

        let len = usize::from(reader.take_u16()?);
        self.ecs_offset = u32::try_from(reader.bits_used() / 8 + len - 2)?;

        let count = usize::from(reader.take_u8()?);
        if count == 0 || count > 3 {
            return err_exit_code(
                ErrorCode::MalformedHeader,
                format!("{0} components in scan", count),
            );
        }

        // 8-bit pictures have two tables of each class, 12-bit ones three
        let max_table = if self.twelve_bit { 2 } else { 1 };

        for _ in 0..count {
            let cid = reader.take_u8()?;
            let tables = reader.take_u8()?;
            let dc = lbits(tables, 4);
            let ac = rbits(tables, 4);

            if dc > max_table || ac > max_table {
                return err_exit_code(
                    ErrorCode::UnsupportedPicture,
                    format!("huffman table selector {0:X} out of range", tables),
                );
            }

            match self.components[..self.component_count]
                .iter_mut()
                .find(|c| c.jid == cid)
            {
                Some(c) => {
                    c.huff_dc = dc;
                    c.huff_ac = ac;
                }
                None => {
                    return err_exit_code(
                        ErrorCode::MalformedHeader,
                        format!("component id {0} mismatch in start-of-scan", cid),
                    );
                }
            }
        }

        let ss = reader.take_u8()?;
        let se = reader.take_u8()?;
        let tmp = reader.take_u8()?;
        let ah = lbits(tmp, 4);
        let al = rbits(tmp, 4);

        if ss != 0 || se != 0x3F || ah != 0 || al != 0 {
            return err_exit_code(
                ErrorCode::UnsupportedProfile,
                format!(
                    "scan parameters {0}/{1}/{2}/{3} are not baseline sequential",
                    ss, se, ah, al
                ),
            );
        }

        Ok(())
    }

    fn verify_tables(&self) -> Result<()> {
        for (i, c) in self.components[..self.component_count].iter().enumerate() {
            if self.quant_tables[usize::from(c.q_table_index)].is_none() {
                return err_exit_code(
                    ErrorCode::MalformedHeader,
                    format!(
                        "component {0} uses undefined quantization table {1}",
                        i, c.q_table_index
                    ),
                );
            }
        }
        Ok(())
    }

    /// quantization table of each of the three hardware components
    pub fn component_quant_tables(&self) -> [u8; 3] {
        [
            self.components[0].q_table_index,
            self.components[1].q_table_index,
            self.components[2].q_table_index,
        ]
    }

    /// DC and AC table selectors of the three components packed the way the
    /// picture control register wants them
    pub fn huffman_selection(&self) -> (u32, u32) {
        let shift = if self.twelve_bit { 2 } else { 1 };
        let pack = |f: fn(&ComponentInfo) -> u8| {
            self.components
                .iter()
                .fold(0u32, |acc, c| (acc << shift) | u32::from(f(c)))
        };

        (pack(|c| c.huff_dc), pack(|c| c.huff_ac))
    }

    /// true if the stream carries tables other than the built-in ones
    pub fn user_huffman_tables(&self) -> bool {
        self.huffman_tables.differs_from_defaults(self.twelve_bit)
    }
}

/// Skips to the next `FF xx` marker (xx not 00 or FF). Returns false if the
/// data ends first.
fn find_marker(reader: &mut BitReader) -> Result<bool> {
    loop {
        if reader.bits_remaining() <= 16 {
            return Ok(false);
        }

        let word = reader.peek(16)?;
        if word > 0xFF00 && word < 0xFFFF {
            return Ok(true);
        }

        reader.skip_bytes(1)?;
    }
}

/// offset of the first SOI marker in `data`
fn find_soi(data: &[u8]) -> Result<Option<usize>> {
    let mut reader = BitReader::new(data, data.len() * 8);
    loop {
        if !find_marker(&mut reader)? {
            return Ok(None);
        }

        if reader.peek(16)? == 0xFF00 | u32::from(jpeg_code::SOI) {
            return Ok(Some(reader.bits_used() / 8));
        }

        reader.skip_bytes(1)?;
    }
}

/// Part of the ring the parser may look at
struct Window {
    frame_offset: usize,
    size: usize,
    write_offset: usize,

    /// the write pointer went round the ring and sits behind the frame, so
    /// the frame continues at the physical start of the ring
    wrapped: bool,
}

fn frame_window(stream: &StreamRing) -> Window {
    let ring_size = stream.size() as usize;
    let frame_offset = stream.frame_offset() as usize;
    let raw_write = stream.write_offset() as usize;
    let wrapped = frame_offset > 0 && raw_write <= frame_offset;

    if stream.write_wrapped_to_start() {
        Window {
            frame_offset,
            size: ring_size.saturating_sub(frame_offset),
            write_offset: ring_size,
            wrapped,
        }
    } else {
        let size = if frame_offset >= raw_write {
            ring_size.saturating_sub(frame_offset)
        } else {
            raw_write - frame_offset
        };
        Window {
            frame_offset,
            size,
            write_offset: raw_write,
            wrapped,
        }
    }
}

fn out_of_data<T>(stream: &StreamRing, window: &Window) -> Result<T> {
    if window.wrapped {
        err_exit_code(
            ErrorCode::BitstreamWrap,
            format!(
                "frame at {0} continues at the start of the stream buffer",
                window.frame_offset
            ),
        )
    } else if stream.is_end_of_stream() {
        err_exit_code(ErrorCode::EndOfStream, "no further frame in the stream")
    } else {
        err_exit_code(
            ErrorCode::BitstreamStarved,
            format!(
                "{0} bytes after frame offset {1} do not hold a complete header",
                window.size, window.frame_offset
            ),
        )
    }
}

/// Locates the next frame in the stream ring and parses its headers.
///
/// With `search_next` set, the previous frame's consumed bytes are skipped
/// and the start of the frame moves to the next SOI marker; otherwise the
/// frame found last time is parsed again. `known_header_size` is the header
/// size of earlier frames, a motion JPEG stream is assumed to repeat it.
///
/// `ring` is the CPU view of the whole stream buffer.
pub fn scan_frame(
    ring: &[u8],
    stream: &mut StreamRing,
    search_next: bool,
    known_header_size: u32,
    previous: Option<&JpegHeader>,
    enabled_features: &EnabledFeatures,
) -> Result<FrameScan> {
    let ring_size = stream.size() as usize;
    if ring.len() < ring_size {
        return err_exit_code(
            ErrorCode::InvalidParameter,
            format!(
                "stream buffer view has {0} bytes, ring is {1}",
                ring.len(),
                ring_size
            ),
        );
    }

    let gbu = enabled_features.gbu_size as usize;
    let mut window = frame_window(stream);

    if search_next {
        let mut moved_to_front = false;
        loop {
            let next = match stream.consume_byte() {
                0 => 0,
                c if c < 0 => 2,
                c => c as usize,
            };

            if next > window.size {
                if window.wrapped && !moved_to_front {
                    // the previous frame itself ran over the end of the ring
                    let overshoot = window.frame_offset + next - ring_size;
                    stream.continue_at_front(i32::try_from(overshoot)?);
                    window = frame_window(stream);
                    moved_to_front = true;
                    continue;
                }
                return out_of_data(stream, &Window { wrapped: false, ..window });
            }

            let from = window.frame_offset + next;
            let to = window.frame_offset + window.size;
            match find_soi(&ring[from..to])? {
                Some(soi) => {
                    stream.commit_frame_start(u32::try_from(from + soi)?);
                    window = frame_window(stream);
                    break;
                }
                None => {
                    if window.wrapped && !moved_to_front {
                        stream.continue_at_front(0);
                        window = frame_window(stream);
                        moved_to_front = true;
                        continue;
                    }
                    return out_of_data(stream, &Window { wrapped: false, ..window });
                }
            }
        }
    }

    if window.wrapped
        && known_header_size > 0
        && known_header_size as usize + gbu > ring_size - window.frame_offset
    {
        return err_exit_code(
            ErrorCode::BitstreamWrap,
            format!(
                "a {0} byte header at {1} does not fit before the end of the stream buffer",
                known_header_size, window.frame_offset
            ),
        );
    }

    let data = &ring[window.frame_offset..window.frame_offset + window.size];
    let header = match JpegHeader::parse(data, previous, enabled_features) {
        Ok(Some(h)) => h,
        Ok(None) => return Ok(FrameScan::EmptyFrame),
        Err(e) if e.error_code() == ErrorCode::InsufficientBits => {
            return out_of_data(stream, &window);
        }
        Err(e) => return Err(e),
    };

    let ecs_end = window.frame_offset + header.ecs_offset as usize + gbu;
    if window.wrapped {
        if ecs_end > ring_size {
            return err_exit_code(
                ErrorCode::BitstreamWrap,
                format!(
                    "entropy coded segment at {0} is too close to the end of the stream buffer",
                    window.frame_offset + header.ecs_offset as usize
                ),
            );
        }
    } else if !stream.is_end_of_stream() && window.write_offset < ecs_end {
        return err_exit_code(
            ErrorCode::BitstreamStarved,
            "less than one page of entropy coded data is buffered",
        );
    }

    Ok(FrameScan::Header(header))
}
