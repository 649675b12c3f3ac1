/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Packed configuration words of the hardware. Each type knows its own bit
//! layout so the frame job code only ever deals with named fields.

use crate::jpu_registers::{
    BBC_STRM_CTRL, CLP_BASE, CLP_SIZE, DPB_CONFIG, INTR_MASK, INT_BIT_BUF_EMPTY, INT_DONE,
    INT_ERROR, INT_SLICE_DONE, MCU_INFO, PIC_CTRL, PIC_CTRL_ENCODE, PIC_ERRMB, PIC_SIZE,
    PIC_STATUS, ROT_INFO, SCL_INFO,
};

/// One register write of a programming sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub offset: u32,
    pub value: u32,
}

impl RegisterWrite {
    pub const fn new(offset: u32, value: u32) -> Self {
        RegisterWrite { offset, value }
    }
}

#[inline(always)]
fn flag(v: u32, bit: u32) -> bool {
    (v >> bit) & 1 != 0
}

/// MCU_INFO: blocks per MCU and the per component block layout. The first
/// component field is six bits wide and shares its top bits with the
/// component count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct McuInfo {
    pub block_count: u32,
    pub component_count: u32,
    pub component_info: [u32; 3],
}

impl McuInfo {
    pub fn encode(&self) -> u32 {
        (self.block_count & 0xF) << 16
            | (self.component_count & 0x7) << 12
            | (self.component_info[0] & 0x3F) << 8
            | (self.component_info[1] & 0xF) << 4
            | (self.component_info[2] & 0xF)
    }

    pub fn decode(v: u32) -> Self {
        McuInfo {
            block_count: (v >> 16) & 0xF,
            component_count: (v >> 12) & 0x7,
            component_info: [(v >> 8) & 0xF, (v >> 4) & 0xF, v & 0xF],
        }
    }
}

/// PIC_SIZE and CLP_SIZE: width in the upper half, height in the lower
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PictureSize {
    pub width: u32,
    pub height: u32,
}

impl PictureSize {
    pub fn encode(&self) -> u32 {
        (self.width & 0xFFFF) << 16 | (self.height & 0xFFFF)
    }

    pub fn decode(v: u32) -> Self {
        PictureSize {
            width: v >> 16,
            height: v & 0xFFFF,
        }
    }
}

/// PIC_CTRL as programmed by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecoderPictureControl {
    /// per component AC table selection, one bit per component
    pub huff_ac_index: u32,
    /// per component DC table selection
    pub huff_dc_index: u32,
    pub user_huffman: bool,
    pub check_write_response: bool,
    pub twelve_bit: bool,
}

impl DecoderPictureControl {
    pub fn encode(&self) -> u32 {
        u32::from(self.twelve_bit) << 31
            | (self.huff_ac_index & 0x3F) << 10
            | (self.huff_dc_index & 0x7) << 7
            | u32::from(self.user_huffman) << 6
            | u32::from(self.check_write_response) << 2
    }

    pub fn decode(v: u32) -> Self {
        DecoderPictureControl {
            huff_ac_index: (v >> 10) & 0x3F,
            huff_dc_index: (v >> 7) & 0x7,
            user_huffman: flag(v, 6),
            check_write_response: flag(v, 2),
            twelve_bit: flag(v, 31),
        }
    }
}

/// DPB_CONFIG: frame buffer organisation. `chroma_interleave` is 0 for planar,
/// 1 for CbCr and 2 for CrCb. `packed_format` is 0 for planar, 1 to 4 for the
/// packed 4:2:2 orders and 5 for packed 4:4:4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DpbConfig {
    pub packed_format: u32,
    pub chroma_interleave: u32,
    pub frame_endian: u32,
}

impl DpbConfig {
    pub fn encode(&self) -> u32 {
        let interleave = match self.chroma_interleave {
            0 => 0,
            1 => 2,
            _ => 3,
        };
        let packed = match self.packed_format {
            0 => 0,
            5 => 1 << 5,
            p => 1 << 4 | ((p - 1) & 0x3) << 2,
        };
        (self.frame_endian & 0x7) << 6 | packed | interleave
    }

    pub fn decode(v: u32) -> Self {
        let packed_format = if flag(v, 5) {
            5
        } else if flag(v, 4) {
            ((v >> 2) & 0x3) + 1
        } else {
            0
        };
        let chroma_interleave = match v & 0x3 {
            2 => 1,
            3 => 2,
            _ => 0,
        };
        DpbConfig {
            packed_format,
            chroma_interleave,
            frame_endian: (v >> 6) & 0x7,
        }
    }
}

/// ROT_INFO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RotationInfo {
    pub enabled: bool,
    pub mirror_index: u32,
    pub rotation_index: u32,
}

impl RotationInfo {
    pub fn encode(&self) -> u32 {
        u32::from(self.enabled) << 4 | (self.mirror_index & 0x3) << 2 | (self.rotation_index & 0x3)
    }

    pub fn decode(v: u32) -> Self {
        RotationInfo {
            enabled: flag(v, 4),
            mirror_index: (v >> 2) & 0x3,
            rotation_index: v & 0x3,
        }
    }
}

/// SCL_INFO: power of two down scaling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScaleInfo {
    pub horizontal: u32,
    pub vertical: u32,
}

impl ScaleInfo {
    pub fn encode(&self) -> u32 {
        let enabled = self.horizontal != 0 || self.vertical != 0;
        u32::from(enabled) << 4 | (self.horizontal & 0x3) << 2 | (self.vertical & 0x3)
    }

    pub fn decode(v: u32) -> Self {
        ScaleInfo {
            horizontal: (v >> 2) & 0x3,
            vertical: v & 0x3,
        }
    }
}

/// CLP_BASE: ROI origin in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClipBase {
    pub offset_x: u32,
    pub offset_y: u32,
}

impl ClipBase {
    pub fn encode(&self) -> u32 {
        (self.offset_x & 0xFFFF) << 16 | (self.offset_y & 0xFFFF)
    }

    pub fn decode(v: u32) -> Self {
        ClipBase {
            offset_x: v >> 16,
            offset_y: v & 0xFFFF,
        }
    }
}

/// BBC_STRM_CTRL: the stream length in 256 byte units once the end is known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamControl {
    pub end_of_stream: bool,
    pub length_units: u32,
}

impl StreamControl {
    pub fn encode(&self) -> u32 {
        u32::from(self.end_of_stream) << 31 | (self.length_units & 0x7FFF_FFFF)
    }

    pub fn decode(v: u32) -> Self {
        StreamControl {
            end_of_stream: flag(v, 31),
            length_units: v & 0x7FFF_FFFF,
        }
    }
}

/// PIC_ERRMB: position of the first macroblock the decoder could not decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorMacroblock {
    pub restart_index: u32,
    pub x: u32,
    pub y: u32,
}

impl ErrorMacroblock {
    pub fn encode(&self) -> u32 {
        (self.restart_index & 0xF) << 24 | (self.x & 0xFFF) << 12 | (self.y & 0xFFF)
    }

    pub fn decode(v: u32) -> Self {
        ErrorMacroblock {
            restart_index: (v >> 24) & 0xF,
            x: (v >> 12) & 0xFFF,
            y: v & 0xFFF,
        }
    }
}

/// VERSION_INFO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionInfo {
    pub product_id: u32,
    pub revision: u32,
    pub support_12bit: bool,
}

impl VersionInfo {
    pub fn encode(&self) -> u32 {
        u32::from(self.support_12bit) << 28
            | (self.product_id & 0xF) << 24
            | (self.revision & 0xFF_FFFF)
    }

    pub fn decode(v: u32) -> Self {
        VersionInfo {
            product_id: (v >> 24) & 0xF,
            revision: v & 0xFF_FFFF,
            support_12bit: flag(v, 28),
        }
    }
}

/// INTR_MASK, also the set of status bits a caller wants to be woken for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptMask {
    pub done: bool,
    pub error: bool,
    pub buffer: bool,
    pub slice_done: bool,
}

impl InterruptMask {
    pub fn all() -> Self {
        InterruptMask {
            done: true,
            error: true,
            buffer: true,
            slice_done: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.done || self.error || self.buffer || self.slice_done)
    }

    pub fn encode(&self) -> u32 {
        u32::from(self.done) << INT_DONE
            | u32::from(self.error) << INT_ERROR
            | u32::from(self.buffer) << INT_BIT_BUF_EMPTY
            | u32::from(self.slice_done) << INT_SLICE_DONE
    }

    pub fn decode(v: u32) -> Self {
        InterruptMask {
            done: flag(v, INT_DONE),
            error: flag(v, INT_ERROR),
            buffer: flag(v, INT_BIT_BUF_EMPTY),
            slice_done: flag(v, INT_SLICE_DONE),
        }
    }
}

/// Named fields of a packed register for the diagnostic dump, `None` for
/// addresses, counters and words whose layout depends on the session mode
pub fn describe_register(offset: u32, value: u32) -> Option<String> {
    let fields = match offset {
        MCU_INFO => format!("{0:?}", McuInfo::decode(value)),
        PIC_SIZE | CLP_SIZE => format!("{0:?}", PictureSize::decode(value)),
        PIC_CTRL if value & PIC_CTRL_ENCODE == 0 => {
            format!("{0:?}", DecoderPictureControl::decode(value))
        }
        DPB_CONFIG => format!("{0:?}", DpbConfig::decode(value)),
        ROT_INFO => format!("{0:?}", RotationInfo::decode(value)),
        SCL_INFO => format!("{0:?}", ScaleInfo::decode(value)),
        CLP_BASE => format!("{0:?}", ClipBase::decode(value)),
        BBC_STRM_CTRL => format!("{0:?}", StreamControl::decode(value)),
        PIC_ERRMB => format!("{0:?}", ErrorMacroblock::decode(value)),
        INTR_MASK | PIC_STATUS => format!("{0:?}", InterruptMask::decode(value)),
        _ => return None,
    };
    Some(fields)
}
