/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Picture formats and the fixed per-format rules of the hardware: MCU
//! geometry, the number of bus requests per transaction and the padding
//! the MMU needs when the encoder rotates or mirrors.

use crate::consts::COMPONENT_INFO_TABLE;
use crate::helpers::{ceil_align, floor_align};
use crate::jpu_error::{err_exit_code, ErrorCode, Result};
use crate::structs::component_info::ComponentInfo;
use crate::structs::register_words::McuInfo;

/// Chroma subsampling family of a picture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameFormat {
    #[default]
    Yuv420 = 0,
    Yuv422 = 1,
    Yuv440 = 2,
    Yuv444 = 3,
    Yuv400 = 4,
}

impl FrameFormat {
    pub fn from_index(index: u32) -> Result<Self> {
        match index {
            0 => Ok(FrameFormat::Yuv420),
            1 => Ok(FrameFormat::Yuv422),
            2 => Ok(FrameFormat::Yuv440),
            3 => Ok(FrameFormat::Yuv444),
            4 => Ok(FrameFormat::Yuv400),
            _ => err_exit_code(
                ErrorCode::InvalidParameter,
                format!("invalid frame format {0}", index),
            ),
        }
    }

    /// Derives the format from the component count and the sampling
    /// factors of the first component. Returns None for layouts the
    /// hardware cannot decode.
    pub fn from_sampling(component_count: usize, first: &ComponentInfo) -> Option<Self> {
        if component_count == 1 {
            return Some(FrameFormat::Yuv400);
        }

        match first.sampling_nibble() {
            0xA => Some(FrameFormat::Yuv420),
            0x9 => Some(FrameFormat::Yuv422),
            0x6 => Some(FrameFormat::Yuv440),
            0x5 => Some(FrameFormat::Yuv444),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn component_count(self) -> usize {
        if self == FrameFormat::Yuv400 {
            1
        } else {
            3
        }
    }

    /// 4:2:2 and 4:4:0 are transposes of each other, so a picture turned by
    /// 90 or 270 degrees switches between them
    pub fn transposed(self) -> Self {
        match self {
            FrameFormat::Yuv422 => FrameFormat::Yuv440,
            FrameFormat::Yuv440 => FrameFormat::Yuv422,
            f => f,
        }
    }

    /// Component descriptors the encoder writes into its SOF segment
    pub fn components(self) -> [ComponentInfo; 3] {
        let rows = &COMPONENT_INFO_TABLE[self.index()];
        [
            ComponentInfo::from_row(&rows[0]),
            ComponentInfo::from_row(&rows[1]),
            ComponentInfo::from_row(&rows[2]),
        ]
    }
}

/// Layout of a packed (single plane) frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackedFormat {
    #[default]
    None = 0,
    Yuyv = 1,
    Yvyu = 2,
    Uyvy = 3,
    Vyuy = 4,
    Packed444 = 5,
}

impl PackedFormat {
    pub fn from_index(index: u32) -> Result<Self> {
        match index {
            0 => Ok(PackedFormat::None),
            1 => Ok(PackedFormat::Yuyv),
            2 => Ok(PackedFormat::Yvyu),
            3 => Ok(PackedFormat::Uyvy),
            4 => Ok(PackedFormat::Vyuy),
            5 => Ok(PackedFormat::Packed444),
            _ => err_exit_code(
                ErrorCode::InvalidParameter,
                format!("invalid packed format {0}", index),
            ),
        }
    }

    pub fn is_packed_422(self) -> bool {
        matches!(
            self,
            PackedFormat::Yuyv | PackedFormat::Yvyu | PackedFormat::Uyvy | PackedFormat::Vyuy
        )
    }

    /// bytes per pixel of the luma row for packed layouts
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PackedFormat::None => 1,
            PackedFormat::Packed444 => 3,
            _ => 2,
        }
    }
}

/// Order of the chroma planes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChromaInterleave {
    #[default]
    Planar = 0,
    CbCr = 1,
    CrCb = 2,
}

impl ChromaInterleave {
    pub fn from_index(index: u32) -> Result<Self> {
        match index {
            0 => Ok(ChromaInterleave::Planar),
            1 => Ok(ChromaInterleave::CbCr),
            2 => Ok(ChromaInterleave::CrCb),
            _ => err_exit_code(
                ErrorCode::InvalidParameter,
                format!("invalid chroma interleave mode {0}", index),
            ),
        }
    }
}

/// Clockwise rotation applied by the post processing unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    None = 0,
    Rotate90 = 1,
    Rotate180 = 2,
    Rotate270 = 3,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Result<Self> {
        match degrees {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Rotate90),
            180 => Ok(Rotation::Rotate180),
            270 => Ok(Rotation::Rotate270),
            _ => err_exit_code(
                ErrorCode::InvalidParameter,
                format!("rotation of {0} degrees is not supported", degrees),
            ),
        }
    }

    pub fn from_index(index: u32) -> Result<Self> {
        if index > 3 {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!("invalid rotation index {0}", index),
            );
        }
        Self::from_degrees(index * 90)
    }

    pub fn index(self) -> u32 {
        self as u32
    }

    /// 90 and 270 degrees exchange the picture axes
    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Rotate90 | Rotation::Rotate270)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mirror {
    #[default]
    None = 0,
    Vertical = 1,
    Horizontal = 2,
    Both = 3,
}

impl Mirror {
    pub fn from_index(index: u32) -> Result<Self> {
        match index {
            0 => Ok(Mirror::None),
            1 => Ok(Mirror::Vertical),
            2 => Ok(Mirror::Horizontal),
            3 => Ok(Mirror::Both),
            _ => err_exit_code(
                ErrorCode::InvalidParameter,
                format!("invalid mirror index {0}", index),
            ),
        }
    }

    pub fn index(self) -> u32 {
        self as u32
    }
}

/// Region of interest in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoiRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Block layout of one MCU and the picture size rounded up to whole MCUs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct McuGeometry {
    pub block_count: u32,
    pub component_count: u32,
    pub component_info: [u32; 3],
    pub mcu_width: u32,
    pub mcu_height: u32,
    pub aligned_width: u32,
    pub aligned_height: u32,
}

impl McuGeometry {
    /// Geometry the decoder programs for a parsed picture. Grayscale
    /// pictures are fetched four blocks at a time unless the ROI starts
    /// at an offset that is not a multiple of 32 pixels.
    pub fn for_decoder(
        format: FrameFormat,
        width: u32,
        height: u32,
        roi_offset_x: Option<u32>,
    ) -> Self {
        let (block_count, mcu_width, mcu_height) = match format {
            FrameFormat::Yuv420 => (6, 16, 16),
            FrameFormat::Yuv422 => (4, 16, 8),
            FrameFormat::Yuv440 => (4, 8, 16),
            FrameFormat::Yuv444 => (3, 8, 8),
            FrameFormat::Yuv400 => {
                let four_blocks = match roi_offset_x {
                    Some(x) => floor_align(8, x) % 32 == 0,
                    None => true,
                };
                if four_blocks {
                    (4, 32, 8)
                } else {
                    (1, 8, 8)
                }
            }
        };

        // grayscale aligns to blocks, not to its wide MCU
        let (align_w, align_h) = if format == FrameFormat::Yuv400 {
            (8, 8)
        } else {
            (mcu_width, mcu_height)
        };

        let chroma = if format == FrameFormat::Yuv400 { 0 } else { 5 };

        McuGeometry {
            block_count,
            component_count: format.component_count() as u32,
            component_info: [(mcu_width >> 3) << 2 | (mcu_height >> 3), chroma, chroma],
            mcu_width,
            mcu_height,
            aligned_width: ceil_align(align_w, width),
            aligned_height: ceil_align(align_h, height),
        }
    }

    /// Geometry the encoder programs. The alignment follows the format as
    /// seen after rotation. A grayscale picture coded as a single restart
    /// slice of full height is processed one block at a time.
    pub fn for_encoder(
        format: FrameFormat,
        width: u32,
        height: u32,
        rotation: Rotation,
        restart_interval: u32,
        slice_height: u32,
    ) -> Self {
        let effective = if rotation.swaps_axes() {
            format.transposed()
        } else {
            format
        };

        let (aligned_width, mut mcu_width) = match effective {
            FrameFormat::Yuv420 | FrameFormat::Yuv422 => (ceil_align(16, width), 16),
            FrameFormat::Yuv400 => (ceil_align(8, width), 32),
            _ => (ceil_align(8, width), 8),
        };

        let (aligned_height, mut mcu_height) = match effective {
            FrameFormat::Yuv420 | FrameFormat::Yuv440 => (ceil_align(16, height), 16),
            _ => (ceil_align(8, height), 8),
        };

        if format == FrameFormat::Yuv400 && rotation.swaps_axes() {
            std::mem::swap(&mut mcu_width, &mut mcu_height);
        }

        let block_count = match format {
            FrameFormat::Yuv420 => 6,
            FrameFormat::Yuv422 | FrameFormat::Yuv440 => 4,
            FrameFormat::Yuv444 => 3,
            FrameFormat::Yuv400 => {
                let coded_height = if rotation.swaps_axes() { width } else { height };
                if restart_interval > 0 && coded_height == slice_height {
                    1
                } else {
                    4
                }
            }
        };

        let chroma = if format == FrameFormat::Yuv400 { 0 } else { 5 };

        McuGeometry {
            block_count,
            component_count: format.component_count() as u32,
            component_info: [0xA, chroma, chroma],
            mcu_width,
            mcu_height,
            aligned_width,
            aligned_height,
        }
    }

    pub fn mcu_info(&self) -> McuInfo {
        McuInfo {
            block_count: self.block_count,
            component_count: self.component_count,
            component_info: self.component_info,
        }
    }
}

/// Bus requests per transaction when decoding `format` into `packed`
pub fn decoder_bus_requests(format: FrameFormat, packed: PackedFormat, twelve_bit: bool) -> u32 {
    use FrameFormat::*;

    match (packed, twelve_bit) {
        (PackedFormat::None, false) => match format {
            Yuv400 => 4,
            Yuv420 => 2,
            Yuv422 => 3,
            Yuv440 => 8,
            Yuv444 => 4,
        },
        (PackedFormat::None, true) => match format {
            Yuv400 => 1,
            Yuv420 | Yuv422 => 2,
            Yuv440 | Yuv444 => 4,
        },
        (PackedFormat::Packed444, false) => 8,
        (PackedFormat::Packed444, true) => 4,
        (_, false) => match format {
            Yuv400 => 1,
            Yuv420 | Yuv422 => 2,
            _ => 4,
        },
        (_, true) => match format {
            Yuv400 | Yuv420 | Yuv422 => 1,
            _ => 2,
        },
    }
}

/// Bus requests per transaction when encoding a `packed` source into `format`
pub fn encoder_bus_requests(packed: PackedFormat, format: FrameFormat, twelve_bit: bool) -> u32 {
    use FrameFormat::*;

    match (packed, twelve_bit) {
        (PackedFormat::None, false) => match format {
            Yuv400 | Yuv440 | Yuv444 => 4,
            _ => 2,
        },
        (PackedFormat::None, true) => match format {
            Yuv440 | Yuv444 => 4,
            _ => 2,
        },
        (PackedFormat::Packed444, _) => 4,
        (_, false) => match format {
            Yuv440 | Yuv444 => 4,
            _ => 2,
        },
        (_, true) => match format {
            Yuv440 | Yuv444 => 2,
            _ => 1,
        },
    }
}

/// Extra bytes the MMU has to map behind the source frame when the
/// rotator reads it from a padded edge. Depending on the combination the
/// padding lies below the picture, to its right, or both.
pub fn appending_size(
    mirror: Mirror,
    rotation: Rotation,
    aligned_width: u32,
    aligned_height: u32,
    source_width: u32,
    source_height: u32,
) -> u32 {
    let rows = aligned_height.saturating_sub(source_height) * aligned_width;
    let columns = aligned_width.saturating_sub(source_width);

    match (mirror.index(), rotation.index()) {
        (1, 1) | (3, 1) | (0, 3) | (1, 0) | (2, 2) => rows,
        (1, 2) | (2, 0) | (0, 1) | (3, 3) => columns,
        (0, 2) | (2, 3) | (3, 0) => rows + columns,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sampled(h: u8, v: u8) -> ComponentInfo {
        ComponentInfo {
            jid: 1,
            sfh: h,
            sfv: v,
            ..Default::default()
        }
    }

    #[rstest]
    #[case(2, 2, FrameFormat::Yuv420)]
    #[case(2, 1, FrameFormat::Yuv422)]
    #[case(1, 2, FrameFormat::Yuv440)]
    #[case(1, 1, FrameFormat::Yuv444)]
    fn format_from_sampling(#[case] h: u8, #[case] v: u8, #[case] expected: FrameFormat) {
        assert_eq!(
            FrameFormat::from_sampling(3, &sampled(h, v)),
            Some(expected)
        );
        // one component is always grayscale whatever it declares
        assert_eq!(
            FrameFormat::from_sampling(1, &sampled(h, v)),
            Some(FrameFormat::Yuv400)
        );
    }

    #[test]
    fn unknown_sampling_is_rejected() {
        assert_eq!(FrameFormat::from_sampling(3, &sampled(3, 1)), None);
    }

    #[rstest]
    #[case(FrameFormat::Yuv420, 6, 16, 16, 0xA)]
    #[case(FrameFormat::Yuv422, 4, 16, 8, 0x9)]
    #[case(FrameFormat::Yuv440, 4, 8, 16, 0x6)]
    #[case(FrameFormat::Yuv444, 3, 8, 8, 0x5)]
    #[case(FrameFormat::Yuv400, 4, 32, 8, 0x11)]
    fn decoder_geometry(
        #[case] format: FrameFormat,
        #[case] blocks: u32,
        #[case] mcu_w: u32,
        #[case] mcu_h: u32,
        #[case] comp0: u32,
    ) {
        let g = McuGeometry::for_decoder(format, 100, 50, None);
        assert_eq!(g.block_count, blocks);
        assert_eq!((g.mcu_width, g.mcu_height), (mcu_w, mcu_h));
        assert_eq!(g.component_info[0], comp0);
        assert_eq!(g.aligned_width % 8, 0);
        assert!(g.aligned_width >= 100 && g.aligned_height >= 50);
    }

    #[test]
    fn grayscale_roi_offset_rule() {
        // 40 is not a multiple of 32 once floored to a block
        let g = McuGeometry::for_decoder(FrameFormat::Yuv400, 256, 256, Some(40));
        assert_eq!((g.block_count, g.mcu_width, g.mcu_height), (1, 8, 8));

        // 71 floors to 64
        let g = McuGeometry::for_decoder(FrameFormat::Yuv400, 256, 256, Some(71));
        assert_eq!((g.block_count, g.mcu_width), (4, 32));
        assert_eq!(g.component_count, 1);
        assert_eq!(g.component_info[1..], [0, 0]);
    }

    #[test]
    fn encoder_rotation_transposes_422() {
        let g = McuGeometry::for_encoder(FrameFormat::Yuv422, 100, 100, Rotation::None, 0, 0);
        assert_eq!((g.mcu_width, g.mcu_height), (16, 8));
        assert_eq!((g.aligned_width, g.aligned_height), (112, 104));

        let g = McuGeometry::for_encoder(FrameFormat::Yuv422, 100, 100, Rotation::Rotate90, 0, 0);
        assert_eq!((g.mcu_width, g.mcu_height), (8, 16));
        assert_eq!((g.aligned_width, g.aligned_height), (104, 112));
        assert_eq!(g.block_count, 4);
        assert_eq!(g.component_info, [0xA, 5, 5]);
    }

    #[test]
    fn encoder_grayscale_blocks() {
        let g = McuGeometry::for_encoder(FrameFormat::Yuv400, 64, 48, Rotation::None, 0, 48);
        assert_eq!((g.block_count, g.mcu_width, g.mcu_height), (4, 32, 8));

        let g = McuGeometry::for_encoder(FrameFormat::Yuv400, 64, 48, Rotation::None, 4, 48);
        assert_eq!(g.block_count, 1);

        // rotated, the coded height is the source width
        let g = McuGeometry::for_encoder(FrameFormat::Yuv400, 64, 48, Rotation::Rotate270, 4, 64);
        assert_eq!(g.block_count, 1);
        assert_eq!((g.mcu_width, g.mcu_height), (8, 32));
    }

    #[test]
    fn bus_request_tables() {
        use FrameFormat::*;
        assert_eq!(decoder_bus_requests(Yuv440, PackedFormat::None, false), 8);
        assert_eq!(decoder_bus_requests(Yuv400, PackedFormat::None, true), 1);
        assert_eq!(decoder_bus_requests(Yuv444, PackedFormat::Yuyv, false), 4);
        assert_eq!(decoder_bus_requests(Yuv440, PackedFormat::Vyuy, true), 2);
        assert_eq!(decoder_bus_requests(Yuv444, PackedFormat::Packed444, false), 8);

        assert_eq!(encoder_bus_requests(PackedFormat::None, Yuv420, false), 2);
        assert_eq!(encoder_bus_requests(PackedFormat::None, Yuv400, true), 2);
        assert_eq!(encoder_bus_requests(PackedFormat::Uyvy, Yuv444, false), 4);
        assert_eq!(encoder_bus_requests(PackedFormat::Uyvy, Yuv420, true), 1);
        assert_eq!(encoder_bus_requests(PackedFormat::Packed444, Yuv444, true), 4);
    }

    #[rstest]
    #[case(Mirror::None, Rotation::None, 0)]
    #[case(Mirror::Vertical, Rotation::None, 8 * 128)]
    #[case(Mirror::None, Rotation::Rotate90, 6)]
    #[case(Mirror::None, Rotation::Rotate180, 8 * 128 + 6)]
    #[case(Mirror::Vertical, Rotation::Rotate90, 8 * 128)]
    #[case(Mirror::Horizontal, Rotation::Rotate90, 0)]
    fn padding_lookup(#[case] mirror: Mirror, #[case] rotation: Rotation, #[case] expected: u32) {
        assert_eq!(appending_size(mirror, rotation, 128, 64, 122, 56), expected);
    }

    #[test]
    fn parameter_ranges() {
        assert!(Rotation::from_degrees(45).is_err());
        assert_eq!(Rotation::from_degrees(270).unwrap().index(), 3);
        assert!(Mirror::from_index(4).is_err());
        assert!(PackedFormat::from_index(6).is_err());
        assert!(ChromaInterleave::from_index(3).is_err());
        assert_eq!(FrameFormat::Yuv422.transposed(), FrameFormat::Yuv440);
        assert_eq!(FrameFormat::Yuv420.components()[1].q_table_index, 1);
    }
}
