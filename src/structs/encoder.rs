/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Encoder sessions.
//!
//! The caller writes the headers with `encode_header` into the front of the
//! output buffer, then starts a frame job that appends the entropy coded
//! body behind them. In slice mode a picture takes one job per slice.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::consts::PRODUCT_ID_CODAJ10;
use crate::jpu_error::{err_exit_code, ErrorCode, JpuError, Result};
use crate::jpu_registers::*;
use crate::structs::device::DeviceContext;
use crate::structs::frame_format::{
    appending_size, encoder_bus_requests, ChromaInterleave, FrameFormat, McuGeometry, Mirror,
    PackedFormat, Rotation,
};
use crate::structs::frame_job::FrameJob;
use crate::structs::header_writer::{write_header, HeaderOptions, HeaderSource};
use crate::structs::huffman_tables::{slot_class, HuffmanTable, HuffmanTableSet};
use crate::structs::instance_pool::{SessionId, SessionMode};
use crate::structs::quantization_tables::{
    encoder_quant_program, QuantPrecision, QuantizationTable, QuantizationTableSet,
};
use crate::structs::register_words::{DpbConfig, InterruptMask, PictureSize, RotationInfo};
use crate::structs::session::{table_error, FrameBuffer, SessionCore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderOpenParams {
    pub width: u32,
    pub height: u32,
    pub source_format: FrameFormat,

    /// 0 planar, 1 to 4 packed 4:2:2 orders, 5 packed 4:4:4
    pub packed_format: u32,

    /// 0 planar, 1 CbCr, 2 CrCb
    pub chroma_interleave: u32,
    pub twelve_bit: bool,
    pub restart_interval: u32,
    pub rotation_degrees: u32,
    pub mirror: u32,

    pub slice_mode: bool,

    /// rows per slice job, 0 codes the picture in one job
    pub slice_height: u32,

    pub interrupt_enable: InterruptMask,
    pub frame_endian: u32,
    pub stream_endian: u32,

    /// fill the end of the picture with 0xFF up to the bus width
    pub stuff_byte_enable: bool,
}

impl EncoderOpenParams {
    pub fn new(width: u32, height: u32, source_format: FrameFormat) -> Self {
        EncoderOpenParams {
            width,
            height,
            source_format,
            packed_format: 0,
            chroma_interleave: 0,
            twelve_bit: false,
            restart_interval: 0,
            rotation_degrees: 0,
            mirror: 0,
            slice_mode: false,
            slice_height: 0,
            interrupt_enable: InterruptMask {
                done: true,
                error: true,
                buffer: true,
                slice_done: false,
            },
            frame_endian: 0,
            stream_endian: 0,
            stuff_byte_enable: false,
        }
    }
}

/// One encode job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeFrameParams {
    /// picture to encode, plane offsets relative to the mapped buffer
    pub source: FrameBuffer,
    pub stride: u32,

    /// output buffer
    pub stream_fd: i32,

    /// room for the entropy coded body
    pub stream_size: u32,

    /// where the body starts in the output buffer, usually the header length
    pub body_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeState {
    SliceDone,
    FrameDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedOutput {
    /// bytes the job appended behind the body offset
    pub bitstream_size: u32,

    /// first row of the next slice, 0 once the picture is complete
    pub slice_position: u32,
    pub encode_state: EncodeState,
    pub read_ptr: u32,
    pub write_ptr: u32,
    pub frame_cycles: u32,
}

pub struct EncoderSession {
    core: SessionCore,
    params: EncoderOpenParams,
    packed: PackedFormat,
    chroma_interleave: ChromaInterleave,
    rotation: Rotation,
    mirror: Mirror,
    slice_height: u32,
    geometry: McuGeometry,
    bus_requests: u32,

    huffman_tables: HuffmanTableSet,
    quant_tables: QuantizationTableSet,

    /// frame index written into the APP9 segment of the next header
    frame_index: u32,
    slice_position: u32,
}

/// Rows a job sees: the aligned height, or the aligned width when the
/// rotator turns the picture.
fn ppu_height(geometry: &McuGeometry, rotation: Rotation) -> u32 {
    if rotation.swaps_axes() {
        geometry.aligned_width
    } else {
        geometry.aligned_height
    }
}

fn default_quant_tables(twelve_bit: bool) -> QuantizationTableSet {
    let precision = if twelve_bit {
        QuantPrecision::Bits16
    } else {
        QuantPrecision::Bits8
    };
    let luma = QuantizationTable::new(precision, *QuantizationTable::std_luminance().values());
    let chroma = QuantizationTable::new(precision, *QuantizationTable::std_chrominance().values());
    [Some(luma), Some(chroma), Some(luma), Some(chroma)]
}

impl EncoderSession {
    /// Opens an encoder session in a free slot of `device`
    pub fn open(device: &Arc<DeviceContext>, params: EncoderOpenParams) -> Result<Self> {
        let features = device.enabled_features();

        if !(16..=features.max_picture_width).contains(&params.width)
            || !(16..=features.max_picture_height).contains(&params.height)
        {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!("cannot encode a {0}x{1} picture", params.width, params.height),
            );
        }

        if params.interrupt_enable.is_empty() {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                "the encoder needs at least one interrupt",
            );
        }

        let packed = PackedFormat::from_index(params.packed_format)?;
        let chroma_interleave = ChromaInterleave::from_index(params.chroma_interleave)?;
        let rotation = Rotation::from_degrees(params.rotation_degrees)?;
        let mirror = Mirror::from_index(params.mirror)?;

        if packed == PackedFormat::Packed444 && params.source_format != FrameFormat::Yuv444 {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!("packed 4:4:4 input for a {0:?} picture", params.source_format),
            );
        }

        let capabilities = device.capabilities()?;
        if capabilities.product_id != PRODUCT_ID_CODAJ10 {
            return err_exit_code(
                ErrorCode::NotSupported,
                format!("product {0} cannot encode", capabilities.product_id),
            );
        }
        if params.twelve_bit && !capabilities.support_12bit {
            return err_exit_code(
                ErrorCode::NotSupported,
                "12-bit encoding needs a 12-bit capable device",
            );
        }

        let coded_height = if rotation.swaps_axes() {
            params.width
        } else {
            params.height
        };
        let requested_slice = if params.slice_height == 0 {
            coded_height
        } else {
            params.slice_height
        };

        let geometry = McuGeometry::for_encoder(
            params.source_format,
            params.width,
            params.height,
            rotation,
            params.restart_interval,
            requested_slice,
        );

        if params.slice_mode {
            let ppu = ppu_height(&geometry, rotation);
            if params.slice_height % geometry.mcu_height != 0
                || params.slice_height > ppu
                || params.slice_height < geometry.mcu_height
            {
                return err_exit_code(
                    ErrorCode::InvalidParameter,
                    format!(
                        "slice height {0} is not a multiple of {1} between {1} and {2}",
                        params.slice_height, geometry.mcu_height, ppu
                    ),
                );
            }
        }

        let core = SessionCore::open(device, SessionMode::Encoder, params.slice_mode)?;

        info!(
            "device {0}: encoder in slot {1}, {2}x{3} {4:?}",
            device.device_id(),
            core.id().slot_index(),
            params.width,
            params.height,
            params.source_format
        );

        Ok(EncoderSession {
            core,
            params,
            packed,
            chroma_interleave,
            rotation,
            mirror,
            slice_height: requested_slice,
            geometry,
            bus_requests: encoder_bus_requests(packed, params.source_format, params.twelve_bit),
            huffman_tables: HuffmanTableSet::defaults(params.twelve_bit),
            quant_tables: default_quant_tables(params.twelve_bit),
            frame_index: 0,
            slice_position: 0,
        })
    }

    pub fn id(&self) -> SessionId {
        self.core.id()
    }

    pub fn geometry(&self) -> &McuGeometry {
        &self.geometry
    }

    pub fn quant_tables(&self) -> &QuantizationTableSet {
        &self.quant_tables
    }

    pub fn huffman_tables(&self) -> &HuffmanTableSet {
        &self.huffman_tables
    }

    /// pictures completed so far, the APP9 segment of the next header carries it
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    fn check_idle(&self) -> Result<()> {
        if self.core.has_job_in_flight() {
            return err_exit_code(
                ErrorCode::FrameNotComplete,
                "cannot change the encoder while a job is in flight",
            );
        }
        Ok(())
    }

    fn relayout(&mut self) {
        self.geometry = McuGeometry::for_encoder(
            self.params.source_format,
            self.params.width,
            self.params.height,
            self.rotation,
            self.params.restart_interval,
            self.slice_height,
        );
    }

    /// Scales the luma and chroma tables for `quality` in 1..=100. Tables 2
    /// and 3 become copies of the scaled tables 0 and 1.
    pub fn set_quality(&mut self, quality: u32) -> Result<()> {
        self.check_idle()?;
        if !(1..=100).contains(&quality) {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!("quality {0} outside 1..=100", quality),
            );
        }

        let twelve_bit = self.params.twelve_bit;
        let base = default_quant_tables(twelve_bit);
        let scale = |i: usize| {
            self.quant_tables[i]
                .or(base[i])
                .map(|t| t.scaled(quality, twelve_bit))
        };

        let luma = scale(0);
        let chroma = scale(1);
        self.quant_tables = [luma, chroma, luma, chroma];
        debug!("quality {0} for slot {1}", quality, self.core.id().slot_index());
        Ok(())
    }

    pub fn set_quant_table(&mut self, index: usize, table: QuantizationTable) -> Result<()> {
        self.check_idle()?;
        if index >= self.quant_tables.len() {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!("quantization table index {0} out of range", index),
            );
        }
        table.validate(self.params.twelve_bit)?;
        self.quant_tables[index] = Some(table);
        Ok(())
    }

    pub fn set_huffman_table(&mut self, slot: usize, table: HuffmanTable) -> Result<()> {
        self.check_idle()?;
        if slot >= HuffmanTableSet::active_slots(self.params.twelve_bit) {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!("huffman table slot {0} is not used by this encoder", slot),
            );
        }
        table.build_encode_table(slot_class(slot))?;
        self.huffman_tables.set(slot, table)
    }

    pub fn set_rotation(&mut self, degrees: u32) -> Result<()> {
        self.check_idle()?;
        self.rotation = Rotation::from_degrees(degrees)?;
        self.relayout();
        Ok(())
    }

    pub fn set_mirror(&mut self, mirror: u32) -> Result<()> {
        self.check_idle()?;
        self.mirror = Mirror::from_index(mirror)?;
        Ok(())
    }

    pub fn set_restart_interval(&mut self, interval: u32) -> Result<()> {
        self.check_idle()?;
        if interval > u32::from(u16::MAX) {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!("restart interval {0} does not fit DRI", interval),
            );
        }
        self.params.restart_interval = interval;
        self.relayout();
        Ok(())
    }

    /// Headers of the next picture, written into the front of the output
    /// buffer by the caller
    pub fn encode_header(&self, options: &HeaderOptions) -> Result<Vec<u8>> {
        let source = HeaderSource {
            frame_index: self.frame_index,
            restart_interval: self.params.restart_interval,
            twelve_bit: self.params.twelve_bit,
            format: self.params.source_format,
            width: self.params.width,
            height: self.params.height,
            rotation: self.rotation,
            quant_tables: &self.quant_tables,
            huffman_tables: &self.huffman_tables,
        };
        write_header(&source, options)
    }

    /// Maps the buffers, programs the registers and starts the encoder.
    /// Tables are loaded with the first slice of a picture.
    pub fn start_frame(&mut self, params: &EncodeFrameParams) -> Result<()> {
        self.check_idle()?;

        if params.stride == 0 || params.stride % 8 != 0 {
            return err_exit_code(
                ErrorCode::InvalidStride,
                format!("stride {0} is not a multiple of 8", params.stride),
            );
        }
        if params.stream_size == 0 {
            return err_exit_code(ErrorCode::InvalidParameter, "output buffer is empty");
        }

        let twelve_bit = self.params.twelve_bit;
        let first_slice = self.slice_position == 0;

        let (huffman_program, quant_program) = if first_slice {
            let component_tables = self
                .params
                .source_format
                .components()
                .map(|c| c.q_table_index);
            (
                self.huffman_tables
                    .encoder_program(twelve_bit)
                    .map_err(table_error)?,
                encoder_quant_program(&self.quant_tables, component_tables, twelve_bit)
                    .map_err(table_error)?,
            )
        } else {
            (Vec::new(), Vec::new())
        };

        let device = self.core.device().clone();
        let bank = self.core.register_bank();

        let mut job = FrameJob::new(self.frame_index, bank);
        job.configure()?;

        let lock = device.lock()?;
        self.core.check_can_start(&lock)?;

        let aligned_width = self.geometry.aligned_width;
        let aligned_height = self.geometry.aligned_height;
        let data_size = aligned_width * aligned_height * 3 / 2;
        let append = appending_size(
            self.mirror,
            self.rotation,
            aligned_width,
            aligned_height,
            self.params.width,
            self.params.height,
        );

        let dma = device.hardware().configure_dma(
            params.source.dma_fd,
            params.stream_fd,
            data_size,
            append,
        )?;
        if dma.input_addr == 0 || dma.output_addr == 0 {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!(
                    "could not map buffers {0} and {1}",
                    params.source.dma_fd, params.stream_fd
                ),
            );
        }

        let overflow = || {
            JpuError::new(
                ErrorCode::InvalidParameter,
                format!(
                    "output buffer at {0:#x}+{1:#x} overflows",
                    dma.output_addr, params.body_offset
                ),
            )
        };
        let stream_start = dma
            .output_addr
            .checked_add(params.body_offset)
            .ok_or_else(overflow)?;
        let stream_end = stream_start
            .checked_add(params.stream_size)
            .ok_or_else(overflow)?;

        let planes = FrameBuffer {
            base_addr: dma.input_addr,
            ..params.source
        }
        .plane_addresses(append / 2)?;

        let gbu = device.enabled_features().gbu_size;
        let w = |offset: u32, value: u32| device.write_register(bank, offset, value);

        w(INTR_MASK, !self.params.interrupt_enable.encode() & 0x7FF);
        w(PIC_SETMB, 0);
        w(CLP_INFO, 0);

        w(BBC_BAS_ADDR, stream_start);
        w(BBC_END_ADDR, stream_end);
        w(BBC_WR_PTR, stream_start);
        w(BBC_RD_PTR, stream_start);
        w(BBC_CUR_POS, 0);
        w(BBC_DATA_CNT, gbu / 4);
        w(BBC_EXT_ADDR, stream_start);
        w(BBC_INT_ADDR, 0);

        w(GBU_BPTR, 0);
        w(GBU_WPTR, 0);
        w(GBU_BBSR, 0);
        w(GBU_CTRL, 8);
        w(GBU_BBER, gbu / 4 * 2 - 1);
        w(GBU_BBIR, gbu / 4);
        w(GBU_BBHR, gbu / 4);

        w(PIC_CTRL, 1 << 6 | PIC_CTRL_ENCODE | 1 << 3);
        w(SCL_INFO, 0);
        w(
            DPB_CONFIG,
            DpbConfig {
                packed_format: self.packed as u32,
                chroma_interleave: self.chroma_interleave as u32,
                frame_endian: self.params.frame_endian,
            }
            .encode(),
        );
        w(RST_INTVAL, self.params.restart_interval);
        if first_slice {
            w(RST_INDEX, 0);
            w(BBC_STRM_CTRL, 0);
        }

        w(BBC_CTRL, self.params.stream_endian << 1 | 1);
        w(OP_INFO, self.bus_requests);

        device.run_program(bank, &huffman_program);
        device.run_program(bank, &quant_program);

        w(
            PIC_SIZE,
            PictureSize {
                width: aligned_width,
                height: aligned_height,
            }
            .encode(),
        );

        w(
            ROT_INFO,
            RotationInfo {
                enabled: self.rotation != Rotation::None || self.mirror != Mirror::None,
                mirror_index: self.mirror.index(),
                rotation_index: self.rotation.index(),
            }
            .encode(),
        );
        w(MCU_INFO, self.geometry.mcu_info().encode());
        w(GBU_CTRL, u32::from(self.params.stuff_byte_enable) << 3);

        w(DPB_BASE00, planes[0]);
        w(DPB_BASE01, planes[1]);
        w(DPB_BASE02, planes[2]);
        w(DPB_YSTRIDE, params.stride);
        w(
            DPB_CSTRIDE,
            if params.source.stride_c != 0 {
                params.source.stride_c
            } else {
                params.stride
            },
        );

        debug!(
            "device {0}: encoding frame {1} of slot {2} on bank {3} from row {4}, input {5:#x}, output {6:#x}, padding {7}",
            device.device_id(),
            self.frame_index,
            self.core.id().slot_index(),
            bank,
            self.slice_position,
            dma.input_addr,
            stream_start,
            append
        );

        self.core.launch(&lock, job)?;
        Ok(())
    }

    /// Waits for the job and reports the bytes it produced
    pub fn wait_and_collect(&mut self, timeout: Duration) -> Result<EncodedOutput> {
        let status = self.core.wait(timeout)?;

        let device = self.core.device().clone();
        let bank = self.core.register_bank();
        let lock = device.lock()?;
        self.core.check_collectable(&lock)?;

        let frame_cycles = device.read_register(bank, CYCLE_INFO);

        if status & (1 << INT_BIT_BUF_FULL) != 0 || status & (1 << INT_ERROR) != 0 {
            self.core.finish(&lock, Some(ErrorCode::Failure))?;
            self.slice_position = 0;
            warn!(
                "device {0}: encode of slot {1} failed with status {2:#x}",
                device.device_id(),
                self.core.id().slot_index(),
                status
            );
            return err_exit_code(
                ErrorCode::Failure,
                if status & (1 << INT_ERROR) != 0 {
                    "the encoder reported an error"
                } else {
                    "the output buffer is full"
                },
            );
        }

        let done = status & (1 << INT_DONE) != 0;
        let slice_position = if done {
            0
        } else {
            device.read_register(bank, SLICE_POS)
        };

        let write_ptr = device.read_register(bank, BBC_WR_PTR);
        let read_ptr = device.read_register(bank, BBC_RD_PTR);

        self.core.finish(&lock, None)?;
        self.slice_position = slice_position;
        if done {
            // the next header belongs to the next picture
            self.frame_index += 1;
        }

        Ok(EncodedOutput {
            bitstream_size: write_ptr.wrapping_sub(read_ptr),
            slice_position,
            encode_state: if done {
                EncodeState::FrameDone
            } else {
                EncodeState::SliceDone
            },
            read_ptr,
            write_ptr,
            frame_cycles,
        })
    }

    /// Frees the slot. Fails with FrameNotComplete while a job is in flight.
    pub fn close(&mut self) -> Result<()> {
        self.core.close()
    }
}
