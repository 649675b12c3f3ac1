/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Decoder sessions.
//!
//! The caller owns the stream ring memory. It writes compressed data at the
//! write pointer, reports it with `feed_bitstream`, lets `parse_headers`
//! locate and parse the next frame and then runs one frame job per picture
//! with `start_frame` and `wait_and_collect`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::jpu_error::{err_exit_code, ErrorCode, Result};
use crate::jpu_registers::*;
use crate::structs::device::DeviceContext;
use crate::structs::frame_format::{
    decoder_bus_requests, ChromaInterleave, FrameFormat, McuGeometry, Mirror, PackedFormat,
    RoiRect, Rotation,
};
use crate::structs::frame_job::FrameJob;
use crate::structs::instance_pool::{SessionId, SessionMode};
use crate::structs::jpeg_header::{scan_frame, EcsPointer, FrameScan, JpegHeader};
use crate::structs::quantization_tables::decoder_quant_program;
use crate::structs::register_words::{
    ClipBase, DecoderPictureControl, DpbConfig, ErrorMacroblock, InterruptMask, PictureSize,
    RotationInfo, ScaleInfo,
};
use crate::structs::session::{table_error, FrameBuffer, SessionCore};
use crate::structs::stream_buffer::{relocate_wrapped_frame, StreamRing};

/// the decoder renders into one buffer at a time
pub const MIN_FRAME_BUFFER_COUNT: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderOpenParams {
    /// device address and size of the stream ring
    pub stream_buffer_addr: u32,
    pub stream_buffer_size: u32,

    /// 0 planar, 1 CbCr, 2 CrCb
    pub chroma_interleave: u32,

    /// 0 planar, 1 to 4 packed 4:2:2 orders, 5 packed 4:4:4
    pub packed_format: u32,
    pub rotation_degrees: u32,
    pub mirror: u32,

    /// format of the frame buffers, `None` keeps the format of the stream
    pub output_format: Option<FrameFormat>,

    pub frame_endian: u32,
    pub stream_endian: u32,
    pub slice_mode: bool,
    pub check_write_response: bool,
    pub interrupt_enable: InterruptMask,
}

impl Default for DecoderOpenParams {
    fn default() -> Self {
        DecoderOpenParams {
            stream_buffer_addr: 0,
            stream_buffer_size: 0,
            chroma_interleave: 0,
            packed_format: 0,
            rotation_degrees: 0,
            mirror: 0,
            output_format: None,
            frame_endian: 0,
            stream_endian: 0,
            slice_mode: false,
            check_write_response: false,
            interrupt_enable: InterruptMask::all(),
        }
    }
}

/// Where a region of interest lands in MCU and pixel units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoiPlacement {
    pub mcu_columns: u32,
    pub mcu_rows: u32,
    pub mcu_offset_x: u32,
    pub mcu_offset_y: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub frame_offset_x: u32,
    pub frame_offset_y: u32,
}

/// What the first headers of a stream said
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderInitialInfo {
    pub picture_width: u32,
    pub picture_height: u32,
    pub source_format: FrameFormat,
    pub twelve_bit: bool,
    pub min_frame_buffer_count: usize,

    /// start of the entropy coded segment relative to the frame's SOI
    pub ecs_offset: u32,

    pub aligned_width: u32,
    pub aligned_height: u32,
    pub mcu_width: u32,
    pub mcu_height: u32,
    pub restart_interval: u32,
    pub slice_height: u32,
    pub roi: Option<RoiPlacement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderCommand {
    /// power of two down scaling, 0 to 3 per axis
    SetScale { horizontal: u32, vertical: u32 },
    EnableRoi,
    DisableRoi,
    SetRoi(RoiRect),

    /// 0 selects the whole picture
    SetSliceHeight(u32),
}

/// Per frame overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodeFrameParams {
    /// nonzero values replace the scaling set with `SetScale` for this frame
    pub scale_horizontal: u32,
    pub scale_vertical: u32,
}

/// Result of a collected decode job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOutput {
    /// frame buffer that holds the picture
    pub index_frame_display: usize,
    pub decoded_width: u32,
    pub decoded_height: u32,

    /// offset of the frame's SOI from the ring start
    pub frame_start_offset: u32,
    pub ecs_offset: u32,
    pub consumed_bytes: u32,

    /// bytes behind the frame start the next frame search skips
    pub next_consume_offset: i32,

    pub read_ptr: u32,
    pub write_ptr: u32,
    pub decode_success: bool,
    pub error_macroblock: Option<ErrorMacroblock>,
    pub slice_position: u32,
    pub frame_cycles: u32,
}

/// Stream pointers as the caller sees them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedRoom {
    pub read_ptr: u32,
    pub write_ptr: u32,
    pub room: u32,
}

/// Places `rect` on the MCU grid of a parsed picture. Grayscale pictures
/// count the ROI width in 8 pixel blocks.
pub fn resolve_roi(
    format: FrameFormat,
    geometry: &McuGeometry,
    rect: &RoiRect,
) -> Result<RoiPlacement> {
    let mcu_width = geometry.mcu_width;
    let mcu_height = geometry.mcu_height;
    let unit_width = if format == FrameFormat::Yuv400 {
        8
    } else {
        mcu_width
    };

    let right = rect.x.saturating_add(rect.width);
    let bottom = rect.y.saturating_add(rect.height);

    if rect.x > geometry.aligned_width
        || rect.y > geometry.aligned_height
        || right > geometry.aligned_width
        || bottom > geometry.aligned_height
    {
        return err_exit_code(
            ErrorCode::InvalidParameter,
            format!(
                "ROI {0:?} outside the {1}x{2} picture",
                rect, geometry.aligned_width, geometry.aligned_height
            ),
        );
    }

    if right < unit_width || bottom < mcu_height {
        return err_exit_code(
            ErrorCode::InvalidParameter,
            format!("ROI {0:?} ends inside the first MCU", rect),
        );
    }

    let mcu_columns = rect.width / unit_width;
    let mcu_rows = rect.height / mcu_height;
    if mcu_columns == 0 || mcu_rows == 0 {
        return err_exit_code(
            ErrorCode::InvalidParameter,
            format!("ROI {0:?} covers no whole MCU", rect),
        );
    }

    let mcu_offset_x = rect.x / mcu_width;
    let mcu_offset_y = rect.y / mcu_height;

    Ok(RoiPlacement {
        mcu_columns,
        mcu_rows,
        mcu_offset_x,
        mcu_offset_y,
        frame_width: mcu_columns * unit_width,
        frame_height: mcu_rows * mcu_height,
        frame_offset_x: mcu_offset_x * mcu_width,
        frame_offset_y: mcu_offset_y * mcu_height,
    })
}

pub struct DecoderSession {
    core: SessionCore,
    params: DecoderOpenParams,
    chroma_interleave: ChromaInterleave,
    packed: PackedFormat,
    rotation: Rotation,
    mirror: Mirror,

    ring: StreamRing,
    header: Option<JpegHeader>,

    /// the headers of the frame at the ring's frame offset are parsed and
    /// the frame was not decoded yet
    frame_ready: bool,

    /// header size of earlier frames, a motion JPEG stream repeats it
    header_size: u32,

    geometry: McuGeometry,
    roi_enabled: bool,
    roi: RoiRect,
    roi_placement: Option<RoiPlacement>,
    scale: ScaleInfo,
    requested_slice_height: u32,

    frame_buffers: Vec<FrameBuffer>,
    stride: u32,
    stride_c: u32,
    frame_index: u32,

    /// scaling of the job in flight
    active_scale: ScaleInfo,

    last_output: Option<DecodeOutput>,
}

impl DecoderSession {
    /// Opens a decoder session in a free slot of `device`
    pub fn open(device: &Arc<DeviceContext>, params: DecoderOpenParams) -> Result<Self> {
        let chroma_interleave = ChromaInterleave::from_index(params.chroma_interleave)?;
        let rotation = Rotation::from_degrees(params.rotation_degrees)?;
        let mirror = Mirror::from_index(params.mirror)?;
        let packed = PackedFormat::from_index(params.packed_format)?;

        if packed != PackedFormat::None && chroma_interleave != ChromaInterleave::Planar {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                "packed output cannot interleave chroma",
            );
        }

        if let Some(f @ (FrameFormat::Yuv400 | FrameFormat::Yuv440)) = params.output_format {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!("cannot decode into {0:?}", f),
            );
        }

        let ring = StreamRing::new(params.stream_buffer_addr, params.stream_buffer_size)?;
        let core = SessionCore::open(device, SessionMode::Decoder, params.slice_mode)?;

        info!(
            "device {0}: decoder in slot {1}, stream buffer {2:#x}+{3:#x}",
            device.device_id(),
            core.id().slot_index(),
            params.stream_buffer_addr,
            params.stream_buffer_size
        );

        Ok(DecoderSession {
            core,
            params,
            chroma_interleave,
            packed,
            rotation,
            mirror,
            ring,
            header: None,
            frame_ready: false,
            header_size: 0,
            geometry: McuGeometry::default(),
            roi_enabled: false,
            roi: RoiRect::default(),
            roi_placement: None,
            scale: ScaleInfo::default(),
            requested_slice_height: 0,
            frame_buffers: Vec::new(),
            stride: 0,
            stride_c: 0,
            frame_index: 0,
            active_scale: ScaleInfo::default(),
            last_output: None,
        })
    }

    pub fn id(&self) -> SessionId {
        self.core.id()
    }

    pub fn stream(&self) -> &StreamRing {
        &self.ring
    }

    pub fn header(&self) -> Option<&JpegHeader> {
        self.header.as_ref()
    }

    /// number of frames collected so far
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// result of the last collected frame
    pub fn get_output_info(&self) -> Option<DecodeOutput> {
        self.last_output
    }

    /// Answers BitstreamWrap from `parse_headers`: moves the wrapped frame to
    /// the front of `ring_view` and points the ring at it. Parse again after.
    pub fn relocate_wrapped_frame(&mut self, ring_view: &mut [u8]) -> Result<()> {
        if self.core.has_job_in_flight() {
            return err_exit_code(
                ErrorCode::FrameNotComplete,
                "cannot move stream data while a frame is being decoded",
            );
        }

        let relocated = relocate_wrapped_frame(
            ring_view,
            self.ring.frame_offset(),
            self.ring.write_offset(),
            self.core.device().enabled_features().gbu_size,
        )?;
        debug!(
            "slot {0}: moved wrapped frame to offset {1}, {2} bytes buffered",
            self.core.id().slot_index(),
            relocated.frame_offset,
            relocated.write_offset
        );
        self.ring.apply_relocation(relocated);
        Ok(())
    }

    fn slice_height(&self) -> u32 {
        if self.requested_slice_height == 0 {
            self.geometry.aligned_height
        } else {
            self.requested_slice_height
        }
    }

    /// MCU geometry and ROI of `header` under the current ROI settings
    fn layout(&self, header: &JpegHeader) -> Result<(McuGeometry, Option<RoiPlacement>)> {
        let roi_offset = if self.roi_enabled {
            Some(self.roi.x)
        } else {
            None
        };
        let geometry =
            McuGeometry::for_decoder(header.format, header.width, header.height, roi_offset);

        let placement = if self.roi_enabled {
            Some(resolve_roi(header.format, &geometry, &self.roi)?)
        } else {
            None
        };
        Ok((geometry, placement))
    }

    fn relayout(&mut self) -> Result<()> {
        if let Some(header) = self.header.as_ref() {
            let (geometry, placement) = self.layout(header)?;
            self.geometry = geometry;
            self.roi_placement = placement;
        }
        Ok(())
    }

    fn initial_info(&self, header: &JpegHeader) -> DecoderInitialInfo {
        DecoderInitialInfo {
            picture_width: header.width,
            picture_height: header.height,
            source_format: header.format,
            twelve_bit: header.twelve_bit,
            min_frame_buffer_count: MIN_FRAME_BUFFER_COUNT,
            ecs_offset: header.ecs_offset,
            aligned_width: self.geometry.aligned_width,
            aligned_height: self.geometry.aligned_height,
            mcu_width: self.geometry.mcu_width,
            mcu_height: self.geometry.mcu_height,
            restart_interval: header.restart_interval,
            slice_height: self.slice_height(),
            roi: self.roi_placement,
        }
    }

    /// Finds the next frame in the ring and parses its headers. Frames that
    /// end before any scan are skipped. `ring_view` is the CPU view of the
    /// whole stream buffer.
    ///
    /// Calling again before the frame was decoded parses the same frame.
    pub fn parse_headers(&mut self, ring_view: &[u8]) -> Result<DecoderInitialInfo> {
        if self.core.has_job_in_flight() {
            return err_exit_code(
                ErrorCode::FrameNotComplete,
                "cannot parse while a frame is being decoded",
            );
        }

        let features = self.core.device().enabled_features().clone();
        let mut search_next = !self.frame_ready;

        let header = loop {
            match scan_frame(
                ring_view,
                &mut self.ring,
                search_next,
                self.header_size,
                self.header.as_ref(),
                &features,
            )? {
                FrameScan::Header(h) => break h,
                FrameScan::EmptyFrame => {
                    debug!(
                        "skipping empty frame at {0}",
                        self.ring.frame_offset()
                    );
                    self.ring.skip_current_frame();
                    search_next = true;
                }
            }
        };

        let capabilities = self.core.device().capabilities()?;
        if header.twelve_bit && !capabilities.support_12bit {
            return err_exit_code(
                ErrorCode::NotSupported,
                "12-bit streams need a 12-bit capable decoder",
            );
        }

        if self.packed == PackedFormat::Packed444 && header.format != FrameFormat::Yuv444 {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!("packed 4:4:4 output from a {0:?} stream", header.format),
            );
        }

        let (geometry, placement) = self.layout(&header)?;
        self.geometry = geometry;
        self.roi_placement = placement;

        let info = self.initial_info(&header);
        debug!(
            "frame {0} at {1}: {2}x{3} {4:?}, ECS at {5}",
            self.frame_index,
            self.ring.frame_offset(),
            header.width,
            header.height,
            header.format,
            header.ecs_offset
        );

        self.header_size = header.ecs_offset;
        self.header = Some(header);
        self.frame_ready = true;
        Ok(info)
    }

    pub fn give_command(&mut self, command: DecoderCommand) -> Result<()> {
        match command {
            DecoderCommand::SetScale {
                horizontal,
                vertical,
            } => {
                if horizontal > 3 || vertical > 3 {
                    return err_exit_code(
                        ErrorCode::InvalidParameter,
                        format!("scale {0}/{1} out of range", horizontal, vertical),
                    );
                }
                if (horizontal != 0 || vertical != 0)
                    && (self.geometry.aligned_width < 128 || self.geometry.aligned_height < 128)
                {
                    return err_exit_code(
                        ErrorCode::InvalidParameter,
                        format!(
                            "a {0}x{1} picture is too small to scale",
                            self.geometry.aligned_width, self.geometry.aligned_height
                        ),
                    );
                }
                self.scale = ScaleInfo {
                    horizontal,
                    vertical,
                };
            }
            DecoderCommand::EnableRoi => {
                self.roi_enabled = true;
                if let Err(e) = self.relayout() {
                    self.roi_enabled = false;
                    return Err(e);
                }
            }
            DecoderCommand::DisableRoi => {
                self.roi_enabled = false;
                self.relayout()?;
            }
            DecoderCommand::SetRoi(rect) => {
                let previous = self.roi;
                self.roi = rect;
                if self.roi_enabled {
                    if let Err(e) = self.relayout() {
                        self.roi = previous;
                        return Err(e);
                    }
                }
            }
            DecoderCommand::SetSliceHeight(height) => {
                self.requested_slice_height = height;
            }
        }
        Ok(())
    }

    /// Hands the frame buffers to the decoder. Frames go round robin
    /// through them.
    pub fn register_frame_buffers(&mut self, buffers: &[FrameBuffer], stride: u32) -> Result<()> {
        if self.header.is_none() {
            return err_exit_code(
                ErrorCode::WrongCallSequence,
                "frame buffers are registered after the headers were parsed",
            );
        }

        if buffers.len() < MIN_FRAME_BUFFER_COUNT {
            return err_exit_code(
                ErrorCode::InsufficientFrameBuffers,
                format!(
                    "{0} frame buffers, at least {1} needed",
                    buffers.len(),
                    MIN_FRAME_BUFFER_COUNT
                ),
            );
        }

        if stride == 0 || stride % 8 != 0 {
            return err_exit_code(
                ErrorCode::InvalidStride,
                format!("stride {0} is not a multiple of 8", stride),
            );
        }

        self.frame_buffers = buffers.to_vec();
        self.stride = stride;
        self.stride_c = buffers[0].stride_c;
        Ok(())
    }

    /// Read pointer, write pointer and the room the caller may fill
    pub fn get_feed_room(&self) -> Result<FeedRoom> {
        let device = self.core.device();
        let lock = device.lock()?;

        let read_ptr = if self.core.is_pending(&lock)? {
            device.read_register(self.core.register_bank(), BBC_RD_PTR)
        } else {
            self.ring.read_ptr()
        };

        Ok(FeedRoom {
            read_ptr,
            write_ptr: self.ring.write_ptr(),
            room: self
                .ring
                .feed_room(device.enabled_features().feed_room_granularity),
        })
    }

    /// Reports `size` bytes written at the write pointer. A size of zero
    /// marks the end of the stream. A job in flight sees the new data at once.
    pub fn feed_bitstream(&mut self, size: u32) -> Result<()> {
        let device = self.core.device().clone();
        let bank = self.core.register_bank();
        let lock = device.lock()?;
        let pending = self.core.is_pending(&lock)?;

        self.ring.update(size)?;

        if !pending {
            return Ok(());
        }

        if size == 0 {
            let control = self
                .ring
                .end_of_stream_control(device.enabled_features().gbu_size);
            device.write_register(bank, BBC_STRM_CTRL, control.encode());
            return Ok(());
        }

        if device.read_register(bank, BBC_RD_PTR) == self.ring.end() {
            device.write_register(bank, BBC_CUR_POS, 0);
            device.write_register(bank, GBU_TCNT, 0);
            device.write_register(bank, GBU_TCNT + 4, 0);
        }

        device.write_register(bank, BBC_WR_PTR, self.ring.write_ptr());
        device.write_register(bank, BBC_END_ADDR, self.ring.fetch_limit());
        Ok(())
    }

    /// Moves the read pointer, the next frame is searched from `addr`
    pub fn set_rd_ptr(&mut self, addr: u32, update_write: bool) -> Result<()> {
        self.reposition(addr, update_write, false)
    }

    /// Like `set_rd_ptr`, and the ring starts at `addr` from now on
    pub fn set_rd_ptr_ex(&mut self, addr: u32, update_write: bool) -> Result<()> {
        self.reposition(addr, update_write, true)
    }

    fn reposition(&mut self, addr: u32, update_write: bool, rebase: bool) -> Result<()> {
        let device = self.core.device().clone();
        let lock = device.lock()?;
        self.core.check_not_pending(&lock)?;

        if rebase {
            self.ring.rebase(addr, update_write)?;
        } else {
            self.ring.set_read_pointer(addr, update_write)?;
        }

        device.write_register(self.core.register_bank(), BBC_RD_PTR, addr);
        self.frame_ready = false;
        Ok(())
    }

    /// Programs the registers for the parsed frame and starts the decoder.
    /// Fails with BitEmpty while too little data is buffered, the caller
    /// feeds more and starts again.
    pub fn start_frame(&mut self, params: &DecodeFrameParams) -> Result<()> {
        if self.frame_buffers.is_empty() {
            return err_exit_code(
                ErrorCode::WrongCallSequence,
                "no frame buffers registered",
            );
        }

        if self.core.has_job_in_flight() {
            return err_exit_code(
                ErrorCode::FrameNotComplete,
                "the previous frame was not collected",
            );
        }

        let header = match (&self.header, self.frame_ready) {
            (Some(h), true) => h,
            (Some(_), false) if self.ring.is_end_of_stream() => {
                return err_exit_code(ErrorCode::EndOfStream, "the stream has no further frame")
            }
            _ => {
                return err_exit_code(
                    ErrorCode::WrongCallSequence,
                    "the headers of the next frame were not parsed",
                )
            }
        };

        let device = self.core.device().clone();
        let features = device.enabled_features().clone();
        let bank = self.core.register_bank();

        let mut job = FrameJob::new(self.frame_index, bank);

        let scale = ScaleInfo {
            horizontal: if params.scale_horizontal > 0 {
                params.scale_horizontal
            } else {
                self.scale.horizontal
            },
            vertical: if params.scale_vertical > 0 {
                params.scale_vertical
            } else {
                self.scale.vertical
            },
        };
        if scale.horizontal > 3 || scale.vertical > 3 {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!("scale {0:?} out of range", scale),
            );
        }

        let user_huffman = header.user_huffman_tables();
        let huffman_program = if user_huffman {
            header
                .huffman_tables
                .decoder_program(header.twelve_bit)
                .map_err(table_error)?
        } else {
            Vec::new()
        };
        let quant_program =
            decoder_quant_program(&header.quant_tables, header.component_quant_tables())
                .map_err(table_error)?;

        let (huff_dc_index, huff_ac_index) = header.huffman_selection();
        let picture_control = DecoderPictureControl {
            huff_ac_index,
            huff_dc_index,
            user_huffman,
            check_write_response: self.params.check_write_response,
            twelve_bit: header.twelve_bit,
        };
        let ecs = EcsPointer::from_offset(self.ring.frame_offset() + header.ecs_offset);
        let restart_interval = header.restart_interval;
        let bus_requests = decoder_bus_requests(header.format, self.packed, header.twelve_bit);
        let planes = self.frame_buffers[self.frame_index as usize % self.frame_buffers.len()]
            .plane_addresses(0)?;

        job.configure()?;

        let lock = device.lock()?;
        self.core.check_can_start(&lock)?;
        self.ring.check_available(features.min_decode_bytes)?;

        let w = |offset: u32, value: u32| device.write_register(bank, offset, value);

        w(INTR_MASK, !self.params.interrupt_enable.encode() & 0x3FF);

        if self.ring.read_ptr() == self.ring.end() {
            w(BBC_CUR_POS, 0);
            w(GBU_TCNT, 0);
            w(GBU_TCNT + 4, 0);
        }

        w(BBC_WR_PTR, self.ring.write_ptr());
        w(BBC_END_ADDR, self.ring.start_end_address(features.gbu_size));
        w(BBC_BAS_ADDR, self.ring.start());
        w(GBU_TCNT, 0);
        w(GBU_TCNT + 4, 0);
        w(PIC_ERRMB, 0);
        w(PIC_CTRL, picture_control.encode());
        w(
            PIC_SIZE,
            PictureSize {
                width: self.geometry.aligned_width,
                height: self.geometry.aligned_height,
            }
            .encode(),
        );
        w(OP_INFO, bus_requests);
        w(MCU_INFO, self.geometry.mcu_info().encode());
        w(
            DPB_CONFIG,
            DpbConfig {
                packed_format: self.packed as u32,
                chroma_interleave: self.chroma_interleave as u32,
                frame_endian: self.params.frame_endian,
            }
            .encode(),
        );
        w(RST_INTVAL, restart_interval);
        w(SCL_INFO, scale.encode());

        device.run_program(bank, &huffman_program);
        device.run_program(bank, &quant_program);

        load_first_pages(&device, bank, &self.ring, ecs, self.params.stream_endian)?;

        if self.ring.is_end_of_stream() {
            if device.read_register(bank, BBC_STRM_CTRL) & (1 << 31) == 0 {
                w(
                    BBC_STRM_CTRL,
                    self.ring.end_of_stream_control(features.gbu_size).encode(),
                );
            }
        } else {
            w(BBC_STRM_CTRL, 0);
        }

        w(RST_INDEX, 0);
        w(RST_COUNT, 0);
        w(DPCM_DIFF_Y, 0);
        w(DPCM_DIFF_CB, 0);
        w(DPCM_DIFF_CR, 0);
        w(GBU_FF_RPTR, ecs.bit);
        w(GBU_CTRL, 3);

        w(
            ROT_INFO,
            RotationInfo {
                enabled: self.rotation != Rotation::None || self.mirror != Mirror::None,
                mirror_index: self.mirror.index(),
                rotation_index: self.rotation.index(),
            }
            .encode(),
        );

        w(DPB_BASE00, planes[0]);
        w(DPB_BASE01, planes[1]);
        w(DPB_BASE02, planes[2]);
        w(DPB_YSTRIDE, self.stride);
        w(DPB_CSTRIDE, self.stride_c);

        match self.roi_placement {
            Some(roi) => {
                w(CLP_INFO, 1);
                w(
                    CLP_BASE,
                    ClipBase {
                        offset_x: self.roi.x,
                        offset_y: self.roi.y,
                    }
                    .encode(),
                );
                w(
                    CLP_SIZE,
                    PictureSize {
                        width: roi.frame_width,
                        height: roi.frame_height,
                    }
                    .encode(),
                );
            }
            None => w(CLP_INFO, 0),
        }

        debug!(
            "device {0}: decoding frame {1} of slot {2} on bank {3}, {4} huffman and {5} quantizer writes",
            device.device_id(),
            self.frame_index,
            self.core.id().slot_index(),
            bank,
            huffman_program.len(),
            quant_program.len()
        );

        self.core.launch(&lock, job)?;
        self.active_scale = scale;
        Ok(())
    }

    /// Waits for the frame job and collects its result
    pub fn wait_and_collect(&mut self, timeout: Duration) -> Result<DecodeOutput> {
        let status = self.core.wait(timeout)?;
        self.collect(status)
    }

    fn collect(&mut self, status: u32) -> Result<DecodeOutput> {
        let device = self.core.device().clone();
        let bank = self.core.register_bank();
        let lock = device.lock()?;
        self.core.check_collectable(&lock)?;

        if status & JOB_END_STATUS == 0 {
            // the job stays on the hardware and resumes once data is fed
            debug!(
                "device {0}: frame {1} of slot {2} ran dry, status {3:#x}",
                device.device_id(),
                self.frame_index,
                self.core.id().slot_index(),
                status
            );
            return err_exit_code(
                ErrorCode::BitEmpty,
                format!(
                    "frame {0} is waiting for more of the stream",
                    self.frame_index
                ),
            );
        }

        let ecs_offset = self.header.as_ref().map(|h| h.ecs_offset).unwrap_or(0);
        let (width, height) = match self.roi_placement {
            Some(roi) => (roi.frame_width, roi.frame_height),
            None => (self.geometry.aligned_width, self.geometry.aligned_height),
        };

        let index_frame_display = self.frame_index as usize % self.frame_buffers.len().max(1);
        let frame_start_offset = self.ring.frame_offset();

        let consumed_bytes = device.read_register(bank, GBU_TCNT) / 8;
        let read_ptr = device.read_register(bank, BBC_RD_PTR);
        self.ring.record_consumed(consumed_bytes, ecs_offset);
        self.ring.set_hardware_read_pointer(read_ptr);
        let write_ptr = device.read_register(bank, BBC_WR_PTR);

        let (decode_success, error_macroblock, slice_position) = if status & (1 << INT_DONE) != 0
        {
            (true, None, 0)
        } else if status & (1 << INT_ERROR) != 0 {
            let mb = ErrorMacroblock::decode(device.read_register(bank, PIC_ERRMB));
            (false, Some(mb), 0)
        } else {
            // slice done
            (true, None, device.read_register(bank, SLICE_POS))
        };

        let frame_cycles = device.read_register(bank, CYCLE_INFO);

        self.core.finish(&lock, None)?;
        drop(lock);

        self.frame_index += 1;
        if slice_position == 0 {
            self.frame_ready = false;
        }

        if let Some(mb) = error_macroblock {
            debug!(
                "frame {0}: error at restart {1}, MCU {2}/{3}",
                self.frame_index - 1,
                mb.restart_index,
                mb.x,
                mb.y
            );
        }

        let output = DecodeOutput {
            index_frame_display,
            decoded_width: width >> self.active_scale.horizontal,
            decoded_height: height >> self.active_scale.vertical,
            frame_start_offset,
            ecs_offset,
            consumed_bytes,
            next_consume_offset: self.ring.consume_byte(),
            read_ptr,
            write_ptr,
            decode_success,
            error_macroblock,
            slice_position,
            frame_cycles,
        };
        self.last_output = Some(output);
        Ok(output)
    }

    /// Frees the slot. Fails with FrameNotComplete while a frame is in flight.
    pub fn close(&mut self) -> Result<()> {
        self.core.close()
    }
}

/// Loads the two stream pages holding the start of the entropy coded
/// segment into the bit buffer and points the bit unit at the first bit.
fn load_first_pages(
    device: &DeviceContext,
    bank: usize,
    ring: &StreamRing,
    ecs: EcsPointer,
    stream_endian: u32,
) -> Result<()> {
    let gbu = device.enabled_features().gbu_size;
    let words = gbu / 4;
    let w = |offset: u32, value: u32| device.write_register(bank, offset, value);

    for page in [ecs.page, ecs.page + 1] {
        w(BBC_CUR_POS, page);
        w(BBC_EXT_ADDR, ring.start() + page * gbu);
        w(BBC_INT_ADDR, (page & 1) * words);
        w(BBC_DATA_CNT, words);
        w(BBC_COMMAND, stream_endian << 1);
        wait_bit_buffer_idle(device, bank)?;
    }

    w(BBC_CUR_POS, ecs.page + 2);
    w(BBC_CTRL, stream_endian << 1 | 1);
    w(GBU_WPTR, ecs.word);
    w(GBU_BBSR, 0);
    w(GBU_BBER, words * 2 - 1);

    let second_half = if ecs.page & 1 == 1 { 0 } else { words };
    w(GBU_BBIR, second_half);
    w(GBU_BBHR, second_half);
    w(GBU_CTRL, 4);
    w(GBU_FF_RPTR, ecs.bit);
    Ok(())
}

fn wait_bit_buffer_idle(device: &DeviceContext, bank: usize) -> Result<()> {
    let deadline = Instant::now() + device.enabled_features().lock_timeout;
    while device.read_register(bank, BBC_BUSY) != 0 {
        if Instant::now() >= deadline {
            return err_exit_code(
                ErrorCode::HardwareTimeout,
                format!("bit buffer of bank {0} stayed busy", bank),
            );
        }
        std::thread::yield_now();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enabled_features::EnabledFeatures;
    use crate::structs::device::DeviceRegistry;
    use crate::structs::emulated_device::{Completion, EmulatedDevice, ScriptedResult};
    use crate::structs::jpeg_header::tests::build_test_frame;
    use rstest::rstest;

    const RING_ADDR: u32 = 0x2000_0000;
    const RING_SIZE: usize = 0x8000;
    const FRAME_ADDR: u32 = 0x4000_0000;

    fn attach(emulated: &EmulatedDevice) -> Arc<DeviceContext> {
        DeviceRegistry::new(Arc::new(emulated.clone()), EnabledFeatures::default())
            .attach(0)
            .unwrap()
    }

    fn params() -> DecoderOpenParams {
        DecoderOpenParams {
            stream_buffer_addr: RING_ADDR,
            stream_buffer_size: RING_SIZE as u32,
            ..Default::default()
        }
    }

    /// copies `data` to the write pointer and reports it
    fn feed(session: &mut DecoderSession, ring: &mut [u8], data: &[u8]) {
        let at = session.stream().write_offset() as usize;
        ring[at..at + data.len()].copy_from_slice(data);
        session.feed_bitstream(data.len() as u32).unwrap();
    }

    fn frame_buffer() -> FrameBuffer {
        FrameBuffer {
            dma_fd: 3,
            base_addr: FRAME_ADDR,
            y_offset: 0,
            u_offset: 0x10000,
            v_offset: 0x14000,
            stride_c: 32,
        }
    }

    fn done(consumed_bytes: u32) -> Completion {
        Completion {
            consumed_bytes,
            cycles: 4321,
            ..Completion::done()
        }
    }

    #[test]
    fn decodes_one_frame() {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut ring = vec![0u8; RING_SIZE];
        let frame = build_test_frame(64, 48, FrameFormat::Yuv420, Some(2), 2048);

        let mut decoder = DecoderSession::open(&device, params()).unwrap();
        feed(&mut decoder, &mut ring, &frame);
        decoder.feed_bitstream(0).unwrap();

        let info = decoder.parse_headers(&ring).unwrap();
        assert_eq!((info.picture_width, info.picture_height), (64, 48));
        assert_eq!(info.source_format, FrameFormat::Yuv420);
        assert_eq!((info.aligned_width, info.aligned_height), (64, 48));
        assert_eq!((info.mcu_width, info.mcu_height), (16, 16));
        assert_eq!(info.restart_interval, 2);
        assert_eq!(info.slice_height, 48);
        assert_eq!(info.min_frame_buffer_count, 1);

        decoder
            .register_frame_buffers(&[frame_buffer(), frame_buffer()], 64)
            .unwrap();

        emulated.push_result(ScriptedResult::Complete(
            done(info.ecs_offset + 2048 + 16),
        ));
        decoder.start_frame(&DecodeFrameParams::default()).unwrap();

        assert_eq!(emulated.register(0, PIC_SIZE), 64 << 16 | 48);
        assert_eq!(emulated.register(0, RST_INTVAL), 2);
        assert_eq!(emulated.register(0, DPB_BASE01), FRAME_ADDR + 0x10000);
        assert_eq!(emulated.register(0, DPB_YSTRIDE), 64);
        assert_eq!(emulated.register(0, DPB_CSTRIDE), 32);
        assert_eq!(emulated.register(0, CLP_INFO), 0);
        assert_eq!(emulated.register(0, BBC_BAS_ADDR), RING_ADDR);
        assert!(emulated.is_running(0));

        let out = decoder
            .wait_and_collect(Duration::from_millis(10))
            .unwrap();
        assert!(out.decode_success);
        assert_eq!(out.error_macroblock, None);
        assert_eq!((out.decoded_width, out.decoded_height), (64, 48));
        assert_eq!(out.index_frame_display, 0);
        assert_eq!(out.frame_start_offset, 0);
        assert_eq!(out.consumed_bytes, info.ecs_offset + 2048 + 16);
        assert_eq!(out.next_consume_offset, 2048);
        assert_eq!(out.read_ptr, RING_ADDR + frame.len() as u32);
        assert_eq!(out.frame_cycles, 4321);
        assert_eq!(decoder.frame_index(), 1);
        assert_eq!(decoder.get_output_info(), Some(out));

        // nothing follows
        assert_eq!(
            decoder.parse_headers(&ring).unwrap_err().error_code(),
            ErrorCode::EndOfStream
        );
        assert_eq!(
            decoder
                .start_frame(&DecodeFrameParams::default())
                .unwrap_err()
                .error_code(),
            ErrorCode::EndOfStream
        );
        decoder.close().unwrap();
    }

    #[test]
    fn consecutive_frames_use_buffers_round_robin() {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut ring = vec![0u8; RING_SIZE];
        let a = build_test_frame(64, 64, FrameFormat::Yuv422, None, 1200);
        let b = build_test_frame(64, 64, FrameFormat::Yuv422, None, 1200);

        let mut decoder = DecoderSession::open(&device, params()).unwrap();
        feed(&mut decoder, &mut ring, &a);
        feed(&mut decoder, &mut ring, &b);
        decoder.feed_bitstream(0).unwrap();

        let first = FrameBuffer {
            base_addr: FRAME_ADDR,
            ..frame_buffer()
        };
        let second = FrameBuffer {
            base_addr: FRAME_ADDR + 0x10_0000,
            ..frame_buffer()
        };

        let info = decoder.parse_headers(&ring).unwrap();
        decoder.register_frame_buffers(&[first, second], 64).unwrap();

        emulated.push_result(ScriptedResult::Complete(
            done(info.ecs_offset + 1200 + 16),
        ));
        decoder.start_frame(&DecodeFrameParams::default()).unwrap();
        let out = decoder.wait_and_collect(Duration::from_millis(10)).unwrap();
        assert_eq!(out.index_frame_display, 0);

        decoder.parse_headers(&ring).unwrap();
        assert_eq!(decoder.stream().frame_offset() as usize, a.len());

        decoder.start_frame(&DecodeFrameParams::default()).unwrap();
        assert_eq!(emulated.register(0, DPB_BASE00), FRAME_ADDR + 0x10_0000);
        let out = decoder.wait_and_collect(Duration::from_millis(10)).unwrap();
        assert_eq!(out.index_frame_display, 1);
        assert_eq!(out.frame_start_offset as usize, a.len());
    }

    #[test]
    fn start_needs_buffers_and_headers() {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut decoder = DecoderSession::open(&device, params()).unwrap();

        assert_eq!(
            decoder
                .start_frame(&DecodeFrameParams::default())
                .unwrap_err()
                .error_code(),
            ErrorCode::WrongCallSequence
        );
        assert_eq!(
            decoder
                .register_frame_buffers(&[frame_buffer()], 64)
                .unwrap_err()
                .error_code(),
            ErrorCode::WrongCallSequence
        );
        assert_eq!(
            decoder
                .wait_and_collect(Duration::from_millis(1))
                .unwrap_err()
                .error_code(),
            ErrorCode::WrongCallSequence
        );
    }

    #[rstest]
    #[case(&[], 64, ErrorCode::InsufficientFrameBuffers)]
    #[case(&[FrameBuffer::default()], 60, ErrorCode::InvalidStride)]
    #[case(&[FrameBuffer::default()], 0, ErrorCode::InvalidStride)]
    fn frame_buffer_registration(
        #[case] buffers: &[FrameBuffer],
        #[case] stride: u32,
        #[case] expected: ErrorCode,
    ) {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut ring = vec![0u8; RING_SIZE];
        let mut decoder = DecoderSession::open(&device, params()).unwrap();
        feed(
            &mut decoder,
            &mut ring,
            &build_test_frame(32, 32, FrameFormat::Yuv444, None, 1500),
        );
        decoder.parse_headers(&ring).unwrap();

        assert_eq!(
            decoder
                .register_frame_buffers(buffers, stride)
                .unwrap_err()
                .error_code(),
            expected
        );
    }

    #[test]
    fn starved_stream_reports_bit_empty() {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut ring = vec![0u8; RING_SIZE];
        let frame = build_test_frame(64, 64, FrameFormat::Yuv420, None, 2048);

        let mut decoder = DecoderSession::open(&device, params()).unwrap();

        // headers and a little more than one page of entropy coded data
        let sos = frame.windows(2).position(|w| w == [0xFF, 0xDA]).unwrap();
        let split = sos + 14 + 300;
        feed(&mut decoder, &mut ring, &frame[..split]);

        decoder.parse_headers(&ring).unwrap();
        decoder.register_frame_buffers(&[frame_buffer()], 64).unwrap();

        let e = decoder
            .start_frame(&DecodeFrameParams::default())
            .unwrap_err();
        assert_eq!(e.error_code(), ErrorCode::BitEmpty);
        assert!(e.error_code().is_recoverable());
        assert!(!emulated.is_running(0));

        feed(&mut decoder, &mut ring, &frame[split..]);
        decoder.start_frame(&DecodeFrameParams::default()).unwrap();

        // a job in flight sees further data at once
        feed(&mut decoder, &mut ring, &[0u8; 64]);
        assert_eq!(
            emulated.register(0, BBC_WR_PTR),
            RING_ADDR + frame.len() as u32 + 64
        );
        decoder.feed_bitstream(0).unwrap();
        let control = emulated.register(0, BBC_STRM_CTRL);
        assert_ne!(control & (1 << 31), 0);
        assert_eq!(control & 0xFFFF, (frame.len() as u32 + 64 + 255) / 256);
    }

    #[test]
    fn running_job_waits_for_more_data() {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut ring = vec![0u8; RING_SIZE];
        let frame = build_test_frame(64, 64, FrameFormat::Yuv420, None, 2048);

        let mut decoder = DecoderSession::open(&device, params()).unwrap();
        let split = frame.len() - 512;
        feed(&mut decoder, &mut ring, &frame[..split]);

        let info = decoder.parse_headers(&ring).unwrap();
        decoder.register_frame_buffers(&[frame_buffer()], 64).unwrap();

        emulated.push_result(ScriptedResult::Complete(Completion::bit_empty(
            split as u32,
        )));
        emulated.push_result(ScriptedResult::Complete(done(
            info.ecs_offset + 2048 + 16,
        )));
        decoder.start_frame(&DecodeFrameParams::default()).unwrap();

        let e = decoder
            .wait_and_collect(Duration::from_millis(1))
            .unwrap_err();
        assert_eq!(e.error_code(), ErrorCode::BitEmpty);

        // the job is still on the hardware and still owns the slot
        assert!(emulated.is_running(0));
        assert_eq!(emulated.register(0, PIC_START), 1 << START_PIC);
        assert_eq!(decoder.frame_index(), 0);
        assert_eq!(decoder.get_output_info(), None);
        assert_eq!(
            decoder.close().unwrap_err().error_code(),
            ErrorCode::FrameNotComplete
        );

        feed(&mut decoder, &mut ring, &frame[split..]);
        assert_eq!(
            emulated.register(0, BBC_WR_PTR),
            RING_ADDR + frame.len() as u32
        );
        decoder.feed_bitstream(0).unwrap();

        let out = decoder.wait_and_collect(Duration::from_millis(1)).unwrap();
        assert!(out.decode_success);
        assert_eq!(out.consumed_bytes, info.ecs_offset + 2048 + 16);
        assert_eq!(decoder.frame_index(), 1);
        assert!(!emulated.is_running(0));
        decoder.close().unwrap();
    }

    #[test]
    fn slices_share_the_parsed_headers() {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut ring = vec![0u8; RING_SIZE];
        let frame = build_test_frame(64, 48, FrameFormat::Yuv420, None, 2048);

        let mut decoder = DecoderSession::open(
            &device,
            DecoderOpenParams {
                slice_mode: true,
                ..params()
            },
        )
        .unwrap();
        feed(&mut decoder, &mut ring, &frame);
        decoder.feed_bitstream(0).unwrap();

        let info = decoder.parse_headers(&ring).unwrap();
        decoder
            .register_frame_buffers(&[frame_buffer(), frame_buffer()], 64)
            .unwrap();
        let bank = decoder.id().slot_index();

        emulated.push_result(ScriptedResult::Complete(Completion::slice_done(16)));
        emulated.push_result(ScriptedResult::Complete(done(
            info.ecs_offset + 2048 + 16,
        )));

        decoder.start_frame(&DecodeFrameParams::default()).unwrap();
        assert!(emulated.is_running(bank));
        let out = decoder.wait_and_collect(Duration::from_millis(1)).unwrap();
        assert!(out.decode_success);
        assert_eq!(out.slice_position, 16);
        assert_eq!(out.index_frame_display, 0);
        assert!(!emulated.is_running(bank));

        // the rest of the picture starts without parsing again
        decoder.start_frame(&DecodeFrameParams::default()).unwrap();
        let out = decoder.wait_and_collect(Duration::from_millis(1)).unwrap();
        assert!(out.decode_success);
        assert_eq!(out.slice_position, 0);
        assert_eq!(out.index_frame_display, 1);
        assert_eq!(decoder.frame_index(), 2);

        assert_eq!(
            decoder
                .start_frame(&DecodeFrameParams::default())
                .unwrap_err()
                .error_code(),
            ErrorCode::EndOfStream
        );
        decoder.close().unwrap();
    }

    #[test]
    fn plane_offsets_must_fit_the_address_space() {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut ring = vec![0u8; RING_SIZE];
        let mut decoder = DecoderSession::open(&device, params()).unwrap();
        feed(
            &mut decoder,
            &mut ring,
            &build_test_frame(32, 32, FrameFormat::Yuv444, None, 1500),
        );
        decoder.feed_bitstream(0).unwrap();
        decoder.parse_headers(&ring).unwrap();
        decoder
            .register_frame_buffers(
                &[FrameBuffer {
                    base_addr: 0xFFFF_F000,
                    ..frame_buffer()
                }],
                32,
            )
            .unwrap();

        assert_eq!(
            decoder
                .start_frame(&DecodeFrameParams::default())
                .unwrap_err()
                .error_code(),
            ErrorCode::InvalidParameter
        );
        assert!(!emulated.is_running(0));
        decoder.close().unwrap();
    }

    #[test]
    fn second_start_is_frame_not_complete() {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut ring = vec![0u8; RING_SIZE];
        let mut decoder = DecoderSession::open(&device, params()).unwrap();
        feed(
            &mut decoder,
            &mut ring,
            &build_test_frame(32, 32, FrameFormat::Yuv444, None, 1500),
        );
        decoder.parse_headers(&ring).unwrap();
        decoder.register_frame_buffers(&[frame_buffer()], 32).unwrap();
        decoder.start_frame(&DecodeFrameParams::default()).unwrap();

        assert_eq!(
            decoder
                .start_frame(&DecodeFrameParams::default())
                .unwrap_err()
                .error_code(),
            ErrorCode::FrameNotComplete
        );
        assert_eq!(
            decoder.set_rd_ptr(RING_ADDR, true).unwrap_err().error_code(),
            ErrorCode::FrameNotComplete
        );
        assert_eq!(
            decoder.close().unwrap_err().error_code(),
            ErrorCode::FrameNotComplete
        );

        // the pending job reports the hardware read pointer
        emulated.set_register(0, BBC_RD_PTR, RING_ADDR + 0x400);
        assert_eq!(decoder.get_feed_room().unwrap().read_ptr, RING_ADDR + 0x400);

        decoder.wait_and_collect(Duration::from_millis(1)).unwrap();
        decoder.close().unwrap();
    }

    #[test]
    fn error_status_reports_macroblock() {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut ring = vec![0u8; RING_SIZE];
        let mut decoder = DecoderSession::open(&device, params()).unwrap();
        feed(
            &mut decoder,
            &mut ring,
            &build_test_frame(32, 32, FrameFormat::Yuv444, None, 1500),
        );
        decoder.parse_headers(&ring).unwrap();
        decoder.register_frame_buffers(&[frame_buffer()], 32).unwrap();

        emulated.push_result(ScriptedResult::Complete(
            Completion::error(0x0300_2001),
        ));
        decoder.start_frame(&DecodeFrameParams::default()).unwrap();
        let out = decoder.wait_and_collect(Duration::from_millis(1)).unwrap();

        assert!(!out.decode_success);
        assert_eq!(
            out.error_macroblock,
            Some(ErrorMacroblock {
                restart_index: 3,
                x: 2,
                y: 1
            })
        );
    }

    #[rstest]
    #[case::interleaved_packed(DecoderOpenParams { chroma_interleave: 1, packed_format: 1, ..params() })]
    #[case::bad_interleave(DecoderOpenParams { chroma_interleave: 3, ..params() })]
    #[case::bad_rotation(DecoderOpenParams { rotation_degrees: 45, ..params() })]
    #[case::bad_mirror(DecoderOpenParams { mirror: 4, ..params() })]
    #[case::bad_packing(DecoderOpenParams { packed_format: 6, ..params() })]
    #[case::gray_output(DecoderOpenParams { output_format: Some(FrameFormat::Yuv400), ..params() })]
    #[case::yuv440_output(DecoderOpenParams { output_format: Some(FrameFormat::Yuv440), ..params() })]
    #[case::empty_ring(DecoderOpenParams { stream_buffer_size: 0, ..params() })]
    fn invalid_open_parameters(#[case] p: DecoderOpenParams) {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        assert_eq!(
            DecoderSession::open(&device, p).err().unwrap().error_code(),
            ErrorCode::InvalidParameter
        );
        assert_eq!(device.sessions_in_use().unwrap(), 0);
    }

    #[test]
    fn packed_444_needs_444_stream() {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut ring = vec![0u8; RING_SIZE];
        let mut decoder = DecoderSession::open(
            &device,
            DecoderOpenParams {
                packed_format: 5,
                ..params()
            },
        )
        .unwrap();
        feed(
            &mut decoder,
            &mut ring,
            &build_test_frame(32, 32, FrameFormat::Yuv420, None, 1500),
        );
        assert_eq!(
            decoder.parse_headers(&ring).unwrap_err().error_code(),
            ErrorCode::InvalidParameter
        );
    }

    #[test]
    fn scaling_needs_large_pictures() {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut ring = vec![0u8; RING_SIZE];
        let mut decoder = DecoderSession::open(&device, params()).unwrap();

        feed(
            &mut decoder,
            &mut ring,
            &build_test_frame(256, 128, FrameFormat::Yuv420, None, 1500),
        );
        decoder.parse_headers(&ring).unwrap();
        decoder
            .give_command(DecoderCommand::SetScale {
                horizontal: 1,
                vertical: 2,
            })
            .unwrap();
        decoder.register_frame_buffers(&[frame_buffer()], 256).unwrap();
        decoder.start_frame(&DecodeFrameParams::default()).unwrap();
        assert_eq!(emulated.register(0, SCL_INFO), 0x10 | 1 << 2 | 2);

        let out = decoder.wait_and_collect(Duration::from_millis(1)).unwrap();
        assert_eq!((out.decoded_width, out.decoded_height), (128, 32));

        let mut small = DecoderSession::open(&device, params()).unwrap();
        let mut small_ring = vec![0u8; RING_SIZE];
        feed(
            &mut small,
            &mut small_ring,
            &build_test_frame(256, 64, FrameFormat::Yuv420, None, 1500),
        );
        small.parse_headers(&small_ring).unwrap();
        assert_eq!(
            small
                .give_command(DecoderCommand::SetScale {
                    horizontal: 1,
                    vertical: 0
                })
                .unwrap_err()
                .error_code(),
            ErrorCode::InvalidParameter
        );
        small
            .give_command(DecoderCommand::SetScale {
                horizontal: 0,
                vertical: 0,
            })
            .unwrap();
    }

    fn geometry_420() -> McuGeometry {
        McuGeometry::for_decoder(FrameFormat::Yuv420, 64, 48, None)
    }

    #[rstest]
    #[case::inner(RoiRect { x: 16, y: 16, width: 32, height: 16 }, (2, 1, 1, 1, 32, 16, 16, 16))]
    #[case::partial_mcus(RoiRect { x: 20, y: 0, width: 40, height: 40 }, (2, 2, 1, 0, 32, 32, 16, 0))]
    #[case::whole(RoiRect { x: 0, y: 0, width: 64, height: 48 }, (4, 3, 0, 0, 64, 48, 0, 0))]
    fn roi_placement(
        #[case] rect: RoiRect,
        #[case] expected: (u32, u32, u32, u32, u32, u32, u32, u32),
    ) {
        let p = resolve_roi(FrameFormat::Yuv420, &geometry_420(), &rect).unwrap();
        assert_eq!(
            (
                p.mcu_columns,
                p.mcu_rows,
                p.mcu_offset_x,
                p.mcu_offset_y,
                p.frame_width,
                p.frame_height,
                p.frame_offset_x,
                p.frame_offset_y
            ),
            expected
        );
    }

    #[rstest]
    #[case::past_right(RoiRect { x: 48, y: 0, width: 32, height: 16 })]
    #[case::past_bottom(RoiRect { x: 0, y: 40, width: 16, height: 16 })]
    #[case::origin_outside(RoiRect { x: 80, y: 0, width: 0, height: 16 })]
    #[case::inside_first_mcu(RoiRect { x: 0, y: 0, width: 8, height: 16 })]
    #[case::too_short(RoiRect { x: 0, y: 0, width: 16, height: 8 })]
    #[case::no_whole_mcu(RoiRect { x: 16, y: 0, width: 8, height: 16 })]
    fn roi_rejected(#[case] rect: RoiRect) {
        assert_eq!(
            resolve_roi(FrameFormat::Yuv420, &geometry_420(), &rect)
                .unwrap_err()
                .error_code(),
            ErrorCode::InvalidParameter
        );
    }

    #[rstest]
    #[case::aligned_offset(32, 32, 4)]
    #[case::unaligned_offset(8, 8, 1)]
    fn grayscale_roi_block_count(
        #[case] roi_x: u32,
        #[case] expected_mcu_width: u32,
        #[case] expected_blocks: u32,
    ) {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut ring = vec![0u8; RING_SIZE];
        let mut decoder = DecoderSession::open(&device, params()).unwrap();
        decoder
            .give_command(DecoderCommand::SetRoi(RoiRect {
                x: roi_x,
                y: 8,
                width: 24,
                height: 16,
            }))
            .unwrap();
        decoder.give_command(DecoderCommand::EnableRoi).unwrap();

        feed(
            &mut decoder,
            &mut ring,
            &build_test_frame(128, 64, FrameFormat::Yuv400, None, 1500),
        );
        let info = decoder.parse_headers(&ring).unwrap();
        assert_eq!(info.mcu_width, expected_mcu_width);

        let roi = info.roi.unwrap();
        assert_eq!(roi.mcu_columns, 3);
        assert_eq!(roi.frame_width, 24);
        assert_eq!(roi.frame_height, 16);

        decoder.register_frame_buffers(&[frame_buffer()], 128).unwrap();
        decoder.start_frame(&DecodeFrameParams::default()).unwrap();
        assert_eq!(emulated.register(0, CLP_INFO), 1);
        assert_eq!(emulated.register(0, CLP_BASE), roi_x << 16 | 8);
        assert_eq!(emulated.register(0, CLP_SIZE), 24 << 16 | 16);
        assert_eq!((emulated.register(0, MCU_INFO) >> 16) & 0xF, expected_blocks);

        let out = decoder.wait_and_collect(Duration::from_millis(1)).unwrap();
        assert_eq!((out.decoded_width, out.decoded_height), (24, 16));
    }

    #[test]
    fn roi_that_does_not_fit_is_not_enabled() {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut ring = vec![0u8; RING_SIZE];
        let mut decoder = DecoderSession::open(&device, params()).unwrap();
        feed(
            &mut decoder,
            &mut ring,
            &build_test_frame(32, 32, FrameFormat::Yuv444, None, 1500),
        );
        decoder.parse_headers(&ring).unwrap();

        decoder
            .give_command(DecoderCommand::SetRoi(RoiRect {
                x: 0,
                y: 0,
                width: 64,
                height: 64,
            }))
            .unwrap();
        assert_eq!(
            decoder
                .give_command(DecoderCommand::EnableRoi)
                .unwrap_err()
                .error_code(),
            ErrorCode::InvalidParameter
        );
        assert!(decoder.parse_headers(&ring).unwrap().roi.is_none());
    }

    #[test]
    fn empty_frames_are_skipped() {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut ring = vec![0u8; RING_SIZE];
        let mut decoder = DecoderSession::open(&device, params()).unwrap();

        feed(&mut decoder, &mut ring, &[0xFF, 0xD8, 0xFF, 0xD9]);
        feed(
            &mut decoder,
            &mut ring,
            &build_test_frame(32, 32, FrameFormat::Yuv444, None, 1500),
        );
        decoder.parse_headers(&ring).unwrap();
        assert_eq!(decoder.stream().frame_offset(), 4);
    }

    #[test]
    fn wrapped_frame_moves_to_the_front() {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut ring = vec![0u8; RING_SIZE];
        let mut decoder = DecoderSession::open(&device, params()).unwrap();

        let at = RING_SIZE - 200;
        feed(&mut decoder, &mut ring, &vec![0x55; at]);
        decoder.set_rd_ptr(RING_ADDR + at as u32, false).unwrap();

        let frame = build_test_frame(64, 48, FrameFormat::Yuv420, None, 1500);
        feed(&mut decoder, &mut ring, &frame[..200]);
        feed(&mut decoder, &mut ring, &frame[200..]);

        assert_eq!(
            decoder.parse_headers(&ring).unwrap_err().error_code(),
            ErrorCode::BitstreamWrap
        );

        decoder.relocate_wrapped_frame(&mut ring).unwrap();
        assert_eq!(decoder.stream().frame_offset(), 56);
        assert_eq!(&ring[56..58], &[0xFF, 0xD8]);

        let info = decoder.parse_headers(&ring).unwrap();
        assert_eq!((info.picture_width, info.picture_height), (64, 48));
    }

    #[test]
    fn read_pointer_moves_restart_the_search() {
        let emulated = EmulatedDevice::new();
        let device = attach(&emulated);
        let mut ring = vec![0u8; RING_SIZE];
        let mut decoder = DecoderSession::open(&device, params()).unwrap();

        let frame = build_test_frame(32, 32, FrameFormat::Yuv444, None, 1500);
        feed(&mut decoder, &mut ring, &[0x55; 0x100]);
        feed(&mut decoder, &mut ring, &frame);
        decoder.parse_headers(&ring).unwrap();
        assert_eq!(decoder.stream().frame_offset(), 0x100);

        decoder.set_rd_ptr(RING_ADDR + 0x100, false).unwrap();
        assert_eq!(emulated.register(0, BBC_RD_PTR), RING_ADDR + 0x100);
        decoder.parse_headers(&ring).unwrap();
        assert_eq!(decoder.stream().frame_offset(), 0x100);

        // the ring now starts at the frame
        decoder.set_rd_ptr_ex(RING_ADDR + 0x100, false).unwrap();
        assert_eq!(decoder.stream().start(), RING_ADDR + 0x100);
        assert_eq!(decoder.stream().frame_offset(), 0);
        let room = decoder.get_feed_room().unwrap();
        assert_eq!(room.read_ptr, RING_ADDR + 0x100);
    }
}
