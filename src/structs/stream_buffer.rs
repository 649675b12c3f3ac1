/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Pointer arithmetic of the decoder's circular bitstream buffer.
//!
//! The ring spans `[start, end)` in device address space. The caller writes
//! compressed data at the write pointer and reports how much it wrote, the
//! hardware consumes from the read pointer. A write pointer that reaches
//! `end` wraps to `start`, so `wr == start` is ambiguous between "empty" and
//! "filled up to the end"; like the hardware, the ring treats it as the latter
//! whenever data has been fed.

use crate::helpers::{ceil_align, floor_align};
use crate::jpu_error::{err_exit_code, ErrorCode, JpuError, Result};
use crate::structs::register_words::StreamControl;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRing {
    start: u32,
    end: u32,
    rd: u32,
    wr: u32,

    /// offset of the current frame's SOI marker from `start`
    frame_offset: u32,

    /// bytes past `frame_offset` the previous frame occupied, skipped before
    /// searching for the next SOI marker
    consume_byte: i32,

    end_of_stream: bool,
}

impl StreamRing {
    pub fn new(start: u32, size: u32) -> Result<Self> {
        if size == 0 {
            return err_exit_code(ErrorCode::InvalidParameter, "stream buffer size is zero");
        }

        let end = start.checked_add(size).ok_or_else(|| {
            JpuError::new(
                ErrorCode::InvalidParameter,
                format!("stream buffer {0:#x}+{1:#x} overflows", start, size),
            )
        })?;

        Ok(StreamRing {
            start,
            end,
            rd: start,
            wr: start,
            frame_offset: 0,
            consume_byte: 0,
            end_of_stream: false,
        })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn size(&self) -> u32 {
        self.end - self.start
    }

    pub fn read_ptr(&self) -> u32 {
        self.rd
    }

    pub fn write_ptr(&self) -> u32 {
        self.wr
    }

    /// write pointer relative to the ring start
    pub fn write_offset(&self) -> u32 {
        self.wr - self.start
    }

    pub fn frame_offset(&self) -> u32 {
        self.frame_offset
    }

    pub fn consume_byte(&self) -> i32 {
        self.consume_byte
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// true when the write pointer sits at the start, either because nothing
    /// was fed yet or because the last feed filled the ring up to its end
    pub fn write_wrapped_to_start(&self) -> bool {
        self.wr == self.start
    }

    /// Room the caller may fill before overrunning the current frame or the
    /// physical end of the ring, rounded down to `granularity`.
    pub fn feed_room(&self, granularity: u32) -> u32 {
        let room = if self.wr == self.start {
            if self.frame_offset == 0 {
                self.size()
            } else {
                self.frame_offset
            }
        } else {
            self.end - self.wr
        };

        floor_align(granularity, room)
    }

    /// Advances the write pointer by `size` freshly written bytes. A size of
    /// zero announces that no more data will arrive.
    pub fn update(&mut self, size: u32) -> Result<()> {
        if size == 0 {
            self.end_of_stream = true;
            return Ok(());
        }

        let wr = match self.wr.checked_add(size) {
            Some(wr) if wr <= self.end => wr,
            _ => {
                return err_exit_code(
                    ErrorCode::InvalidParameter,
                    format!(
                        "feeding {0} bytes at {1:#x} overruns the stream buffer end {2:#x}",
                        size, self.wr, self.end
                    ),
                );
            }
        };

        self.wr = if wr == self.end { self.start } else { wr };
        Ok(())
    }

    /// Stream control word telling the hardware where the data ends, in
    /// units of `gbu_size` rounded up.
    pub fn end_of_stream_control(&self, gbu_size: u32) -> StreamControl {
        StreamControl {
            end_of_stream: true,
            length_units: ceil_align(gbu_size, self.write_offset()) / gbu_size,
        }
    }

    /// Bytes between the read and the write pointer, following the wrap
    pub fn available_bytes(&self) -> u32 {
        let wr = self.fetch_limit();
        if self.rd > wr {
            (self.end - self.rd) + (wr - self.start)
        } else {
            wr - self.rd
        }
    }

    /// Fails with BitEmpty while the stream is still open and fewer than
    /// `min_bytes` are buffered.
    pub fn check_available(&self, min_bytes: u32) -> Result<()> {
        if self.end_of_stream {
            return Ok(());
        }

        let available = self.available_bytes();
        if available < min_bytes {
            return err_exit_code(
                ErrorCode::BitEmpty,
                format!(
                    "{0} bytes buffered, at least {1} needed to start",
                    available, min_bytes
                ),
            );
        }
        Ok(())
    }

    /// last address the hardware may fetch from, the ring end once the
    /// write pointer wrapped
    pub fn fetch_limit(&self) -> u32 {
        if self.wr == self.start {
            self.end
        } else {
            self.wr
        }
    }

    /// End address handed to the hardware when a frame starts. The fetch
    /// unit reads whole pages so a partial page is rounded up.
    pub fn start_end_address(&self, gbu_size: u32) -> u32 {
        if self.wr == self.start {
            self.end
        } else {
            ceil_align(gbu_size, self.wr)
        }
    }

    fn check_address(&self, addr: u32) -> Result<()> {
        if addr < self.start || addr > self.end {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!(
                    "address {0:#x} outside the stream buffer {1:#x}..{2:#x}",
                    addr, self.start, self.end
                ),
            );
        }
        Ok(())
    }

    /// Repositions the read pointer, the next frame is searched from there
    pub fn set_read_pointer(&mut self, addr: u32, update_write: bool) -> Result<()> {
        self.check_address(addr)?;

        self.rd = addr;
        if update_write {
            self.wr = if addr == self.end { self.start } else { addr };
        }
        self.frame_offset = addr - self.start;
        self.consume_byte = 0;
        Ok(())
    }

    /// Like `set_read_pointer`, but also moves the logical start of the ring
    /// to `addr`.
    pub fn rebase(&mut self, addr: u32, update_write: bool) -> Result<()> {
        self.check_address(addr)?;
        if addr == self.end {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!("cannot rebase the stream buffer onto its end {0:#x}", addr),
            );
        }

        self.rd = addr;
        self.start = addr;
        if update_write || self.wr < addr {
            self.wr = addr;
        }
        self.frame_offset = 0;
        self.consume_byte = 0;
        Ok(())
    }

    /// read pointer as reported by the hardware after a job
    pub fn set_hardware_read_pointer(&mut self, rd: u32) {
        self.rd = rd;
    }

    /// Remembers how far the finished frame reached, `consumed_bytes` counted
    /// by the hardware from the entropy coded segment.
    pub fn record_consumed(&mut self, consumed_bytes: u32, ecs_offset: u32) {
        self.consume_byte = consumed_bytes as i32 - 16 - ecs_offset as i32;
    }

    pub(crate) fn commit_frame_start(&mut self, frame_offset: u32) {
        self.frame_offset = frame_offset;
        self.consume_byte = 0;
    }

    /// next search starts behind the SOI marker of the current frame
    pub(crate) fn skip_current_frame(&mut self) {
        self.consume_byte = 2;
    }

    pub(crate) fn continue_at_front(&mut self, consume_byte: i32) {
        self.frame_offset = 0;
        self.consume_byte = consume_byte;
    }

    /// Adopts the layout produced by `relocate_wrapped_frame`
    pub fn apply_relocation(&mut self, relocated: RelocatedFrame) {
        self.frame_offset = relocated.frame_offset;
        self.consume_byte = 0;
        self.wr = if relocated.write_offset == self.size() {
            self.start
        } else {
            self.start + relocated.write_offset
        };
    }
}

/// Where a relocated frame and the write pointer ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocatedFrame {
    pub frame_offset: u32,
    pub write_offset: u32,
}

/// Moves the tail of a frame that runs into the physical end of the ring to
/// the front, padded at the front to whole `gbu_size` pages so the frame ends
/// on a page boundary, followed by the data already written at the front.
///
/// `ring` is the CPU view of the whole stream buffer.
pub fn relocate_wrapped_frame(
    ring: &mut [u8],
    frame_offset: u32,
    write_offset: u32,
    gbu_size: u32,
) -> Result<RelocatedFrame> {
    let ring_size = ring.len();
    let frame_offset = frame_offset as usize;
    let data_size = write_offset as usize;

    if frame_offset >= ring_size || data_size > frame_offset {
        return err_exit_code(
            ErrorCode::InvalidParameter,
            format!(
                "frame at {0} with write offset {1} has not wrapped in a ring of {2} bytes",
                frame_offset, data_size, ring_size
            ),
        );
    }

    let src_size = ring_size - frame_offset;
    let dst_size = ceil_align(gbu_size, u32::try_from(src_size)?) as usize;

    if dst_size + data_size > frame_offset {
        return err_exit_code(
            ErrorCode::ResourceExhausted,
            format!(
                "no room to move {0} bytes of frame ahead of {1} buffered bytes",
                dst_size, data_size
            ),
        );
    }

    let tail = ring[frame_offset..].to_vec();

    // the front data moves up first, it overlaps its destination
    ring.copy_within(0..data_size, dst_size);

    let pad = dst_size - src_size;
    ring[..pad].fill(0);
    ring[pad..dst_size].copy_from_slice(&tail);

    Ok(RelocatedFrame {
        frame_offset: u32::try_from(pad)?,
        write_offset: u32::try_from(dst_size + data_size)?,
    })
}
