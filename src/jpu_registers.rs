/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Register offsets of one instance register bank. Offsets are relative to the
//! bank, the transport adds the bank base when it performs the access.

pub const PIC_START: u32 = 0x000;
pub const PIC_STATUS: u32 = 0x004;
pub const PIC_ERRMB: u32 = 0x008;
pub const PIC_SETMB: u32 = 0x00C;
pub const PIC_CTRL: u32 = 0x010;
pub const PIC_SIZE: u32 = 0x014;
pub const MCU_INFO: u32 = 0x018;
pub const ROT_INFO: u32 = 0x01C;
pub const SCL_INFO: u32 = 0x020;
pub const IF_INFO: u32 = 0x024;
pub const CLP_INFO: u32 = 0x028;
pub const OP_INFO: u32 = 0x02C;
pub const DPB_CONFIG: u32 = 0x030;
pub const DPB_BASE00: u32 = 0x034;
pub const DPB_BASE01: u32 = 0x038;
pub const DPB_BASE02: u32 = 0x03C;
pub const DPB_YSTRIDE: u32 = 0x064;
pub const DPB_CSTRIDE: u32 = 0x068;
pub const CLP_BASE: u32 = 0x070;
pub const CLP_SIZE: u32 = 0x074;
pub const HUFF_CTRL: u32 = 0x080;
pub const HUFF_ADDR: u32 = 0x084;
pub const HUFF_DATA: u32 = 0x088;
pub const QMAT_CTRL: u32 = 0x090;
pub const QMAT_ADDR: u32 = 0x094;
pub const QMAT_DATA: u32 = 0x098;
pub const RST_INTVAL: u32 = 0x0B0;
pub const RST_INDEX: u32 = 0x0B4;
pub const RST_COUNT: u32 = 0x0B8;
pub const INTR_MASK: u32 = 0x0C0;
pub const CYCLE_INFO: u32 = 0x0C8;
pub const SLICE_INFO: u32 = 0x0D4;
pub const SLICE_DPB_POS: u32 = 0x0D8;
pub const SLICE_POS: u32 = 0x0DC;
pub const DPCM_DIFF_Y: u32 = 0x0F0;
pub const DPCM_DIFF_CB: u32 = 0x0F4;
pub const DPCM_DIFF_CR: u32 = 0x0F8;
pub const GBU_CTRL: u32 = 0x100;
pub const GBU_BPTR: u32 = 0x110;
pub const GBU_WPTR: u32 = 0x114;
pub const GBU_TCNT: u32 = 0x118;
pub const GBU_BBSR: u32 = 0x140;
pub const GBU_BBER: u32 = 0x144;
pub const GBU_BBIR: u32 = 0x148;
pub const GBU_BBHR: u32 = 0x14C;
pub const GBU_FF_RPTR: u32 = 0x160;
pub const BBC_END_ADDR: u32 = 0x208;
pub const BBC_WR_PTR: u32 = 0x20C;
pub const BBC_RD_PTR: u32 = 0x210;
pub const BBC_EXT_ADDR: u32 = 0x214;
pub const BBC_INT_ADDR: u32 = 0x218;
pub const BBC_DATA_CNT: u32 = 0x21C;
pub const BBC_COMMAND: u32 = 0x220;
pub const BBC_BUSY: u32 = 0x224;
pub const BBC_CTRL: u32 = 0x228;
pub const BBC_CUR_POS: u32 = 0x22C;
pub const BBC_BAS_ADDR: u32 = 0x230;
pub const BBC_STRM_CTRL: u32 = 0x234;

// global registers, always accessed through bank 0
pub const INST_CTRL_START: u32 = 0x300;
pub const INST_CTRL_STATUS: u32 = 0x304;
pub const SW_RESET: u32 = 0x308;
pub const VERSION_INFO: u32 = 0x30C;

/// PIC_CTRL bit that selects encoding
pub const PIC_CTRL_ENCODE: u32 = 1 << 4;

/// interrupt / status bit positions of PIC_STATUS
pub const INT_DONE: u32 = 0;
pub const INT_ERROR: u32 = 1;
pub const INT_BIT_BUF_EMPTY: u32 = 2;
pub const INT_BIT_BUF_FULL: u32 = 2;
pub const INT_SLICE_DONE: u32 = 3;

/// status bits that end a job, a job raising only others keeps running
pub const JOB_END_STATUS: u32 = 1 << INT_DONE | 1 << INT_ERROR | 1 << INT_SLICE_DONE;

/// PIC_START command bits
pub const START_PIC: u32 = 0;
pub const START_INIT: u32 = 1;

/// Registers logged when a frame job times out, in dump order
pub const DUMP_REGISTERS: [(&str, u32); 44] = [
    ("INTR_MASK", INTR_MASK),
    ("SLICE_INFO", SLICE_INFO),
    ("SLICE_DPB_POS", SLICE_DPB_POS),
    ("SLICE_POS", SLICE_POS),
    ("PIC_SETMB", PIC_SETMB),
    ("CLP_INFO", CLP_INFO),
    ("BBC_BAS_ADDR", BBC_BAS_ADDR),
    ("BBC_END_ADDR", BBC_END_ADDR),
    ("BBC_WR_PTR", BBC_WR_PTR),
    ("BBC_RD_PTR", BBC_RD_PTR),
    ("BBC_CUR_POS", BBC_CUR_POS),
    ("BBC_DATA_CNT", BBC_DATA_CNT),
    ("BBC_EXT_ADDR", BBC_EXT_ADDR),
    ("BBC_INT_ADDR", BBC_INT_ADDR),
    ("GBU_BPTR", GBU_BPTR),
    ("GBU_WPTR", GBU_WPTR),
    ("GBU_TCNT", GBU_TCNT),
    ("GBU_BBSR", GBU_BBSR),
    ("GBU_CTRL", GBU_CTRL),
    ("GBU_BBER", GBU_BBER),
    ("GBU_BBIR", GBU_BBIR),
    ("GBU_BBHR", GBU_BBHR),
    ("PIC_CTRL", PIC_CTRL),
    ("SCL_INFO", SCL_INFO),
    ("DPB_CONFIG", DPB_CONFIG),
    ("RST_INTVAL", RST_INTVAL),
    ("RST_INDEX", RST_INDEX),
    ("BBC_STRM_CTRL", BBC_STRM_CTRL),
    ("BBC_CTRL", BBC_CTRL),
    ("OP_INFO", OP_INFO),
    ("PIC_SIZE", PIC_SIZE),
    ("ROT_INFO", ROT_INFO),
    ("MCU_INFO", MCU_INFO),
    ("DPB_BASE00", DPB_BASE00),
    ("DPB_BASE01", DPB_BASE01),
    ("DPB_BASE02", DPB_BASE02),
    ("DPB_YSTRIDE", DPB_YSTRIDE),
    ("DPB_CSTRIDE", DPB_CSTRIDE),
    ("CLP_BASE", CLP_BASE),
    ("CLP_SIZE", CLP_SIZE),
    ("PIC_START", PIC_START),
    ("CYCLE_INFO", CYCLE_INFO),
    ("PIC_STATUS", PIC_STATUS),
    ("PIC_ERRMB", PIC_ERRMB),
];
