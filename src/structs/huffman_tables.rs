/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use crate::consts::*;
use crate::helpers::sign_fill;
use crate::jpu_error::{err_exit_code, ErrorCode, Result};
use crate::jpu_registers::{HUFF_ADDR, HUFF_CTRL, HUFF_DATA};
use crate::structs::register_words::RegisterWrite;

/// min/max value of a code length that has no codes
pub const NO_CODE: u32 = 0xFFFF;

/// pointer word uploaded for a code length that has no codes
pub const NO_CODE_PTR: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableClass {
    Dc = 0,
    Ac = 1,
}

impl TableClass {
    /// number of symbols the class can encode
    pub fn max_symbol(self) -> usize {
        match self {
            TableClass::Dc => 16,
            TableClass::Ac => 256,
        }
    }
}

/// Slot of a table in the 8 entry table set: `(id << 1) | class`
#[inline(always)]
pub const fn table_slot(id: u8, class: TableClass) -> usize {
    ((id as usize & 3) << 1) | class as usize
}

#[inline(always)]
pub const fn slot_class(slot: usize) -> TableClass {
    if slot & 1 == 1 {
        TableClass::Ac
    } else {
        TableClass::Dc
    }
}

/// A huffman table as carried in a DHT segment: the number of codes of each
/// length 1..16 followed by the symbols in canonical order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HuffmanTable {
    bits: [u8; 16],
    values: Vec<u8>,
}

/// Canonical decode form: first and last code and value offset for each length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeTable {
    pub min: [u32; 16],
    pub max: [u32; 16],
    /// first value index of each length, `None` where the length has no codes
    pub ptr: [Option<u8>; 16],
}

/// Encode form: code and code length for every symbol, zero length if unused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeTable {
    pub code: [u16; 256],
    pub size: [u8; 256],
}

impl HuffmanTable {
    pub fn new(bits: [u8; 16], values: &[u8]) -> Result<Self> {
        let count: usize = bits.iter().map(|&b| usize::from(b)).sum();
        if count > 256 {
            return err_exit_code(
                ErrorCode::InvalidHuffmanTable,
                format!("huffman table defines {0} codes", count),
            );
        }

        if values.len() != count {
            return err_exit_code(
                ErrorCode::InvalidHuffmanTable,
                format!(
                    "huffman table has {0} codes but {1} values",
                    count,
                    values.len()
                ),
            );
        }

        Ok(HuffmanTable {
            bits,
            values: values.to_vec(),
        })
    }

    pub fn bits(&self) -> &[u8; 16] {
        &self.bits
    }

    pub fn values(&self) -> &[u8] {
        &self.values
    }

    pub fn code_count(&self) -> usize {
        self.values.len()
    }

    /// Derives the min/max/ptr tables the decoder hardware walks, one entry per code length.
    pub fn build_decode_table(&self) -> DecodeTable {
        let mut t = DecodeTable {
            min: [NO_CODE; 16],
            max: [NO_CODE; 16],
            ptr: [None; 16],
        };

        let mut pointer = 0u32;
        let mut code = 0u32;
        let mut seen_code = false;

        for i in 0..16 {
            let count = u32::from(self.bits[i]);
            if count != 0 {
                // 256 codes at most, so a length with codes starts below 256
                t.ptr[i] = Some(pointer as u8);
                t.min[i] = code;
                t.max[i] = code + count - 1;
                pointer += count;
                code = (t.max[i] + 1) << 1;
                seen_code = true;
            } else if seen_code {
                code <<= 1;
            }
        }

        t
    }

    /// Assigns the canonical codes (JPEG Annex C) and maps them onto the symbol alphabet.
    pub fn build_encode_table(&self, class: TableClass) -> Result<EncodeTable> {
        let max_symbol = class.max_symbol();
        let mut sizes = Vec::with_capacity(self.values.len());

        for (i, &count) in self.bits.iter().enumerate() {
            if sizes.len() + usize::from(count) > max_symbol {
                return err_exit_code(
                    ErrorCode::InvalidHuffmanTable,
                    format!("more than {0} codes in a {1:?} table", max_symbol, class),
                );
            }
            sizes.extend(std::iter::repeat((i + 1) as u8).take(usize::from(count)));
        }

        let mut codes = Vec::with_capacity(sizes.len());
        let mut code = 0u32;
        let mut p = 0;
        let mut si = sizes.first().copied().unwrap_or(1);
        while p < sizes.len() {
            while p < sizes.len() && sizes[p] == si {
                codes.push(code);
                code += 1;
                p += 1;
            }

            if code >= (1u32 << si) {
                return err_exit_code(
                    ErrorCode::InvalidHuffmanTable,
                    "invalid huffman code layout, too many codes for a given length",
                );
            }

            code <<= 1;
            si += 1;
        }

        let mut t = EncodeTable {
            code: [0; 256],
            size: [0; 256],
        };

        for (p, &symbol) in self.values.iter().enumerate() {
            let s = usize::from(symbol);
            if s >= max_symbol || t.size[s] != 0 {
                return err_exit_code(
                    ErrorCode::InvalidHuffmanTable,
                    format!("symbol {0:#x} out of range or defined twice", symbol),
                );
            }
            t.code[s] = codes[p] as u16;
            t.size[s] = sizes[p];
        }

        Ok(t)
    }
}

impl DecodeTable {
    /// Decodes one symbol, pulling bits most significant first from `next_bit`.
    pub fn decode_symbol(
        &self,
        values: &[u8],
        mut next_bit: impl FnMut() -> Option<u32>,
    ) -> Option<u8> {
        let mut code = 0u32;
        for len in 0..16 {
            code = (code << 1) | next_bit()?;
            if let Some(first) = self.ptr[len] {
                if code >= self.min[len] && code <= self.max[len] {
                    let index = usize::from(first) + (code - self.min[len]) as usize;
                    return values.get(index).copied();
                }
            }
        }
        None
    }

    /// min or max words as uploaded: 16-bit value with its sign replicated into the upper half
    fn bound_words(bounds: &[u32; 16]) -> impl Iterator<Item = u32> + '_ {
        bounds.iter().map(|&v| {
            let v = v & 0xFFFF;
            (sign_fill(v, 15, 16) << 16) | v
        })
    }
}

/// 8-bit value with its sign replicated into the upper 24 bits
#[inline(always)]
fn byte_word(v: u8) -> u32 {
    let v = u32::from(v);
    (sign_fill(v, 7, 24) << 8) | v
}

/// The DC/AC x luma/chroma tables of a session (doubled for 12-bit pictures),
/// indexed by table slot. Empty slots fall back to the built-in tables.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HuffmanTableSet {
    tables: [Option<HuffmanTable>; HUFFMAN_TABLE_SLOTS],
}

impl HuffmanTableSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in tables for the given bit depth
    pub fn defaults(twelve_bit: bool) -> Self {
        let mut set = HuffmanTableSet::new();
        for slot in 0..Self::active_slots(twelve_bit) {
            set.tables[slot] = default_table(slot, twelve_bit);
        }
        set
    }

    /// 8-bit pictures use DC0/AC0/DC1/AC1, 12-bit ones all eight slots
    pub fn active_slots(twelve_bit: bool) -> usize {
        if twelve_bit {
            HUFFMAN_TABLE_SLOTS
        } else {
            4
        }
    }

    pub fn get(&self, slot: usize) -> Option<&HuffmanTable> {
        self.tables.get(slot).and_then(|t| t.as_ref())
    }

    pub fn set(&mut self, slot: usize, table: HuffmanTable) -> Result<()> {
        if slot >= HUFFMAN_TABLE_SLOTS {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!("huffman table slot {0} out of range", slot),
            );
        }
        self.tables[slot] = Some(table);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(|t| t.is_none())
    }

    /// The table to use for a slot: the one from the stream, else the built-in one
    pub fn resolved(&self, slot: usize, twelve_bit: bool) -> Option<HuffmanTable> {
        self.get(slot)
            .cloned()
            .or_else(|| default_table(slot, twelve_bit))
    }

    /// true if any table defined here differs from the built-in table of its slot,
    /// in which case the tables have to be uploaded to the hardware
    pub fn differs_from_defaults(&self, twelve_bit: bool) -> bool {
        self.tables.iter().enumerate().any(|(slot, t)| match t {
            None => false,
            Some(t) => default_table(slot, twelve_bit).as_ref() != Some(t),
        })
    }

    /// Decode tables for every active slot
    pub fn build_decode_tables(&self, twelve_bit: bool) -> Vec<(DecodeTable, HuffmanTable)> {
        (0..Self::active_slots(twelve_bit))
            .map(|slot| {
                let table = self
                    .resolved(slot, twelve_bit)
                    .unwrap_or_else(|| HuffmanTable {
                        bits: [0; 16],
                        values: Vec::new(),
                    });
                (table.build_decode_table(), table)
            })
            .collect()
    }

    /// Register program that loads the decoder's huffman memory.
    pub fn decoder_program(&self, twelve_bit: bool) -> Result<Vec<RegisterWrite>> {
        let decoded = self.build_decode_tables(twelve_bit);

        // DC luma, DC chroma, AC luma, AC chroma, then the extended DC/AC pair
        let order: &[usize] = if twelve_bit {
            &[0, 2, 1, 3, 4, 5]
        } else {
            &[0, 2, 1, 3]
        };
        let (max_addr, ptr_addr) = if twelve_bit {
            (0x480, 0x900)
        } else {
            (0x440, 0x880)
        };

        let mut program = Vec::new();

        program.push(RegisterWrite::new(HUFF_CTRL, 0x003));
        for &slot in order {
            for w in DecodeTable::bound_words(&decoded[slot].0.min) {
                program.push(RegisterWrite::new(HUFF_DATA, w));
            }
        }

        program.push(RegisterWrite::new(HUFF_CTRL, 0x403));
        program.push(RegisterWrite::new(HUFF_ADDR, max_addr));
        for &slot in order {
            for w in DecodeTable::bound_words(&decoded[slot].0.max) {
                program.push(RegisterWrite::new(HUFF_DATA, w));
            }
        }

        program.push(RegisterWrite::new(HUFF_CTRL, 0x803));
        program.push(RegisterWrite::new(HUFF_ADDR, ptr_addr));
        for &slot in order {
            for &p in decoded[slot].0.ptr.iter() {
                program.push(RegisterWrite::new(
                    HUFF_DATA,
                    byte_word(p.unwrap_or(NO_CODE_PTR)),
                ));
            }
        }

        program.push(RegisterWrite::new(HUFF_CTRL, 0xC03));
        for &slot in order {
            let values = decoded[slot].1.values();
            let capacity = match (slot_class(slot), twelve_bit) {
                (TableClass::Dc, false) => 12,
                (TableClass::Ac, false) => 162,
                (TableClass::Dc, true) => 16,
                (TableClass::Ac, true) => 256,
            };

            if values.len() > capacity {
                return err_exit_code(
                    ErrorCode::InvalidHuffmanTable,
                    format!(
                        "table {0} has {1} symbols, the hardware holds {2}",
                        slot,
                        values.len(),
                        capacity
                    ),
                );
            }

            for &v in values {
                program.push(RegisterWrite::new(HUFF_DATA, byte_word(v)));
            }
            for _ in values.len()..capacity {
                program.push(RegisterWrite::new(HUFF_DATA, 0xFFFF_FFFF));
            }
        }

        program.push(RegisterWrite::new(HUFF_CTRL, 0x000));

        Ok(program)
    }

    /// Register program that loads the encoder's code/size memory.
    pub fn encoder_program(&self, twelve_bit: bool) -> Result<Vec<RegisterWrite>> {
        // AC tables go first; slots 6 and 7 are never loaded
        let order: &[usize] = if twelve_bit {
            &[1, 3, 0, 2, 5, 4]
        } else {
            &[1, 3, 0, 2]
        };

        let mut program = Vec::new();
        program.push(RegisterWrite::new(HUFF_CTRL, 0x3));

        for &slot in order {
            let class = slot_class(slot);
            let table = match self.resolved(slot, twelve_bit) {
                Some(t) => t,
                None => {
                    return err_exit_code(
                        ErrorCode::InvalidHuffmanTable,
                        format!("no huffman table for slot {0}", slot),
                    )
                }
            };
            let enc = table.build_encode_table(class)?;

            for i in 0..class.max_symbol() {
                let word = if enc.size[i] == 0 && enc.code[i] == 0 {
                    0
                } else {
                    (u32::from(enc.size[i]) - 1) << 16 | u32::from(enc.code[i])
                };
                program.push(RegisterWrite::new(HUFF_DATA, word));
            }
        }

        program.push(RegisterWrite::new(HUFF_CTRL, 0x0));
        Ok(program)
    }
}

/// Built-in table of a slot, `None` if the bit depth has no default for it
pub fn default_table(slot: usize, twelve_bit: bool) -> Option<HuffmanTable> {
    let (bits, values): (&[u8; 16], &[u8]) = match (slot, twelve_bit) {
        (0, false) => (&STD_DC_LUMINANCE_BITS, &STD_DC_LUMINANCE_VALUES),
        (1, false) => (&STD_AC_LUMINANCE_BITS, &STD_AC_LUMINANCE_VALUES),
        (2, false) => (&STD_DC_CHROMINANCE_BITS, &STD_DC_CHROMINANCE_VALUES),
        (3, false) => (&STD_AC_CHROMINANCE_BITS, &STD_AC_CHROMINANCE_VALUES),
        (0 | 4, true) => (&EXT_DC_LUMINANCE_BITS, &EXT_DC_LUMINANCE_VALUES),
        (1 | 5, true) => (&EXT_AC_LUMINANCE_BITS, &EXT_AC_LUMINANCE_VALUES),
        (2 | 6, true) => (&EXT_DC_CHROMINANCE_BITS, &EXT_DC_CHROMINANCE_VALUES),
        (3 | 7, true) => (&EXT_AC_CHROMINANCE_BITS, &EXT_AC_CHROMINANCE_VALUES),
        _ => return None,
    };

    Some(HuffmanTable {
        bits: *bits,
        values: values.to_vec(),
    })
}
