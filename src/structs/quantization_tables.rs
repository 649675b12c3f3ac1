/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use crate::consts::*;
use crate::jpu_error::{err_exit_code, ErrorCode, Result};
use crate::jpu_registers::{QMAT_CTRL, QMAT_DATA};
use crate::structs::register_words::RegisterWrite;

/// Element precision as declared by the Pq nibble of a DQT table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantPrecision {
    #[default]
    Bits8 = 0,
    Bits16 = 1,
}

impl QuantPrecision {
    pub fn from_pq(pq: u8) -> Self {
        if pq == 0 {
            QuantPrecision::Bits8
        } else {
            QuantPrecision::Bits16
        }
    }

    pub fn max_element(self) -> u32 {
        match self {
            QuantPrecision::Bits8 => 255,
            QuantPrecision::Bits16 => 32767,
        }
    }
}

/// 64 quantizers in natural (row major) order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizationTable {
    precision: QuantPrecision,
    values: [u16; 64],
}

/// quantizer control words select the bank of one component
const Q_COMPONENT: [u32; 3] = [0x00, 0x40, 0x80];

impl QuantizationTable {
    pub fn new(precision: QuantPrecision, values: [u16; 64]) -> Self {
        QuantizationTable { precision, values }
    }

    /// builds a table from values in the order they appear in a DQT segment
    pub fn from_zigzag(precision: QuantPrecision, zigzag: &[u16; 64]) -> Self {
        let mut values = [0u16; 64];
        for (zz, &v) in zigzag.iter().enumerate() {
            values[usize::from(ZIGZAG_TO_RASTER[zz])] = v;
        }
        QuantizationTable { precision, values }
    }

    pub fn precision(&self) -> QuantPrecision {
        self.precision
    }

    pub fn values(&self) -> &[u16; 64] {
        &self.values
    }

    /// values in DQT transmission order
    pub fn to_zigzag(&self) -> [u16; 64] {
        let mut zigzag = [0u16; 64];
        for (raster, &v) in self.values.iter().enumerate() {
            zigzag[usize::from(RASTER_TO_ZIGZAG[raster])] = v;
        }
        zigzag
    }

    pub fn std_luminance() -> Self {
        Self::new(QuantPrecision::Bits8, STD_LUMINANCE_QUANT_TABLE)
    }

    pub fn std_chrominance() -> Self {
        Self::new(QuantPrecision::Bits8, STD_CHROMINANCE_QUANT_TABLE)
    }

    /// Linear quality scaling of a base table. Quality 50 keeps the base
    /// table, lower qualities scale up by 50/q, higher ones down towards zero.
    pub fn scaled(&self, quality: u32, twelve_bit: bool) -> QuantizationTable {
        let quality = quality.clamp(1, 100);
        let scale = if quality < 50 {
            5000 / quality
        } else {
            200 - quality * 2
        };

        let min_element = if twelve_bit {
            MIN_Q16_ELEMENT
        } else {
            MIN_Q8_ELEMENT
        };
        let max_element = self.precision.max_element();

        let mut values = [0u16; 64];
        for (dst, &base) in values.iter_mut().zip(self.values.iter()) {
            let v = (u32::from(base) * scale + 50) / 100;
            *dst = v.clamp(min_element, max_element) as u16;
        }

        QuantizationTable {
            precision: self.precision,
            values,
        }
    }

    /// Rejects tables the hardware cannot use
    pub fn validate(&self, twelve_bit: bool) -> Result<()> {
        if self.values.iter().any(|&v| v == 0) {
            return err_exit_code(ErrorCode::InvalidParameter, "zero quantizer in table");
        }

        if twelve_bit && u32::from(self.values[0]) < MIN_Q16_ELEMENT {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!(
                    "DC quantizer {0} below {1} for a 12-bit picture",
                    self.values[0], MIN_Q16_ELEMENT
                ),
            );
        }

        if self.precision == QuantPrecision::Bits8 && self.values.iter().any(|&v| v > 255) {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                "8-bit quantization table has elements above 255",
            );
        }

        Ok(())
    }

    /// Encoder quantizer words: the divisor together with a fixed point reciprocal.
    /// Tables of 16-bit precision take two words per element.
    pub fn encoder_words(&self, sixteen_bit: bool) -> Vec<u32> {
        let mut words = Vec::with_capacity(if sixteen_bit { 128 } else { 64 });
        for &divisor in self.values.iter() {
            let divisor = u64::from(divisor.max(1));
            if sixteen_bit {
                words.push((divisor & 0xFFFF) as u32);
                words.push(((0x8000_0000u64 / divisor) & 0xFFFF_FFFF) as u32);
            } else {
                let quotient = (0x80000u64 / divisor) & 0xF_FFFF;
                words.push(((divisor << 20) as u32) | quotient as u32);
            }
        }
        words
    }
}

/// The four table slots of a session
pub type QuantizationTableSet = [Option<QuantizationTable>; 4];

/// Register program that loads the decoder's quantizer banks, one bank per
/// component. The decoder expects the tables in transmission order.
pub fn decoder_quant_program(
    tables: &QuantizationTableSet,
    component_tables: [u8; 3],
) -> Result<Vec<RegisterWrite>> {
    let mut program = Vec::with_capacity(3 * 66);

    for (c, &q) in component_tables.iter().enumerate() {
        let table = match tables.get(usize::from(q)) {
            Some(Some(t)) => t,
            Some(None) => {
                return err_exit_code(
                    ErrorCode::MalformedHeader,
                    format!("component {0} uses undefined quantization table {1}", c, q),
                )
            }
            None => {
                return err_exit_code(
                    ErrorCode::MalformedHeader,
                    format!("component {0} selects quantization table {1}", c, q),
                )
            }
        };

        program.push(RegisterWrite::new(QMAT_CTRL, 0x03 | Q_COMPONENT[c]));
        for v in table.to_zigzag() {
            program.push(RegisterWrite::new(QMAT_DATA, u32::from(v)));
        }
        program.push(RegisterWrite::new(QMAT_CTRL, 0x00));
    }

    Ok(program)
}

/// Register program that loads the encoder's quantizer banks. For 12-bit
/// pictures the luma bank follows the precision of table 0 and the chroma
/// banks the precision of table 1.
pub fn encoder_quant_program(
    tables: &QuantizationTableSet,
    component_tables: [u8; 3],
    twelve_bit: bool,
) -> Result<Vec<RegisterWrite>> {
    let precision_of = |i: usize| {
        tables[i]
            .as_ref()
            .map(|t| t.precision() == QuantPrecision::Bits16)
            .unwrap_or(false)
    };

    let mut program = Vec::new();
    for (c, &q) in component_tables.iter().enumerate() {
        let table = match tables.get(usize::from(q)).and_then(|t| t.as_ref()) {
            Some(t) => t,
            None => {
                return err_exit_code(
                    ErrorCode::InvalidParameter,
                    format!("component {0} selects quantization table {1}", c, q),
                )
            }
        };

        let sixteen_bit = twelve_bit && precision_of(if c == 0 { 0 } else { 1 });

        program.push(RegisterWrite::new(QMAT_CTRL, 0x3 + Q_COMPONENT[c]));
        for w in table.encoder_words(sixteen_bit) {
            program.push(RegisterWrite::new(QMAT_DATA, w));
        }
        program.push(RegisterWrite::new(QMAT_CTRL, Q_COMPONENT[c]));
    }

    Ok(program)
}
