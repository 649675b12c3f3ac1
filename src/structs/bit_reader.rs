/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use crate::jpu_error::{err_exit_code, ErrorCode, Result};

// Sequential big-endian reader over a header window. Marker segments are byte
// aligned, so the cursor only ever moves in whole bytes.
pub struct BitReader<'a> {
    data: &'a [u8],
    size_bits: usize,
    index: usize,
}

impl<'a> BitReader<'a> {
    /// Creates a cursor over the first `size_bits` bits of `data`.
    pub fn new(data: &'a [u8], size_bits: usize) -> Self {
        BitReader {
            data,
            size_bits: size_bits.min(data.len() * 8),
            index: 0,
        }
    }

    #[inline(always)]
    pub fn bits_used(&self) -> usize {
        self.index * 8
    }

    #[inline(always)]
    pub fn bits_remaining(&self) -> usize {
        (self.size_bits / 8 * 8).saturating_sub(self.bits_used())
    }

    /// Returns the next `n` bits (8, 16, 24 or 32) without advancing
    pub fn peek(&self, n: usize) -> Result<u32> {
        if n == 0 || n > 32 || n % 8 != 0 {
            return err_exit_code(
                ErrorCode::InvalidParameter,
                format!("unsupported read width {0}", n),
            );
        }

        if n > self.bits_remaining() {
            return err_exit_code(
                ErrorCode::InsufficientBits,
                format!(
                    "requested {0} bits with {1} remaining",
                    n,
                    self.bits_remaining()
                ),
            );
        }

        let mut v = 0u32;
        for b in &self.data[self.index..self.index + n / 8] {
            v = (v << 8) | u32::from(*b);
        }
        Ok(v)
    }

    /// Returns the next `n` bits and advances past them
    pub fn take(&mut self, n: usize) -> Result<u32> {
        let v = self.peek(n)?;
        self.index += n / 8;
        Ok(v)
    }

    #[inline(always)]
    pub fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(8)? as u8)
    }

    #[inline(always)]
    pub fn take_u16(&mut self) -> Result<u16> {
        Ok(self.take(16)? as u16)
    }

    /// Skips `count` bytes, failing without moving if fewer remain
    pub fn skip_bytes(&mut self, count: usize) -> Result<()> {
        if count * 8 > self.bits_remaining() {
            return err_exit_code(
                ErrorCode::InsufficientBits,
                format!("cannot skip {0} bytes", count),
            );
        }
        self.index += count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian_words() {
        let data = [0xFF, 0xD8, 0x12, 0x34, 0x56, 0x78, 0x9A];
        let mut r = BitReader::new(&data, data.len() * 8);

        assert_eq!(r.peek(16).unwrap(), 0xFFD8);
        assert_eq!(r.take(16).unwrap(), 0xFFD8);
        assert_eq!(r.bits_used(), 16);
        assert_eq!(r.take(32).unwrap(), 0x12345678);
        assert_eq!(r.bits_remaining(), 8);
        assert_eq!(r.take_u8().unwrap(), 0x9A);
        assert_eq!(r.bits_remaining(), 0);
    }

    #[test]
    fn refuses_to_read_past_the_end() {
        let data = [0x01, 0x02, 0x03];
        let mut r = BitReader::new(&data, 24);

        r.take(16).unwrap();
        let e = r.peek(16).unwrap_err();
        assert_eq!(e.error_code(), ErrorCode::InsufficientBits);

        // failed reads do not move the cursor
        assert_eq!(r.bits_used(), 16);
        assert_eq!(r.take_u8().unwrap(), 0x03);
    }

    #[test]
    fn size_limits_the_window() {
        let data = [0xAA; 8];
        let r = BitReader::new(&data, 16);
        assert_eq!(r.bits_remaining(), 16);
        assert!(r.peek(32).is_err());

        let r = BitReader::new(&data, 1000);
        assert_eq!(r.bits_remaining(), 64);
    }

    #[test]
    fn skip_checks_bounds() {
        let data = [0u8; 4];
        let mut r = BitReader::new(&data, 32);
        r.skip_bytes(3).unwrap();
        assert_eq!(
            r.skip_bytes(2).unwrap_err().error_code(),
            ErrorCode::InsufficientBits
        );
        assert_eq!(r.bits_remaining(), 8);
    }
}
