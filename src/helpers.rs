/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

/// low n bits of c
#[inline(always)]
pub const fn rbits(c: u8, n: usize) -> u8 {
    return c & (0xFF >> (8 - n));
}

/// high n bits of c
#[inline(always)]
pub const fn lbits(c: u8, n: usize) -> u8 {
    return c >> (8 - n);
}

/// rounds v up to the next multiple of align, which must be a power of two
#[inline(always)]
pub const fn ceil_align(align: u32, v: u32) -> u32 {
    return (v + (align - 1)) & !(align - 1);
}

/// rounds v down to a multiple of align, which must be a power of two
#[inline(always)]
pub const fn floor_align(align: u32, v: u32) -> u32 {
    return v & !(align - 1);
}

/// all-ones mask of `width` bits if bit `sign_bit` of value is set, otherwise zero
#[inline(always)]
pub const fn sign_fill(value: u32, sign_bit: u32, width: u32) -> u32 {
    let fill = if (value >> sign_bit) & 1 != 0 {
        ((1u64 << width) - 1) as u32
    } else {
        0
    };
    return fill;
}

#[cfg(test)]
pub fn get_rand_from_seed(seed: [u8; 32]) -> rand_chacha::ChaCha12Rng {
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    ChaCha12Rng::from_seed(seed)
}

#[test]
fn test_alignment_helpers() {
    assert_eq!(ceil_align(16, 0), 0);
    assert_eq!(ceil_align(16, 1), 16);
    assert_eq!(ceil_align(16, 16), 16);
    assert_eq!(ceil_align(8, 17), 24);
    assert_eq!(ceil_align(256, 257), 512);
    assert_eq!(floor_align(512, 1023), 512);
    assert_eq!(floor_align(8, 7), 0);
}

#[test]
fn test_bit_helpers() {
    assert_eq!(lbits(0x12, 4), 0x1);
    assert_eq!(rbits(0x12, 4), 0x2);
    assert_eq!(sign_fill(0xFFFF, 15, 16), 0xFFFF);
    assert_eq!(sign_fill(0x7FFF, 15, 16), 0);
    assert_eq!(sign_fill(0x80, 7, 24), 0xFF_FFFF);
}
