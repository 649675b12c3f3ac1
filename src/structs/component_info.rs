/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComponentInfo {
    /// jpeg internal id
    pub jid: u8,

    /// sample factor horizontal
    pub sfh: u8,

    /// sample factor vertical
    pub sfv: u8,

    /// quantization table
    pub q_table_index: u8,

    /// no of huffman table (DC)
    pub huff_dc: u8,

    /// no of huffman table (AC)
    pub huff_ac: u8,
}

impl ComponentInfo {
    /// builds a descriptor from a row of the per-format component table
    pub const fn from_row(row: &[u8; 6]) -> Self {
        ComponentInfo {
            jid: row[0],
            sfh: row[1],
            sfv: row[2],
            q_table_index: row[3],
            huff_dc: row[4],
            huff_ac: row[5],
        }
    }

    /// the packed sampling factors as they appear in a SOF segment
    pub const fn sampling_byte(&self) -> u8 {
        (self.sfh & 0x0F) << 4 | (self.sfv & 0x0F)
    }

    /// two bits of each sampling factor, the key the frame format is derived from
    pub const fn sampling_nibble(&self) -> u8 {
        (self.sfh & 0x3) << 2 | (self.sfv & 0x3)
    }
}

#[test]
fn test_sampling_nibble() {
    let c = ComponentInfo {
        jid: 1,
        sfh: 2,
        sfv: 1,
        ..Default::default()
    };
    assert_eq!(c.sampling_byte(), 0x21);
    assert_eq!(c.sampling_nibble(), 0x9);
}
