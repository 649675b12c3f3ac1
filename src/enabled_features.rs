/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use std::time::Duration;

use crate::consts::{
    DEFAULT_INSTANCE_CAPACITY, FEED_ROOM_GRANULARITY, GBU_SIZE, MAX_INSTANCE_CAPACITY,
    MAX_PICTURE_SIZE, MIN_DECODE_BYTES,
};

/// Tunables of the engine. Most deployments use the defaults, tests shrink or relax some of them.
#[derive(Debug, Clone)]
pub struct EnabledFeatures {
    /// maximum picture width accepted by the header parser and the encoder
    pub max_picture_width: u32,

    /// maximum picture height accepted by the header parser and the encoder
    pub max_picture_height: u32,

    /// the decoder reports BitEmpty when fewer bytes than this are buffered
    pub min_decode_bytes: u32,

    /// unit the hardware fetches the stream in, also the end-of-stream rounding
    pub gbu_size: u32,

    /// feed room is rounded down to a multiple of this
    pub feed_room_granularity: u32,

    /// number of session slots in the shared table
    pub instance_capacity: usize,

    /// how long to wait for the cross-process lock before giving up with Failure
    pub lock_timeout: Duration,

    /// overrides the 12-bit capability read from the version register
    pub support_12bit_override: Option<bool>,
}

impl Default for EnabledFeatures {
    fn default() -> Self {
        Self {
            max_picture_width: MAX_PICTURE_SIZE,
            max_picture_height: MAX_PICTURE_SIZE,
            min_decode_bytes: MIN_DECODE_BYTES,
            gbu_size: GBU_SIZE,
            feed_room_granularity: FEED_ROOM_GRANULARITY,
            instance_capacity: DEFAULT_INSTANCE_CAPACITY,
            lock_timeout: Duration::from_secs(5),
            support_12bit_override: None,
        }
    }
}

impl EnabledFeatures {
    /// parameters that allow everything
    pub fn all() -> Self {
        Self {
            max_picture_width: u16::MAX as u32,
            max_picture_height: u16::MAX as u32,
            instance_capacity: MAX_INSTANCE_CAPACITY,
            support_12bit_override: Some(true),
            ..Default::default()
        }
    }
}
