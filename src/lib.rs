/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

//! Userspace control engine for a JPEG hardware accelerator.
//!
//! Several processes share the accelerator through a session table kept in
//! a shared control block. A session parses or writes the JPEG headers,
//! uploads the coding tables and programs one register bank per frame job;
//! the hardware does the entropy coding. [`EmulatedDevice`] stands in for
//! the hardware in tests and in the utility binary.

mod consts;
mod enabled_features;
mod helpers;
mod jpeg_code;
pub mod jpu_error;
pub mod jpu_registers;
mod structs;

pub use crate::consts::{API_VERSION, MAX_INSTANCE_CAPACITY, PRODUCT_ID_CODAJ10};
pub use crate::enabled_features::EnabledFeatures;
pub use crate::jpu_error::{ErrorCode, JpuError, Result};

pub use crate::structs::component_info::ComponentInfo;
pub use crate::structs::control_block::{LockGuard, MemoryControlBlock, SharedControlBlock};
pub use crate::structs::decoder::{
    DecodeFrameParams, DecodeOutput, DecoderCommand, DecoderInitialInfo, DecoderOpenParams,
    DecoderSession, FeedRoom, RoiPlacement,
};
pub use crate::structs::device::{
    Capabilities, DeviceContext, DeviceRegistry, DmaConfig, Hardware, HardwareOpener, WaitOutcome,
};
pub use crate::structs::emulated_device::{Completion, EmulatedDevice, ScriptedResult};
pub use crate::structs::encoder::{
    EncodeFrameParams, EncodeState, EncodedOutput, EncoderOpenParams, EncoderSession,
};
pub use crate::structs::frame_format::{
    ChromaInterleave, FrameFormat, McuGeometry, Mirror, PackedFormat, RoiRect, Rotation,
};
pub use crate::structs::header_writer::{trim_encoded_bitstream, HeaderOptions, TableMode};
pub use crate::structs::huffman_tables::{HuffmanTable, HuffmanTableSet};
pub use crate::structs::instance_pool::{SessionId, SessionMode};
pub use crate::structs::jpeg_header::JpegHeader;
pub use crate::structs::quantization_tables::{QuantPrecision, QuantizationTable};
pub use crate::structs::register_words::{InterruptMask, VersionInfo};
pub use crate::structs::stream_buffer::{relocate_wrapped_frame, RelocatedFrame, StreamRing};
pub use crate::structs::FrameBuffer;

/// Package version followed by the git revision it was built from
pub fn get_version_string() -> String {
    let git = git_version::git_version!(
        args = ["--abbrev=8", "--always", "--dirty=M"],
        fallback = "unknown"
    );
    format!("{0}-{1}", env!("CARGO_PKG_VERSION"), git)
}

#[test]
fn test_version_string() {
    let v = get_version_string();
    assert!(v.starts_with(env!("CARGO_PKG_VERSION")));
    assert!(v.len() > env!("CARGO_PKG_VERSION").len() + 1);
}
