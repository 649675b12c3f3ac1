/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

// Don't allow any unsafe code by default. The engine parses bitstreams handed
// to it by other processes, so we want this extra level of safety.
#![forbid(unsafe_code)]

mod bit_reader;
pub mod component_info;
pub mod control_block;
pub mod decoder;
pub mod device;
pub mod emulated_device;
pub mod encoder;
pub mod frame_format;
mod frame_job;
pub mod header_writer;
pub mod huffman_tables;
pub mod instance_pool;
pub mod jpeg_header;
pub mod quantization_tables;
pub mod register_words;
mod session;
pub mod stream_buffer;

pub use session::FrameBuffer;
