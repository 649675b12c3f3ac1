/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use std::io::{stdout, IsTerminal};
use std::sync::Arc;
use std::time::Duration;

use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

use jpu_engine::jpu_error::{err_exit_code, AddContext};
use jpu_engine::{
    get_version_string, trim_encoded_bitstream, Completion, DecodeFrameParams, DecoderOpenParams,
    DecoderSession, DeviceContext, DeviceRegistry, EmulatedDevice, EnabledFeatures,
    EncodeFrameParams, EncodeState, EncoderOpenParams, EncoderSession, ErrorCode, FrameBuffer,
    FrameFormat, HeaderOptions, InterruptMask, JpuError, Result, ScriptedResult,
};

const USAGE: &str = "\
usage: jpu_engine_util [options]

Encodes a picture and decodes it again on the emulated accelerator.

  --width <n>      picture width (default 64)
  --height <n>     picture height (default 48)
  --format <f>     420, 422, 440, 444 or 400 (default 420)
  --quality <q>    encoder quality 1..100 (default 75)
  --slices <n>     encode in slices of n rows
  --dump           print the parsed headers
  --verbose        debug logging
  --version        print the version and exit
";

const RING_ADDR: u32 = 0x2000_0000;
const WAIT: Duration = Duration::from_millis(100);

/// the emulated device has no memory, it hands out fake entropy coded bytes
const SOURCE_FD: i32 = 3;
const STREAM_FD: i32 = 4;
const FRAME_FD: i32 = 5;

struct Options {
    width: u32,
    height: u32,
    format: FrameFormat,
    quality: u32,
    slice_height: u32,
    dump: bool,
}

fn syntax_error(e: pico_args::Error) -> JpuError {
    JpuError::new(ErrorCode::InvalidParameter, e.to_string())
}

fn parse_format(s: &str) -> std::result::Result<FrameFormat, String> {
    match s {
        "420" => Ok(FrameFormat::Yuv420),
        "422" => Ok(FrameFormat::Yuv422),
        "440" => Ok(FrameFormat::Yuv440),
        "444" => Ok(FrameFormat::Yuv444),
        "400" => Ok(FrameFormat::Yuv400),
        _ => Err(format!("unknown format {0}", s)),
    }
}

fn parse_options(mut args: pico_args::Arguments) -> Result<Options> {
    let options = Options {
        width: args
            .opt_value_from_str("--width")
            .map_err(syntax_error)?
            .unwrap_or(64),
        height: args
            .opt_value_from_str("--height")
            .map_err(syntax_error)?
            .unwrap_or(48),
        format: args
            .opt_value_from_fn("--format", parse_format)
            .map_err(syntax_error)?
            .unwrap_or(FrameFormat::Yuv420),
        quality: args
            .opt_value_from_str("--quality")
            .map_err(syntax_error)?
            .unwrap_or(75),
        slice_height: args
            .opt_value_from_str("--slices")
            .map_err(syntax_error)?
            .unwrap_or(0),
        dump: args.contains("--dump"),
    };

    let rest = args.finish();
    if !rest.is_empty() {
        return err_exit_code(
            ErrorCode::InvalidParameter,
            format!("unknown switch {0:?}", rest[0]),
        );
    }
    Ok(options)
}

/// filler that never forms a marker
fn fake_entropy_data(len: usize) -> impl Iterator<Item = u8> {
    (0..len).map(|i| (i * 7 % 251) as u8)
}

/// SOS segment in front of the entropy coded data
fn scan_header(format: FrameFormat) -> Vec<u8> {
    let count = format.component_count();
    let mut sos = vec![0xFF, 0xDA, 0, (6 + 2 * count) as u8, count as u8];
    for c in &format.components()[..count] {
        sos.extend_from_slice(&[c.jid, c.huff_dc << 4 | c.huff_ac]);
    }
    sos.extend_from_slice(&[0x00, 0x3F, 0x00]);
    sos
}

/// Encodes one picture and returns the complete JPEG file
fn encode(device: &Arc<DeviceContext>, emulated: &EmulatedDevice, o: &Options) -> Result<Vec<u8>> {
    let slice_mode = o.slice_height != 0;
    let mut encoder = EncoderSession::open(
        device,
        EncoderOpenParams {
            slice_mode,
            slice_height: o.slice_height,
            interrupt_enable: InterruptMask::all(),
            ..EncoderOpenParams::new(o.width, o.height, o.format)
        },
    )
    .context()?;
    encoder.set_quality(o.quality).context()?;

    let header = encoder.encode_header(&HeaderOptions::default()).context()?;

    let geometry = *encoder.geometry();
    let luma_size = geometry.aligned_width * geometry.aligned_height;
    let source = FrameBuffer {
        dma_fd: SOURCE_FD,
        base_addr: 0,
        y_offset: 0,
        u_offset: luma_size,
        v_offset: luma_size + luma_size / 4,
        stride_c: 0,
    };

    // a rough bits per pixel guess, the emulator reports what we tell it
    let slice_rows = if slice_mode {
        o.slice_height
    } else {
        geometry.aligned_height
    };
    let slice_bytes = (geometry.aligned_width * slice_rows / 4).max(64);

    if slice_mode {
        let mut position = o.slice_height;
        while position < geometry.aligned_height {
            emulated.push_result(ScriptedResult::Complete(Completion {
                encoded_bytes: slice_bytes,
                ..Completion::slice_done(position)
            }));
            position += o.slice_height;
        }
    }
    emulated.push_result(ScriptedResult::Complete(Completion::encoded(slice_bytes)));

    let mut body_size = 0;
    let mut jobs = 0;
    loop {
        encoder
            .start_frame(&EncodeFrameParams {
                source,
                stride: geometry.aligned_width,
                stream_fd: STREAM_FD,
                stream_size: slice_bytes * 2,
                body_offset: u32::try_from(header.len())?,
            })
            .context()?;

        let out = encoder.wait_and_collect(WAIT).context()?;
        body_size += out.bitstream_size as usize;
        jobs += 1;

        if out.encode_state == EncodeState::FrameDone {
            info!(
                "encoded {0}x{1} {2:?} in {3} job(s), {4} cycles for the last",
                o.width, o.height, o.format, jobs, out.frame_cycles
            );
            break;
        }
    }
    encoder.close().context()?;

    let mut jpeg = header;
    jpeg.extend(scan_header(o.format));
    jpeg.extend(fake_entropy_data(body_size));
    jpeg.extend_from_slice(&[0xFF, 0xD9]);

    // the hardware fills up the last bus word
    jpeg.extend_from_slice(&[0xFF; 6]);
    jpeg.truncate(trim_encoded_bitstream(&jpeg));
    Ok(jpeg)
}

fn decode(
    device: &Arc<DeviceContext>,
    emulated: &EmulatedDevice,
    jpeg: &[u8],
    o: &Options,
) -> Result<()> {
    // room for the picture and a page of slack so the write pointer never wraps
    let ring_size = u32::try_from(jpeg.len())? / 4096 * 4096 + 8192;
    let mut ring = vec![0u8; ring_size as usize];
    ring[..jpeg.len()].copy_from_slice(jpeg);

    let mut decoder = DecoderSession::open(
        device,
        DecoderOpenParams {
            stream_buffer_addr: RING_ADDR,
            stream_buffer_size: ring_size,
            ..Default::default()
        },
    )
    .context()?;

    decoder.feed_bitstream(u32::try_from(jpeg.len())?).context()?;
    decoder.feed_bitstream(0).context()?;

    let initial = decoder.parse_headers(&ring).context()?;
    if o.dump {
        println!("parsed header:");
        if let Some(header) = decoder.header() {
            let s = format!("{header:?}");
            println!("{0}", s.replace("},", "},\r\n").replace("],", "],\r\n"));
        }
        println!("{initial:#?}");
    }

    let luma_size = initial.aligned_width * initial.aligned_height;
    decoder
        .register_frame_buffers(
            &[FrameBuffer {
                dma_fd: FRAME_FD,
                base_addr: 0x4000_0000,
                y_offset: 0,
                u_offset: luma_size,
                v_offset: luma_size + luma_size / 4,
                stride_c: 0,
            }],
            initial.aligned_width,
        )
        .context()?;

    let ecs_size = u32::try_from(jpeg.len())? - initial.ecs_offset;
    emulated.push_result(ScriptedResult::Complete(Completion {
        consumed_bytes: ecs_size,
        ..Completion::done()
    }));

    decoder.start_frame(&DecodeFrameParams::default()).context()?;
    let out = decoder.wait_and_collect(WAIT).context()?;
    info!(
        "decoded {0}x{1}, {2} bytes consumed, success {3}",
        out.decoded_width, out.decoded_height, out.consumed_bytes, out.decode_success
    );

    decoder.close().context()?;
    Ok(())
}

// wrap main so that errors get printed nicely without a panic
fn main_with_result() -> Result<()> {
    let mut args = pico_args::Arguments::from_env();

    if args.contains(["-h", "--help"]) {
        print!("{USAGE}");
        return Ok(());
    }
    if args.contains("--version") {
        println!("jpu_engine_util {0}", get_version_string());
        return Ok(());
    }

    let verbose = args.contains("--verbose");
    let options = parse_options(args)?;

    // only output the log if we are connected to a console
    if stdout().is_terminal() {
        SimpleLogger::new()
            .with_level(if verbose {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            })
            .init()
            .map_err(|e| JpuError::new(ErrorCode::Failure, e.to_string()))?;
    }

    let emulated = EmulatedDevice::new();
    let registry = DeviceRegistry::new(Arc::new(emulated.clone()), EnabledFeatures::default());
    let device = registry.attach(0).context()?;

    let capabilities = device.capabilities()?;
    info!(
        "jpu_engine {0}, api {1:#x}, product {2} revision {3:#x}, 12-bit {4}",
        get_version_string(),
        capabilities.api_version,
        capabilities.product_id,
        capabilities.revision,
        capabilities.support_12bit
    );

    let jpeg = encode(&device, &emulated, &options)?;
    info!("{0} byte JPEG", jpeg.len());
    decode(&device, &emulated, &jpeg, &options)?;

    registry.detach(&device).context()?;
    Ok(())
}

fn main() {
    match main_with_result() {
        Ok(_) => {}
        Err(e) => {
            eprintln!(
                "error code: {0} {1} {2}",
                e.error_code(),
                e.error_code().as_integer_error_code(),
                e.message()
            );
            std::process::exit(e.error_code().as_integer_error_code());
        }
    }
}
