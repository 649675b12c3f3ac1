/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use std::sync::Arc;
use std::time::Duration;

use jpu_engine::{
    Completion, DecodeFrameParams, DecoderOpenParams, DecoderSession, DeviceContext,
    DeviceRegistry, EmulatedDevice, EnabledFeatures, EncodeFrameParams, EncodeState,
    EncoderOpenParams, EncoderSession, ErrorCode, FrameBuffer, FrameFormat, HeaderOptions,
    ScriptedResult, TableMode,
};
use rstest::rstest;

const RING_ADDR: u32 = 0x2000_0000;
const RING_SIZE: usize = 0x10000;
const WAIT: Duration = Duration::from_millis(10);

/// handy function to compare two arrays, and print the first mismatch. Useful for debugging.
#[track_caller]
pub fn assert_eq_array<T: PartialEq + std::fmt::Debug>(a: &[T], b: &[T]) {
    for i in 0..std::cmp::min(a.len(), b.len()) {
        assert_eq!(
            a[i],
            b[i],
            "lengths {},{} and first mismatch at offset {}",
            a.len(),
            b.len(),
            i
        );
    }
    assert_eq!(a.len(), b.len(), "common prefix identical, lengths differ");
}

fn registry(emulated: &EmulatedDevice, process_id: u32) -> DeviceRegistry {
    DeviceRegistry::with_process_id(
        Arc::new(emulated.clone()),
        EnabledFeatures::default(),
        process_id,
    )
}

fn source_buffer(width: u32, height: u32) -> FrameBuffer {
    FrameBuffer {
        dma_fd: 3,
        base_addr: 0,
        y_offset: 0,
        u_offset: width * height,
        v_offset: width * height * 5 / 4,
        stride_c: 0,
    }
}

fn frame_buffer(base_addr: u32, width: u32, height: u32) -> FrameBuffer {
    FrameBuffer {
        dma_fd: 5,
        base_addr,
        ..source_buffer(width, height)
    }
}

/// Header from the encoder, a scan header and `body_len` bytes of entropy
/// coded data without markers
fn complete_jpeg(header: Vec<u8>, format: FrameFormat, body_len: u32) -> Vec<u8> {
    let count = format.component_count();
    let mut jpeg = header;
    jpeg.extend_from_slice(&[0xFF, 0xDA, 0, (6 + 2 * count) as u8, count as u8]);
    for c in &format.components()[..count] {
        jpeg.extend_from_slice(&[c.jid, c.huff_dc << 4 | c.huff_ac]);
    }
    jpeg.extend_from_slice(&[0x00, 0x3F, 0x00]);
    jpeg.extend((0..body_len).map(|i| (i % 0xF0) as u8));
    jpeg.extend_from_slice(&[0xFF, 0xD9]);
    jpeg
}

/// Runs one encode job and returns the finished picture
fn encode_picture(
    emulated: &EmulatedDevice,
    encoder: &mut EncoderSession,
    format: FrameFormat,
    options: &HeaderOptions,
    body_len: u32,
) -> Vec<u8> {
    let header = encoder.encode_header(options).unwrap();
    let geometry = *encoder.geometry();

    emulated.push_result(ScriptedResult::Complete(Completion::encoded(body_len)));
    encoder
        .start_frame(&EncodeFrameParams {
            source: source_buffer(geometry.aligned_width, geometry.aligned_height),
            stride: geometry.aligned_width,
            stream_fd: 4,
            stream_size: 0x8000,
            body_offset: header.len() as u32,
        })
        .unwrap();

    let out = encoder.wait_and_collect(WAIT).unwrap();
    assert_eq!(out.encode_state, EncodeState::FrameDone);
    assert_eq!(out.bitstream_size, body_len);

    complete_jpeg(header, format, out.bitstream_size)
}

fn open_decoder(device: &Arc<DeviceContext>) -> DecoderSession {
    DecoderSession::open(
        device,
        DecoderOpenParams {
            stream_buffer_addr: RING_ADDR,
            stream_buffer_size: RING_SIZE as u32,
            ..Default::default()
        },
    )
    .unwrap()
}

fn feed(decoder: &mut DecoderSession, ring: &mut [u8], data: &[u8]) {
    let at = decoder.stream().write_offset() as usize;
    ring[at..at + data.len()].copy_from_slice(data);
    decoder.feed_bitstream(data.len() as u32).unwrap();
}

/// encoder output parses back with the geometry and tables it was written with
#[rstest]
fn encode_then_decode(
    #[values(
        FrameFormat::Yuv420,
        FrameFormat::Yuv422,
        FrameFormat::Yuv440,
        FrameFormat::Yuv444,
        FrameFormat::Yuv400
    )]
    format: FrameFormat,
    #[values(30, 90)] quality: u32,
    #[values(TableMode::Normal, TableMode::Merged)] table_mode: TableMode,
) {
    let emulated = EmulatedDevice::new();
    let registry = registry(&emulated, 100);
    let device = registry.attach(0).unwrap();

    let mut encoder = EncoderSession::open(
        &device,
        EncoderOpenParams {
            restart_interval: 4,
            ..EncoderOpenParams::new(96, 80, format)
        },
    )
    .unwrap();
    encoder.set_quality(quality).unwrap();

    let options = HeaderOptions {
        quant_mode: table_mode,
        huffman_mode: table_mode,
        ..Default::default()
    };
    let jpeg = encode_picture(&emulated, &mut encoder, format, &options, 1500);

    let mut ring = vec![0u8; RING_SIZE];
    let mut decoder = open_decoder(&device);
    feed(&mut decoder, &mut ring, &jpeg);
    decoder.feed_bitstream(0).unwrap();

    let info = decoder.parse_headers(&ring).unwrap();
    assert_eq!((info.picture_width, info.picture_height), (96, 80));
    assert_eq!(info.source_format, format);
    assert_eq!(info.restart_interval, 4);
    assert!(!info.twelve_bit);

    let parsed = decoder.header().unwrap();
    assert_eq!(parsed.quant_tables[0], encoder.quant_tables()[0]);
    assert_eq_array(
        parsed.quant_tables[0].unwrap().values(),
        encoder.quant_tables()[0].unwrap().values(),
    );
    if format != FrameFormat::Yuv400 {
        assert_eq!(parsed.quant_tables[1], encoder.quant_tables()[1]);
    }

    decoder
        .register_frame_buffers(&[frame_buffer(0x4000_0000, 96, 80)], info.aligned_width)
        .unwrap();

    emulated.push_result(ScriptedResult::Complete(Completion {
        consumed_bytes: info.ecs_offset + 1500 + 16,
        ..Completion::done()
    }));
    decoder.start_frame(&DecodeFrameParams::default()).unwrap();
    let out = decoder.wait_and_collect(WAIT).unwrap();
    assert!(out.decode_success);
    assert_eq!(
        (out.decoded_width, out.decoded_height),
        (info.aligned_width, info.aligned_height)
    );
    assert_eq!(decoder.get_output_info(), Some(out));

    decoder.close().unwrap();
    encoder.close().unwrap();
    registry.detach(&device).unwrap();
    assert!(!emulated.clock_enabled());
}

/// a motion JPEG stream decodes frame by frame, each found behind the last
#[test]
fn motion_jpeg_stream() {
    let emulated = EmulatedDevice::new();
    let registry = registry(&emulated, 100);
    let device = registry.attach(0).unwrap();

    let mut encoder =
        EncoderSession::open(&device, EncoderOpenParams::new(64, 64, FrameFormat::Yuv420))
            .unwrap();
    let frames: Vec<Vec<u8>> = (0..3)
        .map(|i| {
            encode_picture(
                &emulated,
                &mut encoder,
                FrameFormat::Yuv420,
                &HeaderOptions::default(),
                1200 + i * 100,
            )
        })
        .collect();

    // APP9 numbers the frames
    for (i, f) in frames.iter().enumerate() {
        assert_eq!(&f[2..8], &[0xFF, 0xE9, 0, 4, 0, i as u8]);
    }

    let mut ring = vec![0u8; RING_SIZE];
    let mut decoder = open_decoder(&device);
    for f in &frames {
        feed(&mut decoder, &mut ring, f);
    }
    decoder.feed_bitstream(0).unwrap();

    let mut expected_offset = 0;
    for (i, f) in frames.iter().enumerate() {
        let info = decoder.parse_headers(&ring).unwrap();
        assert_eq!(decoder.stream().frame_offset(), expected_offset);
        if i == 0 {
            decoder
                .register_frame_buffers(&[frame_buffer(0x4000_0000, 64, 64)], 64)
                .unwrap();
        }

        let ecs_len = f.len() as u32 - info.ecs_offset - 2;
        emulated.push_result(ScriptedResult::Complete(Completion {
            consumed_bytes: info.ecs_offset + ecs_len + 16,
            ..Completion::done()
        }));
        decoder.start_frame(&DecodeFrameParams::default()).unwrap();
        let out = decoder.wait_and_collect(WAIT).unwrap();
        assert_eq!(out.frame_start_offset, expected_offset);

        expected_offset += f.len() as u32;
    }

    assert_eq!(decoder.frame_index(), 3);
    assert_eq!(
        decoder.parse_headers(&ring).unwrap_err().error_code(),
        ErrorCode::EndOfStream
    );
}

/// two processes share the session table and the register banks
#[test]
fn processes_share_the_session_table() {
    let emulated = EmulatedDevice::new();
    let a = registry(&emulated, 100);
    let b = registry(&emulated, 200);
    let device_a = a.attach(0).unwrap();
    let device_b = b.attach(0).unwrap();

    // only the process that set the table up resets the codec
    assert_eq!(emulated.reset_count(), 1);

    let mut decoders = vec![open_decoder(&device_a), open_decoder(&device_a)];
    let mut encoders = vec![
        EncoderSession::open(&device_b, EncoderOpenParams::new(64, 48, FrameFormat::Yuv420))
            .unwrap(),
        EncoderSession::open(&device_b, EncoderOpenParams::new(64, 48, FrameFormat::Yuv420))
            .unwrap(),
    ];
    assert_eq!(device_a.sessions_in_use().unwrap(), 4);
    assert_eq!(device_b.sessions_in_use().unwrap(), 4);

    assert_eq!(
        DecoderSession::open(
            &device_a,
            DecoderOpenParams {
                stream_buffer_addr: RING_ADDR,
                stream_buffer_size: RING_SIZE as u32,
                ..Default::default()
            }
        )
        .err()
        .unwrap()
        .error_code(),
        ErrorCode::ResourceExhausted
    );

    let mut slots: Vec<usize> = decoders
        .iter()
        .map(|d| d.id().slot_index())
        .chain(encoders.iter().map(|e| e.id().slot_index()))
        .collect();
    slots.sort();
    assert_eq!(slots, vec![0, 1, 2, 3]);

    // a slot freed by one process is reused by the other
    let freed = encoders[0].id().slot_index();
    encoders[0].close().unwrap();
    let mut reopened = open_decoder(&device_a);
    assert_eq!(reopened.id().slot_index(), freed);
    assert_ne!(reopened.id(), encoders[0].id());

    reopened.close().unwrap();
    encoders[1].close().unwrap();
    for d in decoders.iter_mut() {
        d.close().unwrap();
    }
    assert_eq!(device_a.sessions_in_use().unwrap(), 0);

    a.detach(&device_a).unwrap();
    assert!(emulated.clock_enabled());
    b.detach(&device_b).unwrap();
    assert!(!emulated.clock_enabled());
}

/// jobs of different processes run on their own banks and are collected independently
#[test]
fn jobs_of_two_processes_overlap() {
    let emulated = EmulatedDevice::new();
    let a = registry(&emulated, 100);
    let b = registry(&emulated, 200);
    let device_a = a.attach(0).unwrap();
    let device_b = b.attach(0).unwrap();

    let mut source = EncoderSession::open(
        &device_a,
        EncoderOpenParams::new(64, 48, FrameFormat::Yuv422),
    )
    .unwrap();
    let jpeg = encode_picture(
        &emulated,
        &mut source,
        FrameFormat::Yuv422,
        &HeaderOptions::default(),
        1400,
    );
    source.close().unwrap();

    let mut ring = vec![0u8; RING_SIZE];
    let mut decoder = open_decoder(&device_a);
    feed(&mut decoder, &mut ring, &jpeg);
    decoder.feed_bitstream(0).unwrap();
    let info = decoder.parse_headers(&ring).unwrap();
    decoder
        .register_frame_buffers(&[frame_buffer(0x4000_0000, 64, 48)], 64)
        .unwrap();

    let mut encoder = EncoderSession::open(
        &device_b,
        EncoderOpenParams::new(64, 48, FrameFormat::Yuv420),
    )
    .unwrap();
    let header = encoder.encode_header(&HeaderOptions::default()).unwrap();

    decoder.start_frame(&DecodeFrameParams::default()).unwrap();
    encoder
        .start_frame(&EncodeFrameParams {
            source: source_buffer(64, 48),
            stride: 64,
            stream_fd: 4,
            stream_size: 0x8000,
            body_offset: header.len() as u32,
        })
        .unwrap();

    let decoder_bank = decoder.id().slot_index();
    let encoder_bank = encoder.id().slot_index();
    assert_ne!(decoder_bank, encoder_bank);
    assert!(emulated.is_running(decoder_bank));
    assert!(emulated.is_running(encoder_bank));

    // a session with a job outstanding stays open
    assert_eq!(
        decoder.close().unwrap_err().error_code(),
        ErrorCode::FrameNotComplete
    );

    // results are handed out in the order of the waits
    emulated.push_result(ScriptedResult::Complete(Completion::encoded(900)));
    emulated.push_result(ScriptedResult::Complete(Completion {
        consumed_bytes: info.ecs_offset + 1400 + 16,
        ..Completion::done()
    }));

    let encoded = encoder.wait_and_collect(WAIT).unwrap();
    assert_eq!(encoded.bitstream_size, 900);
    assert!(emulated.is_running(decoder_bank));

    let decoded = decoder.wait_and_collect(WAIT).unwrap();
    assert!(decoded.decode_success);
    assert_eq!(decoded.consumed_bytes, info.ecs_offset + 1400 + 16);

    decoder.close().unwrap();
    encoder.close().unwrap();
    a.detach(&device_a).unwrap();
    b.detach(&device_b).unwrap();
}

/// a timeout outside slice mode leaves the job on the hardware, waiting again collects it
#[test]
fn timeout_keeps_the_job_pending() {
    let emulated = EmulatedDevice::new();
    let registry = registry(&emulated, 100);
    let device = registry.attach(0).unwrap();

    let mut encoder =
        EncoderSession::open(&device, EncoderOpenParams::new(64, 48, FrameFormat::Yuv420))
            .unwrap();
    let header = encoder.encode_header(&HeaderOptions::default()).unwrap();

    emulated.push_result(ScriptedResult::Timeout);
    emulated.push_result(ScriptedResult::Complete(Completion::encoded(321)));

    encoder
        .start_frame(&EncodeFrameParams {
            source: source_buffer(64, 48),
            stride: 64,
            stream_fd: 4,
            stream_size: 0x8000,
            body_offset: header.len() as u32,
        })
        .unwrap();

    let e = encoder.wait_and_collect(WAIT).unwrap_err();
    assert_eq!(e.error_code(), ErrorCode::HardwareTimeout);
    assert!(e.message().contains("PIC_STATUS="));
    assert_eq!(
        encoder.close().unwrap_err().error_code(),
        ErrorCode::FrameNotComplete
    );

    assert_eq!(encoder.wait_and_collect(WAIT).unwrap().bitstream_size, 321);
    encoder.close().unwrap();
    registry.detach(&device).unwrap();
}

/// a 12-bit picture writes SOF1 and 16-bit quantizers and parses back as 12-bit
#[test]
fn twelve_bit_round_trip() {
    let emulated = EmulatedDevice::new();
    let registry = registry(&emulated, 100);
    let device = registry.attach(0).unwrap();

    let mut encoder = EncoderSession::open(
        &device,
        EncoderOpenParams {
            twelve_bit: true,
            ..EncoderOpenParams::new(64, 48, FrameFormat::Yuv420)
        },
    )
    .unwrap();
    let jpeg = encode_picture(
        &emulated,
        &mut encoder,
        FrameFormat::Yuv420,
        &HeaderOptions::default(),
        2000,
    );
    assert!(jpeg.windows(2).any(|w| w == [0xFF, 0xC1]));

    let mut ring = vec![0u8; RING_SIZE];
    let mut decoder = open_decoder(&device);
    feed(&mut decoder, &mut ring, &jpeg);
    decoder.feed_bitstream(0).unwrap();

    let info = decoder.parse_headers(&ring).unwrap();
    assert!(info.twelve_bit);
    assert_eq!(
        decoder.header().unwrap().quant_tables[0],
        encoder.quant_tables()[0]
    );
}
