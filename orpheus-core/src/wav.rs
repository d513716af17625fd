// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

use byteorder::{ByteOrder, LittleEndian};

pub const SAMPLE_RATE: u32 = 24_000;
pub const CHANNELS: u16 = 1;
pub const BITS_PER_SAMPLE: u16 = 16;
pub const HEADER_LEN: usize = 44;

/// RIFF/WAVE header for 24kHz mono 16-bit PCM.
///
/// Streaming responses use a `data_size` of 0 as the final length is unknown.
pub fn wav_header(data_size: u32) -> [u8; HEADER_LEN] {
    let block_align = CHANNELS * BITS_PER_SAMPLE / 8;
    let byte_rate = SAMPLE_RATE * block_align as u32;
    let mut h = [0u8; HEADER_LEN];
    h[0..4].copy_from_slice(b"RIFF");
    LittleEndian::write_u32(&mut h[4..8], data_size.saturating_add(36));
    h[8..12].copy_from_slice(b"WAVE");
    h[12..16].copy_from_slice(b"fmt ");
    LittleEndian::write_u32(&mut h[16..20], 16);
    // PCM
    LittleEndian::write_u16(&mut h[20..22], 1);
    LittleEndian::write_u16(&mut h[22..24], CHANNELS);
    LittleEndian::write_u32(&mut h[24..28], SAMPLE_RATE);
    LittleEndian::write_u32(&mut h[28..32], byte_rate);
    LittleEndian::write_u16(&mut h[32..34], block_align);
    LittleEndian::write_u16(&mut h[34..36], BITS_PER_SAMPLE);
    h[36..40].copy_from_slice(b"data");
    LittleEndian::write_u32(&mut h[40..44], data_size);
    h
}
