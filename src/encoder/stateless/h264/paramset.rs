// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parameter-Set Builder (component D): level resolution and SPS/PPS
//! derivation from the negotiated profile and the GOP plan (§4.D).

use crate::codec::h264::levels;
use crate::codec::h264::parser::Level;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::PpsBuilder;
use crate::codec::h264::parser::Profile;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::parser::SpsBuilder;
use crate::codec::h264::parser::VuiParameters;
use crate::encoder::stateless::h264::gop::GopState;
use crate::encoder::stateless::EncodeError;
use crate::encoder::stateless::EncodeResult;
use crate::Resolution;

/// §4.D step 4: resolve `Level::Auto` against the bitrate/resolution/
/// framerate/DPB-size budget. A level explicitly requested by the caller is
/// passed through unchanged -- the core does not second-guess it.
pub fn resolve_level(
    profile: Profile,
    requested: Level,
    bitrate_bps: u64,
    resolution: Resolution,
    fps_n: u32,
    fps_d: u32,
    max_dec_frame_buffering: u32,
) -> EncodeResult<Level> {
    if !matches!(requested, Level::Auto) {
        return Ok(requested);
    }

    levels::find_level(
        profile,
        bitrate_bps,
        resolution.width,
        resolution.height,
        fps_n,
        fps_d,
        max_dec_frame_buffering,
    )
    .ok_or_else(|| {
        EncodeError::ConfigurationInvalid(format!(
            "no H.264 level covers {}x{} @ {}/{} fps at {} bps",
            resolution.width, resolution.height, fps_n, fps_d, bitrate_bps
        ))
    })
}

/// §4.D: derive the single SPS/PPS pair used for the whole coded video
/// sequence from the negotiated profile/level and the finalized GOP plan.
pub fn build_parameter_sets(profile: Profile, level: Level, resolution: Resolution, gop: &GopState) -> (Sps, Pps) {
    let vui = VuiParameters {
        timing_info_present_flag: true,
        bitstream_restriction_flag: true,
        num_reorder_frames: gop.num_reorder_frames,
        max_dec_frame_buffering: gop.max_dec_frame_buffering,
        ..Default::default()
    };

    let sps = SpsBuilder::new()
        .profile(profile)
        .level(level)
        .chroma_format_idc(1)
        .log2_max_frame_num(gop.log2_max_frame_num)
        .log2_max_pic_order_cnt_lsb(gop.log2_max_pic_order_cnt_lsb)
        .max_num_ref_frames(gop.max_num_ref_frames)
        .resolution(resolution.width, resolution.height)
        .vui(vui)
        .build();

    let pps = PpsBuilder::new()
        .profile(profile)
        .default_ref_idx_active(gop.ref_num_list0.max(1), gop.ref_num_list1.max(1))
        .build();

    (sps, pps)
}

/// Fixed per-NAL header budgets (in bits), Annex A/E worst cases. Lets a
/// backend/embedder size its output buffer without a bit-exact bitstream
/// writer (§4.D).
const MAX_SPS_HDR_SIZE: u64 = 16473;
const MAX_VUI_PARAMS_SIZE: u64 = 210;
const MAX_HRD_PARAMS_SIZE: u64 = 4103;
const MAX_PPS_HDR_SIZE: u64 = 101;
const MAX_SLICE_HDR_SIZE: u64 = 397 + 2572 + 6670 + 2402;

fn round_up_8(bits: u64) -> u64 {
    (bits + 7) & !7
}

/// §4.D: upper-bound the coded size of one access unit carrying `num_slices`
/// slices against this SPS/PPS pair, so a caller can size an output buffer
/// before a single macroblock has been encoded.
pub fn calculate_coded_size(sps: &Sps, _pps: &Pps, num_slices: u32) -> u64 {
    let num_slices = num_slices.max(1) as u64;
    let mb_width = sps.pic_width_in_mbs as u64;
    let mb_height = sps.pic_height_in_map_units as u64;

    // profile_idc for High/High10/High422/High444/MultiviewHigh/StereoHigh,
    // the profiles whose macroblock bit budget depends on bit depth and
    // chroma format rather than a flat per-macroblock cap.
    let high_profile_range = matches!(sps.profile_idc, 100 | 110 | 118 | 122 | 128 | 244);

    let mut coded_size = if high_profile_range {
        // Number of bits of macroblock_layer() data for any macroblock is
        // not greater than 128 + RawMbBits.
        let bit_depth_luma = sps.bit_depth_luma_minus8 as u64 + 8;
        let bit_depth_chroma = sps.bit_depth_chroma_minus8 as u64 + 8;
        let (mb_width_c, mb_height_c) = match sps.chroma_format_idc {
            2 => (8, 16),
            3 => (16, 16),
            _ => (8, 8),
        };
        let raw_mb_bits = 256 * bit_depth_luma + 2 * mb_width_c * mb_height_c * bit_depth_chroma;
        (mb_width * mb_height) * (128 + raw_mb_bits) / 8
    } else {
        // Number of bits of macroblock_layer() data for any macroblock is
        // not greater than 3200.
        (mb_width * mb_height) * (3200 / 8)
    };

    // SPS header.
    coded_size += 4 + round_up_8(MAX_SPS_HDR_SIZE + MAX_VUI_PARAMS_SIZE + 2 * MAX_HRD_PARAMS_SIZE) / 8;
    // PPS header.
    coded_size += 4 + round_up_8(MAX_PPS_HDR_SIZE) / 8;
    // Slice headers.
    coded_size += num_slices * (4 + round_up_8(MAX_SLICE_HDR_SIZE) / 8);

    // 5% safety margin.
    (coded_size as f64 * 1.05) as u64 + 1
}

/// §4.D override protocol: the backend may, exactly once per CVS, replace
/// the negotiated SPS/PPS wholesale (e.g. to fix up level constraints it
/// alone knows about). A second override attempt is ignored.
pub struct OverrideGate {
    used: bool,
}

impl OverrideGate {
    pub fn new() -> Self {
        Self { used: false }
    }

    pub fn apply(&mut self, current: (Sps, Pps), proposed: Option<(Sps, Pps)>) -> (Sps, Pps) {
        match proposed {
            Some(replacement) if !self.used => {
                self.used = true;
                replacement
            }
            Some(_) => {
                log::debug!("ignoring second parameter-set override from backend");
                current
            }
            None => current,
        }
    }
}
