// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! GOP Planner (component A): pure arithmetic deciding, for every logical
//! position in a coded video sequence, the slice type, reference-ness, and
//! pyramid level. Never fails -- callers get a clamped, internally
//! consistent [`GopState`] back no matter how contradictory the input.

use crate::codec::h264::parser::Profile;
use crate::codec::h264::parser::SliceType;

/// One entry of the fixed, per-CVS GOP plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopFrameDescriptor {
    pub slice_type: SliceType,
    pub is_ref: bool,
    pub pyramid_level: u32,
    pub left_ref_poc_diff: i32,
    pub right_ref_poc_diff: i32,
}

impl GopFrameDescriptor {
    fn anchor(slice_type: SliceType) -> Self {
        Self {
            slice_type,
            is_ref: true,
            pyramid_level: 0,
            left_ref_poc_diff: 0,
            right_ref_poc_diff: 0,
        }
    }

}

/// Configuration the GOP Planner is run with once per CVS, gathered from the
/// configuration surface (§6.1) and the negotiated profile/backend caps.
#[derive(Debug, Clone, Copy)]
pub struct GopConfig {
    pub idr_period: u32,
    pub num_bframes: u32,
    pub num_iframes: u32,
    pub num_ref_frames: u32,
    pub b_pyramid: bool,
    pub fps_n: u32,
    pub fps_d: u32,
    pub profile: Profile,
    pub list0_cap: u32,
    pub list1_cap: u32,
}

/// Output of the GOP Planner: one finalised plan for the whole CVS.
#[derive(Debug, Clone)]
pub struct GopState {
    pub idr_period: u32,
    pub ip_period: u32,
    pub i_period: u32,
    pub num_bframes: u32,
    pub b_pyramid: bool,
    pub highest_pyramid_level: u32,
    pub ref_num_list0: u32,
    pub ref_num_list1: u32,
    pub log2_max_frame_num: u32,
    pub log2_max_pic_order_cnt_lsb: u32,
    pub max_frame_num: u32,
    pub max_pic_order_cnt: u32,
    pub num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
    pub max_num_ref_frames: u32,
    pub frame_map: Vec<GopFrameDescriptor>,
}

impl GopState {
    /// Runs the 12-step GOP construction algorithm (§4.A). Pure; this phase
    /// has no failure mode, only clamping.
    pub fn generate(config: &GopConfig) -> Self {
        let mut num_bframes = config.num_bframes;
        let mut idr_period = config.idr_period;
        let num_ref_frames = config.num_ref_frames;

        // Step 1.
        if config.profile == Profile::Baseline {
            num_bframes = 0;
        }

        // Step 2.
        if idr_period == 0 {
            idr_period = ((config.fps_n as u64 + config.fps_d as u64 - 1) / config.fps_d.max(1) as u64) as u32;
            idr_period = idr_period.max(1);
        }

        // Step 3.
        let max_b = if idr_period <= 8 {
            idr_period.saturating_sub(2)
        } else {
            (idr_period - 1) / 2
        };
        if num_bframes > max_b {
            log::debug!(
                "clamping num_bframes from {} to {} for idr_period {}",
                num_bframes,
                max_b,
                idr_period
            );
            num_bframes = max_b;
        }

        // Step 4.
        let list0_cap = config.list0_cap.min(num_ref_frames);
        let mut list1_cap = config.list1_cap.min(num_ref_frames);

        if config.list0_cap == 0 {
            return Self::intra_only(idr_period);
        }

        // Step 5.
        if num_ref_frames <= 1 || list1_cap == 0 {
            num_bframes = 0;
            list1_cap = 0;
        }

        // Step 6.
        let b_pyramid = config.b_pyramid && num_bframes > 0;
        if b_pyramid {
            list1_cap = 1;
        }

        let ip_period = num_bframes + 1;

        // Step 7.
        let mut gop_ref_num = (idr_period + num_bframes) / (num_bframes + 1);
        if idr_period > 1 {
            gop_ref_num += 1;
        }

        // Step 8.
        let (ref_num_list0, ref_num_list1, highest_pyramid_level) = if num_bframes == 0 {
            (num_ref_frames, 0, 0)
        } else if b_pyramid {
            let ref_num_list0 = num_ref_frames.saturating_sub(1).min(list0_cap);
            let mut level = 0u32;
            let mut remaining = num_bframes;
            while level + 3 < 16 && remaining > 1 {
                level += 1;
                remaining /= 2;
            }
            (ref_num_list0, 1, level)
        } else {
            let mut ref_num_list0 = num_ref_frames;
            let mut ref_num_list1 = 1u32;
            loop {
                if ref_num_list0 <= 1 {
                    break;
                }
                let fits = num_bframes.saturating_mul(ref_num_list1) <= 16
                    && ref_num_list1 <= gop_ref_num
                    && ref_num_list1 < list1_cap
                    && ref_num_list0 / ref_num_list1 > 4;
                if !fits {
                    break;
                }
                ref_num_list0 -= 1;
                ref_num_list1 += 1;
            }
            (ref_num_list0, ref_num_list1, 0)
        };

        let i_period = if config.num_iframes > 0 {
            (ip_period * (config.num_iframes + 1)).max(ip_period)
        } else {
            0
        };

        let frame_map = build_frame_map(
            idr_period,
            ip_period,
            i_period,
            config.num_iframes,
            highest_pyramid_level,
        );

        let log2_max_frame_num = smallest_log2_exceeding(idr_period);
        let log2_max_pic_order_cnt_lsb = log2_max_frame_num + 1;

        // These three follow the original's derivation order exactly: the
        // DPB size is driven off num_reorder_frames (itself driven off
        // ref_num_list1/the pyramid depth), and max_num_ref_frames falls out
        // of the DPB size, not the other way around.
        let num_reorder_frames = if num_bframes == 0 {
            0
        } else if b_pyramid {
            highest_pyramid_level + 1
        } else {
            ref_num_list1
        }
        .min(16);
        let max_dec_frame_buffering = (num_ref_frames + 1)
            .max(if b_pyramid {
                highest_pyramid_level + 2 + 1
            } else {
                num_reorder_frames + 1
            })
            .min(16);
        let max_num_ref_frames = max_dec_frame_buffering.saturating_sub(1);

        GopState {
            idr_period,
            ip_period,
            i_period,
            num_bframes,
            b_pyramid,
            highest_pyramid_level,
            ref_num_list0,
            ref_num_list1,
            log2_max_frame_num,
            log2_max_pic_order_cnt_lsb,
            max_frame_num: 1 << log2_max_frame_num,
            max_pic_order_cnt: 1 << log2_max_pic_order_cnt_lsb,
            num_reorder_frames,
            max_dec_frame_buffering,
            max_num_ref_frames,
            frame_map,
        }
    }

    fn intra_only(idr_period: u32) -> Self {
        let log2_max_frame_num = smallest_log2_exceeding(idr_period);
        let log2_max_pic_order_cnt_lsb = log2_max_frame_num + 2;

        let frame_map = (0..idr_period)
            .map(|_| GopFrameDescriptor::anchor(SliceType::I))
            .collect();

        GopState {
            idr_period,
            ip_period: 0,
            i_period: 0,
            num_bframes: 0,
            b_pyramid: false,
            highest_pyramid_level: 0,
            ref_num_list0: 0,
            ref_num_list1: 0,
            log2_max_frame_num,
            log2_max_pic_order_cnt_lsb,
            max_frame_num: 1 << log2_max_frame_num,
            max_pic_order_cnt: 1 << log2_max_pic_order_cnt_lsb,
            num_reorder_frames: 0,
            max_dec_frame_buffering: 2,
            max_num_ref_frames: 0,
            frame_map,
        }
    }
}

/// Step 11: smallest k >= 4 with 2^k > n.
fn smallest_log2_exceeding(n: u32) -> u32 {
    let mut k = 4u32;
    while (1u32 << k) <= n {
        k += 1;
    }
    k
}

fn build_frame_map(
    idr_period: u32,
    ip_period: u32,
    i_period: u32,
    num_iframes: u32,
    highest_pyramid_level: u32,
) -> Vec<GopFrameDescriptor> {
    let idr_period = idr_period as usize;
    let ip_period = ip_period.max(1) as usize;

    let mut map = vec![GopFrameDescriptor::anchor(SliceType::P); idr_period];
    map[0] = GopFrameDescriptor::anchor(SliceType::I);

    let force_last_p = idr_period > 1 && ip_period > 0;

    // Determine anchor positions (multiples of ip_period, plus position 0
    // and, when applicable, the forced last position).
    let mut is_anchor = vec![false; idr_period];
    is_anchor[0] = true;
    let mut i = 0usize;
    while i < idr_period {
        is_anchor[i] = true;
        i += ip_period;
    }
    if force_last_p {
        is_anchor[idr_period - 1] = true;
    }

    let mut i_frames_remaining = num_iframes;
    for pos in 1..idr_period {
        if !is_anchor[pos] {
            continue;
        }
        if pos == idr_period - 1 && force_last_p {
            map[pos] = GopFrameDescriptor::anchor(SliceType::P);
            continue;
        }
        if i_period > 0 && pos % (i_period as usize) == 0 && i_frames_remaining > 0 {
            map[pos] = GopFrameDescriptor::anchor(SliceType::I);
            i_frames_remaining -= 1;
        } else {
            map[pos] = GopFrameDescriptor::anchor(SliceType::P);
        }
    }

    // Fill every contiguous run of non-anchor positions with a recursively
    // pyramid-assigned run of B pictures (step 10). With highest_pyramid_level
    // == 0 the recursion bottoms out immediately and every B gets level 0,
    // which is exactly the plain-B (non-pyramid) case.
    let mut run_start: Option<usize> = None;
    for pos in 0..=idr_period {
        let is_boundary = pos == idr_period || is_anchor[pos];
        if is_boundary {
            if let Some(start) = run_start.take() {
                let len = pos - start;
                let run = &mut map[start..pos];
                assign_pyramid(run, 0, highest_pyramid_level);
            }
        } else if run_start.is_none() {
            run_start = Some(pos);
        }
    }

    map
}

/// Step 10: recursive divide-and-conquer pyramid assignment over a
/// contiguous run of B positions at the current level `level`, capped at
/// `max_level`.
fn assign_pyramid(run: &mut [GopFrameDescriptor], level: u32, max_level: u32) {
    let len = run.len();
    if len == 0 {
        return;
    }

    if level == max_level || len == 1 {
        // A true leaf of the pyramid tree: nothing else depends on it, so
        // it is never kept as a reference (this also covers the plain-B
        // case, where max_level == 0 and every B bottoms out immediately).
        for (i, frame) in run.iter_mut().enumerate() {
            *frame = GopFrameDescriptor {
                slice_type: SliceType::B,
                is_ref: false,
                pyramid_level: level,
                left_ref_poc_diff: -2 * (i as i32 + 1),
                right_ref_poc_diff: 2 * (len - i) as i32,
            };
        }
        return;
    }

    let mid = len / 2;
    run[mid] = GopFrameDescriptor {
        slice_type: SliceType::B,
        is_ref: true,
        pyramid_level: level,
        left_ref_poc_diff: -2 * (mid as i32 + 1),
        right_ref_poc_diff: 2 * (len - mid) as i32,
    };

    let (left, rest) = run.split_at_mut(mid);
    let (_, right) = rest.split_at_mut(1);
    assign_pyramid(left, level + 1, max_level);
    assign_pyramid(right, level + 1, max_level);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::parser::Profile;

    fn config(idr_period: u32, num_bframes: u32, b_pyramid: bool, num_ref_frames: u32) -> GopConfig {
        GopConfig {
            idr_period,
            num_bframes,
            num_iframes: 0,
            num_ref_frames,
            b_pyramid,
            fps_n: 30,
            fps_d: 1,
            profile: Profile::High,
            list0_cap: num_ref_frames.max(1),
            list1_cap: num_ref_frames.max(1),
        }
    }

    #[test]
    fn small_gop_no_b() {
        let state = GopState::generate(&config(4, 0, false, 1));
        let types: Vec<_> = state.frame_map.iter().map(|f| f.slice_type).collect();
        assert_eq!(types, vec![SliceType::I, SliceType::P, SliceType::P, SliceType::P]);
        assert!(state.frame_map.iter().all(|f| f.is_ref));
    }

    #[test]
    fn b_pyramid_of_three() {
        let state = GopState::generate(&config(8, 3, true, 4));
        let types: Vec<_> = state.frame_map.iter().map(|f| f.slice_type).collect();
        assert_eq!(
            types,
            vec![
                SliceType::I,
                SliceType::B,
                SliceType::B,
                SliceType::B,
                SliceType::P,
                SliceType::B,
                SliceType::B,
                SliceType::P,
            ]
        );

        // P2: the midpoint of each 3-long B run carries the lowest level.
        assert!(state.frame_map[2].pyramid_level < state.frame_map[1].pyramid_level);
        assert!(state.frame_map[2].pyramid_level < state.frame_map[3].pyramid_level);
    }

    #[test]
    fn intra_only_fallback() {
        let mut cfg = config(8, 2, false, 4);
        cfg.list0_cap = 0;
        let state = GopState::generate(&cfg);
        assert_eq!(state.ip_period, 0);
        assert!(state.frame_map.iter().all(|f| f.slice_type == SliceType::I));
        assert_eq!(state.ref_num_list0, 0);
        assert_eq!(state.ref_num_list1, 0);
        assert_eq!(state.max_dec_frame_buffering, 2);
    }

    #[test]
    fn p1_gop_invariants_hold_across_configs() {
        for idr_period in [1u32, 2, 4, 8, 16, 30] {
            for num_bframes in [0u32, 1, 2, 3, 7] {
                for b_pyramid in [false, true] {
                    let state = GopState::generate(&config(idr_period, num_bframes, b_pyramid, 4));
                    assert_eq!(state.frame_map[0].slice_type, SliceType::I);
                    assert!(state.frame_map[0].is_ref);

                    if idr_period > 1 && state.ip_period > 0 {
                        let last = state.frame_map.last().unwrap();
                        assert_eq!(last.slice_type, SliceType::P);
                        assert!(last.is_ref);
                    }

                    for frame in &state.frame_map {
                        if frame.slice_type == SliceType::B {
                            assert!(frame.pyramid_level <= state.highest_pyramid_level);
                        }
                    }
                }
            }
        }
    }
}
