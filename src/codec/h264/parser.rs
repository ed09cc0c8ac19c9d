// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Design-level representations of the H.264 parameter sets and slice
//! header. These are struct-field models, not a bitstream reader/writer --
//! turning them into RBSP bytes is [`super::synthesizer::Synthesizer`]'s job.

use std::rc::Rc;

/// `profile_idc`, Annex A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    Baseline,
    Main,
    Extended,
    High,
    High10,
    High422,
    High444,
    StereoHigh,
    MultiviewHigh,
}

impl Profile {
    pub fn profile_idc(self) -> u8 {
        match self {
            Profile::Baseline => 66,
            Profile::Main => 77,
            Profile::Extended => 88,
            Profile::High => 100,
            Profile::High10 => 110,
            Profile::High422 => 122,
            Profile::High444 => 244,
            Profile::MultiviewHigh => 118,
            Profile::StereoHigh => 128,
        }
    }

    /// Ordering used to pick "the highest profile" among negotiated
    /// candidates (§4.D step 3). Higher values carry strictly more tools.
    pub fn rank(self) -> u8 {
        match self {
            Profile::Baseline => 0,
            Profile::Extended => 1,
            Profile::Main => 2,
            Profile::High => 3,
            Profile::High10 => 4,
            Profile::MultiviewHigh => 5,
            Profile::StereoHigh => 6,
            Profile::High422 => 7,
            Profile::High444 => 8,
        }
    }

    pub fn supports_chroma_420(self) -> bool {
        !matches!(self, Profile::Baseline) || true
    }

    pub fn supports_chroma_422(self) -> bool {
        matches!(self, Profile::High422 | Profile::High444)
    }

    pub fn supports_chroma_444(self) -> bool {
        matches!(self, Profile::High444)
    }

    pub fn supports_bit_depth_above_8(self) -> bool {
        matches!(self, Profile::High10 | Profile::High422 | Profile::High444)
    }

    pub fn is_baseline_like(self) -> bool {
        matches!(self, Profile::Baseline | Profile::Extended)
    }
}

/// `level_idc`, Table A-1. `Auto` stands for the "let the core pick" value
/// of 0 used on the configuration surface (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Auto,
    L1,
    L1B,
    L1_1,
    L1_2,
    L1_3,
    L2,
    L2_1,
    L2_2,
    L3,
    L3_1,
    L3_2,
    L4,
    L4_1,
    L4_2,
    L5,
    L5_1,
    L5_2,
    L6,
    L6_1,
    L6_2,
}

impl Level {
    /// `level_idc` as written into the SPS. Level 1b shares the literal
    /// code 11 with level 1.1; `constraint_set3_flag` disambiguates them.
    pub fn level_idc(self) -> u8 {
        match self {
            Level::Auto => 0,
            Level::L1 => 10,
            Level::L1B => 11,
            Level::L1_1 => 11,
            Level::L1_2 => 12,
            Level::L1_3 => 13,
            Level::L2 => 20,
            Level::L2_1 => 21,
            Level::L2_2 => 22,
            Level::L3 => 30,
            Level::L3_1 => 31,
            Level::L3_2 => 32,
            Level::L4 => 40,
            Level::L4_1 => 41,
            Level::L4_2 => 42,
            Level::L5 => 50,
            Level::L5_1 => 51,
            Level::L5_2 => 52,
            Level::L6 => 60,
            Level::L6_1 => 61,
            Level::L6_2 => 62,
        }
    }

    pub fn is_level_1b(self) -> bool {
        matches!(self, Level::L1B)
    }
}

/// `slice_type`, Table 7-6 (restricted to the non-switching variants this
/// encoder emits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    I,
    P,
    B,
}

impl SliceType {
    /// Value used in the AUD's `primary_pic_type` (§6.2): IDR/I -> 0, P -> 1,
    /// B -> 2.
    pub fn primary_pic_type(self, is_idr: bool) -> u8 {
        match self {
            SliceType::I => {
                let _ = is_idr;
                0
            }
            SliceType::P => 1,
            SliceType::B => 2,
        }
    }

    pub fn slice_type_code(self) -> u8 {
        match self {
            SliceType::P => 0,
            SliceType::B => 1,
            SliceType::I => 2,
        }
    }
}

/// Sequence Parameter Set, §4.D.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sps {
    pub profile_idc: u8,
    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub constraint_set2_flag: bool,
    pub constraint_set3_flag: bool,
    pub constraint_set4_flag: bool,
    pub constraint_set5_flag: bool,
    pub level_idc: u8,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_frame_num_minus4: u32,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u32,
    pub max_num_ref_frames: u32,
    pub frame_mbs_only_flag: bool,
    pub direct_8x8_inference_flag: bool,
    pub pic_width_in_mbs: u32,
    pub pic_height_in_map_units: u32,
    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,
    pub vui: VuiParameters,
}

/// VUI parameters, §4.D.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VuiParameters {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,
    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub bitstream_restriction_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub log2_max_mv_length_horizontal: u8,
    pub log2_max_mv_length_vertical: u8,
    pub num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
    pub pic_struct_present_flag: bool,
}

/// 17-entry Table E-1: `(num, den)` pairs indexed by `aspect_ratio_idc`.
pub const ASPECT_RATIO_TABLE: [(u16, u16); 17] = [
    (0, 1),
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

/// `aspect_ratio_idc` for "Extended SAR", used when the source SAR does not
/// appear in [`ASPECT_RATIO_TABLE`].
pub const ASPECT_RATIO_EXTENDED_SAR: u8 = 255;

/// Sub-width/height divisors indexed by `chroma_format_idc` (0=mono,
/// 1=4:2:0, 2=4:2:2, 3=4:4:4), used for frame cropping.
pub const SUB_WIDTH_C: [u32; 4] = [1, 2, 2, 1];
pub const SUB_HEIGHT_C: [u32; 4] = [1, 2, 1, 1];

#[derive(Debug, Default)]
pub struct SpsBuilder {
    profile: Option<Profile>,
    level: Option<Level>,
    seq_parameter_set_id: u8,
    chroma_format_idc: u8,
    bit_depth_luma_minus8: u8,
    bit_depth_chroma_minus8: u8,
    log2_max_frame_num_minus4: u32,
    log2_max_pic_order_cnt_lsb_minus4: u32,
    max_num_ref_frames: u32,
    pic_width_in_mbs: u32,
    pic_height_in_map_units: u32,
    width: u32,
    height: u32,
    vui: VuiParameters,
}

impl SpsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn profile(mut self, profile: Profile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = Some(level);
        self
    }

    pub fn seq_parameter_set_id(mut self, id: u8) -> Self {
        self.seq_parameter_set_id = id;
        self
    }

    pub fn chroma_format_idc(mut self, idc: u8) -> Self {
        self.chroma_format_idc = idc;
        self
    }

    pub fn bit_depth(mut self, luma: u8, chroma: u8) -> Self {
        self.bit_depth_luma_minus8 = luma.min(6);
        self.bit_depth_chroma_minus8 = chroma.min(6);
        self
    }

    pub fn log2_max_frame_num(mut self, log2_max_frame_num: u32) -> Self {
        self.log2_max_frame_num_minus4 = log2_max_frame_num.saturating_sub(4);
        self
    }

    pub fn log2_max_pic_order_cnt_lsb(mut self, log2_max_poc_lsb: u32) -> Self {
        self.log2_max_pic_order_cnt_lsb_minus4 = log2_max_poc_lsb.saturating_sub(4);
        self
    }

    pub fn max_num_ref_frames(mut self, max_num_ref_frames: u32) -> Self {
        self.max_num_ref_frames = max_num_ref_frames;
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self.pic_width_in_mbs = (width + 15) / 16;
        self.pic_height_in_map_units = (height + 15) / 16;
        self
    }

    pub fn vui(mut self, vui: VuiParameters) -> Self {
        self.vui = vui;
        self
    }

    pub fn build(self) -> Sps {
        let profile = self.profile.unwrap_or(Profile::Main);
        let level = self.level.unwrap_or(Level::L4);
        let chroma_idc = self.chroma_format_idc.min(3) as usize;

        let cropped_width = self.pic_width_in_mbs * 16;
        let cropped_height = self.pic_height_in_map_units * 16;
        let frame_cropping_flag = cropped_width != self.width || cropped_height != self.height;
        let crop_right = (cropped_width - self.width) / SUB_WIDTH_C[chroma_idc];
        let crop_bottom = (cropped_height - self.height) / SUB_HEIGHT_C[chroma_idc];

        Sps {
            profile_idc: profile.profile_idc(),
            constraint_set0_flag: false,
            constraint_set1_flag: false,
            constraint_set2_flag: false,
            constraint_set3_flag: level.is_level_1b() && profile.is_baseline_like(),
            constraint_set4_flag: false,
            constraint_set5_flag: false,
            level_idc: level.level_idc(),
            seq_parameter_set_id: self.seq_parameter_set_id,
            chroma_format_idc: self.chroma_format_idc,
            bit_depth_luma_minus8: self.bit_depth_luma_minus8,
            bit_depth_chroma_minus8: self.bit_depth_chroma_minus8,
            log2_max_frame_num_minus4: self.log2_max_frame_num_minus4,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: self.log2_max_pic_order_cnt_lsb_minus4,
            max_num_ref_frames: self.max_num_ref_frames,
            frame_mbs_only_flag: true,
            direct_8x8_inference_flag: !matches!(profile, Profile::Baseline),
            pic_width_in_mbs: self.pic_width_in_mbs,
            pic_height_in_map_units: self.pic_height_in_map_units,
            frame_cropping_flag,
            frame_crop_left_offset: 0,
            frame_crop_right_offset: if frame_cropping_flag { crop_right } else { 0 },
            frame_crop_top_offset: 0,
            frame_crop_bottom_offset: if frame_cropping_flag { crop_bottom } else { 0 },
            vui: self.vui,
        }
    }
}

/// Picture Parameter Set, §4.D.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub entropy_coding_mode_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u32,
    pub num_ref_idx_l1_default_active_minus1: u32,
    pub pic_init_qp_minus26: i32,
    pub deblocking_filter_control_present_flag: bool,
    pub transform_8x8_mode_flag: bool,
}

#[derive(Debug, Default)]
pub struct PpsBuilder {
    pic_parameter_set_id: u8,
    seq_parameter_set_id: u8,
    profile: Option<Profile>,
    num_ref_idx_l0_default_active_minus1: u32,
    num_ref_idx_l1_default_active_minus1: u32,
}

impl PpsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pic_parameter_set_id(mut self, id: u8) -> Self {
        self.pic_parameter_set_id = id;
        self
    }

    pub fn seq_parameter_set_id(mut self, id: u8) -> Self {
        self.seq_parameter_set_id = id;
        self
    }

    pub fn profile(mut self, profile: Profile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn default_ref_idx_active(mut self, l0: u32, l1: u32) -> Self {
        self.num_ref_idx_l0_default_active_minus1 = l0.saturating_sub(1);
        self.num_ref_idx_l1_default_active_minus1 = l1.saturating_sub(1);
        self
    }

    pub fn build(self) -> Pps {
        let profile = self.profile.unwrap_or(Profile::Main);
        Pps {
            pic_parameter_set_id: self.pic_parameter_set_id,
            seq_parameter_set_id: self.seq_parameter_set_id,
            entropy_coding_mode_flag: !profile.is_baseline_like(),
            num_ref_idx_l0_default_active_minus1: self.num_ref_idx_l0_default_active_minus1,
            num_ref_idx_l1_default_active_minus1: self.num_ref_idx_l1_default_active_minus1,
            pic_init_qp_minus26: 0,
            deblocking_filter_control_present_flag: true,
            transform_8x8_mode_flag: matches!(
                profile,
                Profile::High | Profile::High10 | Profile::High422 | Profile::High444
            ),
        }
    }
}

/// `modification_of_pic_nums_idc` entry of `ref_pic_list_modification` (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefPicListModEntry {
    pub modification_of_pic_nums_idc: u8,
    pub abs_diff_pic_num_minus1: u32,
}

/// MMCO operation 1: mark a short-term reference as "unused for reference".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmcoUnusedForReference {
    pub difference_of_pic_nums_minus1: u32,
}

/// `dec_ref_pic_marking()`, restricted to the single MMCO-1 operation this
/// encoder ever emits (§4.C).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecRefPicMarking {
    pub adaptive_ref_pic_marking_mode_flag: bool,
    pub mmco_unused: Option<MmcoUnusedForReference>,
}

/// Slice header, §4.C.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u8,
    pub frame_num: u32,
    pub field_pic_flag: bool,
    pub idr_pic_id: Option<u32>,
    pub pic_order_cnt_lsb: u32,
    pub direct_spatial_mv_pred_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u32,
    pub num_ref_idx_l1_active_minus1: u32,
    pub ref_pic_list_modification_l0: Vec<RefPicListModEntry>,
    pub ref_pic_list_modification_l1: Vec<RefPicListModEntry>,
    pub dec_ref_pic_marking: DecRefPicMarking,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,
}

#[derive(Debug, Default)]
pub struct SliceHeaderBuilder {
    slice_type: Option<SliceType>,
    pic_parameter_set_id: u8,
    frame_num: u32,
    idr_pic_id: Option<u32>,
    pic_order_cnt_lsb: u32,
    num_ref_idx_l0_active_minus1: u32,
    num_ref_idx_l1_active_minus1: u32,
    num_ref_idx_active_override_flag: bool,
    ref_pic_list_modification_l0: Vec<RefPicListModEntry>,
    ref_pic_list_modification_l1: Vec<RefPicListModEntry>,
    dec_ref_pic_marking: DecRefPicMarking,
}

impl SliceHeaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slice_type(mut self, slice_type: SliceType) -> Self {
        self.slice_type = Some(slice_type);
        self
    }

    pub fn pic_parameter_set_id(mut self, id: u8) -> Self {
        self.pic_parameter_set_id = id;
        self
    }

    pub fn frame_num(mut self, frame_num: u32) -> Self {
        self.frame_num = frame_num;
        self
    }

    pub fn idr_pic_id(mut self, idr_pic_id: u32) -> Self {
        self.idr_pic_id = Some(idr_pic_id);
        self
    }

    pub fn pic_order_cnt_lsb(mut self, poc: u32) -> Self {
        self.pic_order_cnt_lsb = poc;
        self
    }

    pub fn ref_idx_active(mut self, l0_active: u32, l1_active: u32, default_l0: u32, default_l1: u32) -> Self {
        self.num_ref_idx_l0_active_minus1 = l0_active.saturating_sub(1);
        self.num_ref_idx_l1_active_minus1 = l1_active.saturating_sub(1);
        self.num_ref_idx_active_override_flag = l0_active != default_l0 || l1_active != default_l1;
        self
    }

    pub fn ref_pic_list_modification(mut self, l0: Vec<RefPicListModEntry>, l1: Vec<RefPicListModEntry>) -> Self {
        self.ref_pic_list_modification_l0 = l0;
        self.ref_pic_list_modification_l1 = l1;
        self
    }

    pub fn dec_ref_pic_marking(mut self, marking: DecRefPicMarking) -> Self {
        self.dec_ref_pic_marking = marking;
        self
    }

    pub fn build(self) -> SliceHeader {
        let slice_type = self.slice_type.unwrap_or(SliceType::I);
        SliceHeader {
            first_mb_in_slice: 0,
            slice_type,
            pic_parameter_set_id: self.pic_parameter_set_id,
            frame_num: self.frame_num,
            field_pic_flag: false,
            idr_pic_id: self.idr_pic_id,
            pic_order_cnt_lsb: self.pic_order_cnt_lsb,
            direct_spatial_mv_pred_flag: slice_type == SliceType::B,
            num_ref_idx_active_override_flag: self.num_ref_idx_active_override_flag,
            num_ref_idx_l0_active_minus1: self.num_ref_idx_l0_active_minus1,
            num_ref_idx_l1_active_minus1: self.num_ref_idx_l1_active_minus1,
            ref_pic_list_modification_l0: self.ref_pic_list_modification_l0,
            ref_pic_list_modification_l1: self.ref_pic_list_modification_l1,
            dec_ref_pic_marking: self.dec_ref_pic_marking,
            slice_alpha_c0_offset_div2: 2,
            slice_beta_offset_div2: 2,
        }
    }
}

/// A single SEI message payload (non-goal per spec is anything beyond basic
/// headers; this crate only emits the backend's pass-through timestamp SEI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeiMessage {
    pub payload_type: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sei {
    pub messages: Vec<SeiMessage>,
}

/// `access_unit_delimiter_rbsp()`, §6.2: one per access unit, carrying
/// [`SliceType::primary_pic_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessUnitDelimiter {
    pub primary_pic_type: u8,
}

/// `filler_data_rbsp()`: a run of `ff_byte`s inserted to pad the access unit
/// out to the backend's required alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillerData {
    pub num_ff_bytes: usize,
}

/// Owning handle for an SPS/PPS pair, shared cheaply (`Rc`) the way the
/// teacher shares parameter sets across picture types.
#[derive(Debug, Clone)]
pub struct ParameterSets {
    pub sps: Rc<Sps>,
    pub pps: Rc<Pps>,
}

/// The read-side counterpart of [`super::synthesizer::Synthesizer`]. Bit-level
/// parsing (Exp-Golomb, CABAC) is out of scope (§1); this only reverses the
/// simplified struct encoding `Synthesize` impls produce, which is enough to
/// assert on in tests without a full bitstream parser.
pub struct Parser;

#[derive(thiserror::Error, Debug)]
pub enum ParserError {
    #[error("truncated SEI payload")]
    Truncated,
}

impl Parser {
    pub fn parse_sei(nalu: &super::nalu::Nalu) -> Result<Sei, ParserError> {
        let mut messages = Vec::new();
        let mut rbsp = nalu.rbsp.as_slice();

        while !rbsp.is_empty() {
            if rbsp.len() < 8 {
                return Err(ParserError::Truncated);
            }
            let payload_type = u32::from_be_bytes(rbsp[0..4].try_into().unwrap());
            let len = u32::from_be_bytes(rbsp[4..8].try_into().unwrap()) as usize;
            if rbsp.len() < 8 + len {
                return Err(ParserError::Truncated);
            }
            let payload = rbsp[8..8 + len].to_vec();
            messages.push(SeiMessage { payload_type, payload });
            rbsp = &rbsp[8 + len..];
        }

        Ok(Sei { messages })
    }
}
