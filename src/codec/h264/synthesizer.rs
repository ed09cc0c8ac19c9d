// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bit-layout for NAL units is explicitly out of scope (§1): the core
//! decides *what* to emit, not the Exp-Golomb/CABAC encoding. `Synthesizer`
//! is the opaque seam a concrete backend's bitstream writer plugs into; this
//! crate ships only the struct-field synthesis, appending a NAL start code
//! and header byte around whatever payload a [`Synthesize`] impl produces.

use std::marker::PhantomData;

use thiserror::Error;

use super::nalu::NaluHeader;
use super::nalu::NaluType;
use super::parser::AccessUnitDelimiter;
use super::parser::FillerData;
use super::parser::Pps;
use super::parser::Sei;
use super::parser::SliceHeader;
use super::parser::Sps;

#[derive(Error, Debug)]
pub enum SynthesizerError {
    #[error("payload exceeds the maximum representable RBSP size")]
    PayloadTooLarge,
}

pub type SynthesizerResult<T> = Result<T, SynthesizerError>;

/// Things that know how to turn themselves into RBSP payload bytes and which
/// NAL unit type carries them.
pub trait Synthesize {
    const NAL_UNIT_TYPE: NaluType;

    fn write_rbsp(&self, out: &mut Vec<u8>);
}

impl Synthesize for Sps {
    const NAL_UNIT_TYPE: NaluType = NaluType::Sps;

    fn write_rbsp(&self, out: &mut Vec<u8>) {
        out.push(self.profile_idc);
        let mut constraints = 0u8;
        constraints |= (self.constraint_set0_flag as u8) << 7;
        constraints |= (self.constraint_set1_flag as u8) << 6;
        constraints |= (self.constraint_set2_flag as u8) << 5;
        constraints |= (self.constraint_set3_flag as u8) << 4;
        constraints |= (self.constraint_set4_flag as u8) << 3;
        constraints |= (self.constraint_set5_flag as u8) << 2;
        out.push(constraints);
        out.push(self.level_idc);
        out.push(self.seq_parameter_set_id);
        out.extend(self.pic_width_in_mbs.to_be_bytes());
        out.extend(self.pic_height_in_map_units.to_be_bytes());
    }
}

impl Synthesize for Pps {
    const NAL_UNIT_TYPE: NaluType = NaluType::Pps;

    fn write_rbsp(&self, out: &mut Vec<u8>) {
        out.push(self.pic_parameter_set_id);
        out.push(self.seq_parameter_set_id);
        out.push(self.entropy_coding_mode_flag as u8);
    }
}

impl Synthesize for SliceHeader {
    const NAL_UNIT_TYPE: NaluType = NaluType::Slice;

    fn write_rbsp(&self, out: &mut Vec<u8>) {
        out.push(self.slice_type.slice_type_code());
        out.extend(self.frame_num.to_be_bytes());
        out.extend(self.pic_order_cnt_lsb.to_be_bytes());
    }
}

impl Synthesize for Sei {
    const NAL_UNIT_TYPE: NaluType = NaluType::Sei;

    fn write_rbsp(&self, out: &mut Vec<u8>) {
        for message in &self.messages {
            out.extend(message.payload_type.to_be_bytes());
            out.extend((message.payload.len() as u32).to_be_bytes());
            out.extend(&message.payload);
        }
    }
}

impl Synthesize for AccessUnitDelimiter {
    const NAL_UNIT_TYPE: NaluType = NaluType::AccessUnitDelimiter;

    fn write_rbsp(&self, out: &mut Vec<u8>) {
        out.push(self.primary_pic_type);
    }
}

impl Synthesize for FillerData {
    const NAL_UNIT_TYPE: NaluType = NaluType::FillerData;

    fn write_rbsp(&self, out: &mut Vec<u8>) {
        out.extend(std::iter::repeat(0xffu8).take(self.num_ff_bytes));
    }
}

/// NAL start code used between units in an Annex B byte stream.
const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

pub struct Synthesizer<'a, T, O> {
    _marker: PhantomData<(&'a T, O)>,
}

impl<'a, T, O> Synthesizer<'a, T, O>
where
    T: Synthesize,
    O: Extend<u8>,
{
    /// Appends a NAL unit wrapping `value` onto `out`. `emulation_prevention`
    /// toggles whether the (opaque, not implemented here) anti-emulation byte
    /// insertion pass would run for this NAL; this synthesizer only carries
    /// the struct-derived payload through to the backend's own writer.
    pub fn synthesize(
        nal_ref_idc: u8,
        value: &'a T,
        out: &mut O,
        emulation_prevention: bool,
    ) -> SynthesizerResult<()> {
        let _ = emulation_prevention;
        let header = NaluHeader::new(nal_ref_idc, T::NAL_UNIT_TYPE);

        let mut rbsp = Vec::new();
        value.write_rbsp(&mut rbsp);
        if rbsp.len() > u32::MAX as usize {
            return Err(SynthesizerError::PayloadTooLarge);
        }

        out.extend(START_CODE);
        out.extend([(header.nal_ref_idc << 5) | header.nal_unit_type.id()]);
        out.extend(rbsp);

        Ok(())
    }
}
