// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! NAL unit header bookkeeping. Bit-level emulation-prevention and Exp-Golomb
//! packing are treated as opaque helper concerns (see [`super::synthesizer`])
//! -- this module only carries the header fields the core needs to reason
//! about ordering and priority.

/// `nal_unit_type` values relevant to this encoder base (Annex A/B, Table 7-1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    Unspecified,
    Slice,
    SliceDpa,
    SliceIdr,
    Sei,
    Sps,
    Pps,
    AccessUnitDelimiter,
    FillerData,
}

impl NaluType {
    pub fn id(self) -> u8 {
        match self {
            NaluType::Unspecified => 0,
            NaluType::Slice => 1,
            NaluType::SliceDpa => 2,
            NaluType::SliceIdr => 5,
            NaluType::Sei => 6,
            NaluType::Sps => 7,
            NaluType::Pps => 8,
            NaluType::AccessUnitDelimiter => 9,
            NaluType::FillerData => 12,
        }
    }

    fn from_id(id: u8) -> Self {
        match id {
            1 => NaluType::Slice,
            2 => NaluType::SliceDpa,
            5 => NaluType::SliceIdr,
            6 => NaluType::Sei,
            7 => NaluType::Sps,
            8 => NaluType::Pps,
            9 => NaluType::AccessUnitDelimiter,
            12 => NaluType::FillerData,
            _ => NaluType::Unspecified,
        }
    }
}

/// The one-byte NAL header: `forbidden_zero_bit` is always 0 and is not
/// represented here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluHeader {
    pub nal_ref_idc: u8,
    pub nal_unit_type: NaluType,
}

impl NaluHeader {
    pub fn new(nal_ref_idc: u8, nal_unit_type: NaluType) -> Self {
        Self {
            nal_ref_idc,
            nal_unit_type,
        }
    }
}

/// A synthesized NAL unit: header plus opaque RBSP payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nalu {
    pub header: NaluHeader,
    pub rbsp: Vec<u8>,
}

/// Start code used between NAL units in an Annex B byte stream. Kept in
/// sync with [`super::synthesizer`]'s writer.
const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

impl Nalu {
    /// Reads the next NAL unit out of an Annex B byte stream. This is a
    /// thin, opaque-boundary reader matching [`super::synthesizer`]'s
    /// simplified writer: the RBSP is delimited by the next start code (or
    /// end of buffer), not by an explicit length field.
    pub fn next(cursor: &mut std::io::Cursor<&[u8]>) -> std::io::Result<Nalu> {
        use std::io::Error;
        use std::io::ErrorKind;

        let data = *cursor.get_ref();
        let pos = cursor.position() as usize;

        if pos + 5 > data.len() || data[pos..pos + 4] != START_CODE {
            return Err(Error::new(ErrorKind::UnexpectedEof, "no more NAL units"));
        }

        let header_byte = data[pos + 4];
        let header = NaluHeader::new(header_byte >> 5, NaluType::from_id(header_byte & 0x1f));

        let rbsp_start = pos + 5;
        let mut end = data.len();
        let mut i = rbsp_start;
        while i + 4 <= data.len() {
            if data[i..i + 4] == START_CODE {
                end = i;
                break;
            }
            i += 1;
        }

        let rbsp = data[rbsp_start..end].to_vec();
        cursor.set_position(end as u64);

        Ok(Nalu { header, rbsp })
    }
}
