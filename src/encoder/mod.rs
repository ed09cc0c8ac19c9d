// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::FrameLayout;
use crate::Resolution;

pub mod stateless;

/// Per-input-frame metadata supplied by the caller alongside the opaque
/// frame handle.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    pub display_resolution: Resolution,
    pub layout: FrameLayout,
    pub force_keyframe: bool,
    pub timestamp: u64,
}

/// A coded NAL payload ready for the output sink, in encode order, paired
/// with the metadata of the input frame it was produced from.
#[derive(Debug, Clone, PartialEq)]
pub struct CodedBitstreamBuffer {
    pub metadata: FrameMetadata,
    pub bitstream: Vec<u8>,
}

impl CodedBitstreamBuffer {
    pub fn new(metadata: FrameMetadata, bitstream: Vec<u8>) -> Self {
        Self { metadata, bitstream }
    }
}
