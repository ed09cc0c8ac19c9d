// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! [`EncoderFrame`], the per-picture bookkeeping record threaded through
//! ReorderList, RefList, and OutputList (§3).

use crate::encoder::stateless::h264::gop::GopFrameDescriptor;
use crate::encoder::FrameMetadata;

/// Attached one-to-one to each input picture accepted by the encoder (§3).
#[derive(Debug, Clone)]
pub struct EncoderFrame<P> {
    pub gop_type: GopFrameDescriptor,
    pub gop_position: u32,
    pub gop_frame_num: u32,
    pub poc: u32,
    pub idr_pic_id: u32,
    pub force_idr: bool,
    pub last_frame: bool,
    pub meta: FrameMetadata,
    pub picture: P,
}

impl<P> EncoderFrame<P> {
    pub fn is_idr(&self) -> bool {
        self.gop_position == 0 || self.force_idr
    }

    pub fn frame_num(&self) -> u32 {
        self.gop_frame_num
    }
}
