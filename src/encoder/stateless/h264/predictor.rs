// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wires the GOP Planner, Frame Queue & Reorderer, Reference Manager, and
//! Parameter-Set Builder together into the single decision-making unit the
//! Encoder Context drives per frame: "what, if anything, should be
//! submitted to the backend next". Plays the role the teacher's
//! `LowDelay`/`GroupOfPictures` predictors played, generalized to the full
//! GOP algorithm of §4.A-§4.D instead of a fixed low-delay or simple-GOP
//! shape.

use std::cell::RefCell;
use std::rc::Rc;

use log::trace;

use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::Sps;
use crate::encoder::stateless::h264::frame::EncoderFrame;
use crate::encoder::stateless::h264::gop::GopConfig;
use crate::encoder::stateless::h264::gop::GopState;
use crate::encoder::stateless::h264::paramset;
use crate::encoder::stateless::h264::reorder::Reorderer;
use crate::encoder::stateless::h264::refman::ReferenceManager;
use crate::encoder::stateless::h264::BackendRequest;
use crate::encoder::stateless::h264::DpbEntry;
use crate::encoder::stateless::h264::DpbEntryMeta;
use crate::encoder::stateless::h264::EncoderConfig;
use crate::encoder::stateless::h264::IsReference;
use crate::encoder::stateless::EncodeError;
use crate::encoder::stateless::EncodeResult;
use crate::encoder::stateless::FrameMetadata;

/// What the encoder context should do after a state transition: nothing
/// yet, or submit a batch of fully-assembled [`BackendRequest`]s.
pub enum PredictorVerdict<P, R> {
    NoOperation,
    Request { requests: Vec<BackendRequest<P, R>> },
}

/// The decision-making core shared by every prediction structure: owns the
/// GOP plan, the display-order reorder queue, and the DPB, and turns
/// accepted pictures into backend requests in encode order.
pub trait Predictor<P, R> {
    fn new_frame(&mut self, picture: P, meta: FrameMetadata) -> EncodeResult<PredictorVerdict<P, R>>;

    fn reconstructed(&mut self, recon: DpbEntry<R>) -> EncodeResult<PredictorVerdict<P, R>>;

    fn drain(&mut self) -> EncodeResult<Vec<BackendRequest<P, R>>>;
}

/// A pending request's bookkeeping, kept around so that once the backend's
/// reconstructed-picture promise resolves we know how to apply §4.C step 3's
/// eviction decision and whether the frame is a reference at all.
struct PendingInsertion {
    victim_index: Option<usize>,
}

/// GOP-plan-driven [`Predictor`]: the sole implementation this crate ships,
/// since the GOP Planner (§4.A) already generalizes low-delay (all-P,
/// `num_bframes == 0`) and fixed-structure GOPs under one algorithm.
pub struct GopPredictor<P, R> {
    gop: Rc<GopState>,
    reorderer: Reorderer<P>,
    refman: ReferenceManager<R>,
    config: Rc<EncoderConfig>,
    profile: crate::codec::h264::parser::Profile,
    level: crate::codec::h264::parser::Level,
    sps: Rc<Sps>,
    pps: Rc<Pps>,
    override_gate: paramset::OverrideGate,
    pending: std::collections::VecDeque<PendingInsertion>,
}

impl<P, R> GopPredictor<P, R> {
    pub fn new(config: EncoderConfig) -> EncodeResult<Self> {
        let gop_config = GopConfig {
            idr_period: config.idr_period,
            num_bframes: config.num_bframes,
            num_iframes: config.num_iframes,
            num_ref_frames: config.num_ref_frames,
            b_pyramid: config.b_pyramid,
            fps_n: config.framerate,
            fps_d: 1,
            profile: config.profile,
            list0_cap: config.list0_cap,
            list1_cap: config.list1_cap,
        };
        let gop = Rc::new(GopState::generate(&gop_config));

        let level = paramset::resolve_level(
            config.profile,
            config.level,
            config.bitrate.target(),
            config.resolution,
            config.framerate,
            1,
            gop.max_dec_frame_buffering,
        )?;

        let (sps, pps) = paramset::build_parameter_sets(config.profile, level, config.resolution, &gop);

        let frame_duration = if config.framerate == 0 {
            1
        } else {
            1_000_000_000i64 / config.framerate as i64
        };

        Ok(Self {
            reorderer: Reorderer::new(gop.clone(), frame_duration),
            refman: ReferenceManager::new(gop.clone()),
            gop,
            profile: config.profile,
            level,
            config: Rc::new(config),
            sps: Rc::new(sps),
            pps: Rc::new(pps),
            override_gate: paramset::OverrideGate::new(),
            pending: Default::default(),
        })
    }

    pub fn profile(&self) -> crate::codec::h264::parser::Profile {
        self.profile
    }

    pub fn level(&self) -> crate::codec::h264::parser::Level {
        self.level
    }

    pub fn sps(&self) -> &Sps {
        &self.sps
    }

    pub fn pps(&self) -> &Pps {
        &self.pps
    }

    /// §4.D override protocol: accept the backend's one-shot SPS/PPS
    /// replacement.
    pub fn apply_override(&mut self, overridden: (Sps, Pps)) {
        let current = ((*self.sps).clone(), (*self.pps).clone());
        let (sps, pps) = self.override_gate.apply(current, Some(overridden));
        self.sps = Rc::new(sps);
        self.pps = Rc::new(pps);
    }

    fn drain_ready(&mut self, end_of_stream: bool) -> Vec<BackendRequest<P, R>>
    where
        P: Clone,
    {
        let mut requests = Vec::new();
        loop {
            let refman = &self.refman;
            let popped = self
                .reorderer
                .pop(end_of_stream, |poc| refman.count_with_poc_greater_than(poc));
            match popped {
                Some(frame) => requests.push(self.build_request(frame)),
                None => break,
            }
        }
        requests
    }

    fn build_request(&mut self, frame: Rc<RefCell<EncoderFrame<P>>>) -> BackendRequest<P, R>
    where
        P: Clone,
    {
        let frame = frame.borrow();
        let slice_type = frame.gop_type.slice_type;
        let (l0, l1) = self.refman.build_lists(frame.poc, slice_type);

        let eviction = self.refman.maybe_mark_eviction(frame.gop_type.is_ref, slice_type);
        let victim_index = eviction.as_ref().map(|e| e.victim_index);
        let explicit_unmark_frame_num = eviction.and_then(|e| e.explicit_unmark_frame_num);

        let header = self.refman.synthesize_slice_header(
            self.pps.pic_parameter_set_id,
            slice_type,
            frame.frame_num(),
            frame.poc,
            frame.is_idr(),
            frame.idr_pic_id,
            &l0,
            &l1,
            explicit_unmark_frame_num,
        );

        let dpb_meta = DpbEntryMeta {
            poc: frame.poc as u16,
            frame_num: frame.frame_num(),
            is_reference: if frame.gop_type.is_ref {
                IsReference::ShortTerm
            } else {
                IsReference::No
            },
            slice_type,
        };

        trace!(
            "submitting frame_num={} poc={} slice_type={:?} is_idr={}",
            frame.frame_num(),
            frame.poc,
            slice_type,
            frame.is_idr()
        );

        self.pending.push_back(PendingInsertion { victim_index });

        BackendRequest {
            sps: self.sps.clone(),
            pps: self.pps.clone(),
            header,
            input: frame.picture.clone(),
            input_meta: frame.meta.clone(),
            dpb_meta,
            ref_list_0: l0,
            ref_list_1: l1,
            num_macroblocks: self.config.resolution.mbs() as usize,
            is_idr: frame.is_idr(),
            config: self.config.clone(),
            coded_output: Vec::new(),
        }
    }
}

impl<P, R> Predictor<P, R> for GopPredictor<P, R>
where
    P: Clone,
{
    fn new_frame(&mut self, picture: P, meta: FrameMetadata) -> EncodeResult<PredictorVerdict<P, R>> {
        // Whether this is the very last frame of the stream is only known
        // once `drain()` is called; `encode()` never promotes a trailing B.
        let mut cleared = false;
        self.reorderer.push(picture, meta, false, || cleared = true);
        if cleared {
            self.refman.clear();
        }

        let requests = self.drain_ready(false);
        Ok(if requests.is_empty() {
            PredictorVerdict::NoOperation
        } else {
            PredictorVerdict::Request { requests }
        })
    }

    fn reconstructed(&mut self, recon: DpbEntry<R>) -> EncodeResult<PredictorVerdict<P, R>> {
        let pending = self.pending.pop_front().ok_or(EncodeError::InvalidInternalState)?;
        self.refman.insert(Rc::new(recon), pending.victim_index);

        if self.reorderer.has_cached_idr() && self.reorderer.is_empty() {
            self.reorderer.begin_cached_idr();
        }

        let requests = self.drain_ready(false);
        Ok(if requests.is_empty() {
            PredictorVerdict::NoOperation
        } else {
            PredictorVerdict::Request { requests }
        })
    }

    fn drain(&mut self) -> EncodeResult<Vec<BackendRequest<P, R>>> {
        self.reorderer.finalize_stream();
        if self.reorderer.has_cached_idr() && self.reorderer.is_empty() {
            self.reorderer.begin_cached_idr();
        }
        Ok(self.drain_ready(true))
    }
}
