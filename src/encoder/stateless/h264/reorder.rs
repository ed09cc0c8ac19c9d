// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame Queue & Reorderer (component B): accepts display-order input and
//! emits encode-order frames honoring the GOP plan, forced key-frames, and
//! B-pyramid dependencies (§4.B).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::codec::h264::parser::SliceType;
use crate::encoder::stateless::h264::frame::EncoderFrame;
use crate::encoder::stateless::h264::gop::GopState;
use crate::encoder::FrameMetadata;

type FrameHandle<P> = Rc<RefCell<EncoderFrame<P>>>;

/// Pending decode timestamps, guaranteeing `dts <= pts` (§3, §8 P5).
#[derive(Debug, Default)]
pub struct DtsQueue {
    pending: VecDeque<i64>,
    padded: bool,
}

impl DtsQueue {
    pub fn push(&mut self, pts: i64) {
        self.pending.push_back(pts);
    }

    /// Pads the head of the queue with `num_reorder_frames` synthetic,
    /// strictly decreasing DTS values the first time this is called, so
    /// that the reorder delay never makes an emitted DTS exceed its PTS.
    pub fn prime(&mut self, num_reorder_frames: u32, frame_duration: i64, first_pts: i64) {
        if self.padded {
            return;
        }
        self.padded = true;
        for i in (1..=num_reorder_frames as i64).rev() {
            self.pending.push_front(first_pts - i * frame_duration);
        }
    }

    pub fn pop(&mut self) -> Option<i64> {
        self.pending.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Frame Queue & Reorderer. Owns only the ReorderList and its own position
/// counters; the shared RefList used by the B-pyramid/plain-B pop stall
/// check is supplied by the caller (the Encoder Context), since the
/// Reference Manager is the component that actually mutates it.
pub struct Reorderer<P> {
    gop: Rc<GopState>,
    cur_gop_position: u32,
    total_idr_count: u32,
    next_ref_frame_num: u32,
    last_gop_frame_num: u32,
    reorder_list: VecDeque<FrameHandle<P>>,
    cached_idr: Option<FrameHandle<P>>,
    dts: DtsQueue,
    frame_duration: i64,
}

impl<P> Reorderer<P> {
    pub fn new(gop: Rc<GopState>, frame_duration: i64) -> Self {
        Self {
            gop,
            cur_gop_position: 0,
            total_idr_count: 0,
            next_ref_frame_num: 0,
            last_gop_frame_num: 0,
            reorder_list: VecDeque::new(),
            cached_idr: None,
            dts: DtsQueue::default(),
            frame_duration,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.reorder_list.is_empty() && self.cached_idr.is_none()
    }

    /// §4.B push semantics. Returns the set of pictures immediately ready to
    /// be popped is *not* computed here -- callers drive `pop` separately,
    /// matching the original's separate `reorder_frame` loop.
    pub fn push(&mut self, picture: P, meta: FrameMetadata, last: bool, on_gop_start: impl FnOnce()) {
        let pts = meta.timestamp as i64;
        self.dts.push(pts);
        self.dts.prime(self.gop.num_reorder_frames, self.frame_duration, pts);

        // Step 1: forced key-frame mid-GOP -- cache it, let the in-flight
        // GOP finish draining first.
        if meta.force_keyframe && self.cur_gop_position != 0 && self.cur_gop_position != self.gop.idr_period {
            if let Some(tail) = self.reorder_list.back() {
                let mut tail_mut = tail.borrow_mut();
                if tail_mut.gop_type.slice_type == SliceType::B {
                    promote_to_ref_p(&mut tail_mut);
                }
            }
            let frame = self.new_frame_at(picture, meta, 0, true);
            self.cached_idr = Some(Rc::new(RefCell::new(frame)));
            return;
        }

        // Step 2: GOP exhausted.
        if self.cur_gop_position == self.gop.idr_period {
            debug_assert!(self.reorder_list.is_empty());
            self.cur_gop_position = 0;
        }

        // Step 3: GOP start drains the DPB (new CVS).
        if self.cur_gop_position == 0 {
            on_gop_start();
        }

        let pos = self.cur_gop_position;
        let frame = self.new_frame_at(picture, meta, pos, false);
        self.cur_gop_position += 1;
        self.reorder_list.push_back(Rc::new(RefCell::new(frame)));

        // Step 5: last frame of stream promotes a trailing B to P+ref.
        if last {
            if let Some(tail) = self.reorder_list.back() {
                let mut tail_mut = tail.borrow_mut();
                tail_mut.last_frame = true;
                if tail_mut.gop_type.slice_type == SliceType::B {
                    promote_to_ref_p(&mut tail_mut);
                }
            }
        }
    }

    fn new_frame_at(&mut self, picture: P, meta: FrameMetadata, pos: u32, force_idr: bool) -> EncoderFrame<P> {
        let gop_type = if force_idr {
            self.gop.frame_map[0]
        } else {
            self.gop.frame_map[pos as usize]
        };
        let poc = if force_idr {
            0
        } else {
            (pos * 2) % self.gop.max_pic_order_cnt
        };

        EncoderFrame {
            gop_type,
            gop_position: if force_idr { 0 } else { pos },
            gop_frame_num: 0,
            poc,
            idr_pic_id: 0,
            force_idr,
            last_frame: false,
            meta,
            picture,
        }
    }

    /// §4.B pop semantics. `refs_with_poc_greater_than` lets the caller
    /// consult the live RefList without the Reorderer owning it.
    pub fn pop(&mut self, end_of_stream: bool, refs_with_poc_greater_than: impl Fn(u32) -> u32) -> Option<FrameHandle<P>> {
        if self.reorder_list.is_empty() {
            return end_of_stream.then(|| self.cached_idr.take()).flatten();
        }

        let gop_len = self.reorder_list.len();
        let tail_is_non_b = {
            let tail = self.reorder_list.back().unwrap();
            tail.borrow().gop_type.slice_type != SliceType::B
        };

        let candidate_index = if tail_is_non_b {
            Some(gop_len - 1)
        } else if self.gop.b_pyramid {
            self.select_pyramid_candidate(&refs_with_poc_greater_than, end_of_stream)
        } else {
            self.select_plain_b_candidate(&refs_with_poc_greater_than, end_of_stream)
        };

        let index = candidate_index?;
        let handle = self.reorder_list.remove(index).unwrap();
        self.stamp(&handle);
        Some(handle)
    }

    fn select_pyramid_candidate(
        &self,
        refs_with_poc_greater_than: &impl Fn(u32) -> u32,
        end_of_stream: bool,
    ) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (idx, handle) in self.reorder_list.iter().enumerate() {
            let frame = handle.borrow();
            if frame.gop_type.slice_type != SliceType::B {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    let bf = self.reorder_list[b].borrow();
                    frame.gop_type.pyramid_level < bf.gop_type.pyramid_level
                        || (frame.gop_type.pyramid_level == bf.gop_type.pyramid_level && frame.poc < bf.poc)
                }
            };
            if better {
                best = Some(idx);
            }
        }

        let mut idx = best?;
        // Shift to a resident neighbour that must leave first.
        loop {
            let (left_poc, right_poc) = {
                let frame = self.reorder_list[idx].borrow();
                (
                    (frame.poc as i64 + frame.gop_type.left_ref_poc_diff as i64),
                    (frame.poc as i64 + frame.gop_type.right_ref_poc_diff as i64),
                )
            };
            let neighbour = self
                .reorder_list
                .iter()
                .position(|h| h.borrow().poc as i64 == left_poc || h.borrow().poc as i64 == right_poc);
            match neighbour {
                Some(n) if n != idx => idx = n,
                _ => break,
            }
        }

        let poc = self.reorder_list[idx].borrow().poc;
        let needed = self.gop.ref_num_list1;
        if refs_with_poc_greater_than(poc) >= needed || end_of_stream {
            Some(idx)
        } else {
            None
        }
    }

    fn select_plain_b_candidate(
        &self,
        refs_with_poc_greater_than: &impl Fn(u32) -> u32,
        end_of_stream: bool,
    ) -> Option<usize> {
        // If the GOP has ended, pop anyway: a trailing run of Bs at the
        // close of a GOP can never accumulate `ref_num_list1` later refs
        // from *within* this GOP, since the reference list resets at the
        // next IDR. Without this escape the tail would stall until true
        // end-of-stream instead of draining GOP by GOP.
        if self.cur_gop_position == self.gop.idr_period {
            return Some(0);
        }

        let head = self.reorder_list.front()?;
        let poc = head.borrow().poc;
        let needed = self.gop.ref_num_list1;
        if refs_with_poc_greater_than(poc) >= needed || end_of_stream {
            Some(0)
        } else {
            None
        }
    }

    fn stamp(&mut self, handle: &FrameHandle<P>) {
        let mut frame = handle.borrow_mut();
        if frame.is_idr() {
            self.total_idr_count += 1;
            self.next_ref_frame_num = 0;
        }
        frame.idr_pic_id = self.total_idr_count.saturating_sub(1);

        if frame.gop_type.is_ref {
            frame.gop_frame_num = self.next_ref_frame_num;
            self.next_ref_frame_num = (self.next_ref_frame_num + 1) % self.gop.max_frame_num;
            self.last_gop_frame_num = frame.gop_frame_num;
        } else {
            frame.gop_frame_num = self.last_gop_frame_num;
        }
    }

    /// Called once a cached forced-IDR frame's predecessors have all
    /// drained, to move it onto the ReorderList as the start of a fresh GOP.
    pub fn begin_cached_idr(&mut self) {
        if let Some(idr) = self.cached_idr.take() {
            {
                let mut frame = idr.borrow_mut();
                frame.force_idr = true;
                frame.gop_position = 0;
                frame.poc = 0;
            }
            self.cur_gop_position = 1;
            self.reorder_list.push_back(idr);
        }
    }

    pub fn has_cached_idr(&self) -> bool {
        self.cached_idr.is_some()
    }

    /// §4.B step 5, applied at `drain()` time rather than at push time: the
    /// last frame ever pushed is promoted from a trailing B to a ref P, since
    /// by definition nothing will arrive afterwards to depend on it as a B.
    pub fn finalize_stream(&mut self) {
        if let Some(tail) = self.reorder_list.back() {
            let mut tail_mut = tail.borrow_mut();
            tail_mut.last_frame = true;
            if tail_mut.gop_type.slice_type == SliceType::B {
                promote_to_ref_p(&mut tail_mut);
            }
        }
    }

    pub fn pop_dts(&mut self) -> Option<i64> {
        self.dts.pop()
    }
}

fn promote_to_ref_p<P>(frame: &mut EncoderFrame<P>) {
    frame.gop_type.slice_type = SliceType::P;
    frame.gop_type.is_ref = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::stateless::h264::gop::GopConfig;
    use crate::encoder::FrameMetadata;
    use crate::FrameLayout;
    use crate::Resolution;

    fn layout() -> FrameLayout {
        FrameLayout { size: Resolution { width: 16, height: 16 }, planes: vec![] }
    }

    fn meta(timestamp: u64, force_keyframe: bool) -> FrameMetadata {
        FrameMetadata {
            display_resolution: Resolution { width: 16, height: 16 },
            layout: layout(),
            force_keyframe,
            timestamp,
        }
    }

    fn low_delay_gop() -> Rc<GopState> {
        Rc::new(GopState::generate(&GopConfig {
            idr_period: 4,
            num_bframes: 0,
            num_iframes: 0,
            num_ref_frames: 1,
            b_pyramid: false,
            fps_n: 30,
            fps_d: 1,
            profile: crate::codec::h264::parser::Profile::Baseline,
            list0_cap: 1,
            list1_cap: 0,
        }))
    }

    fn b_pyramid_gop() -> Rc<GopState> {
        Rc::new(GopState::generate(&GopConfig {
            idr_period: 8,
            num_bframes: 3,
            num_iframes: 0,
            num_ref_frames: 4,
            b_pyramid: true,
            fps_n: 30,
            fps_d: 1,
            profile: crate::codec::h264::parser::Profile::High,
            list0_cap: 4,
            list1_cap: 4,
        }))
    }

    /// Plain (non-pyramid) B GOP whose list0/list1 balancing grows
    /// `ref_num_list1` to 2, so `select_plain_b_candidate`'s stall threshold
    /// is exercised rather than trivially satisfied by the first anchor.
    fn plain_b_multi_ref_gop() -> Rc<GopState> {
        Rc::new(GopState::generate(&GopConfig {
            idr_period: 16,
            num_bframes: 3,
            num_iframes: 0,
            num_ref_frames: 8,
            b_pyramid: false,
            fps_n: 30,
            fps_d: 1,
            profile: crate::codec::h264::parser::Profile::High,
            list0_cap: 8,
            list1_cap: 8,
        }))
    }

    /// In a low-delay (all-P) GOP every push is immediately poppable, in
    /// push order, since there is no B-frame reorder delay. Mirrors how
    /// `GopPredictor::new_frame` actually drives this: drain after each
    /// individual push, never in bulk.
    #[test]
    fn low_delay_pop_matches_push_order() {
        let gop = low_delay_gop();
        let mut r = Reorderer::new(gop, 1);

        for (i, expected_poc) in (0u64..4).zip([0u32, 2, 4, 6]) {
            r.push((), meta(i, false), false, || {});
            let frame = r.pop(false, |_| 0).unwrap();
            assert_eq!(frame.borrow().poc, expected_poc);
            assert!(r.pop(false, |_| 0).is_none());
        }
    }

    /// §4.B: the Bs between two anchors stall until a future reference
    /// exists to motivate popping them. Drains after each push, the way
    /// `GopPredictor` actually drives this -- with only the I pushed so far,
    /// the three Bs behind it have no qualifying future reference yet.
    #[test]
    fn b_pyramid_pop_stalls_until_next_anchor_is_pushed() {
        let gop = b_pyramid_gop();
        let mut r = Reorderer::new(gop, 1);
        let mut popped: Vec<u32> = Vec::new();

        for i in 0..4u64 {
            r.push((), meta(i, false), false, || {});
            loop {
                let refs_gt = |poc: u32| popped.iter().filter(|&&p| p > poc).count() as u32;
                match r.pop(false, refs_gt) {
                    Some(frame) => popped.push(frame.borrow().poc),
                    None => break,
                }
            }
        }

        assert_eq!(popped, vec![0]);
        assert_eq!(r.reorder_list.len(), 3);
    }

    /// Once a later reference is available the stalled Bs drain, in
    /// dependency order, all the way down to an empty queue. Drives
    /// push/pop the way `GopPredictor` does: one push at a time, draining
    /// everything immediately poppable, with `refs_with_poc_greater_than`
    /// answered from what has already popped (a stand-in for the Reference
    /// Manager's resident set).
    #[test]
    fn b_pyramid_cascades_once_unblocked_and_fully_drains() {
        let gop = b_pyramid_gop();
        let mut r = Reorderer::new(gop, 1);
        let mut popped: Vec<u32> = Vec::new();

        for i in 0..8u64 {
            r.push((), meta(i, false), false, || {});
            loop {
                let refs_gt = |poc: u32| popped.iter().filter(|&&p| p > poc).count() as u32;
                match r.pop(false, refs_gt) {
                    Some(frame) => popped.push(frame.borrow().poc),
                    None => break,
                }
            }
        }

        assert!(r.is_empty());
        assert_eq!(popped.len(), 8);
        assert_eq!(popped[0], 0);
    }

    /// Scenario: the stream ends mid-GOP, on what the plan called a B. With
    /// nothing left to ever reference it as a B, `finalize_stream` must
    /// promote it to a reference P before it is the last thing drained.
    #[test]
    fn finalize_stream_promotes_a_trailing_b_to_ref_p() {
        let gop = b_pyramid_gop();
        let mut r = Reorderer::new(gop, 1);

        // Positions 0..=2 are I, B, B in this plan -- ending here leaves a B
        // as the tail of the reorder list.
        for i in 0..3u64 {
            r.push((), meta(i, false), false, || {});
        }
        assert_eq!(r.reorder_list.back().unwrap().borrow().gop_type.slice_type, SliceType::B);

        r.finalize_stream();

        let tail = r.reorder_list.back().unwrap();
        assert_eq!(tail.borrow().gop_type.slice_type, SliceType::P);
        assert!(tail.borrow().gop_type.is_ref);
        assert!(tail.borrow().last_frame);
    }

    /// Scenario: a forced key frame arrives mid-GOP. It must be cached, not
    /// spliced into the in-flight GOP, and the in-flight GOP's trailing
    /// frame gets promoted to a reference P so later frames can still
    /// reference it safely.
    #[test]
    fn forced_key_frame_mid_gop_is_cached_not_spliced() {
        let gop = low_delay_gop();
        let mut r = Reorderer::new(gop, 1);

        r.push((), meta(0, false), false, || {});
        r.push((), meta(1, false), false, || {});
        r.push((), meta(2, true), false, || {});

        assert!(r.has_cached_idr());
        // Only the two pre-forced-IDR frames are on the live reorder list.
        assert_eq!(r.reorder_list.len(), 2);

        let first = r.pop(false, |_| 0).unwrap();
        let second = r.pop(false, |_| 0).unwrap();
        assert_eq!(first.borrow().poc, 0);
        assert_eq!(second.borrow().poc, 2);
        assert!(r.is_empty());

        r.begin_cached_idr();
        assert!(!r.has_cached_idr());
        let idr = r.pop(false, |_| 0).unwrap();
        assert!(idr.borrow().is_idr());
    }

    /// §4.B: with `ref_num_list1 == 2` the reference count backing
    /// `select_plain_b_candidate` never reaches its threshold for the last
    /// two B positions before a GOP boundary -- the stream-relative
    /// reference list resets at the next IDR, so those trailing Bs would
    /// stall forever without the "GOP end, pop anyway" escape. Drives every
    /// position of one full 16-frame GOP and checks it drains completely by
    /// the time the final (forced-anchor) frame of the GOP has been pushed,
    /// with no end-of-stream flag set.
    #[test]
    fn plain_b_trailing_run_drains_at_gop_boundary_without_eos() {
        let gop = plain_b_multi_ref_gop();
        assert_eq!(gop.ref_num_list1, 2);
        let mut r = Reorderer::new(gop, 1);
        let mut popped: Vec<u32> = Vec::new();

        for i in 0..16u64 {
            r.push((), meta(i, false), false, || {});
            loop {
                let refs_gt = |poc: u32| popped.iter().filter(|&&p| p > poc).count() as u32;
                match r.pop(false, refs_gt) {
                    Some(frame) => popped.push(frame.borrow().poc),
                    None => break,
                }
            }
        }

        assert!(r.is_empty());
        assert_eq!(popped.len(), 16);
    }

    /// P5: DTS must never exceed PTS, even once `prime` pads the head of the
    /// queue with synthetic reorder-delay entries.
    #[test]
    fn dts_queue_never_exceeds_pts() {
        let mut dts = DtsQueue::default();
        let frame_duration = 100;
        let pts_values = [0i64, 100, 200, 300];

        for &pts in &pts_values {
            dts.push(pts);
        }
        dts.prime(2, frame_duration, pts_values[0]);

        let mut popped = Vec::new();
        while let Some(d) = dts.pop() {
            popped.push(d);
        }

        // Strictly increasing, and the two synthetic entries precede real
        // PTS values while staying below every one of them.
        for w in popped.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert!(*popped.last().unwrap() <= *pts_values.last().unwrap());
    }
}
