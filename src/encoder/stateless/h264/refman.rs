// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference Manager (component C): DPB bookkeeping, L0/L1 construction,
//! eviction policy, and slice-header synthesis (§4.C).
//!
//! Resident references are held as `Rc<DpbEntry<R>>` -- the same handle the
//! backend hands back once a picture is reconstructed -- so inserting a new
//! reference or building a list never requires `R: Clone`.

use std::rc::Rc;

use crate::codec::h264::parser::DecRefPicMarking;
use crate::codec::h264::parser::MmcoUnusedForReference;
use crate::codec::h264::parser::RefPicListModEntry;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::SliceHeaderBuilder;
use crate::codec::h264::parser::SliceType;
use crate::encoder::stateless::h264::gop::GopState;
use crate::encoder::stateless::h264::DpbEntry;
use crate::encoder::stateless::h264::IsReference;

/// §9: the DPB eviction policy is a tagged sum type, selected once per CVS
/// from [`GopState`], not a subclass hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpbEvictionPolicy {
    SlidingWindow,
    Pyramid,
}

/// The outcome of §4.C step 3: which resident reference (if any) must be
/// evicted to make room for the frame about to be submitted, and whether
/// that eviction needs an explicit MMCO-1 (because it isn't the one a
/// decoder's implicit sliding-window would pick).
pub struct EvictionDecision {
    pub victim_index: usize,
    pub explicit_unmark_frame_num: Option<u32>,
}

pub struct ReferenceManager<R> {
    gop: Rc<GopState>,
    policy: DpbEvictionPolicy,
    ref_list: Vec<Rc<DpbEntry<R>>>,
}

impl<R> ReferenceManager<R> {
    pub fn new(gop: Rc<GopState>) -> Self {
        let policy = if gop.b_pyramid {
            DpbEvictionPolicy::Pyramid
        } else {
            DpbEvictionPolicy::SlidingWindow
        };
        Self {
            gop,
            policy,
            ref_list: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.ref_list.clear();
    }

    pub fn len(&self) -> usize {
        self.ref_list.len()
    }

    pub fn count_with_poc_greater_than(&self, poc: u32) -> u32 {
        self.ref_list
            .iter()
            .filter(|e| e.meta.poc as u32 > poc)
            .count() as u32
    }

    /// §4.C step 1.
    pub fn build_lists(&self, poc: u32, slice_type: SliceType) -> (Vec<Rc<DpbEntry<R>>>, Vec<Rc<DpbEntry<R>>>) {
        if slice_type == SliceType::I {
            return (Vec::new(), Vec::new());
        }

        let mut l0: Vec<_> = self
            .ref_list
            .iter()
            .filter(|e| (e.meta.poc as u32) <= poc)
            .cloned()
            .collect();
        l0.sort_by(|a, b| b.meta.poc.cmp(&a.meta.poc));
        l0.truncate(self.gop.ref_num_list0 as usize);

        let mut l1 = Vec::new();
        if slice_type == SliceType::B {
            l1 = self
                .ref_list
                .iter()
                .filter(|e| (e.meta.poc as u32) > poc)
                .cloned()
                .collect();
            l1.sort_by_key(|e| e.meta.poc);
            l1.truncate(self.gop.ref_num_list1 as usize);
        }

        (l0, l1)
    }

    /// §4.C step 2: modification entries are only emitted when the POC
    /// order built above differs from the frame-num (PicNum) order that a
    /// decoder would assume by default.
    pub fn list_modification(list: &[Rc<DpbEntry<R>>], cur_frame_num: u32) -> Vec<RefPicListModEntry> {
        if list.len() < 2 {
            return Vec::new();
        }

        let mut by_frame_num: Vec<_> = list.to_vec();
        by_frame_num.sort_by_key(|e| std::cmp::Reverse(e.meta.frame_num));

        let same_order = by_frame_num
            .iter()
            .zip(list.iter())
            .all(|(a, b)| a.meta.frame_num == b.meta.frame_num);
        if same_order {
            return Vec::new();
        }

        let mut entries = Vec::with_capacity(list.len());
        let mut pred = cur_frame_num as i64;
        for e in list {
            let pic_num = e.meta.frame_num as i64;
            let diff = pic_num - pred;
            let entry = if diff < 0 {
                RefPicListModEntry {
                    modification_of_pic_nums_idc: 0,
                    abs_diff_pic_num_minus1: (-diff - 1).max(0) as u32,
                }
            } else {
                RefPicListModEntry {
                    modification_of_pic_nums_idc: 1,
                    abs_diff_pic_num_minus1: (diff - 1).max(0) as u32,
                }
            };
            entries.push(entry);
            pred = pic_num;
        }
        entries
    }

    /// §4.C step 3.
    pub fn maybe_mark_eviction(&self, is_ref: bool, slice_type: SliceType) -> Option<EvictionDecision> {
        if !is_ref {
            return None;
        }
        if (self.ref_list.len() as u32) < self.gop.max_dec_frame_buffering.saturating_sub(1) {
            return None;
        }
        if self.ref_list.is_empty() {
            return None;
        }

        let victim_index = match self.policy {
            DpbEvictionPolicy::SlidingWindow => 0,
            DpbEvictionPolicy::Pyramid => {
                if slice_type != SliceType::B {
                    0
                } else {
                    self.ref_list
                        .iter()
                        .enumerate()
                        .filter(|(_, e)| e.meta.slice_type == SliceType::B)
                        .min_by_key(|(_, e)| e.meta.poc)
                        .map(|(i, _)| i)
                        .unwrap_or(0)
                }
            }
        };

        let explicit_unmark_frame_num = if victim_index != 0 {
            Some(self.ref_list[victim_index].meta.frame_num)
        } else {
            None
        };

        Some(EvictionDecision {
            victim_index,
            explicit_unmark_frame_num,
        })
    }

    /// §4.C step 4, plus applying any eviction decided in
    /// [`Self::maybe_mark_eviction`].
    pub fn insert(&mut self, entry: Rc<DpbEntry<R>>, victim_index: Option<usize>) {
        if let Some(idx) = victim_index {
            if idx < self.ref_list.len() {
                self.ref_list.remove(idx);
            }
        }
        if entry.meta.is_reference != IsReference::No {
            self.ref_list.push(entry);
            self.ref_list.sort_by_key(|e| e.meta.frame_num);
        }
    }

    /// §4.C slice-header synthesis.
    #[allow(clippy::too_many_arguments)]
    pub fn synthesize_slice_header(
        &self,
        pps_id: u8,
        slice_type: SliceType,
        frame_num: u32,
        poc: u32,
        is_idr: bool,
        idr_pic_id: u32,
        l0: &[Rc<DpbEntry<R>>],
        l1: &[Rc<DpbEntry<R>>],
        explicit_unmark_frame_num: Option<u32>,
    ) -> SliceHeader {
        let l0_mods = Self::list_modification(l0, frame_num);
        let l1_mods = Self::list_modification(l1, frame_num);

        let marking = DecRefPicMarking {
            adaptive_ref_pic_marking_mode_flag: explicit_unmark_frame_num.is_some(),
            mmco_unused: explicit_unmark_frame_num.map(|victim_frame_num| MmcoUnusedForReference {
                difference_of_pic_nums_minus1: frame_num.abs_diff(victim_frame_num).saturating_sub(1),
            }),
        };

        let mut builder = SliceHeaderBuilder::new()
            .slice_type(slice_type)
            .pic_parameter_set_id(pps_id)
            .frame_num(frame_num)
            .pic_order_cnt_lsb(poc)
            .ref_idx_active(
                l0.len().max(1) as u32,
                l1.len().max(1) as u32,
                self.gop.ref_num_list0.max(1),
                self.gop.ref_num_list1.max(1),
            )
            .ref_pic_list_modification(l0_mods, l1_mods)
            .dec_ref_pic_marking(marking);

        if is_idr {
            builder = builder.idr_pic_id(idr_pic_id);
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::stateless::h264::gop::GopConfig;
    use crate::encoder::stateless::h264::DpbEntryMeta;

    fn gop(b_pyramid: bool, num_ref_frames: u32) -> Rc<GopState> {
        Rc::new(GopState::generate(&GopConfig {
            idr_period: 16,
            num_bframes: if b_pyramid { 3 } else { 0 },
            num_iframes: 0,
            num_ref_frames,
            b_pyramid,
            fps_n: 30,
            fps_d: 1,
            profile: crate::codec::h264::parser::Profile::High,
            list0_cap: num_ref_frames,
            list1_cap: if b_pyramid { num_ref_frames } else { 0 },
        }))
    }

    fn entry(poc: u32, frame_num: u32, slice_type: SliceType) -> Rc<DpbEntry<()>> {
        Rc::new(DpbEntry {
            recon_pic: (),
            meta: DpbEntryMeta {
                poc: poc as u16,
                frame_num,
                is_reference: IsReference::ShortTerm,
                slice_type,
            },
        })
    }

    #[test]
    fn build_lists_empty_for_i_slices() {
        let mut mgr = ReferenceManager::<()>::new(gop(false, 4));
        mgr.insert(entry(0, 0, SliceType::I), None);
        let (l0, l1) = mgr.build_lists(10, SliceType::I);
        assert!(l0.is_empty());
        assert!(l1.is_empty());
    }

    #[test]
    fn build_lists_l0_is_descending_poc_truncated_to_cap() {
        let mut mgr = ReferenceManager::<()>::new(gop(false, 2));
        mgr.insert(entry(0, 0, SliceType::I), None);
        mgr.insert(entry(2, 1, SliceType::P), None);
        mgr.insert(entry(4, 2, SliceType::P), None);

        let (l0, l1) = mgr.build_lists(6, SliceType::P);
        assert!(l1.is_empty());
        assert_eq!(l0.len(), 2);
        assert_eq!(l0[0].meta.poc, 4);
        assert_eq!(l0[1].meta.poc, 2);
    }

    #[test]
    fn build_lists_l1_only_for_b_and_ascending_poc() {
        let mut mgr = ReferenceManager::<()>::new(gop(true, 4));
        mgr.insert(entry(0, 0, SliceType::I), None);
        mgr.insert(entry(8, 1, SliceType::P), None);

        let (l0, l1) = mgr.build_lists(4, SliceType::B);
        assert_eq!(l0.len(), 1);
        assert_eq!(l0[0].meta.poc, 0);
        assert_eq!(l1.len(), 1);
        assert_eq!(l1[0].meta.poc, 8);
    }

    #[test]
    fn list_modification_empty_when_poc_and_frame_num_orders_agree() {
        let l0 = vec![entry(4, 2, SliceType::P), entry(2, 1, SliceType::P)];
        assert!(ReferenceManager::<()>::list_modification(&l0, 3).is_empty());
    }

    #[test]
    fn list_modification_nonempty_when_orders_disagree() {
        // POC-descending order (as build_lists produces) with a frame_num
        // assignment that does *not* agree with that order.
        let l0 = vec![entry(4, 1, SliceType::P), entry(2, 2, SliceType::P)];
        assert!(!ReferenceManager::<()>::list_modification(&l0, 3).is_empty());
    }

    #[test]
    fn sliding_window_evicts_oldest_frame_num_when_dpb_full() {
        let mut mgr = ReferenceManager::<()>::new(gop(false, 2));
        mgr.insert(entry(0, 0, SliceType::P), None);
        mgr.insert(entry(2, 1, SliceType::P), None);

        // max_dec_frame_buffering for this GOP is 3, so two resident entries
        // already cross the eviction threshold and the next reference must
        // evict someone.
        let decision = mgr.maybe_mark_eviction(true, SliceType::P).unwrap();
        assert_eq!(decision.victim_index, 0);
        assert!(decision.explicit_unmark_frame_num.is_none());

        mgr.insert(entry(4, 2, SliceType::P), Some(decision.victim_index));
        assert_eq!(mgr.len(), 2);
        assert!(mgr.ref_list.iter().all(|e| e.meta.frame_num != 0));
    }

    #[test]
    fn pyramid_eviction_targets_lowest_poc_resident_b() {
        let mut mgr = ReferenceManager::<()>::new(gop(true, 2));
        mgr.insert(entry(0, 0, SliceType::I), None);
        mgr.insert(entry(4, 1, SliceType::B), None);
        mgr.insert(entry(8, 2, SliceType::B), None);

        let decision = mgr.maybe_mark_eviction(true, SliceType::B).unwrap();
        // Of the two resident Bs, the lower-POC one is evicted first; since
        // it isn't index 0, a decoder's implicit sliding window wouldn't
        // pick it, so an explicit MMCO-1 is required.
        assert_eq!(decision.victim_index, 1);
        assert_eq!(decision.explicit_unmark_frame_num, Some(1));
    }

    #[test]
    fn no_eviction_needed_for_non_reference_pictures() {
        let mgr = ReferenceManager::<()>::new(gop(false, 1));
        assert!(mgr.maybe_mark_eviction(false, SliceType::B).is_none());
    }

    #[test]
    fn synthesize_slice_header_sets_mmco1_on_explicit_unmark() {
        let mgr = ReferenceManager::<()>::new(gop(false, 2));
        let header = mgr.synthesize_slice_header(0, SliceType::P, 2, 4, false, 0, &[], &[], Some(0));
        assert!(header.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag);
        assert_eq!(
            header.dec_ref_pic_marking.mmco_unused.unwrap().difference_of_pic_nums_minus1,
            1
        );
    }

    #[test]
    fn synthesize_slice_header_idr_carries_idr_pic_id() {
        let mgr = ReferenceManager::<()>::new(gop(false, 1));
        let header = mgr.synthesize_slice_header(0, SliceType::I, 0, 0, true, 7, &[], &[], None);
        assert_eq!(header.idr_pic_id, Some(7));
    }
}
