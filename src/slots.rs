//! Delay slots: handles onto historical filter states.
//!
//! A visual observation is solved against a camera frame that was
//! exposed tens of milliseconds in the past. The fusion filter can apply
//! such a late observation correctly only if it retained a snapshot of
//! its state at the exposure time. Each tracked device keeps a small
//! ring of such snapshots; a slot stays alive while any camera frame
//! still references its exposure.

use crate::fusion::FusionFilter;
use crate::pose::Pose;
use crate::sensor::PoseMetrics;
use crate::MAX_SENSORS;

/// Number of concurrently retained filter states per device.
pub const NUM_POSE_DELAY_SLOTS: usize = 3;

/// One per-camera observation recorded against a slot.
#[derive(Debug, Clone, Copy)]
pub struct PoseReport {
    /// Whether the position from this report was folded into the filter.
    pub used: bool,
    pub pose: Pose,
    pub metrics: PoseMetrics,
}

#[derive(Debug, Clone)]
pub struct DelaySlot {
    slot_id: usize,
    valid: bool,
    use_count: u32,
    device_time_ns: u64,
    reports: Vec<PoseReport>,
    used_reports: u32,
}

impl DelaySlot {
    fn new(slot_id: usize) -> Self {
        Self {
            slot_id,
            valid: false,
            use_count: 0,
            device_time_ns: 0,
            reports: Vec::with_capacity(MAX_SENSORS),
            used_reports: 0,
        }
    }

    pub fn slot_id(&self) -> usize {
        self.slot_id
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    pub fn device_time_ns(&self) -> u64 {
        self.device_time_ns
    }

    pub fn reports(&self) -> &[PoseReport] {
        &self.reports
    }

    pub fn used_reports(&self) -> u32 {
        self.used_reports
    }

    /// Record an observation against this slot, bounded by the sensor
    /// roster size.
    pub fn push_report(&mut self, report: PoseReport) {
        if self.reports.len() < MAX_SENSORS {
            if report.used {
                self.used_reports += 1;
            }
            self.reports.push(report);
        }
    }
}

/// Round-robin ring of delay slots for one device. All methods are
/// called with the owning device's lock held.
pub struct DelaySlotRing {
    device_id: u32,
    slots: Vec<DelaySlot>,
    next_slot: usize,
}

impl DelaySlotRing {
    pub fn new(device_id: u32) -> Self {
        Self {
            device_id,
            slots: (0..NUM_POSE_DELAY_SLOTS).map(DelaySlot::new).collect(),
            next_slot: 0,
        }
    }

    pub fn slots(&self) -> &[DelaySlot] {
        &self.slots
    }

    /// Allocate a slot for a new exposure at `device_time_ns` and have
    /// the filter snapshot its state into it. `None` means the exposure
    /// is dropped and visual updates against it will have no effect.
    pub fn prepare_new(
        &mut self,
        device_time_ns: u64,
        filter: &mut dyn FusionFilter,
    ) -> Option<usize> {
        let slot_id = match self.find_free() {
            Some(id) => Some(id),
            None => {
                // A busy slot that already yielded an applied observation
                // has its information folded into the filter, so its
                // snapshot can be sacrificed for the new exposure.
                let reclaimed = self.reclaim();
                if let Some(id) = reclaimed {
                    log::info!(
                        "reclaimed delay slot {} for dev {}, ts {} (delay {:.3}s)",
                        id,
                        self.device_id,
                        device_time_ns,
                        (device_time_ns.saturating_sub(self.slots[id].device_time_ns)) as f64
                            / 1e9
                    );
                }
                reclaimed
            }
        };

        let Some(id) = slot_id else {
            log::warn!(
                "no free delay slot for dev {}, ts {}",
                self.device_id,
                device_time_ns
            );
            return None;
        };

        let slot = &mut self.slots[id];
        slot.device_time_ns = device_time_ns;
        slot.valid = true;
        slot.use_count = 0;
        slot.reports.clear();
        slot.used_reports = 0;

        log::debug!(
            "assigning delay slot {} for dev {}, ts {}",
            id,
            self.device_id,
            device_time_ns
        );

        filter.prepare_delay_slot(device_time_ns, id);
        Some(id)
    }

    /// Take a frame reference on a slot. Fails if the slot was
    /// reassigned to a later exposure in the meantime.
    pub fn claim(&mut self, slot_id: usize, device_time_ns: u64) -> bool {
        let device_id = self.device_id;
        match self.get_matching_mut(slot_id, device_time_ns) {
            Some(slot) => {
                slot.use_count += 1;
                log::debug!(
                    "claimed delay slot {} for dev {}, ts {}, use_count {}",
                    slot_id,
                    device_id,
                    device_time_ns,
                    slot.use_count
                );
                true
            }
            None => false,
        }
    }

    /// Drop a frame reference. When the last reference goes, the filter
    /// state is discarded and the slot becomes reusable. Returns whether
    /// the slot matched, so the caller can clear its handle and never
    /// release the same frame twice.
    pub fn release(
        &mut self,
        slot_id: usize,
        device_time_ns: u64,
        filter: &mut dyn FusionFilter,
    ) -> bool {
        let device_id = self.device_id;
        let Some(slot) = self.get_matching_mut(slot_id, device_time_ns) else {
            return false;
        };

        if slot.use_count > 0 {
            slot.use_count -= 1;
            log::debug!(
                "released delay slot {} for dev {}, use_count {}",
                slot_id,
                device_id,
                slot.use_count
            );
        }

        if slot.use_count == 0 {
            slot.valid = false;
            log::debug!(
                "invalidating delay slot {} for dev {} with {} poses reported, {} used",
                slot_id,
                device_id,
                slot.reports.len(),
                slot.used_reports
            );
            filter.release_delay_slot(slot_id);
        }
        true
    }

    /// A slot only matches while it still describes the same exposure.
    pub fn get_matching(&self, slot_id: usize, device_time_ns: u64) -> Option<&DelaySlot> {
        self.slots
            .get(slot_id)
            .filter(|slot| slot.valid && slot.device_time_ns == device_time_ns)
    }

    pub fn get_matching_mut(
        &mut self,
        slot_id: usize,
        device_time_ns: u64,
    ) -> Option<&mut DelaySlot> {
        self.slots
            .get_mut(slot_id)
            .filter(|slot| slot.valid && slot.device_time_ns == device_time_ns)
    }

    fn find_free(&mut self) -> Option<usize> {
        for _ in 0..NUM_POSE_DELAY_SLOTS {
            let id = self.next_slot;
            self.next_slot = (id + 1) % NUM_POSE_DELAY_SLOTS;
            if self.slots[id].use_count == 0 {
                return Some(id);
            }
        }
        None
    }

    fn reclaim(&self) -> Option<usize> {
        self.slots
            .iter()
            .find(|slot| slot.valid && slot.used_reports > 0)
            .map(|slot| slot.slot_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::{FilterState, FusionFilter};
    use crate::sensor::PoseScore;
    use nalgebra::Vector3;

    /// Records delay-slot traffic so tests can assert on it.
    #[derive(Default)]
    struct RecordingFilter {
        prepared: Vec<(u64, usize)>,
        released: Vec<usize>,
    }

    impl FusionFilter for RecordingFilter {
        fn imu_update(
            &mut self,
            _: u64,
            _: &Vector3<f64>,
            _: &Vector3<f64>,
            _: &Vector3<f64>,
        ) {
        }
        fn pose_update(&mut self, _: u64, _: &Pose, _: usize) {}
        fn position_update(&mut self, _: u64, _: &Vector3<f64>, _: usize) {}
        fn get_pose_at(&mut self, _: u64) -> FilterState {
            unimplemented!("not used by slot tests")
        }
        fn prepare_delay_slot(&mut self, time_ns: u64, slot: usize) {
            self.prepared.push((time_ns, slot));
        }
        fn release_delay_slot(&mut self, slot: usize) {
            self.released.push(slot);
        }
        fn get_delay_slot_pose_at(&mut self, _: u64, _: usize) -> Option<FilterState> {
            None
        }
    }

    fn report(used: bool) -> PoseReport {
        PoseReport {
            used,
            pose: Pose::identity(),
            metrics: PoseMetrics {
                score: PoseScore::MATCH_POSITION,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_prepare_claim_release_cycle() {
        let mut ring = DelaySlotRing::new(0);
        let mut filter = RecordingFilter::default();

        let slot = ring.prepare_new(1_000, &mut filter).unwrap();
        assert_eq!(filter.prepared, vec![(1_000, slot)]);
        assert!(ring.slots()[slot].is_valid());
        assert_eq!(ring.slots()[slot].use_count(), 0);

        assert!(ring.claim(slot, 1_000));
        assert_eq!(ring.slots()[slot].use_count(), 1);

        assert!(ring.release(slot, 1_000, &mut filter));
        assert!(!ring.slots()[slot].is_valid());
        assert_eq!(filter.released, vec![slot]);
    }

    #[test]
    fn test_claim_fails_on_timestamp_mismatch() {
        let mut ring = DelaySlotRing::new(0);
        let mut filter = RecordingFilter::default();

        let slot = ring.prepare_new(1_000, &mut filter).unwrap();
        assert!(!ring.claim(slot, 2_000));
        assert_eq!(ring.slots()[slot].use_count(), 0);
    }

    #[test]
    fn test_round_robin_assignment() {
        let mut ring = DelaySlotRing::new(0);
        let mut filter = RecordingFilter::default();

        let a = ring.prepare_new(1_000, &mut filter).unwrap();
        let b = ring.prepare_new(2_000, &mut filter).unwrap();
        let c = ring.prepare_new(3_000, &mut filter).unwrap();
        assert_eq!(
            {
                let mut ids = vec![a, b, c];
                ids.sort();
                ids
            },
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_reclaim_prefers_slot_with_applied_report() {
        let mut ring = DelaySlotRing::new(0);
        let mut filter = RecordingFilter::default();

        // Three exposures, each claimed by an in-flight frame.
        let slots: Vec<_> = (0..3)
            .map(|i| {
                let ts = (i as u64 + 1) * 1_000;
                let slot = ring.prepare_new(ts, &mut filter).unwrap();
                assert!(ring.claim(slot, ts));
                slot
            })
            .collect();

        // The middle slot got a position observation applied.
        ring.get_matching_mut(slots[1], 2_000)
            .unwrap()
            .push_report(report(true));

        // Fourth exposure: no free slot, so the informed one is reclaimed.
        let fourth = ring.prepare_new(4_000, &mut filter).unwrap();
        assert_eq!(fourth, slots[1]);
        assert_eq!(ring.slots()[fourth].use_count(), 0);
        assert_eq!(ring.slots()[fourth].device_time_ns(), 4_000);

        // The stale frame reference no longer matches the slot.
        assert!(ring.get_matching(slots[1], 2_000).is_none());
    }

    #[test]
    fn test_exposure_dropped_when_nothing_reclaimable() {
        let mut ring = DelaySlotRing::new(0);
        let mut filter = RecordingFilter::default();

        for i in 0..3u64 {
            let ts = (i + 1) * 1_000;
            let slot = ring.prepare_new(ts, &mut filter).unwrap();
            assert!(ring.claim(slot, ts));
        }

        // No slot has an applied report, so the fourth exposure drops.
        assert!(ring.prepare_new(4_000, &mut filter).is_none());
    }

    #[test]
    fn test_release_makes_slot_reusable() {
        let mut ring = DelaySlotRing::new(0);
        let mut filter = RecordingFilter::default();

        for i in 0..3u64 {
            let ts = (i + 1) * 1_000;
            let slot = ring.prepare_new(ts, &mut filter).unwrap();
            assert!(ring.claim(slot, ts));
        }
        assert!(ring.prepare_new(4_000, &mut filter).is_none());

        assert!(ring.release(0, 1_000, &mut filter));
        assert!(ring.prepare_new(5_000, &mut filter).is_some());
    }

    #[test]
    fn test_report_bound() {
        let mut ring = DelaySlotRing::new(0);
        let mut filter = RecordingFilter::default();
        let slot = ring.prepare_new(1_000, &mut filter).unwrap();

        let entry = ring.get_matching_mut(slot, 1_000).unwrap();
        for _ in 0..MAX_SENSORS + 2 {
            entry.push_report(report(true));
        }
        assert_eq!(entry.reports().len(), MAX_SENSORS);
        assert_eq!(entry.used_reports() as usize, MAX_SENSORS);
    }
}
