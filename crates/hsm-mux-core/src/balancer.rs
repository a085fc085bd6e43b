use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::device::{DeviceLoad, UNUSABLE_WEIGHT};

/// Calls served by the rotation pointer before it advances.
pub const DEVICE_USES_BEFORE_NEXT: u32 = 2;

/// A device must be lighter than the rotation choice by more than this to
/// take over.
pub const LOAD_HYSTERESIS: u64 = 1;

#[derive(Debug, Default)]
struct Rotation {
    next: usize,
    uses: u32,
}

/// Picks a device for work that can run anywhere.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    rotation: Mutex<Rotation>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Round-robins across `devices`, overridden by a clearly lighter device.
    /// Returns `None` when no device is usable.
    pub fn choose(&self, devices: &[Arc<DeviceLoad>]) -> Option<usize> {
        if devices.is_empty() {
            return None;
        }
        let mut rotation = self.rotation.lock();
        rotation.uses += 1;
        if rotation.uses > DEVICE_USES_BEFORE_NEXT {
            rotation.uses = 0;
            rotation.next += 1;
        }
        if rotation.next >= devices.len() {
            rotation.next = 0;
        }

        let mut best = rotation.next;
        let mut best_weight = devices[best].weight();
        for (index, device) in devices.iter().enumerate() {
            if index == rotation.next {
                continue;
            }
            let weight = device.weight();
            if weight.saturating_add(LOAD_HYSTERESIS) < best_weight {
                best = index;
                best_weight = weight;
            }
        }
        if best != rotation.next {
            rotation.next = best;
            rotation.uses = 0;
        }

        (best_weight < UNUSABLE_WEIGHT).then_some(best)
    }

    /// Lowest-weight usable location; ties go to the lowest index.
    pub fn choose_from(
        &self,
        devices: &[Arc<DeviceLoad>],
        locations: &BTreeMap<usize, Uuid>,
    ) -> Option<(usize, Uuid)> {
        let mut chosen = None;
        let mut chosen_weight = UNUSABLE_WEIGHT;
        for (&index, &device_key) in locations {
            let Some(device) = devices.get(index) else {
                continue;
            };
            let weight = device.weight();
            if weight < chosen_weight {
                chosen_weight = weight;
                chosen = Some((index, device_key));
            }
        }
        chosen
    }
}
