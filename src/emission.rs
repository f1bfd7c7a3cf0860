use bevy::prelude::*;

use crate::physics::{BodyHandle, PhysicsWorld};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmittedBodyRecord {
    pub body: BodyHandle,
    pub source: BodyHandle,
    pub spawn_frame: u64,
    /// 0 means the body lives until the session ends.
    pub expiry_frame: u64,
}

impl EmittedBodyRecord {
    pub fn is_expired(&self, frame: u64) -> bool {
        self.expiry_frame != 0 && frame >= self.expiry_frame
    }
}

/// Bodies spawned by emitters, in spawn order.
#[derive(Default, Debug)]
pub struct EmissionTracker {
    records: Vec<EmittedBodyRecord>,
    pub reaped_total: u64,
}

impl EmissionTracker {
    pub fn register(&mut self, body: BodyHandle, source: BodyHandle, frame: u64, lifetime: u64) {
        let expiry_frame = if lifetime == 0 {
            0
        } else {
            frame.saturating_add(lifetime)
        };
        self.records.push(EmittedBodyRecord {
            body,
            source,
            spawn_frame: frame,
            expiry_frame,
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[EmittedBodyRecord] {
        &self.records
    }

    pub fn contains(&self, body: BodyHandle) -> bool {
        self.records.iter().any(|r| r.body == body)
    }

    /// Forgets a body destroyed elsewhere so it is never reaped twice.
    pub fn forget(&mut self, body: BodyHandle) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.body != body);
        before != self.records.len()
    }

    /// Destroys every expired body; `on_reaped` runs once per destroyed body.
    pub fn reap(
        &mut self,
        world: &mut dyn PhysicsWorld,
        frame: u64,
        mut on_reaped: impl FnMut(BodyHandle),
    ) -> usize {
        let mut reaped = 0;
        self.records.retain(|record| {
            if !world.is_valid(record.body) {
                return false;
            }
            if !record.is_expired(frame) {
                return true;
            }
            if world.destroy_body(record.body).is_ok() {
                on_reaped(record.body);
                reaped += 1;
            }
            false
        });
        if reaped > 0 {
            debug!("[Simdrive emission] Reaped {} bodies at frame {}", reaped, frame);
        }
        self.reaped_total += reaped as u64;
        reaped
    }

    /// Destroys every tracked body regardless of expiry.
    pub fn drain_all(
        &mut self,
        world: &mut dyn PhysicsWorld,
        mut on_reaped: impl FnMut(BodyHandle),
    ) -> usize {
        let mut destroyed = 0;
        for record in self.records.drain(..) {
            if world.destroy_body(record.body).is_ok() {
                on_reaped(record.body);
                destroyed += 1;
            }
        }
        destroyed
    }
}
