//! BLE Connection Module
//!
//! Subscribes to the earpiece's characteristics once services are known.
//! A link accepts only one outstanding GATT operation, so descriptor writes
//! are queued and issued one at a time, each after the previous completed.

use crate::infrastructure::bluetooth::platform::{BlePlatform, GattCharacteristic, GattService};
use crate::infrastructure::bluetooth::protocol::{
    self, CLIENT_CHARACTERISTIC_CONFIG, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub characteristic: Uuid,
    pub value: [u8; 2],
}

/// Configuration value that enables updates for `characteristic`, preferring
/// notifications over indications. `None` if it cannot or need not be
/// subscribed.
pub fn subscription_for(characteristic: &GattCharacteristic) -> Option<[u8; 2]> {
    if !protocol::is_relevant_characteristic(&characteristic.uuid)
        || !characteristic.has_config_descriptor
    {
        return None;
    }
    if characteristic.properties.notify {
        Some(ENABLE_NOTIFICATION_VALUE)
    } else if characteristic.properties.indicate {
        Some(ENABLE_INDICATION_VALUE)
    } else {
        None
    }
}

#[derive(Debug, Default)]
pub struct DescriptorWriteQueue {
    pending: VecDeque<DescriptorWrite>,
    in_flight: Option<Uuid>,
}

impl DescriptorWriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, write: DescriptorWrite, platform: &dyn BlePlatform) {
        self.pending.push_back(write);
        if self.in_flight.is_none() {
            self.issue_next(platform);
        }
    }

    /// Completion callback of the outstanding write.
    pub fn on_write_complete(&mut self, characteristic: &Uuid, success: bool, platform: &dyn BlePlatform) {
        if self.in_flight != Some(*characteristic) {
            debug!(%characteristic, "Ignoring unexpected descriptor write completion");
            return;
        }
        if !success {
            warn!(%characteristic, "Enabling updates failed");
        }
        self.in_flight = None;
        self.issue_next(platform);
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.in_flight = None;
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn issue_next(&mut self, platform: &dyn BlePlatform) {
        while let Some(write) = self.pending.pop_front() {
            match platform.write_descriptor(
                &write.characteristic,
                &CLIENT_CHARACTERISTIC_CONFIG,
                &write.value,
            ) {
                Ok(()) => {
                    self.in_flight = Some(write.characteristic);
                    return;
                }
                Err(e) => {
                    warn!(characteristic = %write.characteristic, "Descriptor write rejected: {}", e);
                }
            }
        }
    }
}

/// Enable updates for every relevant characteristic. Returns how many
/// subscriptions were queued.
pub fn subscribe_all(
    services: &[GattService],
    queue: &mut DescriptorWriteQueue,
    platform: &dyn BlePlatform,
) -> usize {
    let mut queued = 0;
    for characteristic in services.iter().flat_map(|s| s.characteristics.iter()) {
        let Some(value) = subscription_for(characteristic) else {
            continue;
        };
        if let Err(e) = platform.set_characteristic_notification(&characteristic.uuid, true) {
            warn!(characteristic = %characteristic.uuid, "Failed to enable local notifications: {}", e);
            continue;
        }
        queue.enqueue(
            DescriptorWrite {
                characteristic: characteristic.uuid,
                value,
            },
            platform,
        );
        queued += 1;
    }
    info!("Subscribing to {} characteristics", queued);
    queued
}
