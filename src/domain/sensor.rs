//! Vendor-neutral sensor interface.

use crate::domain::models::{PairingEvent, ScanEvent, SensorIdentity};
use crate::domain::status::StatusReader;
use tokio::sync::mpsc;

/// Capabilities every wearable sensor offers to the application.
///
/// Operations are fire-and-forget; their outcome arrives on the returned
/// receivers or through the published status. Dropping a receiver
/// unsubscribes.
pub trait SensorDevice: Send + Sync {
    /// Start discovery. Failures, including a disabled radio, arrive as
    /// [`ScanEvent::Failed`].
    fn start_scan(&self) -> mpsc::UnboundedReceiver<ScanEvent>;

    fn stop_scan(&self);

    /// Pair with a device reported by the last scan.
    fn pair(&self, address: &str) -> mpsc::UnboundedReceiver<PairingEvent>;

    fn cancel_pairing(&self);

    fn unpair(&self);

    fn start_synchronization(&self);

    fn acquire_battery_level(&self);

    fn current_device(&self) -> Option<SensorIdentity>;

    fn status(&self) -> StatusReader;
}
