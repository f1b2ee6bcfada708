//! Location module - where the proxy gets the fix it writes into reports
//!
//! Sessions only ever see a `LocationSource` and ask it for the current fix
//! once per chunk. Sources:
//! - `StaticLocation`: a fixed position from the configuration
//! - `SharedLocation`: the latest fix published by a background task such as
//!   `GpsdClient`

mod gpsd;

pub use gpsd::*;

use tokio::sync::watch;

pub use crate::protocol::GpsFix;

/// Query interface for the current position
pub trait LocationSource: Send + Sync {
    /// The latest fix, or `None` when no position is known
    fn current_fix(&self) -> Option<GpsFix>;
}

/// A location that never moves
#[derive(Debug, Clone, Copy)]
pub struct StaticLocation {
    fix: GpsFix,
}

impl StaticLocation {
    pub fn new(fix: GpsFix) -> Self {
        Self { fix }
    }
}

impl LocationSource for StaticLocation {
    fn current_fix(&self) -> Option<GpsFix> {
        Some(self.fix)
    }
}

/// Read side of a fix published through a watch channel
#[derive(Debug, Clone)]
pub struct SharedLocation {
    rx: watch::Receiver<Option<GpsFix>>,
}

impl SharedLocation {
    /// Create a publisher and the matching source, starting with no fix
    pub fn channel() -> (watch::Sender<Option<GpsFix>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }
}

impl LocationSource for SharedLocation {
    fn current_fix(&self) -> Option<GpsFix> {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_location() {
        let source = StaticLocation::new(GpsFix::new(1.0, 2.0, 3.0));
        assert_eq!(source.current_fix(), Some(GpsFix::new(1.0, 2.0, 3.0)));
    }

    #[test]
    fn test_shared_location_follows_publisher() {
        let (tx, source) = SharedLocation::channel();
        assert_eq!(source.current_fix(), None);

        tx.send_replace(Some(GpsFix::new(4.0, 5.0, 6.0)));
        assert_eq!(source.current_fix(), Some(GpsFix::new(4.0, 5.0, 6.0)));

        tx.send_replace(None);
        assert_eq!(source.clone().current_fix(), None);
    }
}
