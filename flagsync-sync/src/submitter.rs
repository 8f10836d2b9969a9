//! Seam for the event/impression submission subsystem.

/// Recorder-flushing subsystem controlled by the sync manager. Started only
/// while the user consent state allows tracking data to leave the device.
pub trait Submitter: Send + Sync {
    fn start(&self);
    fn stop(&self);
}
