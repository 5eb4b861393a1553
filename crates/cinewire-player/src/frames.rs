use async_trait::async_trait;

use cinewire_schema::FrameSample;

/// Capture collaborator. Acquisition may be denied; a denied device is a
/// degraded mode, not an error.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Take the capture device. Returns false when access is denied.
    async fn acquire(&self) -> bool;

    async fn release(&self);

    /// Grab one sample, or None when the device is unavailable.
    async fn capture_sample(&self) -> Option<FrameSample>;
}

/// Capture stand-in for headless runs: acquisition is always denied, so
/// telemetry falls through to the synthesized default reading.
pub struct NullFrameSource;

#[async_trait]
impl FrameSource for NullFrameSource {
    async fn acquire(&self) -> bool {
        false
    }

    async fn release(&self) {}

    async fn capture_sample(&self) -> Option<FrameSample> {
        None
    }
}
