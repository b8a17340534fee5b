//! Business handler seam

use async_trait::async_trait;

/// One element of the ordered handler chain for a record type
///
/// Handlers receive decoded images by reference and run in registration
/// order. A returned error is logged by the router and never stops the
/// chain or the stream; the event's offset is acknowledged regardless, so
/// a handler that must not lose work owns its own retry or dead-letter
/// policy.
#[async_trait]
pub trait ChangeHandler<T>: Send + Sync {
    /// A row was inserted; `after` is the new image
    async fn create(&self, after: &T) -> anyhow::Result<()>;

    /// A row was updated; `before` is present only when the event carried
    /// the pre-change image
    async fn update(&self, before: Option<&T>, after: &T) -> anyhow::Result<()>;

    /// A row was deleted; `record` is the image decoded from the event's
    /// `data` block
    async fn delete(&self, record: &T) -> anyhow::Result<()>;
}
