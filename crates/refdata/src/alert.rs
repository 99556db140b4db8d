//! Alerting capability, injected instead of living in global state
//!
//! Delivery (mail, webhook, ...) is an external collaborator; the trait is
//! fire-and-forget so no caller ever blocks on a slow alert channel.

use tracing::error;

pub trait Alerter: Send + Sync {
    fn alert_error(&self, message: &str, detail: &str);
}

/// Routes alerts into the log stream. The default wiring until a real
/// delivery backend is attached.
pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn alert_error(&self, message: &str, detail: &str) {
        error!(alert = true, detail = %detail, "{}", message);
    }
}

/// Discards alerts. Test wiring.
pub struct NoopAlerter;

impl Alerter for NoopAlerter {
    fn alert_error(&self, _message: &str, _detail: &str) {}
}
