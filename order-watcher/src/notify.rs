//! Operator notification: a throttled summary of the most recent
//! operator-visible failure. The transport is out of scope (no Slack/Sentry
//! client), but the throttling logic itself — a minimum interval between
//! notifications, persisted on the registry — is in-scope and tested.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::error;
use types::ChainId;

use crate::registry::Registry;

/// Minimum interval between notifications for the same chain.
pub const MIN_INTERVAL: ChronoDuration = ChronoDuration::hours(2);

pub trait ErrorNotifier: Send + Sync {
    fn notify(&self, chain: ChainId, message: &str);
}

/// The default notifier: logs at `error` level. A real deployment would
/// swap this for a Slack/Sentry/Loggly client behind the same trait.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

impl ErrorNotifier for LoggingNotifier {
    fn notify(&self, chain: ChainId, message: &str) {
        error!(%chain, message, "operator notification");
    }
}

/// Notify `notifier` iff at least [`MIN_INTERVAL`] has elapsed since
/// `registry.last_notified_error`, then stamp the registry with `now`.
/// Returns whether a notification was actually emitted.
pub fn notify_throttled(
    notifier: &dyn ErrorNotifier,
    registry: &mut Registry,
    chain: ChainId,
    message: &str,
) -> bool {
    notify_throttled_at(notifier, registry, chain, message, Utc::now())
}

fn notify_throttled_at(
    notifier: &dyn ErrorNotifier,
    registry: &mut Registry,
    chain: ChainId,
    message: &str,
    now: DateTime<Utc>,
) -> bool {
    let due = match registry.last_notified_error {
        Some(last) => now - last >= MIN_INTERVAL,
        None => true,
    };
    if due {
        notifier.notify(chain, message);
        registry.last_notified_error = Some(now);
    }
    due
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingNotifier(Arc<Mutex<Vec<String>>>);

    impl ErrorNotifier for RecordingNotifier {
        fn notify(&self, _chain: ChainId, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn first_notification_is_never_throttled() {
        let notifier = RecordingNotifier::default();
        let mut registry = Registry::default();
        assert!(notify_throttled_at(
            &notifier,
            &mut registry,
            ChainId::new(1),
            "boom",
            Utc::now()
        ));
        assert_eq!(notifier.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn a_second_notification_within_the_interval_is_suppressed() {
        let notifier = RecordingNotifier::default();
        let mut registry = Registry::default();
        let now = Utc::now();
        assert!(notify_throttled_at(&notifier, &mut registry, ChainId::new(1), "first", now));
        assert!(!notify_throttled_at(
            &notifier,
            &mut registry,
            ChainId::new(1),
            "second",
            now + ChronoDuration::minutes(30)
        ));
        assert_eq!(notifier.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn a_notification_after_the_interval_elapses_is_sent() {
        let notifier = RecordingNotifier::default();
        let mut registry = Registry::default();
        let now = Utc::now();
        assert!(notify_throttled_at(&notifier, &mut registry, ChainId::new(1), "first", now));
        assert!(notify_throttled_at(
            &notifier,
            &mut registry,
            ChainId::new(1),
            "second",
            now + ChronoDuration::hours(3)
        ));
        assert_eq!(notifier.0.lock().unwrap().len(), 2);
    }
}
