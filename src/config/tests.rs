use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serial_test::serial;

use super::*;
use crate::utils::BrokerError;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.broker.name, "brokercore");
    assert_eq!(settings.destinations.queue_prefetch, 1000);
    assert_eq!(settings.destinations.topic_prefetch, 1000);
    assert_eq!(settings.destinations.max_active_consumers, -1);
    assert_eq!(settings.destinations.max_failover_consumers, 0);
    assert_eq!(settings.destinations.limit_behavior, LimitBehavior::RejectNewest);
    assert_eq!(settings.destinations.max_consecutive_rollbacks, 0);
    assert!(settings.consumers.flow_control);
    assert_eq!(settings.consumers.unlimited_batch, 1000);
    assert!(settings.persistence.path.is_none());
    assert_eq!(settings.logging.level, "info");
    assert!(settings.validate().is_ok());
}

#[test]
#[serial]
fn test_load_config_defaults_without_env() {
    temp_env::with_vars_unset(
        [
            "BROKER__DESTINATIONS__QUEUE_PREFETCH",
            "BROKER__LOGGING__LEVEL",
        ],
        || {
            let settings = load_config().unwrap();
            assert_eq!(settings, Settings::default());
        },
    );
}

#[test]
#[serial]
fn test_load_config_from_env() {
    temp_env::with_vars(
        [
            ("BROKER__DESTINATIONS__QUEUE_PREFETCH", Some("50")),
            ("BROKER__DESTINATIONS__LIMIT_BEHAVIOR", Some("remove_oldest")),
            ("BROKER__DESTINATIONS__LOCAL_DELIVERY_PREFERRED", Some("true")),
            ("BROKER__LOGGING__LEVEL", Some("debug")),
        ],
        || {
            let settings = load_config().unwrap();
            assert_eq!(settings.destinations.queue_prefetch, 50);
            assert_eq!(settings.destinations.limit_behavior, LimitBehavior::RemoveOldest);
            assert!(settings.destinations.local_delivery_preferred);
            assert_eq!(settings.logging.level, "debug");
            // untouched values keep their defaults
            assert_eq!(settings.destinations.topic_prefetch, 1000);
        },
    );
}

#[test]
#[serial]
fn test_load_config_rejects_invalid_env() {
    temp_env::with_var("BROKER__DESTINATIONS__QUEUE_PREFETCH", Some("0"), || {
        let err = load_config().unwrap_err();
        assert!(matches!(err, BrokerError::InvalidConfig(_)));
    });
}

#[test]
fn test_partial_merge_keeps_defaults() {
    let partial = PartialSettings {
        destinations: Some(settings::PartialDestinationSettings {
            max_active_consumers: Some(1),
            max_failover_consumers: Some(1),
            ..Default::default()
        }),
        ..Default::default()
    };
    let merged = partial.merge(Settings::default());
    assert_eq!(merged.destinations.max_active_consumers, 1);
    assert_eq!(merged.destinations.max_failover_consumers, 1);
    assert_eq!(merged.destinations.queue_prefetch, 1000);
    assert_eq!(merged.broker, Settings::default().broker);
}

#[test]
fn test_validate_rejects_out_of_range() {
    let mut settings = Settings::default();
    settings.destinations.max_active_consumers = -2;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.destinations.max_active_consumers = 0;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.destinations.topic_prefetch = -5;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.consumers.unlimited_batch = 0;
    assert!(settings.validate().is_err());
}

#[test]
fn test_watcher_notifies_listeners_with_old_and_new() {
    let watcher = ConfigWatcher::new(Settings::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    watcher.subscribe(Box::new(move |old, new| {
        assert_eq!(old.destinations.queue_prefetch, 1000);
        assert_eq!(new.destinations.queue_prefetch, 10);
        seen.fetch_add(1, Ordering::SeqCst);
    }));

    let mut next = Settings::default();
    next.destinations.queue_prefetch = 10;
    watcher.update(next.clone()).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(watcher.current().destinations.queue_prefetch, 10);

    // Same settings again: nothing changes, nobody is called.
    watcher.update(next).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_watcher_rejects_invalid_update_without_applying() {
    let watcher = ConfigWatcher::new(Settings::default()).unwrap();
    let mut bad = Settings::default();
    bad.destinations.queue_prefetch = 0;
    assert!(watcher.update(bad).is_err());
    assert_eq!(watcher.current().destinations.queue_prefetch, 1000);
}
