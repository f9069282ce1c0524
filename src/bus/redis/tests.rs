use super::*;

#[test]
fn test_config_defaults() {
    let config = RedisBusConfig::default();
    assert_eq!(config.url, "redis://127.0.0.1:6379");
    assert_eq!(config.mailbox_capacity, 1);
    assert_eq!(config.max_retries, 10);
    assert_eq!(config.overflow, OverflowPolicy::Error);
    assert!(config.consumer_name.is_none());
}

#[test]
fn test_config_builders() {
    let config = RedisBusConfig::new("redis://broker:6380")
        .with_consumer_name("worker-1")
        .with_max_retries(3)
        .with_mailbox_capacity(8)
        .with_overflow(OverflowPolicy::BlockWithTimeout(Duration::from_millis(50)))
        .with_pending_idle(Duration::from_secs(5));

    assert_eq!(config.url, "redis://broker:6380");
    assert_eq!(config.consumer_name.as_deref(), Some("worker-1"));
    assert_eq!(config.max_retries, 3);
    assert_eq!(config.mailbox_capacity, 8);
    assert_eq!(config.pending_idle, Duration::from_secs(5));
}

#[test]
fn test_resolve_group_named_competes() {
    assert_eq!(resolve_group("workers"), "workers");
}

#[test]
fn test_resolve_group_broadcast_is_synthetic_and_unique() {
    let a = resolve_group("*");
    let b = resolve_group("*");
    assert!(a.starts_with("bcast-"));
    assert!(b.starts_with("bcast-"));
    assert_ne!(a, b);

    assert!(resolve_group("").starts_with("bcast-"));
}
