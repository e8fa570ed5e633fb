use super::*;

#[test]
fn defaults_resolve_without_any_source() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
    assert!(settings.cache.enabled);
    assert_eq!(settings.cache.timeout, Duration::from_secs(300));
    assert_eq!(settings.cache.key_prefix, "quire");
    assert!(!settings.cache.anonymous_only);
    assert_eq!(settings.store.backend, StoreBackend::Memory);
    assert!(!settings.bus.is_configured());
    assert_eq!(settings.bus.port, 61613);
    assert_eq!(settings.bus.topic, "/topic/ella");
    assert!(!settings.bus.invalidate_before_commit);
    assert_eq!(settings.bus.reconnect_backoff, Duration::from_secs(5));
    assert_eq!(
        settings.bus.registration_retention,
        Duration::from_secs(86_400)
    );
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());
    raw.cache.timeout_seconds = Some(60);

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        cache_timeout_seconds: Some(900),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.cache.timeout, Duration::from_secs(900));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.logging.format, LogFormat::Json);
}

#[test]
fn broker_host_enables_bus() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        broker: BrokerOverrides {
            bus_host: Some("mq.internal".to_string()),
            bus_port: Some(61614),
            bus_topic: None,
        },
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(settings.bus.is_configured());
    assert_eq!(settings.bus.host.as_deref(), Some("mq.internal"));
    assert_eq!(settings.bus.port, 61614);
}

#[test]
fn blank_broker_host_is_treated_as_unset() {
    let mut raw = RawSettings::default();
    raw.bus.host = Some("   ".to_string());

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(!settings.bus.is_configured());
}

#[test]
fn zero_cache_timeout_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.timeout_seconds = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero timeout should fail");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.timeout_seconds",
            ..
        }
    ));
}

#[test]
fn cache_timeout_beyond_max_ttl_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.timeout_seconds = Some(u64::MAX);

    let err = Settings::from_raw(raw).expect_err("huge timeout should fail");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.timeout_seconds",
            ..
        }
    ));
}

#[test]
fn key_prefix_with_whitespace_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.key_prefix = Some("site a".to_string());

    let err = Settings::from_raw(raw).expect_err("whitespace prefix should fail");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.key_prefix",
            ..
        }
    ));
}

#[test]
fn redis_backend_requires_url() {
    let mut raw = RawSettings::default();
    raw.store.backend = Some("redis".to_string());

    let err = Settings::from_raw(raw).expect_err("redis without url should fail");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "store.redis_url",
            ..
        }
    ));
}

#[test]
fn unknown_store_backend_is_rejected() {
    let mut raw = RawSettings::default();
    raw.store.backend = Some("memcached".to_string());

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn subscribe_overrides_only_touch_bus_and_store() {
    let mut raw = RawSettings::default();
    raw.apply_broker_overrides(&BrokerOverrides {
        bus_host: Some("localhost".to_string()),
        bus_port: None,
        bus_topic: Some("/topic/pages".to_string()),
    });
    raw.apply_store_overrides(&StoreOverrides {
        store_backend: Some("redis".to_string()),
        store_redis_url: Some("redis://127.0.0.1/".to_string()),
    });

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.bus.topic, "/topic/pages");
    assert_eq!(settings.store.backend, StoreBackend::Redis);
    assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
}

#[test]
fn topic_must_be_a_destination_path() {
    let mut raw = RawSettings::default();
    raw.bus.topic = Some("topic.ella".to_string());

    assert!(Settings::from_raw(raw).is_err());
}
