use anyhow::Result;

use crate::config::Config;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("METRICS_PORT".into(), "7002".into()),
        ("NAMESPACE".into(), "default".into()),
        ("POD_NAME".into(), "lodestone-operator-0".into()),
    ])?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(
        config.metrics_port == 7002,
        "unexpected value parsed for METRICS_PORT, got {}, expected {}",
        config.metrics_port,
        "7002"
    );
    assert!(config.namespace == "default", "unexpected value parsed for NAMESPACE, got {}, expected {}", config.namespace, "default");
    assert!(
        config.pod_name == "lodestone-operator-0",
        "unexpected value parsed for POD_NAME, got {}, expected {}",
        config.pod_name,
        "lodestone-operator-0"
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("NAMESPACE".into(), "default".into()),
        ("POD_NAME".into(), "lodestone-operator-0".into()),
    ])?;

    assert!(
        config.metrics_port == 7002,
        "unexpected default derived for METRICS_PORT, got {}, expected {}",
        config.metrics_port,
        "7002"
    );

    Ok(())
}
