//! Loading gateway configuration files and building a gateway from them.

use ai_gateway::routing::Candidate;
use ai_gateway::{Gateway, GatewayConfig, ModelRole};
use std::path::PathBuf;
use std::time::Duration;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures").join(name)
}

#[test]
fn test_yaml_fixture_loads() {
    let config = GatewayConfig::from_path(fixture("gateway.yaml")).unwrap();

    assert_eq!(config.providers.len(), 3);
    assert_eq!(config.roles[&ModelRole::Synthesis].len(), 2);
    assert_eq!(config.fallback_model.as_deref(), Some("gpt-4o-mini"));
    assert_eq!(config.dispatch.call_timeout(), Duration::from_secs(30));
    assert_eq!(config.dispatch.retry_policy().base_backoff, Duration::from_millis(100));

    let orchestrator = config.orchestrator.to_config();
    assert_eq!(orchestrator.max_iterations, 5);
    assert_eq!(orchestrator.conversation_timeout, None);
    assert_eq!(orchestrator.max_parallel_tools, Some(4));
}

#[test]
fn test_json_fixture_loads() {
    let config = GatewayConfig::from_path(fixture("gateway.json")).unwrap();
    assert_eq!(config.providers[0].id, "anthropic");
    assert_eq!(config.selector.saturation_threshold, 0.5);
    assert!(config.orchestrator.stream);
}

#[test]
fn test_gateway_pools_from_fixture() {
    let config = GatewayConfig::from_path(fixture("gateway.yaml")).unwrap();
    let gateway = Gateway::from_config(config).unwrap();

    // `backup` outranks `openai` but its key variable is not set.
    let backup = gateway.registry().get("backup").unwrap();
    assert!(!backup.is_usable());

    let pools = gateway.pools(&gateway.scope()).unwrap();
    assert_eq!(
        pools.for_role(ModelRole::Planning).unwrap(),
        &[Candidate::new("openai", "gpt-4o-mini", 20_000)]
    );
    assert_eq!(
        pools.for_role(ModelRole::Synthesis).unwrap(),
        &[
            Candidate::new("openai", "gpt-4o", 30_000),
            Candidate::new("local", "llama3.1", 0),
        ]
    );
    // No summarization pool configured: it borrows the final-answer pool.
    assert_eq!(
        pools.for_role(ModelRole::Summarization).unwrap(),
        &[Candidate::new("openai", "gpt-4o", 30_000)]
    );
}

#[test]
fn test_unservable_model_uses_fallback() {
    let config = GatewayConfig::from_path(fixture("gateway.yaml")).unwrap();
    let gateway = Gateway::from_config(config).unwrap();

    let resolution = gateway.scope().resolve("mixtral-8x7b").unwrap();
    assert!(resolution.used_fallback);
    assert_eq!(resolution.model, "gpt-4o-mini");
    assert_eq!(resolution.providers[0].id, "openai");
}

#[test]
fn test_missing_file_is_configuration_error() {
    let err = GatewayConfig::from_path(fixture("does-not-exist.yaml")).unwrap_err();
    assert_eq!(err.kind_name(), "configuration");
}

#[test]
fn test_unknown_keys_rejected() {
    let err = GatewayConfig::from_yaml_str("providerz: []\n").unwrap_err();
    assert!(err.to_string().contains("providerz"), "{}", err);
}

#[test]
fn test_pin_to_unknown_provider_rejected() {
    let config = GatewayConfig::from_yaml_str(
        r#"
providers:
  - id: openai
    family: openai
    api_key: sk-x
roles:
  planning:
    - model: gpt-4o
      provider: azure
"#,
    )
    .unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("azure"), "{}", err);
}

#[test]
fn test_gateway_without_servable_roles_fails_to_chat() {
    let config = GatewayConfig::from_yaml_str(
        r#"
providers:
  - id: openai
    family: openai
    api_key_env: AI_GATEWAY_FIXTURE_UNSET_KEY
roles:
  final_answer: [gpt-4o]
"#,
    )
    .unwrap();
    let gateway = Gateway::from_config(config).unwrap();
    let err = gateway
        .pools(&gateway.scope())
        .expect_err("no usable provider");
    assert_eq!(err.kind_name(), "configuration");
}
