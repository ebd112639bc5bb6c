//! Tunnel injector tests

use dockyard::compose::{ComposeDocument, InjectorConfig, TunnelInjector};
use dockyard::models::deployment::TunnelConfig;

use crate::common::tunnel_config;

const WEB_STACK: &str = r#"
services:
  web:
    image: nginx:1.27
    ports:
      - "8080:80"
    volumes:
      - web_data:/usr/share/nginx/html
    deploy:
      resources:
        limits:
          memory: 256M
  db:
    image: postgres:16
    environment:
      POSTGRES_PASSWORD: example
volumes:
  web_data:
"#;

fn injector() -> TunnelInjector {
    TunnelInjector::new(InjectorConfig::default(), tunnel_config())
}

#[test]
fn test_inject_adds_agent_and_network() {
    let doc = ComposeDocument::parse(WEB_STACK).unwrap();
    let (out, report) = injector().inject(doc);

    assert!(report.valid, "issues: {:?}", report.issues);
    assert!(report.has_tunnel_agent);
    assert!(report.network_ok);

    let agent = &out.services["newt"];
    assert_eq!(agent.image.as_deref(), Some("fosrl/newt:latest"));
    let env = agent.env_map();
    assert_eq!(env["PANGOLIN_ENDPOINT"], "https://pangolin.example.com");
    assert_eq!(env["NEWT_ID"], "newt-123");
    assert_eq!(env["NEWT_SECRET"], "s3cret");
    assert!(agent
        .volumes
        .iter()
        .any(|m| m.source().as_deref() == Some("/var/run/docker.sock") && m.read_only()));

    assert!(out.networks.contains_key("app_network"));
    for name in ["web", "db", "newt"] {
        assert!(out.services[name].has_network("app_network"), "{} not networked", name);
    }
}

#[test]
fn test_inject_is_idempotent() {
    let doc = ComposeDocument::parse(WEB_STACK).unwrap();
    let (once, _) = injector().inject(doc);
    let (twice, report) = injector().inject(once.clone());

    assert_eq!(once, twice);
    assert!(report.applied.is_empty());
    assert!(injector().preview(&once).is_empty());
}

#[test]
fn test_inject_source_keeps_unknown_keys() {
    let (source, report) = injector().inject_source(WEB_STACK).unwrap();
    assert!(report.valid);

    let value: serde_yaml::Value = serde_yaml::from_str(&source).unwrap();
    assert_eq!(
        value["services"]["web"]["deploy"]["resources"]["limits"]["memory"],
        serde_yaml::Value::String("256M".to_string())
    );
    assert!(value["volumes"]["web_data"].is_null() || value["volumes"]["web_data"].is_mapping());

    // feeding the output back changes nothing
    let (again, report) = injector().inject_source(&source).unwrap();
    assert_eq!(again, source);
    assert!(report.applied.is_empty());
}

#[test]
fn test_misconfigured_agent_is_replaced() {
    let source = r#"
services:
  app:
    image: alpine
  newt:
    image: fosrl/newt:latest
    environment:
      - NEWT_ID=stale
"#;
    let doc = ComposeDocument::parse(source).unwrap();

    let before = injector().validate(&doc);
    assert!(!before.valid);
    assert!(before
        .issues
        .iter()
        .any(|i| i.contains("missing required environment variables")));

    let summary = injector().preview(&doc);
    assert!(summary.replace_tunnel_agent);
    assert!(!summary.add_tunnel_agent);

    let (out, report) = injector().inject(doc);
    assert!(report.valid, "issues: {:?}", report.issues);
    assert_eq!(out.services["newt"].env_map()["NEWT_ID"], "newt-123");
}

#[test]
fn test_preview_does_not_modify() {
    let doc = ComposeDocument::parse(WEB_STACK).unwrap();
    let copy = doc.clone();
    let summary = injector().preview(&doc);

    assert_eq!(doc, copy);
    assert!(summary.add_tunnel_agent);
    assert!(summary.add_default_network);
    assert_eq!(summary.add_network_membership, vec!["db", "web"]);
    assert!(summary.tunnel_service.is_some());
}

#[test]
fn test_validate_without_agent_suggests_adding_it() {
    let doc = ComposeDocument::parse(WEB_STACK).unwrap();
    let report = injector().validate(&doc);

    assert!(report.valid);
    assert!(!report.has_tunnel_agent);
    assert!(!report.network_ok);
    assert!(report
        .suggestions
        .contains(&"Add newt service for remote tunnel access".to_string()));
}

#[test]
fn test_malformed_source_is_rejected() {
    let err = injector().inject_source("services: [unclosed").unwrap_err();
    assert!(matches!(err, dockyard::errors::DockyardError::ParseError(_)));
}

#[test]
fn test_custom_service_name() {
    let config = InjectorConfig {
        service_name: "tunnel".to_string(),
        ..InjectorConfig::default()
    };
    let injector = TunnelInjector::new(
        config,
        TunnelConfig {
            image: Some("fosrl/newt:1.4".to_string()),
            ..tunnel_config()
        },
    );
    let (out, report) = injector.inject(ComposeDocument::parse(WEB_STACK).unwrap());

    assert!(report.valid);
    assert!(!out.services.contains_key("newt"));
    assert_eq!(out.services["tunnel"].image.as_deref(), Some("fosrl/newt:1.4"));
}
