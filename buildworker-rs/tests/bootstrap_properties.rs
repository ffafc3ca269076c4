use pretty_assertions::assert_eq;
use serde_json::Value;

use buildworker_rs::domain::Domain;
use buildworker_rs::image::{registry_host, ImageReference};
use buildworker_rs::perimeter::{inbound_rules, Protocol};
use buildworker_rs::plan::{
    bootstrap_document, compute_instance_options, compute_instance_spec, ComputeSettings,
};
use buildworker_rs::proxy_config::{self, Stage};
use buildworker_rs::replacement::{diff, InstanceLifecycle, InstanceState};
use buildworker_rs::secrets::{BcryptHash, SecretBundle};

const HASH: &str = "$2a$14$alkJaDk17ojdhBWhAZdBRukqJVCT6zRXHW9GFyfFyx5Zze2RV3B/q";

fn secrets() -> SecretBundle {
    SecretBundle::new(BcryptHash::parse(HASH).unwrap())
}

fn ephemeral(ip: &str) -> Domain {
    Domain::ephemeral(ip.parse().unwrap())
}

fn managed(hostname: &str) -> Domain {
    Domain::ManagedRecord {
        hostname: hostname.to_string(),
        zone: "infra.example.com".to_string(),
    }
}

fn instance_spec(domain: &Domain, image: &str, secrets: &SecretBundle, vm_size: &str) -> Value {
    let document =
        bootstrap_document(domain, ImageReference::parse(image).unwrap(), secrets).unwrap();
    let settings = ComputeSettings {
        vm_size: vm_size.to_string(),
        ..Default::default()
    };
    let spec = compute_instance_spec(
        &settings,
        "caddy-rg".into(),
        "/nic/caddy-nic".into(),
        "ssh-ed25519 AAAA".into(),
        &document,
    );
    serde_json::to_value(spec).unwrap()
}

/// State of a running instance after moving from `old` to `new`.
fn state_after(old: &Value, new: &Value) -> InstanceState {
    let mut lifecycle = InstanceLifecycle::running();
    lifecycle
        .observe(&diff(&compute_instance_options(), old, new))
        .unwrap()
}

#[test]
fn synthesis_is_deterministic() {
    let domains = [ephemeral("1.2.3.4"), managed("worker-0")];
    let bundles = [
        secrets(),
        secrets().with_registry_credentials(Some("bot".into()), Some("s3cr3t".into())),
    ];

    for domain in &domains {
        for bundle in &bundles {
            let a = bootstrap_document(
                domain,
                ImageReference::parse("ghcr.io/org/img:tag").unwrap(),
                bundle,
            )
            .unwrap();
            let b = bootstrap_document(
                domain,
                ImageReference::parse("ghcr.io/org/img:tag").unwrap(),
                bundle,
            )
            .unwrap();
            assert_eq!(a.as_str(), b.as_str());
            assert_eq!(a.to_base64(), b.to_base64());
        }
    }
}

#[test]
fn registry_host_extraction() {
    assert_eq!(registry_host("ghcr.io/org/img:tag"), "ghcr.io");
    assert_eq!(registry_host("img:tag"), "");
    assert_eq!(
        ImageReference::parse("myregistry.azurecr.io/caddy:latest")
            .unwrap()
            .registry_host(),
        "myregistry.azurecr.io"
    );
}

#[test]
fn domain_variants() {
    assert_eq!(ephemeral("1.2.3.4").name(), "1.2.3.4.sslip.io");
    assert_eq!(managed("worker-0").name(), "worker-0.infra.example.com");
}

#[test]
fn route_shape_invariant() {
    for domain in [ephemeral("1.2.3.4"), ephemeral("10.9.8.7"), managed("worker-0")] {
        let config = proxy_config::build(&domain, &BcryptHash::parse(HASH).unwrap());
        let routes = config.routes();
        assert_eq!(routes.len(), 1);

        let route = &routes[0];
        assert_eq!(route.host(), domain.name());
        assert!(route.is_terminal());
        assert_eq!(route.chain().stages(), [Stage::Authentication, Stage::Build]);
        assert!(route.chain().build.purge_module_cache);
    }
}

#[test]
fn login_step_follows_credentials() {
    let domain = ephemeral("1.2.3.4");
    let image = || ImageReference::parse("ghcr.io/org/img:tag").unwrap();

    let with = bootstrap_document(
        &domain,
        image(),
        &secrets().with_registry_credentials(Some("bot".into()), Some("s3cr3t".into())),
    )
    .unwrap();
    assert!(with
        .as_str()
        .contains("echo 's3cr3t' | docker login ghcr.io -u 'bot' --password-stdin"));

    // Without credentials the guard evaluates to false at boot:
    let without = bootstrap_document(&domain, image(), &secrets()).unwrap();
    assert!(without.as_str().contains("if [ -n '' ] && [ -n '' ]; then"));
    assert!(!without.as_str().contains("s3cr3t"));
}

#[test]
fn content_changes_force_replacement() {
    let base_secrets = secrets();
    let base = instance_spec(&ephemeral("1.2.3.4"), "ghcr.io/org/img:tag", &base_secrets, "Standard_B4s_v2");

    let changes = [
        // Domain:
        instance_spec(&ephemeral("5.6.7.8"), "ghcr.io/org/img:tag", &base_secrets, "Standard_B4s_v2"),
        // Container image:
        instance_spec(&ephemeral("1.2.3.4"), "ghcr.io/org/img:v2", &base_secrets, "Standard_B4s_v2"),
        // Registry host:
        instance_spec(&ephemeral("1.2.3.4"), "docker.io/org/img:tag", &base_secrets, "Standard_B4s_v2"),
        // Credential presence:
        instance_spec(
            &ephemeral("1.2.3.4"),
            "ghcr.io/org/img:tag",
            &secrets().with_registry_credentials(Some("bot".into()), Some("s3cr3t".into())),
            "Standard_B4s_v2",
        ),
    ];

    for changed in &changes {
        assert_ne!(base["os_profile"]["custom_data"], changed["os_profile"]["custom_data"]);
        assert_eq!(state_after(&base, changed), InstanceState::PendingReplace);
    }
}

#[test]
fn size_change_does_not_replace() {
    let domain = ephemeral("1.2.3.4");
    let old = instance_spec(&domain, "ghcr.io/org/img:tag", &secrets(), "Standard_B4s_v2");
    let new = instance_spec(&domain, "ghcr.io/org/img:tag", &secrets(), "Standard_B8s_v2");

    assert_eq!(state_after(&old, &new), InstanceState::Running);
    assert_eq!(state_after(&old, &old.clone()), InstanceState::Running);
}

#[test]
fn security_group_completeness() {
    let rules = inbound_rules();
    let summary: Vec<(Protocol, &str)> = rules
        .iter()
        .map(|r| (r.protocol, r.destination_port_range.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (Protocol::Icmp, "*"),
            (Protocol::Tcp, "80"),
            (Protocol::Tcp, "443"),
            (Protocol::Tcp, "22"),
        ]
    );

    let priorities: Vec<u16> = rules.iter().map(|r| r.priority).collect();
    assert!(priorities.windows(2).all(|w| w[0] < w[1]));
}
