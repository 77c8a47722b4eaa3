//! Tests for the Boxcar provider: configuration, image alias resolution,
//! and the boot protocol against a stubbed control plane.

use rstest::rstest;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;

fn config_pairs(endpoint: &str) -> Vec<(String, String)> {
    [
        ("ENDPOINT", endpoint),
        ("SSH_KEY_PATH", "/dev/null"),
        ("SSH_KEY_PASSPHRASE", "passphrase"),
        ("KEYCHAIN_PASSWORD", "keychain"),
        ("IMAGE_ALIASES", "jvm,language_clojure"),
        ("IMAGE_ALIAS_JVM", "jvm-template-id"),
        ("IMAGE_ALIAS_LANGUAGE_CLOJURE", "jvm-template-id"),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_owned(), value.to_owned()))
    .collect()
}

fn provider_for(endpoint: &str, extra: &[(&str, &str)]) -> BoxcarProvider {
    let mut pairs = config_pairs(endpoint);
    for (key, value) in extra {
        pairs.retain(|(existing, _)| existing != key);
        pairs.push(((*key).to_owned(), (*value).to_owned()));
    }
    BoxcarProvider::new(&ProviderConfig::from_map(pairs))
        .unwrap_or_else(|err| panic!("provider should build: {err}"))
}

fn clojure_attributes() -> StartAttributes {
    StartAttributes {
        language: String::from("clojure"),
        ..StartAttributes::default()
    }
}

fn instance_body(id: &str, state: &str, ips: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "data": [{
            "id": id,
            "ip-addresses": ips,
            "state": state,
            "base-image": "jvm-template-id",
            "type": "instances",
        }]
    })
}

#[rstest]
#[case::endpoint("ENDPOINT")]
#[case::image_aliases("IMAGE_ALIASES")]
#[case::ssh_key_path("SSH_KEY_PATH")]
#[case::ssh_key_passphrase("SSH_KEY_PASSPHRASE")]
#[case::keychain_password("KEYCHAIN_PASSWORD")]
fn construction_requires_key(#[case] missing: &str) {
    let pairs: Vec<_> = config_pairs("http://token@boxcar.test/")
        .into_iter()
        .filter(|(key, _)| key != missing)
        .collect();
    let err = BoxcarProvider::new(&ProviderConfig::from_map(pairs)).expect_err("missing key");
    assert!(
        matches!(err, ProviderError::Config(ref message) if message.contains(missing)),
        "unexpected error: {err}"
    );
}

#[test]
fn construction_requires_every_alias_mapping() {
    let mut pairs = config_pairs("http://token@boxcar.test/");
    pairs.retain(|(key, _)| key != "IMAGE_ALIAS_JVM");
    let err = BoxcarProvider::new(&ProviderConfig::from_map(pairs)).expect_err("missing alias");
    assert!(
        matches!(err, ProviderError::Config(ref message) if message.contains("jvm")),
        "unexpected error: {err}"
    );
}

#[test]
fn alias_keys_are_uppercased_with_non_alphanumerics_replaced() {
    assert_eq!(normalize_alias("osx10.11"), "OSX10_11");
    assert_eq!(normalize_alias("dist_trusty"), "DIST_TRUSTY");
    assert_eq!(normalize_alias("a-b c"), "A_B_C");

    let provider = provider_for(
        "http://token@boxcar.test/",
        &[
            ("IMAGE_ALIASES", "osx10.11"),
            ("IMAGE_ALIAS_OSX10_11", "el-capitan-image"),
        ],
    );
    let attributes = StartAttributes {
        osx_image: String::from("osx10.11"),
        ..StartAttributes::default()
    };
    assert_eq!(provider.image_name(&attributes), Some("el-capitan-image"));
}

fn precedence_provider() -> BoxcarProvider {
    provider_for(
        "http://token@boxcar.test/",
        &[
            (
                "IMAGE_ALIASES",
                "xcode7,osx_image_xcode7,osx_image_xcode8,dist_trusty_ruby,dist_trusty,\
                 group_edge_ruby,group_edge,language_ruby,default_linux",
            ),
            ("IMAGE_ALIAS_XCODE7", "raw-osx-image"),
            ("IMAGE_ALIAS_OSX_IMAGE_XCODE7", "prefixed-osx-image"),
            ("IMAGE_ALIAS_OSX_IMAGE_XCODE8", "xcode8-image"),
            ("IMAGE_ALIAS_DIST_TRUSTY_RUBY", "dist-lang-image"),
            ("IMAGE_ALIAS_DIST_TRUSTY", "dist-image"),
            ("IMAGE_ALIAS_GROUP_EDGE_RUBY", "group-lang-image"),
            ("IMAGE_ALIAS_GROUP_EDGE", "group-image"),
            ("IMAGE_ALIAS_LANGUAGE_RUBY", "language-image"),
            ("IMAGE_ALIAS_DEFAULT_LINUX", "default-image"),
        ],
    )
}

#[rstest]
#[case::raw_osx_image_wins(
    StartAttributes { osx_image: String::from("xcode7"), language: String::from("ruby"), ..StartAttributes::default() },
    Some("raw-osx-image")
)]
#[case::prefixed_osx_image(
    StartAttributes { osx_image: String::from("xcode8"), ..StartAttributes::default() },
    Some("xcode8-image")
)]
#[case::dist_with_language(
    StartAttributes { dist: String::from("trusty"), language: String::from("ruby"), ..StartAttributes::default() },
    Some("dist-lang-image")
)]
#[case::dist_alone(
    StartAttributes { dist: String::from("trusty"), language: String::from("python"), ..StartAttributes::default() },
    Some("dist-image")
)]
#[case::group_with_language(
    StartAttributes { group: String::from("edge"), language: String::from("ruby"), ..StartAttributes::default() },
    Some("group-lang-image")
)]
#[case::group_alone(
    StartAttributes { group: String::from("edge"), language: String::from("go"), ..StartAttributes::default() },
    Some("group-image")
)]
#[case::language_fallback(
    StartAttributes { language: String::from("ruby"), ..StartAttributes::default() },
    Some("language-image")
)]
#[case::os_default(
    StartAttributes { os: String::from("linux"), language: String::from("go"), ..StartAttributes::default() },
    Some("default-image")
)]
#[case::no_match(
    StartAttributes { language: String::from("haskell"), ..StartAttributes::default() },
    None
)]
fn image_name_follows_the_precedence_list(
    #[case] attributes: StartAttributes,
    #[case] expected: Option<&str>,
) {
    let provider = precedence_provider();
    assert_eq!(provider.image_name(&attributes), expected);
}

#[test]
fn language_aliases_resolve_through_the_group_mapping() {
    let provider = provider_for("http://token@boxcar.test/", &[]);
    assert_eq!(
        provider.image_name(&clojure_attributes()),
        Some("jvm-template-id")
    );
}

#[tokio::test]
async fn start_without_a_matching_alias_fails() {
    let provider = provider_for("http://token@boxcar.test/", &[]);
    let attributes = StartAttributes {
        language: String::from("haskell"),
        ..StartAttributes::default()
    };
    let err = provider
        .start(&JobCancellation::new(), &attributes)
        .await
        .expect_err("no alias should match");
    assert!(
        matches!(err, ProviderError::NoImageAlias { ref language, .. } if language == "haskell"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn start_polls_until_the_instance_is_ssh_reachable() {
    let server = MockServer::start().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind listener: {err}"));
    let ssh_port = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("listener addr: {err}"))
        .port();
    tokio::spawn(async move {
        while let Ok((_stream, _addr)) = listener.accept().await {}
    });

    Mock::given(method("POST"))
        .and(path("/instances"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(instance_body("instance-id", "queued", &[])),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/instances/instance-id"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(instance_body("instance-id", "queued", &[])),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/instances/instance-id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(instance_body(
            "instance-id",
            "running",
            &["fe80::1", "127.0.0.1"],
        )))
        .mount(&server)
        .await;

    let mut provider = provider_for(&server.uri(), &[("BOOT_POLL_SLEEP", "10ms")]);
    provider.ssh.port = ssh_port;

    let instance = provider
        .start(&JobCancellation::new(), &clojure_attributes())
        .await
        .unwrap_or_else(|err| panic!("start should succeed: {err}"));
    assert_eq!(instance.id(), "instance-id:jvm-template-id");
}

#[tokio::test]
async fn cancelling_a_boot_stops_the_partial_instance() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/instances"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(instance_body("instance-id", "queued", &[])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/instances/instance-id"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(instance_body("instance-id", "queued", &[])),
        )
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/instances/instance-id"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider_for(&server.uri(), &[("BOOT_POLL_SLEEP", "10ms")]);
    let cancel = JobCancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel(CancelReason::HardTimeout);
    });

    let err = provider
        .start(&cancel, &clojure_attributes())
        .await
        .expect_err("cancelled boot should fail");
    assert!(
        matches!(
            err,
            ProviderError::Cancelled {
                reason: CancelReason::HardTimeout
            }
        ),
        "unexpected error: {err}"
    );
    server.verify().await;
}

#[tokio::test]
async fn create_failures_surface_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/instances"))
        .respond_with(ResponseTemplate::new(500).set_body_string("kaboom"))
        .mount(&server)
        .await;

    let provider = provider_for(&server.uri(), &[]);
    let err = provider
        .start(&JobCancellation::new(), &clojure_attributes())
        .await
        .expect_err("create should fail");
    assert!(
        matches!(err, ProviderError::Api { status: 500, ref body } if body.contains("kaboom")),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn the_endpoint_userinfo_token_becomes_an_authorization_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/instances"))
        .and(header("authorization", "token sometoken"))
        .respond_with(ResponseTemplate::new(500).set_body_string("auth-checked"))
        .mount(&server)
        .await;

    let endpoint = format!("http://sometoken@{}/", server.address());
    let provider = provider_for(&endpoint, &[]);
    let err = provider
        .start(&JobCancellation::new(), &clojure_attributes())
        .await
        .expect_err("stub answers 500");
    assert!(
        matches!(err, ProviderError::Api { status: 500, ref body } if body == "auth-checked"),
        "unexpected error: {err}"
    );
}

#[test]
fn instances_without_a_payload_are_unidentified() {
    let provider = provider_for("http://token@boxcar.test/", &[]);
    let instance = provider.instance(None);
    assert_eq!(instance.id(), "{unidentified}");
}

#[test]
fn wrapper_script_waits_on_the_probe_port_and_propagates_the_exit_status() {
    let script = wrapper_script();
    assert!(script.starts_with("#!/bin/bash"));
    assert!(script.contains(&format!("until nc 127.0.0.1 {PROBE_PORT}")));
    assert!(script.contains("exec bash ~/build.sh"));
    assert!(script.contains("exit $(cat ~/build.sh.exit)"));
}

#[test]
fn metric_image_names_keep_safe_characters_only() {
    assert_eq!(metric_image_name("osx 10.11/beta"), "osx-10.11-beta");
    assert_eq!(metric_image_name("plain-image_1:2"), "plain-image_1:2");
}

#[test]
fn first_ipv4_skips_ipv6_and_garbage() {
    let addresses = [
        String::from("fe80::1"),
        String::from("not-an-ip"),
        String::from("192.0.2.1"),
    ];
    assert_eq!(
        first_ipv4(&addresses),
        Some("192.0.2.1".parse().unwrap_or_else(|err| panic!("{err}")))
    );
    assert_eq!(first_ipv4(&[String::from("fe80::1")]), None);
}
