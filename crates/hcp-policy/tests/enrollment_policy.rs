// SPDX-License-Identifier: MIT OR Apache-2.0
//! Evaluates a realistic enrollment-service policy document end to end:
//! hook dispatch via jump, a scoped call over the request profile, and
//! env-driven expansion of both policy and data.

use hcp_policy::{Decision, Policy, run_with_env};
use serde_json::json;

fn enrollment_policy() -> String {
    json!({
        "_": "Gate enrollment requests; everything else is rejected.",
        "default": "reject",
        "start": "main",
        "filters": {
            "main": [
                {
                    "_": "Only enrollment hooks are handled here.",
                    "action": "jump",
                    "jump": "check_add",
                    "if": {"equal": ".hookname", "value": "enrollsvc::add_request"}
                },
                {"action": "reject"}
            ],
            "check_add": [
                {
                    "action": "reject",
                    "if": {"elementof": ".hostname", "value": ["forbidden", "localhost"]}
                },
                {
                    "action": "call",
                    "call": "check_auth",
                    "scope": ".auth",
                    "on-return": "next"
                },
                {"action": "accept"}
            ],
            "check_auth": [
                {"action": "reject", "if": {"not-exist": ".client_cert"}},
                {"action": "return"}
            ]
        }
    })
    .to_string()
}

fn request(hostname: &str, with_cert: bool) -> serde_json::Value {
    let mut req = json!({
        "hookname": "enrollsvc::add_request",
        "hostname": hostname,
        "auth": {}
    });
    if with_cert {
        req["auth"]["client_cert"] = json!("-----BEGIN CERTIFICATE-----...");
    }
    req
}

#[test]
fn well_formed_requests_are_accepted() {
    let policy = Policy::parse(&enrollment_policy()).unwrap();
    let verdict = policy.run(&request("host1.example.com", true));
    assert!(verdict.accepted());
    assert_eq!(verdict.last_filter.as_deref(), Some("check_add_2"));
}

#[test]
fn forbidden_hostnames_are_rejected() {
    let policy = Policy::parse(&enrollment_policy()).unwrap();
    let verdict = policy.run(&request("forbidden", true));
    assert_eq!(verdict.action, Decision::Reject);
    assert_eq!(verdict.last_filter.as_deref(), Some("check_add_0"));
}

#[test]
fn missing_client_cert_is_rejected_inside_the_scoped_call() {
    let policy = Policy::parse(&enrollment_policy()).unwrap();
    let verdict = policy.run(&request("host1.example.com", false));
    assert_eq!(verdict.action, Decision::Reject);
    assert_eq!(verdict.last_filter.as_deref(), Some("check_auth_0"));
}

#[test]
fn unknown_hooks_fall_through_to_reject() {
    let policy = Policy::parse(&enrollment_policy()).unwrap();
    let verdict = policy.run(&json!({"hookname": "kdcsvc::something"}));
    assert_eq!(verdict.action, Decision::Reject);
    assert_eq!(verdict.last_filter.as_deref(), Some("main_1"));
}

#[test]
fn env_vars_parameterise_the_policy() {
    let policy = json!({
        "default": "reject",
        "start": "gate",
        "filters": {
            "gate": {
                "action": "accept",
                "if": {"equal": ".domain", "value": "{ENROLL_DOMAIN}"},
                "otherwise": "reject"
            }
        }
    })
    .to_string();

    let data = json!({
        "domain": "example.com",
        "__env": {"ENROLL_DOMAIN": "example.com"}
    });
    assert!(run_with_env(&policy, &data, true).unwrap().accepted());

    let data = json!({
        "domain": "evil.org",
        "__env": {"ENROLL_DOMAIN": "example.com"}
    });
    assert!(!run_with_env(&policy, &data, true).unwrap().accepted());
}
