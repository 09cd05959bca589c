//! Registry catalog-building invariants: port uniqueness, promotion of
//! manifest entries over filesystem-discovered peers, missing core-service
//! detection, deterministic port derivation, and dependency ordering.
#[path = "common/mod.rs"]
mod common;

use common::{env_lock, managed_python_entry, Fixture};
use helmd::registry::Registry;
use helmd::runtime;
use serde_json::json;

#[test]
fn builds_catalog_from_manifest_and_validates_ports() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    let core_dir = fixture.service_dir("hivematrix-core");
    fixture.write_manifest(&json!({
        "core_required": [managed_python_entry("hivematrix-core", &core_dir, Some(5000), 0, &[])],
        "default_optional": [],
        "system_dependencies": [],
    }));
    runtime::init(fixture.root());

    let registry = Registry::build().expect("registry builds");
    let entry = registry.get("hivematrix-core").expect("entry present");
    assert_eq!(entry.port, 5000);
}

#[test]
fn manifest_entry_is_promoted_over_discovered_peer_of_the_same_name() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    let core_dir = fixture.service_dir("hivematrix-core");
    // A peer directory that also happens to be a manifest entry: the
    // filesystem scan must not clobber the manifest's own declaration
    // (different port, different install_order) with a discovered one.
    fixture.write_manifest(&json!({
        "core_required": [managed_python_entry("hivematrix-core", &core_dir, Some(5000), 0, &[])],
        "default_optional": [],
        "system_dependencies": [],
    }));
    runtime::init(fixture.root());

    let registry = Registry::build().expect("registry builds");
    let entry = registry.get("hivematrix-core").unwrap();
    assert_eq!(entry.port, 5000);
    assert_eq!(entry.origin, helmd::registry::ServiceOrigin::CoreRequired);
}

#[test]
fn undeclared_peer_directory_is_discovered_with_a_derived_port() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    let core_dir = fixture.service_dir("hivematrix-core");
    fixture.service_dir("hivematrix-widgets");
    fixture.write_manifest(&json!({
        "core_required": [managed_python_entry("hivematrix-core", &core_dir, Some(5000), 0, &[])],
        "default_optional": [],
        "system_dependencies": [],
    }));
    runtime::init(fixture.root());

    let registry = Registry::build().expect("registry builds");
    let discovered = registry.get("hivematrix-widgets").expect("peer discovered");
    assert_eq!(discovered.origin, helmd::registry::ServiceOrigin::Discovered);
    assert!((5000..5900).contains(&discovered.port));
    assert_ne!(discovered.port, 5000);
}

#[test]
fn non_prefixed_directories_are_ignored_by_discovery() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    let core_dir = fixture.service_dir("hivematrix-core");
    fixture.service_dir("not-a-platform-service");
    fixture.write_manifest(&json!({
        "core_required": [managed_python_entry("hivematrix-core", &core_dir, Some(5000), 0, &[])],
        "default_optional": [],
        "system_dependencies": [],
    }));
    runtime::init(fixture.root());

    let registry = Registry::build().expect("registry builds");
    assert!(registry.get("not-a-platform-service").is_err());
    assert_eq!(registry.all().count(), 1);
}

#[test]
fn port_collision_between_manifest_entries_is_rejected() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    let core_dir = fixture.service_dir("hivematrix-core");
    let other_dir = fixture.service_dir("hivematrix-other");
    fixture.write_manifest(&json!({
        "core_required": [managed_python_entry("hivematrix-core", &core_dir, Some(5000), 0, &[])],
        "default_optional": [managed_python_entry("hivematrix-other", &other_dir, Some(5000), 1, &[])],
        "system_dependencies": [],
    }));
    runtime::init(fixture.root());

    let err = Registry::build().expect_err("port collision must be fatal");
    assert!(matches!(
        err,
        helmd::error::RegistryError::PortCollision { port: 5000, .. }
    ));
}

#[test]
fn missing_core_required_directory_is_fatal() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    // Deliberately never call fixture.service_dir(), so the directory the
    // manifest names was never installed.
    let missing_dir = fixture.root().join("hivematrix-core");
    fixture.write_manifest(&json!({
        "core_required": [managed_python_entry("hivematrix-core", &missing_dir, Some(5000), 0, &[])],
        "default_optional": [],
        "system_dependencies": [],
    }));
    runtime::init(fixture.root());

    let err = Registry::build().expect_err("missing core service must be fatal");
    assert!(matches!(
        err,
        helmd::error::RegistryError::MissingCoreService { service, .. } if service == "hivematrix-core"
    ));
}

#[test]
fn unknown_dependency_is_rejected() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    let core_dir = fixture.service_dir("hivematrix-core");
    fixture.write_manifest(&json!({
        "core_required": [managed_python_entry("hivematrix-core", &core_dir, Some(5000), 0, &["hivematrix-ghost"])],
        "default_optional": [],
        "system_dependencies": [],
    }));
    runtime::init(fixture.root());

    let err = Registry::build().expect_err("unknown dependency must be fatal");
    assert!(matches!(
        err,
        helmd::error::RegistryError::UnknownDependency { ref dependency, .. }
            if dependency == "hivematrix-ghost"
    ));
}

#[test]
fn service_start_order_respects_dependencies_and_is_deterministic() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    let core_dir = fixture.service_dir("hivematrix-core");
    let billing_dir = fixture.service_dir("hivematrix-billing");
    let helpdesk_dir = fixture.service_dir("hivematrix-helpdesk");
    fixture.write_manifest(&json!({
        "core_required": [managed_python_entry("hivematrix-core", &core_dir, Some(5000), 0, &[])],
        "default_optional": [
            managed_python_entry("hivematrix-billing", &billing_dir, Some(5001), 1, &["hivematrix-core"]),
            managed_python_entry("hivematrix-helpdesk", &helpdesk_dir, Some(5002), 1, &["hivematrix-core", "hivematrix-billing"]),
        ],
        "system_dependencies": [],
    }));
    runtime::init(fixture.root());

    let registry = Registry::build().expect("registry builds");
    let order = registry.service_start_order().expect("no cycle");
    let core_pos = order.iter().position(|n| n == "hivematrix-core").unwrap();
    let billing_pos = order.iter().position(|n| n == "hivematrix-billing").unwrap();
    let helpdesk_pos = order.iter().position(|n| n == "hivematrix-helpdesk").unwrap();
    assert!(core_pos < billing_pos);
    assert!(billing_pos < helpdesk_pos);
}

#[test]
fn persisted_thin_and_thick_projections_land_under_instance_dir() {
    let _guard = env_lock();
    let fixture = Fixture::new();
    let core_dir = fixture.service_dir("hivematrix-core");
    fixture.write_manifest(&json!({
        "core_required": [managed_python_entry("hivematrix-core", &core_dir, Some(5000), 0, &[])],
        "default_optional": [],
        "system_dependencies": [],
    }));
    runtime::init(fixture.root());

    let registry = Registry::build().expect("registry builds");
    registry.persist().expect("persist");

    assert!(runtime::thin_registry_path().is_file());
    assert!(runtime::thick_registry_path().is_file());

    let thin_raw = std::fs::read_to_string(runtime::thin_registry_path()).unwrap();
    let thin: serde_json::Value = serde_json::from_str(&thin_raw).unwrap();
    assert_eq!(thin["hivematrix-core"]["port"], 5000);
    assert_eq!(thin["hivematrix-core"]["url"], "http://127.0.0.1:5000");
}
