//! Integration tests for modhost-runtime.
//!
//! These tests cover:
//! - Discovery across user and bundled roots with persisted state
//! - Recording manifest-declared calls into the capability log
//! - Validation and pruning of the resulting log

use modhost_runtime::{
    discover_in_directory, CallArg, CapabilityRegistry, ExtensionLoadFailure, ExtensionManifest,
    ExtensionPath, ExtensionStateStore,
};
use std::collections::HashSet;
use std::path::Path;
use tempfile::TempDir;

// ==============================================================================
// Test Fixture Helpers
// ==============================================================================

/// Create an extension directory with an `extension.toml` declaring `calls`.
fn create_extension(root: &Path, name: &str, calls: &[(&str, &[&str], bool)]) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();

    let mut manifest = format!(
        r#"[extension]
id = "{name}"
name = "Extension {name}"
version = "0.1.0"
"#
    );

    for (key, args, optional) in calls {
        let args: Vec<String> = args.iter().map(|a| format!("\"{}\"", a)).collect();
        manifest.push_str(&format!(
            "\n[[calls]]\nkey = \"{}\"\nargs = [{}]\noptional = {}\n",
            key,
            args.join(", "),
            optional
        ));
    }

    std::fs::write(dir.join("extension.toml"), manifest).unwrap();
}

/// Replay an extension's manifest into the registry.
fn record_manifest(registry: &mut CapabilityRegistry, extension: &ExtensionPath) {
    let manifest = ExtensionManifest::from_file(&extension.manifest_path()).unwrap();
    registry.set_extension(&extension.name, &extension.path);

    for call in &manifest.calls {
        let args: Vec<CallArg> = call
            .json_args()
            .unwrap()
            .into_iter()
            .map(CallArg::from)
            .collect();
        if call.optional {
            registry.record_optional(&call.key, args);
        } else {
            registry.record(&call.key, args);
        }
    }
}

fn discover_all(roots: &[&Path], state: &ExtensionStateStore) -> Vec<ExtensionPath> {
    let mut taken = HashSet::new();
    let mut found = Vec::new();
    for root in roots {
        found.extend(discover_in_directory(root, &mut taken, state).unwrap());
    }
    found
}

// ==============================================================================
// Full Load Pipeline
// ==============================================================================

#[test]
fn test_discover_record_validate() {
    let temp_dir = TempDir::new().unwrap();
    let user = temp_dir.path().join("user");
    let bundled = temp_dir.path().join("bundled");

    create_extension(
        &user,
        "settings-page",
        &[("registerSettings", &["Interface"], false)],
    );
    create_extension(
        &bundled,
        "needs-hologram",
        &[
            ("registerSettings", &["Holograms"], false),
            ("registerHologram", &[], false),
        ],
    );
    create_extension(
        &bundled,
        "tolerant",
        &[
            ("requireExtension", &["settings-page"], false),
            ("registerHologram", &[], true),
        ],
    );

    let state = ExtensionStateStore::in_memory();
    let extensions = discover_all(&[&user, &bundled], &state);
    assert_eq!(extensions.len(), 3);

    let mut registry = CapabilityRegistry::new();
    for extension in &extensions {
        record_manifest(&mut registry, extension);
    }

    let names: Vec<String> = extensions.iter().map(|e| e.name.clone()).collect();
    let failures = registry.unload_incompatible(&HashSet::new(), &names);

    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures["needs-hologram"],
        vec![ExtensionLoadFailure::UnsupportedApi {
            api: "registerHologram".to_string()
        }]
    );

    let settings: Vec<_> = registry
        .get_calls("registerSettings")
        .map(|call| call.args()[0].as_str().unwrap().to_string())
        .collect();
    assert_eq!(settings, vec!["Interface".to_string()]);
    assert!(registry
        .calls()
        .iter()
        .all(|call| call.extension != "needs-hologram"));
}

#[test]
fn test_user_copy_shadows_bundled_copy() {
    let temp_dir = TempDir::new().unwrap();
    let user = temp_dir.path().join("user");
    let bundled = temp_dir.path().join("bundled");

    create_extension(&user, "theme", &[("registerSettings", &["User"], false)]);
    create_extension(&bundled, "theme", &[("registerSettings", &["Bundled"], false)]);

    let state = ExtensionStateStore::in_memory();
    let extensions = discover_all(&[&user, &bundled], &state);

    assert_eq!(extensions.len(), 1);
    assert!(extensions[0].path.starts_with(&user));

    let mut registry = CapabilityRegistry::new();
    record_manifest(&mut registry, &extensions[0]);
    assert_eq!(registry.calls()[0].args()[0].as_str(), Some("User"));
}

#[test]
fn test_state_file_controls_discovery() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("plugins");
    let state_path = temp_dir.path().join("extensions.json");
    let markers = temp_dir.path().join("tmp");
    std::fs::create_dir_all(&markers).unwrap();

    create_extension(&root, "keep", &[]);
    create_extension(&root, "crashy", &[]);
    create_extension(&root, "doomed", &[]);
    std::fs::write(markers.join("__disable_crashy"), "").unwrap();

    {
        let mut state = ExtensionStateStore::load(&state_path).unwrap();
        state.mark_for_removal("doomed");
        state.save().unwrap();
    }

    let mut state = ExtensionStateStore::load(&state_path).unwrap();
    state.apply_disable_markers(&markers).unwrap();
    state.remove_flagged(&root).unwrap();
    state.save().unwrap();

    let extensions = discover_all(&[&root], &state);
    let names: Vec<_> = extensions.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["keep"]);

    let reloaded = ExtensionStateStore::load(&state_path).unwrap();
    assert!(!reloaded.is_enabled("crashy"));
    assert!(reloaded.get("doomed").is_none());
}
