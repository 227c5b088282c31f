//! Every workspace member inherits version and edition from the root
//! manifest, and the member list matches the crates on disk.

use std::path::{Path, PathBuf};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .unwrap()
        .to_path_buf()
}

fn manifest(dir: &Path) -> toml::Value {
    let text = std::fs::read_to_string(dir.join("Cargo.toml")).unwrap();
    text.parse().unwrap()
}

fn members() -> Vec<String> {
    let root = manifest(&workspace_root());
    root["workspace"]["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m.as_str().unwrap().to_string())
        .collect()
}

/// `key.workspace = true` in the member's `[package]` table.
fn inherits(doc: &toml::Value, key: &str) -> bool {
    doc.get("package")
        .and_then(|p| p.get(key))
        .and_then(|v| v.get("workspace"))
        .and_then(|v| v.as_bool())
        == Some(true)
}

#[test]
fn members_inherit_version_and_edition() {
    let root = workspace_root();
    for member in members() {
        let doc = manifest(&root.join(&member));
        assert!(inherits(&doc, "version"), "{member} should use version.workspace = true");
        assert!(inherits(&doc, "edition"), "{member} should use edition.workspace = true");
    }
}

#[test]
fn member_list_matches_crates_directory() {
    let mut on_disk: Vec<String> = std::fs::read_dir(workspace_root().join("crates"))
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join("Cargo.toml").exists())
        .map(|entry| format!("crates/{}", entry.file_name().to_string_lossy()))
        .collect();
    on_disk.sort();

    let mut listed = members();
    listed.sort();
    assert_eq!(listed, on_disk);
    assert_eq!(
        listed,
        [
            "crates/agentship-build",
            "crates/agentship-cli",
            "crates/agentship-core",
            "crates/agentship-state",
        ]
    );
}

#[test]
fn workspace_version_matches_cargo_pkg() {
    let root = manifest(&workspace_root());
    let ws_version = root["workspace"]["package"]["version"].as_str().unwrap();
    assert_eq!(ws_version, env!("CARGO_PKG_VERSION"));
}
