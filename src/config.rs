//! Workspace configuration surface.
//!
//! Configuration arrives as loose JSON through
//! `workspace/didChangeConfiguration` pushes and `workspace/configuration`
//! round-trips. Recognized groups: `d`, `dfmt`, `dscanner`, `editor`, and
//! `git`. Updates are tolerant: unknown sections and keys are ignored with
//! a log line, malformed values skip per-key with a warning, and a bad
//! update never aborts the rest of the batch.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use tracing::{info, warn};

/// Toolchain paths, feature toggles, and completion tuning.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DConfig {
	/// Path to the standard library sources, when not auto-detected.
	pub stdlib_path: Option<Vec<String>>,
	/// Path to the `dub` executable.
	pub dub_path: String,
	/// Path to the `dmd` executable.
	pub dmd_path: String,
	/// Enable all linting support.
	pub enable_linting: bool,
	/// Enable static linting.
	pub enable_static_linting: bool,
	/// Enable build-based linting through dub.
	pub enable_dub_linting: bool,
	/// Enable auto completion.
	pub enable_auto_complete: bool,
	/// Enable formatting support.
	pub enable_formatting: bool,
	/// Never spawn dub even for dub projects.
	pub never_use_dub: bool,
	/// Additional import paths for projects without dub.
	pub project_import_paths: Vec<String>,
	/// The dub configuration to build with.
	pub dub_configuration: String,
	/// The dub architecture to build for.
	pub dub_arch_type: String,
	/// The dub build type.
	pub dub_build_type: String,
	/// The compiler dub should use.
	pub dub_compiler: String,
	/// Run lints when a file is opened.
	pub lint_on_file_open: bool,
	/// Insert call argument snippets on completion.
	pub argument_snippets: bool,
	/// Drop duplicate completion entries.
	pub complete_no_dupes: bool,
	/// Scan every workspace folder for projects on startup.
	pub scan_all_folders: bool,
	/// Glob patterns of roots to skip while scanning.
	pub disabled_root_globs: Vec<String>,
	/// Extra project roots outside the workspace folders.
	pub extra_roots: Vec<String>,
}

impl Default for DConfig {
	fn default() -> Self {
		Self {
			stdlib_path: None,
			dub_path: "dub".into(),
			dmd_path: "dmd".into(),
			enable_linting: true,
			enable_static_linting: true,
			enable_dub_linting: true,
			enable_auto_complete: true,
			enable_formatting: true,
			never_use_dub: false,
			project_import_paths: Vec::new(),
			dub_configuration: String::new(),
			dub_arch_type: String::new(),
			dub_build_type: String::new(),
			dub_compiler: String::new(),
			lint_on_file_open: false,
			argument_snippets: false,
			complete_no_dupes: true,
			scan_all_folders: true,
			disabled_root_globs: Vec::new(),
			extra_roots: Vec::new(),
		}
	}
}

/// Formatter options forwarded to dfmt.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DfmtConfig {
	/// Align labels, cases, and defaults with their switch.
	pub align_switch_statements: bool,
	/// Brace style: `allman`, `otbs`, or `stroustrup`.
	pub brace_style: String,
	/// Decrease the indentation of attributes.
	pub outdent_attributes: bool,
	/// Insert a space after cast expressions.
	pub space_after_cast: bool,
	/// Place operators on the end of the previous line when splitting.
	pub split_operator_at_line_end: bool,
	/// Insert a space after the module name in selective imports.
	pub selective_import_space: bool,
	/// Place labeled statements on the same line as their label.
	pub compact_labeled_statements: bool,
	/// Template constraint style.
	pub template_constraint_style: String,
	/// Keep existing line breaks where possible.
	pub keep_line_breaks: bool,
}

impl Default for DfmtConfig {
	fn default() -> Self {
		Self {
			align_switch_statements: true,
			brace_style: "allman".into(),
			outdent_attributes: true,
			space_after_cast: true,
			split_operator_at_line_end: false,
			selective_import_space: true,
			compact_labeled_statements: true,
			template_constraint_style: "conditional_newline_indent".into(),
			keep_line_breaks: true,
		}
	}
}

/// Lint keys forwarded to dscanner.
#[derive(Debug, Clone, PartialEq, Default, Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DscannerConfig {
	/// Check names disabled for this workspace.
	pub ignored_keys: Vec<String>,
}

/// Editor-wide hints the server may use.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EditorConfig {
	/// Ruler columns, used for line-length lints.
	pub rulers: Vec<u32>,
	/// Tab size in columns.
	pub tab_size: u32,
}

impl Default for EditorConfig {
	fn default() -> Self {
		Self {
			rulers: Vec::new(),
			tab_size: 4,
		}
	}
}

/// Git integration settings.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GitConfig {
	/// Path to the `git` executable.
	pub path: String,
}

impl Default for GitConfig {
	fn default() -> Self {
		Self { path: "git".into() }
	}
}

/// The whole recognized configuration tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Configuration {
	/// The `d` group.
	pub d: DConfig,
	/// The `dfmt` group.
	pub dfmt: DfmtConfig,
	/// The `dscanner` group.
	pub dscanner: DscannerConfig,
	/// The `editor` group.
	pub editor: EditorConfig,
	/// The `git` group.
	pub git: GitConfig,
}

impl Configuration {
	/// Applies a settings value from the client.
	///
	/// Returns the number of keys that changed. Never fails: bad sections
	/// and keys are logged and skipped.
	pub fn update(&mut self, settings: &JsonValue) -> usize {
		let Some(sections) = settings.as_object() else {
			warn!("configuration update is not an object, ignoring");
			return 0;
		};

		let mut applied = 0;
		for (section, value) in sections {
			let Some(entries) = value.as_object() else {
				warn!(section = %section, "configuration section is not an object, skipping");
				continue;
			};
			applied += match section.as_str() {
				"d" => merge_section("d", &mut self.d, entries),
				"dfmt" => merge_section("dfmt", &mut self.dfmt, entries),
				"dscanner" => merge_section("dscanner", &mut self.dscanner, entries),
				"editor" => merge_section("editor", &mut self.editor, entries),
				"git" => merge_section("git", &mut self.git, entries),
				other => {
					info!(section = %other, "ignoring unknown configuration section");
					0
				}
			};
		}
		applied
	}
}

/// Merges incoming keys into one section, skipping bad values per key.
fn merge_section<T: Serialize + DeserializeOwned>(
	section: &str,
	current: &mut T,
	incoming: &Map<String, JsonValue>,
) -> usize {
	let JsonValue::Object(mut working) =
		serde_json::to_value(&*current).expect("configuration sections serialize to objects")
	else {
		unreachable!("configuration sections are records")
	};

	let mut applied = 0;
	for (key, value) in incoming {
		if !working.contains_key(key) {
			info!(section = %section, key = %key, "ignoring unknown configuration key");
			continue;
		}
		let previous = working.insert(key.clone(), value.clone());
		match serde_json::from_value::<T>(JsonValue::Object(working.clone())) {
			Ok(next) => {
				*current = next;
				applied += 1;
			}
			Err(err) => {
				warn!(
					section = %section,
					key = %key,
					error = %err,
					"skipping malformed configuration value"
				);
				// Roll the working copy back so later keys still apply.
				if let Some(previous) = previous {
					working.insert(key.clone(), previous);
				}
			}
		}
	}
	applied
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn known_keys_apply() {
		let mut config = Configuration::default();
		let applied = config.update(&json!({
			"d": { "dubPath": "/opt/dub", "enableLinting": false },
			"editor": { "rulers": [80, 120] },
		}));
		assert_eq!(applied, 3);
		assert_eq!(config.d.dub_path, "/opt/dub");
		assert!(!config.d.enable_linting);
		assert_eq!(config.editor.rulers, vec![80, 120]);
	}

	#[test]
	fn unknown_sections_and_keys_are_ignored() {
		let mut config = Configuration::default();
		let applied = config.update(&json!({
			"rust": { "edition": 2024 },
			"d": { "noSuchKey": true, "dmdPath": "/opt/dmd" },
		}));
		assert_eq!(applied, 1);
		assert_eq!(config.d.dmd_path, "/opt/dmd");
	}

	#[test]
	fn malformed_values_skip_per_key() {
		let mut config = Configuration::default();
		let applied = config.update(&json!({
			"d": {
				"enableLinting": "definitely",
				"dubPath": "/opt/dub",
			},
			"editor": { "tabSize": "wide" },
		}));
		// Only the well-formed key lands; its neighbors do not poison it.
		assert_eq!(applied, 1);
		assert!(config.d.enable_linting);
		assert_eq!(config.d.dub_path, "/opt/dub");
		assert_eq!(config.editor.tab_size, 4);
	}

	#[test]
	fn non_object_settings_are_ignored() {
		let mut config = Configuration::default();
		assert_eq!(config.update(&json!(42)), 0);
		assert_eq!(config.update(&json!(null)), 0);
	}

	#[test]
	fn round_trips_through_serde() {
		let config = Configuration::default();
		let value = serde_json::to_value(&config).unwrap();
		let back: Configuration = serde_json::from_value(value).unwrap();
		assert_eq!(back, config);
	}
}
