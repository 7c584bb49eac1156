//! PVC name template rendering
//!
//! Templates use minijinja syntax (`{{ VmName }}-disk-{{ DiskIndex }}`).
//! The Go-style `{{.VmName}}` spelling is accepted by dropping the leading
//! dot of a variable reference before rendering.

use std::sync::OnceLock;

use minijinja::{Environment, UndefinedBehavior};
use regex::Regex;
use serde::Serialize;

use crate::Error;

/// Maximum length of a DNS-1123 label
pub const DNS1123_LABEL_MAX_LEN: usize = 63;

/// Characters the API server appends to a `generateName`
const GENERATE_NAME_SUFFIX_LEN: usize = 5;

/// Data available to PVC name templates
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PvcNameTemplateData {
    /// Source VM name
    pub vm_name: String,
    /// Destination VM name (sanitized)
    pub target_vm_name: String,
    /// Plan name
    pub plan_name: String,
    /// Index of the disk within the VM
    pub disk_index: usize,
    /// Index of the boot disk
    pub root_disk_index: usize,
    /// Whether the disk is shared between VMs
    pub shared: bool,
    /// Base file name of the disk (without extension), if any
    pub file_name: String,
}

/// Outcome of rendering a PVC name template
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PvcName {
    /// Use as `metadata.name`
    Name(String),
    /// Use as `metadata.generateName` (ends with `-`)
    GenerateName(String),
}

fn go_dot_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{(-?)\s*\.([A-Za-z_])").expect("hardcoded regex is valid")
    })
}

fn dns1123_label_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("hardcoded regex is valid")
    })
}

/// Whether `s` is a valid DNS-1123 label
pub fn is_dns1123_label(s: &str) -> bool {
    s.len() <= DNS1123_LABEL_MAX_LEN && dns1123_label_pattern().is_match(s)
}

fn normalize(template: &str) -> String {
    go_dot_pattern()
        .replace_all(template, "{{$1 $2")
        .into_owned()
}

/// Render a template string against `data`
pub fn render<T: Serialize>(template: &str, data: &T) -> Result<String, Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.render_str(&normalize(template), data)
        .map_err(|e| Error::template(template, e.to_string()))
}

/// Render and validate a PVC name template
///
/// With `use_generate_name` the result is a prefix ending in `-`; otherwise
/// trailing dashes are trimmed. Either way the name must be a DNS-1123 label.
pub fn render_pvc_name(
    template: &str,
    data: &PvcNameTemplateData,
    use_generate_name: bool,
) -> Result<PvcName, Error> {
    let rendered = render(template, data)?;
    let base = rendered.trim().trim_end_matches('-').to_string();
    if base.is_empty() {
        return Err(Error::template(template, "template rendered an empty name"));
    }

    let max_len = if use_generate_name {
        DNS1123_LABEL_MAX_LEN - GENERATE_NAME_SUFFIX_LEN - 1
    } else {
        DNS1123_LABEL_MAX_LEN
    };
    if base.len() > max_len || !is_dns1123_label(&base) {
        return Err(Error::template(
            template,
            format!("rendered name '{}' is not a valid DNS-1123 label", base),
        ));
    }

    Ok(if use_generate_name {
        PvcName::GenerateName(format!("{}-", base))
    } else {
        PvcName::Name(base)
    })
}

/// Validate a template by rendering it against sample data
pub fn validate_pvc_name_template(
    template: &str,
    sample: &PvcNameTemplateData,
    use_generate_name: bool,
) -> Result<(), Error> {
    render_pvc_name(template, sample, use_generate_name).map(|_| ())
}

/// Derive a destination-safe VM name
///
/// Names longer than a label are truncated; if the result is still not a
/// label, dots are replaced with dashes.
pub fn vm_safe_name(name: &str) -> String {
    let mut safe: String = name.chars().take(DNS1123_LABEL_MAX_LEN).collect();
    if !is_dns1123_label(&safe) {
        safe = safe.replace('.', "-");
    }
    safe
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PvcNameTemplateData {
        PvcNameTemplateData {
            vm_name: "web-01".to_string(),
            target_vm_name: "web-01".to_string(),
            plan_name: "wave-1".to_string(),
            disk_index: 2,
            root_disk_index: 0,
            shared: false,
            file_name: "web-01_1".to_string(),
        }
    }

    #[test]
    fn renders_jinja_syntax() {
        let name = render_pvc_name("{{ PlanName }}-{{ VmName }}-{{ DiskIndex }}", &sample(), false)
            .unwrap();
        assert_eq!(name, PvcName::Name("wave-1-web-01-2".to_string()));
    }

    #[test]
    fn accepts_go_style_dot_references() {
        let name = render_pvc_name("{{.VmName}}-disk-{{ .DiskIndex }}", &sample(), false).unwrap();
        assert_eq!(name, PvcName::Name("web-01-disk-2".to_string()));
    }

    #[test]
    fn generate_name_gets_trailing_dash() {
        let name = render_pvc_name("{{ VmName }}", &sample(), true).unwrap();
        assert_eq!(name, PvcName::GenerateName("web-01-".to_string()));

        let name = render_pvc_name("{{ VmName }}-", &sample(), false).unwrap();
        assert_eq!(name, PvcName::Name("web-01".to_string()));
    }

    #[test]
    fn rejects_invalid_labels() {
        // Underscores are not allowed in labels
        assert!(render_pvc_name("{{ FileName }}", &sample(), false).is_err());
        // Undefined variables fail rather than render empty
        assert!(render_pvc_name("{{ Missing }}", &sample(), false).is_err());
        // Empty output
        assert!(render_pvc_name("{% if Shared %}x{% endif %}", &sample(), false).is_err());
    }

    #[test]
    fn generate_name_leaves_room_for_suffix() {
        let mut data = sample();
        data.vm_name = "a".repeat(60);
        assert!(render_pvc_name("{{ VmName }}", &data, false).is_ok());
        assert!(render_pvc_name("{{ VmName }}", &data, true).is_err());
    }

    #[test]
    fn vm_safe_name_truncates_and_replaces_dots() {
        assert_eq!(vm_safe_name("db.example.com"), "db-example-com");
        assert_eq!(vm_safe_name("plain"), "plain");
        assert_eq!(vm_safe_name(&"x".repeat(80)).len(), DNS1123_LABEL_MAX_LEN);
    }

    #[test]
    fn validate_is_render_without_output() {
        assert!(validate_pvc_name_template("{{ VmName }}-{{ DiskIndex }}", &sample(), false).is_ok());
        assert!(validate_pvc_name_template("{{ VmName", &sample(), false).is_err());
    }
}
