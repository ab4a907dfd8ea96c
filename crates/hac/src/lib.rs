//! HAC config parser (spec §4.10): the declarative, round-trippable VM
//! spec file format with sections `[vm]`, `[resources]`, `[boot]`,
//! `[network]`, `[[drives]]`, `[metadata]`.
//!
//! The format is hand-parsed rather than fed through a generic TOML
//! deserializer so that every parse failure can name the exact
//! `section.field` at fault and the value shape expected there (spec
//! §4.10: "parse failures must name the offending field and expected
//! format").

use std::collections::{BTreeMap, HashMap};

use hyperforge_types::vm::{DriveSpec, Provider, VmSpec};

pub type Spec = VmSpec;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing section `[{0}]`")]
    MissingSection(String),
    #[error("missing field `{section}.{field}`")]
    MissingField { section: String, field: String },
    #[error("invalid value for `{section}.{field}`: expected {expected}, got `{actual}`")]
    InvalidValue {
        section: String,
        field: String,
        expected: String,
        actual: String,
    },
    #[error("malformed line {line}: `{text}`")]
    MalformedLine { line: usize, text: String },
}

#[derive(Debug, Default)]
struct RawSection {
    fields: BTreeMap<String, String>,
}

fn unquote(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}

/// Parses HAC config text into a [`Spec`]. Every section is optional on
/// the wire (omission is reported as a specific `MissingField` once the
/// caller's required field is looked up), but `[vm]`, `[resources]`, and
/// `[boot]` carry required fields with no sensible default.
pub fn parse(text: &str) -> Result<Spec, ParseError> {
    let mut vm = RawSection::default();
    let mut resources = RawSection::default();
    let mut boot = RawSection::default();
    let mut network = RawSection::default();
    let mut metadata = RawSection::default();
    let mut drives: Vec<RawSection> = Vec::new();

    let mut current: Option<&str> = None;
    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with("[[") && line.ends_with("]]") {
            let name = line[2..line.len() - 2].trim();
            if name != "drives" {
                return Err(ParseError::MalformedLine {
                    line: line_no,
                    text: raw_line.to_string(),
                });
            }
            drives.push(RawSection::default());
            current = Some("drives");
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            let name = line[1..line.len() - 1].trim();
            current = Some(match name {
                "vm" => "vm",
                "resources" => "resources",
                "boot" => "boot",
                "network" => "network",
                "metadata" => "metadata",
                _ => {
                    return Err(ParseError::MalformedLine {
                        line: line_no,
                        text: raw_line.to_string(),
                    })
                }
            });
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ParseError::MalformedLine {
                line: line_no,
                text: raw_line.to_string(),
            });
        };
        let key = key.trim().to_string();
        let value = unquote(value);
        match current {
            Some("vm") => {
                vm.fields.insert(key, value);
            }
            Some("resources") => {
                resources.fields.insert(key, value);
            }
            Some("boot") => {
                boot.fields.insert(key, value);
            }
            Some("network") => {
                network.fields.insert(key, value);
            }
            Some("metadata") => {
                metadata.fields.insert(key, value);
            }
            Some("drives") => {
                drives
                    .last_mut()
                    .expect("a [[drives]] header always precedes its fields")
                    .fields
                    .insert(key, value);
            }
            _ => {
                return Err(ParseError::MalformedLine {
                    line: line_no,
                    text: raw_line.to_string(),
                })
            }
        }
    }

    let field = |section: &RawSection, section_name: &str, name: &str| -> Result<String, ParseError> {
        section
            .fields
            .get(name)
            .cloned()
            .ok_or_else(|| ParseError::MissingField {
                section: section_name.to_string(),
                field: name.to_string(),
            })
    };

    let name = field(&vm, "vm", "name")?;
    let provider_raw = field(&vm, "vm", "provider")?;
    let provider: Provider = provider_raw.parse().map_err(|_| ParseError::InvalidValue {
        section: "vm".to_string(),
        field: "provider".to_string(),
        expected: "one of firecracker, cloud-hypervisor, unikernel".to_string(),
        actual: provider_raw.clone(),
    })?;

    let vcpus_raw = field(&resources, "resources", "vcpus")?;
    let vcpus: u32 = vcpus_raw.parse().map_err(|_| ParseError::InvalidValue {
        section: "resources".to_string(),
        field: "vcpus".to_string(),
        expected: "non-negative integer".to_string(),
        actual: vcpus_raw.clone(),
    })?;

    let memory_raw = field(&resources, "resources", "memory_mb")?;
    let memory_mb: u32 = memory_raw.parse().map_err(|_| ParseError::InvalidValue {
        section: "resources".to_string(),
        field: "memory_mb".to_string(),
        expected: "non-negative integer".to_string(),
        actual: memory_raw.clone(),
    })?;

    let kernel_path = field(&boot, "boot", "kernel_path")?;
    let rootfs_path = field(&boot, "boot", "rootfs_path")?;

    let network_enabled = match network.fields.get("enabled") {
        Some(raw) => raw.parse::<bool>().map_err(|_| ParseError::InvalidValue {
            section: "network".to_string(),
            field: "enabled".to_string(),
            expected: "true or false".to_string(),
            actual: raw.clone(),
        })?,
        None => false,
    };

    let mut parsed_drives = Vec::with_capacity(drives.len());
    for (i, d) in drives.iter().enumerate() {
        let section_name = format!("drives[{i}]");
        let path = field(d, &section_name, "path")?;
        let read_only_raw = field(d, &section_name, "read_only")?;
        let read_only = read_only_raw.parse::<bool>().map_err(|_| ParseError::InvalidValue {
            section: section_name.clone(),
            field: "read_only".to_string(),
            expected: "true or false".to_string(),
            actual: read_only_raw.clone(),
        })?;
        parsed_drives.push(DriveSpec { path, read_only });
    }

    let metadata_map: HashMap<String, String> = metadata.fields.into_iter().collect();

    Ok(Spec {
        name,
        provider,
        vcpus,
        memory_mb,
        kernel_path,
        rootfs_path,
        network_enabled,
        drives: parsed_drives,
        metadata: metadata_map,
    })
}

/// Renders a [`Spec`] back to HAC config text. Section and field order is
/// fixed so that repeated calls on the same value produce byte-identical
/// output; metadata keys are sorted for the same reason.
pub fn format(spec: &Spec) -> String {
    let mut out = String::new();
    out.push_str("[vm]\n");
    out.push_str(&format!("name = \"{}\"\n", spec.name));
    out.push_str(&format!("provider = \"{}\"\n", spec.provider));
    out.push('\n');

    out.push_str("[resources]\n");
    out.push_str(&format!("vcpus = {}\n", spec.vcpus));
    out.push_str(&format!("memory_mb = {}\n", spec.memory_mb));
    out.push('\n');

    out.push_str("[boot]\n");
    out.push_str(&format!("kernel_path = \"{}\"\n", spec.kernel_path));
    out.push_str(&format!("rootfs_path = \"{}\"\n", spec.rootfs_path));
    out.push('\n');

    out.push_str("[network]\n");
    out.push_str(&format!("enabled = {}\n", spec.network_enabled));

    for drive in &spec.drives {
        out.push('\n');
        out.push_str("[[drives]]\n");
        out.push_str(&format!("path = \"{}\"\n", drive.path));
        out.push_str(&format!("read_only = {}\n", drive.read_only));
    }

    if !spec.metadata.is_empty() {
        out.push('\n');
        out.push_str("[metadata]\n");
        let sorted: BTreeMap<&String, &String> = spec.metadata.iter().collect();
        for (k, v) in sorted {
            out.push_str(&format!("{k} = \"{v}\"\n"));
        }
    }

    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub ok: bool,
    pub reasons: Vec<String>,
}

/// Schema-level validation (`VmSpec::validate`) plus a capacity check
/// against `host_capacity`; every violation is collected rather than
/// stopping at the first one; `ok` is true only if `reasons` is empty.
pub fn validate(spec: &Spec, host_capacity: hyperforge_types::vm::HostCapacity) -> ValidationResult {
    let mut reasons = Vec::new();
    if let Err((field, expected)) = spec.validate() {
        reasons.push(format!("{field}: expected {expected}"));
    }
    if spec.vcpus > host_capacity.vcpus {
        reasons.push(format!(
            "vcpus {} exceeds host capacity {}",
            spec.vcpus, host_capacity.vcpus
        ));
    }
    if spec.memory_mb > host_capacity.memory_mb {
        reasons.push(format!(
            "memory_mb {} exceeds host capacity {}",
            spec.memory_mb, host_capacity.memory_mb
        ));
    }
    ValidationResult {
        ok: reasons.is_empty(),
        reasons,
    }
}

/// A minimal, schema-valid starting point for a given provider, meant to
/// be hand-edited rather than spawned as-is.
pub fn default_template(provider: Provider) -> Spec {
    Spec {
        name: "new-vm".to_string(),
        provider,
        vcpus: 1,
        memory_mb: 256,
        kernel_path: "/var/lib/hyperforge/kernels/default".to_string(),
        rootfs_path: "/var/lib/hyperforge/images/default".to_string(),
        network_enabled: false,
        drives: Vec::new(),
        metadata: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyperforge_types::vm::HostCapacity;

    fn sample() -> Spec {
        let mut spec = default_template(Provider::Firecracker);
        spec.name = "agent-worker-1".to_string();
        spec.vcpus = 2;
        spec.memory_mb = 512;
        spec.drives.push(DriveSpec {
            path: "/dev/vdb".to_string(),
            read_only: true,
        });
        spec.metadata.insert("owner".to_string(), "agent-7".to_string());
        spec
    }

    #[test]
    fn l5_round_trip_through_format_and_parse() {
        let spec = sample();
        let text = format(&spec);
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn missing_required_field_names_the_section_and_field() {
        let text = "[vm]\nname = \"x\"\n";
        let err = parse(text).unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingField {
                section: "vm".to_string(),
                field: "provider".to_string()
            }
        );
    }

    #[test]
    fn invalid_provider_names_the_expected_format() {
        let text = r#"
[vm]
name = "x"
provider = "qemu"

[resources]
vcpus = 1
memory_mb = 256

[boot]
kernel_path = "k"
rootfs_path = "r"
"#;
        let err = parse(text).unwrap_err();
        match err {
            ParseError::InvalidValue { field, actual, .. } => {
                assert_eq!(field, "provider");
                assert_eq!(actual, "qemu");
            }
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn validate_reports_capacity_violation() {
        let mut spec = sample();
        spec.vcpus = 8;
        let result = validate(&spec, HostCapacity { vcpus: 4, memory_mb: 4096 });
        assert!(!result.ok);
        assert!(result.reasons.iter().any(|r| r.contains("vcpus")));
    }

    #[test]
    fn validate_passes_within_capacity() {
        let spec = sample();
        let result = validate(&spec, HostCapacity { vcpus: 4, memory_mb: 4096 });
        assert!(result.ok, "{:?}", result.reasons);
    }

    proptest::proptest! {
        #[test]
        fn l5_prop_round_trip(
            vcpus in 1u32..64,
            memory_mb in 128u32..65536,
            read_only in proptest::bool::ANY,
        ) {
            let mut spec = default_template(Provider::Firecracker);
            spec.vcpus = vcpus;
            spec.memory_mb = memory_mb;
            spec.drives.push(DriveSpec { path: "/dev/vdb".to_string(), read_only });
            let parsed = parse(&format(&spec)).unwrap();
            proptest::prop_assert_eq!(parsed, spec);
        }
    }
}
