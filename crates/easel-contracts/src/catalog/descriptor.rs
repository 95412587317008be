use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Static reference data for one supported model: pricing plus the
/// parameter schema the provider accepts for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cost_per_image_usd: f64,
    #[serde(default = "default_max_images")]
    pub max_images_per_call: u64,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParameterKind,
    pub min: Option<f64>,
    pub max: Option<f64>,
    #[serde(default)]
    pub allowed_values: Option<Vec<String>>,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    String,
    Integer,
    Float,
}

impl ParameterKind {
    pub fn is_numeric(self) -> bool {
        matches!(self, ParameterKind::Integer | ParameterKind::Float)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Required-field and range sanity checks for one descriptor. Pure.
pub fn validate(descriptor: &ModelDescriptor) -> ValidationReport {
    let mut report = ValidationReport::default();

    if descriptor.id.trim().is_empty() {
        report.errors.push("descriptor is missing an id".to_string());
    }
    if descriptor.name.trim().is_empty() {
        report
            .errors
            .push("descriptor is missing a name".to_string());
    }
    if !descriptor.cost_per_image_usd.is_finite() || descriptor.cost_per_image_usd < 0.0 {
        report.errors.push(format!(
            "cost_per_image_usd must be a non-negative number, got {}",
            descriptor.cost_per_image_usd
        ));
    }
    if descriptor.max_images_per_call < 1 {
        report
            .errors
            .push("max_images_per_call must be at least 1".to_string());
    }

    let mut seen_names: Vec<&str> = Vec::new();
    for spec in &descriptor.parameters {
        if spec.name.trim().is_empty() {
            report
                .errors
                .push("parameter with an empty name".to_string());
            continue;
        }
        if seen_names.contains(&spec.name.as_str()) {
            report
                .warnings
                .push(format!("duplicate parameter '{}'", spec.name));
        }
        seen_names.push(spec.name.as_str());

        if spec.kind.is_numeric() {
            if let (Some(min), Some(max)) = (spec.min, spec.max) {
                if min >= max {
                    report.errors.push(format!(
                        "parameter '{}' requires min < max ({min} >= {max})",
                        spec.name
                    ));
                }
            }
        } else if spec.min.is_some() || spec.max.is_some() {
            report.warnings.push(format!(
                "parameter '{}' is not numeric; min/max are ignored",
                spec.name
            ));
        }

        if let Some(allowed) = &spec.allowed_values {
            if allowed.is_empty() {
                report.errors.push(format!(
                    "parameter '{}' has an empty allowed_values list",
                    spec.name
                ));
            }
        }
    }

    report
}

fn default_max_images() -> u64 {
    1
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn descriptor(value: serde_json::Value) -> ModelDescriptor {
        serde_json::from_value(value).expect("descriptor parses")
    }

    #[test]
    fn valid_descriptor_passes() {
        let report = validate(&descriptor(json!({
            "id": "sdxl",
            "name": "Stable Diffusion XL",
            "cost_per_image_usd": 0.002,
            "max_images_per_call": 8,
            "parameters": [
                {"name": "steps", "kind": "integer", "min": 1, "max": 50}
            ]
        })));
        assert!(report.is_valid());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn missing_required_fields_are_errors() {
        let report = validate(&descriptor(json!({
            "cost_per_image_usd": 0.01
        })));
        assert!(!report.is_valid());
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn negative_cost_is_an_error() {
        let report = validate(&descriptor(json!({
            "id": "m",
            "name": "M",
            "cost_per_image_usd": -0.5
        })));
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("non-negative"));
    }

    #[test]
    fn inverted_numeric_range_is_an_error() {
        let report = validate(&descriptor(json!({
            "id": "m",
            "name": "M",
            "cost_per_image_usd": 0.01,
            "parameters": [
                {"name": "guidance", "kind": "float", "min": 9.0, "max": 2.0}
            ]
        })));
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("min < max"));
    }

    #[test]
    fn duplicate_parameter_names_warn_but_stay_valid() {
        let report = validate(&descriptor(json!({
            "id": "m",
            "name": "M",
            "cost_per_image_usd": 0.01,
            "parameters": [
                {"name": "seed", "kind": "integer"},
                {"name": "seed", "kind": "integer"}
            ]
        })));
        assert!(report.is_valid());
        assert_eq!(report.warnings, vec!["duplicate parameter 'seed'"]);
    }

    #[test]
    fn empty_allowed_values_is_an_error() {
        let report = validate(&descriptor(json!({
            "id": "m",
            "name": "M",
            "cost_per_image_usd": 0.01,
            "parameters": [
                {"name": "size", "kind": "string", "allowed_values": []}
            ]
        })));
        assert!(!report.is_valid());
    }
}
