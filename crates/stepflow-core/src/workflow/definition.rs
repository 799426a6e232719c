//! Workflow definition parsing and validation.
//!
//! Definitions are authored as YAML or JSON and validated once, before they
//! are saved, against the module registry. Validation collects every problem
//! instead of stopping at the first, so an author sees all errors at once.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use stepflow_types::config::ReferencePolicy;
use stepflow_types::module::ModulePath;
use stepflow_types::workflow::{TriggerType, WorkflowDefinition};
use thiserror::Error;

use super::context::INPUT_ROOT;
use super::cron::normalize_schedule;
use super::dag::DependencyGraph;
use super::expression::WorkflowEvaluator;
use super::variables::{find_references, references_in_text, VariableRef};
use crate::module::ModuleRegistry;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// One or more validation failures.
    #[error("invalid workflow definition: {}", .errors.join("; "))]
    Invalid { errors: Vec<String> },

    /// Variable references form a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-fatal findings from validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a definition from JSON or YAML text.
pub fn parse_definition(text: &str) -> Result<WorkflowDefinition, WorkflowError> {
    if text.trim_start().starts_with('{') {
        serde_json::from_str(text).map_err(|e| WorkflowError::Parse(e.to_string()))
    } else {
        serde_yaml_ng::from_str(text).map_err(|e| WorkflowError::Parse(e.to_string()))
    }
}

/// Serialize a definition to YAML.
pub fn serialize_definition_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::Parse(e.to_string()))
}

/// Read and parse a definition file (`.yaml`, `.yml` or `.json`).
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_definition(&content)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate a definition against the registry.
///
/// Errors block the definition; warnings are returned in the report.
/// `policy` decides whether a reference to an `outputAs` that no step
/// declares is an error or a warning.
pub fn validate_definition(
    def: &WorkflowDefinition,
    registry: &ModuleRegistry,
    policy: ReferencePolicy,
) -> Result<ValidationReport, WorkflowError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if def.name.trim().is_empty() {
        errors.push("workflow name must not be empty".to_string());
    }
    if def.steps.is_empty() {
        errors.push("workflow must have at least one step".to_string());
    }

    // Step names
    let mut names = HashSet::new();
    for step in &def.steps {
        if step.name.trim().is_empty() {
            errors.push("step name must not be empty".to_string());
        } else if !names.insert(step.name.as_str()) {
            errors.push(format!("duplicate step name '{}'", step.name));
        }
    }

    // outputAs names
    let mut producers: HashMap<&str, usize> = HashMap::new();
    for (i, step) in def.steps.iter().enumerate() {
        let Some(output_as) = step.output_as.as_deref() else {
            continue;
        };
        if output_as == INPUT_ROOT {
            errors.push(format!(
                "step '{}': outputAs '{INPUT_ROOT}' is reserved for trigger data",
                step.name
            ));
        } else if !is_identifier(output_as) {
            errors.push(format!(
                "step '{}': outputAs '{}' is not a valid identifier",
                step.name, output_as
            ));
        }
        if producers.insert(output_as, i).is_some() {
            errors.push(format!("duplicate outputAs '{output_as}'"));
        }
    }

    let evaluator = WorkflowEvaluator::new();
    for (i, step) in def.steps.iter().enumerate() {
        // Module path and params
        match ModulePath::parse(&step.module) {
            Err(e) => errors.push(format!("step '{}': {e}", step.name)),
            Ok(_) => match registry.lookup(&step.module) {
                Err(e) => errors.push(format!("step '{}': {e}", step.name)),
                Ok(descriptor) => match step.params.as_object() {
                    None => errors.push(format!("step '{}': params must be an object", step.name)),
                    Some(params) => {
                        for spec in descriptor.params.iter().filter(|p| p.required) {
                            if !params.contains_key(&spec.name) {
                                errors.push(format!(
                                    "step '{}': missing required parameter '{}' for module '{}'",
                                    step.name, spec.name, step.module
                                ));
                            }
                        }
                        if !descriptor.params.is_empty() {
                            for key in params.keys() {
                                if !descriptor.params.iter().any(|p| &p.name == key) {
                                    warnings.push(format!(
                                        "step '{}': parameter '{}' is not declared by module '{}'",
                                        step.name, key, step.module
                                    ));
                                }
                            }
                        }
                    }
                },
            },
        }

        // References
        let mut refs: Vec<VariableRef> = Vec::new();
        match find_references(&step.params) {
            Ok(found) => refs.extend(found),
            Err(e) => errors.push(format!("step '{}': {e}", step.name)),
        }
        if let Some(condition) = &step.condition {
            match references_in_text(condition) {
                Ok(found) => {
                    refs.extend(found);
                    if let Err(e) = evaluator.check_condition(condition) {
                        errors.push(format!("step '{}' condition: {e}", step.name));
                    }
                }
                Err(e) => errors.push(format!("step '{}' condition: {e}", step.name)),
            }
        }

        let mut seen_roots = HashSet::new();
        for reference in &refs {
            let root = reference.root.as_str();
            if root == INPUT_ROOT || !seen_roots.insert(root) {
                continue;
            }
            match producers.get(root) {
                Some(&producer) if producer < i => {}
                // Self references are reported as cycles below.
                Some(&producer) if producer == i => {}
                Some(&producer) => warnings.push(format!(
                    "step '{}' references '{}' which is produced by later step '{}'",
                    step.name, root, def.steps[producer].name
                )),
                None => {
                    let message = format!(
                        "step '{}' references '{}' which no step declares as outputAs",
                        step.name, root
                    );
                    match policy {
                        ReferencePolicy::Error => errors.push(message),
                        ReferencePolicy::Warning => warnings.push(message),
                    }
                }
            }
        }
    }

    if let Err(e) = DependencyGraph::build(def) {
        errors.push(e.to_string());
    }

    if let Some(output_step) = &def.output_step {
        if def.step(output_step).is_none() {
            errors.push(format!("outputStep '{output_step}' names no step"));
        }
    }

    match def.trigger.trigger_type {
        TriggerType::Cron => match def.trigger.schedule.as_deref() {
            None => errors.push("cron trigger requires a schedule".to_string()),
            Some(schedule) => match normalize_schedule(schedule) {
                Err(e) => errors.push(e.to_string()),
                Ok(expr) => {
                    if let Err(e) = expr.parse::<croner::Cron>() {
                        errors.push(format!("invalid schedule '{schedule}': {e}"));
                    }
                }
            },
        },
        TriggerType::Webhook => match def.trigger.webhook_path.as_deref() {
            Some(path) if path.starts_with('/') => {}
            Some(path) => errors.push(format!("webhook path '{path}' must start with '/'")),
            None => errors.push("webhook trigger requires a webhookPath".to_string()),
        },
        TriggerType::Manual | TriggerType::Chat => {}
    }

    if errors.is_empty() {
        Ok(ValidationReport { warnings })
    } else {
        Err(WorkflowError::Invalid { errors })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{BoxModule, FnModule, ModuleDescriptor, ModuleError};
    use serde_json::{json, Value};
    use stepflow_types::module::{ParamSpec, ParamType};

    fn registry() -> ModuleRegistry {
        let echo = || BoxModule::new(FnModule::new(|v: Value| async move { Ok::<_, ModuleError>(v) }));
        let mut registry = ModuleRegistry::new();
        registry
            .register(
                ModuleDescriptor::new("crm.contacts.get", "Fetch contact", echo())
                    .unwrap()
                    .with_params(vec![ParamSpec::required("id", ParamType::String, "")]),
            )
            .unwrap();
        registry
            .register(ModuleDescriptor::new("messaging.sms.send", "Send SMS", echo()).unwrap())
            .unwrap();
        registry
    }

    fn errors_of(result: Result<ValidationReport, WorkflowError>) -> Vec<String> {
        match result {
            Err(WorkflowError::Invalid { errors }) => errors,
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    const VALID_YAML: &str = r#"
name: welcome
tenantId: acme
trigger:
  type: webhook
  webhookPath: /hooks/signup
steps:
  - name: lookup
    module: crm.contacts.get
    params:
      id: "{{ input.contactId }}"
    outputAs: contact
  - name: notify
    module: messaging.sms.send
    params:
      to: "{{contact.phone}}"
      text: "Welcome {{contact.name}}"
    condition: "{{contact.optedOut}} != true"
"#;

    #[test]
    fn test_parse_yaml_and_validate() {
        let def = parse_definition(VALID_YAML).unwrap();
        assert_eq!(def.tenant_id, "acme");
        assert_eq!(def.steps.len(), 2);
        let report = validate_definition(&def, &registry(), ReferencePolicy::Error).unwrap();
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn test_parse_json() {
        let def = parse_definition(
            r#"{"name":"j","steps":[{"name":"a","module":"messaging.sms.send"}]}"#,
        )
        .unwrap();
        assert_eq!(def.steps[0].params, json!({}));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            parse_definition("name: [unclosed"),
            Err(WorkflowError::Parse(_))
        ));
    }

    #[test]
    fn test_duplicate_output_as_rejected() {
        let def = parse_definition(
            r#"
name: dup
steps:
  - {name: a, module: messaging.sms.send, outputAs: x}
  - {name: b, module: messaging.sms.send, outputAs: x}
"#,
        )
        .unwrap();
        let errors = errors_of(validate_definition(&def, &registry(), ReferencePolicy::Error));
        assert!(errors.iter().any(|e| e.contains("duplicate outputAs 'x'")), "{errors:?}");
    }

    #[test]
    fn test_collects_all_errors() {
        let def = parse_definition(
            r#"
name: ""
steps:
  - {name: a, module: crm.contacts, outputAs: input}
  - {name: a, module: nope.nope.nope, params: {v: "{{x..y}}"}}
"#,
        )
        .unwrap();
        let errors = errors_of(validate_definition(&def, &registry(), ReferencePolicy::Error));
        assert!(errors.iter().any(|e| e.contains("name must not be empty")));
        assert!(errors.iter().any(|e| e.contains("duplicate step name 'a'")));
        assert!(errors.iter().any(|e| e.contains("three dot-separated segments")));
        assert!(errors.iter().any(|e| e.contains("reserved")));
        assert!(errors.iter().any(|e| e.contains("not registered")));
        assert!(errors.iter().any(|e| e.contains("malformed")));
    }

    #[test]
    fn test_condition_that_does_not_compile_is_rejected() {
        let def = parse_definition(
            r#"
name: cond
steps:
  - {name: lookup, module: crm.contacts.get, params: {id: "1"}, outputAs: contact}
  - name: notify
    module: messaging.sms.send
    condition: "{{contact.optedOut}} != true &&"
  - name: fine
    module: messaging.sms.send
    condition: "{{contact.score}} > 3 && input.channel|lower == 'sms'"
"#,
        )
        .unwrap();
        let errors = errors_of(validate_definition(&def, &registry(), ReferencePolicy::Error));
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].starts_with("step 'notify' condition: invalid condition syntax"), "{errors:?}");
    }

    #[test]
    fn test_missing_required_param_and_undeclared_warning() {
        let def = parse_definition(
            r#"
name: p
steps:
  - {name: a, module: crm.contacts.get, params: {extra: 1}}
"#,
        )
        .unwrap();
        let errors = errors_of(validate_definition(&def, &registry(), ReferencePolicy::Error));
        assert!(errors.iter().any(|e| e.contains("missing required parameter 'id'")));

        let def = parse_definition(
            r#"
name: p
steps:
  - {name: a, module: crm.contacts.get, params: {id: "1", extra: 1}}
"#,
        )
        .unwrap();
        let report = validate_definition(&def, &registry(), ReferencePolicy::Error).unwrap();
        assert!(report.warnings.iter().any(|w| w.contains("'extra'")));
    }

    #[test]
    fn test_forward_reference_is_warning() {
        let def = parse_definition(
            r#"
name: fwd
steps:
  - {name: a, module: messaging.sms.send, params: {v: "{{later.x}}"}}
  - {name: b, module: messaging.sms.send, outputAs: later}
"#,
        )
        .unwrap();
        let report = validate_definition(&def, &registry(), ReferencePolicy::Error).unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("later step 'b'"));
    }

    #[test]
    fn test_unknown_reference_follows_policy() {
        let def = parse_definition(
            r#"
name: ghost
steps:
  - {name: a, module: messaging.sms.send, params: {v: "{{ghost.x}}"}}
"#,
        )
        .unwrap();
        let errors = errors_of(validate_definition(&def, &registry(), ReferencePolicy::Error));
        assert!(errors[0].contains("no step declares"));

        let report = validate_definition(&def, &registry(), ReferencePolicy::Warning).unwrap();
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_cycle_rejected() {
        let def = parse_definition(
            r#"
name: loop
steps:
  - {name: a, module: messaging.sms.send, outputAs: x, params: {v: "{{y}}"}}
  - {name: b, module: messaging.sms.send, outputAs: y, params: {v: "{{x}}"}}
"#,
        )
        .unwrap();
        let errors = errors_of(validate_definition(&def, &registry(), ReferencePolicy::Error));
        assert!(errors.iter().any(|e| e.contains("cycle")), "{errors:?}");
    }

    #[test]
    fn test_output_step_and_triggers() {
        let def = parse_definition(
            r#"
name: t
outputStep: missing
trigger: {type: cron, schedule: "whenever"}
steps:
  - {name: a, module: messaging.sms.send}
"#,
        )
        .unwrap();
        let errors = errors_of(validate_definition(&def, &registry(), ReferencePolicy::Error));
        assert!(errors.iter().any(|e| e.contains("outputStep 'missing'")));
        assert!(errors.iter().any(|e| e.contains("invalid schedule")));

        let def = parse_definition(
            r#"
name: t
trigger: {type: cron, schedule: "every 5 minutes"}
steps:
  - {name: a, module: messaging.sms.send}
"#,
        )
        .unwrap();
        assert!(validate_definition(&def, &registry(), ReferencePolicy::Error).is_ok());

        let def = parse_definition(
            r#"
name: t
trigger: {type: webhook, webhookPath: "hooks"}
steps:
  - {name: a, module: messaging.sms.send}
"#,
        )
        .unwrap();
        let errors = errors_of(validate_definition(&def, &registry(), ReferencePolicy::Error));
        assert!(errors[0].contains("must start with '/'"));
    }

    #[test]
    fn test_yaml_serialization_reparses() {
        let def = parse_definition(VALID_YAML).unwrap();
        let yaml = serialize_definition_yaml(&def).unwrap();
        assert_eq!(parse_definition(&yaml).unwrap(), def);
    }

    #[test]
    fn test_load_definition_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.yaml");
        std::fs::write(&path, VALID_YAML).unwrap();
        let def = load_definition_file(&path).unwrap();
        assert_eq!(def.name, "welcome");

        let missing = load_definition_file(&dir.path().join("nope.yaml"));
        assert!(matches!(missing, Err(WorkflowError::Io(_))));
    }
}
