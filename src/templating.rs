//! `{{variable}}` substitution for campaign subjects and bodies.
//!
//! Rendering is fail-open: a placeholder whose name is not in the variable
//! map is left in the output verbatim. Authoring-time checks go through
//! [`validate_template`], which only reports unknown names.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::outreach::model::Lead;

/// Variable name → value.
pub type TemplateVars = HashMap<String, String>;

/// Names a template may reference.
pub const KNOWN_VARIABLES: &[&str] = &[
    "company",
    "contact",
    "contactName",
    "city",
    "sender",
    "senderName",
    "industry",
    "website",
    "role",
    "phone",
];

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(\w+)\}\}").expect("placeholder regex is valid"));

/// Replace every `{{name}}` with its value in a single pass.
///
/// Substituted values are never re-scanned, so a value that itself contains
/// `{{x}}` comes out literally.
pub fn render_template(template: &str, vars: &TemplateVars) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Result of [`validate_template`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateCheck {
    pub valid: bool,
    /// Unknown names in order of appearance (duplicates kept).
    pub unknown_variables: Vec<String>,
}

/// Report placeholder names outside [`KNOWN_VARIABLES`].
pub fn validate_template(template: &str) -> TemplateCheck {
    let unknown_variables: Vec<String> = PLACEHOLDER
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .filter(|name| !KNOWN_VARIABLES.contains(&name.as_str()))
        .collect();

    TemplateCheck {
        valid: unknown_variables.is_empty(),
        unknown_variables,
    }
}

/// Build the variable map for a lead. Missing optional attributes render as
/// empty strings rather than staying as placeholders.
pub fn lead_variables(lead: &Lead, sender_name: &str) -> TemplateVars {
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();

    [
        ("company", lead.company.clone()),
        ("contact", lead.contact_name.clone()),
        ("contactName", lead.contact_name.clone()),
        ("city", opt(&lead.city)),
        ("sender", sender_name.to_string()),
        ("senderName", sender_name.to_string()),
        ("industry", opt(&lead.industry)),
        ("website", opt(&lead.website)),
        ("role", opt(&lead.role)),
        ("phone", opt(&lead.phone)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> TemplateVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_values() {
        let out = render_template(
            "Hi {{contact}}, quick question about {{company}}",
            &vars(&[("contact", "Jane"), ("company", "Acme")]),
        );
        assert_eq!(out, "Hi Jane, quick question about Acme");
    }

    #[test]
    fn unknown_placeholder_left_verbatim() {
        let out = render_template("Hello {{nickname}} from {{city}}", &vars(&[("city", "Oslo")]));
        assert_eq!(out, "Hello {{nickname}} from Oslo");
    }

    #[test]
    fn repeated_placeholders_all_replaced() {
        let out = render_template("{{company}}/{{company}}", &vars(&[("company", "X")]));
        assert_eq!(out, "X/X");
    }

    #[test]
    fn values_are_not_expanded_again() {
        let out = render_template(
            "{{company}}",
            &vars(&[("company", "{{city}}"), ("city", "Oslo")]),
        );
        assert_eq!(out, "{{city}}");
    }

    #[test]
    fn malformed_braces_untouched() {
        let input = "{{ company }} {company} {{}} {{comp-any}}";
        assert_eq!(render_template(input, &vars(&[("company", "X")])), input);
    }

    #[test]
    fn empty_template() {
        assert_eq!(render_template("", &TemplateVars::new()), "");
    }

    #[test]
    fn validate_flags_unknown_names() {
        let check = validate_template("{{company}} {{favoriteColor}} {{role}} {{x}}");
        assert!(!check.valid);
        assert_eq!(check.unknown_variables, vec!["favoriteColor", "x"]);
    }

    #[test]
    fn validate_accepts_known_names() {
        let check = validate_template("{{contactName}} at {{company}}, {{senderName}}");
        assert!(check.valid);
        assert!(check.unknown_variables.is_empty());
    }

    #[test]
    fn lead_variables_blank_missing_fields() {
        let lead = Lead::new("Acme", "Jane").with_city("Bergen");
        let v = lead_variables(&lead, "Sam");
        assert_eq!(v["company"], "Acme");
        assert_eq!(v["contact"], "Jane");
        assert_eq!(v["contactName"], "Jane");
        assert_eq!(v["city"], "Bergen");
        assert_eq!(v["sender"], "Sam");
        assert_eq!(v["industry"], "");
        assert_eq!(v.len(), KNOWN_VARIABLES.len());
        assert_eq!(
            render_template("{{contact}} / {{industry}}", &v),
            "Jane / "
        );
    }
}
