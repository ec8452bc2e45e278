//! Template placeholder rendering.
//!
//! Supported: `{{first_name}}`, `{{last_name}}`, `{{email}}`, `{{external_id}}`
//! and `{{traits.<key>}}`. Unknown placeholders render as an empty string.

use std::sync::OnceLock;

use dripline_core::types::{LeadIdentity, MessageTemplate};
use regex::{Captures, Regex};

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex is valid")
    })
}

/// Subject and body with lead fields substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

/// Render both subject and body of a template for one lead.
pub fn render_message(template: &MessageTemplate, lead: &LeadIdentity) -> RenderedMessage {
    RenderedMessage {
        subject: render(&template.subject, lead),
        body: render(&template.body, lead),
    }
}

/// Substitute placeholders in `text`.
pub fn render(text: &str, lead: &LeadIdentity) -> String {
    placeholder_re()
        .replace_all(text, |caps: &Captures| lookup(&caps[1], lead))
        .into_owned()
}

fn lookup(key: &str, lead: &LeadIdentity) -> String {
    match key {
        "first_name" | "firstName" => lead.first_name.clone().unwrap_or_default(),
        "last_name" | "lastName" => lead.last_name.clone().unwrap_or_default(),
        "email" => lead.email.clone().unwrap_or_default(),
        "external_id" | "externalId" => lead.external_id.clone(),
        _ => match key.strip_prefix("traits.") {
            Some(trait_key) => match lead.traits.get(trait_key) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            },
            None => String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dripline_core::types::Traits;

    fn lead() -> LeadIdentity {
        let mut traits = Traits::new();
        traits.insert("company".into(), serde_json::json!("Acme"));
        traits.insert("seats".into(), serde_json::json!(12));
        LeadIdentity {
            id: "l1".into(),
            account_id: "a1".into(),
            external_id: "ext-1".into(),
            email: Some("ada@acme.io".into()),
            first_name: Some("Ada".into()),
            last_name: None,
            traits,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_render_fields_and_traits() {
        let out = render(
            "Hi {{first_name}} from {{ traits.company }} ({{traits.seats}} seats) <{{email}}>",
            &lead(),
        );
        assert_eq!(out, "Hi Ada from Acme (12 seats) <ada@acme.io>");
    }

    #[test]
    fn test_unknown_and_missing_render_empty() {
        assert_eq!(render("[{{last_name}}][{{nope}}][{{traits.x}}]", &lead()), "[][][]");
    }

    #[test]
    fn test_text_without_placeholders_unchanged() {
        assert_eq!(render("plain {text}", &lead()), "plain {text}");
    }
}
