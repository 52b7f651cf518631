//! Contact validation rule: email and phone presence, format, placeholders
//! and emails shared across distinct providers.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{EntityCheck, Issue, Rule, RuleInput, fold_issues, text_field};
use crate::models::{EntityType, GoldenRecord, Severity, provider_fields};
use crate::{GoldrecError, Result};

const EMAIL_PATTERN: &str = r"^[^@\s]+@[^@\s]+\.[A-Za-z]{2,}$";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactValidationParams {
    /// Domains that mark an address as a placeholder
    pub placeholder_domains: Vec<String>,
    /// Local parts that mark an address as a placeholder
    pub placeholder_local_parts: Vec<String>,
    pub missing_severity: Severity,
    pub malformed_severity: Severity,
    pub placeholder_severity: Severity,
    pub duplicate_severity: Severity,
}

impl Default for ContactValidationParams {
    fn default() -> Self {
        let strings = |values: &[&str]| values.iter().map(|v| (*v).to_string()).collect();
        Self {
            placeholder_domains: strings(&[
                "example.com",
                "example.org",
                "example.net",
                "test.com",
                "test.org",
                "mailinator.com",
                "localhost",
            ]),
            placeholder_local_parts: strings(&[
                "test", "noreply", "no-reply", "none", "na", "unknown", "dummy", "fake", "null",
            ]),
            missing_severity: Severity::Low,
            malformed_severity: Severity::Medium,
            placeholder_severity: Severity::Medium,
            duplicate_severity: Severity::Medium,
        }
    }
}

impl ContactValidationParams {
    pub(crate) fn problem(&self) -> Option<String> {
        self.placeholder_domains
            .iter()
            .chain(self.placeholder_local_parts.iter())
            .any(|v| v.trim().is_empty())
            .then(|| "placeholder entries must not be empty".to_string())
    }
}

pub(crate) struct ContactValidationRule {
    name: String,
    params: ContactValidationParams,
    email: Regex,
}

impl ContactValidationRule {
    pub(crate) fn new(name: String, params: ContactValidationParams) -> Result<Self> {
        let email = Regex::new(EMAIL_PATTERN)
            .map_err(|e| GoldrecError::configuration(format!("email pattern: {}", e)))?;
        Ok(Self {
            name,
            params,
            email,
        })
    }

    fn is_placeholder(&self, email: &str) -> bool {
        let Some((local, domain)) = email.rsplit_once('@') else {
            return false;
        };
        self.params
            .placeholder_domains
            .iter()
            .any(|d| domain == d.to_lowercase() || domain.ends_with(&format!(".{}", d.to_lowercase())))
            || self
                .params
                .placeholder_local_parts
                .iter()
                .any(|l| local == l.to_lowercase())
    }

    /// Lowercased email, if it is well-formed and not a placeholder.
    fn usable_email(&self, raw: &str) -> Option<String> {
        let email = raw.trim().to_lowercase();
        (self.email.is_match(&email) && !self.is_placeholder(&email)).then_some(email)
    }

    fn email_issues(&self, raw: Option<&str>, issues: &mut Vec<Issue>) {
        let p = &self.params;
        match raw {
            None => issues.push(
                Issue::new(p.missing_severity, "email missing").expected("a reachable email"),
            ),
            Some(raw) => {
                let email = raw.trim().to_lowercase();
                if !self.email.is_match(&email) {
                    issues.push(
                        Issue::new(p.malformed_severity, "email malformed")
                            .detected(raw)
                            .expected("name@domain.tld"),
                    );
                } else if self.is_placeholder(&email) {
                    issues.push(
                        Issue::new(p.placeholder_severity, "email looks like a placeholder")
                            .detected(raw)
                            .expected("a real mailbox"),
                    );
                }
            }
        }
    }

    fn phone_issues(&self, raw: Option<&str>, issues: &mut Vec<Issue>) {
        let p = &self.params;
        match raw {
            None => issues.push(
                Issue::new(p.missing_severity, "phone missing").expected("a 10-digit phone"),
            ),
            Some(raw) if !is_plausible_phone(raw) => issues.push(
                Issue::new(p.malformed_severity, "phone malformed")
                    .detected(raw)
                    .expected("a 10-digit phone"),
            ),
            Some(_) => {}
        }
    }
}

/// Ten digits (optionally prefixed by country code 1), separators only,
/// and not a single repeated digit.
fn is_plausible_phone(raw: &str) -> bool {
    if !raw
        .chars()
        .all(|c| c.is_ascii_digit() || " ()-.+".contains(c))
    {
        return false;
    }
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let national = match digits.len() {
        10 => digits.as_str(),
        11 if digits.starts_with('1') => &digits[1..],
        _ => return false,
    };
    let first = national.chars().next();
    !national.chars().all(|c| Some(c) == first)
}

impl Rule for ContactValidationRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, input: &RuleInput<'_>) -> Vec<EntityCheck> {
        use provider_fields as f;

        let contacts: Vec<(&GoldenRecord, Result<(Option<&str>, Option<&str>)>)> = input
            .graph
            .providers
            .iter()
            .map(|p| {
                let contact = text_field(&self.name, p, f::EMAIL)
                    .and_then(|email| Ok((email, text_field(&self.name, p, f::PHONE)?)));
                (p, contact)
            })
            .collect();

        let mut email_owners: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for (provider, contact) in &contacts {
            let provider: &GoldenRecord = *provider;
            if let Ok((Some(raw), _)) = contact
                && let Some(email) = self.usable_email(raw)
            {
                email_owners
                    .entry(email)
                    .or_default()
                    .push(provider.cluster_id.as_str());
            }
        }

        contacts
            .into_iter()
            .map(|(provider, contact)| {
                let outcome = contact.map(|(email, phone)| {
                    let mut issues = Vec::new();
                    self.email_issues(email, &mut issues);
                    self.phone_issues(phone, &mut issues);

                    if let Some(email) = email.and_then(|e| self.usable_email(e)) {
                        let others: Vec<&str> = email_owners
                            .get(&email)
                            .map(|ids| {
                                ids.iter()
                                    .copied()
                                    .filter(|id| *id != provider.cluster_id)
                                    .collect()
                            })
                            .unwrap_or_default();
                        if !others.is_empty() {
                            issues.push(
                                Issue::new(
                                    self.params.duplicate_severity,
                                    format!("email shared with {}", others.join(", ")),
                                )
                                .detected(&email)
                                .expected("email unique to one provider"),
                            );
                        }
                    }

                    fold_issues(&self.name, EntityType::Provider, &provider.cluster_id, issues)
                });
                EntityCheck {
                    entity_id: provider.cluster_id.clone(),
                    outcome,
                }
            })
            .collect()
    }
}
