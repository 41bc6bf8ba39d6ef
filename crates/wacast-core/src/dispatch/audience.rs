//! Audience Resolver - expands a targeting rule into recipients

use super::error::DispatchError;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use wacast_common::types::{PhoneNumber, PhoneRules, TenantId};
use wacast_storage::models::{Contact, ContactFilter, Recipient, TargetingRule};
use wacast_storage::repository::ContactStore;

/// Resolves targeting rules against the contact store
pub struct AudienceResolver {
    contacts: Arc<dyn ContactStore>,
    phone_rules: PhoneRules,
}

impl AudienceResolver {
    pub fn new(contacts: Arc<dyn ContactStore>, phone_rules: PhoneRules) -> Self {
        Self {
            contacts,
            phone_rules,
        }
    }

    /// Deduplicated recipients for `rule`, in contact order.
    ///
    /// Every rule except `manual` only reaches active contacts that have not
    /// opted out. Fails with `EmptyAudience` when nobody is left.
    pub async fn resolve(
        &self,
        tenant_id: TenantId,
        rule: &TargetingRule,
    ) -> Result<Vec<Recipient>, DispatchError> {
        let recipients = match rule {
            TargetingRule::Manual { numbers } => self.resolve_manual(numbers),
            _ => {
                let filter = contact_filter(rule);
                let contacts = self.contacts.find_contacts(tenant_id, &filter).await?;
                self.resolve_contacts(contacts)
            }
        };

        debug!(
            rule = rule.kind(),
            recipients = recipients.len(),
            "Resolved campaign audience"
        );

        if recipients.is_empty() {
            return Err(DispatchError::EmptyAudience);
        }
        Ok(recipients)
    }

    fn resolve_contacts(&self, contacts: Vec<Contact>) -> Vec<Recipient> {
        let mut seen = HashSet::new();
        let mut recipients = Vec::with_capacity(contacts.len());

        for contact in contacts.into_iter().filter(Contact::is_reachable) {
            let Some(phone) = PhoneNumber::normalize(&contact.phone, &self.phone_rules) else {
                warn!(contact_id = %contact.id, "Skipping contact with invalid phone number");
                continue;
            };
            if seen.insert(phone.clone()) {
                recipients.push(Recipient {
                    phone,
                    display_name: contact.name,
                });
            }
        }
        recipients
    }

    fn resolve_manual(&self, numbers: &[String]) -> Vec<Recipient> {
        let mut seen = HashSet::new();
        let mut recipients = Vec::with_capacity(numbers.len());

        for raw in numbers {
            let Some(phone) = PhoneNumber::normalize(raw, &self.phone_rules) else {
                warn!(number = %raw, "Skipping invalid manual number");
                continue;
            };
            if seen.insert(phone.clone()) {
                recipients.push(Recipient {
                    phone,
                    display_name: String::new(),
                });
            }
        }
        recipients
    }
}

fn contact_filter(rule: &TargetingRule) -> ContactFilter {
    let mut filter = ContactFilter {
        active_only: true,
        exclude_opt_out: true,
        ..Default::default()
    };
    match rule {
        TargetingRule::All | TargetingRule::Manual { .. } => {}
        TargetingRule::Tags { tags } => filter.tags = Some(tags.iter().cloned().collect()),
        TargetingRule::Groups { groups } => filter.group_ids = Some(groups.iter().copied().collect()),
        TargetingRule::Explicit { contact_ids } => {
            filter.ids = Some(contact_ids.iter().copied().collect())
        }
    }
    filter
}

/// Check a targeting rule when a campaign is created or edited
pub fn validate_rule(rule: &TargetingRule, phone_rules: &PhoneRules) -> Result<(), DispatchError> {
    match rule {
        TargetingRule::All => Ok(()),
        TargetingRule::Tags { tags } => {
            if tags.is_empty() || tags.iter().any(|t| t.trim().is_empty()) {
                return Err(DispatchError::Validation(
                    "tags rule needs at least one non-empty tag".to_string(),
                ));
            }
            Ok(())
        }
        TargetingRule::Groups { groups } if groups.is_empty() => Err(DispatchError::Validation(
            "groups rule needs at least one group".to_string(),
        )),
        TargetingRule::Explicit { contact_ids } if contact_ids.is_empty() => Err(
            DispatchError::Validation("explicit rule needs at least one contact".to_string()),
        ),
        TargetingRule::Manual { numbers } => {
            if numbers.is_empty() {
                return Err(DispatchError::Validation(
                    "manual rule needs at least one number".to_string(),
                ));
            }
            let invalid: Vec<&str> = numbers
                .iter()
                .filter(|n| PhoneNumber::normalize(n, phone_rules).is_none())
                .map(String::as_str)
                .collect();
            if !invalid.is_empty() {
                return Err(DispatchError::Validation(format!(
                    "invalid phone numbers: {}",
                    invalid.join(", ")
                )));
            }
            Ok(())
        }
        TargetingRule::Groups { .. } | TargetingRule::Explicit { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;
    use wacast_storage::MemoryStore;

    fn contact(tenant_id: TenantId, name: &str, phone: &str, tags: &[&str]) -> Contact {
        Contact {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            phone: phone.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            group_ids: Vec::new(),
            opt_out: false,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn resolver(store: &Arc<MemoryStore>) -> AudienceResolver {
        AudienceResolver::new(store.clone(), PhoneRules::default())
    }

    fn tags(values: &[&str]) -> TargetingRule {
        TargetingRule::Tags {
            tags: values.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_overlapping_tags_resolve_once() {
        let store = Arc::new(MemoryStore::new());
        let tenant = Uuid::new_v4();
        store
            .insert_contact(contact(tenant, "Dana", "0501234567", &["vip", "beta"]))
            .unwrap();
        store
            .insert_contact(contact(tenant, "Dana (work)", "+972-50-123-4567", &["beta"]))
            .unwrap();
        store
            .insert_contact(contact(tenant, "Noa", "0502345678", &["vip"]))
            .unwrap();

        let recipients = resolver(&store)
            .resolve(tenant, &tags(&["vip", "beta"]))
            .await
            .unwrap();

        let names: Vec<&str> = recipients.iter().map(|r| r.display_name.as_str()).collect();
        assert_eq!(names, vec!["Dana", "Noa"]);
    }

    #[tokio::test]
    async fn test_vip_tag_with_one_opt_out() {
        let store = Arc::new(MemoryStore::new());
        let tenant = Uuid::new_v4();
        for i in 0..5 {
            let mut c = contact(tenant, &format!("VIP {}", i), &format!("05012345{:02}", i), &["vip"]);
            c.opt_out = i == 2;
            store.insert_contact(c).unwrap();
        }
        store
            .insert_contact(contact(tenant, "Regular", "0509999999", &["regular"]))
            .unwrap();

        let recipients = resolver(&store).resolve(tenant, &tags(&["vip"])).await.unwrap();
        assert_eq!(recipients.len(), 4);
        assert!(recipients.iter().all(|r| r.display_name != "VIP 2"));
    }

    #[tokio::test]
    async fn test_explicit_rule_still_excludes_opt_out_and_inactive() {
        let store = Arc::new(MemoryStore::new());
        let tenant = Uuid::new_v4();
        let keep = contact(tenant, "Keep", "0501111111", &[]);
        let mut opted_out = contact(tenant, "Opted out", "0502222222", &[]);
        opted_out.opt_out = true;
        let mut inactive = contact(tenant, "Inactive", "0503333333", &[]);
        inactive.active = false;

        let rule = TargetingRule::Explicit {
            contact_ids: [keep.id, opted_out.id, inactive.id].into_iter().collect(),
        };
        for c in [keep, opted_out, inactive] {
            store.insert_contact(c).unwrap();
        }

        let recipients = resolver(&store).resolve(tenant, &rule).await.unwrap();
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].display_name, "Keep");
    }

    #[tokio::test]
    async fn test_other_tenants_are_invisible() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_contact(contact(Uuid::new_v4(), "Elsewhere", "0501234567", &[]))
            .unwrap();

        let err = resolver(&store)
            .resolve(Uuid::new_v4(), &TargetingRule::All)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::EmptyAudience));
    }

    #[tokio::test]
    async fn test_manual_numbers_with_mixed_formats() {
        let store = Arc::new(MemoryStore::new());
        let rule = TargetingRule::Manual {
            numbers: vec![
                "0501234567".to_string(),
                "+972502345678".to_string(),
                "972503456789".to_string(),
            ],
        };

        let recipients = resolver(&store).resolve(Uuid::new_v4(), &rule).await.unwrap();
        let phones: Vec<&str> = recipients.iter().map(|r| r.phone.as_str()).collect();
        assert_eq!(phones, vec!["972501234567", "972502345678", "972503456789"]);
    }

    #[tokio::test]
    async fn test_manual_duplicates_collapse() {
        let store = Arc::new(MemoryStore::new());
        let rule = TargetingRule::Manual {
            numbers: vec!["0501234567".to_string(), "+972 50 123 4567".to_string()],
        };

        let recipients = resolver(&store).resolve(Uuid::new_v4(), &rule).await.unwrap();
        assert_eq!(recipients.len(), 1);
    }

    #[test]
    fn test_validate_rule() {
        let rules = PhoneRules::default();
        assert!(validate_rule(&TargetingRule::All, &rules).is_ok());
        assert!(validate_rule(&tags(&[]), &rules).is_err());
        assert!(validate_rule(&tags(&[" "]), &rules).is_err());
        assert!(validate_rule(
            &TargetingRule::Manual {
                numbers: vec!["0501234567".to_string(), "123".to_string()]
            },
            &rules
        )
        .is_err());
        assert!(validate_rule(
            &TargetingRule::Groups {
                groups: Default::default()
            },
            &rules
        )
        .is_err());
    }
}
