//! Address resolution and phone normalization
//!
//! Turns raw contact attributes into deliverable addresses. Phone numbers
//! follow Brazilian conventions: optional country code 55, two-digit area
//! code, then an 8 or 9 digit local number. Mobile numbers have a 9 digit
//! local part starting with 9.

use crate::clients::PhoneLookup;
use crate::config::OrchestratorConfig;
use crate::error::{DispatchError, Result};
use crate::types::{Address, AddressConfig, AddressSource, Contact, LotType};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

pub struct AddressResolver {
    lookup: Arc<dyn PhoneLookup>,
    min_phone_digits: usize,
    non_digits: Regex,
    email_pattern: Regex,
}

impl AddressResolver {
    pub fn new(lookup: Arc<dyn PhoneLookup>, config: &OrchestratorConfig) -> Self {
        Self {
            lookup,
            min_phone_digits: config.min_phone_digits,
            non_digits: Regex::new(r"\D").expect("Invalid non-digit pattern"),
            email_pattern: Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")
                .expect("Invalid email pattern"),
        }
    }

    /// Normalize a raw phone string into (area code, local number).
    ///
    /// Strips formatting and the country code 55, then requires 10 or 11
    /// digits. Anything else is not a usable number.
    pub fn normalize_phone(&self, raw: &str) -> Option<(String, String)> {
        let mut digits = self.non_digits.replace_all(raw, "").to_string();

        if (digits.len() == 12 || digits.len() == 13) && digits.starts_with("55") {
            digits = digits[2..].to_string();
        }

        if digits.len() < self.min_phone_digits {
            return None;
        }
        if digits.len() != 10 && digits.len() != 11 {
            return None;
        }

        let (area_code, number) = digits.split_at(2);
        Some((area_code.to_string(), number.to_string()))
    }

    /// Mobile numbers have a 9 digit local part starting with 9
    pub fn is_mobile(number: &str) -> bool {
        number.len() == 9 && number.starts_with('9')
    }

    fn parse_email(&self, raw: &str) -> Option<Address> {
        let trimmed = raw.trim();
        if self.email_pattern.is_match(trimmed) {
            Some(Address::Email {
                address: trimmed.to_string(),
            })
        } else {
            None
        }
    }

    fn parse_candidate(&self, raw: &str, lot_type: LotType) -> Option<Address> {
        match lot_type {
            LotType::Message => self
                .normalize_phone(raw)
                .map(|(area_code, number)| Address::Phone { area_code, number }),
            LotType::Email => self.parse_email(raw),
        }
    }

    /// Resolve the ordered candidate addresses for a contact.
    ///
    /// Returns a contact-data error when the source field is missing or no
    /// candidate survives normalization and filtering. The caller decides
    /// whether that fails an item or the whole operation.
    pub async fn resolve(
        &self,
        contact: &Contact,
        config: &AddressConfig,
        lot_type: LotType,
    ) -> Result<Vec<Address>> {
        let mut candidates = match &config.source {
            AddressSource::ContactField { field } => {
                let raw = contact.field_str(field).ok_or_else(|| {
                    DispatchError::ContactData(format!(
                        "Contact {} has no value in field '{}'",
                        contact.id, field
                    ))
                })?;
                self.parse_candidate(raw, lot_type).into_iter().collect()
            }
            AddressSource::CollectionField { field } => {
                let entries = contact
                    .fields
                    .get(field)
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| {
                        DispatchError::ContactData(format!(
                            "Contact {} has no collection in field '{}'",
                            contact.id, field
                        ))
                    })?;

                entries
                    .iter()
                    .filter_map(|entry| entry.as_str())
                    .filter_map(|raw| self.parse_candidate(raw, lot_type))
                    .collect()
            }
            AddressSource::ExternalLookup { tax_id_field } => {
                let tax_id = contact.field_str(tax_id_field).ok_or_else(|| {
                    DispatchError::ContactData(format!(
                        "Contact {} has no tax id in field '{}'",
                        contact.id, tax_id_field
                    ))
                })?;
                self.lookup_candidates(tax_id).await?
            }
        };

        if config.mobile_only {
            candidates.retain(|address| match address {
                Address::Phone { number, .. } => Self::is_mobile(number),
                Address::Email { .. } => true,
            });
        }

        if let Some(limit) = config.limit {
            candidates.truncate(limit as usize);
        }

        if candidates.is_empty() {
            return Err(DispatchError::ContactData(format!(
                "Contact {} has no usable address",
                contact.id
            )));
        }

        Ok(candidates)
    }

    /// Lookup candidates ranked best-first: duplicates collapse to their
    /// first occurrence, then a stable sort orders by descending score so
    /// ties keep the service's original order.
    async fn lookup_candidates(&self, tax_id: &str) -> Result<Vec<Address>> {
        let numbers = self.lookup.lookup_phones(tax_id).await?;

        let mut seen = HashSet::new();
        let mut scored = Vec::new();
        for candidate in numbers {
            let Some((area_code, number)) = self.normalize_phone(&candidate.number) else {
                log::debug!("Discarding unusable lookup candidate: {}", candidate.number);
                continue;
            };
            if seen.insert(format!("{}{}", area_code, number)) {
                scored.push((candidate.score, Address::Phone { area_code, number }));
            }
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        Ok(scored.into_iter().map(|(_, address)| address).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContactId, ScoredNumber};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    struct FakeLookup {
        numbers: Vec<ScoredNumber>,
    }

    #[async_trait]
    impl PhoneLookup for FakeLookup {
        async fn lookup_phones(&self, _tax_id: &str) -> Result<Vec<ScoredNumber>> {
            Ok(self.numbers.clone())
        }
    }

    fn resolver_with(numbers: Vec<ScoredNumber>) -> AddressResolver {
        AddressResolver::new(
            Arc::new(FakeLookup { numbers }),
            &OrchestratorConfig::default(),
        )
    }

    fn contact(fields: HashMap<String, serde_json::Value>) -> Contact {
        Contact {
            id: ContactId::new("c-1"),
            name: "Ana".to_string(),
            fields,
        }
    }

    fn scored(number: &str, score: f64) -> ScoredNumber {
        ScoredNumber {
            number: number.to_string(),
            score,
        }
    }

    #[test]
    fn phone_normalization_handles_common_shapes() {
        let resolver = resolver_with(Vec::new());

        assert_eq!(
            resolver.normalize_phone("(11) 98765-4321"),
            Some(("11".to_string(), "987654321".to_string()))
        );
        assert_eq!(
            resolver.normalize_phone("+55 11 98765-4321"),
            Some(("11".to_string(), "987654321".to_string()))
        );
        // Landline without country code
        assert_eq!(
            resolver.normalize_phone("1133334444"),
            Some(("11".to_string(), "33334444".to_string()))
        );
        // Too short, too long
        assert_eq!(resolver.normalize_phone("987654"), None);
        assert_eq!(resolver.normalize_phone("123456789012345"), None);
        assert_eq!(resolver.normalize_phone(""), None);
    }

    #[test]
    fn mobile_detection() {
        assert!(AddressResolver::is_mobile("987654321"));
        assert!(!AddressResolver::is_mobile("33334444"));
        assert!(!AddressResolver::is_mobile("887654321"));
    }

    #[tokio::test]
    async fn contact_field_yields_single_phone() {
        let resolver = resolver_with(Vec::new());
        let contact = contact(HashMap::from([("phone".to_string(), json!("11987654321"))]));

        let config = AddressConfig {
            source: AddressSource::ContactField {
                field: "phone".to_string(),
            },
            mobile_only: false,
            limit: None,
        };

        let addresses = resolver
            .resolve(&contact, &config, LotType::Message)
            .await
            .unwrap();
        assert_eq!(
            addresses,
            vec![Address::Phone {
                area_code: "11".to_string(),
                number: "987654321".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn missing_field_is_a_contact_data_error() {
        let resolver = resolver_with(Vec::new());
        let contact = contact(HashMap::new());

        let config = AddressConfig {
            source: AddressSource::ContactField {
                field: "phone".to_string(),
            },
            mobile_only: false,
            limit: None,
        };

        let err = resolver
            .resolve(&contact, &config, LotType::Message)
            .await
            .unwrap_err();
        assert!(err.is_contact_data());
    }

    #[tokio::test]
    async fn collection_preserves_order_and_skips_invalid_entries() {
        let resolver = resolver_with(Vec::new());
        let contact = contact(HashMap::from([(
            "phones".to_string(),
            json!(["11987654321", "not-a-phone", "21912345678"]),
        )]));

        let config = AddressConfig {
            source: AddressSource::CollectionField {
                field: "phones".to_string(),
            },
            mobile_only: false,
            limit: None,
        };

        let addresses = resolver
            .resolve(&contact, &config, LotType::Message)
            .await
            .unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(
            addresses[0],
            Address::Phone {
                area_code: "11".to_string(),
                number: "987654321".to_string(),
            }
        );
        assert_eq!(
            addresses[1],
            Address::Phone {
                area_code: "21".to_string(),
                number: "912345678".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn lookup_candidates_rank_by_descending_score() {
        let resolver = resolver_with(vec![
            scored("11911111111", 0.3),
            scored("11922222222", 0.9),
            scored("11933333333", 0.6),
        ]);
        let contact = contact(HashMap::from([("tax_id".to_string(), json!("12345678901"))]));

        let config = AddressConfig {
            source: AddressSource::ExternalLookup {
                tax_id_field: "tax_id".to_string(),
            },
            mobile_only: false,
            limit: None,
        };

        let addresses = resolver
            .resolve(&contact, &config, LotType::Message)
            .await
            .unwrap();
        let numbers: Vec<String> = addresses.iter().map(|a| a.dedup_key()).collect();
        assert_eq!(numbers, vec!["11922222222", "11933333333", "11911111111"]
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn lookup_deduplicates_before_ranking() {
        // Same number twice with different formatting; first occurrence wins
        let resolver = resolver_with(vec![
            scored("+55 (11) 98765-4321", 0.5),
            scored("11987654321", 0.9),
            scored("11912345678", 0.7),
        ]);
        let contact = contact(HashMap::from([("tax_id".to_string(), json!("12345678901"))]));

        let config = AddressConfig {
            source: AddressSource::ExternalLookup {
                tax_id_field: "tax_id".to_string(),
            },
            mobile_only: false,
            limit: None,
        };

        let addresses = resolver
            .resolve(&contact, &config, LotType::Message)
            .await
            .unwrap();
        let numbers: Vec<String> = addresses.iter().map(|a| a.dedup_key()).collect();
        assert_eq!(numbers, vec!["11912345678", "11987654321"]
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn mobile_only_and_limit_apply_after_ranking() {
        let resolver = resolver_with(vec![
            scored("1133334444", 0.95),
            scored("11911111111", 0.9),
            scored("11922222222", 0.8),
            scored("11933333333", 0.7),
        ]);
        let contact = contact(HashMap::from([("tax_id".to_string(), json!("12345678901"))]));

        let config = AddressConfig {
            source: AddressSource::ExternalLookup {
                tax_id_field: "tax_id".to_string(),
            },
            mobile_only: true,
            limit: Some(2),
        };

        let addresses = resolver
            .resolve(&contact, &config, LotType::Message)
            .await
            .unwrap();
        let numbers: Vec<String> = addresses.iter().map(|a| a.dedup_key()).collect();
        // Landline dropped despite highest score, then best two mobiles
        assert_eq!(numbers, vec!["11911111111", "11922222222"]
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn email_lot_validates_addresses() {
        let resolver = resolver_with(Vec::new());
        let contact = contact(HashMap::from([(
            "email".to_string(),
            json!("Ana.Silva@example.com"),
        )]));

        let config = AddressConfig {
            source: AddressSource::ContactField {
                field: "email".to_string(),
            },
            mobile_only: false,
            limit: None,
        };

        let addresses = resolver
            .resolve(&contact, &config, LotType::Email)
            .await
            .unwrap();
        assert_eq!(
            addresses,
            vec![Address::Email {
                address: "Ana.Silva@example.com".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn invalid_email_is_a_contact_data_error() {
        let resolver = resolver_with(Vec::new());
        let contact = contact(HashMap::from([("email".to_string(), json!("not-an-email"))]));

        let config = AddressConfig {
            source: AddressSource::ContactField {
                field: "email".to_string(),
            },
            mobile_only: false,
            limit: None,
        };

        let err = resolver
            .resolve(&contact, &config, LotType::Email)
            .await
            .unwrap_err();
        assert!(err.is_contact_data());
    }
}
