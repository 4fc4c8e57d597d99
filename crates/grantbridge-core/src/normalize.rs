//! Declarative payload-to-record translation.
//!
//! A [`FieldMapping`] names, for every canonical field, the JSON pointers to try
//! inside one upstream item. The first pointer yielding a non-empty value wins.
//! Items that cannot produce a valid record are skipped and logged; they never
//! fail the whole payload.

use serde_json::Value;

use crate::data_source::FetchError;
use crate::registry::SourceDescriptor;
use crate::{CanonicalGrantRecord, DateFormat, Deadline, GrantStatus, UtcDateTime, ValidationError};

/// Per-source mapping from upstream item fields to canonical fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    /// Pointer to the item array inside the payload. Empty means the payload itself.
    pub items: String,
    pub external_id: Vec<String>,
    pub title: Vec<String>,
    pub funder: Vec<String>,
    pub amount_min: Vec<String>,
    pub amount_max: Vec<String>,
    pub deadline: Vec<String>,
    pub description: Vec<String>,
    pub eligibility: Vec<String>,
    pub link: Vec<String>,
    pub tags: Vec<String>,
    pub status: Vec<String>,
    /// Upstream deadline formats tried after ISO dates.
    pub deadline_formats: Vec<DateFormat>,
    /// Used when no link pointer resolves; `{id}` is replaced by the encoded external id.
    pub link_template: Option<String>,
    pub static_tags: Vec<String>,
    pub default_status: GrantStatus,
}

/// Builds an owned pointer list.
pub fn pointers(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_owned()).collect()
}

impl FieldMapping {
    pub fn new(items: impl Into<String>, external_id: &[&str], title: &[&str]) -> Self {
        Self {
            items: items.into(),
            external_id: pointers(external_id),
            title: pointers(title),
            funder: Vec::new(),
            amount_min: Vec::new(),
            amount_max: Vec::new(),
            deadline: Vec::new(),
            description: Vec::new(),
            eligibility: Vec::new(),
            link: Vec::new(),
            tags: Vec::new(),
            status: Vec::new(),
            deadline_formats: Vec::new(),
            link_template: None,
            static_tags: Vec::new(),
            default_status: GrantStatus::Unknown,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.items.is_empty() {
            validate_pointer(&self.items)?;
        }
        if self.external_id.is_empty() {
            return Err(ValidationError::EmptyField {
                field: "external_id",
            });
        }
        if self.title.is_empty() {
            return Err(ValidationError::EmptyField { field: "title" });
        }
        [
            &self.external_id,
            &self.title,
            &self.funder,
            &self.amount_min,
            &self.amount_max,
            &self.deadline,
            &self.description,
            &self.eligibility,
            &self.link,
            &self.tags,
            &self.status,
        ]
        .into_iter()
        .flatten()
        .try_for_each(|pointer| validate_pointer(pointer))
    }

    /// Translates a raw payload into canonical records for `descriptor`'s source.
    ///
    /// # Errors
    ///
    /// Returns a parse [`FetchError`] when the item array is missing or is not an
    /// array. A `null` item array yields no records.
    pub fn normalize(
        &self,
        payload: &Value,
        descriptor: &SourceDescriptor,
        discovered_at: UtcDateTime,
    ) -> Result<Vec<CanonicalGrantRecord>, FetchError> {
        let items = if self.items.is_empty() {
            Some(payload)
        } else {
            payload.pointer(&self.items)
        };
        let items = match items {
            Some(Value::Array(items)) => items.as_slice(),
            Some(Value::Null) => &[],
            Some(_) => {
                return Err(FetchError::parse(format!(
                    "'{}' in payload is not an array",
                    self.items
                )))
            }
            None => {
                return Err(FetchError::parse(format!(
                    "payload has no item array at '{}'",
                    self.items
                )))
            }
        };

        let mut records = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            match self.record(item, descriptor, discovered_at) {
                Ok(record) => records.push(record),
                Err(reason) => tracing::debug!(
                    source = %descriptor.id,
                    index,
                    %reason,
                    "skipping upstream item"
                ),
            }
        }
        Ok(records)
    }

    fn record(
        &self,
        item: &Value,
        descriptor: &SourceDescriptor,
        discovered_at: UtcDateTime,
    ) -> Result<CanonicalGrantRecord, ValidationError> {
        let external_id = first_text(item, &self.external_id).ok_or(ValidationError::EmptyField {
            field: "external_id",
        })?;
        let title = first_text(item, &self.title).ok_or(ValidationError::EmptyField { field: "title" })?;

        let mut amount_min = first_amount(item, &self.amount_min);
        let mut amount_max = first_amount(item, &self.amount_max);
        if let (Some(min), Some(max)) = (amount_min, amount_max) {
            if min > max {
                std::mem::swap(&mut amount_min, &mut amount_max);
            }
        }

        let link = first_text(item, &self.link).or_else(|| {
            self.link_template
                .as_ref()
                .map(|template| template.replace("{id}", &urlencoding::encode(&external_id)))
        });

        let mut tags = Vec::new();
        for tag in self
            .tags
            .iter()
            .filter_map(|pointer| item.pointer(pointer))
            .flat_map(tag_values)
            .chain(self.static_tags.iter().cloned())
        {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        let record = CanonicalGrantRecord {
            id: CanonicalGrantRecord::stable_id(&descriptor.id, &external_id),
            title,
            funder: first_text(item, &self.funder),
            amount_min,
            amount_max,
            deadline: Deadline::interpret(
                first_text(item, &self.deadline).as_deref(),
                &self.deadline_formats,
            ),
            description: first_text(item, &self.description),
            eligibility: first_text(item, &self.eligibility),
            link,
            source: descriptor.id.clone(),
            source_url: descriptor.homepage.clone(),
            tags,
            discovered_at,
            status: first_text(item, &self.status)
                .map(|raw| GrantStatus::from_upstream(&raw))
                .unwrap_or(self.default_status),
        };
        record.validate()?;
        Ok(record)
    }
}

fn validate_pointer(pointer: &str) -> Result<(), ValidationError> {
    if pointer.starts_with('/') {
        Ok(())
    } else {
        Err(ValidationError::InvalidPointer {
            pointer: pointer.to_owned(),
        })
    }
}

fn text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(value) => value.trim().to_owned(),
        Value::Number(value) => value.to_string(),
        Value::Bool(value) => value.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn first_text(item: &Value, pointers: &[String]) -> Option<String> {
    pointers
        .iter()
        .filter_map(|pointer| item.pointer(pointer))
        .find_map(text)
}

fn amount(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(value) => value.as_f64(),
        Value::String(value) => value
            .trim()
            .trim_start_matches('$')
            .replace(',', "")
            .parse::<f64>()
            .ok(),
        _ => None,
    }?;
    (parsed.is_finite() && parsed >= 0.0).then_some(parsed)
}

fn first_amount(item: &Value, pointers: &[String]) -> Option<f64> {
    pointers
        .iter()
        .filter_map(|pointer| item.pointer(pointer))
        .find_map(amount)
}

fn tag_values(value: &Value) -> Vec<String> {
    match value {
        Value::Array(values) => values.iter().filter_map(text).collect(),
        Value::String(value) => value
            .split([',', '|', ';'])
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SourceRegistry;
    use serde_json::json;

    fn grants_gov() -> SourceDescriptor {
        SourceRegistry::default_catalog()
            .get("grants_gov")
            .expect("grants_gov is in the default catalog")
            .clone()
    }

    fn now() -> UtcDateTime {
        UtcDateTime::parse("2025-03-01T12:00:00Z").expect("valid")
    }

    #[test]
    fn maps_grants_gov_hits_to_canonical_records() {
        let descriptor = grants_gov();
        let payload = json!({
            "data": {
                "oppHits": [{
                    "id": "356743",
                    "number": "HHS-2025-ACF-0001",
                    "title": "Rural Health Outreach",
                    "agencyName": "Health Resources and Services Administration",
                    "closeDate": "04/30/2025",
                    "oppStatus": "posted",
                    "cfdaList": ["93.912"]
                }]
            }
        });

        let records = descriptor
            .field_mapping
            .normalize(&payload, &descriptor, now())
            .expect("payload normalizes");

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.id, "grants_gov:356743");
        assert_eq!(record.deadline.to_string(), "2025-04-30");
        assert_eq!(record.status, GrantStatus::Open);
        assert_eq!(
            record.link.as_deref(),
            Some("https://www.grants.gov/search-results-detail/356743")
        );
        assert!(record.tags.contains(&String::from("93.912")));
        assert_eq!(record.discovered_at, now());
    }

    #[test]
    fn skips_items_without_id_or_title() {
        let descriptor = grants_gov();
        let payload = json!({
            "data": { "oppHits": [
                { "title": "no id" },
                { "id": "1" },
                { "id": "2", "title": "kept", "closeDate": "sometime soon" }
            ]}
        });

        let records = descriptor
            .field_mapping
            .normalize(&payload, &descriptor, now())
            .expect("payload normalizes");

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].deadline, Deadline::Unknown);
    }

    #[test]
    fn missing_item_array_is_a_parse_error_and_null_is_empty() {
        let descriptor = grants_gov();

        let error = descriptor
            .field_mapping
            .normalize(&json!({ "errorcode": 1 }), &descriptor, now())
            .expect_err("missing array");
        assert_eq!(error.code(), "source.parse");

        let records = descriptor
            .field_mapping
            .normalize(&json!({ "data": { "oppHits": null } }), &descriptor, now())
            .expect("null array is empty");
        assert!(records.is_empty());
    }

    #[test]
    fn amounts_accept_currency_strings_and_order_is_repaired() {
        let mut mapping = FieldMapping::new("", &["/id"], &["/name"]);
        mapping.amount_min = pointers(&["/floor"]);
        mapping.amount_max = pointers(&["/ceiling"]);
        let descriptor = grants_gov();

        let records = mapping
            .normalize(
                &json!([{ "id": 7, "name": "x", "floor": "$50,000", "ceiling": 10000 }]),
                &descriptor,
                now(),
            )
            .expect("normalizes");

        assert_eq!(records[0].amount_min, Some(10_000.0));
        assert_eq!(records[0].amount_max, Some(50_000.0));
    }

    #[test]
    fn validate_rejects_relative_pointers() {
        let mut mapping = FieldMapping::new("/items", &["/id"], &["/title"]);
        mapping.funder = pointers(&["agency"]);

        assert_eq!(
            mapping.validate(),
            Err(ValidationError::InvalidPointer {
                pointer: String::from("agency")
            })
        );
    }
}
