use std::fmt::{Display, Formatter};

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::format_description::well_known::Iso8601;
use time::format_description::{BorrowedFormatItem, OwnedFormatItem};
use time::macros::format_description;
use time::Date;

use crate::{SourceId, UtcDateTime, ValidationError};

const ISO_DATE: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Application deadline of an opportunity.
///
/// Serialized as `"YYYY-MM-DD"`, `"Rolling"`, `"unknown"` or `null`. The field is
/// always present in serialized records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Deadline {
    Date(Date),
    Rolling,
    /// The upstream record carried no deadline at all.
    NotProvided,
    /// The upstream record carried a deadline value that could not be interpreted.
    Unknown,
}

impl Deadline {
    pub const ROLLING: &'static str = "Rolling";
    pub const UNKNOWN: &'static str = "unknown";

    /// Interprets a raw upstream deadline string using the accepted date formats.
    ///
    /// Blank input maps to [`Deadline::NotProvided`]; unparseable input maps to
    /// [`Deadline::Unknown`] instead of being dropped.
    pub fn interpret(raw: Option<&str>, formats: &[DateFormat]) -> Self {
        let Some(raw) = raw.map(str::trim) else {
            return Self::NotProvided;
        };
        if raw.is_empty() {
            return Self::NotProvided;
        }

        let lowered = raw.to_ascii_lowercase();
        if lowered.contains("rolling") || lowered == "continuous" || lowered == "open" {
            return Self::Rolling;
        }

        if let Ok(date) = Date::parse(raw, ISO_DATE) {
            return Self::Date(date);
        }
        for format in formats {
            if let Some(date) = format.parse(raw) {
                return Self::Date(date);
            }
        }
        // Full timestamps such as `2025-04-30T23:59:59Z`.
        if let Ok(datetime) = time::OffsetDateTime::parse(raw, &Iso8601::DEFAULT) {
            return Self::Date(datetime.date());
        }

        Self::Unknown
    }

    pub fn date(self) -> Option<Date> {
        match self {
            Self::Date(date) => Some(date),
            _ => None,
        }
    }

    fn to_token(self) -> Option<String> {
        match self {
            Self::Date(date) => Some(
                date.format(ISO_DATE)
                    .expect("calendar dates are always ISO formattable"),
            ),
            Self::Rolling => Some(String::from(Self::ROLLING)),
            Self::Unknown => Some(String::from(Self::UNKNOWN)),
            Self::NotProvided => None,
        }
    }
}

impl Display for Deadline {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.to_token() {
            Some(token) => f.write_str(&token),
            None => f.write_str("null"),
        }
    }
}

impl Serialize for Deadline {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.to_token() {
            Some(token) => serializer.serialize_str(&token),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Deadline {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<String>::deserialize(deserializer)?;
        match value.as_deref() {
            None => Ok(Self::NotProvided),
            Some(Self::ROLLING) => Ok(Self::Rolling),
            Some(Self::UNKNOWN) => Ok(Self::Unknown),
            Some(other) => Date::parse(other, ISO_DATE)
                .map(Self::Date)
                .map_err(|_| {
                    D::Error::custom(ValidationError::InvalidDeadline {
                        value: other.to_owned(),
                    })
                }),
        }
    }
}

/// A date format accepted from an upstream source, e.g. `[month]/[day]/[year]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFormat {
    description: String,
    item: OwnedFormatItem,
}

impl DateFormat {
    pub fn new(description: impl Into<String>) -> Result<Self, ValidationError> {
        let description = description.into();
        let item = time::format_description::parse_owned::<2>(&description).map_err(|error| {
            ValidationError::InvalidDateFormat {
                format: description.clone(),
                reason: error.to_string(),
            }
        })?;

        Ok(Self { description, item })
    }

    pub fn as_str(&self) -> &str {
        &self.description
    }

    fn parse(&self, raw: &str) -> Option<Date> {
        Date::parse(raw, &self.item).ok()
    }
}

/// Lifecycle status of an opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Forecasted,
    Open,
    Closed,
    Archived,
    Awarded,
    Unknown,
}

impl GrantStatus {
    /// Maps the vocabulary used by upstream portals onto the canonical status set.
    pub fn from_upstream(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "forecasted" | "forecast" => Self::Forecasted,
            "posted" | "open" | "active" | "accepting" => Self::Open,
            "closed" | "expired" => Self::Closed,
            "archived" => Self::Archived,
            "awarded" | "paid" | "granted" => Self::Awarded,
            _ => Self::Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Forecasted => "forecasted",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Archived => "archived",
            Self::Awarded => "awarded",
            Self::Unknown => "unknown",
        }
    }
}

/// Unified funding-opportunity record every source payload is translated into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalGrantRecord {
    pub id: String,
    pub title: String,
    pub funder: Option<String>,
    pub amount_min: Option<f64>,
    pub amount_max: Option<f64>,
    pub deadline: Deadline,
    pub description: Option<String>,
    pub eligibility: Option<String>,
    pub link: Option<String>,
    pub source: SourceId,
    pub source_url: String,
    pub tags: Vec<String>,
    pub discovered_at: UtcDateTime,
    pub status: GrantStatus,
}

impl CanonicalGrantRecord {
    /// Stable record id derived from the source and the upstream identifier.
    pub fn stable_id(source: &SourceId, external_id: &str) -> String {
        format!("{}:{}", source.as_str(), external_id.trim())
    }

    /// Validates field-level invariants of a normalized record.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "id" });
        }
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "title" });
        }
        validate_amount("amount_min", self.amount_min)?;
        validate_amount("amount_max", self.amount_max)?;
        if let (Some(min), Some(max)) = (self.amount_min, self.amount_max) {
            if min > max {
                return Err(ValidationError::InvalidAmountRange);
            }
        }
        Ok(())
    }
}

fn validate_amount(field: &'static str, value: Option<f64>) -> Result<(), ValidationError> {
    let Some(value) = value else {
        return Ok(());
    };
    if !value.is_finite() {
        return Err(ValidationError::NonFiniteValue { field });
    }
    if value < 0.0 {
        return Err(ValidationError::NegativeValue { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Month;

    fn mdy() -> Vec<DateFormat> {
        vec![DateFormat::new("[month]/[day]/[year]").expect("valid format")]
    }

    #[test]
    fn interprets_iso_and_upstream_formats() {
        let expected = Date::from_calendar_date(2025, Month::March, 4).expect("valid date");

        assert_eq!(
            Deadline::interpret(Some("2025-03-04"), &[]),
            Deadline::Date(expected)
        );
        assert_eq!(
            Deadline::interpret(Some("03/04/2025"), &mdy()),
            Deadline::Date(expected)
        );
    }

    #[test]
    fn distinguishes_missing_from_unparseable_deadlines() {
        assert_eq!(Deadline::interpret(None, &mdy()), Deadline::NotProvided);
        assert_eq!(Deadline::interpret(Some("  "), &mdy()), Deadline::NotProvided);
        assert_eq!(
            Deadline::interpret(Some("sometime in spring"), &mdy()),
            Deadline::Unknown
        );
        assert_eq!(
            Deadline::interpret(Some("Rolling basis"), &mdy()),
            Deadline::Rolling
        );
    }

    #[test]
    fn deadline_key_is_always_serialized() {
        let values = [
            Deadline::NotProvided,
            Deadline::Unknown,
            Deadline::Rolling,
            Deadline::Date(Date::from_calendar_date(2025, Month::June, 1).expect("valid")),
        ];
        let encoded = values
            .iter()
            .map(|value| serde_json::to_string(value).expect("serializes"))
            .collect::<Vec<_>>();

        assert_eq!(encoded, vec!["null", "\"unknown\"", "\"Rolling\"", "\"2025-06-01\""]);

        let decoded: Deadline = serde_json::from_str("null").expect("deserializes");
        assert_eq!(decoded, Deadline::NotProvided);
        let decoded: Deadline = serde_json::from_str("\"unknown\"").expect("deserializes");
        assert_eq!(decoded, Deadline::Unknown);
    }

    #[test]
    fn maps_upstream_status_vocabulary() {
        assert_eq!(GrantStatus::from_upstream("posted"), GrantStatus::Open);
        assert_eq!(GrantStatus::from_upstream("Forecasted"), GrantStatus::Forecasted);
        assert_eq!(GrantStatus::from_upstream("???"), GrantStatus::Unknown);
    }

    #[test]
    fn rejects_inverted_amount_range() {
        let record = CanonicalGrantRecord {
            id: String::from("grants_gov:1"),
            title: String::from("Rural Health"),
            funder: None,
            amount_min: Some(10.0),
            amount_max: Some(5.0),
            deadline: Deadline::NotProvided,
            description: None,
            eligibility: None,
            link: None,
            source: SourceId::parse("grants_gov").expect("valid"),
            source_url: String::from("https://www.grants.gov"),
            tags: Vec::new(),
            discovered_at: UtcDateTime::now(),
            status: GrantStatus::Open,
        };

        assert_eq!(record.validate(), Err(ValidationError::InvalidAmountRange));
    }
}
