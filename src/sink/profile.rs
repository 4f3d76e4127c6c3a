//! The profile form model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::SinkError;
use crate::event::Payload;

/// Separator interests are joined with in storage.
pub const INTEREST_SEPARATOR: &str = ", ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Other => "other",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gender {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "male" => Ok(Gender::Male),
            "female" => Ok(Gender::Female),
            "other" => Ok(Gender::Other),
            other => Err(SinkError::Validation(format!("unknown gender '{}'", other))),
        }
    }
}

/// A user's dating profile as collected by the form.
///
/// Built from an event payload; keys the model does not know are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub name: String,
    pub age: i32,
    pub gender: Gender,
    pub city: String,
    #[serde(default, deserialize_with = "interests")]
    pub interests: Vec<String>,
    #[serde(default)]
    pub photo: Option<String>,
    #[serde(default)]
    pub preferred_gender: Option<Gender>,
    #[serde(default)]
    pub preferred_age_min: Option<i32>,
    #[serde(default)]
    pub preferred_age_max: Option<i32>,
    #[serde(default)]
    pub preferred_city: Option<String>,
}

/// Interests arrive as a list from the form, or already joined.
fn interests<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Interests {
        List(Vec<String>),
        Joined(String),
        None,
    }

    Ok(match Interests::deserialize(deserializer)? {
        Interests::List(list) => list,
        Interests::Joined(joined) => split_interests(&joined),
        Interests::None => Vec::new(),
    })
}

/// Split a stored interests column back into a list.
pub fn split_interests(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Profile {
    /// Build a profile for `entity_id` from a create payload.
    pub fn from_payload(entity_id: i64, payload: &Payload) -> Result<Self, SinkError> {
        let mut fields: serde_json::Map<String, Value> = payload
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        fields.insert("id".to_string(), Value::from(entity_id));

        Self::from_fields(fields)
    }

    /// A copy of this profile with the payload's fields laid over it.
    pub fn merged(&self, payload: &Payload) -> Result<Self, SinkError> {
        let mut fields = match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) => return Err(SinkError::Storage("profile is not an object".to_string())),
            Err(e) => return Err(SinkError::Storage(e.to_string())),
        };
        for (key, value) in payload {
            if key != "id" {
                fields.insert(key.clone(), value.clone());
            }
        }

        Self::from_fields(fields)
    }

    /// Interests in their stored form.
    pub fn joined_interests(&self) -> String {
        self.interests.join(INTEREST_SEPARATOR)
    }

    fn from_fields(fields: serde_json::Map<String, Value>) -> Result<Self, SinkError> {
        let profile: Profile = serde_json::from_value(Value::Object(fields))
            .map_err(|e| SinkError::Validation(e.to_string()))?;
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<(), SinkError> {
        if self.name.trim().is_empty() {
            return Err(SinkError::Validation("name is empty".to_string()));
        }
        if let (Some(min), Some(max)) = (self.preferred_age_min, self.preferred_age_max) {
            if min > max {
                return Err(SinkError::Validation(format!(
                    "preferred age range {}..{} is empty",
                    min, max
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => panic!("payload must be an object"),
        }
    }

    fn form() -> Payload {
        payload(json!({
            "name": "Anna",
            "age": 27,
            "gender": "female",
            "city": "Kazan",
            "interests": ["chess", "hiking"],
            "photo": "AgACAgIAAxkBAAI",
            "preferred_gender": "male",
            "preferred_age_min": 25,
            "preferred_age_max": 35,
            "preferred_city": "Kazan",
        }))
    }

    #[test]
    fn test_from_payload_full_form() {
        let profile = Profile::from_payload(42, &form()).unwrap();

        assert_eq!(profile.id, 42);
        assert_eq!(profile.gender, Gender::Female);
        assert_eq!(profile.preferred_gender, Some(Gender::Male));
        assert_eq!(profile.joined_interests(), "chess, hiking");
    }

    #[test]
    fn test_unknown_fields_ignored_and_optionals_default() {
        let profile = Profile::from_payload(
            1,
            &payload(json!({
                "name": "Oleg",
                "age": 30,
                "gender": "male",
                "city": "Perm",
                "referrer": "ad-campaign",
            })),
        )
        .unwrap();

        assert!(profile.interests.is_empty());
        assert_eq!(profile.photo, None);
        assert_eq!(profile.preferred_age_min, None);
    }

    #[test]
    fn test_bad_gender_is_validation_error() {
        let mut fields = form();
        fields.insert("gender".to_string(), json!("robot"));

        let result = Profile::from_payload(42, &fields);
        assert!(matches!(result, Err(SinkError::Validation(_))));
    }

    #[test]
    fn test_missing_required_field_is_validation_error() {
        let mut fields = form();
        fields.remove("name");

        assert!(matches!(
            Profile::from_payload(42, &fields),
            Err(SinkError::Validation(_))
        ));
    }

    #[test]
    fn test_inverted_age_range_rejected() {
        let mut fields = form();
        fields.insert("preferred_age_min".to_string(), json!(40));

        assert!(matches!(
            Profile::from_payload(42, &fields),
            Err(SinkError::Validation(_))
        ));
    }

    #[test]
    fn test_merged_overlays_fields_and_keeps_id() {
        let profile = Profile::from_payload(42, &form()).unwrap();

        let updated = profile
            .merged(&payload(json!({ "city": "Samara", "interests": "books, films" })))
            .unwrap();

        assert_eq!(updated.id, 42);
        assert_eq!(updated.city, "Samara");
        assert_eq!(updated.interests, vec!["books", "films"]);
        assert_eq!(updated.name, "Anna");
    }

    #[test]
    fn test_split_interests_trims_and_skips_empty() {
        assert_eq!(split_interests("a, b,,c "), vec!["a", "b", "c"]);
        assert!(split_interests("").is_empty());
    }
}
