//! Domain model and service layer for Machinist machine records.
//!
//! Boundaries (the HTTP service and the CLI) validate request shapes with
//! [`CreateMachineRequest::validate_for_create`] and
//! [`MachineDto::validate_for_update`] before handing them to
//! [`MachineService`], which owns the soft-delete and timestamp contract on top
//! of any [`MachineStore`].

mod service;
mod store;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use validator::{Validate, ValidationError, ValidationErrors};

pub use service::MachineService;
pub use store::{InMemoryMachineStore, MachineStore};

pub const NAME_MIN_CHARS: u64 = 4;
pub const NAME_MAX_CHARS: u64 = 100;
pub const DESCRIPTION_MAX_CHARS: u64 = 1000;
pub const YEAR_OF_PRODUCTION_MIN: i32 = 1950;
pub const YEAR_OF_PRODUCTION_MAX: i32 = 2020;

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("Machine with id [{0}] does not exist!")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("store failure: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl From<anyhow::Error> for MachineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Store(err.into())
    }
}

/// A stored machine record, including soft-deleted ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub year_of_production: Option<i32>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub deleted: bool,
}

impl Machine {
    #[must_use]
    pub fn to_dto(&self) -> MachineDto {
        MachineDto {
            id: Some(self.id.clone()),
            name: Some(self.name.clone()),
            description: self.description.clone(),
            year_of_production: self.year_of_production,
            created_at: Some(self.created_at),
            updated_at: Some(self.updated_at),
        }
    }
}

/// A machine that has not been assigned an id yet. Stores always insert it as
/// not deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMachine {
    pub name: String,
    pub description: Option<String>,
    pub year_of_production: Option<i32>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl NewMachine {
    #[must_use]
    pub fn into_machine(self, id: String) -> Machine {
        Machine {
            id,
            name: self.name,
            description: self.description,
            year_of_production: self.year_of_production,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted: false,
        }
    }
}

/// Externally visible machine shape. It is also the update request body, so
/// every field is nullable on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MachineDto {
    #[validate(required)]
    pub id: Option<String>,
    #[validate(required, length(min = NAME_MIN_CHARS, max = NAME_MAX_CHARS))]
    pub name: Option<String>,
    #[validate(length(max = DESCRIPTION_MAX_CHARS))]
    pub description: Option<String>,
    #[validate(range(min = YEAR_OF_PRODUCTION_MIN, max = YEAR_OF_PRODUCTION_MAX))]
    pub year_of_production: Option<i32>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl MachineDto {
    /// Checks the field constraints an update body must satisfy.
    ///
    /// # Errors
    /// Returns [`MachineError::Validation`] listing every violated constraint.
    pub fn validate_for_update(&self) -> Result<(), MachineError> {
        Validate::validate(self).map_err(|errors| MachineError::Validation(render_violations(&errors)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateMachineRequest {
    #[validate(required, length(min = NAME_MIN_CHARS, max = NAME_MAX_CHARS))]
    pub name: Option<String>,
    #[validate(length(max = DESCRIPTION_MAX_CHARS))]
    pub description: Option<String>,
    #[validate(range(min = YEAR_OF_PRODUCTION_MIN, max = YEAR_OF_PRODUCTION_MAX))]
    pub year_of_production: Option<i32>,
}

impl CreateMachineRequest {
    /// Checks the field constraints a create body must satisfy.
    ///
    /// # Errors
    /// Returns [`MachineError::Validation`] listing every violated constraint.
    pub fn validate_for_create(&self) -> Result<(), MachineError> {
        Validate::validate(self).map_err(|errors| MachineError::Validation(render_violations(&errors)))
    }
}

/// Renders validator output as sorted `"<wireField>: <message>"` lines joined
/// with `"; "`.
fn render_violations(errors: &ValidationErrors) -> String {
    let mut lines = Vec::new();
    for (field, field_errors) in errors.field_errors() {
        let wire = wire_field_name(field.as_ref());
        for error in field_errors {
            lines.push(format!("{wire}: {}", violation_message(error)));
        }
    }
    lines.sort();
    lines.join("; ")
}

fn wire_field_name(field: &str) -> &str {
    match field {
        "year_of_production" => "yearOfProduction",
        "created_at" => "createdAt",
        "updated_at" => "updatedAt",
        other => other,
    }
}

fn violation_message(error: &ValidationError) -> String {
    let param = |name: &str| error.params.get(name);
    match error.code.as_ref() {
        "required" => "must not be null".to_string(),
        "length" => format!(
            "size must be between {} and {}",
            param("min").map_or_else(|| "0".to_string(), render_param),
            param("max").map_or_else(|| "2147483647".to_string(), render_param),
        ),
        "range" => {
            let value = param("value").and_then(serde_json::Value::as_f64);
            let max = param("max");
            match (value, max.and_then(serde_json::Value::as_f64)) {
                (Some(value), Some(limit)) if value > limit => {
                    format!("must be less than or equal to {}", max.map_or_else(String::new, render_param))
                }
                _ => format!(
                    "must be greater than or equal to {}",
                    param("min").map_or_else(String::new, render_param)
                ),
            }
        }
        other => error.message.as_ref().map_or_else(|| format!("violates {other}"), ToString::to_string),
    }
}

fn render_param(value: &serde_json::Value) -> String {
    match value.as_i64() {
        Some(number) => number.to_string(),
        None => value.to_string(),
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`MachineError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, MachineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| MachineError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(MachineError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
