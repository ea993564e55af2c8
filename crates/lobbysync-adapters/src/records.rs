//! Validation of flat snapshot rows into typed records.
//!
//! Register rows arrive one per (representative, association) pair and are
//! regrouped under their representative by `identification_code`; turnover
//! rows additionally name the financial period by `start_date`. Meeting rows
//! carry one participant each, and consecutive rows with identical meeting
//! fields form one meeting.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use lobbysync_core::{
    is_valid_registration_code, normalize_text, resolve_registration_code, Contact, Counterparty,
    FinancialFigures, FinancialPeriodRecord, MeetingDetails, MeetingRecord, OrganisationRecord,
    PersonRecord, PersonRoleKind, RepresentativeProfile, RepresentativeRecord, TurnoverRecord,
};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::{AliasMap, RawRow, RowKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("{kind} row is missing required field `{field}`")]
    MissingField { kind: RowKind, field: &'static str },
    #[error("{kind} row has an invalid date in `{field}`: {value:?}")]
    InvalidDate {
        kind: RowKind,
        field: &'static str,
        value: String,
    },
    #[error("{kind} row has an invalid number in `{field}`: {value:?}")]
    InvalidNumber {
        kind: RowKind,
        field: &'static str,
        value: String,
    },
    #[error("{kind} row has an invalid registration code {code:?}")]
    InvalidRegistrationCode { kind: RowKind, code: String },
    #[error("unknown person role {0:?}")]
    InvalidRole(String),
    #[error("{kind} row references {parent} which is not in the snapshot")]
    OrphanRow { kind: RowKind, parent: String },
    #[error("{kind} row is not valid in a {expected} snapshot")]
    UnexpectedKind { kind: RowKind, expected: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    /// Position of the row in the concatenated snapshot.
    pub index: usize,
    pub kind: RowKind,
    pub error: RecordError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBatch<T> {
    pub records: Vec<T>,
    pub rejected: Vec<RejectedRow>,
}

impl<T> Default for ParsedBatch<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

impl<T> ParsedBatch<T> {
    fn reject(&mut self, index: usize, row: &RawRow, error: RecordError) {
        self.rejected.push(RejectedRow {
            index,
            kind: row.kind,
            error,
        });
    }
}

/// Typed view over one row's fields.
struct Fields<'a> {
    kind: RowKind,
    fields: &'a BTreeMap<String, JsonValue>,
}

impl<'a> Fields<'a> {
    fn new(row: &'a RawRow) -> Self {
        Self {
            kind: row.kind,
            fields: &row.fields,
        }
    }

    fn raw(&self, field: &str) -> Option<String> {
        match self.fields.get(field)? {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            other => Some(other.to_string()),
        }
    }

    fn text(&self, field: &str) -> Option<String> {
        self.raw(field)
            .map(|value| normalize_text(&value))
            .filter(|value| !value.is_empty())
    }

    fn required(&self, field: &'static str) -> Result<String, RecordError> {
        self.text(field).ok_or(RecordError::MissingField {
            kind: self.kind,
            field,
        })
    }

    fn integer(&self, field: &'static str) -> Result<Option<i64>, RecordError> {
        let invalid = |value: String| RecordError::InvalidNumber {
            kind: self.kind,
            field,
            value,
        };
        match self.fields.get(field) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(JsonValue::Number(n)) => match (n.as_i64(), n.as_f64()) {
                (Some(v), _) => Ok(Some(v)),
                (None, Some(v)) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => Ok(Some(v as i64)),
                _ => Err(invalid(n.to_string())),
            },
            Some(JsonValue::String(s)) => {
                let cleaned = s
                    .chars()
                    .filter(|c| !c.is_whitespace() && *c != ',')
                    .collect::<String>();
                if cleaned.is_empty() {
                    return Ok(None);
                }
                cleaned
                    .parse::<i64>()
                    .or_else(|_| match cleaned.parse::<f64>() {
                        Ok(v) if v.fract() == 0.0 => Ok(v as i64),
                        _ => Err(()),
                    })
                    .map(Some)
                    .map_err(|_| invalid(s.clone()))
            }
            Some(other) => Err(invalid(other.to_string())),
        }
    }

    fn decimal(&self, field: &'static str) -> Result<Option<f64>, RecordError> {
        match self.fields.get(field) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(JsonValue::Number(n)) => Ok(n.as_f64()),
            Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(None),
            Some(JsonValue::String(s)) => s.trim().parse::<f64>().map(Some).map_err(|_| {
                RecordError::InvalidNumber {
                    kind: self.kind,
                    field,
                    value: s.clone(),
                }
            }),
            Some(other) => Err(RecordError::InvalidNumber {
                kind: self.kind,
                field,
                value: other.to_string(),
            }),
        }
    }

    fn date(&self, field: &'static str) -> Result<Option<NaiveDate>, RecordError> {
        self.dated(field).map(|parsed| parsed.map(|(date, _)| date))
    }

    fn required_date(&self, field: &'static str) -> Result<NaiveDate, RecordError> {
        self.date(field)?.ok_or(RecordError::MissingField {
            kind: self.kind,
            field,
        })
    }

    /// Date plus the cancellation marker some listings append to it.
    fn dated(&self, field: &'static str) -> Result<Option<(NaiveDate, bool)>, RecordError> {
        let Some(value) = self.text(field) else {
            return Ok(None);
        };
        parse_date(&value)
            .map(Some)
            .ok_or_else(|| RecordError::InvalidDate {
                kind: self.kind,
                field,
                value,
            })
    }

    fn flag(&self, field: &str) -> bool {
        match self.fields.get(field) {
            Some(JsonValue::Bool(b)) => *b,
            Some(JsonValue::String(s)) => {
                matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1")
            }
            _ => false,
        }
    }

    fn registration_code(&self) -> Result<String, RecordError> {
        let code = self.required("identification_code")?;
        if is_valid_registration_code(&code) {
            Ok(code)
        } else {
            Err(RecordError::InvalidRegistrationCode {
                kind: self.kind,
                code,
            })
        }
    }
}

/// Accepts `YYYY-MM-DD`, `DD/MM/YYYY` and ISO timestamps with optional
/// fractional seconds and offset. A trailing `Cancelled` marks the date as
/// belonging to a cancelled meeting.
pub fn parse_date(input: &str) -> Option<(NaiveDate, bool)> {
    let trimmed = input.trim();
    let (value, cancelled) = match trimmed
        .to_ascii_lowercase()
        .strip_suffix("cancelled")
        .map(str::len)
    {
        Some(len) => (trimmed[..len].trim(), true),
        None => (trimmed, false),
    };

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some((date, cancelled));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%d/%m/%Y") {
        return Some((date, cancelled));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some((ts.date_naive(), cancelled));
    }
    let local = value.split('+').next().unwrap_or(value);
    NaiveDateTime::parse_from_str(local, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|ts| (ts.date(), cancelled))
}

fn parse_profile(fields: &Fields<'_>) -> Result<RepresentativeProfile, RecordError> {
    let head_office = Contact {
        street: fields.text("contact_street"),
        town: fields.text("contact_town"),
        post_code: fields.text("contact_post_code"),
        country: fields.text("contact_country"),
        phone: fields.text("contact_phone"),
    };
    Ok(RepresentativeProfile {
        name: fields.required("name")?,
        acronym: fields.text("acronym"),
        legal_status: fields.text("legal_status"),
        registration_status: fields.text("status"),
        registration_date: fields.date("registration_date")?,
        last_update_date: fields.date("last_update_date")?,
        web_site_url: fields.text("web_site_url"),
        main_category: fields.text("main_category"),
        sub_category: fields.text("sub_category"),
        goals: fields.text("goals"),
        networking: fields.text("networking"),
        code_of_conduct: fields.text("code_of_conduct"),
        members: fields.integer("members")?,
        members_fte: fields.decimal("members_fte")?,
        number_of_natural_persons: fields.integer("number_of_natural_persons")?,
        contact_country: fields.text("contact_country"),
        head_office: (!head_office.is_empty()).then_some(head_office),
    })
}

fn parse_person(fields: &Fields<'_>) -> Result<PersonRecord, RecordError> {
    let role = fields.required("role")?;
    let role = PersonRoleKind::parse(&role).ok_or(RecordError::InvalidRole(role))?;
    let person = PersonRecord {
        role,
        title: fields.text("title"),
        first_name: fields.text("first_name"),
        last_name: fields.text("last_name"),
        position: fields.text("position"),
        start_date: fields.date("start_date")?,
        end_date: fields.date("end_date")?,
    };
    if person.full_name().is_empty() {
        return Err(RecordError::MissingField {
            kind: fields.kind,
            field: "last_name",
        });
    }
    Ok(person)
}

fn parse_financial_period(fields: &Fields<'_>) -> Result<FinancialPeriodRecord, RecordError> {
    Ok(FinancialPeriodRecord {
        start_date: fields.required_date("start_date")?,
        end_date: fields.required_date("end_date")?,
        figures: FinancialFigures {
            financial_type: fields.text("type"),
            turnover_min: fields.integer("turnover_min")?,
            turnover_max: fields.integer("turnover_max")?,
            turnover_absolute: fields.integer("turnover_absolute")?,
            cost_min: fields.integer("cost_min")?,
            cost_max: fields.integer("cost_max")?,
            cost_absolute: fields.integer("cost_absolute")?,
            direct_rep_costs_min: fields.integer("direct_rep_costs_min")?,
            direct_rep_costs_max: fields.integer("direct_rep_costs_max")?,
            total_budget: fields.integer("total_budget")?,
            public_financing_total: fields.integer("public_financing_total")?,
            public_financing_national: fields.integer("public_financing_national")?,
            public_financing_infranational: fields.integer("public_financing_infranational")?,
            eur_sources_grants: fields.integer("eur_sources_grants")?,
            eur_sources_procurement: fields.integer("eur_sources_procurement")?,
            other_sources_donation: fields.integer("other_sources_donation")?,
            other_sources_contributions: fields.integer("other_sources_contributions")?,
            other_sources_total: fields.integer("other_sources_total")?,
        },
        turnovers: Vec::new(),
    })
}

/// Regroup register rows under their representatives. Rows that fail
/// validation or reference a representative absent from the snapshot are
/// rejected; everything else is kept.
pub fn parse_register_rows(rows: &[RawRow]) -> ParsedBatch<RepresentativeRecord> {
    let mut batch = ParsedBatch::default();
    let mut by_code: HashMap<String, usize> = HashMap::new();

    for (index, row) in rows.iter().enumerate() {
        match row.kind {
            RowKind::Representative => {
                let fields = Fields::new(row);
                let parsed = fields
                    .registration_code()
                    .and_then(|code| Ok(RepresentativeRecord::new(code, parse_profile(&fields)?)));
                match parsed {
                    Ok(record) => {
                        by_code.insert(record.identification_code.clone(), batch.records.len());
                        batch.records.push(record);
                    }
                    Err(error) => batch.reject(index, row, error),
                }
            }
            RowKind::Meeting => batch.reject(
                index,
                row,
                RecordError::UnexpectedKind {
                    kind: row.kind,
                    expected: "register",
                },
            ),
            _ => {}
        }
    }

    // Turnovers need their financial period, so they attach after every
    // other child.
    let child_passes: [&[RowKind]; 2] = [
        &[
            RowKind::Person,
            RowKind::FinancialData,
            RowKind::Organisation,
            RowKind::CountryOfMember,
            RowKind::Interest,
            RowKind::ActionField,
        ],
        &[RowKind::Turnover],
    ];
    for pass in child_passes {
        for (index, row) in rows.iter().enumerate() {
            if !pass.contains(&row.kind) {
                continue;
            }
            if let Err(error) = attach_child(&mut batch.records, &by_code, row) {
                batch.reject(index, row, error);
            }
        }
    }

    batch
}

fn attach_child(
    records: &mut [RepresentativeRecord],
    by_code: &HashMap<String, usize>,
    row: &RawRow,
) -> Result<(), RecordError> {
    let fields = Fields::new(row);
    let code = fields.required("identification_code")?;
    let record = by_code
        .get(&code)
        .and_then(|idx| records.get_mut(*idx))
        .ok_or_else(|| RecordError::OrphanRow {
            kind: row.kind,
            parent: code.clone(),
        })?;

    match row.kind {
        RowKind::Person => record.persons.push(parse_person(&fields)?),
        RowKind::FinancialData => record.financial_periods.push(parse_financial_period(&fields)?),
        RowKind::Turnover => {
            let start = fields.required_date("start_date")?;
            let turnover = TurnoverRecord {
                customer: fields.required("name")?,
                min: fields.integer("min")?,
                max: fields.integer("max")?,
            };
            let period = record
                .financial_periods
                .iter_mut()
                .find(|period| period.start_date == start)
                .ok_or_else(|| RecordError::OrphanRow {
                    kind: row.kind,
                    parent: format!("{code}@{start}"),
                })?;
            period.turnovers.push(turnover);
        }
        RowKind::Organisation => record.organisations.push(OrganisationRecord {
            name: fields.required("name")?,
            number_of_members: fields.integer("number_of_members")?,
        }),
        RowKind::CountryOfMember => {
            let country = fields.required("country")?;
            record.countries.push(country.to_ascii_uppercase());
        }
        RowKind::Interest => record.interests.push(fields.required("name")?),
        RowKind::ActionField => record.action_fields.push(fields.required("action")?),
        RowKind::Representative | RowKind::Meeting => {}
    }
    Ok(())
}

fn parse_meeting_details(fields: &Fields<'_>) -> Result<MeetingDetails, RecordError> {
    let (date, cancelled_marker) = fields.dated("date")?.ok_or(RecordError::MissingField {
        kind: fields.kind,
        field: "date",
    })?;
    Ok(MeetingDetails {
        host: fields.required("host")?,
        organisation: fields.required("organisation")?,
        date,
        location: fields.text("location").unwrap_or_default(),
        subject: fields.text("subject").unwrap_or_default(),
        cancelled: cancelled_marker || fields.flag("cancelled"),
    })
}

/// Group meeting rows into meetings. Observed counterparty names pass
/// through the alias map before their registration codes are resolved.
pub fn parse_meeting_rows(rows: &[RawRow], aliases: &AliasMap) -> ParsedBatch<MeetingRecord> {
    let mut batch: ParsedBatch<MeetingRecord> = ParsedBatch::default();

    for (index, row) in rows.iter().enumerate() {
        if row.kind != RowKind::Meeting {
            batch.reject(
                index,
                row,
                RecordError::UnexpectedKind {
                    kind: row.kind,
                    expected: "meetings",
                },
            );
            continue;
        }
        let fields = Fields::new(row);
        let details = match parse_meeting_details(&fields) {
            Ok(details) => details,
            Err(error) => {
                batch.reject(index, row, error);
                continue;
            }
        };
        let participant = fields.text("entity_name").map(|name| {
            let code = resolve_registration_code(fields.text("entity_code").as_deref());
            aliases.canonicalize(Counterparty { name, code })
        });

        let continues_previous = batch
            .records
            .last()
            .is_some_and(|previous| previous.details == details);
        if !continues_previous {
            batch.records.push(MeetingRecord {
                details,
                participants: Vec::new(),
            });
        }
        if let (Some(participant), Some(meeting)) = (participant, batch.records.last_mut()) {
            meeting.participants.push(participant);
        }
    }

    batch
}
