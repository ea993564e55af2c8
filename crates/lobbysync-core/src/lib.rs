//! Core domain model, typed snapshot records and natural keys for lobbysync.

pub mod natural_key;

use std::fmt;

use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

pub use natural_key::{
    fold_key, is_valid_registration_code, meeting_key, normalize_text, resolve_registration_code,
    unescape_entities, ContentDigest, RegistrationCode, UNREGISTERED,
};

pub const CRATE_NAME: &str = "lobbysync-core";

/// Every persisted table. The string form doubles as the table name in the
/// audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Representative,
    Meeting,
    PersonRole,
    FinancialPeriod,
    Turnover,
    OrganisationMembership,
    CountryMembership,
    Interest,
    ActionField,
    MeetingParticipant,
    UnmatchedParty,
}

impl EntityKind {
    pub const ALL: [EntityKind; 11] = [
        Self::Representative,
        Self::Meeting,
        Self::PersonRole,
        Self::FinancialPeriod,
        Self::Turnover,
        Self::OrganisationMembership,
        Self::CountryMembership,
        Self::Interest,
        Self::ActionField,
        Self::MeetingParticipant,
        Self::UnmatchedParty,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Representative => "representative",
            Self::Meeting => "meeting",
            Self::PersonRole => "person_role",
            Self::FinancialPeriod => "financial_period",
            Self::Turnover => "turnover",
            Self::OrganisationMembership => "organisation_membership",
            Self::CountryMembership => "country_membership",
            Self::Interest => "interest",
            Self::ActionField => "action_field",
            Self::MeetingParticipant => "meeting_participant",
            Self::UnmatchedParty => "unmatched_party",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == input)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presence in the most recently completed synchronization run.
/// `Resolved` only occurs on unmatched-party ledger rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Active,
    Inactive,
    Resolved,
}

/// Business identity of a record, independent of storage ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn registration(code: &str) -> Self {
        Self(code.to_string())
    }

    /// Child keys embed the parent key, so a child can never be matched under
    /// a different parent.
    pub fn child(parent: &NaturalKey, kind: EntityKind, discriminator: &str) -> Self {
        Self(format!("{}#{}:{}", parent.0, kind.as_str(), discriminator))
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value payload of a persisted row. Storage wraps it with ids and timestamps.
pub trait EntityData:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: EntityKind;

    fn natural_key(&self) -> NaturalKey;

    /// Natural key of the owning entity for child records.
    fn parent_key(&self) -> Option<&NaturalKey> {
        None
    }

    fn status(&self) -> Status;

    fn set_status(&mut self, status: Status);
}

macro_rules! status_accessors {
    () => {
        fn status(&self) -> Status {
            self.status
        }

        fn set_status(&mut self, status: Status) {
            self.status = status;
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Contact {
    pub street: Option<String>,
    pub town: Option<String>,
    pub post_code: Option<String>,
    pub country: Option<String>,
    pub phone: Option<String>,
}

impl Contact {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Scalar registration data of a representative.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RepresentativeProfile {
    pub name: String,
    pub acronym: Option<String>,
    pub legal_status: Option<String>,
    pub registration_status: Option<String>,
    pub registration_date: Option<NaiveDate>,
    pub last_update_date: Option<NaiveDate>,
    pub web_site_url: Option<String>,
    pub main_category: Option<String>,
    pub sub_category: Option<String>,
    pub goals: Option<String>,
    pub networking: Option<String>,
    pub code_of_conduct: Option<String>,
    pub members: Option<i64>,
    pub members_fte: Option<f64>,
    pub number_of_natural_persons: Option<i64>,
    pub contact_country: Option<String>,
    pub head_office: Option<Contact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representative {
    pub identification_code: String,
    #[serde(flatten)]
    pub profile: RepresentativeProfile,
    pub status: Status,
}

impl EntityData for Representative {
    const KIND: EntityKind = EntityKind::Representative;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::registration(&self.identification_code)
    }

    status_accessors!();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingDetails {
    /// Officeholder who held the meeting.
    pub host: String,
    /// Portfolio or directorate-general owning the meeting list.
    pub organisation: String,
    pub date: NaiveDate,
    pub location: String,
    pub subject: String,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meeting {
    pub meeting_key: NaturalKey,
    #[serde(flatten)]
    pub details: MeetingDetails,
    pub status: Status,
}

impl EntityData for Meeting {
    const KIND: EntityKind = EntityKind::Meeting;

    fn natural_key(&self) -> NaturalKey {
        self.meeting_key.clone()
    }

    status_accessors!();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonRoleKind {
    Head,
    Legal,
    Accredited,
}

impl PersonRoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Legal => "legal",
            Self::Accredited => "accredited",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "head" => Some(Self::Head),
            "legal" => Some(Self::Legal),
            "accredited" => Some(Self::Accredited),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub role: PersonRoleKind,
    pub title: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub position: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl PersonRecord {
    pub fn full_name(&self) -> String {
        [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Head and legal roles are unique per representative; accredited persons
    /// are told apart by name.
    pub fn discriminator(&self) -> String {
        match self.role {
            PersonRoleKind::Accredited => format!("accredited/{}", fold_key(&self.full_name())),
            role => role.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRole {
    pub representative_key: NaturalKey,
    #[serde(flatten)]
    pub person: PersonRecord,
    pub status: Status,
}

impl EntityData for PersonRole {
    const KIND: EntityKind = EntityKind::PersonRole;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::child(&self.representative_key, Self::KIND, &self.person.discriminator())
    }

    fn parent_key(&self) -> Option<&NaturalKey> {
        Some(&self.representative_key)
    }

    status_accessors!();
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FinancialFigures {
    pub financial_type: Option<String>,
    pub turnover_min: Option<i64>,
    pub turnover_max: Option<i64>,
    pub turnover_absolute: Option<i64>,
    pub cost_min: Option<i64>,
    pub cost_max: Option<i64>,
    pub cost_absolute: Option<i64>,
    pub direct_rep_costs_min: Option<i64>,
    pub direct_rep_costs_max: Option<i64>,
    pub total_budget: Option<i64>,
    pub public_financing_total: Option<i64>,
    pub public_financing_national: Option<i64>,
    pub public_financing_infranational: Option<i64>,
    pub eur_sources_grants: Option<i64>,
    pub eur_sources_procurement: Option<i64>,
    pub other_sources_donation: Option<i64>,
    pub other_sources_contributions: Option<i64>,
    pub other_sources_total: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialPeriod {
    pub representative_key: NaturalKey,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(flatten)]
    pub figures: FinancialFigures,
    pub status: Status,
}

pub fn period_discriminator(start: NaiveDate, end: NaiveDate) -> String {
    format!("{}/{}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d"))
}

impl EntityData for FinancialPeriod {
    const KIND: EntityKind = EntityKind::FinancialPeriod;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::child(
            &self.representative_key,
            Self::KIND,
            &period_discriminator(self.start_date, self.end_date),
        )
    }

    fn parent_key(&self) -> Option<&NaturalKey> {
        Some(&self.representative_key)
    }

    status_accessors!();
}

/// Turnover attributed to one customer within a financial period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turnover {
    pub period_key: NaturalKey,
    pub customer: String,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub status: Status,
}

impl EntityData for Turnover {
    const KIND: EntityKind = EntityKind::Turnover;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::child(&self.period_key, Self::KIND, &fold_key(&self.customer))
    }

    fn parent_key(&self) -> Option<&NaturalKey> {
        Some(&self.period_key)
    }

    status_accessors!();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganisationMembership {
    pub representative_key: NaturalKey,
    pub organisation: String,
    pub number_of_members: Option<i64>,
    pub status: Status,
}

impl EntityData for OrganisationMembership {
    const KIND: EntityKind = EntityKind::OrganisationMembership;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::child(&self.representative_key, Self::KIND, &fold_key(&self.organisation))
    }

    fn parent_key(&self) -> Option<&NaturalKey> {
        Some(&self.representative_key)
    }

    status_accessors!();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryMembership {
    pub representative_key: NaturalKey,
    pub country_code: String,
    pub status: Status,
}

impl EntityData for CountryMembership {
    const KIND: EntityKind = EntityKind::CountryMembership;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::child(
            &self.representative_key,
            Self::KIND,
            &self.country_code.to_ascii_uppercase(),
        )
    }

    fn parent_key(&self) -> Option<&NaturalKey> {
        Some(&self.representative_key)
    }

    status_accessors!();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interest {
    pub representative_key: NaturalKey,
    pub interest: String,
    pub status: Status,
}

impl EntityData for Interest {
    const KIND: EntityKind = EntityKind::Interest;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::child(&self.representative_key, Self::KIND, &fold_key(&self.interest))
    }

    fn parent_key(&self) -> Option<&NaturalKey> {
        Some(&self.representative_key)
    }

    status_accessors!();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionField {
    pub representative_key: NaturalKey,
    pub action: String,
    pub status: Status,
}

impl EntityData for ActionField {
    const KIND: EntityKind = EntityKind::ActionField;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::child(&self.representative_key, Self::KIND, &fold_key(&self.action))
    }

    fn parent_key(&self) -> Option<&NaturalKey> {
        Some(&self.representative_key)
    }

    status_accessors!();
}

/// Link between a meeting and a registered representative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingParticipant {
    pub meeting_key: NaturalKey,
    pub identification_code: String,
    pub representative_id: Uuid,
    pub status: Status,
}

impl EntityData for MeetingParticipant {
    const KIND: EntityKind = EntityKind::MeetingParticipant;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::child(&self.meeting_key, Self::KIND, &self.identification_code)
    }

    fn parent_key(&self) -> Option<&NaturalKey> {
        Some(&self.meeting_key)
    }

    status_accessors!();
}

/// Counterparty seen in a snapshot that did not resolve to a live entity.
/// Rows are keyed by the owning entity's storage id and the claimed key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmatchedParty {
    pub owning_kind: EntityKind,
    pub owning_id: Uuid,
    pub claimed_key: String,
    /// Distinct observed spellings, sorted and joined with `"; "`.
    pub display_name: String,
    pub status: Status,
    pub resolved_entity_id: Option<Uuid>,
}

pub const DISPLAY_NAME_SEPARATOR: &str = "; ";

impl UnmatchedParty {
    pub fn ledger_key(owning_id: Uuid, claimed_key: &str) -> NaturalKey {
        NaturalKey::child(
            &NaturalKey::new(owning_id.to_string()),
            EntityKind::UnmatchedParty,
            claimed_key,
        )
    }

    pub fn observed_names(&self) -> Vec<&str> {
        self.display_name
            .split(DISPLAY_NAME_SEPARATOR)
            .filter(|name| !name.is_empty())
            .collect()
    }
}

impl EntityData for UnmatchedParty {
    const KIND: EntityKind = EntityKind::UnmatchedParty;

    fn natural_key(&self) -> NaturalKey {
        Self::ledger_key(self.owning_id, &self.claimed_key)
    }

    status_accessors!();
}

/// Validated representative snapshot entry with its flattened sub-lists
/// regrouped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepresentativeRecord {
    pub identification_code: String,
    pub profile: RepresentativeProfile,
    pub persons: Vec<PersonRecord>,
    pub financial_periods: Vec<FinancialPeriodRecord>,
    pub organisations: Vec<OrganisationRecord>,
    pub countries: Vec<String>,
    pub interests: Vec<String>,
    pub action_fields: Vec<String>,
}

impl RepresentativeRecord {
    pub fn new(identification_code: impl Into<String>, profile: RepresentativeProfile) -> Self {
        Self {
            identification_code: identification_code.into(),
            profile,
            persons: Vec::new(),
            financial_periods: Vec::new(),
            organisations: Vec::new(),
            countries: Vec::new(),
            interests: Vec::new(),
            action_fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialPeriodRecord {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub figures: FinancialFigures,
    pub turnovers: Vec<TurnoverRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnoverRecord {
    pub customer: String,
    pub min: Option<i64>,
    pub max: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganisationRecord {
    pub name: String,
    pub number_of_members: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterparty {
    pub name: String,
    pub code: RegistrationCode,
}

/// Validated meeting with the participant rows regrouped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingRecord {
    pub details: MeetingDetails,
    pub participants: Vec<Counterparty>,
}

impl MeetingRecord {
    pub fn natural_key(&self) -> NaturalKey {
        meeting_key(&self.details, &self.participants)
    }
}
