//! Revisioned entity store, unit of work and audit trail for lobbysync.
//!
//! Every table keeps soft-deleted rows. A natural key maps to at most one live
//! (non-deleted) row per kind. Writes go through a [`UnitOfWork`], which is a
//! working copy of the whole store committed back in one step.

pub mod fetch;
pub mod state_file;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use lobbysync_core::{
    ActionField, CountryMembership, EntityData, EntityKind, FinancialPeriod, Interest, Meeting,
    MeetingParticipant, NaturalKey, OrganisationMembership, PersonRole, Representative, Status,
    Turnover, UnmatchedParty,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub use fetch::{
    is_transient_status, retry_after, FetchError, FetchedResponse, FetcherConfig, HttpFetcher,
    RetryPolicy,
};
pub use state_file::{SavedState, StateFile};

pub const CRATE_NAME: &str = "lobbysync-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Persisted row: storage identity and revision timestamps around the
/// entity's values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stored<T> {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub data: T,
}

impl<T> Stored<T> {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Timestamp of the latest value-changing write.
    pub fn revised_at(&self) -> DateTime<Utc> {
        self.deleted_at
            .or(self.updated_at)
            .unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// Append-only history entry holding the full post-write row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub action: AuditAction,
    pub snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a live {kind} already exists for natural key {key}")]
    DuplicateNaturalKey { kind: EntityKind, key: NaturalKey },
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: Uuid },
    #[error("{kind} {id} is soft-deleted")]
    Deleted { kind: EntityKind, id: Uuid },
    #[error("{kind} {key} does not belong to parent {expected}")]
    ParentMismatch {
        kind: EntityKind,
        key: NaturalKey,
        expected: NaturalKey,
    },
    #[error("no live {kind} with natural key {key}")]
    MissingParent { kind: EntityKind, key: NaturalKey },
    #[error("unit of work began at generation {started}, store is at {current}")]
    StaleUnitOfWork { started: u64, current: u64 },
    #[error("serializing {kind} snapshot")]
    Snapshot {
        kind: EntityKind,
        #[source]
        source: serde_json::Error,
    },
}

/// All rows of one entity kind plus the natural-key and parent-key indexes.
/// Serialized as a plain list of rows; indexes are rebuilt on load.
#[derive(Debug, Clone)]
pub struct Table<T> {
    rows: BTreeMap<Uuid, Stored<T>>,
    live: HashMap<NaturalKey, Uuid>,
    by_parent: HashMap<NaturalKey, BTreeSet<Uuid>>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            live: HashMap::new(),
            by_parent: HashMap::new(),
        }
    }
}

impl<T: EntityData> Table<T> {
    pub fn from_rows(rows: impl IntoIterator<Item = Stored<T>>) -> Self {
        let mut table = Self::default();
        for row in rows {
            table.insert(row);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&Stored<T>> {
        self.rows.get(&id)
    }

    pub fn find_live(&self, key: &NaturalKey) -> Option<&Stored<T>> {
        self.live.get(key).and_then(|id| self.rows.get(id))
    }

    pub fn rows(&self) -> impl Iterator<Item = &Stored<T>> {
        self.rows.values()
    }

    pub fn live(&self) -> impl Iterator<Item = &Stored<T>> {
        self.rows.values().filter(|row| !row.is_deleted())
    }

    /// Live rows whose parent key is `parent`.
    pub fn children_of(&self, parent: &NaturalKey) -> Vec<&Stored<T>> {
        self.by_parent
            .get(parent)
            .into_iter()
            .flatten()
            .filter_map(|id| self.rows.get(id))
            .filter(|row| !row.is_deleted())
            .collect()
    }

    fn insert(&mut self, row: Stored<T>) {
        if !row.is_deleted() {
            self.live.insert(row.data.natural_key(), row.id);
        }
        if let Some(parent) = row.data.parent_key() {
            self.by_parent
                .entry(parent.clone())
                .or_default()
                .insert(row.id);
        }
        self.rows.insert(row.id, row);
    }

    /// Replace a row's values, keeping both indexes in step.
    fn replace_data(&mut self, id: Uuid, data: T) {
        let Some(row) = self.rows.get_mut(&id) else {
            return;
        };
        let old_key = row.data.natural_key();
        let new_key = data.natural_key();
        if old_key != new_key && !row.is_deleted() {
            if self.live.get(&old_key) == Some(&id) {
                self.live.remove(&old_key);
            }
            self.live.insert(new_key, id);
        }
        let old_parent = row.data.parent_key().cloned();
        let new_parent = data.parent_key().cloned();
        if old_parent != new_parent {
            if let Some(parent) = old_parent {
                if let Some(ids) = self.by_parent.get_mut(&parent) {
                    ids.remove(&id);
                }
            }
            if let Some(parent) = new_parent {
                self.by_parent.entry(parent).or_default().insert(id);
            }
        }
        row.data = data;
    }

    fn mark_deleted(&mut self, id: Uuid, at: DateTime<Utc>) {
        let Some(row) = self.rows.get_mut(&id) else {
            return;
        };
        row.deleted_at = Some(at);
        let key = row.data.natural_key();
        if self.live.get(&key) == Some(&id) {
            self.live.remove(&key);
        }
    }

    /// Batch status flag: no audit record, no `updated_at` bump.
    fn set_inactive(&mut self, id: Uuid) -> bool {
        match self.rows.get_mut(&id) {
            Some(row) if !row.is_deleted() && row.data.status() != Status::Inactive => {
                row.data.set_status(Status::Inactive);
                true
            }
            _ => false,
        }
    }
}

impl<T: EntityData> Serialize for Table<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.rows.values())
    }
}

impl<'de, T: EntityData> Deserialize<'de> for Table<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let rows = Vec::<Stored<T>>::deserialize(deserializer)?;
        Ok(Self::from_rows(rows))
    }
}

/// Every table of the store, one per entity kind, plus the audit log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreState {
    pub representatives: Table<Representative>,
    pub meetings: Table<Meeting>,
    pub person_roles: Table<PersonRole>,
    pub financial_periods: Table<FinancialPeriod>,
    pub turnovers: Table<Turnover>,
    pub organisation_memberships: Table<OrganisationMembership>,
    pub country_memberships: Table<CountryMembership>,
    pub interests: Table<Interest>,
    pub action_fields: Table<ActionField>,
    pub meeting_participants: Table<MeetingParticipant>,
    pub unmatched_parties: Table<UnmatchedParty>,
    pub audit: Vec<AuditRecord>,
}

/// Entity types that have a table in [`StoreState`].
pub trait Persisted: EntityData {
    fn table(state: &StoreState) -> &Table<Self>;
    fn table_mut(state: &mut StoreState) -> &mut Table<Self>;
}

macro_rules! persisted {
    ($($ty:ty => $field:ident),* $(,)?) => {
        $(
            impl Persisted for $ty {
                fn table(state: &StoreState) -> &Table<Self> {
                    &state.$field
                }

                fn table_mut(state: &mut StoreState) -> &mut Table<Self> {
                    &mut state.$field
                }
            }
        )*
    };
}

persisted! {
    Representative => representatives,
    Meeting => meetings,
    PersonRole => person_roles,
    FinancialPeriod => financial_periods,
    Turnover => turnovers,
    OrganisationMembership => organisation_memberships,
    CountryMembership => country_memberships,
    Interest => interests,
    ActionField => action_fields,
    MeetingParticipant => meeting_participants,
    UnmatchedParty => unmatched_parties,
}

impl StoreState {
    pub fn table<T: Persisted>(&self) -> &Table<T> {
        T::table(self)
    }

    fn set_inactive(&mut self, kind: EntityKind, id: Uuid) -> bool {
        match kind {
            EntityKind::Representative => self.representatives.set_inactive(id),
            EntityKind::Meeting => self.meetings.set_inactive(id),
            EntityKind::PersonRole => self.person_roles.set_inactive(id),
            EntityKind::FinancialPeriod => self.financial_periods.set_inactive(id),
            EntityKind::Turnover => self.turnovers.set_inactive(id),
            EntityKind::OrganisationMembership => self.organisation_memberships.set_inactive(id),
            EntityKind::CountryMembership => self.country_memberships.set_inactive(id),
            EntityKind::Interest => self.interests.set_inactive(id),
            EntityKind::ActionField => self.action_fields.set_inactive(id),
            EntityKind::MeetingParticipant => self.meeting_participants.set_inactive(id),
            EntityKind::UnmatchedParty => self.unmatched_parties.set_inactive(id),
        }
    }

    /// Audit history of one entity, newest first.
    pub fn trail(&self, kind: EntityKind, id: Uuid) -> Vec<&AuditRecord> {
        self.audit
            .iter()
            .rev()
            .filter(|record| record.entity_kind == kind && record.entity_id == id)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Created,
    Updated { fields: Vec<String> },
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct WriteOutcome<T> {
    pub entity: Stored<T>,
    pub change: Change,
}

impl<T> WriteOutcome<T> {
    pub fn changed_field(&self, field: &str) -> bool {
        match &self.change {
            Change::Updated { fields } => fields.iter().any(|f| f == field),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub audit_records: usize,
    pub deactivated: usize,
}

/// Shared persistent store. Readers borrow it; writers go through
/// [`Store::begin`] and [`Store::commit`].
#[derive(Debug, Clone, Default)]
pub struct Store {
    state: StoreState,
    generation: u64,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: StoreState) -> Self {
        Self {
            state,
            generation: 0,
        }
    }

    pub fn state(&self) -> &StoreState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn table<T: Persisted>(&self) -> &Table<T> {
        T::table(&self.state)
    }

    pub fn find_live<T: Persisted>(&self, key: &NaturalKey) -> Option<&Stored<T>> {
        T::table(&self.state).find_live(key)
    }

    pub fn trail(&self, kind: EntityKind, id: Uuid) -> Vec<&AuditRecord> {
        self.state.trail(kind, id)
    }

    pub fn begin(&self) -> UnitOfWork {
        UnitOfWork {
            audit_base: self.state.audit.len(),
            state: self.state.clone(),
            generation: self.generation,
            pending_inactive: BTreeSet::new(),
        }
    }

    /// Apply a unit of work. Entities still flagged by
    /// [`UnitOfWork::mark_all_inactive`] become inactive here.
    pub fn commit(&mut self, uow: UnitOfWork) -> Result<CommitSummary, StoreError> {
        if uow.generation != self.generation {
            return Err(StoreError::StaleUnitOfWork {
                started: uow.generation,
                current: self.generation,
            });
        }
        let UnitOfWork {
            mut state,
            audit_base,
            pending_inactive,
            ..
        } = uow;

        let deactivated = pending_inactive
            .into_iter()
            .filter(|(kind, id)| state.set_inactive(*kind, *id))
            .count();
        let summary = CommitSummary {
            audit_records: state.audit.len() - audit_base,
            deactivated,
        };

        self.state = state;
        self.generation += 1;
        Ok(summary)
    }
}

/// Working copy of the store for one run.
#[derive(Debug)]
pub struct UnitOfWork {
    state: StoreState,
    generation: u64,
    audit_base: usize,
    pending_inactive: BTreeSet<(EntityKind, Uuid)>,
}

impl UnitOfWork {
    pub fn state(&self) -> &StoreState {
        &self.state
    }

    pub fn table<T: Persisted>(&self) -> &Table<T> {
        T::table(&self.state)
    }

    pub fn find_live<T: Persisted>(&self, key: &NaturalKey) -> Option<&Stored<T>> {
        T::table(&self.state).find_live(key)
    }

    pub fn get<T: Persisted>(&self, id: Uuid) -> Option<&Stored<T>> {
        T::table(&self.state).get(id)
    }

    pub fn children_of<T: Persisted>(&self, parent: &NaturalKey) -> Vec<&Stored<T>> {
        T::table(&self.state).children_of(parent)
    }

    /// Audit records appended since [`Store::begin`].
    pub fn pending_audit(&self) -> &[AuditRecord] {
        &self.state.audit[self.audit_base..]
    }

    pub fn is_pending_inactive<T: Persisted>(&self, id: Uuid) -> bool {
        self.pending_inactive.contains(&(T::KIND, id))
    }

    /// Flag every live entity of `T` to become inactive at commit unless it
    /// is written again in this unit of work.
    pub fn mark_all_inactive<T: Persisted>(&mut self) -> usize {
        let ids = T::table(&self.state)
            .live()
            .map(|row| row.id)
            .collect::<Vec<_>>();
        let marked = ids.len();
        self.pending_inactive
            .extend(ids.into_iter().map(|id| (T::KIND, id)));
        marked
    }

    pub fn create<T: Persisted>(&mut self, data: T) -> Result<Stored<T>, StoreError> {
        let key = data.natural_key();
        if T::table(&self.state).find_live(&key).is_some() {
            return Err(StoreError::DuplicateNaturalKey { kind: T::KIND, key });
        }

        let now = Utc::now();
        let row = Stored {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: None,
            deleted_at: None,
            data,
        };
        self.append_audit(AuditAction::Create, &row, now)?;
        T::table_mut(&mut self.state).insert(row.clone());
        debug!(kind = %T::KIND, id = %row.id, %key, "created");
        Ok(row)
    }

    /// Apply new values to a live entity. Writes nothing when no field
    /// differs.
    pub fn update<T: Persisted>(&mut self, id: Uuid, data: T) -> Result<WriteOutcome<T>, StoreError> {
        let current = match T::table(&self.state).get(id) {
            None => return Err(StoreError::NotFound { kind: T::KIND, id }),
            Some(row) if row.is_deleted() => return Err(StoreError::Deleted { kind: T::KIND, id }),
            Some(row) => row.clone(),
        };

        let key = data.natural_key();
        if let Some(other) = T::table(&self.state).find_live(&key) {
            if other.id != id {
                return Err(StoreError::DuplicateNaturalKey { kind: T::KIND, key });
            }
        }

        self.pending_inactive.remove(&(T::KIND, id));

        let fields = changed_fields(&current.data, &data)?;
        if fields.is_empty() {
            return Ok(WriteOutcome {
                entity: current,
                change: Change::Unchanged,
            });
        }

        let now = Utc::now();
        let mut next = current;
        next.updated_at = Some(now);
        next.data = data.clone();
        self.append_audit(AuditAction::Update, &next, now)?;

        let table = T::table_mut(&mut self.state);
        table.replace_data(id, data);
        if let Some(row) = table.rows.get_mut(&id) {
            row.updated_at = Some(now);
        }
        debug!(kind = %T::KIND, %id, fields = ?fields, "updated");
        Ok(WriteOutcome {
            entity: next,
            change: Change::Updated { fields },
        })
    }

    /// Match by natural key among live entities, then update or create.
    pub fn upsert<T: Persisted>(&mut self, data: T) -> Result<WriteOutcome<T>, StoreError> {
        let existing = T::table(&self.state)
            .find_live(&data.natural_key())
            .map(|row| row.id);
        match existing {
            Some(id) => self.update(id, data),
            None => self.create(data).map(|entity| WriteOutcome {
                entity,
                change: Change::Created,
            }),
        }
    }

    /// Soft-delete an entity and its owned children. Deleting an already
    /// deleted entity is a no-op. Returns the number of rows deleted.
    pub fn delete<T: Persisted>(&mut self, id: Uuid) -> Result<usize, StoreError> {
        let mut row = match T::table(&self.state).get(id) {
            None => return Err(StoreError::NotFound { kind: T::KIND, id }),
            Some(row) if row.is_deleted() => return Ok(0),
            Some(row) => row.clone(),
        };

        let now = Utc::now();
        row.deleted_at = Some(now);
        self.append_audit(AuditAction::Delete, &row, now)?;
        T::table_mut(&mut self.state).mark_deleted(id, now);
        self.pending_inactive.remove(&(T::KIND, id));
        debug!(kind = %T::KIND, %id, "soft-deleted");

        let key = row.data.natural_key();
        Ok(1 + self.cascade_delete(T::KIND, id, &key)?)
    }

    fn cascade_delete(
        &mut self,
        kind: EntityKind,
        id: Uuid,
        key: &NaturalKey,
    ) -> Result<usize, StoreError> {
        let deleted = match kind {
            EntityKind::Representative => {
                self.delete_children::<PersonRole>(key)?
                    + self.delete_children::<FinancialPeriod>(key)?
                    + self.delete_children::<OrganisationMembership>(key)?
                    + self.delete_children::<CountryMembership>(key)?
                    + self.delete_children::<Interest>(key)?
                    + self.delete_children::<ActionField>(key)?
            }
            EntityKind::FinancialPeriod => self.delete_children::<Turnover>(key)?,
            EntityKind::Meeting => {
                self.delete_children::<MeetingParticipant>(key)?
                    + self.delete_ledger_rows(kind, id)?
            }
            _ => 0,
        };
        Ok(deleted)
    }

    fn delete_children<C: Persisted>(&mut self, parent: &NaturalKey) -> Result<usize, StoreError> {
        let ids = child_ids::<C>(&self.state, parent);
        let mut deleted = 0;
        for id in ids {
            deleted += self.delete::<C>(id)?;
        }
        Ok(deleted)
    }

    /// Unmatched-party rows hang off their owner's storage id, not a
    /// natural key.
    fn delete_ledger_rows(
        &mut self,
        owning_kind: EntityKind,
        owning_id: Uuid,
    ) -> Result<usize, StoreError> {
        let ids = self
            .state
            .unmatched_parties
            .live()
            .filter(|row| row.data.owning_kind == owning_kind && row.data.owning_id == owning_id)
            .map(|row| row.id)
            .collect::<Vec<_>>();
        let mut deleted = 0;
        for id in ids {
            deleted += self.delete::<UnmatchedParty>(id)?;
        }
        Ok(deleted)
    }

    fn append_audit<T: Persisted>(
        &mut self,
        action: AuditAction,
        row: &Stored<T>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let snapshot = serde_json::to_value(row).map_err(|source| StoreError::Snapshot {
            kind: T::KIND,
            source,
        })?;
        self.state.audit.push(AuditRecord {
            id: Uuid::new_v4(),
            entity_kind: T::KIND,
            entity_id: row.id,
            action,
            snapshot,
            created_at: at,
        });
        Ok(())
    }
}

fn child_ids<C: Persisted>(state: &StoreState, parent: &NaturalKey) -> Vec<Uuid> {
    C::table(state)
        .children_of(parent)
        .into_iter()
        .map(|row| row.id)
        .collect()
}

/// Names of the top-level fields whose serialized values differ.
fn changed_fields<T: Persisted>(before: &T, after: &T) -> Result<Vec<String>, StoreError> {
    if before == after {
        return Ok(Vec::new());
    }
    let to_value = |data: &T| {
        serde_json::to_value(data).map_err(|source| StoreError::Snapshot {
            kind: T::KIND,
            source,
        })
    };
    let (before, after) = (to_value(before)?, to_value(after)?);
    let fields = match (before, after) {
        (serde_json::Value::Object(before), serde_json::Value::Object(after)) => before
            .keys()
            .chain(after.keys())
            .filter(|key| before.get(*key) != after.get(*key))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
        _ => vec!["value".to_string()],
    };
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use lobbysync_core::{FinancialFigures, Interest, MeetingDetails, RepresentativeProfile};

    fn rep(code: &str, name: &str) -> Representative {
        Representative {
            identification_code: code.to_string(),
            profile: RepresentativeProfile {
                name: name.to_string(),
                ..Default::default()
            },
            status: Status::Active,
        }
    }

    fn period(code: &str) -> FinancialPeriod {
        FinancialPeriod {
            representative_key: NaturalKey::registration(code),
            start_date: NaiveDate::from_ymd_opt(2014, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2014, 12, 31).unwrap(),
            figures: FinancialFigures::default(),
            status: Status::Active,
        }
    }

    fn turnover(period: &FinancialPeriod, min: i64, max: i64) -> Turnover {
        Turnover {
            period_key: period.natural_key(),
            customer: "Foo Corp".into(),
            min: Some(min),
            max: Some(max),
            status: Status::Active,
        }
    }

    fn meeting(key: &str) -> Meeting {
        Meeting {
            meeting_key: NaturalKey::new(key),
            details: MeetingDetails {
                host: "Commissioner".into(),
                organisation: "Trade".into(),
                date: NaiveDate::from_ymd_opt(2015, 6, 1).unwrap(),
                location: "Brussels".into(),
                subject: "TTIP".into(),
                cancelled: false,
            },
            status: Status::Active,
        }
    }

    fn participant(meeting: &Meeting, code: &str) -> MeetingParticipant {
        MeetingParticipant {
            meeting_key: meeting.natural_key(),
            identification_code: code.into(),
            representative_id: Uuid::new_v4(),
            status: Status::Active,
        }
    }

    fn delete_audits(uow: &UnitOfWork, kind: EntityKind) -> Vec<Uuid> {
        uow.pending_audit()
            .iter()
            .filter(|r| r.action == AuditAction::Delete && r.entity_kind == kind)
            .map(|r| r.entity_id)
            .collect()
    }

    #[test]
    fn create_writes_one_audit_record_with_full_snapshot() {
        let store = Store::new();
        let mut uow = store.begin();
        let row = uow.create(rep("123456789-01", "Foo")).unwrap();

        let audit = uow.pending_audit();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::Create);
        assert_eq!(audit[0].entity_id, row.id);
        assert_eq!(audit[0].snapshot["data"]["name"], "Foo");
        assert_eq!(audit[0].created_at, row.created_at);
    }

    #[test]
    fn no_op_update_writes_nothing() {
        let mut store = Store::new();
        let mut uow = store.begin();
        let row = uow.create(rep("123456789-01", "Foo")).unwrap();
        store.commit(uow).unwrap();

        let mut uow = store.begin();
        let outcome = uow.update(row.id, rep("123456789-01", "Foo")).unwrap();
        assert_eq!(outcome.change, Change::Unchanged);
        assert!(outcome.entity.updated_at.is_none());
        let summary = store.commit(uow).unwrap();
        assert_eq!(summary.audit_records, 0);
        assert_eq!(store.state().audit.len(), 1);
    }

    #[test]
    fn update_reports_changed_fields_and_bumps_updated_at() {
        let store = Store::new();
        let mut uow = store.begin();
        let row = uow.create(rep("123456789-01", "Foo")).unwrap();

        let mut next = rep("123456789-01", "Foo Group");
        next.profile.acronym = Some("FG".into());
        let outcome = uow.update(row.id, next).unwrap();
        assert_eq!(
            outcome.change,
            Change::Updated {
                fields: vec!["acronym".to_string(), "name".to_string()]
            }
        );
        assert!(outcome.entity.updated_at.is_some());
        assert_eq!(uow.pending_audit().len(), 2);
        assert_eq!(uow.pending_audit()[1].action, AuditAction::Update);
        assert_eq!(uow.pending_audit()[1].snapshot["data"]["acronym"], "FG");
    }

    #[test]
    fn duplicate_natural_key_is_rejected_without_audit() {
        let store = Store::new();
        let mut uow = store.begin();
        uow.create(rep("123456789-01", "Foo")).unwrap();
        let err = uow.create(rep("123456789-01", "Other")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateNaturalKey { .. }));
        assert_eq!(uow.pending_audit().len(), 1);
    }

    #[test]
    fn delete_is_idempotent_and_cascades() {
        let mut store = Store::new();
        let mut uow = store.begin();
        let rep_row = uow.create(rep("123456789-01", "Foo")).unwrap();
        let period_row = uow.create(period("123456789-01")).unwrap();
        uow.create(turnover(&period_row.data, 1000, 5000)).unwrap();
        uow.create(Interest {
            representative_key: NaturalKey::registration("123456789-01"),
            interest: "Energy".into(),
            status: Status::Active,
        })
        .unwrap();
        store.commit(uow).unwrap();

        let mut uow = store.begin();
        assert_eq!(uow.delete::<Representative>(rep_row.id).unwrap(), 4);
        assert_eq!(uow.delete::<Representative>(rep_row.id).unwrap(), 0);
        let deletes = uow
            .pending_audit()
            .iter()
            .filter(|r| r.action == AuditAction::Delete)
            .count();
        assert_eq!(deletes, 4);
        store.commit(uow).unwrap();

        assert!(store.table::<Turnover>().live().next().is_none());
        assert!(store
            .find_live::<Representative>(&NaturalKey::registration("123456789-01"))
            .is_none());
        assert!(store.table::<Representative>().get(rep_row.id).unwrap().is_deleted());
    }

    #[test]
    fn deleting_a_meeting_cascades_to_links_and_ledger_rows() {
        let mut store = Store::new();
        let mut uow = store.begin();
        let kept = uow.create(meeting("meeting:kept")).unwrap();
        let gone = uow.create(meeting("meeting:gone")).unwrap();
        let first = uow.create(participant(&gone.data, "111111111-11")).unwrap();
        let second = uow.create(participant(&gone.data, "222222222-22")).unwrap();
        let other = uow.create(participant(&kept.data, "111111111-11")).unwrap();
        let ledger = uow
            .create(UnmatchedParty {
                owning_kind: EntityKind::Meeting,
                owning_id: gone.id,
                claimed_key: "unregistered".into(),
                display_name: "Foo Corp".into(),
                status: Status::Active,
                resolved_entity_id: None,
            })
            .unwrap();
        store.commit(uow).unwrap();

        let mut uow = store.begin();
        assert_eq!(uow.delete::<Meeting>(gone.id).unwrap(), 4);
        let mut links = delete_audits(&uow, EntityKind::MeetingParticipant);
        links.sort();
        let mut expected = vec![first.id, second.id];
        expected.sort();
        assert_eq!(links, expected);
        assert_eq!(delete_audits(&uow, EntityKind::UnmatchedParty), vec![ledger.id]);
        store.commit(uow).unwrap();

        let table = store.table::<MeetingParticipant>();
        assert!(table.get(first.id).unwrap().deleted_at.is_some());
        assert!(table.get(second.id).unwrap().deleted_at.is_some());
        assert!(table.get(other.id).unwrap().deleted_at.is_none());
        assert!(store.table::<UnmatchedParty>().get(ledger.id).unwrap().is_deleted());
        assert_eq!(store.table::<UnmatchedParty>().live().count(), 0);
        assert!(!store.table::<Meeting>().get(kept.id).unwrap().is_deleted());
    }

    #[test]
    fn deleting_a_financial_period_cascades_to_its_turnovers() {
        let mut store = Store::new();
        let mut uow = store.begin();
        let rep_row = uow.create(rep("123456789-01", "Foo")).unwrap();
        let period_row = uow.create(period("123456789-01")).unwrap();
        let turnover_row = uow.create(turnover(&period_row.data, 1000, 5000)).unwrap();
        store.commit(uow).unwrap();

        let mut uow = store.begin();
        assert_eq!(uow.delete::<FinancialPeriod>(period_row.id).unwrap(), 2);
        assert_eq!(delete_audits(&uow, EntityKind::Turnover), vec![turnover_row.id]);
        store.commit(uow).unwrap();

        assert!(store.table::<Turnover>().get(turnover_row.id).unwrap().is_deleted());
        assert!(!store.table::<Representative>().get(rep_row.id).unwrap().is_deleted());
        assert!(store
            .table::<FinancialPeriod>()
            .children_of(&NaturalKey::registration("123456789-01"))
            .is_empty());
    }

    #[test]
    fn resighting_a_deleted_key_creates_a_new_entity() {
        let mut store = Store::new();
        let mut uow = store.begin();
        let old = uow.create(rep("123456789-01", "Foo")).unwrap();
        uow.delete::<Representative>(old.id).unwrap();
        let outcome = uow.upsert(rep("123456789-01", "Foo")).unwrap();
        assert_eq!(outcome.change, Change::Created);
        assert_ne!(outcome.entity.id, old.id);
        store.commit(uow).unwrap();

        let old_row = store.table::<Representative>().get(old.id).unwrap();
        assert!(old_row.is_deleted());
        assert_eq!(store.table::<Representative>().len(), 2);
    }

    #[test]
    fn bulk_inactive_applies_at_commit_without_audit() {
        let mut store = Store::new();
        let mut uow = store.begin();
        let kept = uow.create(rep("111111111-01", "Kept")).unwrap();
        let dropped = uow.create(rep("222222222-02", "Dropped")).unwrap();
        store.commit(uow).unwrap();

        let mut uow = store.begin();
        assert_eq!(uow.mark_all_inactive::<Representative>(), 2);
        uow.update(kept.id, rep("111111111-01", "Kept")).unwrap();
        assert!(!uow.is_pending_inactive::<Representative>(kept.id));
        let summary = store.commit(uow).unwrap();
        assert_eq!(summary.audit_records, 0);
        assert_eq!(summary.deactivated, 1);

        let table = store.table::<Representative>();
        assert_eq!(table.get(kept.id).unwrap().data.status, Status::Active);
        let dropped_row = table.get(dropped.id).unwrap();
        assert_eq!(dropped_row.data.status, Status::Inactive);
        assert!(dropped_row.updated_at.is_none());
    }

    #[test]
    fn children_are_indexed_by_parent_key() {
        let store = Store::new();
        let mut uow = store.begin();
        let p = uow.create(period("123456789-01")).unwrap();
        uow.create(turnover(&p.data, 1, 2)).unwrap();
        let children = uow.children_of::<Turnover>(&p.data.natural_key());
        assert_eq!(children.len(), 1);
        assert!(uow
            .children_of::<Turnover>(&NaturalKey::new("elsewhere"))
            .is_empty());
    }

    #[test]
    fn stale_unit_of_work_is_refused() {
        let mut store = Store::new();
        let first = store.begin();
        let second = store.begin();
        store.commit(first).unwrap();
        let err = store.commit(second).unwrap_err();
        assert!(matches!(err, StoreError::StaleUnitOfWork { .. }));
    }

    #[test]
    fn trail_is_newest_first() {
        let mut store = Store::new();
        let mut uow = store.begin();
        let row = uow.create(rep("123456789-01", "Foo")).unwrap();
        uow.update(row.id, rep("123456789-01", "Bar")).unwrap();
        uow.delete::<Representative>(row.id).unwrap();
        store.commit(uow).unwrap();

        let actions = store
            .trail(EntityKind::Representative, row.id)
            .into_iter()
            .map(|r| r.action)
            .collect::<Vec<_>>();
        assert_eq!(
            actions,
            vec![AuditAction::Delete, AuditAction::Update, AuditAction::Create]
        );
    }

    #[test]
    fn state_round_trips_through_json_and_rebuilds_indexes() {
        let store = Store::new();
        let mut uow = store.begin();
        uow.create(rep("123456789-01", "Foo")).unwrap();
        let p = uow.create(period("123456789-01")).unwrap();
        let json = serde_json::to_string(uow.state()).unwrap();

        let state: StoreState = serde_json::from_str(&json).unwrap();
        assert!(state
            .representatives
            .find_live(&NaturalKey::registration("123456789-01"))
            .is_some());
        assert_eq!(
            state
                .financial_periods
                .children_of(&NaturalKey::registration("123456789-01"))[0]
                .id,
            p.id
        );
        assert_eq!(state.audit.len(), 2);
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
