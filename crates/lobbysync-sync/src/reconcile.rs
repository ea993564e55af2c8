//! Lifecycle reconciliation of one snapshot into a unit of work.
//!
//! Root entities of the snapshot's kind are flagged inactive up front and
//! flipped back as they are resighted; the flag only lands at commit, so an
//! unchanged resighted entity writes nothing. Child records are upserted under
//! their parent's natural key and never removed by omission.

use std::collections::BTreeSet;

use lobbysync_core::{
    is_valid_registration_code, normalize_text, ActionField, Counterparty, CountryMembership,
    EntityData, EntityKind, FinancialPeriod, Interest, Meeting, MeetingParticipant, MeetingRecord,
    NaturalKey, OrganisationMembership, PersonRole, RegistrationCode, Representative,
    RepresentativeRecord, Status, Turnover, UnmatchedParty, DISPLAY_NAME_SEPARATOR,
};
use lobbysync_storage::{Change, Persisted, StoreError, Stored, UnitOfWork, WriteOutcome};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub records: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub reactivated: usize,
    pub deactivated: usize,
    pub rejected: usize,
    pub write_failures: usize,
    pub pages_failed: usize,
    pub unmatched_recorded: usize,
    pub unmatched_resolved: usize,
    pub audit_records: usize,
}

impl SyncStats {
    pub fn record<T: EntityData>(&mut self, outcome: &WriteOutcome<T>) {
        match &outcome.change {
            Change::Created => self.created += 1,
            Change::Updated { .. } => {
                self.updated += 1;
                if outcome.changed_field("status") && outcome.entity.data.status() == Status::Active
                {
                    self.reactivated += 1;
                }
            }
            Change::Unchanged => self.unchanged += 1,
        }
    }
}

/// Create-or-update a child record under `parent_key`. The discriminator is
/// part of the child's own natural key, so a child can only match a record
/// under the same parent.
pub fn upsert_child<P: Persisted, C: Persisted>(
    uow: &mut UnitOfWork,
    parent_key: &NaturalKey,
    values: C,
) -> Result<WriteOutcome<C>, StoreError> {
    if values.parent_key() != Some(parent_key) {
        return Err(StoreError::ParentMismatch {
            kind: C::KIND,
            key: values.natural_key(),
            expected: parent_key.clone(),
        });
    }
    if uow.find_live::<P>(parent_key).is_none() {
        return Err(StoreError::MissingParent {
            kind: P::KIND,
            key: parent_key.clone(),
        });
    }
    uow.upsert(values)
}

fn write_child<P: Persisted, C: Persisted>(
    uow: &mut UnitOfWork,
    parent_key: &NaturalKey,
    values: C,
    stats: &mut SyncStats,
) -> Option<Stored<C>> {
    match upsert_child::<P, C>(uow, parent_key, values) {
        Ok(outcome) => {
            stats.record(&outcome);
            Some(outcome.entity)
        }
        Err(err) => {
            warn!(kind = %C::KIND, parent = %parent_key, error = %err, "child write failed");
            stats.write_failures += 1;
            None
        }
    }
}

/// Merge a sighting into the `(owning entity, claimed key)` ledger row,
/// accumulating every distinct observed spelling.
pub fn record_unmatched(
    uow: &mut UnitOfWork,
    owning_kind: EntityKind,
    owning_id: Uuid,
    claimed_key: &str,
    observed_name: &str,
) -> Result<WriteOutcome<UnmatchedParty>, StoreError> {
    let key = UnmatchedParty::ledger_key(owning_id, claimed_key);
    let existing = uow
        .find_live::<UnmatchedParty>(&key)
        .map(|row| row.data.display_name.clone());
    let display_name = merge_display_names(existing.as_deref(), observed_name);
    uow.upsert(UnmatchedParty {
        owning_kind,
        owning_id,
        claimed_key: claimed_key.to_string(),
        display_name,
        status: Status::Active,
        resolved_entity_id: None,
    })
}

pub fn merge_display_names(existing: Option<&str>, observed: &str) -> String {
    let mut names = existing
        .into_iter()
        .flat_map(|names| names.split(DISPLAY_NAME_SEPARATOR))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>();
    let observed = normalize_text(observed);
    if !observed.is_empty() {
        names.insert(observed);
    }
    names.into_iter().collect::<Vec<_>>().join(DISPLAY_NAME_SEPARATOR)
}

pub fn reconcile_register(
    uow: &mut UnitOfWork,
    records: &[RepresentativeRecord],
    stats: &mut SyncStats,
) {
    let marked = uow.mark_all_inactive::<Representative>();
    debug!(marked, "representatives flagged inactive for this run");

    for record in records {
        stats.records += 1;
        let representative = Representative {
            identification_code: record.identification_code.clone(),
            profile: record.profile.clone(),
            status: Status::Active,
        };
        match uow.upsert(representative) {
            Ok(outcome) => stats.record(&outcome),
            Err(err) => {
                warn!(code = %record.identification_code, error = %err, "representative write failed");
                stats.write_failures += 1;
                continue;
            }
        }

        let key = NaturalKey::registration(&record.identification_code);
        write_representative_children(uow, &key, record, stats);
    }

    resolve_unmatched(uow, stats);
}

fn write_representative_children(
    uow: &mut UnitOfWork,
    key: &NaturalKey,
    record: &RepresentativeRecord,
    stats: &mut SyncStats,
) {
    for person in &record.persons {
        let role = PersonRole {
            representative_key: key.clone(),
            person: person.clone(),
            status: Status::Active,
        };
        write_child::<Representative, _>(uow, key, role, stats);
    }

    for period in &record.financial_periods {
        let values = FinancialPeriod {
            representative_key: key.clone(),
            start_date: period.start_date,
            end_date: period.end_date,
            figures: period.figures.clone(),
            status: Status::Active,
        };
        let Some(stored) = write_child::<Representative, _>(uow, key, values, stats) else {
            continue;
        };
        let period_key = stored.data.natural_key();
        for turnover in &period.turnovers {
            let values = Turnover {
                period_key: period_key.clone(),
                customer: turnover.customer.clone(),
                min: turnover.min,
                max: turnover.max,
                status: Status::Active,
            };
            write_child::<FinancialPeriod, _>(uow, &period_key, values, stats);
        }
    }

    for organisation in &record.organisations {
        let values = OrganisationMembership {
            representative_key: key.clone(),
            organisation: organisation.name.clone(),
            number_of_members: organisation.number_of_members,
            status: Status::Active,
        };
        write_child::<Representative, _>(uow, key, values, stats);
    }

    for country in &record.countries {
        let values = CountryMembership {
            representative_key: key.clone(),
            country_code: country.clone(),
            status: Status::Active,
        };
        write_child::<Representative, _>(uow, key, values, stats);
    }

    for interest in &record.interests {
        let values = Interest {
            representative_key: key.clone(),
            interest: interest.clone(),
            status: Status::Active,
        };
        write_child::<Representative, _>(uow, key, values, stats);
    }

    for action in &record.action_fields {
        let values = ActionField {
            representative_key: key.clone(),
            action: action.clone(),
            status: Status::Active,
        };
        write_child::<Representative, _>(uow, key, values, stats);
    }
}

pub fn reconcile_meetings(uow: &mut UnitOfWork, records: &[MeetingRecord], stats: &mut SyncStats) {
    let marked = uow.mark_all_inactive::<Meeting>();
    debug!(marked, "meetings flagged inactive for this run");

    for record in records {
        stats.records += 1;
        let meeting_key = record.natural_key();
        let meeting = Meeting {
            meeting_key: meeting_key.clone(),
            details: record.details.clone(),
            status: Status::Active,
        };
        let meeting_id = match uow.upsert(meeting) {
            Ok(outcome) => {
                stats.record(&outcome);
                outcome.entity.id
            }
            Err(err) => {
                warn!(key = %meeting_key, error = %err, "meeting write failed");
                stats.write_failures += 1;
                continue;
            }
        };

        for participant in &record.participants {
            link_participant(uow, meeting_id, &meeting_key, participant, stats);
        }
    }

    resolve_unmatched(uow, stats);
}

fn link_participant(
    uow: &mut UnitOfWork,
    meeting_id: Uuid,
    meeting_key: &NaturalKey,
    participant: &Counterparty,
    stats: &mut SyncStats,
) {
    let resolved = match &participant.code {
        RegistrationCode::Registered(code) => uow
            .find_live::<Representative>(&NaturalKey::registration(code))
            .map(|rep| (code.clone(), rep.id)),
        RegistrationCode::Unregistered => None,
    };

    match resolved {
        Some((identification_code, representative_id)) => {
            let link = MeetingParticipant {
                meeting_key: meeting_key.clone(),
                identification_code,
                representative_id,
                status: Status::Active,
            };
            write_child::<Meeting, _>(uow, meeting_key, link, stats);
        }
        None => {
            match record_unmatched(
                uow,
                EntityKind::Meeting,
                meeting_id,
                participant.code.as_str(),
                &participant.name,
            ) {
                Ok(outcome) => {
                    if outcome.change != Change::Unchanged {
                        stats.unmatched_recorded += 1;
                    }
                    stats.record(&outcome);
                }
                Err(err) => {
                    warn!(meeting = %meeting_key, error = %err, "unmatched party write failed");
                    stats.write_failures += 1;
                }
            }
        }
    }
}

/// Turn ledger rows whose claimed key now names a live representative into
/// participant links. The ledger row is kept and marked resolved.
pub fn resolve_unmatched(uow: &mut UnitOfWork, stats: &mut SyncStats) {
    let candidates = uow
        .table::<UnmatchedParty>()
        .live()
        .filter(|row| row.data.status != Status::Resolved)
        .filter(|row| row.data.owning_kind == EntityKind::Meeting)
        .filter(|row| is_valid_registration_code(&row.data.claimed_key))
        .filter_map(|row| {
            uow.find_live::<Representative>(&NaturalKey::registration(&row.data.claimed_key))
                .map(|rep| (row.id, row.data.clone(), rep.id))
        })
        .collect::<Vec<_>>();

    for (ledger_id, ledger, representative_id) in candidates {
        let Some(meeting) = uow
            .get::<Meeting>(ledger.owning_id)
            .filter(|row| !row.is_deleted())
            .map(|row| row.data.natural_key())
        else {
            continue;
        };

        let link = MeetingParticipant {
            meeting_key: meeting.clone(),
            identification_code: ledger.claimed_key.clone(),
            representative_id,
            status: Status::Active,
        };
        if write_child::<Meeting, _>(uow, &meeting, link, stats).is_none() {
            continue;
        }

        let resolved = UnmatchedParty {
            status: Status::Resolved,
            resolved_entity_id: Some(representative_id),
            ..ledger
        };
        match uow.update(ledger_id, resolved) {
            Ok(outcome) => {
                stats.unmatched_resolved += 1;
                stats.record(&outcome);
            }
            Err(err) => {
                warn!(ledger = %ledger_id, error = %err, "resolving unmatched party failed");
                stats.write_failures += 1;
            }
        }
    }
}
