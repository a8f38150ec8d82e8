use std::{
    collections::{BTreeMap, HashMap},
    ops::{Bound, RangeBounds},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use rust_decimal::Decimal;
use subtle::ConstantTimeEq;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use kicho_core::{
    Account, AccountingPeriod, CreateAccountCommand, CreateImportRuleCommand,
    CreateJournalCommand, CreatePartnerCommand, CreatePeriodCommand, CreateUserCommand,
    ImportRule, JournalEntry, JournalLine, LedgerRow, Organization, Partner, Role, Session,
    UpdateAccountCommand, UpdatePartnerCommand, User,
};

pub use kicho_core::storage::{StorageBackend, StorageError, TransactionId};

#[derive(Clone)]
struct OrgData {
    organization: Organization,
    members: BTreeMap<Uuid, Role>,
    accounts: BTreeMap<Uuid, Account>,
    partners: BTreeMap<Uuid, Partner>,
    periods: BTreeMap<Uuid, AccountingPeriod>,
    journals: BTreeMap<Uuid, JournalEntry>,
    import_rules: Vec<ImportRule>,
}

impl OrgData {
    fn new(organization: Organization) -> Self {
        Self {
            organization,
            members: BTreeMap::new(),
            accounts: BTreeMap::new(),
            partners: BTreeMap::new(),
            periods: BTreeMap::new(),
            journals: BTreeMap::new(),
            import_rules: Vec::new(),
        }
    }

    /// Non-deleted journal entries whose date falls inside the range,
    /// ordered by (date, sequence).
    fn journals_in_range(&self, from: Bound<Date>, to: Bound<Date>) -> Vec<&JournalEntry> {
        let mut entries: Vec<&JournalEntry> = self
            .journals
            .values()
            .filter(|j| !j.deleted && (from, to).contains(&j.entry_date))
            .collect();
        entries.sort_by_key(|j| (j.entry_date, j.sequence));
        entries
    }
}

struct Snapshot {
    orgs: BTreeMap<Uuid, OrgData>,
    users: BTreeMap<Uuid, User>,
    sessions: Vec<Session>,
    sequence_value: u64,
}

pub struct InMemoryStorage {
    orgs: RwLock<BTreeMap<Uuid, OrgData>>,
    users: RwLock<BTreeMap<Uuid, User>>,
    sessions: RwLock<Vec<Session>>,
    sequence_counter: AtomicU64,
    tx_counter: AtomicU64,
    snapshots: RwLock<HashMap<TransactionId, Snapshot>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            orgs: RwLock::new(BTreeMap::new()),
            users: RwLock::new(BTreeMap::new()),
            sessions: RwLock::new(Vec::new()),
            sequence_counter: AtomicU64::new(1),
            tx_counter: AtomicU64::new(1),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn build_lines(org: &OrgData, command: &CreateJournalCommand) -> Result<Vec<JournalLine>, StorageError> {
        let mut lines = Vec::with_capacity(command.lines.len());
        for line in &command.lines {
            let account = org
                .accounts
                .get(&line.account_id)
                .ok_or(StorageError::AccountNotFound(line.account_id))?;
            if !account.active {
                return Err(StorageError::AccountInactive(line.account_id));
            }
            if let Some(pid) = line.partner_id {
                if !org.partners.contains_key(&pid) {
                    return Err(StorageError::PartnerNotFound(pid));
                }
            }
            lines.push(JournalLine {
                id: Uuid::new_v4(),
                account_id: line.account_id,
                side: line.side,
                amount: line.amount,
                partner_id: line.partner_id,
                memo: line.memo.clone(),
            });
        }
        Ok(lines)
    }
}

fn org_mut<'a>(
    orgs: &'a mut BTreeMap<Uuid, OrgData>,
    org_id: Uuid,
) -> Result<&'a mut OrgData, StorageError> {
    orgs.get_mut(&org_id)
        .ok_or(StorageError::OrganizationNotFound(org_id))
}

fn org_ref<'a>(
    orgs: &'a BTreeMap<Uuid, OrgData>,
    org_id: Uuid,
) -> Result<&'a OrgData, StorageError> {
    orgs.get(&org_id)
        .ok_or(StorageError::OrganizationNotFound(org_id))
}

impl StorageBackend for InMemoryStorage {
    fn create_user(&self, command: &CreateUserCommand) -> Result<User, StorageError> {
        let mut users = self.users.write().unwrap();
        if users.values().any(|u| u.email == command.email) {
            return Err(StorageError::DuplicateEmail(command.email.clone()));
        }
        let user = User {
            id: Uuid::new_v4(),
            email: command.email.clone(),
            display_name: command.display_name.clone(),
            password_hash: command.password_hash.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    fn get_user(&self, user_id: Uuid) -> Result<User, StorageError> {
        self.users
            .read()
            .unwrap()
            .get(&user_id)
            .cloned()
            .ok_or(StorageError::UserNotFound(user_id))
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        Ok(self
            .users
            .read()
            .unwrap()
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    fn insert_session(&self, session: &Session) -> Result<(), StorageError> {
        self.sessions.write().unwrap().push(session.clone());
        Ok(())
    }

    fn find_session(&self, token: &str, now: OffsetDateTime) -> Result<Option<Session>, StorageError> {
        let sessions = self.sessions.read().unwrap();
        Ok(sessions
            .iter()
            .find(|s| s.token.as_bytes().ct_eq(token.as_bytes()).into())
            .filter(|s| !s.is_expired(now))
            .cloned())
    }

    fn delete_session(&self, token: &str) -> Result<(), StorageError> {
        self.sessions.write().unwrap().retain(|s| s.token != token);
        Ok(())
    }

    fn purge_expired_sessions(&self, now: OffsetDateTime) -> Result<usize, StorageError> {
        let mut sessions = self.sessions.write().unwrap();
        let before = sessions.len();
        sessions.retain(|s| !s.is_expired(now));
        Ok(before - sessions.len())
    }

    fn create_organization(&self, name: &str, owner: Uuid) -> Result<Organization, StorageError> {
        if !self.users.read().unwrap().contains_key(&owner) {
            return Err(StorageError::UserNotFound(owner));
        }
        let organization = Organization {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        let mut data = OrgData::new(organization.clone());
        data.members.insert(owner, Role::Owner);
        self.orgs.write().unwrap().insert(organization.id, data);
        Ok(organization)
    }

    fn get_organization(&self, org_id: Uuid) -> Result<Organization, StorageError> {
        let orgs = self.orgs.read().unwrap();
        Ok(org_ref(&orgs, org_id)?.organization.clone())
    }

    fn list_organizations_for_user(&self, user_id: Uuid) -> Result<Vec<(Organization, Role)>, StorageError> {
        let orgs = self.orgs.read().unwrap();
        Ok(orgs
            .values()
            .filter_map(|o| o.members.get(&user_id).map(|r| (o.organization.clone(), *r)))
            .collect())
    }

    fn upsert_member(&self, org_id: Uuid, user_id: Uuid, role: Role) -> Result<(), StorageError> {
        if !self.users.read().unwrap().contains_key(&user_id) {
            return Err(StorageError::UserNotFound(user_id));
        }
        let mut orgs = self.orgs.write().unwrap();
        let org = org_mut(&mut orgs, org_id)?;
        if org.members.get(&user_id) == Some(&Role::Owner)
            && role != Role::Owner
            && org.members.values().filter(|r| **r == Role::Owner).count() == 1
        {
            return Err(StorageError::LastOwner);
        }
        org.members.insert(user_id, role);
        Ok(())
    }

    fn remove_member(&self, org_id: Uuid, user_id: Uuid) -> Result<(), StorageError> {
        let mut orgs = self.orgs.write().unwrap();
        let org = org_mut(&mut orgs, org_id)?;
        if org.members.get(&user_id) == Some(&Role::Owner)
            && org.members.values().filter(|r| **r == Role::Owner).count() == 1
        {
            return Err(StorageError::LastOwner);
        }
        org.members.remove(&user_id);
        Ok(())
    }

    fn member_role(&self, org_id: Uuid, user_id: Uuid) -> Result<Option<Role>, StorageError> {
        let orgs = self.orgs.read().unwrap();
        Ok(org_ref(&orgs, org_id)?.members.get(&user_id).copied())
    }

    fn list_members(&self, org_id: Uuid) -> Result<Vec<(User, Role)>, StorageError> {
        let orgs = self.orgs.read().unwrap();
        let org = org_ref(&orgs, org_id)?;
        let users = self.users.read().unwrap();
        Ok(org
            .members
            .iter()
            .filter_map(|(uid, role)| users.get(uid).map(|u| (u.clone(), *role)))
            .collect())
    }

    fn create_account(&self, org_id: Uuid, command: &CreateAccountCommand) -> Result<Account, StorageError> {
        let mut orgs = self.orgs.write().unwrap();
        let org = org_mut(&mut orgs, org_id)?;
        if org.accounts.values().any(|a| a.code == command.code) {
            return Err(StorageError::DuplicateAccountCode(command.code.clone()));
        }
        if let Some(parent) = command.parent_id {
            if !org.accounts.contains_key(&parent) {
                return Err(StorageError::AccountNotFound(parent));
            }
        }
        let account = Account {
            id: Uuid::new_v4(),
            org_id,
            code: command.code.clone(),
            name: command.name.clone(),
            account_type: command.account_type,
            parent_id: command.parent_id,
            active: true,
            created_at: OffsetDateTime::now_utc(),
        };
        org.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    fn update_account(&self, org_id: Uuid, account_id: Uuid, command: &UpdateAccountCommand) -> Result<Account, StorageError> {
        let mut orgs = self.orgs.write().unwrap();
        let org = org_mut(&mut orgs, org_id)?;
        if let Some(parent) = command.parent_id {
            if parent != account_id && !org.accounts.contains_key(&parent) {
                return Err(StorageError::AccountNotFound(parent));
            }
        }
        let account = org
            .accounts
            .get_mut(&account_id)
            .ok_or(StorageError::AccountNotFound(account_id))?;
        if let Some(ref name) = command.name {
            account.name = name.clone();
        }
        if let Some(parent) = command.parent_id {
            account.parent_id = Some(parent);
        }
        if let Some(active) = command.active {
            account.active = active;
        }
        Ok(account.clone())
    }

    fn get_account(&self, org_id: Uuid, account_id: Uuid) -> Result<Account, StorageError> {
        let orgs = self.orgs.read().unwrap();
        org_ref(&orgs, org_id)?
            .accounts
            .get(&account_id)
            .cloned()
            .ok_or(StorageError::AccountNotFound(account_id))
    }

    fn list_accounts(&self, org_id: Uuid) -> Result<Vec<Account>, StorageError> {
        let orgs = self.orgs.read().unwrap();
        let mut accounts: Vec<Account> = org_ref(&orgs, org_id)?.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(accounts)
    }

    fn deactivate_account(&self, org_id: Uuid, account_id: Uuid) -> Result<(), StorageError> {
        let mut orgs = self.orgs.write().unwrap();
        let org = org_mut(&mut orgs, org_id)?;
        let account = org
            .accounts
            .get_mut(&account_id)
            .ok_or(StorageError::AccountNotFound(account_id))?;
        account.active = false;
        Ok(())
    }

    fn create_partner(&self, org_id: Uuid, command: &CreatePartnerCommand) -> Result<Partner, StorageError> {
        let mut orgs = self.orgs.write().unwrap();
        let org = org_mut(&mut orgs, org_id)?;
        if org.partners.values().any(|p| p.code == command.code) {
            return Err(StorageError::DuplicatePartnerCode(command.code.clone()));
        }
        let partner = Partner {
            id: Uuid::new_v4(),
            org_id,
            code: command.code.clone(),
            name: command.name.clone(),
            kind: command.kind,
            active: true,
        };
        org.partners.insert(partner.id, partner.clone());
        Ok(partner)
    }

    fn update_partner(&self, org_id: Uuid, partner_id: Uuid, command: &UpdatePartnerCommand) -> Result<Partner, StorageError> {
        let mut orgs = self.orgs.write().unwrap();
        let org = org_mut(&mut orgs, org_id)?;
        let partner = org
            .partners
            .get_mut(&partner_id)
            .ok_or(StorageError::PartnerNotFound(partner_id))?;
        if let Some(ref name) = command.name {
            partner.name = name.clone();
        }
        if let Some(kind) = command.kind {
            partner.kind = kind;
        }
        if let Some(active) = command.active {
            partner.active = active;
        }
        Ok(partner.clone())
    }

    fn get_partner(&self, org_id: Uuid, partner_id: Uuid) -> Result<Partner, StorageError> {
        let orgs = self.orgs.read().unwrap();
        org_ref(&orgs, org_id)?
            .partners
            .get(&partner_id)
            .cloned()
            .ok_or(StorageError::PartnerNotFound(partner_id))
    }

    fn list_partners(&self, org_id: Uuid) -> Result<Vec<Partner>, StorageError> {
        let orgs = self.orgs.read().unwrap();
        let mut partners: Vec<Partner> = org_ref(&orgs, org_id)?.partners.values().cloned().collect();
        partners.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(partners)
    }

    fn deactivate_partner(&self, org_id: Uuid, partner_id: Uuid) -> Result<(), StorageError> {
        let mut orgs = self.orgs.write().unwrap();
        let org = org_mut(&mut orgs, org_id)?;
        let partner = org
            .partners
            .get_mut(&partner_id)
            .ok_or(StorageError::PartnerNotFound(partner_id))?;
        partner.active = false;
        Ok(())
    }

    fn create_period(&self, org_id: Uuid, command: &CreatePeriodCommand) -> Result<AccountingPeriod, StorageError> {
        let mut orgs = self.orgs.write().unwrap();
        let org = org_mut(&mut orgs, org_id)?;
        let period = AccountingPeriod {
            id: Uuid::new_v4(),
            org_id,
            name: command.name.clone(),
            start_date: command.start_date,
            end_date: command.end_date,
            closed: false,
        };
        if org.periods.values().any(|p| p.overlaps(&period)) {
            return Err(StorageError::PeriodOverlap);
        }
        org.periods.insert(period.id, period.clone());
        Ok(period)
    }

    fn list_periods(&self, org_id: Uuid) -> Result<Vec<AccountingPeriod>, StorageError> {
        let orgs = self.orgs.read().unwrap();
        let mut periods: Vec<AccountingPeriod> = org_ref(&orgs, org_id)?.periods.values().cloned().collect();
        periods.sort_by_key(|p| p.start_date);
        Ok(periods)
    }

    fn set_period_closed(&self, org_id: Uuid, period_id: Uuid, closed: bool) -> Result<AccountingPeriod, StorageError> {
        let mut orgs = self.orgs.write().unwrap();
        let org = org_mut(&mut orgs, org_id)?;
        let period = org
            .periods
            .get_mut(&period_id)
            .ok_or(StorageError::PeriodNotFound(period_id))?;
        period.closed = closed;
        Ok(period.clone())
    }

    fn period_containing(&self, org_id: Uuid, date: Date) -> Result<Option<AccountingPeriod>, StorageError> {
        let orgs = self.orgs.read().unwrap();
        Ok(org_ref(&orgs, org_id)?
            .periods
            .values()
            .find(|p| p.contains(date))
            .cloned())
    }

    fn create_journal(&self, org_id: Uuid, command: &CreateJournalCommand) -> Result<JournalEntry, StorageError> {
        let sequence = self.next_sequence();
        let mut orgs = self.orgs.write().unwrap();
        let org = org_mut(&mut orgs, org_id)?;
        let lines = Self::build_lines(org, command)?;
        let entry = JournalEntry {
            id: Uuid::new_v4(),
            org_id,
            sequence,
            entry_date: command.entry_date,
            description: command.description.clone(),
            lines,
            source_key: command.source_key.clone(),
            deleted: false,
            created_at: OffsetDateTime::now_utc(),
        };
        org.journals.insert(entry.id, entry.clone());
        Ok(entry)
    }

    fn update_journal(&self, org_id: Uuid, journal_id: Uuid, command: &CreateJournalCommand) -> Result<JournalEntry, StorageError> {
        let mut orgs = self.orgs.write().unwrap();
        let org = org_mut(&mut orgs, org_id)?;
        let lines = Self::build_lines(org, command)?;
        let entry = org
            .journals
            .get_mut(&journal_id)
            .filter(|j| !j.deleted)
            .ok_or(StorageError::JournalNotFound(journal_id))?;
        entry.entry_date = command.entry_date;
        entry.description = command.description.clone();
        entry.lines = lines;
        entry.source_key = command.source_key.clone();
        Ok(entry.clone())
    }

    fn delete_journal(&self, org_id: Uuid, journal_id: Uuid) -> Result<(), StorageError> {
        let mut orgs = self.orgs.write().unwrap();
        let org = org_mut(&mut orgs, org_id)?;
        let entry = org
            .journals
            .get_mut(&journal_id)
            .filter(|j| !j.deleted)
            .ok_or(StorageError::JournalNotFound(journal_id))?;
        entry.deleted = true;
        Ok(())
    }

    fn get_journal(&self, org_id: Uuid, journal_id: Uuid) -> Result<JournalEntry, StorageError> {
        let orgs = self.orgs.read().unwrap();
        org_ref(&orgs, org_id)?
            .journals
            .get(&journal_id)
            .filter(|j| !j.deleted)
            .cloned()
            .ok_or(StorageError::JournalNotFound(journal_id))
    }

    fn list_journals(&self, org_id: Uuid, from: Bound<Date>, to: Bound<Date>) -> Result<Vec<JournalEntry>, StorageError> {
        let orgs = self.orgs.read().unwrap();
        Ok(org_ref(&orgs, org_id)?
            .journals_in_range(from, to)
            .into_iter()
            .cloned()
            .collect())
    }

    fn source_key_exists(&self, org_id: Uuid, source_key: &str) -> Result<bool, StorageError> {
        let orgs = self.orgs.read().unwrap();
        Ok(org_ref(&orgs, org_id)?
            .journals
            .values()
            .any(|j| !j.deleted && j.source_key.as_deref() == Some(source_key)))
    }

    fn account_balance(&self, org_id: Uuid, account_id: Uuid, as_of: Date) -> Result<Decimal, StorageError> {
        let orgs = self.orgs.read().unwrap();
        let org = org_ref(&orgs, org_id)?;
        let account = org
            .accounts
            .get(&account_id)
            .ok_or(StorageError::AccountNotFound(account_id))?;

        let mut balance = Decimal::ZERO;
        for entry in org.journals.values().filter(|j| !j.deleted && j.entry_date <= as_of) {
            for line in entry.lines.iter().filter(|l| l.account_id == account_id) {
                balance += account.account_type.signed(line.side, line.amount);
            }
        }
        Ok(balance)
    }

    fn account_ledger(&self, org_id: Uuid, account_id: Uuid, from: Bound<Date>, to: Bound<Date>) -> Result<Vec<LedgerRow>, StorageError> {
        let orgs = self.orgs.read().unwrap();
        let org = org_ref(&orgs, org_id)?;
        let account = org
            .accounts
            .get(&account_id)
            .ok_or(StorageError::AccountNotFound(account_id))?;

        // Opening balance covers everything strictly before the range.
        let mut balance = Decimal::ZERO;
        let opening_cutoff: Option<(Date, bool)> = match from {
            Bound::Included(d) => Some((d, false)),
            Bound::Excluded(d) => Some((d, true)),
            Bound::Unbounded => None,
        };
        if let Some((cutoff, inclusive)) = opening_cutoff {
            for entry in org.journals.values().filter(|j| {
                !j.deleted && (j.entry_date < cutoff || (inclusive && j.entry_date == cutoff))
            }) {
                for line in entry.lines.iter().filter(|l| l.account_id == account_id) {
                    balance += account.account_type.signed(line.side, line.amount);
                }
            }
        }

        let mut rows = Vec::new();
        for entry in org.journals_in_range(from, to) {
            for line in entry.lines.iter().filter(|l| l.account_id == account_id) {
                let amount = account.account_type.signed(line.side, line.amount);
                balance += amount;
                rows.push(LedgerRow {
                    journal_id: entry.id,
                    sequence: entry.sequence,
                    date: entry.entry_date,
                    description: entry.description.clone(),
                    amount,
                    balance,
                });
            }
        }
        Ok(rows)
    }

    fn account_activity(&self, org_id: Uuid, account_id: Uuid, from: Date, to: Date) -> Result<Decimal, StorageError> {
        let orgs = self.orgs.read().unwrap();
        let org = org_ref(&orgs, org_id)?;
        let account = org
            .accounts
            .get(&account_id)
            .ok_or(StorageError::AccountNotFound(account_id))?;

        let mut total = Decimal::ZERO;
        for entry in org
            .journals
            .values()
            .filter(|j| !j.deleted && j.entry_date >= from && j.entry_date <= to)
        {
            for line in entry.lines.iter().filter(|l| l.account_id == account_id) {
                total += account.account_type.signed(line.side, line.amount);
            }
        }
        Ok(total)
    }

    fn create_import_rule(&self, org_id: Uuid, command: &CreateImportRuleCommand) -> Result<ImportRule, StorageError> {
        let mut orgs = self.orgs.write().unwrap();
        let org = org_mut(&mut orgs, org_id)?;
        if !org.accounts.contains_key(&command.account_id) {
            return Err(StorageError::AccountNotFound(command.account_id));
        }
        let rule = ImportRule {
            id: Uuid::new_v4(),
            org_id,
            keyword: command.keyword.clone(),
            account_id: command.account_id,
            partner_id: command.partner_id,
        };
        org.import_rules.push(rule.clone());
        Ok(rule)
    }

    fn list_import_rules(&self, org_id: Uuid) -> Result<Vec<ImportRule>, StorageError> {
        let orgs = self.orgs.read().unwrap();
        Ok(org_ref(&orgs, org_id)?.import_rules.clone())
    }

    fn delete_import_rule(&self, org_id: Uuid, rule_id: Uuid) -> Result<(), StorageError> {
        let mut orgs = self.orgs.write().unwrap();
        let org = org_mut(&mut orgs, org_id)?;
        let before = org.import_rules.len();
        org.import_rules.retain(|r| r.id != rule_id);
        if org.import_rules.len() == before {
            return Err(StorageError::ImportRuleNotFound(rule_id));
        }
        Ok(())
    }

    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let snapshot = Snapshot {
            orgs: self.orgs.read().unwrap().clone(),
            users: self.users.read().unwrap().clone(),
            sessions: self.sessions.read().unwrap().clone(),
            sequence_value: self.sequence_counter.load(Ordering::SeqCst),
        };
        self.snapshots.write().unwrap().insert(tx_id, snapshot);
        tracing::debug!(tx_id, "Transaction started");
        Ok(tx_id)
    }

    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        self.snapshots
            .write()
            .unwrap()
            .remove(&tx_id)
            .ok_or(StorageError::NoActiveTransaction)?;
        tracing::debug!(tx_id, "Transaction committed");
        Ok(())
    }

    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let snapshot = self
            .snapshots
            .write()
            .unwrap()
            .remove(&tx_id)
            .ok_or(StorageError::NoActiveTransaction)?;
        *self.orgs.write().unwrap() = snapshot.orgs;
        *self.users.write().unwrap() = snapshot.users;
        *self.sessions.write().unwrap() = snapshot.sessions;
        self.sequence_counter.store(snapshot.sequence_value, Ordering::SeqCst);
        tracing::debug!(tx_id, "Transaction rolled back");
        Ok(())
    }
}

/// Build a storage backend from config.
pub fn open_storage(config: &crate::config::StorageConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    match config.backend {
        crate::config::StorageBackendKind::Memory => Ok(Arc::new(InMemoryStorage::new())),
        crate::config::StorageBackendKind::Sqlite => {
            Ok(Arc::new(crate::sqlite_storage::SqliteStorage::new(&config.path)?))
        }
    }
}
