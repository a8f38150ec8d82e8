use std::ops::Bound;

use rust_decimal::Decimal;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::models::{
    read::LedgerRow,
    write::{
        CreateAccountCommand, CreateImportRuleCommand, CreateJournalCommand, CreatePartnerCommand,
        CreatePeriodCommand, CreateUserCommand, UpdateAccountCommand, UpdatePartnerCommand,
    },
    Account, AccountingPeriod, ImportRule, JournalEntry, Organization, Partner, Role, Session,
    User,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
    #[error("organization not found: {0}")]
    OrganizationNotFound(Uuid),
    #[error("account not found: {0}")]
    AccountNotFound(Uuid),
    #[error("account is inactive: {0}")]
    AccountInactive(Uuid),
    #[error("partner not found: {0}")]
    PartnerNotFound(Uuid),
    #[error("accounting period not found: {0}")]
    PeriodNotFound(Uuid),
    #[error("journal entry not found: {0}")]
    JournalNotFound(Uuid),
    #[error("user not found: {0}")]
    UserNotFound(Uuid),
    #[error("import rule not found: {0}")]
    ImportRuleNotFound(Uuid),
    #[error("duplicate account code: {0}")]
    DuplicateAccountCode(String),
    #[error("duplicate partner code: {0}")]
    DuplicatePartnerCode(String),
    #[error("email already registered: {0}")]
    DuplicateEmail(String),
    #[error("accounting period overlaps an existing period")]
    PeriodOverlap,
    #[error("accounting period containing {0} is closed")]
    PeriodClosed(Date),
    #[error("organization must keep at least one owner")]
    LastOwner,
    #[error("no active transaction")]
    NoActiveTransaction,
}

pub type TransactionId = u64;

/// Storage backend for the bookkeeping service. All ledger data is
/// scoped to an organization; users and sessions are global.
pub trait StorageBackend: Send + Sync {
    // Users and sessions
    fn create_user(&self, command: &CreateUserCommand) -> Result<User, StorageError>;
    fn get_user(&self, user_id: Uuid) -> Result<User, StorageError>;
    fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StorageError>;
    fn insert_session(&self, session: &Session) -> Result<(), StorageError>;
    /// Look up a session by token. Implementations compare tokens in
    /// constant time and never return expired sessions.
    fn find_session(&self, token: &str, now: OffsetDateTime) -> Result<Option<Session>, StorageError>;
    fn delete_session(&self, token: &str) -> Result<(), StorageError>;
    fn purge_expired_sessions(&self, now: OffsetDateTime) -> Result<usize, StorageError>;

    // Organizations and membership
    fn create_organization(&self, name: &str, owner: Uuid) -> Result<Organization, StorageError>;
    fn get_organization(&self, org_id: Uuid) -> Result<Organization, StorageError>;
    fn list_organizations_for_user(&self, user_id: Uuid) -> Result<Vec<(Organization, Role)>, StorageError>;
    fn upsert_member(&self, org_id: Uuid, user_id: Uuid, role: Role) -> Result<(), StorageError>;
    fn remove_member(&self, org_id: Uuid, user_id: Uuid) -> Result<(), StorageError>;
    fn member_role(&self, org_id: Uuid, user_id: Uuid) -> Result<Option<Role>, StorageError>;
    fn list_members(&self, org_id: Uuid) -> Result<Vec<(User, Role)>, StorageError>;

    // Chart of accounts
    fn create_account(&self, org_id: Uuid, command: &CreateAccountCommand) -> Result<Account, StorageError>;
    fn update_account(&self, org_id: Uuid, account_id: Uuid, command: &UpdateAccountCommand) -> Result<Account, StorageError>;
    fn get_account(&self, org_id: Uuid, account_id: Uuid) -> Result<Account, StorageError>;
    fn list_accounts(&self, org_id: Uuid) -> Result<Vec<Account>, StorageError>;
    fn deactivate_account(&self, org_id: Uuid, account_id: Uuid) -> Result<(), StorageError>;

    // Partners
    fn create_partner(&self, org_id: Uuid, command: &CreatePartnerCommand) -> Result<Partner, StorageError>;
    fn update_partner(&self, org_id: Uuid, partner_id: Uuid, command: &UpdatePartnerCommand) -> Result<Partner, StorageError>;
    fn get_partner(&self, org_id: Uuid, partner_id: Uuid) -> Result<Partner, StorageError>;
    fn list_partners(&self, org_id: Uuid) -> Result<Vec<Partner>, StorageError>;
    fn deactivate_partner(&self, org_id: Uuid, partner_id: Uuid) -> Result<(), StorageError>;

    // Accounting periods
    fn create_period(&self, org_id: Uuid, command: &CreatePeriodCommand) -> Result<AccountingPeriod, StorageError>;
    fn list_periods(&self, org_id: Uuid) -> Result<Vec<AccountingPeriod>, StorageError>;
    fn set_period_closed(&self, org_id: Uuid, period_id: Uuid, closed: bool) -> Result<AccountingPeriod, StorageError>;
    fn period_containing(&self, org_id: Uuid, date: Date) -> Result<Option<AccountingPeriod>, StorageError>;

    // Journal entries
    fn create_journal(&self, org_id: Uuid, command: &CreateJournalCommand) -> Result<JournalEntry, StorageError>;
    fn update_journal(&self, org_id: Uuid, journal_id: Uuid, command: &CreateJournalCommand) -> Result<JournalEntry, StorageError>;
    fn delete_journal(&self, org_id: Uuid, journal_id: Uuid) -> Result<(), StorageError>;
    fn get_journal(&self, org_id: Uuid, journal_id: Uuid) -> Result<JournalEntry, StorageError>;
    fn list_journals(&self, org_id: Uuid, from: Bound<Date>, to: Bound<Date>) -> Result<Vec<JournalEntry>, StorageError>;
    fn source_key_exists(&self, org_id: Uuid, source_key: &str) -> Result<bool, StorageError>;

    // Reporting primitives. Balances and ledger amounts are signed in
    // the account's normal-side convention.
    fn account_balance(&self, org_id: Uuid, account_id: Uuid, as_of: Date) -> Result<Decimal, StorageError>;
    fn account_ledger(&self, org_id: Uuid, account_id: Uuid, from: Bound<Date>, to: Bound<Date>) -> Result<Vec<LedgerRow>, StorageError>;
    fn account_activity(&self, org_id: Uuid, account_id: Uuid, from: Date, to: Date) -> Result<Decimal, StorageError>;

    // Import rules
    fn create_import_rule(&self, org_id: Uuid, command: &CreateImportRuleCommand) -> Result<ImportRule, StorageError>;
    fn list_import_rules(&self, org_id: Uuid) -> Result<Vec<ImportRule>, StorageError>;
    fn delete_import_rule(&self, org_id: Uuid, rule_id: Uuid) -> Result<(), StorageError>;

    fn begin_transaction(&self) -> Result<TransactionId, StorageError>;
    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError>;
    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError>;
}
