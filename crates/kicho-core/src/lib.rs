pub mod models;
pub mod storage;

pub use models::{
    read::{BalanceSheet, LedgerRow, ProfitLoss, ReportLine, ReportSection, TrialBalance, TrialBalanceRow},
    write::{
        CreateAccountCommand, CreateImportRuleCommand, CreateJournalCommand, CreatePartnerCommand,
        CreatePeriodCommand, CreateUserCommand, JournalLineCommand, UpdateAccountCommand,
        UpdatePartnerCommand, ValidationError,
    },
    Account, AccountType, AccountingPeriod, ImportRule, JournalEntry, JournalLine, Organization,
    Partner, PartnerKind, Role, Session, Side, User,
};
pub use storage::{StorageBackend, StorageError, TransactionId};
