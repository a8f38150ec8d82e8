use rust_decimal::Decimal;
use serde::Serialize;
use time::Date;
use uuid::Uuid;

use super::AccountType;

/// One ledger line with the running balance after it, in the account's
/// normal-side sign convention.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerRow {
    pub journal_id: Uuid,
    pub sequence: u64,
    pub date: Date,
    pub description: String,
    pub amount: Decimal,
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialBalanceRow {
    pub account_id: Uuid,
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    pub debit: Decimal,
    pub credit: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialBalance {
    pub as_of: Date,
    pub rows: Vec<TrialBalanceRow>,
    pub debit_total: Decimal,
    pub credit_total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportLine {
    pub account_id: Uuid,
    pub code: String,
    pub name: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSection {
    pub lines: Vec<ReportLine>,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceSheet {
    pub as_of: Date,
    pub assets: ReportSection,
    pub liabilities: ReportSection,
    pub equity: ReportSection,
    /// Revenue minus expense cumulative to `as_of`, shown inside equity
    /// so the statement balances.
    pub net_income: Decimal,
    pub total_assets: Decimal,
    pub total_liabilities_and_equity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfitLoss {
    pub from: Date,
    pub to: Date,
    pub revenues: ReportSection,
    pub expenses: ReportSection,
    pub net_income: Decimal,
}
