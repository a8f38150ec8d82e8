use std::sync::Arc;

use rust_decimal::Decimal;
use time::Date;
use uuid::Uuid;

use kicho_core::{
    Account, AccountType, BalanceSheet, ProfitLoss, ReportLine, ReportSection, TrialBalance,
    TrialBalanceRow,
};

use crate::storage::{StorageBackend, StorageError};

/// Trial balance as of a date: every account with a nonzero balance,
/// placed in its normal-side column. Debit and credit totals are equal
/// whenever every stored entry passed the double-entry validation.
pub fn trial_balance(
    storage: &Arc<dyn StorageBackend>,
    org_id: Uuid,
    as_of: Date,
) -> Result<TrialBalance, StorageError> {
    let accounts = storage.list_accounts(org_id)?;
    let mut rows = Vec::new();
    let mut debit_total = Decimal::ZERO;
    let mut credit_total = Decimal::ZERO;

    for account in accounts {
        let balance = storage.account_balance(org_id, account.id, as_of)?;
        if balance == Decimal::ZERO {
            continue;
        }
        let (debit, credit) = if account.account_type.is_debit_normal() {
            (balance, Decimal::ZERO)
        } else {
            (Decimal::ZERO, balance)
        };
        debit_total += debit;
        credit_total += credit;
        rows.push(TrialBalanceRow {
            account_id: account.id,
            code: account.code,
            name: account.name,
            account_type: account.account_type,
            debit,
            credit,
        });
    }

    Ok(TrialBalance {
        as_of,
        rows,
        debit_total,
        credit_total,
    })
}

fn section(
    storage: &Arc<dyn StorageBackend>,
    org_id: Uuid,
    accounts: &[Account],
    account_type: AccountType,
    as_of: Date,
) -> Result<ReportSection, StorageError> {
    let mut lines = Vec::new();
    let mut total = Decimal::ZERO;
    for account in accounts.iter().filter(|a| a.account_type == account_type) {
        let balance = storage.account_balance(org_id, account.id, as_of)?;
        if balance == Decimal::ZERO {
            continue;
        }
        total += balance;
        lines.push(ReportLine {
            account_id: account.id,
            code: account.code.clone(),
            name: account.name.clone(),
            amount: balance,
        });
    }
    Ok(ReportSection { lines, total })
}

/// Balance sheet as of a date. Cumulative net income (revenue minus
/// expense) is folded into the equity side so the statement balances
/// without a formal closing entry.
pub fn balance_sheet(
    storage: &Arc<dyn StorageBackend>,
    org_id: Uuid,
    as_of: Date,
) -> Result<BalanceSheet, StorageError> {
    let accounts = storage.list_accounts(org_id)?;
    let assets = section(storage, org_id, &accounts, AccountType::Asset, as_of)?;
    let liabilities = section(storage, org_id, &accounts, AccountType::Liability, as_of)?;
    let equity = section(storage, org_id, &accounts, AccountType::Equity, as_of)?;
    let revenue = section(storage, org_id, &accounts, AccountType::Revenue, as_of)?;
    let expense = section(storage, org_id, &accounts, AccountType::Expense, as_of)?;

    let net_income = revenue.total - expense.total;
    let total_assets = assets.total;
    let total_liabilities_and_equity = liabilities.total + equity.total + net_income;

    Ok(BalanceSheet {
        as_of,
        assets,
        liabilities,
        equity,
        net_income,
        total_assets,
        total_liabilities_and_equity,
    })
}

/// Profit and loss statement over a date range, from per-account
/// activity rather than cumulative balances.
pub fn profit_loss(
    storage: &Arc<dyn StorageBackend>,
    org_id: Uuid,
    from: Date,
    to: Date,
) -> Result<ProfitLoss, StorageError> {
    let accounts = storage.list_accounts(org_id)?;

    let mut build = |account_type: AccountType| -> Result<ReportSection, StorageError> {
        let mut lines = Vec::new();
        let mut total = Decimal::ZERO;
        for account in accounts.iter().filter(|a| a.account_type == account_type) {
            let amount = storage.account_activity(org_id, account.id, from, to)?;
            if amount == Decimal::ZERO {
                continue;
            }
            total += amount;
            lines.push(ReportLine {
                account_id: account.id,
                code: account.code.clone(),
                name: account.name.clone(),
                amount,
            });
        }
        Ok(ReportSection { lines, total })
    };

    let revenues = build(AccountType::Revenue)?;
    let expenses = build(AccountType::Expense)?;
    let net_income = revenues.total - expenses.total;

    Ok(ProfitLoss {
        from,
        to,
        revenues,
        expenses,
        net_income,
    })
}
