use std::str::FromStr;
use std::sync::Arc;

use csv::ReaderBuilder;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{macros::format_description, Date};
use uuid::Uuid;

use kicho_core::{
    CreateJournalCommand, ImportRule, JournalLineCommand, Side, ValidationError,
};

use crate::storage::{StorageBackend, StorageError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV file has no header row")]
    MissingHeader,
    #[error("could not detect a date column; specify a column mapping")]
    NoDateColumn,
    #[error("could not detect an amount column (or deposit/withdrawal pair); specify a column mapping")]
    NoAmountColumn,
    #[error("row {line}: no account assigned")]
    MissingAccount { line: usize },
    #[error("row {line}: duplicate of an already imported entry")]
    Duplicate { line: usize },
    #[error("row {line}: {message}")]
    BadRow { line: usize, message: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Column indices into the CSV, either supplied by the caller or
/// auto-detected from the header row. Exactly one of `amount` or the
/// `deposit`/`withdrawal` pair is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub date: usize,
    pub description: usize,
    #[serde(default)]
    pub amount: Option<usize>,
    #[serde(default)]
    pub deposit: Option<usize>,
    #[serde(default)]
    pub withdrawal: Option<usize>,
}

const DATE_HEADERS: &[&str] = &["日付", "取引日", "年月日", "利用日", "date"];
const DESCRIPTION_HEADERS: &[&str] = &["摘要", "内容", "取引内容", "利用店名", "description", "memo"];
const AMOUNT_HEADERS: &[&str] = &["金額", "取引金額", "利用金額", "amount"];
const DEPOSIT_HEADERS: &[&str] = &["入金", "入金額", "預入", "deposit", "credit"];
const WITHDRAWAL_HEADERS: &[&str] = &["出金", "出金額", "支払", "引出", "withdrawal", "debit"];

fn find_column(headers: &csv::StringRecord, candidates: &[&str]) -> Option<usize> {
    headers.iter().position(|h| {
        let h = h.trim().to_lowercase();
        candidates.iter().any(|c| h == *c || h.contains(*c))
    })
}

/// Detect column roles from header names. Japanese bank exports vary;
/// an exact synonym match is tried before a substring match by virtue
/// of the combined predicate above.
pub fn detect_columns(headers: &csv::StringRecord) -> Result<ColumnMapping, ImportError> {
    let date = find_column(headers, DATE_HEADERS).ok_or(ImportError::NoDateColumn)?;
    let description = find_column(headers, DESCRIPTION_HEADERS).unwrap_or(usize::MAX);
    let deposit = find_column(headers, DEPOSIT_HEADERS);
    let withdrawal = find_column(headers, WITHDRAWAL_HEADERS);
    let amount = find_column(headers, AMOUNT_HEADERS);

    if deposit.is_none() && withdrawal.is_none() && amount.is_none() {
        return Err(ImportError::NoAmountColumn);
    }
    // A deposit/withdrawal pair takes precedence over a generic amount
    // column; 金額 often appears alongside 入金/出金 as a balance-ish field.
    let mapping = if deposit.is_some() || withdrawal.is_some() {
        ColumnMapping {
            date,
            description,
            amount: None,
            deposit,
            withdrawal,
        }
    } else {
        ColumnMapping {
            date,
            description,
            amount,
            deposit: None,
            withdrawal: None,
        }
    };
    Ok(mapping)
}

/// Parse a statement date. Accepts 2024-04-01, 2024/04/01, 2024.04.01
/// and 20240401.
pub fn parse_date(s: &str) -> Option<Date> {
    let s = s.trim();
    let dashed = format_description!("[year]-[month]-[day]");
    let slashed = format_description!("[year]/[month]/[day]");
    let dotted = format_description!("[year].[month].[day]");
    let compact = format_description!("[year][month][day]");
    Date::parse(s, &dashed)
        .or_else(|_| Date::parse(s, &slashed))
        .or_else(|_| Date::parse(s, &dotted))
        .or_else(|_| Date::parse(s, &compact))
        .ok()
}

/// Parse a statement amount. Strips currency symbols, thousands
/// separators and whitespace, converts full-width digits, and treats a
/// leading ▲/△ as a negative marker.
pub fn parse_amount(s: &str) -> Option<Decimal> {
    let mut out = String::with_capacity(s.len());
    let mut negative = false;
    for c in s.trim().chars() {
        match c {
            '0'..='9' | '.' => out.push(c),
            '０'..='９' => out.push(char::from_u32('0' as u32 + (c as u32 - '０' as u32))?),
            '-' | '−' | '－' => negative = true,
            '▲' | '△' => negative = true,
            ',' | '，' | '¥' | '￥' | ' ' | '　' => {}
            _ => return None,
        }
    }
    if out.is_empty() {
        return None;
    }
    let value = Decimal::from_str(&out).ok()?;
    Some(if negative { -value } else { value })
}

/// One parsed statement row. `amount` is signed: deposits positive,
/// withdrawals negative.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatementRow {
    pub line: usize,
    pub date: Date,
    pub description: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedStatement {
    pub mapping: ColumnMapping,
    pub rows: Vec<StatementRow>,
    pub errors: Vec<RowError>,
}

fn cell<'a>(record: &'a csv::StringRecord, idx: usize) -> &'a str {
    record.get(idx).unwrap_or("")
}

/// Parse CSV text into statement rows. Bad rows are collected as
/// per-row errors instead of failing the whole file.
pub fn parse_statement(
    csv_text: &str,
    mapping: Option<ColumnMapping>,
) -> Result<ParsedStatement, ImportError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(csv_text.as_bytes());

    let headers = reader.headers().map_err(|_| ImportError::MissingHeader)?.clone();
    if headers.is_empty() {
        return Err(ImportError::MissingHeader);
    }
    let mapping = match mapping {
        Some(m) => m,
        None => detect_columns(&headers)?,
    };

    let mut rows = Vec::new();
    let mut errors = Vec::new();

    for (idx, record) in reader.records().enumerate() {
        let line = idx + 2; // 1-based, header on line 1
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                errors.push(RowError {
                    line,
                    message: format!("CSV parse error: {}", e),
                });
                continue;
            }
        };
        if record.iter().all(|c| c.trim().is_empty()) {
            continue;
        }

        let date = match parse_date(cell(&record, mapping.date)) {
            Some(d) => d,
            None => {
                errors.push(RowError {
                    line,
                    message: format!("Unparseable date: {:?}", cell(&record, mapping.date)),
                });
                continue;
            }
        };

        let amount = if let Some(col) = mapping.amount {
            parse_amount(cell(&record, col))
        } else {
            let deposit = mapping.deposit.and_then(|c| parse_amount(cell(&record, c)));
            let withdrawal = mapping.withdrawal.and_then(|c| parse_amount(cell(&record, c)));
            match (deposit, withdrawal) {
                (Some(d), _) if d != Decimal::ZERO => Some(d),
                (_, Some(w)) if w != Decimal::ZERO => Some(-w.abs()),
                (Some(_), _) | (_, Some(_)) => Some(Decimal::ZERO),
                (None, None) => None,
            }
        };
        let amount = match amount {
            Some(a) if a != Decimal::ZERO => a,
            Some(_) => {
                errors.push(RowError {
                    line,
                    message: "Zero amount".to_string(),
                });
                continue;
            }
            None => {
                errors.push(RowError {
                    line,
                    message: "Unparseable amount".to_string(),
                });
                continue;
            }
        };

        let description = if mapping.description == usize::MAX {
            String::new()
        } else {
            cell(&record, mapping.description).to_string()
        };

        rows.push(StatementRow {
            line,
            date,
            description,
            amount,
        });
    }

    Ok(ParsedStatement {
        mapping,
        rows,
        errors,
    })
}

/// Deduplication key for an imported row: date, signed amount, and the
/// whitespace-normalized description.
pub fn source_key(date: Date, amount: Decimal, description: &str) -> String {
    let normalized: Vec<&str> = description.split_whitespace().collect();
    format!(
        "{:04}-{:02}-{:02}|{}|{}",
        date.year(),
        date.month() as u8,
        date.day(),
        amount,
        normalized.join(" ")
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewRow {
    pub line: usize,
    pub date: Date,
    pub description: String,
    pub amount: Decimal,
    pub suggested_account_id: Option<Uuid>,
    pub suggested_partner_id: Option<Uuid>,
    pub matched_rule_id: Option<Uuid>,
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportPreview {
    pub mapping: ColumnMapping,
    pub rows: Vec<PreviewRow>,
    pub errors: Vec<RowError>,
}

fn suggest<'a>(rules: &'a [ImportRule], description: &str) -> Option<&'a ImportRule> {
    rules.iter().find(|r| r.matches(description))
}

/// Annotate parsed rows with account suggestions and duplicate flags.
/// No writes happen here.
pub fn build_preview(
    storage: &Arc<dyn StorageBackend>,
    org_id: Uuid,
    statement: ParsedStatement,
) -> Result<ImportPreview, ImportError> {
    let rules = storage.list_import_rules(org_id)?;
    let mut rows = Vec::with_capacity(statement.rows.len());
    for row in statement.rows {
        let rule = suggest(&rules, &row.description);
        let key = source_key(row.date, row.amount, &row.description);
        let duplicate = storage.source_key_exists(org_id, &key)?;
        rows.push(PreviewRow {
            line: row.line,
            date: row.date,
            description: row.description,
            amount: row.amount,
            suggested_account_id: rule.map(|r| r.account_id),
            suggested_partner_id: rule.and_then(|r| r.partner_id),
            matched_rule_id: rule.map(|r| r.id),
            duplicate,
        });
    }
    Ok(ImportPreview {
        mapping: statement.mapping,
        rows,
        errors: statement.errors,
    })
}

/// A row selected for commit, possibly corrected by the user after
/// preview.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommitRow {
    pub line: usize,
    pub date: Date,
    pub description: String,
    pub amount: Decimal,
    /// Counterpart account for the bank movement.
    #[serde(default)]
    pub account_id: Option<Uuid>,
    #[serde(default)]
    pub partner_id: Option<Uuid>,
    /// Leave this row out of the commit.
    #[serde(default)]
    pub skip: bool,
    /// Import even if the duplicate check matches.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportOutcome {
    pub created: usize,
    pub skipped: usize,
}

/// Post the selected rows as journal entries against the bank account,
/// all inside one storage transaction. Any bad row aborts the batch.
pub fn commit_import(
    storage: &Arc<dyn StorageBackend>,
    org_id: Uuid,
    bank_account_id: Uuid,
    rows: &[CommitRow],
) -> Result<ImportOutcome, ImportError> {
    let tx_id = storage.begin_transaction()?;
    match commit_rows(storage, org_id, bank_account_id, rows) {
        Ok(outcome) => {
            storage.commit_transaction(tx_id)?;
            metrics::counter!("kicho_import_rows_committed", outcome.created as u64);
            tracing::info!(
                org_id = %org_id,
                created = outcome.created,
                skipped = outcome.skipped,
                "Bank statement import committed"
            );
            Ok(outcome)
        }
        Err(e) => {
            storage.rollback_transaction(tx_id)?;
            Err(e)
        }
    }
}

fn commit_rows(
    storage: &Arc<dyn StorageBackend>,
    org_id: Uuid,
    bank_account_id: Uuid,
    rows: &[CommitRow],
) -> Result<ImportOutcome, ImportError> {
    let mut created = 0;
    let mut skipped = 0;

    for row in rows {
        if row.skip {
            skipped += 1;
            continue;
        }
        let counter_account = row
            .account_id
            .ok_or(ImportError::MissingAccount { line: row.line })?;
        let key = source_key(row.date, row.amount, &row.description);
        if !row.force && storage.source_key_exists(org_id, &key)? {
            return Err(ImportError::Duplicate { line: row.line });
        }
        if row.amount == Decimal::ZERO {
            return Err(ImportError::BadRow {
                line: row.line,
                message: "Zero amount".to_string(),
            });
        }

        let magnitude = row.amount.abs();
        // Deposit: money into the bank account. Withdrawal: out of it.
        let (bank_side, counter_side) = if row.amount > Decimal::ZERO {
            (Side::Debit, Side::Credit)
        } else {
            (Side::Credit, Side::Debit)
        };

        let command = CreateJournalCommand {
            entry_date: row.date,
            description: row.description.clone(),
            lines: vec![
                JournalLineCommand {
                    account_id: bank_account_id,
                    side: bank_side,
                    amount: magnitude,
                    partner_id: None,
                    memo: None,
                },
                JournalLineCommand {
                    account_id: counter_account,
                    side: counter_side,
                    amount: magnitude,
                    partner_id: row.partner_id,
                    memo: None,
                },
            ],
            source_key: Some(key),
        };
        command.validate()?;
        storage.create_journal(org_id, &command)?;
        created += 1;
    }

    Ok(ImportOutcome { created, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::date;

    #[test]
    fn test_detect_japanese_headers() {
        let headers = csv::StringRecord::from(vec!["取引日", "摘要", "出金額", "入金額", "残高"]);
        let mapping = detect_columns(&headers).unwrap();
        assert_eq!(mapping.date, 0);
        assert_eq!(mapping.description, 1);
        assert_eq!(mapping.withdrawal, Some(2));
        assert_eq!(mapping.deposit, Some(3));
        assert_eq!(mapping.amount, None);
    }

    #[test]
    fn test_detect_single_amount_column() {
        let headers = csv::StringRecord::from(vec!["date", "description", "amount"]);
        let mapping = detect_columns(&headers).unwrap();
        assert_eq!(mapping.amount, Some(2));
        assert_eq!(mapping.deposit, None);
    }

    #[test]
    fn test_no_amount_column_is_an_error() {
        let headers = csv::StringRecord::from(vec!["日付", "摘要", "残高"]);
        assert!(matches!(
            detect_columns(&headers),
            Err(ImportError::NoAmountColumn)
        ));
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = date!(2024 - 04 - 01);
        assert_eq!(parse_date("2024-04-01"), Some(expected));
        assert_eq!(parse_date("2024/04/01"), Some(expected));
        assert_eq!(parse_date("2024.04.01"), Some(expected));
        assert_eq!(parse_date("20240401"), Some(expected));
        assert_eq!(parse_date("April 1"), None);
    }

    #[test]
    fn test_parse_amount_normalization() {
        assert_eq!(parse_amount("1,234"), Some(dec!(1234)));
        assert_eq!(parse_amount("¥12,000"), Some(dec!(12000)));
        assert_eq!(parse_amount("１２３"), Some(dec!(123)));
        assert_eq!(parse_amount("-500"), Some(dec!(-500)));
        assert_eq!(parse_amount("▲3,000"), Some(dec!(-3000)));
        assert_eq!(parse_amount("abc"), None);
        assert_eq!(parse_amount(""), None);
    }

    #[test]
    fn test_parse_statement_with_deposit_withdrawal_pair() {
        let csv_text = "\
取引日,摘要,出金額,入金額,残高
2024/04/01,振込 タナカ商事,,30000,130000
2024/04/02,コンビニATM,5000,,125000
2024/04/03,badrow,,,125000
";
        let parsed = parse_statement(csv_text, None).unwrap();
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].amount, dec!(30000));
        assert_eq!(parsed.rows[0].description, "振込 タナカ商事");
        assert_eq!(parsed.rows[1].amount, dec!(-5000));
        assert_eq!(parsed.errors.len(), 1);
        assert_eq!(parsed.errors[0].line, 4);
    }

    #[test]
    fn test_source_key_normalizes_whitespace() {
        let a = source_key(date!(2024 - 04 - 01), dec!(1000), "振込  タナカ商事 ");
        let b = source_key(date!(2024 - 04 - 01), dec!(1000), "振込 タナカ商事");
        assert_eq!(a, b);
        let c = source_key(date!(2024 - 04 - 02), dec!(1000), "振込 タナカ商事");
        assert_ne!(a, c);
    }
}
