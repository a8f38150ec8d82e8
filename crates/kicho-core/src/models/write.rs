use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::Date;
use uuid::Uuid;

use super::{AccountType, PartnerKind, Side};

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("journal entry must have at least two lines")]
    TooFewLines,
    #[error("line amounts must be positive")]
    NonPositiveAmount,
    #[error("debits ({debit}) do not equal credits ({credit})")]
    Unbalanced { debit: Decimal, credit: Decimal },
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("period start date is after its end date")]
    InvertedPeriod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateUserCommand {
    pub email: String,
    pub display_name: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAccountCommand {
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

impl CreateAccountCommand {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.code.trim().is_empty() {
            return Err(ValidationError::EmptyField("account code"));
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyField("account name"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateAccountCommand {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePartnerCommand {
    pub code: String,
    pub name: String,
    pub kind: PartnerKind,
}

impl CreatePartnerCommand {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.code.trim().is_empty() {
            return Err(ValidationError::EmptyField("partner code"));
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyField("partner name"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePartnerCommand {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: Option<PartnerKind>,
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePeriodCommand {
    pub name: String,
    pub start_date: Date,
    pub end_date: Date,
}

impl CreatePeriodCommand {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyField("period name"));
        }
        if self.start_date > self.end_date {
            return Err(ValidationError::InvertedPeriod);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalLineCommand {
    pub account_id: Uuid,
    pub side: Side,
    pub amount: Decimal,
    #[serde(default)]
    pub partner_id: Option<Uuid>,
    #[serde(default)]
    pub memo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateJournalCommand {
    pub entry_date: Date,
    pub description: String,
    pub lines: Vec<JournalLineCommand>,
    #[serde(default)]
    pub source_key: Option<String>,
}

impl CreateJournalCommand {
    /// Double-entry invariants: two or more lines, positive amounts,
    /// debit total equal to credit total.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.lines.len() < 2 {
            return Err(ValidationError::TooFewLines);
        }
        if self.lines.iter().any(|l| l.amount <= Decimal::ZERO) {
            return Err(ValidationError::NonPositiveAmount);
        }
        let debit: Decimal = self
            .lines
            .iter()
            .filter(|l| l.side == Side::Debit)
            .map(|l| l.amount)
            .sum();
        let credit: Decimal = self
            .lines
            .iter()
            .filter(|l| l.side == Side::Credit)
            .map(|l| l.amount)
            .sum();
        if debit != credit {
            return Err(ValidationError::Unbalanced { debit, credit });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateImportRuleCommand {
    pub keyword: String,
    pub account_id: Uuid,
    #[serde(default)]
    pub partner_id: Option<Uuid>,
}

impl CreateImportRuleCommand {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.keyword.trim().is_empty() {
            return Err(ValidationError::EmptyField("rule keyword"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::date;

    fn line(side: Side, amount: Decimal) -> JournalLineCommand {
        JournalLineCommand {
            account_id: Uuid::new_v4(),
            side,
            amount,
            partner_id: None,
            memo: None,
        }
    }

    #[test]
    fn balanced_journal_validates() {
        let cmd = CreateJournalCommand {
            entry_date: date!(2024 - 04 - 01),
            description: "売上".to_string(),
            lines: vec![line(Side::Debit, dec!(10000)), line(Side::Credit, dec!(10000))],
            source_key: None,
        };
        assert!(cmd.validate().is_ok());
    }

    #[test]
    fn unbalanced_journal_rejected() {
        let cmd = CreateJournalCommand {
            entry_date: date!(2024 - 04 - 01),
            description: "test".to_string(),
            lines: vec![line(Side::Debit, dec!(10000)), line(Side::Credit, dec!(9000))],
            source_key: None,
        };
        assert_eq!(
            cmd.validate(),
            Err(ValidationError::Unbalanced {
                debit: dec!(10000),
                credit: dec!(9000),
            })
        );
    }

    #[test]
    fn single_line_rejected() {
        let cmd = CreateJournalCommand {
            entry_date: date!(2024 - 04 - 01),
            description: "test".to_string(),
            lines: vec![line(Side::Debit, dec!(100))],
            source_key: None,
        };
        assert_eq!(cmd.validate(), Err(ValidationError::TooFewLines));
    }

    #[test]
    fn zero_amount_rejected() {
        let cmd = CreateJournalCommand {
            entry_date: date!(2024 - 04 - 01),
            description: "test".to_string(),
            lines: vec![line(Side::Debit, dec!(0)), line(Side::Credit, dec!(0))],
            source_key: None,
        };
        assert_eq!(cmd.validate(), Err(ValidationError::NonPositiveAmount));
    }

    #[test]
    fn inverted_period_rejected() {
        let cmd = CreatePeriodCommand {
            name: "FY2024".to_string(),
            start_date: date!(2025 - 03 - 31),
            end_date: date!(2024 - 04 - 01),
        };
        assert_eq!(cmd.validate(), Err(ValidationError::InvertedPeriod));
    }
}
