use std::ops::Bound;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use time::macros::date;
use uuid::Uuid;

use kicho::import;
use kicho::reports;
use kicho::storage::{InMemoryStorage, StorageBackend, StorageError};
use kicho_core::{
    AccountType, CreateAccountCommand, CreateImportRuleCommand, CreateJournalCommand,
    CreatePeriodCommand, CreateUserCommand, JournalLineCommand, Role, Side,
};

fn setup() -> (Arc<dyn StorageBackend>, Uuid, Uuid) {
    let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
    let owner = storage
        .create_user(&CreateUserCommand {
            email: "owner@example.jp".to_string(),
            display_name: "経理担当".to_string(),
            password_hash: "test-hash".to_string(),
        })
        .expect("Failed to create user");
    let org = storage
        .create_organization("株式会社テスト商事", owner.id)
        .expect("Failed to create organization");
    (storage, org.id, owner.id)
}

fn account(
    storage: &Arc<dyn StorageBackend>,
    org: Uuid,
    code: &str,
    name: &str,
    account_type: AccountType,
) -> Uuid {
    storage
        .create_account(
            org,
            &CreateAccountCommand {
                code: code.to_string(),
                name: name.to_string(),
                account_type,
                parent_id: None,
            },
        )
        .expect("Failed to create account")
        .id
}

fn journal(
    storage: &Arc<dyn StorageBackend>,
    org: Uuid,
    entry_date: time::Date,
    description: &str,
    debit: Uuid,
    credit: Uuid,
    amount: Decimal,
) -> Uuid {
    let command = CreateJournalCommand {
        entry_date,
        description: description.to_string(),
        lines: vec![
            JournalLineCommand {
                account_id: debit,
                side: Side::Debit,
                amount,
                partner_id: None,
                memo: None,
            },
            JournalLineCommand {
                account_id: credit,
                side: Side::Credit,
                amount,
                partner_id: None,
                memo: None,
            },
        ],
        source_key: None,
    };
    command.validate().expect("Journal should balance");
    storage
        .create_journal(org, &command)
        .expect("Failed to post journal entry")
        .id
}

#[test]
fn test_bootstrap_chart_and_post_entries() {
    let (storage, org, _) = setup();
    let bank = account(&storage, org, "1110", "普通預金", AccountType::Asset);
    let capital = account(&storage, org, "3110", "資本金", AccountType::Equity);
    let sales = account(&storage, org, "4110", "売上高", AccountType::Revenue);

    journal(&storage, org, date!(2024 - 04 - 01), "会社設立 出資金", bank, capital, dec!(1000000));
    journal(&storage, org, date!(2024 - 04 - 15), "売上入金", bank, sales, dec!(220000));

    let entries = storage
        .list_journals(org, Bound::Unbounded, Bound::Unbounded)
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].sequence, 1);
    assert_eq!(entries[1].sequence, 2);

    let balance = storage
        .account_balance(org, bank, date!(2024 - 12 - 31))
        .unwrap();
    assert_eq!(balance, dec!(1220000));
}

#[test]
fn test_sequence_survives_deletion() {
    let (storage, org, _) = setup();
    let bank = account(&storage, org, "1110", "普通預金", AccountType::Asset);
    let sales = account(&storage, org, "4110", "売上高", AccountType::Revenue);

    let first = journal(&storage, org, date!(2024 - 05 - 01), "売上", bank, sales, dec!(100));
    storage.delete_journal(org, first).unwrap();
    journal(&storage, org, date!(2024 - 05 - 02), "売上", bank, sales, dec!(200));

    let entries = storage
        .list_journals(org, Bound::Unbounded, Bound::Unbounded)
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].sequence, 2);
}

#[test]
fn test_trial_balance_balances() {
    let (storage, org, _) = setup();
    let bank = account(&storage, org, "1110", "普通預金", AccountType::Asset);
    let capital = account(&storage, org, "3110", "資本金", AccountType::Equity);
    let sales = account(&storage, org, "4110", "売上高", AccountType::Revenue);
    let rent = account(&storage, org, "5210", "地代家賃", AccountType::Expense);

    journal(&storage, org, date!(2024 - 04 - 01), "出資", bank, capital, dec!(500000));
    journal(&storage, org, date!(2024 - 04 - 10), "売上", bank, sales, dec!(150000));
    journal(&storage, org, date!(2024 - 04 - 25), "家賃支払", rent, bank, dec!(80000));

    let tb = reports::trial_balance(&storage, org, date!(2024 - 04 - 30)).unwrap();
    assert_eq!(tb.debit_total, tb.credit_total);
    assert_eq!(tb.debit_total, dec!(650000));

    let bank_row = tb.rows.iter().find(|r| r.account_id == bank).unwrap();
    assert_eq!(bank_row.debit, dec!(570000));
    assert_eq!(bank_row.credit, Decimal::ZERO);
}

#[test]
fn test_balance_sheet_includes_net_income() {
    let (storage, org, _) = setup();
    let bank = account(&storage, org, "1110", "普通預金", AccountType::Asset);
    let capital = account(&storage, org, "3110", "資本金", AccountType::Equity);
    let sales = account(&storage, org, "4110", "売上高", AccountType::Revenue);
    let rent = account(&storage, org, "5210", "地代家賃", AccountType::Expense);

    journal(&storage, org, date!(2024 - 04 - 01), "出資", bank, capital, dec!(500000));
    journal(&storage, org, date!(2024 - 04 - 10), "売上", bank, sales, dec!(150000));
    journal(&storage, org, date!(2024 - 04 - 25), "家賃", rent, bank, dec!(80000));

    let bs = reports::balance_sheet(&storage, org, date!(2024 - 04 - 30)).unwrap();
    assert_eq!(bs.assets.total, dec!(570000));
    assert_eq!(bs.net_income, dec!(70000));
    assert_eq!(bs.assets.total, bs.liabilities.total + bs.equity.total + bs.net_income);
}

#[test]
fn test_profit_loss_is_range_scoped() {
    let (storage, org, _) = setup();
    let bank = account(&storage, org, "1110", "普通預金", AccountType::Asset);
    let sales = account(&storage, org, "4110", "売上高", AccountType::Revenue);

    journal(&storage, org, date!(2024 - 03 - 31), "前期売上", bank, sales, dec!(999));
    journal(&storage, org, date!(2024 - 04 - 10), "当期売上", bank, sales, dec!(150000));

    let pl = reports::profit_loss(&storage, org, date!(2024 - 04 - 01), date!(2025 - 03 - 31))
        .unwrap();
    assert_eq!(pl.revenues.total, dec!(150000));
    assert_eq!(pl.net_income, dec!(150000));
}

#[test]
fn test_ledger_running_balance() {
    let (storage, org, _) = setup();
    let bank = account(&storage, org, "1110", "普通預金", AccountType::Asset);
    let capital = account(&storage, org, "3110", "資本金", AccountType::Equity);
    let rent = account(&storage, org, "5210", "地代家賃", AccountType::Expense);

    journal(&storage, org, date!(2024 - 04 - 01), "出資", bank, capital, dec!(500000));
    journal(&storage, org, date!(2024 - 04 - 25), "家賃", rent, bank, dec!(80000));

    // Range starting after the opening entry carries it as an opening balance.
    let rows = storage
        .account_ledger(org, bank, Bound::Included(date!(2024 - 04 - 10)), Bound::Unbounded)
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].amount, dec!(-80000));
    assert_eq!(rows[0].balance, dec!(420000));
}

#[test]
fn test_closed_period_lookup() {
    let (storage, org, _) = setup();
    let period = storage
        .create_period(
            org,
            &CreatePeriodCommand {
                name: "2024年度".to_string(),
                start_date: date!(2024 - 04 - 01),
                end_date: date!(2025 - 03 - 31),
            },
        )
        .unwrap();
    storage.set_period_closed(org, period.id, true).unwrap();

    let found = storage
        .period_containing(org, date!(2024 - 06 - 15))
        .unwrap()
        .unwrap();
    assert!(found.closed);
    assert!(storage
        .period_containing(org, date!(2023 - 06 - 15))
        .unwrap()
        .is_none());
}

#[test]
fn test_period_overlap_rejected() {
    let (storage, org, _) = setup();
    storage
        .create_period(
            org,
            &CreatePeriodCommand {
                name: "2024年度".to_string(),
                start_date: date!(2024 - 04 - 01),
                end_date: date!(2025 - 03 - 31),
            },
        )
        .unwrap();
    let result = storage.create_period(
        org,
        &CreatePeriodCommand {
            name: "重複".to_string(),
            start_date: date!(2025 - 01 - 01),
            end_date: date!(2025 - 12 - 31),
        },
    );
    assert!(matches!(result, Err(StorageError::PeriodOverlap)));
}

#[test]
fn test_membership_roles_ordered() {
    let (storage, org, owner) = setup();
    assert_eq!(storage.member_role(org, owner).unwrap(), Some(Role::Owner));

    let viewer = storage
        .create_user(&CreateUserCommand {
            email: "viewer@example.jp".to_string(),
            display_name: "閲覧者".to_string(),
            password_hash: "test-hash".to_string(),
        })
        .unwrap();
    storage.upsert_member(org, viewer.id, Role::Viewer).unwrap();

    let role = storage.member_role(org, viewer.id).unwrap().unwrap();
    assert!(role < Role::Member);
    assert!(Role::Admin < Role::Owner);

    // The only owner cannot be demoted or removed.
    assert!(matches!(
        storage.upsert_member(org, owner, Role::Member),
        Err(StorageError::LastOwner)
    ));
    assert!(matches!(
        storage.remove_member(org, owner),
        Err(StorageError::LastOwner)
    ));
}

#[test]
fn test_org_isolation() {
    let (storage, org_a, owner) = setup();
    let org_b = storage.create_organization("別会社", owner).unwrap().id;

    let bank_a = account(&storage, org_a, "1110", "普通預金", AccountType::Asset);
    assert!(storage.get_account(org_b, bank_a).is_err());
    assert!(storage.list_accounts(org_b).unwrap().is_empty());
}

#[test]
fn test_import_preview_and_commit() {
    let (storage, org, _) = setup();
    let bank = account(&storage, org, "1110", "普通預金", AccountType::Asset);
    let sales = account(&storage, org, "4110", "売上高", AccountType::Revenue);
    let fees = account(&storage, org, "5310", "支払手数料", AccountType::Expense);

    storage
        .create_import_rule(
            org,
            &CreateImportRuleCommand {
                keyword: "振込手数料".to_string(),
                account_id: fees,
                partner_id: None,
            },
        )
        .unwrap();

    let csv = "\
日付,摘要,入金額,出金額
2024/04/10,売上入金 A商事,220000,
2024/04/10,振込手数料,,440
";
    let statement = import::parse_statement(csv, None).unwrap();
    assert_eq!(statement.rows.len(), 2);
    assert!(statement.errors.is_empty());

    let preview = import::build_preview(&storage, org, statement).unwrap();
    assert_eq!(preview.rows[1].suggested_account_id, Some(fees));
    assert!(preview.rows.iter().all(|r| !r.duplicate));

    let rows: Vec<import::CommitRow> = preview
        .rows
        .iter()
        .map(|r| import::CommitRow {
            line: r.line,
            date: r.date,
            description: r.description.clone(),
            amount: r.amount,
            account_id: r.suggested_account_id.or(Some(sales)),
            partner_id: r.suggested_partner_id,
            skip: false,
            force: false,
        })
        .collect();

    let outcome = import::commit_import(&storage, org, bank, &rows).unwrap();
    assert_eq!(outcome.created, 2);
    assert_eq!(outcome.skipped, 0);

    // Deposit debits the bank, withdrawal credits it.
    let balance = storage.account_balance(org, bank, date!(2024 - 04 - 30)).unwrap();
    assert_eq!(balance, dec!(219560));

    // Re-running the same statement flags every row as a duplicate.
    let again = import::parse_statement(csv, None).unwrap();
    let preview = import::build_preview(&storage, org, again).unwrap();
    assert!(preview.rows.iter().all(|r| r.duplicate));
}

#[test]
fn test_import_commit_rolls_back_on_bad_row() {
    let (storage, org, _) = setup();
    let bank = account(&storage, org, "1110", "普通預金", AccountType::Asset);
    let sales = account(&storage, org, "4110", "売上高", AccountType::Revenue);

    let rows = vec![
        import::CommitRow {
            line: 2,
            date: date!(2024 - 04 - 10),
            description: "売上入金".to_string(),
            amount: dec!(100000),
            account_id: Some(sales),
            partner_id: None,
            skip: false,
            force: false,
        },
        import::CommitRow {
            line: 3,
            date: date!(2024 - 04 - 11),
            description: "相手科目なし".to_string(),
            amount: dec!(5000),
            account_id: None,
            partner_id: None,
            skip: false,
            force: false,
        },
    ];

    let result = import::commit_import(&storage, org, bank, &rows);
    assert!(result.is_err());

    // Nothing from the batch survives the rollback.
    let entries = storage
        .list_journals(org, Bound::Unbounded, Bound::Unbounded)
        .unwrap();
    assert!(entries.is_empty());
}

#[test]
fn test_import_duplicate_needs_force() {
    let (storage, org, _) = setup();
    let bank = account(&storage, org, "1110", "普通預金", AccountType::Asset);
    let sales = account(&storage, org, "4110", "売上高", AccountType::Revenue);

    let row = import::CommitRow {
        line: 2,
        date: date!(2024 - 04 - 10),
        description: "売上入金".to_string(),
        amount: dec!(100000),
        account_id: Some(sales),
        partner_id: None,
        skip: false,
        force: false,
    };

    import::commit_import(&storage, org, bank, std::slice::from_ref(&row)).unwrap();

    let result = import::commit_import(&storage, org, bank, std::slice::from_ref(&row));
    assert!(matches!(result, Err(import::ImportError::Duplicate { .. })));

    let forced = import::CommitRow { force: true, ..row };
    let outcome = import::commit_import(&storage, org, bank, &[forced]).unwrap();
    assert_eq!(outcome.created, 1);
}

#[test]
fn test_unbalanced_journal_rejected_by_validation() {
    let command = CreateJournalCommand {
        entry_date: date!(2024 - 04 - 01),
        description: "片側だけ".to_string(),
        lines: vec![
            JournalLineCommand {
                account_id: Uuid::new_v4(),
                side: Side::Debit,
                amount: dec!(100),
                partner_id: None,
                memo: None,
            },
            JournalLineCommand {
                account_id: Uuid::new_v4(),
                side: Side::Credit,
                amount: dec!(90),
                partner_id: None,
                memo: None,
            },
        ],
        source_key: None,
    };
    assert!(command.validate().is_err());
}
