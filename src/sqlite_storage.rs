use std::{
    ops::Bound,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use subtle::ConstantTimeEq;
use time::{Date, Month, OffsetDateTime};
use uuid::Uuid;

use kicho_core::{
    Account, AccountType, AccountingPeriod, CreateAccountCommand, CreateImportRuleCommand,
    CreateJournalCommand, CreatePartnerCommand, CreatePeriodCommand, CreateUserCommand,
    ImportRule, JournalEntry, JournalLine, LedgerRow, Organization, Partner, PartnerKind, Role,
    Session, Side, User,
};

use crate::storage::{StorageBackend, StorageError, TransactionId};

pub struct SqliteStorage {
    conn: Mutex<Connection>,
    tx_counter: AtomicU64,
    active_tx: Mutex<Option<TransactionId>>,
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(other)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(other)?;

        let storage = Self {
            conn: Mutex::new(conn),
            tx_counter: AtomicU64::new(1),
            active_tx: Mutex::new(None),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS organizations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS members (
                org_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                PRIMARY KEY (org_id, user_id),
                FOREIGN KEY (org_id) REFERENCES organizations(id),
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                code TEXT NOT NULL,
                name TEXT NOT NULL,
                account_type TEXT NOT NULL,
                parent_id TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                UNIQUE (org_id, code),
                FOREIGN KEY (org_id) REFERENCES organizations(id)
            );

            CREATE TABLE IF NOT EXISTS partners (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                code TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                UNIQUE (org_id, code),
                FOREIGN KEY (org_id) REFERENCES organizations(id)
            );

            CREATE TABLE IF NOT EXISTS periods (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                name TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                closed INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (org_id) REFERENCES organizations(id)
            );

            CREATE TABLE IF NOT EXISTS journals (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                entry_date TEXT NOT NULL,
                description TEXT NOT NULL,
                source_key TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (org_id) REFERENCES organizations(id)
            );

            CREATE TABLE IF NOT EXISTS journal_lines (
                id TEXT PRIMARY KEY,
                journal_id TEXT NOT NULL,
                line_no INTEGER NOT NULL,
                account_id TEXT NOT NULL,
                side TEXT NOT NULL,
                amount TEXT NOT NULL,
                signed_amount TEXT NOT NULL,
                partner_id TEXT,
                memo TEXT,
                FOREIGN KEY (journal_id) REFERENCES journals(id),
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            );

            CREATE TABLE IF NOT EXISTS import_rules (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                keyword TEXT NOT NULL,
                account_id TEXT NOT NULL,
                partner_id TEXT,
                FOREIGN KEY (org_id) REFERENCES organizations(id),
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            );

            CREATE INDEX IF NOT EXISTS idx_journals_org_date
                ON journals(org_id, entry_date);

            CREATE INDEX IF NOT EXISTS idx_journals_source_key
                ON journals(org_id, source_key);

            CREATE INDEX IF NOT EXISTS idx_lines_journal
                ON journal_lines(journal_id);

            CREATE INDEX IF NOT EXISTS idx_lines_account
                ON journal_lines(account_id);

            CREATE TABLE IF NOT EXISTS sequence_counter (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                value INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO sequence_counter (id, value) VALUES (1, 0);
            ",
        )
        .map_err(other)?;
        Ok(())
    }

    fn next_sequence(conn: &Connection) -> Result<u64, StorageError> {
        conn.execute(
            "UPDATE sequence_counter SET value = value + 1 WHERE id = 1",
            [],
        )
        .map_err(other)?;
        let seq: u64 = conn
            .query_row("SELECT value FROM sequence_counter WHERE id = 1", [], |r| {
                r.get(0)
            })
            .map_err(other)?;
        Ok(seq)
    }

    fn ensure_org(conn: &Connection, org_id: Uuid) -> Result<(), StorageError> {
        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM organizations WHERE id = ?1",
                params![org_id.to_string()],
                |row| row.get(0),
            )
            .map_err(other)?;
        if !exists {
            return Err(StorageError::OrganizationNotFound(org_id));
        }
        Ok(())
    }

    fn account_row(conn: &Connection, org_id: Uuid, account_id: Uuid) -> Result<Account, StorageError> {
        conn.query_row(
            "SELECT id, org_id, code, name, account_type, parent_id, active, created_at
             FROM accounts WHERE org_id = ?1 AND id = ?2",
            params![org_id.to_string(), account_id.to_string()],
            map_account,
        )
        .optional()
        .map_err(other)?
        .ok_or(StorageError::AccountNotFound(account_id))
    }

    /// Insert journal lines for an already-inserted journal row. The
    /// stored signed_amount follows the account's normal-side sign.
    fn insert_lines(
        conn: &Connection,
        org_id: Uuid,
        journal_id: Uuid,
        command: &CreateJournalCommand,
    ) -> Result<Vec<JournalLine>, StorageError> {
        let mut lines = Vec::with_capacity(command.lines.len());
        for (line_no, line) in command.lines.iter().enumerate() {
            let account = Self::account_row(conn, org_id, line.account_id)?;
            if !account.active {
                return Err(StorageError::AccountInactive(line.account_id));
            }
            if let Some(pid) = line.partner_id {
                let exists: bool = conn
                    .query_row(
                        "SELECT COUNT(*) > 0 FROM partners WHERE org_id = ?1 AND id = ?2",
                        params![org_id.to_string(), pid.to_string()],
                        |row| row.get(0),
                    )
                    .map_err(other)?;
                if !exists {
                    return Err(StorageError::PartnerNotFound(pid));
                }
            }
            let signed = account.account_type.signed(line.side, line.amount);
            let id = Uuid::new_v4();
            conn.execute(
                "INSERT INTO journal_lines (id, journal_id, line_no, account_id, side, amount, signed_amount, partner_id, memo)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.to_string(),
                    journal_id.to_string(),
                    line_no as i64,
                    line.account_id.to_string(),
                    side_to_str(line.side),
                    line.amount.to_string(),
                    signed.to_string(),
                    line.partner_id.map(|p| p.to_string()),
                    line.memo,
                ],
            )
            .map_err(other)?;
            lines.push(JournalLine {
                id,
                account_id: line.account_id,
                side: line.side,
                amount: line.amount,
                partner_id: line.partner_id,
                memo: line.memo.clone(),
            });
        }
        Ok(lines)
    }

    /// Run a multi-row journal write inside its own savepoint so a
    /// failure part way through cannot leave an unbalanced entry.
    fn with_journal_savepoint<T>(
        conn: &Connection,
        body: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        conn.execute_batch("SAVEPOINT kicho_journal").map_err(other)?;
        match body(conn) {
            Ok(value) => {
                conn.execute_batch("RELEASE SAVEPOINT kicho_journal")
                    .map_err(other)?;
                Ok(value)
            }
            Err(e) => {
                let _ = conn.execute_batch(
                    "ROLLBACK TO SAVEPOINT kicho_journal; RELEASE SAVEPOINT kicho_journal",
                );
                Err(e)
            }
        }
    }

    fn journal_lines(conn: &Connection, journal_id: Uuid) -> Result<Vec<JournalLine>, StorageError> {
        let mut stmt = conn
            .prepare(
                "SELECT id, account_id, side, amount, partner_id, memo
                 FROM journal_lines WHERE journal_id = ?1 ORDER BY line_no",
            )
            .map_err(other)?;
        let rows = stmt
            .query_map(params![journal_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;

        let mut lines = Vec::with_capacity(rows.len());
        for (id, account_id, side, amount, partner_id, memo) in rows {
            lines.push(JournalLine {
                id: parse_uuid(&id)?,
                account_id: parse_uuid(&account_id)?,
                side: str_to_side(&side),
                amount: parse_decimal(&amount)?,
                partner_id: partner_id.as_deref().map(parse_uuid).transpose()?,
                memo,
            });
        }
        Ok(lines)
    }

    fn journal_row(conn: &Connection, org_id: Uuid, journal_id: Uuid) -> Result<JournalEntry, StorageError> {
        let head = conn
            .query_row(
                "SELECT id, sequence, entry_date, description, source_key, deleted, created_at
                 FROM journals WHERE org_id = ?1 AND id = ?2 AND deleted = 0",
                params![org_id.to_string(), journal_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(other)?
            .ok_or(StorageError::JournalNotFound(journal_id))?;

        Ok(JournalEntry {
            id: parse_uuid(&head.0)?,
            org_id,
            sequence: head.1 as u64,
            entry_date: str_to_date(&head.2)?,
            description: head.3,
            lines: Self::journal_lines(conn, journal_id)?,
            source_key: head.4,
            deleted: head.5 != 0,
            created_at: timestamp_to_datetime(head.6),
        })
    }

    fn signed_sum(
        conn: &Connection,
        org_id: Uuid,
        account_id: Uuid,
        date_cond: &str,
        date_params: &[&str],
    ) -> Result<Decimal, StorageError> {
        let query = format!(
            "SELECT CAST(COALESCE(SUM(jl.signed_amount), 0) AS TEXT)
             FROM journal_lines jl
             JOIN journals j ON j.id = jl.journal_id
             WHERE j.org_id = ?1 AND jl.account_id = ?2 AND j.deleted = 0 {}",
            date_cond
        );
        let mut stmt = conn.prepare(&query).map_err(other)?;
        let org_str = org_id.to_string();
        let acct_str = account_id.to_string();
        let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&org_str, &acct_str];
        for p in date_params {
            bound.push(p);
        }
        let val: String = stmt
            .query_row(bound.as_slice(), |row| row.get(0))
            .map_err(other)?;
        parse_decimal(&val)
    }
}

fn other(e: impl std::fmt::Display) -> StorageError {
    StorageError::Other(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(s).map_err(|e| StorageError::Other(format!("Invalid uuid: {}", e)))
}

fn parse_decimal(s: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(s).map_err(|e| StorageError::Other(format!("Invalid decimal: {}", e)))
}

fn date_to_str(d: Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), d.month() as u8, d.day())
}

fn str_to_date(s: &str) -> Result<Date, StorageError> {
    let mut parts = s.splitn(3, '-');
    let mut parse = || -> Option<Date> {
        let year = parts.next()?.parse::<i32>().ok()?;
        let month = parts.next()?.parse::<u8>().ok()?;
        let day = parts.next()?.parse::<u8>().ok()?;
        Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()
    };
    parse().ok_or_else(|| StorageError::Other(format!("Invalid date: {}", s)))
}

fn timestamp_to_datetime(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn account_type_to_str(at: AccountType) -> &'static str {
    match at {
        AccountType::Asset => "ASSET",
        AccountType::Liability => "LIABILITY",
        AccountType::Equity => "EQUITY",
        AccountType::Revenue => "REVENUE",
        AccountType::Expense => "EXPENSE",
    }
}

fn str_to_account_type(s: &str) -> AccountType {
    match s {
        "LIABILITY" => AccountType::Liability,
        "EQUITY" => AccountType::Equity,
        "REVENUE" => AccountType::Revenue,
        "EXPENSE" => AccountType::Expense,
        _ => AccountType::Asset,
    }
}

fn side_to_str(side: Side) -> &'static str {
    match side {
        Side::Debit => "DEBIT",
        Side::Credit => "CREDIT",
    }
}

fn str_to_side(s: &str) -> Side {
    match s {
        "CREDIT" => Side::Credit,
        _ => Side::Debit,
    }
}

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::Viewer => "VIEWER",
        Role::Member => "MEMBER",
        Role::Admin => "ADMIN",
        Role::Owner => "OWNER",
    }
}

fn str_to_role(s: &str) -> Role {
    match s {
        "OWNER" => Role::Owner,
        "ADMIN" => Role::Admin,
        "MEMBER" => Role::Member,
        _ => Role::Viewer,
    }
}

fn kind_to_str(kind: PartnerKind) -> &'static str {
    match kind {
        PartnerKind::Customer => "CUSTOMER",
        PartnerKind::Vendor => "VENDOR",
        PartnerKind::Both => "BOTH",
    }
}

fn str_to_kind(s: &str) -> PartnerKind {
    match s {
        "CUSTOMER" => PartnerKind::Customer,
        "VENDOR" => PartnerKind::Vendor,
        _ => PartnerKind::Both,
    }
}

fn map_account(row: &rusqlite::Row) -> rusqlite::Result<Account> {
    let id: String = row.get(0)?;
    let org_id: String = row.get(1)?;
    let account_type: String = row.get(4)?;
    let parent_id: Option<String> = row.get(5)?;
    Ok(Account {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        org_id: Uuid::parse_str(&org_id).unwrap_or_default(),
        code: row.get(2)?,
        name: row.get(3)?,
        account_type: str_to_account_type(&account_type),
        parent_id: parent_id.and_then(|p| Uuid::parse_str(&p).ok()),
        active: row.get::<_, i64>(6)? != 0,
        created_at: timestamp_to_datetime(row.get(7)?),
    })
}

fn map_partner(row: &rusqlite::Row) -> rusqlite::Result<Partner> {
    let id: String = row.get(0)?;
    let org_id: String = row.get(1)?;
    let kind: String = row.get(4)?;
    Ok(Partner {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        org_id: Uuid::parse_str(&org_id).unwrap_or_default(),
        code: row.get(2)?,
        name: row.get(3)?,
        kind: str_to_kind(&kind),
        active: row.get::<_, i64>(5)? != 0,
    })
}

fn map_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    Ok(User {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        email: row.get(1)?,
        display_name: row.get(2)?,
        password_hash: row.get(3)?,
        created_at: timestamp_to_datetime(row.get(4)?),
    })
}

fn map_period(row: &rusqlite::Row) -> rusqlite::Result<AccountingPeriod> {
    let id: String = row.get(0)?;
    let org_id: String = row.get(1)?;
    let start: String = row.get(3)?;
    let end: String = row.get(4)?;
    Ok(AccountingPeriod {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        org_id: Uuid::parse_str(&org_id).unwrap_or_default(),
        name: row.get(2)?,
        start_date: str_to_date(&start).unwrap_or(Date::MIN),
        end_date: str_to_date(&end).unwrap_or(Date::MAX),
        closed: row.get::<_, i64>(5)? != 0,
    })
}

fn range_conditions(from: Bound<Date>, to: Bound<Date>) -> (String, String, String, String) {
    let (from_op, from_str) = match from {
        Bound::Included(d) => (">=", date_to_str(d)),
        Bound::Excluded(d) => (">", date_to_str(d)),
        Bound::Unbounded => (">=", "0000-01-01".to_string()),
    };
    let (to_op, to_str) = match to {
        Bound::Included(d) => ("<=", date_to_str(d)),
        Bound::Excluded(d) => ("<", date_to_str(d)),
        Bound::Unbounded => ("<=", "9999-12-31".to_string()),
    };
    (from_op.to_string(), from_str, to_op.to_string(), to_str)
}

impl StorageBackend for SqliteStorage {
    fn create_user(&self, command: &CreateUserCommand) -> Result<User, StorageError> {
        let conn = self.conn.lock().unwrap();
        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM users WHERE email = ?1",
                params![command.email],
                |row| row.get(0),
            )
            .map_err(other)?;
        if exists {
            return Err(StorageError::DuplicateEmail(command.email.clone()));
        }
        let user = User {
            id: Uuid::new_v4(),
            email: command.email.clone(),
            display_name: command.display_name.clone(),
            password_hash: command.password_hash.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        conn.execute(
            "INSERT INTO users (id, email, display_name, password_hash, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id.to_string(),
                user.email,
                user.display_name,
                user.password_hash,
                user.created_at.unix_timestamp(),
            ],
        )
        .map_err(other)?;
        Ok(user)
    }

    fn get_user(&self, user_id: Uuid) -> Result<User, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, email, display_name, password_hash, created_at FROM users WHERE id = ?1",
            params![user_id.to_string()],
            map_user,
        )
        .optional()
        .map_err(other)?
        .ok_or(StorageError::UserNotFound(user_id))
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, email, display_name, password_hash, created_at FROM users WHERE email = ?1",
            params![email],
            map_user,
        )
        .optional()
        .map_err(other)
    }

    fn insert_session(&self, session: &Session) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                session.token,
                session.user_id.to_string(),
                session.created_at.unix_timestamp(),
                session.expires_at.unix_timestamp(),
            ],
        )
        .map_err(other)?;
        Ok(())
    }

    fn find_session(&self, token: &str, now: OffsetDateTime) -> Result<Option<Session>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT token, user_id, created_at, expires_at FROM sessions")
            .map_err(other)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;

        // Scan with a constant-time compare rather than an indexed
        // lookup on the token value.
        for (stored, user_id, created_at, expires_at) in rows {
            if stored.as_bytes().ct_eq(token.as_bytes()).into() {
                let session = Session {
                    token: stored,
                    user_id: parse_uuid(&user_id)?,
                    created_at: timestamp_to_datetime(created_at),
                    expires_at: timestamp_to_datetime(expires_at),
                };
                if session.is_expired(now) {
                    return Ok(None);
                }
                return Ok(Some(session));
            }
        }
        Ok(None)
    }

    fn delete_session(&self, token: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .map_err(other)?;
        Ok(())
    }

    fn purge_expired_sessions(&self, now: OffsetDateTime) -> Result<usize, StorageError> {
        let conn = self.conn.lock().unwrap();
        let purged = conn
            .execute(
                "DELETE FROM sessions WHERE expires_at <= ?1",
                params![now.unix_timestamp()],
            )
            .map_err(other)?;
        Ok(purged)
    }

    fn create_organization(&self, name: &str, owner: Uuid) -> Result<Organization, StorageError> {
        let conn = self.conn.lock().unwrap();
        let user_exists: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM users WHERE id = ?1",
                params![owner.to_string()],
                |row| row.get(0),
            )
            .map_err(other)?;
        if !user_exists {
            return Err(StorageError::UserNotFound(owner));
        }
        let organization = Organization {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        conn.execute(
            "INSERT INTO organizations (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![
                organization.id.to_string(),
                organization.name,
                organization.created_at.unix_timestamp(),
            ],
        )
        .map_err(other)?;
        conn.execute(
            "INSERT INTO members (org_id, user_id, role) VALUES (?1, ?2, ?3)",
            params![
                organization.id.to_string(),
                owner.to_string(),
                role_to_str(Role::Owner),
            ],
        )
        .map_err(other)?;
        Ok(organization)
    }

    fn get_organization(&self, org_id: Uuid) -> Result<Organization, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, created_at FROM organizations WHERE id = ?1",
            params![org_id.to_string()],
            |row| {
                let id: String = row.get(0)?;
                Ok(Organization {
                    id: Uuid::parse_str(&id).unwrap_or_default(),
                    name: row.get(1)?,
                    created_at: timestamp_to_datetime(row.get(2)?),
                })
            },
        )
        .optional()
        .map_err(other)?
        .ok_or(StorageError::OrganizationNotFound(org_id))
    }

    fn list_organizations_for_user(&self, user_id: Uuid) -> Result<Vec<(Organization, Role)>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT o.id, o.name, o.created_at, m.role
                 FROM organizations o
                 JOIN members m ON m.org_id = o.id
                 WHERE m.user_id = ?1
                 ORDER BY o.name",
            )
            .map_err(other)?;
        let rows = stmt
            .query_map(params![user_id.to_string()], |row| {
                let id: String = row.get(0)?;
                let role: String = row.get(3)?;
                Ok((
                    Organization {
                        id: Uuid::parse_str(&id).unwrap_or_default(),
                        name: row.get(1)?,
                        created_at: timestamp_to_datetime(row.get(2)?),
                    },
                    str_to_role(&role),
                ))
            })
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;
        Ok(rows)
    }

    fn upsert_member(&self, org_id: Uuid, user_id: Uuid, role: Role) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_org(&conn, org_id)?;
        let user_exists: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM users WHERE id = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )
            .map_err(other)?;
        if !user_exists {
            return Err(StorageError::UserNotFound(user_id));
        }
        if role != Role::Owner {
            let demoting_last_owner: bool = conn
                .query_row(
                    "SELECT (SELECT COUNT(*) FROM members WHERE org_id = ?1 AND user_id = ?2 AND role = 'OWNER') > 0
                        AND (SELECT COUNT(*) FROM members WHERE org_id = ?1 AND role = 'OWNER') = 1",
                    params![org_id.to_string(), user_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(other)?;
            if demoting_last_owner {
                return Err(StorageError::LastOwner);
            }
        }
        conn.execute(
            "INSERT OR REPLACE INTO members (org_id, user_id, role) VALUES (?1, ?2, ?3)",
            params![org_id.to_string(), user_id.to_string(), role_to_str(role)],
        )
        .map_err(other)?;
        Ok(())
    }

    fn remove_member(&self, org_id: Uuid, user_id: Uuid) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_org(&conn, org_id)?;
        let removing_last_owner: bool = conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM members WHERE org_id = ?1 AND user_id = ?2 AND role = 'OWNER') > 0
                    AND (SELECT COUNT(*) FROM members WHERE org_id = ?1 AND role = 'OWNER') = 1",
                params![org_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )
            .map_err(other)?;
        if removing_last_owner {
            return Err(StorageError::LastOwner);
        }
        conn.execute(
            "DELETE FROM members WHERE org_id = ?1 AND user_id = ?2",
            params![org_id.to_string(), user_id.to_string()],
        )
        .map_err(other)?;
        Ok(())
    }

    fn member_role(&self, org_id: Uuid, user_id: Uuid) -> Result<Option<Role>, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_org(&conn, org_id)?;
        let role: Option<String> = conn
            .query_row(
                "SELECT role FROM members WHERE org_id = ?1 AND user_id = ?2",
                params![org_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(other)?;
        Ok(role.as_deref().map(str_to_role))
    }

    fn list_members(&self, org_id: Uuid) -> Result<Vec<(User, Role)>, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_org(&conn, org_id)?;
        let mut stmt = conn
            .prepare(
                "SELECT u.id, u.email, u.display_name, u.password_hash, u.created_at, m.role
                 FROM users u
                 JOIN members m ON m.user_id = u.id
                 WHERE m.org_id = ?1
                 ORDER BY u.email",
            )
            .map_err(other)?;
        let rows = stmt
            .query_map(params![org_id.to_string()], |row| {
                let user = map_user(row)?;
                let role: String = row.get(5)?;
                Ok((user, str_to_role(&role)))
            })
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;
        Ok(rows)
    }

    fn create_account(&self, org_id: Uuid, command: &CreateAccountCommand) -> Result<Account, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_org(&conn, org_id)?;
        let code_taken: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM accounts WHERE org_id = ?1 AND code = ?2",
                params![org_id.to_string(), command.code],
                |row| row.get(0),
            )
            .map_err(other)?;
        if code_taken {
            return Err(StorageError::DuplicateAccountCode(command.code.clone()));
        }
        if let Some(parent) = command.parent_id {
            Self::account_row(&conn, org_id, parent)?;
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
        conn.execute(
            "INSERT INTO accounts (id, org_id, code, name, account_type, parent_id, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
            params![
                account.id.to_string(),
                org_id.to_string(),
                account.code,
                account.name,
                account_type_to_str(account.account_type),
                account.parent_id.map(|p| p.to_string()),
                account.created_at.unix_timestamp(),
            ],
        )
        .map_err(other)?;
        Ok(account)
    }

    fn update_account(&self, org_id: Uuid, account_id: Uuid, command: &kicho_core::UpdateAccountCommand) -> Result<Account, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut account = Self::account_row(&conn, org_id, account_id)?;
        if let Some(ref name) = command.name {
            account.name = name.clone();
        }
        if let Some(parent) = command.parent_id {
            Self::account_row(&conn, org_id, parent)?;
            account.parent_id = Some(parent);
        }
        if let Some(active) = command.active {
            account.active = active;
        }
        conn.execute(
            "UPDATE accounts SET name = ?1, parent_id = ?2, active = ?3 WHERE org_id = ?4 AND id = ?5",
            params![
                account.name,
                account.parent_id.map(|p| p.to_string()),
                account.active as i64,
                org_id.to_string(),
                account_id.to_string(),
            ],
        )
        .map_err(other)?;
        Ok(account)
    }

    fn get_account(&self, org_id: Uuid, account_id: Uuid) -> Result<Account, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::account_row(&conn, org_id, account_id)
    }

    fn list_accounts(&self, org_id: Uuid) -> Result<Vec<Account>, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_org(&conn, org_id)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, org_id, code, name, account_type, parent_id, active, created_at
                 FROM accounts WHERE org_id = ?1 ORDER BY code",
            )
            .map_err(other)?;
        let rows = stmt
            .query_map(params![org_id.to_string()], map_account)
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;
        Ok(rows)
    }

    fn deactivate_account(&self, org_id: Uuid, account_id: Uuid) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE accounts SET active = 0 WHERE org_id = ?1 AND id = ?2",
                params![org_id.to_string(), account_id.to_string()],
            )
            .map_err(other)?;
        if updated == 0 {
            return Err(StorageError::AccountNotFound(account_id));
        }
        Ok(())
    }

    fn create_partner(&self, org_id: Uuid, command: &CreatePartnerCommand) -> Result<Partner, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_org(&conn, org_id)?;
        let code_taken: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM partners WHERE org_id = ?1 AND code = ?2",
                params![org_id.to_string(), command.code],
                |row| row.get(0),
            )
            .map_err(other)?;
        if code_taken {
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
        conn.execute(
            "INSERT INTO partners (id, org_id, code, name, kind, active) VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![
                partner.id.to_string(),
                org_id.to_string(),
                partner.code,
                partner.name,
                kind_to_str(partner.kind),
            ],
        )
        .map_err(other)?;
        Ok(partner)
    }

    fn update_partner(&self, org_id: Uuid, partner_id: Uuid, command: &kicho_core::UpdatePartnerCommand) -> Result<Partner, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut partner = conn
            .query_row(
                "SELECT id, org_id, code, name, kind, active FROM partners WHERE org_id = ?1 AND id = ?2",
                params![org_id.to_string(), partner_id.to_string()],
                map_partner,
            )
            .optional()
            .map_err(other)?
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
        conn.execute(
            "UPDATE partners SET name = ?1, kind = ?2, active = ?3 WHERE org_id = ?4 AND id = ?5",
            params![
                partner.name,
                kind_to_str(partner.kind),
                partner.active as i64,
                org_id.to_string(),
                partner_id.to_string(),
            ],
        )
        .map_err(other)?;
        Ok(partner)
    }

    fn get_partner(&self, org_id: Uuid, partner_id: Uuid) -> Result<Partner, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, org_id, code, name, kind, active FROM partners WHERE org_id = ?1 AND id = ?2",
            params![org_id.to_string(), partner_id.to_string()],
            map_partner,
        )
        .optional()
        .map_err(other)?
        .ok_or(StorageError::PartnerNotFound(partner_id))
    }

    fn list_partners(&self, org_id: Uuid) -> Result<Vec<Partner>, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_org(&conn, org_id)?;
        let mut stmt = conn
            .prepare("SELECT id, org_id, code, name, kind, active FROM partners WHERE org_id = ?1 ORDER BY code")
            .map_err(other)?;
        let rows = stmt
            .query_map(params![org_id.to_string()], map_partner)
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;
        Ok(rows)
    }

    fn deactivate_partner(&self, org_id: Uuid, partner_id: Uuid) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE partners SET active = 0 WHERE org_id = ?1 AND id = ?2",
                params![org_id.to_string(), partner_id.to_string()],
            )
            .map_err(other)?;
        if updated == 0 {
            return Err(StorageError::PartnerNotFound(partner_id));
        }
        Ok(())
    }

    fn create_period(&self, org_id: Uuid, command: &CreatePeriodCommand) -> Result<AccountingPeriod, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_org(&conn, org_id)?;
        let overlapping: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM periods
                 WHERE org_id = ?1 AND start_date <= ?2 AND end_date >= ?3",
                params![
                    org_id.to_string(),
                    date_to_str(command.end_date),
                    date_to_str(command.start_date),
                ],
                |row| row.get(0),
            )
            .map_err(other)?;
        if overlapping {
            return Err(StorageError::PeriodOverlap);
        }
        let period = AccountingPeriod {
            id: Uuid::new_v4(),
            org_id,
            name: command.name.clone(),
            start_date: command.start_date,
            end_date: command.end_date,
            closed: false,
        };
        conn.execute(
            "INSERT INTO periods (id, org_id, name, start_date, end_date, closed) VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                period.id.to_string(),
                org_id.to_string(),
                period.name,
                date_to_str(period.start_date),
                date_to_str(period.end_date),
            ],
        )
        .map_err(other)?;
        Ok(period)
    }

    fn list_periods(&self, org_id: Uuid) -> Result<Vec<AccountingPeriod>, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_org(&conn, org_id)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, org_id, name, start_date, end_date, closed
                 FROM periods WHERE org_id = ?1 ORDER BY start_date",
            )
            .map_err(other)?;
        let rows = stmt
            .query_map(params![org_id.to_string()], map_period)
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;
        Ok(rows)
    }

    fn set_period_closed(&self, org_id: Uuid, period_id: Uuid, closed: bool) -> Result<AccountingPeriod, StorageError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE periods SET closed = ?1 WHERE org_id = ?2 AND id = ?3",
                params![closed as i64, org_id.to_string(), period_id.to_string()],
            )
            .map_err(other)?;
        if updated == 0 {
            return Err(StorageError::PeriodNotFound(period_id));
        }
        conn.query_row(
            "SELECT id, org_id, name, start_date, end_date, closed FROM periods WHERE org_id = ?1 AND id = ?2",
            params![org_id.to_string(), period_id.to_string()],
            map_period,
        )
        .map_err(other)
    }

    fn period_containing(&self, org_id: Uuid, date: Date) -> Result<Option<AccountingPeriod>, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_org(&conn, org_id)?;
        conn.query_row(
            "SELECT id, org_id, name, start_date, end_date, closed
             FROM periods WHERE org_id = ?1 AND start_date <= ?2 AND end_date >= ?2",
            params![org_id.to_string(), date_to_str(date)],
            map_period,
        )
        .optional()
        .map_err(other)
    }

    fn create_journal(&self, org_id: Uuid, command: &CreateJournalCommand) -> Result<JournalEntry, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_org(&conn, org_id)?;
        Self::with_journal_savepoint(&conn, |conn| {
            let id = Uuid::new_v4();
            let sequence = Self::next_sequence(conn)?;
            let created_at = OffsetDateTime::now_utc();
            conn.execute(
                "INSERT INTO journals (id, org_id, sequence, entry_date, description, source_key, deleted, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
                params![
                    id.to_string(),
                    org_id.to_string(),
                    sequence as i64,
                    date_to_str(command.entry_date),
                    command.description,
                    command.source_key,
                    created_at.unix_timestamp(),
                ],
            )
            .map_err(other)?;
            let lines = Self::insert_lines(conn, org_id, id, command)?;
            Ok(JournalEntry {
                id,
                org_id,
                sequence,
                entry_date: command.entry_date,
                description: command.description.clone(),
                lines,
                source_key: command.source_key.clone(),
                deleted: false,
                created_at,
            })
        })
    }

    fn update_journal(&self, org_id: Uuid, journal_id: Uuid, command: &CreateJournalCommand) -> Result<JournalEntry, StorageError> {
        let conn = self.conn.lock().unwrap();
        let existing = Self::journal_row(&conn, org_id, journal_id)?;
        Self::with_journal_savepoint(&conn, |conn| {
            conn.execute(
                "UPDATE journals SET entry_date = ?1, description = ?2, source_key = ?3 WHERE id = ?4",
                params![
                    date_to_str(command.entry_date),
                    command.description,
                    command.source_key,
                    journal_id.to_string(),
                ],
            )
            .map_err(other)?;
            conn.execute(
                "DELETE FROM journal_lines WHERE journal_id = ?1",
                params![journal_id.to_string()],
            )
            .map_err(other)?;
            let lines = Self::insert_lines(conn, org_id, journal_id, command)?;
            Ok(JournalEntry {
                id: journal_id,
                org_id,
                sequence: existing.sequence,
                entry_date: command.entry_date,
                description: command.description.clone(),
                lines,
                source_key: command.source_key.clone(),
                deleted: false,
                created_at: existing.created_at,
            })
        })
    }

    fn delete_journal(&self, org_id: Uuid, journal_id: Uuid) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE journals SET deleted = 1 WHERE org_id = ?1 AND id = ?2 AND deleted = 0",
                params![org_id.to_string(), journal_id.to_string()],
            )
            .map_err(other)?;
        if updated == 0 {
            return Err(StorageError::JournalNotFound(journal_id));
        }
        Ok(())
    }

    fn get_journal(&self, org_id: Uuid, journal_id: Uuid) -> Result<JournalEntry, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::journal_row(&conn, org_id, journal_id)
    }

    fn list_journals(&self, org_id: Uuid, from: Bound<Date>, to: Bound<Date>) -> Result<Vec<JournalEntry>, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_org(&conn, org_id)?;
        let (from_op, from_str, to_op, to_str) = range_conditions(from, to);
        let query = format!(
            "SELECT id FROM journals
             WHERE org_id = ?1 AND deleted = 0 AND entry_date {} ?2 AND entry_date {} ?3
             ORDER BY entry_date, sequence",
            from_op, to_op
        );
        let mut stmt = conn.prepare(&query).map_err(other)?;
        let ids = stmt
            .query_map(params![org_id.to_string(), from_str, to_str], |row| {
                row.get::<_, String>(0)
            })
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            entries.push(Self::journal_row(&conn, org_id, parse_uuid(&id)?)?);
        }
        Ok(entries)
    }

    fn source_key_exists(&self, org_id: Uuid, source_key: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) > 0 FROM journals WHERE org_id = ?1 AND source_key = ?2 AND deleted = 0",
            params![org_id.to_string(), source_key],
            |row| row.get(0),
        )
        .map_err(other)
    }

    fn account_balance(&self, org_id: Uuid, account_id: Uuid, as_of: Date) -> Result<Decimal, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::account_row(&conn, org_id, account_id)?;
        let date_str = date_to_str(as_of);
        Self::signed_sum(&conn, org_id, account_id, "AND j.entry_date <= ?3", &[&date_str])
    }

    fn account_ledger(&self, org_id: Uuid, account_id: Uuid, from: Bound<Date>, to: Bound<Date>) -> Result<Vec<LedgerRow>, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::account_row(&conn, org_id, account_id)?;

        // Opening balance covers everything strictly before the range.
        let mut balance = match from {
            Bound::Included(d) => {
                let cutoff = date_to_str(d);
                Self::signed_sum(&conn, org_id, account_id, "AND j.entry_date < ?3", &[&cutoff])?
            }
            Bound::Excluded(d) => {
                let cutoff = date_to_str(d);
                Self::signed_sum(&conn, org_id, account_id, "AND j.entry_date <= ?3", &[&cutoff])?
            }
            Bound::Unbounded => Decimal::ZERO,
        };

        let (from_op, from_str, to_op, to_str) = range_conditions(from, to);
        let query = format!(
            "SELECT j.id, j.sequence, j.entry_date, j.description, jl.signed_amount
             FROM journal_lines jl
             JOIN journals j ON j.id = jl.journal_id
             WHERE j.org_id = ?1 AND jl.account_id = ?2 AND j.deleted = 0
               AND j.entry_date {} ?3 AND j.entry_date {} ?4
             ORDER BY j.entry_date, j.sequence, jl.line_no",
            from_op, to_op
        );
        let mut stmt = conn.prepare(&query).map_err(other)?;
        let rows = stmt
            .query_map(
                params![org_id.to_string(), account_id.to_string(), from_str, to_str],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;

        let mut result = Vec::with_capacity(rows.len());
        for (jid, sequence, date, description, amount) in rows {
            let amount = parse_decimal(&amount)?;
            balance += amount;
            result.push(LedgerRow {
                journal_id: parse_uuid(&jid)?,
                sequence: sequence as u64,
                date: str_to_date(&date)?,
                description,
                amount,
                balance,
            });
        }
        Ok(result)
    }

    fn account_activity(&self, org_id: Uuid, account_id: Uuid, from: Date, to: Date) -> Result<Decimal, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::account_row(&conn, org_id, account_id)?;
        let from_str = date_to_str(from);
        let to_str = date_to_str(to);
        Self::signed_sum(
            &conn,
            org_id,
            account_id,
            "AND j.entry_date >= ?3 AND j.entry_date <= ?4",
            &[&from_str, &to_str],
        )
    }

    fn create_import_rule(&self, org_id: Uuid, command: &CreateImportRuleCommand) -> Result<ImportRule, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::account_row(&conn, org_id, command.account_id)?;
        let rule = ImportRule {
            id: Uuid::new_v4(),
            org_id,
            keyword: command.keyword.clone(),
            account_id: command.account_id,
            partner_id: command.partner_id,
        };
        conn.execute(
            "INSERT INTO import_rules (id, org_id, keyword, account_id, partner_id) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                rule.id.to_string(),
                org_id.to_string(),
                rule.keyword,
                rule.account_id.to_string(),
                rule.partner_id.map(|p| p.to_string()),
            ],
        )
        .map_err(other)?;
        Ok(rule)
    }

    fn list_import_rules(&self, org_id: Uuid) -> Result<Vec<ImportRule>, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_org(&conn, org_id)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, org_id, keyword, account_id, partner_id
                 FROM import_rules WHERE org_id = ?1 ORDER BY rowid",
            )
            .map_err(other)?;
        let rows = stmt
            .query_map(params![org_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;

        let mut rules = Vec::with_capacity(rows.len());
        for (id, keyword, account_id, partner_id) in rows {
            rules.push(ImportRule {
                id: parse_uuid(&id)?,
                org_id,
                keyword,
                account_id: parse_uuid(&account_id)?,
                partner_id: partner_id.as_deref().map(parse_uuid).transpose()?,
            });
        }
        Ok(rules)
    }

    fn delete_import_rule(&self, org_id: Uuid, rule_id: Uuid) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn
            .execute(
                "DELETE FROM import_rules WHERE org_id = ?1 AND id = ?2",
                params![org_id.to_string(), rule_id.to_string()],
            )
            .map_err(other)?;
        if deleted == 0 {
            return Err(StorageError::ImportRuleNotFound(rule_id));
        }
        Ok(())
    }

    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("SAVEPOINT kicho_tx").map_err(other)?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        *self.active_tx.lock().unwrap() = Some(tx_id);
        tracing::debug!(tx_id, "SQLite transaction started");
        Ok(tx_id)
    }

    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut active = self.active_tx.lock().unwrap();
        if *active != Some(tx_id) {
            return Err(StorageError::NoActiveTransaction);
        }
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("RELEASE SAVEPOINT kicho_tx").map_err(other)?;
        *active = None;
        tracing::debug!(tx_id, "SQLite transaction committed");
        Ok(())
    }

    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut active = self.active_tx.lock().unwrap();
        if *active != Some(tx_id) {
            return Err(StorageError::NoActiveTransaction);
        }
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("ROLLBACK TO SAVEPOINT kicho_tx; RELEASE SAVEPOINT kicho_tx")
            .map_err(other)?;
        *active = None;
        tracing::debug!(tx_id, "SQLite transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kicho_core::JournalLineCommand;
    use rust_decimal_macros::dec;
    use time::macros::date;

    fn setup() -> (SqliteStorage, Uuid, Uuid) {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let user = storage
            .create_user(&CreateUserCommand {
                email: "keiri@example.jp".to_string(),
                display_name: "経理担当".to_string(),
                password_hash: "x".to_string(),
            })
            .unwrap();
        let org = storage.create_organization("株式会社テスト", user.id).unwrap();
        (storage, org.id, user.id)
    }

    fn account(storage: &SqliteStorage, org: Uuid, code: &str, name: &str, at: AccountType) -> Account {
        storage
            .create_account(
                org,
                &CreateAccountCommand {
                    code: code.to_string(),
                    name: name.to_string(),
                    account_type: at,
                    parent_id: None,
                },
            )
            .unwrap()
    }

    fn journal(
        storage: &SqliteStorage,
        org: Uuid,
        date: Date,
        desc: &str,
        debit: Uuid,
        credit: Uuid,
        amount: Decimal,
    ) -> JournalEntry {
        storage
            .create_journal(
                org,
                &CreateJournalCommand {
                    entry_date: date,
                    description: desc.to_string(),
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
                },
            )
            .unwrap()
    }

    #[test]
    fn test_sqlite_basic_operations() {
        let (storage, org, _) = setup();
        let bank = account(&storage, org, "1110", "普通預金", AccountType::Asset);
        let capital = account(&storage, org, "3100", "資本金", AccountType::Equity);

        let date = date!(2024 - 04 - 01);
        journal(&storage, org, date, "出資", bank.id, capital.id, dec!(1000000));

        assert_eq!(storage.account_balance(org, bank.id, date).unwrap(), dec!(1000000));
        assert_eq!(storage.account_balance(org, capital.id, date).unwrap(), dec!(1000000));
    }

    #[test]
    fn test_duplicate_account_code_rejected() {
        let (storage, org, _) = setup();
        account(&storage, org, "1110", "普通預金", AccountType::Asset);
        let err = storage
            .create_account(
                org,
                &CreateAccountCommand {
                    code: "1110".to_string(),
                    name: "当座預金".to_string(),
                    account_type: AccountType::Asset,
                    parent_id: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateAccountCode(_)));
    }

    #[test]
    fn test_soft_delete_excludes_from_balance() {
        let (storage, org, _) = setup();
        let bank = account(&storage, org, "1110", "普通預金", AccountType::Asset);
        let sales = account(&storage, org, "4100", "売上高", AccountType::Revenue);

        let date = date!(2024 - 05 - 10);
        let entry = journal(&storage, org, date, "売上入金", bank.id, sales.id, dec!(30000));
        assert_eq!(storage.account_balance(org, bank.id, date).unwrap(), dec!(30000));

        storage.delete_journal(org, entry.id).unwrap();
        assert_eq!(storage.account_balance(org, bank.id, date).unwrap(), Decimal::ZERO);
        assert!(matches!(
            storage.get_journal(org, entry.id),
            Err(StorageError::JournalNotFound(_))
        ));
    }

    #[test]
    fn test_ledger_running_balance() {
        let (storage, org, _) = setup();
        let bank = account(&storage, org, "1110", "普通預金", AccountType::Asset);
        let sales = account(&storage, org, "4100", "売上高", AccountType::Revenue);

        journal(&storage, org, date!(2024 - 04 - 01), "入金A", bank.id, sales.id, dec!(1000));
        journal(&storage, org, date!(2024 - 04 - 05), "入金B", bank.id, sales.id, dec!(500));

        let rows = storage
            .account_ledger(
                org,
                bank.id,
                Bound::Included(date!(2024 - 04 - 02)),
                Bound::Unbounded,
            )
            .unwrap();
        // Opening balance of 1000 carried into the range.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, dec!(500));
        assert_eq!(rows[0].balance, dec!(1500));
    }

    #[test]
    fn test_sqlite_transaction_rollback() {
        let (storage, org, _) = setup();
        let bank = account(&storage, org, "1110", "普通預金", AccountType::Asset);
        let capital = account(&storage, org, "3100", "資本金", AccountType::Equity);
        let date = date!(2024 - 04 - 01);

        let tx_id = storage.begin_transaction().unwrap();
        journal(&storage, org, date, "出資", bank.id, capital.id, dec!(500));
        storage.rollback_transaction(tx_id).unwrap();

        assert_eq!(storage.account_balance(org, bank.id, date).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_period_overlap_rejected() {
        let (storage, org, _) = setup();
        storage
            .create_period(
                org,
                &CreatePeriodCommand {
                    name: "FY2024".to_string(),
                    start_date: date!(2024 - 04 - 01),
                    end_date: date!(2025 - 03 - 31),
                },
            )
            .unwrap();
        let err = storage
            .create_period(
                org,
                &CreatePeriodCommand {
                    name: "FY2024H2".to_string(),
                    start_date: date!(2024 - 10 - 01),
                    end_date: date!(2025 - 09 - 30),
                },
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::PeriodOverlap));
    }

    #[test]
    fn test_last_owner_protected() {
        let (storage, org, owner) = setup();
        assert!(matches!(
            storage.remove_member(org, owner),
            Err(StorageError::LastOwner)
        ));
        assert!(matches!(
            storage.upsert_member(org, owner, Role::Viewer),
            Err(StorageError::LastOwner)
        ));
    }

    #[test]
    fn test_failed_create_leaves_no_partial_entry() {
        let (storage, org, _) = setup();
        let bank = account(&storage, org, "1110", "普通預金", AccountType::Asset);
        let command = CreateJournalCommand {
            entry_date: date!(2024 - 06 - 01),
            description: "不明な科目への仕訳".to_string(),
            lines: vec![
                JournalLineCommand {
                    account_id: bank.id,
                    side: Side::Debit,
                    amount: dec!(1000),
                    partner_id: None,
                    memo: None,
                },
                JournalLineCommand {
                    account_id: Uuid::new_v4(),
                    side: Side::Credit,
                    amount: dec!(1000),
                    partner_id: None,
                    memo: None,
                },
            ],
            source_key: None,
        };

        let result = storage.create_journal(org, &command);
        assert!(matches!(result, Err(StorageError::AccountNotFound(_))));

        let entries = storage
            .list_journals(org, Bound::Unbounded, Bound::Unbounded)
            .unwrap();
        assert!(entries.is_empty());
        let balance = storage
            .account_balance(org, bank.id, date!(2024 - 12 - 31))
            .unwrap();
        assert_eq!(balance, Decimal::ZERO);
    }

    #[test]
    fn test_failed_update_keeps_entry_balanced() {
        let (storage, org, _) = setup();
        let bank = account(&storage, org, "1110", "普通預金", AccountType::Asset);
        let sales = account(&storage, org, "4110", "売上高", AccountType::Revenue);
        let entry = journal(&storage, org, date!(2024 - 06 - 01), "売上", bank.id, sales.id, dec!(500));

        let command = CreateJournalCommand {
            entry_date: date!(2024 - 06 - 02),
            description: "修正".to_string(),
            lines: vec![
                JournalLineCommand {
                    account_id: bank.id,
                    side: Side::Debit,
                    amount: dec!(800),
                    partner_id: None,
                    memo: None,
                },
                JournalLineCommand {
                    account_id: Uuid::new_v4(),
                    side: Side::Credit,
                    amount: dec!(800),
                    partner_id: None,
                    memo: None,
                },
            ],
            source_key: None,
        };

        let result = storage.update_journal(org, entry.id, &command);
        assert!(matches!(result, Err(StorageError::AccountNotFound(_))));

        let reloaded = storage.get_journal(org, entry.id).unwrap();
        assert_eq!(reloaded.entry_date, date!(2024 - 06 - 01));
        assert_eq!(reloaded.lines.len(), 2);
        assert_eq!(reloaded.debit_total(), reloaded.credit_total());
        assert_eq!(reloaded.debit_total(), dec!(500));
    }

    #[test]
    fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kicho.db");
        let path = path.to_str().unwrap();

        let org_id;
        let account_id;
        {
            let storage = SqliteStorage::new(path).unwrap();
            let user = storage
                .create_user(&CreateUserCommand {
                    email: "keiri@example.jp".to_string(),
                    display_name: "経理担当".to_string(),
                    password_hash: "x".to_string(),
                })
                .unwrap();
            let org = storage.create_organization("株式会社テスト", user.id).unwrap();
            org_id = org.id;
            account_id = account(&storage, org_id, "1110", "普通預金", AccountType::Asset).id;
        }

        let storage = SqliteStorage::new(path).unwrap();
        let reloaded = storage.get_account(org_id, account_id).unwrap();
        assert_eq!(reloaded.code, "1110");
        assert_eq!(reloaded.account_type, AccountType::Asset);
    }
}
