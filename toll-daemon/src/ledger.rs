//! Atomic wallet mutations. Every operation runs inside one immediate
//! transaction, which takes SQLite's write lock up front and so linearizes
//! all mutations per wallet. Credits and debits carry a reference pair
//! covered by a UNIQUE constraint, making replays idempotent.

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use thiserror::Error;

use toll_core::db::Database;
use toll_core::{id, unix_time};
use toll_daemon_db::models::{TransactionRecord, WalletRecord};
use toll_daemon_db::schema::{transactions, wallet};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Insufficient balance: {required} sats required, {available} sats available")]
    Insufficient { required: i64, available: i64 },

    #[error("Held amount {held} is less than requested {requested}")]
    HoldUnderflow { held: i64, requested: i64 },

    #[error("Wallet not found")]
    WalletNotFound,

    #[error(transparent)]
    Storage(#[from] diesel::result::Error),
}

/// Outcome of an idempotent credit
#[derive(Debug)]
pub enum Credit {
    Applied(TransactionRecord, WalletRecord),
    AlreadyApplied,
}

fn wallet_row(
    conn: &mut SqliteConnection,
    wallet_id: &str,
) -> Result<WalletRecord, LedgerError> {
    wallet::table
        .find(wallet_id)
        .first::<WalletRecord>(conn)
        .optional()?
        .ok_or(LedgerError::WalletNotFound)
}

fn is_unique_violation(error: &LedgerError) -> bool {
    matches!(
        error,
        LedgerError::Storage(diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _,
        ))
    )
}

/// Moves the quoted amount from balance to held, failing before any
/// mutation if the balance cannot cover it
pub async fn hold(db: &Database, wallet_id: &str, sats: i64) -> Result<WalletRecord, LedgerError> {
    let mut conn = db.get_connection().await;

    conn.immediate_transaction(|conn| {
        let row = wallet_row(conn, wallet_id)?;

        if row.balance_sats < sats {
            return Err(LedgerError::Insufficient {
                required: sats,
                available: row.balance_sats,
            });
        }

        diesel::update(wallet::table.find(wallet_id))
            .set((
                wallet::balance_sats.eq(row.balance_sats - sats),
                wallet::held_sats.eq(row.held_sats + sats),
            ))
            .execute(conn)?;

        wallet_row(conn, wallet_id)
    })
}

/// Returns held funds to the balance; the compensation path for failed or
/// cancelled calls
pub async fn release_hold(
    db: &Database,
    wallet_id: &str,
    sats: i64,
) -> Result<WalletRecord, LedgerError> {
    let mut conn = db.get_connection().await;

    conn.immediate_transaction(|conn| {
        let row = wallet_row(conn, wallet_id)?;

        if row.held_sats < sats {
            return Err(LedgerError::HoldUnderflow {
                held: row.held_sats,
                requested: sats,
            });
        }

        diesel::update(wallet::table.find(wallet_id))
            .set((
                wallet::balance_sats.eq(row.balance_sats + sats),
                wallet::held_sats.eq(row.held_sats - sats),
            ))
            .execute(conn)?;

        wallet_row(conn, wallet_id)
    })
}

/// Settles a held quote at the final amount: the hold is consumed, the
/// unspent difference returns to the balance, and one debit transaction is
/// appended. Replays with the same reference return the original row.
pub async fn debit(
    db: &Database,
    wallet_id: &str,
    agent_id: &str,
    quoted_sats: i64,
    final_sats: i64,
    reference_type: &str,
    reference_id: &str,
    description: &str,
) -> Result<(TransactionRecord, WalletRecord), LedgerError> {
    // Finalization is monotone-down
    let final_sats = final_sats.clamp(0, quoted_sats);

    let mut conn = db.get_connection().await;

    let result = conn.immediate_transaction(|conn| {
        let row = wallet_row(conn, wallet_id)?;

        if row.held_sats < quoted_sats {
            return Err(LedgerError::HoldUnderflow {
                held: row.held_sats,
                requested: quoted_sats,
            });
        }

        let balance_after = row.balance_sats + (quoted_sats - final_sats);

        diesel::update(wallet::table.find(wallet_id))
            .set((
                wallet::balance_sats.eq(balance_after),
                wallet::held_sats.eq(row.held_sats - quoted_sats),
                wallet::lifetime_out_sats.eq(row.lifetime_out_sats + final_sats),
            ))
            .execute(conn)?;

        let record = TransactionRecord {
            id: id::new_id(id::TRANSACTION),
            wallet_id: wallet_id.to_string(),
            agent_id: Some(agent_id.to_string()),
            tx_type: "debit".to_string(),
            currency: "sats".to_string(),
            amount_sats: final_sats,
            balance_after_sats: balance_after,
            amount_usd_cents: None,
            balance_after_usd_cents: None,
            reference_type: Some(reference_type.to_string()),
            reference_id: Some(reference_id.to_string()),
            description: description.to_string(),
            created_at: unix_time(),
        };

        diesel::insert_into(transactions::table)
            .values(&record)
            .execute(conn)?;

        let updated = wallet_row(conn, wallet_id)?;

        Ok((record, updated))
    });

    drop(conn);

    match result {
        Err(ref error) if is_unique_violation(error) => {
            let existing = transaction_by_reference(db, reference_type, reference_id)
                .await?
                .ok_or(LedgerError::WalletNotFound)?;

            let row = db_wallet(db, wallet_id).await?;

            Ok((existing, row))
        }
        other => other,
    }
}

/// Credits a settled Lightning invoice in sats; idempotent on the invoice id
pub async fn credit_from_invoice(
    db: &Database,
    wallet_id: &str,
    sats: i64,
    invoice_id: &str,
) -> Result<Credit, LedgerError> {
    let mut conn = db.get_connection().await;

    let result = conn.immediate_transaction(|conn| {
        let row = wallet_row(conn, wallet_id)?;

        let balance_after = row.balance_sats + sats;

        diesel::update(wallet::table.find(wallet_id))
            .set((
                wallet::balance_sats.eq(balance_after),
                wallet::lifetime_in_sats.eq(row.lifetime_in_sats + sats),
            ))
            .execute(conn)?;

        let record = TransactionRecord {
            id: id::new_id(id::TRANSACTION),
            wallet_id: wallet_id.to_string(),
            agent_id: None,
            tx_type: "credit".to_string(),
            currency: "sats".to_string(),
            amount_sats: sats,
            balance_after_sats: balance_after,
            amount_usd_cents: None,
            balance_after_usd_cents: None,
            reference_type: Some("invoice".to_string()),
            reference_id: Some(invoice_id.to_string()),
            description: "lightning invoice settlement".to_string(),
            created_at: unix_time(),
        };

        diesel::insert_into(transactions::table)
            .values(&record)
            .execute(conn)?;

        let updated = wallet_row(conn, wallet_id)?;

        Ok(Credit::Applied(record, updated))
    });

    match result {
        Err(ref error) if is_unique_violation(error) => Ok(Credit::AlreadyApplied),
        other => other,
    }
}

/// Credits a completed card checkout in USD cents. Sats balances are never
/// touched; the sats equivalent lives on the checkout row for reporting.
pub async fn credit_from_checkout(
    db: &Database,
    wallet_id: &str,
    usd_cents: i64,
    session_id: &str,
) -> Result<Credit, LedgerError> {
    let mut conn = db.get_connection().await;

    let result = conn.immediate_transaction(|conn| {
        let row = wallet_row(conn, wallet_id)?;

        let balance_after_usd = row.balance_usd_cents + usd_cents;

        diesel::update(wallet::table.find(wallet_id))
            .set((
                wallet::balance_usd_cents.eq(balance_after_usd),
                wallet::lifetime_in_usd_cents.eq(row.lifetime_in_usd_cents + usd_cents),
            ))
            .execute(conn)?;

        let record = TransactionRecord {
            id: id::new_id(id::TRANSACTION),
            wallet_id: wallet_id.to_string(),
            agent_id: None,
            tx_type: "credit".to_string(),
            currency: "usd_cents".to_string(),
            amount_sats: 0,
            balance_after_sats: row.balance_sats,
            amount_usd_cents: Some(usd_cents),
            balance_after_usd_cents: Some(balance_after_usd),
            reference_type: Some("checkout".to_string()),
            reference_id: Some(session_id.to_string()),
            description: "card checkout settlement".to_string(),
            created_at: unix_time(),
        };

        diesel::insert_into(transactions::table)
            .values(&record)
            .execute(conn)?;

        let updated = wallet_row(conn, wallet_id)?;

        Ok(Credit::Applied(record, updated))
    });

    match result {
        Err(ref error) if is_unique_violation(error) => Ok(Credit::AlreadyApplied),
        other => other,
    }
}

pub async fn transaction_by_reference(
    db: &Database,
    reference_type: &str,
    reference_id: &str,
) -> Result<Option<TransactionRecord>, LedgerError> {
    let mut conn = db.get_connection().await;

    transactions::table
        .filter(transactions::reference_type.eq(reference_type))
        .filter(transactions::reference_id.eq(reference_id))
        .first::<TransactionRecord>(&mut conn)
        .optional()
        .map_err(Into::into)
}

async fn db_wallet(db: &Database, wallet_id: &str) -> Result<WalletRecord, LedgerError> {
    let mut conn = db.get_connection().await;

    wallet::table
        .find(wallet_id)
        .first::<WalletRecord>(&mut conn)
        .optional()?
        .ok_or(LedgerError::WalletNotFound)
}
