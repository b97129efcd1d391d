use toll_core::apikey;
use toll_core::db::Database;
use toll_daemon_db::models::AgentRecord;

use crate::db;
use crate::error::CallError;

/// Authenticates a raw Bearer token to an agent.
///
/// The stored SHA-256 prefix narrows the candidate set so bcrypt runs
/// against a handful of rows instead of the whole table. Rows predating the
/// prefix column are scanned as a fallback until their key is rotated.
pub async fn authenticate(database: &Database, token: &str) -> Result<AgentRecord, CallError> {
    let prefix = apikey::lookup_prefix(token);

    let candidates = db::agents_by_key_prefix(database, &prefix)
        .await
        .map_err(CallError::internal)?;

    if let Some(agent) = verify_candidates(token, candidates).await? {
        return require_active(agent);
    }

    let legacy = db::agents_without_key_prefix(database)
        .await
        .map_err(CallError::internal)?;

    match verify_candidates(token, legacy).await? {
        Some(agent) => require_active(agent),
        None => Err(CallError::Unauthorized),
    }
}

/// bcrypt comparison is deliberately slow, so it runs off the async workers
async fn verify_candidates(
    token: &str,
    candidates: Vec<AgentRecord>,
) -> Result<Option<AgentRecord>, CallError> {
    if candidates.is_empty() {
        return Ok(None);
    }

    let token = token.to_string();

    tokio::task::spawn_blocking(move || {
        candidates
            .into_iter()
            .find(|agent| apikey::verify(&token, &agent.api_key_hash))
    })
    .await
    .map_err(CallError::internal)
}

fn require_active(agent: AgentRecord) -> Result<AgentRecord, CallError> {
    if agent.is_active() {
        Ok(agent)
    } else {
        Err(CallError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use diesel::prelude::*;
    use toll_daemon_db::schema::agent;

    use crate::db::test_database;

    #[tokio::test]
    async fn authenticates_the_right_agent() {
        let (_dir, db) = test_database();

        let (_, _, created, raw_key) =
            db::create_account(&db, "acme".to_string(), None).await.unwrap();

        let authenticated = authenticate(&db, &raw_key).await.unwrap();

        assert_eq!(authenticated.id, created.id);
    }

    #[tokio::test]
    async fn rejects_unknown_and_malformed_keys() {
        let (_dir, db) = test_database();

        db::create_account(&db, "acme".to_string(), None).await.unwrap();

        let error = authenticate(&db, "sk_agt_not_a_real_key").await.unwrap_err();

        assert!(matches!(error, CallError::Unauthorized));

        let error = authenticate(&db, "").await.unwrap_err();

        assert!(matches!(error, CallError::Unauthorized));
    }

    #[tokio::test]
    async fn rejects_killed_and_suspended_agents() {
        let (_dir, db) = test_database();

        let (account_record, _, created, raw_key) =
            db::create_account(&db, "acme".to_string(), None).await.unwrap();

        db::update_agent(
            &db,
            &account_record.id,
            &created.id,
            None,
            Some("killed".to_string()),
        )
        .await
        .unwrap();

        let error = authenticate(&db, &raw_key).await.unwrap_err();

        assert!(matches!(error, CallError::Unauthorized));
    }

    #[tokio::test]
    async fn falls_back_to_scanning_legacy_rows() {
        let (_dir, db) = test_database();

        let (_, _, created, raw_key) =
            db::create_account(&db, "acme".to_string(), None).await.unwrap();

        // Simulate a row from before the prefix column existed
        let mut conn = db.get_connection().await;

        diesel::update(agent::table.find(&created.id))
            .set(agent::api_key_prefix.eq(None::<String>))
            .execute(&mut conn)
            .unwrap();

        drop(conn);

        let authenticated = authenticate(&db, &raw_key).await.unwrap();

        assert_eq!(authenticated.id, created.id);
    }
}
