use anyhow::{Context, Result};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use std::collections::BTreeSet;

use crate::model::{Branch, Timepoint};
use crate::store::query::{BoolQuery, BranchQuery, Clause};
use crate::store::traits::BranchStore;

const BRANCH_COLUMNS: &str =
    r#"path, base, head, "start", "end", locked, contains_content, last_promotion, versions_replaced"#;

/// PostgreSQL-backed document store for branch timespans.
///
/// The query model is compiled to a WHERE clause with positional binds;
/// timepoints are stored as epoch milliseconds so equality is exact.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

/// Bind values collected while compiling a query.
enum SqlValue {
    Text(String),
    Millis(i64),
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Create the schema if it does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS branches (
                path TEXT NOT NULL,
                base BIGINT NOT NULL,
                head BIGINT NOT NULL,
                "start" BIGINT NOT NULL,
                "end" BIGINT,
                locked BOOLEAN NOT NULL DEFAULT FALSE,
                contains_content BOOLEAN NOT NULL DEFAULT FALSE,
                last_promotion BIGINT,
                versions_replaced TEXT[] NOT NULL DEFAULT '{}',
                PRIMARY KEY (path, "start")
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_branches_end ON branches ("end")"#,
            r#"CREATE INDEX IF NOT EXISTS idx_branches_path_end ON branches (path, "end")"#,
            r#"CREATE TABLE IF NOT EXISTS entity_documents (
                entity_type TEXT NOT NULL,
                path TEXT NOT NULL,
                "start" BIGINT NOT NULL,
                document JSONB NOT NULL DEFAULT '{}'::jsonb
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_entity_documents_coordinates
                ON entity_documents (entity_type, path, "start")"#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to run schema migration")?;
        }
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn bind_values<'q>(
        mut query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
        values: &'q [SqlValue],
    ) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
        for value in values {
            query = match value {
                SqlValue::Text(text) => query.bind(text),
                SqlValue::Millis(millis) => query.bind(millis),
            };
        }
        query
    }

    fn row_to_branch(row: &PgRow) -> Branch {
        let versions: Vec<String> = row.get("versions_replaced");
        Branch {
            path: row.get("path"),
            base: Timepoint::from_millis(row.get("base")),
            head: Timepoint::from_millis(row.get("head")),
            start: Timepoint::from_millis(row.get("start")),
            end: row
                .get::<Option<i64>, _>("end")
                .map(Timepoint::from_millis),
            locked: row.get("locked"),
            contains_content: row.get("contains_content"),
            last_promotion: row
                .get::<Option<i64>, _>("last_promotion")
                .map(Timepoint::from_millis),
            versions_replaced: versions.into_iter().collect::<BTreeSet<String>>(),
            state: None,
        }
    }

    async fn upsert(
        executor: &mut sqlx::PgConnection,
        branch: &Branch,
    ) -> Result<()> {
        let versions: Vec<String> = branch.versions_replaced.iter().cloned().collect();
        sqlx::query(
            r#"
            INSERT INTO branches (path, base, head, "start", "end", locked, contains_content, last_promotion, versions_replaced)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (path, "start") DO UPDATE SET
                base = EXCLUDED.base,
                head = EXCLUDED.head,
                "end" = EXCLUDED."end",
                locked = EXCLUDED.locked,
                contains_content = EXCLUDED.contains_content,
                last_promotion = EXCLUDED.last_promotion,
                versions_replaced = EXCLUDED.versions_replaced
            "#,
        )
        .bind(&branch.path)
        .bind(branch.base.millis())
        .bind(branch.head.millis())
        .bind(branch.start.millis())
        .bind(branch.end.map(Timepoint::millis))
        .bind(branch.locked)
        .bind(branch.contains_content)
        .bind(branch.last_promotion.map(Timepoint::millis))
        .bind(versions)
        .execute(executor)
        .await
        .context("Failed to upsert branch timespan")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BranchStore for PostgresStore {
    async fn count(&self, query: &BranchQuery) -> Result<u64> {
        let mut values = Vec::new();
        let where_clause = compile_bool(&query.query, &mut values);
        let sql = format!("SELECT COUNT(*) FROM branches WHERE {}", where_clause);

        let row = Self::bind_values(sqlx::query(&sql), &values)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count branch timespans")?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn find(&self, query: &BranchQuery) -> Result<Vec<Branch>> {
        let mut values = Vec::new();
        let where_clause = compile_bool(&query.query, &mut values);
        let mut sql = format!(
            "SELECT {} FROM branches WHERE {}",
            BRANCH_COLUMNS, where_clause
        );
        if query.sort_by_path {
            sql.push_str(" ORDER BY path");
        }
        if let Some(page) = query.page {
            sql.push_str(&format!(" OFFSET {} LIMIT {}", page.offset, page.size));
        }

        let rows = Self::bind_values(sqlx::query(&sql), &values)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query branch timespans")?;
        Ok(rows.iter().map(Self::row_to_branch).collect())
    }

    async fn save(&self, branch: Branch) -> Result<Branch> {
        let mut stored = branch;
        stored.state = None;
        let mut connection = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection")?;
        Self::upsert(&mut *connection, &stored).await?;
        Ok(stored)
    }

    async fn save_all(&self, branches: Vec<Branch>) -> Result<()> {
        let mut transaction = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;
        for branch in branches {
            let mut stored = branch;
            stored.state = None;
            Self::upsert(&mut *transaction, &stored).await?;
        }
        transaction
            .commit()
            .await
            .context("Failed to commit branch timespan batch")?;
        Ok(())
    }

    async fn delete_entity_documents(
        &self,
        entity_type: &str,
        path: &str,
        start: Timepoint,
    ) -> Result<()> {
        sqlx::query(
            r#"DELETE FROM entity_documents WHERE entity_type = $1 AND path = $2 AND "start" = $3"#,
        )
        .bind(entity_type)
        .bind(path)
        .bind(start.millis())
        .execute(&self.pool)
        .await
        .context("Failed to delete entity documents")?;
        Ok(())
    }

    async fn delete_all_branches(&self) -> Result<()> {
        sqlx::query("DELETE FROM branches")
            .execute(&self.pool)
            .await
            .context("Failed to delete branch timespans")?;
        Ok(())
    }
}

fn compile_bool(query: &BoolQuery, values: &mut Vec<SqlValue>) -> String {
    let mut parts: Vec<String> = Vec::new();
    for clause in &query.must {
        parts.push(compile_clause(clause, values));
    }
    for clause in &query.must_not {
        parts.push(format!("NOT ({})", compile_clause(clause, values)));
    }
    if !query.should.is_empty() {
        let alternatives: Vec<String> = query
            .should
            .iter()
            .map(|clause| compile_clause(clause, values))
            .collect();
        parts.push(format!("({})", alternatives.join(" OR ")));
    }
    if parts.is_empty() {
        "TRUE".to_string()
    } else {
        parts.join(" AND ")
    }
}

fn compile_clause(clause: &Clause, values: &mut Vec<SqlValue>) -> String {
    match clause {
        Clause::PathEquals(path) => {
            values.push(SqlValue::Text(path.clone()));
            format!("path = ${}", values.len())
        }
        Clause::PathPrefix(prefix) => {
            values.push(SqlValue::Text(format!("{}%", escape_like(prefix))));
            format!(r"path LIKE ${} ESCAPE '\'", values.len())
        }
        Clause::StartEquals(timepoint) => {
            values.push(SqlValue::Millis(timepoint.millis()));
            format!(r#""start" = ${}"#, values.len())
        }
        Clause::StartLte(timepoint) => {
            values.push(SqlValue::Millis(timepoint.millis()));
            format!(r#""start" <= ${}"#, values.len())
        }
        Clause::EndGt(timepoint) => {
            values.push(SqlValue::Millis(timepoint.millis()));
            // NULL "end" never satisfies the comparison, matching the model.
            format!(r#""end" > ${}"#, values.len())
        }
        Clause::EndExists => r#""end" IS NOT NULL"#.to_string(),
        Clause::Bool(inner) => format!("({})", compile_bool(inner, values)),
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', r"\\")
        .replace('%', r"\%")
        .replace('_', r"\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(millis: i64) -> Timepoint {
        Timepoint::from_millis(millis)
    }

    #[test]
    fn compiles_current_branch_query() {
        let query = BoolQuery::new()
            .must(Clause::Bool(
                BoolQuery::new()
                    .should(Clause::PathEquals("MAIN/A".to_string()))
                    .should(Clause::PathEquals("MAIN".to_string())),
            ))
            .must_not(Clause::EndExists);

        let mut values = Vec::new();
        let sql = compile_bool(&query, &mut values);
        assert_eq!(
            sql,
            r#"((path = $1 OR path = $2)) AND NOT ("end" IS NOT NULL)"#
        );
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn compiles_at_timepoint_query() {
        let query = BoolQuery::new()
            .must(Clause::PathEquals("MAIN".to_string()))
            .must(Clause::StartLte(t(500)))
            .must(Clause::Bool(
                BoolQuery::new()
                    .should(Clause::Bool(BoolQuery::new().must_not(Clause::EndExists)))
                    .should(Clause::EndGt(t(500))),
            ));

        let mut values = Vec::new();
        let sql = compile_bool(&query, &mut values);
        assert_eq!(
            sql,
            r#"path = $1 AND "start" <= $2 AND ((NOT ("end" IS NOT NULL)) OR "end" > $3)"#
        );
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(escape_like("MAIN/A"), "MAIN/A");
        assert_eq!(escape_like("50%"), r"50\%");
        assert_eq!(escape_like("a_b"), r"a\_b");
    }
}
