#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use chatgate_domain::TurnRecord;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;

use crate::util::time::unix_secs_now;

/// Optional local mirror of every persisted turn.
#[derive(Clone)]
pub struct AuditService {
	backend: Option<AuditBackend>,
}

#[derive(Clone)]
enum AuditBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

const SQLITE_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS turn_audit (\
	id INTEGER PRIMARY KEY AUTOINCREMENT, \
	session_id TEXT NOT NULL, \
	input TEXT NOT NULL, \
	output TEXT NOT NULL, \
	risk_level TEXT NOT NULL, \
	acl_id TEXT, \
	group_id TEXT, \
	created_at INTEGER NOT NULL)";

const POSTGRES_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS turn_audit (\
	id BIGSERIAL PRIMARY KEY, \
	session_id TEXT NOT NULL, \
	input TEXT NOT NULL, \
	output TEXT NOT NULL, \
	risk_level TEXT NOT NULL, \
	acl_id TEXT, \
	group_id TEXT, \
	created_at BIGINT NOT NULL)";

const MYSQL_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS turn_audit (\
	id BIGINT AUTO_INCREMENT PRIMARY KEY, \
	session_id VARCHAR(128) NOT NULL, \
	input LONGTEXT NOT NULL, \
	output LONGTEXT NOT NULL, \
	risk_level VARCHAR(16) NOT NULL, \
	acl_id VARCHAR(128), \
	group_id VARCHAR(128), \
	created_at BIGINT NOT NULL)";

impl AuditService {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let pool = SqlitePoolOptions::new()
				.max_connections(1)
				.connect(database_url)
				.await
				.context("connect sqlite")?;
			AuditBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.max_connections(4)
				.connect(database_url)
				.await
				.context("connect postgres")?;
			AuditBackend::Postgres(pool)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = MySqlPoolOptions::new()
				.max_connections(4)
				.connect(database_url)
				.await
				.context("connect mysql")?;
			AuditBackend::Mysql(pool)
		} else {
			return Err(anyhow!("unsupported database_url for audit"));
		};

		let service = Self { backend: Some(backend) };
		service.ensure_schema().await?;
		Ok(service)
	}

	pub fn disabled() -> Self {
		Self { backend: None }
	}

	pub fn is_enabled(&self) -> bool {
		self.backend.is_some()
	}

	async fn ensure_schema(&self) -> anyhow::Result<()> {
		match &self.backend {
			None => {}
			Some(AuditBackend::Sqlite(pool)) => {
				sqlx::query(SQLITE_SCHEMA)
					.execute(pool)
					.await
					.context("create turn_audit (sqlite)")?;
			}
			Some(AuditBackend::Postgres(pool)) => {
				sqlx::query(POSTGRES_SCHEMA)
					.execute(pool)
					.await
					.context("create turn_audit (postgres)")?;
			}
			Some(AuditBackend::Mysql(pool)) => {
				sqlx::query(MYSQL_SCHEMA)
					.execute(pool)
					.await
					.context("create turn_audit (mysql)")?;
			}
		}
		Ok(())
	}

	pub async fn record_turn(&self, session_id: &str, record: &TurnRecord) -> anyhow::Result<()> {
		let Some(backend) = &self.backend else {
			return Ok(());
		};

		let created_at = unix_secs_now();
		match backend {
			AuditBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO turn_audit (session_id, input, output, risk_level, acl_id, group_id, created_at) \
					VALUES (?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(session_id)
				.bind(&record.input)
				.bind(&record.output)
				.bind(record.risk_level.as_str())
				.bind(record.acl_id.as_deref())
				.bind(record.group_id.as_deref())
				.bind(created_at)
				.execute(pool)
				.await
				.context("insert turn_audit (sqlite)")?;
			}
			AuditBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO turn_audit (session_id, input, output, risk_level, acl_id, group_id, created_at) \
					VALUES ($1, $2, $3, $4, $5, $6, $7)",
				)
				.bind(session_id)
				.bind(&record.input)
				.bind(&record.output)
				.bind(record.risk_level.as_str())
				.bind(record.acl_id.as_deref())
				.bind(record.group_id.as_deref())
				.bind(created_at)
				.execute(pool)
				.await
				.context("insert turn_audit (postgres)")?;
			}
			AuditBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO turn_audit (session_id, input, output, risk_level, acl_id, group_id, created_at) \
					VALUES (?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(session_id)
				.bind(&record.input)
				.bind(&record.output)
				.bind(record.risk_level.as_str())
				.bind(record.acl_id.as_deref())
				.bind(record.group_id.as_deref())
				.bind(created_at)
				.execute(pool)
				.await
				.context("insert turn_audit (mysql)")?;
			}
		}

		Ok(())
	}

	#[cfg(test)]
	pub async fn turns_for(&self, session_id: &str) -> anyhow::Result<Vec<(String, String, String)>> {
		let Some(AuditBackend::Sqlite(pool)) = &self.backend else {
			return Err(anyhow!("turns_for is only available on sqlite"));
		};

		let rows: Vec<(String, String, String)> =
			sqlx::query_as("SELECT input, output, risk_level FROM turn_audit WHERE session_id = ? ORDER BY id")
				.bind(session_id)
				.fetch_all(pool)
				.await
				.context("select turn_audit (sqlite)")?;
		Ok(rows)
	}
}

#[cfg(test)]
mod tests {
	use chatgate_domain::{AclVerdict, RiskLevel};

	use super::*;

	#[tokio::test]
	async fn disabled_service_accepts_writes() {
		let svc = AuditService::disabled();
		assert!(!svc.is_enabled());
		let record = TurnRecord::new("hi", &AclVerdict::default_allow());
		svc.record_turn("s1", &record).await.expect("noop");
	}

	#[tokio::test]
	async fn sqlite_mirror_stores_turns() {
		let svc = AuditService::connect("sqlite::memory:").await.expect("connect");

		let mut record = TurnRecord::new("drop table", &AclVerdict::default_allow());
		record.risk_level = RiskLevel::Reject;
		svc.record_turn("s1", &record).await.expect("insert");

		let mut ok = TurnRecord::new("hello", &AclVerdict::default_allow());
		ok.output = "hi there".to_string();
		svc.record_turn("s1", &ok).await.expect("insert");
		svc.record_turn("s2", &ok).await.expect("insert");

		let rows = svc.turns_for("s1").await.expect("select");
		assert_eq!(
			rows,
			vec![
				("drop table".to_string(), String::new(), "reject".to_string()),
				("hello".to_string(), "hi there".to_string(), "normal".to_string()),
			]
		);
	}

	#[tokio::test]
	async fn rejects_unknown_scheme() {
		assert!(AuditService::connect("redis://localhost").await.is_err());
	}
}
