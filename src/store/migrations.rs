//! In-crate schema migrations, tracked via `PRAGMA user_version`.

use rusqlite::Connection;

const MIGRATIONS: &[&str] = &[V1_INITIAL_SCHEMA];

pub(crate) fn migrate(conn: &mut Connection) -> Result<(), rusqlite::Error> {
	let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
	for (index, sql) in MIGRATIONS.iter().enumerate().skip(version as usize) {
		let tx = conn.transaction()?;
		tx.execute_batch(sql)?;
		tx.pragma_update(None, "user_version", (index + 1) as i64)?;
		tx.commit()?;
		tracing::info!(version = index + 1, "applied schema migration");
	}
	Ok(())
}

// Timestamps are RFC 3339 text with offset; decimal columns are TEXT holding
// canonical base-10 strings. Uniqueness constraints back the upsert
// semantics, so retries are idempotent at the schema level.
const V1_INITIAL_SCHEMA: &str = r#"
CREATE TABLE currencies (
	id INTEGER PRIMARY KEY,
	symbol TEXT NOT NULL,
	decimals INTEGER NOT NULL,
	asset_class TEXT NOT NULL,
	network TEXT,
	contract_address TEXT,
	is_native INTEGER NOT NULL DEFAULT 0,
	created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX currencies_identity
	ON currencies (symbol, IFNULL(network, ''), IFNULL(contract_address, ''));

CREATE TABLE accounts (
	id INTEGER PRIMARY KEY,
	user_id TEXT,
	account_type TEXT NOT NULL,
	source_name TEXT NOT NULL,
	identifier TEXT NOT NULL,
	parent_account_id INTEGER REFERENCES accounts (id),
	provider_name TEXT,
	credentials TEXT,
	last_cursor TEXT NOT NULL DEFAULT '{}',
	verification TEXT,
	created_at TEXT NOT NULL,
	updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX accounts_identity
	ON accounts (account_type, source_name, identifier, IFNULL(user_id, ''));
CREATE INDEX accounts_parent ON accounts (parent_account_id);

CREATE TABLE import_sessions (
	id INTEGER PRIMARY KEY,
	correlation_id TEXT NOT NULL,
	account_id INTEGER NOT NULL REFERENCES accounts (id),
	status TEXT NOT NULL,
	started_at TEXT NOT NULL,
	completed_at TEXT,
	duration_ms INTEGER,
	transactions_imported INTEGER NOT NULL DEFAULT 0,
	transactions_skipped INTEGER NOT NULL DEFAULT 0,
	error_message TEXT,
	error_details TEXT
);
CREATE INDEX import_sessions_account ON import_sessions (account_id, started_at);

CREATE TABLE raw_transactions (
	id INTEGER PRIMARY KEY,
	session_id INTEGER NOT NULL REFERENCES import_sessions (id),
	source_name TEXT NOT NULL,
	provider_name TEXT NOT NULL,
	venue_transaction_id TEXT NOT NULL,
	transaction_type_hint TEXT NOT NULL,
	source_address TEXT,
	payload TEXT NOT NULL,
	normalized_preview TEXT,
	event_id TEXT NOT NULL,
	processing_status TEXT NOT NULL DEFAULT 'pending',
	error TEXT,
	created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX raw_transactions_event_id ON raw_transactions (event_id);
CREATE UNIQUE INDEX raw_transactions_identity
	ON raw_transactions (
		source_name,
		venue_transaction_id,
		transaction_type_hint,
		IFNULL(source_address, '')
	);
CREATE INDEX raw_transactions_session ON raw_transactions (session_id, processing_status);

CREATE TABLE canonical_transactions (
	id INTEGER PRIMARY KEY,
	external_id TEXT NOT NULL,
	source TEXT NOT NULL,
	timestamp INTEGER NOT NULL,
	datetime TEXT NOT NULL,
	status TEXT NOT NULL,
	operation_category TEXT NOT NULL,
	operation_type TEXT NOT NULL,
	metadata TEXT NOT NULL DEFAULT '{}',
	created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX canonical_transactions_identity
	ON canonical_transactions (external_id, source);
CREATE INDEX canonical_transactions_time ON canonical_transactions (timestamp);

CREATE TABLE movements (
	id INTEGER PRIMARY KEY,
	transaction_id INTEGER NOT NULL
		REFERENCES canonical_transactions (id) ON DELETE CASCADE,
	movement_id TEXT,
	direction TEXT NOT NULL,
	asset TEXT NOT NULL,
	gross_amount TEXT NOT NULL,
	net_amount TEXT NOT NULL,
	price_amount TEXT,
	price_currency TEXT,
	metadata TEXT
);
CREATE INDEX movements_transaction ON movements (transaction_id);

CREATE TABLE fees (
	id INTEGER PRIMARY KEY,
	transaction_id INTEGER NOT NULL
		REFERENCES canonical_transactions (id) ON DELETE CASCADE,
	amount TEXT NOT NULL,
	currency TEXT NOT NULL,
	scope TEXT NOT NULL,
	settlement TEXT NOT NULL,
	funded_from_movement_id TEXT
);
CREATE INDEX fees_transaction ON fees (transaction_id);
"#;
