//! The SQL zone store. The engine treats this as a keyed lookup service:
//! every function here is a single indexed query, because store calls run
//! inline on the event loop.

use crate::config::ConfigFile;
use crate::enums::RecordType;
use crate::error::SableError;
use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Row, Sqlite};
use std::str::FromStr;

pub type SqlPool = Pool<Sqlite>;

/// A `soa` table row: one zone of authority.
#[derive(Clone, Debug, FromRow)]
pub struct SoaRow {
    pub id: i64,
    /// Zone apex, lowercased, no trailing dot
    pub origin: String,
    pub ns: String,
    pub mbox: String,
    pub serial: i64,
    pub refresh: i64,
    pub retry: i64,
    pub expire: i64,
    pub minimum: i64,
    pub ttl: i64,
    pub active: i64,
    pub deleted_at: Option<i64>,
    /// CIDR list of peers allowed to transfer this zone, comma separated
    pub xfer: String,
    pub also_notify: String,
}

/// An `rr` table row. `name` is relative to the zone origin; the apex itself
/// is the empty string. `type` holds the standard mnemonic.
#[derive(Clone, Debug, FromRow)]
pub struct RrRow {
    pub id: i64,
    pub zone: i64,
    pub name: String,
    #[sqlx(rename = "type")]
    pub rrtype: String,
    pub data: String,
    pub aux: i64,
    pub ttl: i64,
    pub active: i64,
    /// Set when the row was last touched; drives delta expiry
    pub stamp: Option<i64>,
    /// The zone serial the change belongs to
    pub serial: Option<i64>,
}

#[derive(Clone, Debug, FromRow)]
pub struct DnssecKeyRow {
    pub zone_id: i64,
    pub algorithm: i64,
    pub key_tag: i64,
    /// KSK, ZSK or CSK
    pub key_type: String,
    pub public_key: String,
    pub active: i64,
}

#[derive(Clone, Debug, FromRow)]
pub struct RrsigRow {
    pub zone_id: i64,
    pub name: String,
    #[sqlx(rename = "type")]
    pub rrtype: String,
    pub algorithm: i64,
    pub labels: i64,
    pub original_ttl: i64,
    pub signature_expiration: i64,
    pub signature_inception: i64,
    pub key_tag: i64,
    pub signer_name: String,
    pub signature: String,
}

#[derive(Clone, Debug, FromRow)]
pub struct Nsec3Row {
    pub zone_id: i64,
    pub hash_algorithm: i64,
    pub flags: i64,
    pub iterations: i64,
    /// hex encoded
    pub salt: String,
    /// base32hex owner hash label
    pub hash: String,
    /// hex encoded
    pub next_hash: String,
    /// space separated mnemonics present at the hashed owner
    pub types: String,
}

#[derive(Clone, Debug, FromRow)]
pub struct TsigKeyRow {
    pub name: String,
    pub algorithm: String,
    /// base64 encoded shared secret
    pub secret: String,
    pub enabled: i64,
}

#[derive(Clone, Debug, FromRow)]
pub struct AclRow {
    pub target: String,
    #[sqlx(rename = "type")]
    pub rule_type: String,
    pub value: String,
    pub action: String,
    pub priority: i64,
    pub enabled: i64,
}

pub async fn get_conn(config: &ConfigFile) -> Result<SqlPool, SableError> {
    let db_path = shellexpand::tilde(&config.sqlite_path).to_string();
    debug!("Opening zone store at {db_path}");
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))
        .map_err(|e| SableError::Startup(format!("Bad sqlite path {db_path}: {e:?}")))?
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .connect_with(options)
        .await
        .map_err(|e| SableError::Startup(format!("Failed to open zone store: {e:?}")))
}

/// An in-memory store for tests and ad-hoc runs.
pub async fn get_memory_conn() -> Result<SqlPool, SableError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| SableError::Startup(format!("{e:?}")))?;
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| SableError::Startup(format!("{e:?}")))
}

/// Bootstrap the schema. Every statement is idempotent; the admin plane owns
/// migrations beyond this.
pub async fn create_tables(pool: &SqlPool) -> Result<(), SableError> {
    let statements = [
        r#"CREATE TABLE IF NOT EXISTS soa (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            origin TEXT NOT NULL UNIQUE,
            ns TEXT NOT NULL,
            mbox TEXT NOT NULL,
            serial INTEGER NOT NULL DEFAULT 1,
            refresh INTEGER NOT NULL DEFAULT 28800,
            retry INTEGER NOT NULL DEFAULT 7200,
            expire INTEGER NOT NULL DEFAULT 604800,
            minimum INTEGER NOT NULL DEFAULT 86400,
            ttl INTEGER NOT NULL DEFAULT 86400,
            active INTEGER NOT NULL DEFAULT 1,
            deleted_at INTEGER,
            xfer TEXT NOT NULL DEFAULT '',
            also_notify TEXT NOT NULL DEFAULT '')"#,
        r#"CREATE TABLE IF NOT EXISTS rr (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            zone INTEGER NOT NULL,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            data TEXT NOT NULL,
            aux INTEGER NOT NULL DEFAULT 0,
            ttl INTEGER NOT NULL DEFAULT 86400,
            active INTEGER NOT NULL DEFAULT 1,
            stamp INTEGER,
            serial INTEGER,
            deleted_at INTEGER,
            FOREIGN KEY (zone) REFERENCES soa (id))"#,
        "CREATE INDEX IF NOT EXISTS ind_rr_lookup ON rr (zone, name, type, active)",
        "CREATE INDEX IF NOT EXISTS ind_rr_serial ON rr (zone, serial)",
        r#"CREATE TABLE IF NOT EXISTS dnssec_config (
            zone_id INTEGER PRIMARY KEY,
            dnssec_enabled INTEGER NOT NULL DEFAULT 0,
            nsec_mode TEXT NOT NULL DEFAULT 'nsec3')"#,
        r#"CREATE TABLE IF NOT EXISTS dnssec_keys (
            zone_id INTEGER NOT NULL,
            algorithm INTEGER NOT NULL,
            key_tag INTEGER NOT NULL,
            key_type TEXT NOT NULL,
            public_key TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1)"#,
        r#"CREATE TABLE IF NOT EXISTS dnssec_signatures (
            zone_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            algorithm INTEGER NOT NULL,
            labels INTEGER NOT NULL,
            original_ttl INTEGER NOT NULL,
            signature_expiration INTEGER NOT NULL,
            signature_inception INTEGER NOT NULL,
            key_tag INTEGER NOT NULL,
            signer_name TEXT NOT NULL,
            signature TEXT NOT NULL)"#,
        "CREATE INDEX IF NOT EXISTS ind_sig_lookup ON dnssec_signatures (zone_id, name, type)",
        r#"CREATE TABLE IF NOT EXISTS dnssec_nsec3 (
            zone_id INTEGER NOT NULL,
            hash_algorithm INTEGER NOT NULL DEFAULT 1,
            flags INTEGER NOT NULL DEFAULT 0,
            iterations INTEGER NOT NULL DEFAULT 0,
            salt TEXT NOT NULL DEFAULT '',
            hash TEXT NOT NULL,
            next_hash TEXT NOT NULL,
            types TEXT NOT NULL DEFAULT '')"#,
        r#"CREATE TABLE IF NOT EXISTS tsig_keys (
            name TEXT PRIMARY KEY,
            algorithm TEXT NOT NULL DEFAULT 'hmac-sha256',
            secret TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1)"#,
        r#"CREATE TABLE IF NOT EXISTS access_control (
            target TEXT NOT NULL DEFAULT 'query',
            type TEXT NOT NULL DEFAULT 'network',
            value TEXT NOT NULL,
            action TEXT NOT NULL DEFAULT 'allow',
            priority INTEGER NOT NULL DEFAULT 100,
            enabled INTEGER NOT NULL DEFAULT 1)"#,
    ];
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("Zone store schema is in place");
    Ok(())
}

const SOA_COLUMNS: &str =
    "id, origin, ns, mbox, serial, refresh, retry, expire, minimum, ttl, active, deleted_at, xfer, also_notify";
const RR_COLUMNS: &str = "id, zone, name, type, data, aux, ttl, active, stamp, serial";

pub async fn zone_by_origin(pool: &SqlPool, origin: &str) -> Result<Option<SoaRow>, SableError> {
    let res = sqlx::query_as::<_, SoaRow>(&format!(
        "SELECT {SOA_COLUMNS} FROM soa WHERE origin = ? AND active = 1"
    ))
    .bind(origin)
    .fetch_optional(pool)
    .await?;
    Ok(res)
}

/// Exact-match lookup at (zone, relative name, type). ANY returns every
/// type at the name.
pub async fn records_exact(
    pool: &SqlPool,
    zone: i64,
    name: &str,
    rrtype: RecordType,
) -> Result<Vec<RrRow>, SableError> {
    let rows = match rrtype {
        RecordType::ANY => {
            sqlx::query_as::<_, RrRow>(&format!(
                "SELECT {RR_COLUMNS} FROM rr WHERE zone = ? AND name = ? AND active = 1"
            ))
            .bind(zone)
            .bind(name)
            .fetch_all(pool)
            .await?
        }
        _ => {
            let mnemonic: &'static str = rrtype.into();
            sqlx::query_as::<_, RrRow>(&format!(
                "SELECT {RR_COLUMNS} FROM rr WHERE zone = ? AND name = ? AND type = ? AND active = 1"
            ))
            .bind(zone)
            .bind(name)
            .bind(mnemonic)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

/// Does the name exist at all in the zone - as an owner or as an ancestor of
/// one? Distinguishes NXDOMAIN from NODATA.
pub async fn name_exists(pool: &SqlPool, zone: i64, name: &str) -> Result<bool, SableError> {
    let row = match name.is_empty() {
        // the apex exists as long as the zone does
        true => return Ok(true),
        false => {
            sqlx::query(
                "SELECT count(*) AS hits FROM rr WHERE zone = ? AND active = 1 AND (name = ? OR name LIKE '%.' || ?)",
            )
            .bind(zone)
            .bind(name)
            .bind(name)
            .fetch_one(pool)
            .await?
        }
    };
    let hits: i64 = row.try_get("hits")?;
    Ok(hits > 0)
}

/// Every active row of the zone, apex rows first - the AXFR body.
pub async fn zone_records_active(pool: &SqlPool, zone: i64) -> Result<Vec<RrRow>, SableError> {
    let rows = sqlx::query_as::<_, RrRow>(&format!(
        "SELECT {RR_COLUMNS} FROM rr WHERE zone = ? AND active = 1 ORDER BY name, type"
    ))
    .bind(zone)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Whether the rr table carries the columns the IXFR delta path needs.
/// Stores migrated from older schemas may not.
pub async fn rr_has_delta_columns(pool: &SqlPool) -> Result<bool, SableError> {
    let rows = sqlx::query("PRAGMA table_info(rr)").fetch_all(pool).await?;
    let mut found = 0;
    for row in rows {
        let column: String = row.try_get("name")?;
        if ["active", "stamp", "serial"].contains(&column.as_str()) {
            found += 1;
        }
    }
    Ok(found == 3)
}

/// Rows deleted and added since the client's serial, for sizing the delta.
pub async fn ixfr_counts(
    pool: &SqlPool,
    zone: i64,
    since_serial: i64,
) -> Result<(i64, i64, i64), SableError> {
    let deleted: i64 = sqlx::query(
        "SELECT count(*) AS hits FROM rr WHERE zone = ? AND active = 0 AND serial > ?",
    )
    .bind(zone)
    .bind(since_serial)
    .fetch_one(pool)
    .await?
    .try_get("hits")?;
    let added: i64 = sqlx::query(
        "SELECT count(*) AS hits FROM rr WHERE zone = ? AND active = 1 AND serial > ?",
    )
    .bind(zone)
    .bind(since_serial)
    .fetch_one(pool)
    .await?
    .try_get("hits")?;
    let full: i64 = sqlx::query("SELECT count(*) AS hits FROM rr WHERE zone = ? AND active = 1")
        .bind(zone)
        .fetch_one(pool)
        .await?
        .try_get("hits")?;
    Ok((deleted, added, full))
}

/// The rows for an RFC 1995 delta: what left the zone and what arrived,
/// both since the client's serial.
pub async fn ixfr_deltas(
    pool: &SqlPool,
    zone: i64,
    since_serial: i64,
) -> Result<(Vec<RrRow>, Vec<RrRow>), SableError> {
    let deleted = sqlx::query_as::<_, RrRow>(&format!(
        "SELECT {RR_COLUMNS} FROM rr WHERE zone = ? AND active = 0 AND serial > ? ORDER BY serial, name"
    ))
    .bind(zone)
    .bind(since_serial)
    .fetch_all(pool)
    .await?;
    let added = sqlx::query_as::<_, RrRow>(&format!(
        "SELECT {RR_COLUMNS} FROM rr WHERE zone = ? AND active = 1 AND serial > ? ORDER BY serial, name"
    ))
    .bind(zone)
    .bind(since_serial)
    .fetch_all(pool)
    .await?;
    Ok((deleted, added))
}

/// Purge tombstoned rows whose stamp fell behind the zone's expire window.
/// Runs from the periodic GC task, never from the request path.
pub async fn expire_deleted_rows(pool: &SqlPool, now: i64) -> Result<u64, SableError> {
    let zones = sqlx::query("SELECT id, expire FROM soa WHERE active = 1")
        .fetch_all(pool)
        .await?;
    let mut removed = 0u64;
    for zone in zones {
        let id: i64 = zone.try_get("id")?;
        let expire: i64 = zone.try_get("expire")?;
        let res = sqlx::query("DELETE FROM rr WHERE zone = ? AND active = 0 AND stamp < ?")
            .bind(id)
            .bind(now - expire)
            .execute(pool)
            .await?;
        removed += res.rows_affected();
    }
    Ok(removed)
}

pub async fn zone_dnssec_enabled(pool: &SqlPool, zone: i64) -> Result<bool, SableError> {
    let row = sqlx::query("SELECT dnssec_enabled FROM dnssec_config WHERE zone_id = ?")
        .bind(zone)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => {
            let enabled: i64 = row.try_get("dnssec_enabled")?;
            Ok(enabled != 0)
        }
        None => Ok(false),
    }
}

/// Unexpired signatures over (zone, name, type), newest-expiry first,
/// bounded by `cap`.
pub async fn rrsigs_for(
    pool: &SqlPool,
    zone: i64,
    name: &str,
    rrtype: RecordType,
    now: i64,
    cap: i64,
) -> Result<Vec<RrsigRow>, SableError> {
    let mnemonic: &'static str = rrtype.into();
    let rows = sqlx::query_as::<_, RrsigRow>(
        "SELECT zone_id, name, type, algorithm, labels, original_ttl, signature_expiration, \
         signature_inception, key_tag, signer_name, signature \
         FROM dnssec_signatures \
         WHERE zone_id = ? AND name = ? AND type = ? AND signature_expiration > ? \
         ORDER BY signature_expiration DESC LIMIT ?",
    )
    .bind(zone)
    .bind(name)
    .bind(mnemonic)
    .bind(now)
    .bind(cap)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn dnssec_keys_active(
    pool: &SqlPool,
    zone: i64,
) -> Result<Vec<DnssecKeyRow>, SableError> {
    let rows = sqlx::query_as::<_, DnssecKeyRow>(
        "SELECT zone_id, algorithm, key_tag, key_type, public_key, active \
         FROM dnssec_keys WHERE zone_id = ? AND active = 1",
    )
    .bind(zone)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn nsec3_rows(pool: &SqlPool, zone: i64, cap: i64) -> Result<Vec<Nsec3Row>, SableError> {
    let rows = sqlx::query_as::<_, Nsec3Row>(
        "SELECT zone_id, hash_algorithm, flags, iterations, salt, hash, next_hash, types \
         FROM dnssec_nsec3 WHERE zone_id = ? LIMIT ?",
    )
    .bind(zone)
    .bind(cap)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn tsig_key(pool: &SqlPool, name: &str) -> Result<Option<TsigKeyRow>, SableError> {
    let row = sqlx::query_as::<_, TsigKeyRow>(
        "SELECT name, algorithm, secret, enabled FROM tsig_keys WHERE name = ? AND enabled = 1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Every enabled ACL rule, ordered so the first match decides.
pub async fn acl_rows(pool: &SqlPool) -> Result<Vec<AclRow>, SableError> {
    let rows = sqlx::query_as::<_, AclRow>(
        "SELECT target, type, value, action, priority, enabled \
         FROM access_control WHERE enabled = 1 ORDER BY priority ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
