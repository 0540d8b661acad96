//! Data targets and the per-target delivery log.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Result as SqlResult, Row};
use std::time::Duration;

use super::models::*;
use super::store::{format_db_time, parse_db_time, DbError, Store};

const TARGET_COLUMNS: &str = "id, name, application_id, type, url, timeout_ms, authorization_header, \
     username, password, client_id, client_secret, token_endpoint, tenant, context, mqtt_port, \
     mqtt_topic, mqtt_qos, last_message_date";

/// Targets loaded by ID. Rows that do not describe a usable target are
/// reported apart from the rest.
#[derive(Debug, Default)]
pub struct LoadedTargets {
    pub targets: Vec<DataTarget>,
    pub invalid: Vec<(i64, DbError)>,
}

struct TargetRow {
    id: i64,
    name: String,
    application_id: i64,
    target_type: String,
    url: Option<String>,
    timeout_ms: i64,
    authorization_header: Option<String>,
    username: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    token_endpoint: Option<String>,
    tenant: Option<String>,
    context: Option<String>,
    mqtt_port: Option<u16>,
    mqtt_topic: Option<String>,
    mqtt_qos: Option<u8>,
    last_message_date: Option<String>,
}

impl TargetRow {
    fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            application_id: row.get(2)?,
            target_type: row.get(3)?,
            url: row.get(4)?,
            timeout_ms: row.get(5)?,
            authorization_header: row.get(6)?,
            username: row.get(7)?,
            password: row.get(8)?,
            client_id: row.get(9)?,
            client_secret: row.get(10)?,
            token_endpoint: row.get(11)?,
            tenant: row.get(12)?,
            context: row.get(13)?,
            mqtt_port: row.get(14)?,
            mqtt_topic: row.get(15)?,
            mqtt_qos: row.get(16)?,
            last_message_date: row.get(17)?,
        })
    }

    fn url(&self) -> Result<String, DbError> {
        self.url
            .clone()
            .ok_or_else(|| DbError::InvalidRow(format!("data target {} has no url", self.id)))
    }

    /// OAuth2 wins over a static header, which wins over basic credentials.
    fn auth(&self) -> HttpAuth {
        if let (Some(token_endpoint), Some(client_id)) = (&self.token_endpoint, &self.client_id) {
            return HttpAuth::OAuth2 {
                client_id: client_id.clone(),
                client_secret: self.client_secret.clone(),
                token_endpoint: token_endpoint.clone(),
            };
        }
        if let Some(value) = &self.authorization_header {
            return HttpAuth::Header {
                value: value.clone(),
            };
        }
        if let Some(username) = &self.username {
            return HttpAuth::Basic {
                username: username.clone(),
                password: self.password.clone(),
            };
        }
        HttpAuth::None
    }

    fn into_target(self) -> Result<DataTarget, DbError> {
        let target_type = DataTargetType::parse(&self.target_type).ok_or_else(|| {
            DbError::InvalidRow(format!("unknown data target type '{}'", self.target_type))
        })?;
        let timeout = Duration::from_millis(self.timeout_ms.max(0) as u64);

        let kind = match target_type {
            DataTargetType::HttpPush => DataTargetKind::HttpPush {
                url: self.url()?,
                timeout,
                auth: self.auth(),
            },
            DataTargetType::Fiware => DataTargetKind::Fiware {
                url: self.url()?,
                timeout,
                auth: self.auth(),
                tenant: self.tenant.clone(),
                context: self.context.clone(),
            },
            DataTargetType::Mqtt => DataTargetKind::Mqtt(MqttTarget {
                url: self.url()?,
                port: self.mqtt_port,
                topic: self.mqtt_topic.clone().ok_or_else(|| {
                    DbError::InvalidRow(format!("mqtt data target {} has no topic", self.id))
                })?,
                qos: self.mqtt_qos.unwrap_or(0),
                timeout,
                username: self.username.clone(),
                password: self.password.clone(),
            }),
            DataTargetType::OpenDataDk => DataTargetKind::OpenDataDk,
        };

        Ok(DataTarget {
            id: self.id,
            name: self.name,
            application_id: self.application_id,
            kind,
            last_message_date: self.last_message_date.as_deref().and_then(parse_db_time),
        })
    }
}

/// Column values for the auth variants, in table order.
#[derive(Default)]
struct AuthColumns {
    authorization_header: Option<String>,
    username: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    token_endpoint: Option<String>,
}

impl From<&HttpAuth> for AuthColumns {
    fn from(auth: &HttpAuth) -> Self {
        match auth {
            HttpAuth::None => Self::default(),
            HttpAuth::Basic { username, password } => Self {
                username: Some(username.clone()),
                password: password.clone(),
                ..Self::default()
            },
            HttpAuth::Header { value } => Self {
                authorization_header: Some(value.clone()),
                ..Self::default()
            },
            HttpAuth::OAuth2 {
                client_id,
                client_secret,
                token_endpoint,
            } => Self {
                client_id: Some(client_id.clone()),
                client_secret: client_secret.clone(),
                token_endpoint: Some(token_endpoint.clone()),
                ..Self::default()
            },
        }
    }
}

impl Store {
    // --- Data targets ---

    /// Add a new data target and return its ID.
    pub fn add_data_target(&self, target: &mut DataTarget) -> Result<i64, DbError> {
        let mut url = None;
        let mut timeout = Duration::from_secs(30);
        let mut auth = AuthColumns::default();
        let mut tenant = None;
        let mut context = None;
        let mut mqtt = (None, None, None);

        match &target.kind {
            DataTargetKind::HttpPush {
                url: u,
                timeout: t,
                auth: a,
            } => {
                url = Some(u.clone());
                timeout = *t;
                auth = a.into();
            }
            DataTargetKind::Fiware {
                url: u,
                timeout: t,
                auth: a,
                tenant: te,
                context: c,
            } => {
                url = Some(u.clone());
                timeout = *t;
                auth = a.into();
                tenant = te.clone();
                context = c.clone();
            }
            DataTargetKind::Mqtt(m) => {
                url = Some(m.url.clone());
                timeout = m.timeout;
                auth.username = m.username.clone();
                auth.password = m.password.clone();
                mqtt = (m.port, Some(m.topic.clone()), Some(m.qos));
            }
            DataTargetKind::OpenDataDk => {}
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO data_targets (name, application_id, type, url, timeout_ms, authorization_header, \
             username, password, client_id, client_secret, token_endpoint, tenant, context, mqtt_port, \
             mqtt_topic, mqtt_qos) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                target.name,
                target.application_id,
                target.target_type().as_str(),
                url,
                timeout.as_millis() as i64,
                auth.authorization_header,
                auth.username,
                auth.password,
                auth.client_id,
                auth.client_secret,
                auth.token_endpoint,
                tenant,
                context,
                mqtt.0,
                mqtt.1,
                mqtt.2,
            ],
        )?;
        target.id = conn.last_insert_rowid();
        Ok(target.id)
    }

    /// Get a data target by ID.
    pub fn get_data_target(&self, id: i64) -> Result<DataTarget, DbError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {TARGET_COLUMNS} FROM data_targets WHERE id = ?1"),
                params![id],
                TargetRow::from_row,
            )
            .optional()?;
        row.ok_or(DbError::NotFound)?.into_target()
    }

    /// Load several data targets; unknown IDs are skipped.
    pub fn get_data_targets(&self, ids: &[i64]) -> Result<LoadedTargets, DbError> {
        let mut loaded = LoadedTargets::default();
        if ids.is_empty() {
            return Ok(loaded);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TARGET_COLUMNS} FROM data_targets WHERE id IN ({placeholders}) ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), TargetRow::from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        for row in rows {
            let id = row.id;
            match row.into_target() {
                Ok(target) => loaded.targets.push(target),
                Err(e) => loaded.invalid.push((id, e)),
            }
        }
        Ok(loaded)
    }

    /// Stamp the time of the latest send attempt.
    pub fn update_last_message_date(&self, id: i64, at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE data_targets SET last_message_date = ?1 WHERE id = ?2",
            params![format_db_time(at), id],
        )?;
        Ok(())
    }

    pub fn delete_data_target(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM data_targets WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Delivery log ---

    /// Append a delivery log entry, then drop the target's oldest entries beyond
    /// `max_events` (0 keeps everything).
    pub fn add_delivery_log_entry(
        &self,
        entry: &mut DeliveryLogEntry,
        max_events: usize,
    ) -> Result<i64, DbError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO delivery_log (created_at, data_target_id, device_id, payload_decoder_id, \
             status, status_code, message) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                format_db_time(entry.created_at),
                entry.data_target_id,
                entry.device_id,
                entry.payload_decoder_id,
                entry.status.as_str(),
                entry.status_code,
                entry.message,
            ],
        )?;
        entry.id = tx.last_insert_rowid();

        if max_events > 0 {
            tx.execute(
                "DELETE FROM delivery_log WHERE data_target_id = ?1 AND id NOT IN \
                 (SELECT id FROM delivery_log WHERE data_target_id = ?1 ORDER BY id DESC LIMIT ?2)",
                params![entry.data_target_id, max_events as i64],
            )?;
        }

        tx.commit()?;
        Ok(entry.id)
    }

    /// Newest first.
    pub fn list_delivery_log(&self, data_target_id: i64) -> Result<Vec<DeliveryLogEntry>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, data_target_id, device_id, payload_decoder_id, status, \
             status_code, message FROM delivery_log WHERE data_target_id = ?1 ORDER BY id DESC",
        )?;

        let rows = stmt
            .query_map(params![data_target_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<u16>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(id, created_at, data_target_id, device_id, payload_decoder_id, status, status_code, message)| {
                    Ok(DeliveryLogEntry {
                        id,
                        created_at: parse_db_time(&created_at).ok_or_else(|| {
                            DbError::InvalidRow(format!("bad created_at '{}'", created_at))
                        })?,
                        data_target_id,
                        device_id,
                        payload_decoder_id,
                        status: SendStatus::parse(&status).ok_or_else(|| {
                            DbError::InvalidRow(format!("unknown send status '{}'", status))
                        })?,
                        status_code,
                        message,
                    })
                },
            )
            .collect()
    }

    /// Subset of `data_target_ids` with at least one `ERROR` entry after `since`.
    pub fn targets_with_recent_error(
        &self,
        data_target_ids: &[i64],
        since: DateTime<Utc>,
    ) -> Result<Vec<i64>, DbError> {
        if data_target_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; data_target_ids.len()].join(", ");
        let mut values: Vec<rusqlite::types::Value> = data_target_ids
            .iter()
            .map(|id| rusqlite::types::Value::Integer(*id))
            .collect();
        values.push(rusqlite::types::Value::Text(format_db_time(since)));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT data_target_id FROM delivery_log \
             WHERE data_target_id IN ({placeholders}) AND status = 'ERROR' AND created_at > ? \
             ORDER BY data_target_id"
        ))?;
        let ids = stmt
            .query_map(params_from_iter(values), |row| row.get(0))?
            .collect::<SqlResult<Vec<i64>>>()?;
        Ok(ids)
    }
}
