//! Device registry: applications, devices, payload decoders and connections.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Result as SqlResult, Row};

use super::models::*;
use super::store::{format_db_time, parse_db_time, DbError, Store};

const DEVICE_COLUMNS: &str = "id, name, application_id, type, api_key, dev_eui, sigfox_device_id, \
     sigfox_device_type_id, downlink_payload, mqtt_url, mqtt_port, mqtt_topic, mqtt_username, \
     mqtt_password, ca_certificate, device_certificate, device_certificate_key, invalid_config, \
     last_received_at";

/// Flat `devices` row before the discriminator is checked.
struct DeviceRow {
    id: i64,
    name: String,
    application_id: i64,
    device_type: String,
    api_key: Option<String>,
    dev_eui: Option<String>,
    sigfox_device_id: Option<String>,
    sigfox_device_type_id: Option<String>,
    downlink_payload: Option<String>,
    mqtt_url: Option<String>,
    mqtt_port: Option<u16>,
    mqtt_topic: Option<String>,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    ca_certificate: Option<String>,
    device_certificate: Option<String>,
    device_certificate_key: Option<String>,
    invalid_config: bool,
    last_received_at: Option<String>,
}

impl DeviceRow {
    fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            application_id: row.get(2)?,
            device_type: row.get(3)?,
            api_key: row.get(4)?,
            dev_eui: row.get(5)?,
            sigfox_device_id: row.get(6)?,
            sigfox_device_type_id: row.get(7)?,
            downlink_payload: row.get(8)?,
            mqtt_url: row.get(9)?,
            mqtt_port: row.get(10)?,
            mqtt_topic: row.get(11)?,
            mqtt_username: row.get(12)?,
            mqtt_password: row.get(13)?,
            ca_certificate: row.get(14)?,
            device_certificate: row.get(15)?,
            device_certificate_key: row.get(16)?,
            invalid_config: row.get(17)?,
            last_received_at: row.get(18)?,
        })
    }

    fn required(&self, field: Option<String>, column: &str) -> Result<String, DbError> {
        field.ok_or_else(|| {
            DbError::InvalidRow(format!(
                "device {} of type {} has no {}",
                self.id, self.device_type, column
            ))
        })
    }

    fn subscription(&self) -> Result<MqttSubscription, DbError> {
        Ok(MqttSubscription {
            url: self.required(self.mqtt_url.clone(), "mqtt_url")?,
            port: self.mqtt_port.unwrap_or(1883),
            topic: self.required(self.mqtt_topic.clone(), "mqtt_topic")?,
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            ca_certificate: self.ca_certificate.clone(),
            device_certificate: self.device_certificate.clone(),
            device_certificate_key: self.device_certificate_key.clone(),
        })
    }

    fn into_device(self) -> Result<Device, DbError> {
        let device_type = DeviceType::parse(&self.device_type).ok_or_else(|| {
            DbError::InvalidRow(format!("unknown device type '{}'", self.device_type))
        })?;

        let kind = match device_type {
            DeviceType::GenericHttp => DeviceKind::GenericHttp {
                api_key: self.required(self.api_key.clone(), "api_key")?,
            },
            DeviceType::Lorawan => DeviceKind::LoRaWan {
                dev_eui: self.required(self.dev_eui.clone(), "dev_eui")?,
            },
            DeviceType::Sigfox => DeviceKind::SigFox {
                device_id: self.required(self.sigfox_device_id.clone(), "sigfox_device_id")?,
                device_type_id: self
                    .required(self.sigfox_device_type_id.clone(), "sigfox_device_type_id")?,
                downlink_payload: self.downlink_payload.clone(),
            },
            DeviceType::MqttInternalBroker => DeviceKind::MqttInternalBroker {
                username: self.mqtt_username.clone(),
            },
            DeviceType::MqttExternalBroker => DeviceKind::MqttExternalBroker(self.subscription()?),
            DeviceType::MqttSubscriber => DeviceKind::MqttSubscriber(self.subscription()?),
        };

        Ok(Device {
            id: self.id,
            name: self.name,
            application_id: self.application_id,
            kind,
            invalid_config: self.invalid_config,
            last_received_at: self.last_received_at.as_deref().and_then(parse_db_time),
        })
    }
}

impl Store {
    // --- Applications ---

    /// Add a new application and return its ID.
    pub fn add_application(&self, app: &mut Application) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO applications (name, organization_id) VALUES (?1, ?2)",
            params![app.name, app.organization_id],
        )?;
        app.id = conn.last_insert_rowid();
        Ok(app.id)
    }

    // --- Devices ---

    /// Add a new device and return its ID.
    pub fn add_device(&self, device: &mut Device) -> Result<i64, DbError> {
        let mut api_key = None;
        let mut dev_eui = None;
        let mut sigfox = (None, None, None);
        let mut mqtt_username = None;
        let mut sub: Option<&MqttSubscription> = None;

        match &device.kind {
            DeviceKind::GenericHttp { api_key: key } => api_key = Some(key.clone()),
            DeviceKind::LoRaWan { dev_eui: eui } => dev_eui = Some(eui.clone()),
            DeviceKind::SigFox {
                device_id,
                device_type_id,
                downlink_payload,
            } => {
                sigfox = (
                    Some(device_id.clone()),
                    Some(device_type_id.clone()),
                    downlink_payload.clone(),
                )
            }
            DeviceKind::MqttInternalBroker { username } => mqtt_username = username.clone(),
            DeviceKind::MqttExternalBroker(s) | DeviceKind::MqttSubscriber(s) => {
                mqtt_username = s.username.clone();
                sub = Some(s);
            }
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO devices (name, application_id, type, api_key, dev_eui, sigfox_device_id, \
             sigfox_device_type_id, downlink_payload, mqtt_url, mqtt_port, mqtt_topic, mqtt_username, \
             mqtt_password, ca_certificate, device_certificate, device_certificate_key, invalid_config) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                device.name,
                device.application_id,
                device.device_type().as_str(),
                api_key,
                dev_eui,
                sigfox.0,
                sigfox.1,
                sigfox.2,
                sub.map(|s| s.url.clone()),
                sub.map(|s| s.port),
                sub.map(|s| s.topic.clone()),
                mqtt_username,
                sub.and_then(|s| s.password.clone()),
                sub.and_then(|s| s.ca_certificate.clone()),
                sub.and_then(|s| s.device_certificate.clone()),
                sub.and_then(|s| s.device_certificate_key.clone()),
                device.invalid_config,
            ],
        )?;
        device.id = conn.last_insert_rowid();
        Ok(device.id)
    }

    /// Get a device by ID.
    pub fn get_device(&self, id: i64) -> Result<Device, DbError> {
        self.find_device_where("id = ?1", params![id])?
            .ok_or(DbError::NotFound)
    }

    /// Resolve a generic HTTP device by its API key.
    pub fn find_by_api_key(&self, api_key: &str) -> Result<Option<Device>, DbError> {
        self.find_device_where(
            "type = 'GENERIC_HTTP' AND api_key = ?1",
            params![api_key],
        )
    }

    /// Resolve a LoRaWAN device by DevEUI (case-insensitive).
    pub fn find_by_dev_eui(&self, dev_eui: &str) -> Result<Option<Device>, DbError> {
        self.find_device_where(
            "type = 'LORAWAN' AND lower(dev_eui) = lower(?1)",
            params![dev_eui],
        )
    }

    /// Resolve a SigFox device by its (deviceId, deviceTypeId) pair.
    pub fn find_sigfox_device(
        &self,
        device_id: &str,
        device_type_id: &str,
    ) -> Result<Option<Device>, DbError> {
        self.find_device_where(
            "type = 'SIGFOX' AND sigfox_device_id = ?1 AND sigfox_device_type_id = ?2",
            params![device_id, device_type_id],
        )
    }

    /// Resolve a device publishing through the internal broker.
    pub fn find_internal_mqtt_device(&self, id: i64) -> Result<Option<Device>, DbError> {
        self.find_device_where(
            "type = 'MQTT_INTERNAL_BROKER' AND id = ?1",
            params![id],
        )
    }

    /// External-broker devices whose configuration has not been flagged invalid.
    pub fn list_external_mqtt_devices(&self) -> Result<Vec<Device>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices \
             WHERE type IN ('MQTT_EXTERNAL_BROKER', 'MQTT_SUBSCRIBER') AND invalid_config = 0 \
             ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([], DeviceRow::from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        rows.into_iter().map(DeviceRow::into_device).collect()
    }

    /// Flag a device's MQTT configuration as broken.
    pub fn mark_mqtt_config_invalid(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE devices SET invalid_config = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Record that the device just sent us something.
    pub fn touch_device(&self, id: i64, at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE devices SET last_received_at = ?1 WHERE id = ?2",
            params![format_db_time(at), id],
        )?;
        Ok(())
    }

    /// Take the pending SigFox downlink, if any. Read and clear happen in one
    /// statement, so concurrent callers never both receive it.
    pub fn take_downlink(&self, id: i64) -> Result<Option<String>, DbError> {
        let conn = self.conn()?;
        let payload = conn
            .query_row(
                "UPDATE devices SET downlink_payload = NULL \
                 WHERE id = ?1 AND downlink_payload IS NOT NULL \
                 RETURNING downlink_payload",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(payload)
    }

    /// Delete a device. Connections cascade, delivery log links are nulled.
    pub fn delete_device(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM devices WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn find_device_where(
        &self,
        clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<Device>, DbError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE {clause} LIMIT 1"),
                params,
                DeviceRow::from_row,
            )
            .optional()?;
        row.map(DeviceRow::into_device).transpose()
    }

    // --- Payload decoders ---

    /// Add a payload decoder and return its ID.
    pub fn add_payload_decoder(&self, decoder: &mut PayloadDecoder) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO payload_decoders (name, organization_id, decoding_function) VALUES (?1, ?2, ?3)",
            params![decoder.name, decoder.organization_id, decoder.decoding_function],
        )?;
        decoder.id = conn.last_insert_rowid();
        Ok(decoder.id)
    }

    /// Get a payload decoder by ID.
    pub fn get_payload_decoder(&self, id: i64) -> Result<PayloadDecoder, DbError> {
        let conn = self.conn()?;
        let decoder = conn
            .query_row(
                "SELECT id, name, organization_id, decoding_function FROM payload_decoders WHERE id = ?1",
                params![id],
                |row| {
                    Ok(PayloadDecoder {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        organization_id: row.get(2)?,
                        decoding_function: row.get(3)?,
                    })
                },
            )
            .optional()?;
        decoder.ok_or(DbError::NotFound)
    }

    pub fn delete_payload_decoder(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM payload_decoders WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Connections ---

    /// Add a device/decoder/target connection and return its ID.
    pub fn add_connection(&self, connection: &mut Connection) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO connections (device_id, payload_decoder_id, data_target_id) VALUES (?1, ?2, ?3)",
            params![
                connection.device_id,
                connection.payload_decoder_id,
                connection.data_target_id
            ],
        )?;
        connection.id = conn.last_insert_rowid();
        Ok(connection.id)
    }

    /// All connections originating at a device.
    pub fn find_connections_by_device(&self, device_id: i64) -> Result<Vec<Connection>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, device_id, payload_decoder_id, data_target_id FROM connections \
             WHERE device_id = ?1 ORDER BY id",
        )?;
        let connections = stmt
            .query_map(params![device_id], |row| {
                Ok(Connection {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    payload_decoder_id: row.get(2)?,
                    data_target_id: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(connections)
    }

    /// Distinct target IDs connected to `device_id` through exactly `payload_decoder_id`
    /// (`None` matches only null-decoder connections).
    pub fn find_target_ids_by_device_and_decoder(
        &self,
        device_id: i64,
        payload_decoder_id: Option<i64>,
    ) -> Result<Vec<i64>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT data_target_id FROM connections \
             WHERE device_id = ?1 AND payload_decoder_id IS ?2 ORDER BY data_target_id",
        )?;
        let ids = stmt
            .query_map(params![device_id, payload_decoder_id], |row| row.get(0))?
            .collect::<SqlResult<Vec<i64>>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn store_with_app() -> (NamedTempFile, Store, i64) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut app = Application {
            id: 0,
            name: "Water".to_string(),
            organization_id: 1,
        };
        let app_id = store.add_application(&mut app).unwrap();
        (tmp, store, app_id)
    }

    fn device(app_id: i64, kind: DeviceKind) -> Device {
        Device {
            id: 0,
            name: "meter".to_string(),
            application_id: app_id,
            kind,
            invalid_config: false,
            last_received_at: None,
        }
    }

    #[test]
    fn test_device_lookups_by_transport_key() {
        let (_tmp, store, app_id) = store_with_app();

        let mut http = device(app_id, DeviceKind::GenericHttp { api_key: "abc123".to_string() });
        store.add_device(&mut http).unwrap();
        let mut lora = device(app_id, DeviceKind::LoRaWan { dev_eui: "70B3D5E75E00ABCD".to_string() });
        store.add_device(&mut lora).unwrap();
        let mut sigfox = device(
            app_id,
            DeviceKind::SigFox {
                device_id: "1A2B".to_string(),
                device_type_id: "Y".to_string(),
                downlink_payload: Some("0102".to_string()),
            },
        );
        store.add_device(&mut sigfox).unwrap();

        assert_eq!(store.find_by_api_key("abc123").unwrap().unwrap().id, http.id);
        assert!(store.find_by_api_key("nope").unwrap().is_none());
        assert_eq!(store.find_by_dev_eui("70b3d5e75e00abcd").unwrap().unwrap().id, lora.id);
        let found = store.find_sigfox_device("1A2B", "Y").unwrap().unwrap();
        assert_eq!(found, sigfox);
        assert!(store.find_sigfox_device("1A2B", "X").unwrap().is_none());

        assert_eq!(store.take_downlink(sigfox.id).unwrap().as_deref(), Some("0102"));
        assert_eq!(store.take_downlink(sigfox.id).unwrap(), None);
        assert_eq!(store.take_downlink(http.id).unwrap(), None);
        match store.get_device(sigfox.id).unwrap().kind {
            DeviceKind::SigFox { downlink_payload, .. } => assert!(downlink_payload.is_none()),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_invalid_external_devices_are_not_listed() {
        let (_tmp, store, app_id) = store_with_app();
        let sub = MqttSubscription {
            url: "mqtt://broker".to_string(),
            port: 1883,
            topic: "a/b".to_string(),
            username: None,
            password: None,
            ca_certificate: None,
            device_certificate: None,
            device_certificate_key: None,
        };
        let mut a = device(app_id, DeviceKind::MqttExternalBroker(sub.clone()));
        let mut b = device(app_id, DeviceKind::MqttSubscriber(sub));
        store.add_device(&mut a).unwrap();
        store.add_device(&mut b).unwrap();

        assert_eq!(store.list_external_mqtt_devices().unwrap().len(), 2);
        store.mark_mqtt_config_invalid(a.id).unwrap();
        let listed = store.list_external_mqtt_devices().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, b.id);
        assert!(store.get_device(a.id).unwrap().invalid_config);
    }

    #[test]
    fn test_connection_matching_by_decoder() {
        let (_tmp, store, app_id) = store_with_app();
        let mut d = device(app_id, DeviceKind::GenericHttp { api_key: "k".to_string() });
        store.add_device(&mut d).unwrap();
        let mut decoder = PayloadDecoder {
            id: 0,
            name: "p".to_string(),
            organization_id: 1,
            decoding_function: "payload".to_string(),
        };
        store.add_payload_decoder(&mut decoder).unwrap();

        let conn = store.conn().unwrap();
        conn.execute(
            "INSERT INTO data_targets (name, application_id, type, url) VALUES ('a', ?1, 'HTTP_PUSH', 'http://a'), ('b', ?1, 'HTTP_PUSH', 'http://b')",
            params![app_id],
        )
        .unwrap();
        drop(conn);

        for (decoder_id, target_id) in [(Some(decoder.id), 1), (Some(decoder.id), 1), (None, 2)] {
            let mut c = Connection {
                id: 0,
                device_id: d.id,
                payload_decoder_id: decoder_id,
                data_target_id: target_id,
            };
            store.add_connection(&mut c).unwrap();
        }

        assert_eq!(
            store.find_target_ids_by_device_and_decoder(d.id, Some(decoder.id)).unwrap(),
            vec![1]
        );
        assert_eq!(store.find_target_ids_by_device_and_decoder(d.id, None).unwrap(), vec![2]);

        store.delete_device(d.id).unwrap();
        assert!(store.find_connections_by_device(d.id).unwrap().is_empty());
    }
}
