//! `sqlx`-backed implementation of the persistence operations the ingestion
//! pipeline needs. Schema/migration tooling is out of scope (see spec
//! Non-goals); this assumes the tables already exist.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use std::collections::HashMap;

use super::models::{
    sensor_map_to_json, AlertHistory, AlertRowRecord, AlertSeverity, CommandStatus, Device,
    DeviceState, GeofenceRecord, NotificationRecipient, PositionRecord, QueuedCommand, Trip,
};
use crate::error::ServerError;
use crate::notify::NotificationChannel;
use fleetlink_core::NormalizedPosition;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, ServerError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn find_device_by_imei(&self, imei: &str) -> Result<Option<Device>, ServerError> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT id, imei, protocol, name, enabled FROM devices WHERE imei = $1",
        )
        .bind(imei)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    pub async fn find_device_by_id(&self, device_id: Uuid) -> Result<Option<Device>, ServerError> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT id, imei, protocol, name, enabled FROM devices WHERE id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    /// Every enabled device, the sweep's device set so offline detection
    /// covers devices that haven't sent a position since the process
    /// started (the in-memory device map alone would miss those).
    pub async fn list_devices(&self) -> Result<Vec<Device>, ServerError> {
        let devices = sqlx::query_as::<_, Device>(
            "SELECT id, imei, protocol, name, enabled FROM devices WHERE enabled",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(devices)
    }

    pub async fn insert_position(
        &self,
        device_id: Uuid,
        position: &NormalizedPosition,
    ) -> Result<PositionRecord, ServerError> {
        let record = sqlx::query_as::<_, PositionRecord>(
            r#"
            INSERT INTO positions (id, device_id, device_time, latitude, longitude, speed, course, sensors)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, device_id, device_time, latitude, longitude, speed, course, sensors
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(device_id)
        .bind(position.device_time)
        .bind(position.latitude)
        .bind(position.longitude)
        .bind(position.speed)
        .bind(position.course)
        .bind(sensor_map_to_json(&position.sensors))
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn open_trip(
        &self,
        device_id: Uuid,
        started_at: DateTime<Utc>,
        start_lat: f64,
        start_lon: f64,
    ) -> Result<Trip, ServerError> {
        let trip = sqlx::query_as::<_, Trip>(
            r#"
            INSERT INTO trips (id, device_id, started_at, distance_km, start_latitude, start_longitude)
            VALUES ($1, $2, $3, 0, $4, $5)
            RETURNING id, device_id, started_at, ended_at, distance_km, start_latitude, start_longitude, end_latitude, end_longitude
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(device_id)
        .bind(started_at)
        .bind(start_lat)
        .bind(start_lon)
        .fetch_one(&self.pool)
        .await?;
        Ok(trip)
    }

    pub async fn close_trip(
        &self,
        trip_id: Uuid,
        ended_at: DateTime<Utc>,
        distance_km: f64,
        end_lat: f64,
        end_lon: f64,
    ) -> Result<(), ServerError> {
        sqlx::query(
            r#"
            UPDATE trips
            SET ended_at = $2, distance_km = $3, end_latitude = $4, end_longitude = $5
            WHERE id = $1
            "#,
        )
        .bind(trip_id)
        .bind(ended_at)
        .bind(distance_km)
        .bind(end_lat)
        .bind(end_lon)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts one `alert_history` row for a single recipient user. Callers
    /// fire this once per owning user of the device, not once per alert.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_alert(
        &self,
        device_id: Uuid,
        user_id: Uuid,
        alert_key: &str,
        severity: AlertSeverity,
        message: &str,
        lat: Option<f64>,
        lon: Option<f64>,
        metadata: &serde_json::Value,
    ) -> Result<AlertHistory, ServerError> {
        let row = sqlx::query_as::<_, AlertHistory>(
            r#"
            INSERT INTO alert_history
                (id, user_id, device_id, alert_key, severity, message, lat, lon, metadata, is_read, triggered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, false, now())
            RETURNING id, user_id, device_id, alert_key, severity, message, lat, lon, metadata, is_read, triggered_at, resolved_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(device_id)
        .bind(alert_key)
        .bind(severity)
        .bind(message)
        .bind(lat)
        .bind(lon)
        .bind(metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Loads a device's persisted hysteresis/trip state, if any has been
    /// saved for it yet. `DeviceState` is stored whole as a JSON blob since
    /// its shape (particularly `alert_states`) is module-defined.
    pub async fn load_device_state(
        &self,
        device_id: Uuid,
    ) -> Result<Option<DeviceState>, ServerError> {
        let value: Option<serde_json::Value> = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT state FROM device_state WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value.and_then(|v| serde_json::from_value(v).ok()))
    }

    pub async fn save_device_state(&self, state: &DeviceState) -> Result<(), ServerError> {
        let value = serde_json::to_value(state).unwrap_or(serde_json::Value::Null);
        sqlx::query(
            r#"
            INSERT INTO device_state (device_id, state, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (device_id) DO UPDATE SET state = $2, updated_at = now()
            "#,
        )
        .bind(state.device_id)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn resolve_alert(&self, alert_id: Uuid) -> Result<(), ServerError> {
        sqlx::query("UPDATE alert_history SET resolved_at = now() WHERE id = $1")
            .bind(alert_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn enqueue_command(
        &self,
        device_id: Uuid,
        command: &str,
        params: serde_json::Value,
        max_retries: i32,
    ) -> Result<QueuedCommand, ServerError> {
        let row = sqlx::query_as::<_, QueuedCommand>(
            r#"
            INSERT INTO command_queue (id, device_id, command, params, status, retries, max_retries, created_at)
            VALUES ($1, $2, $3, $4, 'pending', 0, $5, now())
            RETURNING id, device_id, command, params, status, retries, max_retries, created_at, sent_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(device_id)
        .bind(command)
        .bind(params)
        .bind(max_retries)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn pending_commands(&self, device_id: Uuid) -> Result<Vec<QueuedCommand>, ServerError> {
        let rows = sqlx::query_as::<_, QueuedCommand>(
            "SELECT id, device_id, command, params, status, retries, max_retries, created_at, sent_at \
             FROM command_queue WHERE device_id = $1 AND status = 'pending' ORDER BY created_at",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Alert rows configured for a device, including the global rows
    /// (`device_id IS NULL`) that apply to every device.
    pub async fn list_alert_rows(&self, device_id: Uuid) -> Result<Vec<AlertRowRecord>, ServerError> {
        let rows = sqlx::query_as::<_, AlertRowRecord>(
            r#"
            SELECT id, device_id, alert_key, enabled, schedule, params, name, rule, channels
            FROM alert_rows
            WHERE device_id = $1 OR device_id IS NULL
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Active geofences visible to a device (device-scoped plus global
    /// ones). Inactive geofences are excluded here rather than filtered by
    /// callers so every caller gets the same "active" definition.
    pub async fn list_geofences(&self, device_id: Uuid) -> Result<Vec<GeofenceRecord>, ServerError> {
        let rows = sqlx::query_as::<_, GeofenceRecord>(
            r#"
            SELECT id, device_id, name, shape, alert_on_enter, alert_on_exit, is_active
            FROM geofences
            WHERE (device_id = $1 OR device_id IS NULL) AND is_active
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Users who should receive alerts for this device, each with their own
    /// notification channels (`{name, url}` pairs).
    pub async fn list_alert_recipients(
        &self,
        device_id: Uuid,
    ) -> Result<Vec<NotificationRecipient>, ServerError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            user_id: Uuid,
            channel_name: Option<String>,
            channel_url: Option<String>,
        }

        let rows = sqlx::query_as::<_, Row>(
            r#"
            SELECT du.user_id AS user_id, nc.name AS channel_name, nc.url AS channel_url
            FROM device_owners du
            LEFT JOIN notification_channels nc ON nc.user_id = du.user_id
            WHERE du.device_id = $1
            ORDER BY du.user_id
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        let mut recipients: Vec<NotificationRecipient> = Vec::new();
        for row in rows {
            let recipient = match recipients.last_mut() {
                Some(r) if r.user_id == row.user_id => r,
                _ => {
                    recipients.push(NotificationRecipient {
                        user_id: row.user_id,
                        channels: Vec::new(),
                    });
                    recipients.last_mut().unwrap()
                }
            };
            if let (Some(name), Some(url)) = (row.channel_name, row.channel_url) {
                recipient.channels.push(NotificationChannel { name, url });
            }
        }
        Ok(recipients)
    }

    /// The device-level `alert_channels` override map (config key -> channel
    /// names), used by `select_channels` as the per-alert-type filter.
    pub async fn device_alert_channels(
        &self,
        device_id: Uuid,
    ) -> Result<HashMap<String, Vec<String>>, ServerError> {
        let value: Option<serde_json::Value> = sqlx::query_scalar::<_, Option<serde_json::Value>>(
            "SELECT alert_channels FROM devices WHERE id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?
        .flatten();
        Ok(value
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }

    pub async fn mark_command_status(
        &self,
        command_id: Uuid,
        status: CommandStatus,
    ) -> Result<(), ServerError> {
        sqlx::query("UPDATE command_queue SET status = $2, sent_at = now() WHERE id = $1")
            .bind(command_id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
