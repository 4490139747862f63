//! Position processor: per-fix bookkeeping (odometer, trip lifecycle,
//! device state) followed by alert dispatch and bus fan-out.
//!
//! Per-device state mutation is serialized with a per-device lock held for
//! the whole pipeline, not just the map access: `locked_state` returns the
//! device's `Mutex` guard and `process`/`sweep_one` hold it across every
//! await point, so two positions for the same device can never interleave
//! (§5's "a device must not interleave two concurrent updates", satisfied
//! by the per-device-lock option it allows). Different devices proceed
//! fully in parallel since each gets its own `Mutex`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use fleetlink_core::geo::haversine_km;
use fleetlink_core::position::NormalizedPosition;

use crate::alert::engine::AlertEngine;
use crate::alert::{AlertOutcome, AlertRow};
use crate::bus::Bus;
use crate::error::ServerError;
use crate::notify::{select_channels, NotificationDispatcher};
use crate::storage::models::{Device, DeviceState};
use crate::storage::PgStore;

const MOVING_SPEED_THRESHOLD_KMH: f64 = 1.0;

pub struct Processor {
    store: PgStore,
    engine: AlertEngine,
    bus: Bus,
    notifier: Arc<NotificationDispatcher>,
    devices: RwLock<HashMap<Uuid, Arc<Mutex<DeviceState>>>>,
}

impl Processor {
    pub fn new(store: PgStore, bus: Bus, notifier: Arc<NotificationDispatcher>) -> Self {
        Processor {
            store,
            engine: AlertEngine::new(),
            bus,
            notifier,
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn store(&self) -> &PgStore {
        &self.store
    }

    /// Runs the full per-position pipeline described in the position
    /// processor module: odometer accumulation, trip transitions, alert
    /// dispatch, persistence and fan-out. Unknown or disabled IMEIs are
    /// dropped silently, matching the gateway's "not our device" policy.
    pub async fn process(&self, position: NormalizedPosition) -> Result<(), ServerError> {
        let position = position.sanitize();

        let device = match self.store.find_device_by_imei(&position.imei).await? {
            Some(d) if d.enabled => d,
            Some(_) => return Ok(()),
            None => {
                log::debug!("dropping position from unregistered imei {}", position.imei);
                return Ok(());
            }
        };

        let lock = self.device_lock(device.id).await?;
        let mut state = lock.lock().await;

        if let Some(prev) = &state.last_position {
            let delta_km = haversine_km(
                prev.latitude,
                prev.longitude,
                position.latitude,
                position.longitude,
            );
            state.odometer_km += delta_km;
            state.trip_odometer_km += delta_km;
        }

        self.apply_trip_transition(&device, &mut state, &position)
            .await?;

        state.last_ignition = position.ignition.or(state.last_ignition);
        state.last_seen = Some(position.server_time);
        state.last_position = Some(position.clone());

        self.store.insert_position(device.id, &position).await?;

        let rows = self.load_alert_rows(device.id).await?;
        let geofences = self.load_geofences(device.id).await?;
        let now = Utc::now();
        let fired =
            self.engine
                .dispatch_position(&position, &device, &mut state, &rows, &geofences, now);

        self.store.save_device_state(&state).await?;
        drop(state);

        self.bus.publish_position(device.id, position.clone());
        for outcome in &fired {
            self.persist_and_publish_alert(device.id, Some(&position), outcome)
                .await?;
        }

        Ok(())
    }

    /// Time-triggered sweep entry point, called once per tick for every
    /// enabled device known to storage — not just the ones this process has
    /// handled a position for since it started, so offline detection still
    /// fires after a restart.
    pub async fn sweep(&self) -> Result<(), ServerError> {
        let devices = self.store.list_devices().await?;
        for device in devices {
            if let Err(err) = self.sweep_one(device.id).await {
                log::warn!("sweep failed for device {}: {err}", device.id);
            }
        }
        Ok(())
    }

    async fn sweep_one(&self, device_id: Uuid) -> Result<(), ServerError> {
        let Some(device) = self.store.find_device_by_id(device_id).await? else {
            return Ok(());
        };
        let lock = self.device_lock(device_id).await?;
        let mut state = lock.lock().await;
        let rows = self.load_alert_rows(device_id).await?;
        let geofences = self.load_geofences(device_id).await?;
        let now = Utc::now();
        let fired = self
            .engine
            .sweep_device(&device, &mut state, &rows, &geofences, now);
        let position = state.last_position.clone();
        self.store.save_device_state(&state).await?;
        drop(state);
        for outcome in &fired {
            self.persist_and_publish_alert(device_id, position.as_ref(), outcome)
                .await?;
        }
        Ok(())
    }

    /// Records one `AlertHistory` row per user who owns the device and
    /// dispatches a notification to each of that user's selected channels.
    /// The bus publish happens exactly once regardless of recipient count.
    async fn persist_and_publish_alert(
        &self,
        device_id: Uuid,
        position: Option<&NormalizedPosition>,
        outcome: &AlertOutcome,
    ) -> Result<(), ServerError> {
        let alert_key = outcome
            .metadata
            .get("config_key")
            .and_then(|v| v.as_str())
            .unwrap_or("alert");
        let (lat, lon) = match position {
            Some(p) => (Some(p.latitude), Some(p.longitude)),
            None => (None, None),
        };

        let recipients = self.store.list_alert_recipients(device_id).await?;
        let alert_channels = self.store.device_alert_channels(device_id).await?;

        for recipient in &recipients {
            self.store
                .record_alert(
                    device_id,
                    recipient.user_id,
                    alert_key,
                    outcome.severity,
                    &outcome.message,
                    lat,
                    lon,
                    &outcome.metadata,
                )
                .await?;

            let selected = select_channels(
                &outcome.metadata,
                Some(&alert_channels),
                &recipient.channels,
            );
            let channels: Vec<_> = selected.into_iter().cloned().collect();
            self.notifier
                .dispatch(&channels, "Fleetlink Alert", &outcome.message)
                .await;
        }

        self.bus.publish_alert(device_id, outcome);
        Ok(())
    }

    async fn apply_trip_transition(
        &self,
        device: &Device,
        state: &mut DeviceState,
        position: &NormalizedPosition,
    ) -> Result<(), ServerError> {
        let Some(ignition) = position.ignition else {
            return Ok(());
        };
        let was_on = state.last_ignition.unwrap_or(false);

        if !was_on && ignition {
            let trip = self
                .store
                .open_trip(
                    device.id,
                    position.device_time,
                    position.latitude,
                    position.longitude,
                )
                .await?;
            state.current_trip_id = Some(trip.id);
            state.trip_odometer_km = 0.0;
        } else if was_on && !ignition {
            if let Some(trip_id) = state.current_trip_id.take() {
                self.store
                    .close_trip(
                        trip_id,
                        position.device_time,
                        state.trip_odometer_km,
                        position.latitude,
                        position.longitude,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn load_alert_rows(&self, device_id: Uuid) -> Result<Vec<AlertRow>, ServerError> {
        let records = self.store.list_alert_rows(device_id).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| AlertRow::try_from(r).ok())
            .collect())
    }

    async fn load_geofences(
        &self,
        device_id: Uuid,
    ) -> Result<Vec<crate::storage::models::Geofence>, ServerError> {
        let records = self.store.list_geofences(device_id).await?;
        Ok(records.into_iter().filter_map(|r| r.into_geofence().ok()).collect())
    }

    /// Returns this process's in-memory lock for a device, loading its
    /// persisted state from storage the first time it's touched this
    /// process lifetime rather than always starting from `DeviceState::new`
    /// — otherwise every hysteresis key (`speeding_since`, `offline_alerted`,
    /// …) and the odometer would reset on every restart.
    async fn device_lock(&self, device_id: Uuid) -> Result<Arc<Mutex<DeviceState>>, ServerError> {
        if let Some(lock) = self.devices.read().unwrap().get(&device_id) {
            return Ok(lock.clone());
        }
        let state = match self.store.load_device_state(device_id).await? {
            Some(state) => state,
            None => DeviceState::new(device_id),
        };
        let lock = self
            .devices
            .write()
            .unwrap()
            .entry(device_id)
            .or_insert_with(|| Arc::new(Mutex::new(state)))
            .clone();
        Ok(lock)
    }

    pub fn is_moving(speed_kmh: f64) -> bool {
        speed_kmh > MOVING_SPEED_THRESHOLD_KMH
    }
}
