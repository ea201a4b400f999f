//! Tenant-scoped persistence.
//!
//! Wraps the shared [`Database`] connection with the schema and CRUD spec.md
//! §3 describes. Every read/write that spec.md calls "tenant-scoped" takes an
//! explicit `owner_id` and folds it into the `WHERE` clause rather than
//! trusting the caller to have pre-filtered — this is the one place tenant
//! isolation (invariant 4) can leak if it's wrong, so every query here is
//! owner-scoped except the handful spec.md itself calls out as needing a
//! global key: `devices.ip_address` (C's pool key) and `sensors` at scheduler
//! startup (every tenant's sensors must be loaded to spawn workers).

use crate::types::*;
use crate::{Database, Error, Result};
use rusqlite::{params, OptionalExtension, Row};

#[derive(Clone)]
pub struct Store {
    db: Database,
}

fn row_credential(row: &Row) -> rusqlite::Result<Credential> {
    Ok(Credential {
        id: row.get("id")?,
        name: row.get("name")?,
        username: row.get("username")?,
        password: row.get("password")?,
        owner_id: row.get("owner_id")?,
    })
}

fn row_device(row: &Row) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get("id")?,
        client_name: row.get("client_name")?,
        ip_address: row.get("ip_address")?,
        node: row.get("node")?,
        mac: row.get("mac")?,
        status: row.get("status")?,
        credential_id: row.get("credential_id")?,
        is_maestro: row.get::<_, i64>("is_maestro")? != 0,
        maestro_id: row.get("maestro_id")?,
        vpn_profile_id: row.get("vpn_profile_id")?,
        owner_id: row.get("owner_id")?,
        last_auth_ok: row.get("last_auth_ok")?,
        last_auth_fail: row.get("last_auth_fail")?,
        rotations_count: row.get("rotations_count")?,
        wg_address: row.get("wg_address")?,
    })
}

fn row_vpn_profile(row: &Row) -> rusqlite::Result<VpnProfile> {
    Ok(VpnProfile {
        id: row.get("id")?,
        name: row.get("name")?,
        config_data: row.get("config_data")?,
        check_ip: row.get("check_ip")?,
        is_default: row.get::<_, i64>("is_default")? != 0,
        owner_id: row.get("owner_id")?,
    })
}

fn row_monitor(row: &Row) -> rusqlite::Result<Monitor> {
    Ok(Monitor { id: row.get("id")?, device_id: row.get("device_id")?, owner_id: row.get("owner_id")? })
}

fn row_sensor(row: &Row) -> rusqlite::Result<Sensor> {
    let sensor_type: String = row.get("sensor_type")?;
    let config_json: String = row.get("config")?;
    let config: SensorConfig = serde_json::from_str(&config_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Sensor {
        id: row.get("id")?,
        monitor_id: row.get("monitor_id")?,
        sensor_type: sensor_type.parse().unwrap_or(SensorType::Ping),
        name: row.get("name")?,
        config,
        owner_id: row.get("owner_id")?,
    })
}

fn row_channel(row: &Row) -> rusqlite::Result<NotificationChannel> {
    let channel_type: String = row.get("type")?;
    let config_json: String = row.get("config")?;
    Ok(NotificationChannel {
        id: row.get("id")?,
        name: row.get("name")?,
        channel_type: match channel_type.as_str() {
            "telegram" => ChannelType::Telegram,
            _ => ChannelType::Webhook,
        },
        config: serde_json::from_str(&config_json).unwrap_or(serde_json::Value::Null),
        owner_id: row.get("owner_id")?,
    })
}

impl Store {
    pub fn new(db: Database) -> Result<Self> {
        let store = Self { db };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                UNIQUE(owner_id, name)
            );
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                client_name TEXT NOT NULL,
                ip_address TEXT NOT NULL UNIQUE,
                node TEXT,
                mac TEXT,
                status TEXT NOT NULL DEFAULT 'unknown',
                credential_id TEXT,
                is_maestro INTEGER NOT NULL DEFAULT 0,
                maestro_id TEXT,
                vpn_profile_id TEXT,
                owner_id TEXT NOT NULL,
                last_auth_ok INTEGER,
                last_auth_fail INTEGER,
                rotations_count INTEGER NOT NULL DEFAULT 0,
                wg_address TEXT
            );
            CREATE TABLE IF NOT EXISTS vpn_profiles (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                config_data TEXT NOT NULL,
                check_ip TEXT,
                is_default INTEGER NOT NULL DEFAULT 0,
                owner_id TEXT NOT NULL,
                UNIQUE(owner_id, name)
            );
            CREATE TABLE IF NOT EXISTS monitors (
                id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL UNIQUE,
                owner_id TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sensors (
                id TEXT PRIMARY KEY,
                monitor_id TEXT NOT NULL,
                sensor_type TEXT NOT NULL,
                name TEXT NOT NULL,
                config TEXT NOT NULL,
                owner_id TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS notification_channels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                config TEXT NOT NULL,
                owner_id TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ping_results (
                sensor_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                latency_ms INTEGER,
                status TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ping_results_sensor ON ping_results(sensor_id, timestamp);
            CREATE TABLE IF NOT EXISTS ethernet_results (
                sensor_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                status TEXT NOT NULL,
                speed TEXT NOT NULL,
                rx_bitrate TEXT NOT NULL,
                tx_bitrate TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_eth_results_sensor ON ethernet_results(sensor_id, timestamp);
            CREATE TABLE IF NOT EXISTS alert_history (
                sensor_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                details TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS scan_sessions (
                session_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                claimed_device_id TEXT
            );
            CREATE TABLE IF NOT EXISTS vpn_profile_ordinals (
                ordinal INTEGER PRIMARY KEY AUTOINCREMENT,
                profile_id TEXT NOT NULL UNIQUE
            );
            "#,
        )?;
        Ok(())
    }

    // -- credentials ---------------------------------------------------

    pub fn create_credential(&self, c: &Credential) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO credentials (id, name, username, password, owner_id) VALUES (?1,?2,?3,?4,?5)",
            params![c.id, c.name, c.username, c.password, c.owner_id],
        )
        .map_err(|e| map_unique(e, "credential"))?;
        Ok(())
    }

    pub fn list_credentials(&self, owner_id: &str) -> Result<Vec<Credential>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM credentials WHERE owner_id = ?1")?;
        let rows = stmt.query_map(params![owner_id], row_credential)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_credential(&self, owner_id: &str, id: &str) -> Result<Credential> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            "SELECT * FROM credentials WHERE owner_id = ?1 AND id = ?2",
            params![owner_id, id],
            row_credential,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound { kind: "credential".into(), id: id.into() })
    }

    pub fn delete_credential(&self, owner_id: &str, id: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let n = conn.execute("DELETE FROM credentials WHERE owner_id = ?1 AND id = ?2", params![owner_id, id])?;
        if n == 0 {
            return Err(Error::NotFound { kind: "credential".into(), id: id.into() });
        }
        Ok(())
    }

    // -- devices ---------------------------------------------------------

    pub fn create_device(&self, d: &Device) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO devices (id, client_name, ip_address, node, mac, status, credential_id, is_maestro,
                maestro_id, vpn_profile_id, owner_id, last_auth_ok, last_auth_fail, rotations_count, wg_address)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                d.id, d.client_name, d.ip_address, d.node, d.mac, d.status, d.credential_id,
                d.is_maestro as i64, d.maestro_id, d.vpn_profile_id, d.owner_id, d.last_auth_ok,
                d.last_auth_fail, d.rotations_count, d.wg_address,
            ],
        )
        .map_err(|e| map_unique(e, "device"))?;
        Ok(())
    }

    pub fn list_devices(&self, owner_id: &str) -> Result<Vec<Device>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM devices WHERE owner_id = ?1")?;
        let rows = stmt.query_map(params![owner_id], row_device)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Every device across every tenant — used only at scheduler startup and
    /// by the keepalive loop, never exposed to a tenant-facing handler.
    pub fn list_all_devices(&self) -> Result<Vec<Device>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM devices")?;
        let rows = stmt.query_map([], row_device)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn search_devices(&self, owner_id: &str, q: &str) -> Result<Vec<Device>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let pattern = format!("%{q}%");
        let mut stmt = conn.prepare(
            "SELECT * FROM devices WHERE owner_id = ?1 AND (client_name LIKE ?2 OR ip_address LIKE ?2)",
        )?;
        let rows = stmt.query_map(params![owner_id, pattern], row_device)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_device(&self, owner_id: &str, id: &str) -> Result<Device> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row("SELECT * FROM devices WHERE owner_id = ?1 AND id = ?2", params![owner_id, id], row_device)
            .optional()?
            .ok_or_else(|| Error::NotFound { kind: "device".into(), id: id.into() })
    }

    /// Unqualified by tenant: `ip_address` is globally unique (spec.md §3)
    /// and this is component C's pool key.
    pub fn get_device_by_id_any_tenant(&self, id: &str) -> Result<Option<Device>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn.query_row("SELECT * FROM devices WHERE id = ?1", params![id], row_device).optional()?)
    }

    /// Unqualified by tenant, keyed by the pool's own key (`ip_address`).
    /// Used by the keepalive loop, which only has an IP to go on.
    pub fn get_device_by_ip_any_tenant(&self, ip: &str) -> Result<Option<Device>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn.query_row("SELECT * FROM devices WHERE ip_address = ?1", params![ip], row_device).optional()?)
    }

    pub fn promote_device(&self, owner_id: &str, id: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let n = conn.execute(
            "UPDATE devices SET is_maestro = 1, maestro_id = NULL, vpn_profile_id = NULL
             WHERE owner_id = ?1 AND id = ?2",
            params![owner_id, id],
        )?;
        if n == 0 {
            return Err(Error::NotFound { kind: "device".into(), id: id.into() });
        }
        Ok(())
    }

    /// Sets exactly one of `maestro_id`/`vpn_profile_id`, per the invariant
    /// that a non-maestro device is reached through at most one of the two.
    pub fn associate_vpn(&self, owner_id: &str, id: &str, maestro_id: Option<&str>, vpn_profile_id: Option<&str>) -> Result<()> {
        if maestro_id.is_some() && vpn_profile_id.is_some() {
            return Err(Error::InvalidConfig("device cannot have both maestro_id and vpn_profile_id".into()));
        }
        let conn = self.db.connection();
        let conn = conn.lock();
        let n = conn.execute(
            "UPDATE devices SET maestro_id = ?3, vpn_profile_id = ?4 WHERE owner_id = ?1 AND id = ?2",
            params![owner_id, id, maestro_id, vpn_profile_id],
        )?;
        if n == 0 {
            return Err(Error::NotFound { kind: "device".into(), id: id.into() });
        }
        Ok(())
    }

    pub fn delete_device(&self, owner_id: &str, id: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let n = conn.execute("DELETE FROM devices WHERE owner_id = ?1 AND id = ?2", params![owner_id, id])?;
        if n == 0 {
            return Err(Error::NotFound { kind: "device".into(), id: id.into() });
        }
        Ok(())
    }

    /// Component D step 6: atomic credential swap + counters.
    pub fn rotate_device_credential(&self, device_id: &str, new_credential_id: &str, now: i64) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE devices SET credential_id = ?2, last_auth_ok = ?3,
                rotations_count = COALESCE(rotations_count, 0) + 1 WHERE id = ?1",
            params![device_id, new_credential_id, now],
        )?;
        Ok(())
    }

    pub fn mark_auth_ok(&self, device_id: &str, now: i64) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute("UPDATE devices SET last_auth_ok = ?2 WHERE id = ?1", params![device_id, now])?;
        Ok(())
    }

    pub fn mark_auth_fail(&self, device_id: &str, now: i64) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute("UPDATE devices SET last_auth_fail = ?2 WHERE id = ?1", params![device_id, now])?;
        Ok(())
    }

    pub fn set_wg_address(&self, device_id: &str, wg_address: &str, now: i64) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        // Persistence failures on this optional column are swallowed by the
        // caller (spec.md §7); this just returns the error to let it decide.
        conn.execute(
            "UPDATE devices SET wg_address = ?2 WHERE id = ?1",
            params![device_id, wg_address],
        )?;
        let _ = now;
        Ok(())
    }

    // -- vpn profiles ------------------------------------------------------

    pub fn create_vpn_profile(&self, p: &VpnProfile) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        if p.is_default {
            conn.execute("UPDATE vpn_profiles SET is_default = 0 WHERE owner_id = ?1", params![p.owner_id])?;
        }
        conn.execute(
            "INSERT INTO vpn_profiles (id, name, config_data, check_ip, is_default, owner_id) VALUES (?1,?2,?3,?4,?5,?6)",
            params![p.id, p.name, p.config_data, p.check_ip, p.is_default as i64, p.owner_id],
        )
        .map_err(|e| map_unique(e, "vpn_profile"))?;
        Ok(())
    }

    pub fn list_vpn_profiles(&self, owner_id: &str) -> Result<Vec<VpnProfile>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM vpn_profiles WHERE owner_id = ?1")?;
        let rows = stmt.query_map(params![owner_id], row_vpn_profile)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_vpn_profile(&self, owner_id: &str, id: &str) -> Result<VpnProfile> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row("SELECT * FROM vpn_profiles WHERE owner_id = ?1 AND id = ?2", params![owner_id, id], row_vpn_profile)
            .optional()?
            .ok_or_else(|| Error::NotFound { kind: "vpn_profile".into(), id: id.into() })
    }

    pub fn update_vpn_profile(&self, p: &VpnProfile) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        if p.is_default {
            conn.execute(
                "UPDATE vpn_profiles SET is_default = 0 WHERE owner_id = ?1 AND id != ?2",
                params![p.owner_id, p.id],
            )?;
        }
        let n = conn
            .execute(
                "UPDATE vpn_profiles SET name = ?3, config_data = ?4, check_ip = ?5, is_default = ?6
                 WHERE owner_id = ?1 AND id = ?2",
                params![p.owner_id, p.id, p.name, p.config_data, p.check_ip, p.is_default as i64],
            )
            .map_err(|e| map_unique(e, "vpn_profile"))?;
        if n == 0 {
            return Err(Error::NotFound { kind: "vpn_profile".into(), id: p.id.clone() });
        }
        Ok(())
    }

    /// Unscoped lookup: used by the runtime (B/H) which only ever holds a
    /// `vpn_profile_id` resolved from a device row it already authorized.
    pub fn get_vpn_profile_any_tenant(&self, id: &str) -> Result<Option<VpnProfile>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn.query_row("SELECT * FROM vpn_profiles WHERE id = ?1", params![id], row_vpn_profile).optional()?)
    }

    /// Allocates (or returns the already-allocated) collision-free ordinal
    /// for a profile id, backing the PBR table/rule/iface namespace
    /// `vpn.rs` derives from it. `ordinal` is the table's `AUTOINCREMENT`
    /// rowid, so two distinct `profile_id`s can never be handed the same
    /// value — unlike hashing the id mod a bucket count, this can't collide
    /// (spec.md §5: "globally unique per profile id").
    pub fn allocate_vpn_ordinal(&self, profile_id: &str) -> Result<u32> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO vpn_profile_ordinals (profile_id) VALUES (?1)",
            params![profile_id],
        )?;
        let ordinal: i64 = conn.query_row(
            "SELECT ordinal FROM vpn_profile_ordinals WHERE profile_id = ?1",
            params![profile_id],
            |row| row.get(0),
        )?;
        Ok(ordinal as u32)
    }

    pub fn delete_vpn_profile(&self, owner_id: &str, id: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let n = conn.execute("DELETE FROM vpn_profiles WHERE owner_id = ?1 AND id = ?2", params![owner_id, id])?;
        if n == 0 {
            return Err(Error::NotFound { kind: "vpn_profile".into(), id: id.into() });
        }
        Ok(())
    }

    // -- monitors / sensors --------------------------------------------------

    pub fn create_monitor(&self, m: &Monitor) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO monitors (id, device_id, owner_id) VALUES (?1,?2,?3)",
            params![m.id, m.device_id, m.owner_id],
        )
        .map_err(|e| map_unique(e, "monitor"))?;
        Ok(())
    }

    pub fn list_monitors(&self, owner_id: &str) -> Result<Vec<Monitor>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM monitors WHERE owner_id = ?1")?;
        let rows = stmt.query_map(params![owner_id], row_monitor)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn delete_monitor(&self, owner_id: &str, id: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let n = conn.execute("DELETE FROM monitors WHERE owner_id = ?1 AND id = ?2", params![owner_id, id])?;
        if n == 0 {
            return Err(Error::NotFound { kind: "monitor".into(), id: id.into() });
        }
        Ok(())
    }

    pub fn create_sensor(&self, s: &Sensor) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let config_json = serde_json::to_string(&s.config)?;
        conn.execute(
            "INSERT INTO sensors (id, monitor_id, sensor_type, name, config, owner_id) VALUES (?1,?2,?3,?4,?5,?6)",
            params![s.id, s.monitor_id, s.sensor_type.to_string(), s.name, config_json, s.owner_id],
        )?;
        Ok(())
    }

    pub fn update_sensor(&self, s: &Sensor) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let config_json = serde_json::to_string(&s.config)?;
        let n = conn.execute(
            "UPDATE sensors SET name = ?3, config = ?4 WHERE owner_id = ?1 AND id = ?2",
            params![s.owner_id, s.id, s.name, config_json],
        )?;
        if n == 0 {
            return Err(Error::NotFound { kind: "sensor".into(), id: s.id.clone() });
        }
        Ok(())
    }

    pub fn list_all_sensors(&self) -> Result<Vec<Sensor>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM sensors")?;
        let rows = stmt.query_map([], row_sensor)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn list_sensors_by_monitor(&self, owner_id: &str, monitor_id: &str) -> Result<Vec<Sensor>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM sensors WHERE owner_id = ?1 AND monitor_id = ?2")?;
        let rows = stmt.query_map(params![owner_id, monitor_id], row_sensor)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// All sensors owned by a tenant, across every monitor — used by the WS
    /// fan-out's initial `sensor_batch` (spec.md §4.G).
    pub fn list_sensors_by_owner(&self, owner_id: &str) -> Result<Vec<Sensor>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM sensors WHERE owner_id = ?1")?;
        let rows = stmt.query_map(params![owner_id], row_sensor)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_sensor(&self, owner_id: &str, id: &str) -> Result<Sensor> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row("SELECT * FROM sensors WHERE owner_id = ?1 AND id = ?2", params![owner_id, id], row_sensor)
            .optional()?
            .ok_or_else(|| Error::NotFound { kind: "sensor".into(), id: id.into() })
    }

    pub fn get_sensor_any_tenant(&self, id: &str) -> Result<Option<Sensor>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn.query_row("SELECT * FROM sensors WHERE id = ?1", params![id], row_sensor).optional()?)
    }

    pub fn delete_sensor(&self, owner_id: &str, id: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let n = conn.execute("DELETE FROM sensors WHERE owner_id = ?1 AND id = ?2", params![owner_id, id])?;
        if n == 0 {
            return Err(Error::NotFound { kind: "sensor".into(), id: id.into() });
        }
        Ok(())
    }

    /// Resolves the device that owns a sensor through `monitors`. Per
    /// SPEC_FULL.md §13 Open Question 2, both history endpoints authorize
    /// through `monitors.owner_id`, so callers should prefer
    /// [`Store::get_sensor`] (owner-scoped) over this for authorization and
    /// use this only to find the device/monitor a sensor belongs to.
    pub fn device_for_sensor(&self, sensor: &Sensor) -> Result<Device> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let device_id: String = conn.query_row(
            "SELECT device_id FROM monitors WHERE id = ?1",
            params![sensor.monitor_id],
            |r| r.get(0),
        )?;
        drop(conn);
        self.get_device_by_id_any_tenant(&device_id)?
            .ok_or_else(|| Error::NotFound { kind: "device".into(), id: device_id })
    }

    // -- notification channels ----------------------------------------------

    pub fn create_channel(&self, c: &NotificationChannel) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let type_str = match c.channel_type { ChannelType::Webhook => "webhook", ChannelType::Telegram => "telegram" };
        conn.execute(
            "INSERT INTO notification_channels (id, name, type, config, owner_id) VALUES (?1,?2,?3,?4,?5)",
            params![c.id, c.name, type_str, c.config.to_string(), c.owner_id],
        )?;
        Ok(())
    }

    pub fn list_channels(&self, owner_id: &str) -> Result<Vec<NotificationChannel>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM notification_channels WHERE owner_id = ?1")?;
        let rows = stmt.query_map(params![owner_id], row_channel)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_channel(&self, owner_id: &str, id: &str) -> Result<NotificationChannel> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row("SELECT * FROM notification_channels WHERE owner_id = ?1 AND id = ?2", params![owner_id, id], row_channel)
            .optional()?
            .ok_or_else(|| Error::NotFound { kind: "channel".into(), id: id.into() })
    }

    pub fn get_channel_any_tenant(&self, id: &str) -> Result<Option<NotificationChannel>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn.query_row("SELECT * FROM notification_channels WHERE id = ?1", params![id], row_channel).optional()?)
    }

    pub fn delete_channel(&self, owner_id: &str, id: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let n = conn.execute("DELETE FROM notification_channels WHERE owner_id = ?1 AND id = ?2", params![owner_id, id])?;
        if n == 0 {
            return Err(Error::NotFound { kind: "channel".into(), id: id.into() });
        }
        Ok(())
    }

    // -- results & alert history ---------------------------------------------

    pub fn insert_ping_result(&self, r: &PingResult) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO ping_results (sensor_id, timestamp, latency_ms, status) VALUES (?1,?2,?3,?4)",
            params![r.sensor_id, r.timestamp, r.latency_ms, r.status],
        )?;
        Ok(())
    }

    pub fn insert_ethernet_result(&self, r: &EthernetResult) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO ethernet_results (sensor_id, timestamp, status, speed, rx_bitrate, tx_bitrate) VALUES (?1,?2,?3,?4,?5,?6)",
            params![r.sensor_id, r.timestamp, r.status, r.speed, r.rx_bitrate, r.tx_bitrate],
        )?;
        Ok(())
    }

    pub fn latest_ping_result(&self, sensor_id: &str) -> Result<Option<PingResult>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn
            .query_row(
                "SELECT sensor_id, timestamp, latency_ms, status FROM ping_results
                 WHERE sensor_id = ?1 ORDER BY timestamp DESC LIMIT 1",
                params![sensor_id],
                |row| {
                    Ok(PingResult {
                        sensor_id: row.get(0)?,
                        timestamp: row.get(1)?,
                        latency_ms: row.get(2)?,
                        status: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn latest_ethernet_result(&self, sensor_id: &str) -> Result<Option<EthernetResult>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn
            .query_row(
                "SELECT sensor_id, timestamp, status, speed, rx_bitrate, tx_bitrate FROM ethernet_results
                 WHERE sensor_id = ?1 ORDER BY timestamp DESC LIMIT 1",
                params![sensor_id],
                |row| {
                    Ok(EthernetResult {
                        sensor_id: row.get(0)?,
                        timestamp: row.get(1)?,
                        status: row.get(2)?,
                        speed: row.get(3)?,
                        rx_bitrate: row.get(4)?,
                        tx_bitrate: row.get(5)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn ping_results_range(&self, sensor_id: &str, since: i64, until: i64) -> Result<Vec<PingResult>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT sensor_id, timestamp, latency_ms, status FROM ping_results
             WHERE sensor_id = ?1 AND timestamp BETWEEN ?2 AND ?3 ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![sensor_id, since, until], |row| {
            Ok(PingResult { sensor_id: row.get(0)?, timestamp: row.get(1)?, latency_ms: row.get(2)?, status: row.get(3)? })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn ethernet_results_range(&self, sensor_id: &str, since: i64, until: i64) -> Result<Vec<EthernetResult>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT sensor_id, timestamp, status, speed, rx_bitrate, tx_bitrate FROM ethernet_results
             WHERE sensor_id = ?1 AND timestamp BETWEEN ?2 AND ?3 ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![sensor_id, since, until], |row| {
            Ok(EthernetResult {
                sensor_id: row.get(0)?,
                timestamp: row.get(1)?,
                status: row.get(2)?,
                speed: row.get(3)?,
                rx_bitrate: row.get(4)?,
                tx_bitrate: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn insert_alert_history(&self, a: &AlertHistoryEntry) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO alert_history (sensor_id, channel_id, timestamp, details) VALUES (?1,?2,?3,?4)",
            params![a.sensor_id, a.channel_id, a.timestamp, a.details],
        )?;
        Ok(())
    }

    /// Alert history for a tenant, joined through `sensors.owner_id`.
    pub fn alert_history_for_owner(&self, owner_id: &str, limit: i64) -> Result<Vec<AlertHistoryEntry>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ah.sensor_id, ah.channel_id, ah.timestamp, ah.details
             FROM alert_history ah JOIN sensors s ON s.id = ah.sensor_id
             WHERE s.owner_id = ?1 ORDER BY ah.timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![owner_id, limit], |row| {
            Ok(AlertHistoryEntry { sensor_id: row.get(0)?, channel_id: row.get(1)?, timestamp: row.get(2)?, details: row.get(3)? })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // -- QR pairing sessions --------------------------------------------------

    pub fn create_scan_session(&self, s: &ScanSession) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO scan_sessions (session_id, owner_id, created_at, claimed_device_id) VALUES (?1,?2,?3,?4)",
            params![s.session_id, s.owner_id, s.created_at, s.claimed_device_id],
        )?;
        Ok(())
    }

    pub fn get_scan_session(&self, session_id: &str) -> Result<Option<ScanSession>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn
            .query_row(
                "SELECT session_id, owner_id, created_at, claimed_device_id FROM scan_sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(ScanSession {
                        session_id: row.get(0)?,
                        owner_id: row.get(1)?,
                        created_at: row.get(2)?,
                        claimed_device_id: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn claim_scan_session(&self, session_id: &str, device_id: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE scan_sessions SET claimed_device_id = ?2 WHERE session_id = ?1",
            params![session_id, device_id],
        )?;
        Ok(())
    }

    pub fn delete_scan_session(&self, session_id: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute("DELETE FROM scan_sessions WHERE session_id = ?1", params![session_id])?;
        Ok(())
    }
}

fn map_unique(e: rusqlite::Error, kind: &str) -> Error {
    if let rusqlite::Error::SqliteFailure(ref err, _) = e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return Error::Conflict(format!("{kind} already exists"));
        }
    }
    Error::Database(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::new(Database::open_memory().unwrap()).unwrap()
    }

    #[test]
    fn credential_crud_is_owner_scoped() {
        let store = store();
        store
            .create_credential(&Credential { id: "c1".into(), name: "admin".into(), username: "u".into(), password: "p".into(), owner_id: "tenant-a".into() })
            .unwrap();
        assert_eq!(store.list_credentials("tenant-a").unwrap().len(), 1);
        assert_eq!(store.list_credentials("tenant-b").unwrap().len(), 0);
        assert!(store.get_credential("tenant-b", "c1").is_err());
    }

    #[test]
    fn duplicate_credential_name_conflicts() {
        let store = store();
        let cred = Credential { id: "c1".into(), name: "admin".into(), username: "u".into(), password: "p".into(), owner_id: "tenant-a".into() };
        store.create_credential(&cred).unwrap();
        let dup = Credential { id: "c2".into(), ..cred };
        assert!(matches!(store.create_credential(&dup), Err(Error::Conflict(_))));
    }

    #[test]
    fn rotation_increments_count_atomically() {
        let store = store();
        let device = Device {
            id: "d1".into(), client_name: "r1".into(), ip_address: "10.0.0.1".into(), node: None, mac: None,
            status: "unknown".into(), credential_id: Some("c1".into()), is_maestro: false, maestro_id: None,
            vpn_profile_id: None, owner_id: "t".into(), last_auth_ok: None, last_auth_fail: None, rotations_count: 0,
            wg_address: None,
        };
        store.create_device(&device).unwrap();
        store.rotate_device_credential("d1", "c2", 100).unwrap();
        store.rotate_device_credential("d1", "c3", 200).unwrap();
        let updated = store.get_device("t", "d1").unwrap();
        assert_eq!(updated.rotations_count, 2);
        assert_eq!(updated.credential_id.as_deref(), Some("c3"));
    }

    #[test]
    fn list_sensors_by_owner_spans_every_monitor() {
        let store = store();
        store.create_monitor(&Monitor { id: "m1".into(), device_id: "d1".into(), owner_id: "tenant-a".into() }).unwrap();
        store.create_monitor(&Monitor { id: "m2".into(), device_id: "d2".into(), owner_id: "tenant-a".into() }).unwrap();
        let ping_config = SensorConfig::Ping(PingSensorConfig {
            interval_sec: 30,
            latency_threshold_ms: 200,
            ping_type: PingType::DeviceToTarget,
            target_ip: Some("10.0.0.1".into()),
            alerts: vec![],
        });
        store.create_sensor(&Sensor { id: "s1".into(), monitor_id: "m1".into(), sensor_type: SensorType::Ping, name: "a".into(), config: ping_config.clone(), owner_id: "tenant-a".into() }).unwrap();
        store.create_sensor(&Sensor { id: "s2".into(), monitor_id: "m2".into(), sensor_type: SensorType::Ping, name: "b".into(), config: ping_config, owner_id: "tenant-a".into() }).unwrap();

        let sensors = store.list_sensors_by_owner("tenant-a").unwrap();
        assert_eq!(sensors.len(), 2);
        assert_eq!(store.list_sensors_by_owner("tenant-b").unwrap().len(), 0);
    }

    #[test]
    fn vpn_ordinal_allocation_is_stable_and_unique_per_profile() {
        let store = store();
        let a1 = store.allocate_vpn_ordinal("profile-a").unwrap();
        let b = store.allocate_vpn_ordinal("profile-b").unwrap();
        let a2 = store.allocate_vpn_ordinal("profile-a").unwrap();
        assert_eq!(a1, a2, "re-allocating for the same profile id must return the same ordinal");
        assert_ne!(a1, b, "distinct profile ids must never share an ordinal");
    }
}
