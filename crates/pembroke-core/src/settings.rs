use chrono::{DateTime, Duration, FixedOffset, NaiveTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{Database, DbError};

const SETTINGS_COLUMNS: &str = "id, require_approval_above_confidence, default_tone, signature, working_hours_enabled, working_hours_start, working_hours_end, utc_offset_minutes, updated_at";

const SETTINGS_ROW_ID: &str = "default";

/// Read-only snapshot of the user's automation preferences. The engine never
/// writes these; rule-management owns mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    /// Confidence floor above which a safe reply may go out unattended.
    pub require_approval_above_confidence: f64,
    pub default_tone: String,
    pub signature: Option<String>,
    pub working_hours_enabled: bool,
    /// "HH:MM", local to `utc_offset_minutes`.
    pub working_hours_start: String,
    pub working_hours_end: String,
    pub utc_offset_minutes: i32,
    pub updated_at: DateTime<Utc>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            require_approval_above_confidence: 0.8,
            default_tone: "professional".into(),
            signature: None,
            working_hours_enabled: false,
            working_hours_start: "09:00".into(),
            working_hours_end: "17:00".into(),
            utc_offset_minutes: 0,
            updated_at: Utc::now(),
        }
    }
}

impl UserSettings {
    /// When sends are restricted to working hours and `now` falls outside the
    /// window, returns the next window opening; `None` means send immediately.
    pub fn send_delay_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.working_hours_enabled {
            return None;
        }
        let start = parse_hhmm(&self.working_hours_start)?;
        let end = parse_hhmm(&self.working_hours_end)?;
        if start == end {
            return None;
        }

        let offset = FixedOffset::east_opt(self.utc_offset_minutes * 60)?;
        let local = now.with_timezone(&offset);
        let time = local.time();

        let inside = if start < end {
            time >= start && time < end
        } else {
            // Overnight window, e.g. 22:00 -> 06:00.
            time >= start || time < end
        };
        if inside {
            return None;
        }

        let today_open = local
            .date_naive()
            .and_time(start)
            .and_local_timezone(offset)
            .single()?;
        let next_open = if local < today_open {
            today_open
        } else {
            today_open + Duration::days(1)
        };
        Some(next_open.with_timezone(&Utc))
    }
}

fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    let (hours, minutes) = value.split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    NaiveTime::from_hms_opt(hours, minutes, 0)
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
}

#[derive(Clone)]
pub struct SettingsRepository {
    db: Database,
}

impl SettingsRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Stored settings, or defaults when the user never saved any.
    pub async fn get_or_default(&self) -> Result<UserSettings, SettingsError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {SETTINGS_COLUMNS} FROM user_settings WHERE id = ?1"),
                params![SETTINGS_ROW_ID],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_settings(row),
            None => Ok(UserSettings::default()),
        }
    }

    pub async fn save(&self, settings: &UserSettings) -> Result<(), SettingsError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.db.connection().await?;
        conn.execute(
            "INSERT INTO user_settings (id, require_approval_above_confidence, default_tone, signature, working_hours_enabled, working_hours_start, working_hours_end, utc_offset_minutes, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                require_approval_above_confidence = excluded.require_approval_above_confidence,
                default_tone = excluded.default_tone,
                signature = excluded.signature,
                working_hours_enabled = excluded.working_hours_enabled,
                working_hours_start = excluded.working_hours_start,
                working_hours_end = excluded.working_hours_end,
                utc_offset_minutes = excluded.utc_offset_minutes,
                updated_at = excluded.updated_at",
            params![
                SETTINGS_ROW_ID,
                settings.require_approval_above_confidence,
                settings.default_tone.clone(),
                settings.signature.clone(),
                settings.working_hours_enabled as i64,
                settings.working_hours_start.clone(),
                settings.working_hours_end.clone(),
                settings.utc_offset_minutes as i64,
                now
            ],
        )
        .await?;
        Ok(())
    }
}

fn row_to_settings(row: Row) -> Result<UserSettings, SettingsError> {
    let working_hours_enabled: i64 = row.get(4)?;
    let utc_offset_minutes: i64 = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(UserSettings {
        require_approval_above_confidence: row.get(1)?,
        default_tone: row.get(2)?,
        signature: row.get(3)?,
        working_hours_enabled: working_hours_enabled != 0,
        working_hours_start: row.get(5)?,
        working_hours_end: row.get(6)?,
        utc_offset_minutes: utc_offset_minutes as i32,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}
