use std::time::Duration;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db;

pub const SMS_SETTINGS_KEY: &str = "sms.gateway";

/// Gateway credentials and routing fields, persisted in the settings
/// table. The gateway expects them as GET query parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub sender_id: String,
    pub route: String,
}

pub fn load_config(conn: &Connection) -> anyhow::Result<Option<SmsConfig>> {
    let Some(value) = db::settings_get_json(conn, SMS_SETTINGS_KEY)? else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_value(value)?))
}

pub fn store_config(conn: &Connection, config: &SmsConfig) -> anyhow::Result<()> {
    db::settings_set_json(conn, SMS_SETTINGS_KEY, &serde_json::to_value(config)?)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Absentee {
    pub student_id: String,
    pub roll_no: i64,
    pub name: String,
    pub username: String,
    pub phone: i64,
}

/// Students recorded absent on the given day, in roll order across
/// all classes.
pub fn absentees_on(conn: &Connection, date: &str) -> rusqlite::Result<Vec<Absentee>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.roll_no, s.name, u.username, s.phone
         FROM attendance a
         JOIN students s ON s.id = a.student_id
         JOIN users u ON u.id = s.user_id
         WHERE a.date = ? AND a.is_present = 0
         ORDER BY s.roll_no, s.name",
    )?;
    stmt.query_map([date], |r| {
        Ok(Absentee {
            student_id: r.get(0)?,
            roll_no: r.get(1)?,
            name: r.get(2)?,
            username: r.get(3)?,
            phone: r.get(4)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

pub fn absence_message(username: &str, date: &str) -> String {
    format!("Your ward {} was absent on {}", username, date)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedSend {
    pub student_id: String,
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertOutcome {
    pub scanned: usize,
    pub sent: usize,
    pub failed: Vec<FailedSend>,
}

fn send_one(agent: &ureq::Agent, config: &SmsConfig, to: &str, msg: &str) -> Result<(), String> {
    agent
        .get(&config.base_url)
        .query("uname", &config.username)
        .query("pwd", &config.password)
        .query("senderid", &config.sender_id)
        .query("to", to)
        .query("msg", msg)
        .query("route", &config.route)
        .call()
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Scans the day's absentees and issues one gateway call per student.
/// Sends are independent; a failed call is recorded and the scan
/// continues with the remaining students.
pub fn send_absentee_alerts(
    conn: &Connection,
    config: &SmsConfig,
    date: &str,
) -> rusqlite::Result<AlertOutcome> {
    let absentees = absentees_on(conn, date)?;
    let agent = ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(10))
        .build();

    let mut sent = 0usize;
    let mut failed = Vec::new();
    for absentee in &absentees {
        let msg = absence_message(&absentee.username, date);
        match send_one(&agent, config, &absentee.phone.to_string(), &msg) {
            Ok(()) => sent += 1,
            Err(error) => failed.push(FailedSend {
                student_id: absentee.student_id.clone(),
                name: absentee.name.clone(),
                error,
            }),
        }
    }

    Ok(AlertOutcome {
        scanned: absentees.len(),
        sent,
        failed,
    })
}
