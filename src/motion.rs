//! Motion controller connection
//!
//! The stage is driven by a Klipper firmware behind Moonraker. Every move is a
//! G-code script terminated by `M400`, so the HTTP call only returns once the
//! controller reports the move physically complete.

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Position query timeout; moves have no overall timeout since `M400` waits for the stage.
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Stage position in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Partial axis payload: each present axis is moved, absent axes are left alone.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisTarget {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

impl AxisTarget {
    pub fn xy(x: f64, y: f64) -> Self {
        Self { x: Some(x), y: Some(y), z: None }
    }

    pub fn z(z: f64) -> Self {
        Self { x: None, y: None, z: Some(z) }
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_none() && self.y.is_none() && self.z.is_none()
    }

    /// Axis words for a G0 line, e.g. `X1.00 Y2.50`.
    pub fn gcode_words(&self) -> String {
        let mut parts = Vec::new();
        if let Some(x) = self.x { parts.push(format!("X{:.2}", x)); }
        if let Some(y) = self.y { parts.push(format!("Y{:.2}", y)); }
        if let Some(z) = self.z { parts.push(format!("Z{:.2}", z)); }
        parts.join(" ")
    }
}

impl fmt::Display for AxisTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.gcode_words())
    }
}

/// Motion interface used by the scan path and the control surface.
///
/// Moves block until the controller acknowledges completion. Speeds are in
/// the controller's unit (mm/min).
pub trait MotionClient: Send + Sync {
    fn move_to(&self, target: AxisTarget, speed: f64) -> Result<()>;
    fn move_relative(&self, delta: AxisTarget, speed: f64) -> Result<()>;
    fn position(&self) -> Result<Position>;
}

/// Build the absolute-move script: `G90`, `G0 ... F<speed>`, `M400`.
pub fn absolute_move_script(target: &AxisTarget, speed: f64) -> Option<String> {
    if target.is_empty() {
        return None;
    }
    Some(format!("G90\nG0 {} F{:.1}\nM400", target.gcode_words(), speed))
}

/// Build the relative-move script; absolute positioning is restored afterwards.
pub fn relative_move_script(delta: &AxisTarget, speed: f64) -> Option<String> {
    if delta.is_empty() {
        return None;
    }
    Some(format!("G91\nG0 {} F{:.1}\nM400\nG90", delta.gcode_words(), speed))
}

#[derive(Serialize)]
struct GcodeRequest<'a> {
    script: &'a str,
}

#[derive(Deserialize)]
struct QueryResponse {
    result: QueryResult,
}

#[derive(Deserialize)]
struct QueryResult {
    status: QueryStatus,
}

#[derive(Deserialize)]
struct QueryStatus {
    toolhead: Toolhead,
}

#[derive(Deserialize)]
struct Toolhead {
    position: Vec<f64>,
}

/// Extract x/y/z from a Moonraker `objects/query?toolhead=position` body.
pub fn parse_toolhead_position(body: &str) -> Result<Position> {
    let response: QueryResponse = serde_json::from_str(body)
        .context("Unexpected toolhead query response")?;
    let pos = response.result.status.toolhead.position;
    if pos.len() < 3 {
        return Err(anyhow!("Toolhead position has {} axes, expected at least 3", pos.len()));
    }
    Ok(Position { x: pos[0], y: pos[1], z: pos[2] })
}

/// Stage connection through Moonraker's HTTP API.
#[derive(Debug)]
pub struct MoonrakerStage {
    base_url: String,
    query_agent: ureq::Agent,
    command_agent: ureq::Agent,
}

impl MoonrakerStage {
    pub fn new(base_url: &str) -> Self {
        let query_agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_connect(Some(CONNECT_TIMEOUT))
            .timeout_global(Some(QUERY_TIMEOUT))
            .build()
            .into();
        let command_agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_connect(Some(CONNECT_TIMEOUT))
            .build()
            .into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            query_agent,
            command_agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Post a G-code script and wait for Moonraker to acknowledge it.
    pub fn send_gcode(&self, script: &str) -> Result<()> {
        let url = format!("{}/printer/gcode/script", self.base_url);
        let first_line = script.lines().next().unwrap_or_default();
        debug!(target: "motion", "Sending: {}... ({} lines)", first_line, script.lines().count());
        self.command_agent
            .post(&url)
            .send_json(&GcodeRequest { script })
            .map_err(|e| anyhow!("G-code '{}' failed: {}", script.replace('\n', " | "), e))?;
        Ok(())
    }
}

impl MotionClient for MoonrakerStage {
    fn move_to(&self, target: AxisTarget, speed: f64) -> Result<()> {
        match absolute_move_script(&target, speed) {
            Some(script) => self.send_gcode(&script),
            None => Ok(()),
        }
    }

    fn move_relative(&self, delta: AxisTarget, speed: f64) -> Result<()> {
        match relative_move_script(&delta, speed) {
            Some(script) => self.send_gcode(&script),
            None => Ok(()),
        }
    }

    fn position(&self) -> Result<Position> {
        let url = format!("{}/printer/objects/query?toolhead=position", self.base_url);
        let mut response = self.query_agent
            .get(&url)
            .call()
            .map_err(|e| anyhow!("Position query failed: {}", e))?;
        let body = response.body_mut()
            .read_to_string()
            .context("Failed to read position response")?;
        parse_toolhead_position(&body)
    }
}

/// Position as a degraded reading: `None` when the controller is unreachable.
pub fn try_position(motion: &dyn MotionClient) -> Option<Position> {
    match motion.position() {
        Ok(pos) => Some(pos),
        Err(e) => {
            warn!(target: "motion", "Position unavailable: {:#}", e);
            None
        }
    }
}
