//! Position sources
//!
//! The monitor only needs the latest position, the authorization state and
//! a way to be woken on updates. `PositionFeed` provides all three over a
//! watch channel; `NmeaSerialSource` fills a feed from a serial GPS receiver.
//!
//! NMEA:
//! - `$GPGGA`/`$GNGGA`: fields 2-5 lat/lon, field 6 fix quality (0 = no fix)
//! - `$GPRMC`/`$GNRMC`: field 2 status (A = valid), fields 3-6 lat/lon
//! - Checksum: XOR of all bytes between `$` and `*`, as two hex digits

use crate::domain::types::{Authorization, Position};
use crate::infra::config::Config;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, warn};

pub trait PositionSource: Send + Sync {
    fn authorization(&self) -> Authorization;

    /// Receiver that always holds the most recent position
    fn subscribe(&self) -> watch::Receiver<Option<Position>>;

    fn latest(&self) -> Option<Position> {
        *self.subscribe().borrow()
    }
}

/// Programmatic position source; also the sink the serial reader writes into
pub struct PositionFeed {
    tx: watch::Sender<Option<Position>>,
    authorization: parking_lot::RwLock<Authorization>,
}

impl PositionFeed {
    pub fn new(authorization: Authorization) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx, authorization: parking_lot::RwLock::new(authorization) }
    }

    /// Publish a new position; older unread positions are replaced
    pub fn push(&self, position: Position) {
        self.tx.send_replace(Some(position));
    }

    pub fn set_authorization(&self, authorization: Authorization) {
        let mut current = self.authorization.write();
        if *current != authorization {
            info!(from = current.as_str(), to = authorization.as_str(), "position_authorization");
            *current = authorization;
        }
    }
}

impl PositionSource for PositionFeed {
    fn authorization(&self) -> Authorization {
        *self.authorization.read()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Position>> {
        self.tx.subscribe()
    }

    fn latest(&self) -> Option<Position> {
        *self.tx.borrow()
    }
}

fn nmea_checksum_ok(line: &str) -> bool {
    let Some(body) = line.strip_prefix('$') else {
        return false;
    };
    match body.split_once('*') {
        Some((payload, checksum)) => {
            let expected = payload.bytes().fold(0u8, |acc, b| acc ^ b);
            u8::from_str_radix(checksum.trim(), 16).map(|c| c == expected).unwrap_or(false)
        }
        // Checksum is optional in NMEA 0183
        None => true,
    }
}

/// Convert `ddmm.mmmm` + hemisphere into signed decimal degrees
fn nmea_coordinate(value: &str, hemisphere: &str) -> Option<f64> {
    if value.is_empty() {
        return None;
    }
    let raw = value.parse::<f64>().ok()?;
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Some(decimal),
        "S" | "W" => Some(-decimal),
        _ => None,
    }
}

/// Parse one NMEA sentence into a position, if it carries a valid fix
pub fn parse_nmea_position(line: &str, received_at: DateTime<Utc>) -> Option<Position> {
    let line = line.trim();
    if !nmea_checksum_ok(line) {
        debug!(line = %line, "nmea_checksum_failed");
        return None;
    }
    let payload = line.split('*').next()?;
    let parts: Vec<&str> = payload.split(',').collect();

    let (lat, lat_hemi, lon, lon_hemi) = match parts[0] {
        "$GPGGA" | "$GNGGA" => {
            if parts.len() < 7 || parts[6].is_empty() || parts[6] == "0" {
                return None;
            }
            (parts[2], parts[3], parts[4], parts[5])
        }
        "$GPRMC" | "$GNRMC" => {
            if parts.len() < 7 || parts[2] != "A" {
                return None;
            }
            (parts[3], parts[4], parts[5], parts[6])
        }
        _ => return None,
    };

    let latitude = nmea_coordinate(lat, lat_hemi)?;
    let longitude = nmea_coordinate(lon, lon_hemi)?;
    Some(Position::new(latitude, longitude, received_at))
}

/// Reads NMEA sentences from a serial GPS receiver into a `PositionFeed`
pub struct NmeaSerialSource {
    device: String,
    baud: u32,
    feed: Arc<PositionFeed>,
}

impl NmeaSerialSource {
    pub fn new(config: &Config) -> Self {
        Self {
            device: config.gps_device().to_string(),
            baud: config.gps_baud(),
            feed: Arc::new(PositionFeed::new(Authorization::NotDetermined)),
        }
    }

    pub fn feed(&self) -> Arc<PositionFeed> {
        self.feed.clone()
    }

    /// Start the read loop; returns when the port closes or on shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(device = %self.device, baud = %self.baud, "gps_source_started");

        let port = match tokio_serial::new(&self.device, self.baud)
            .timeout(Duration::from_millis(1000))
            .open_native_async()
        {
            Ok(p) => {
                info!(device = %self.device, "gps_port_opened");
                self.feed.set_authorization(Authorization::Authorized);
                p
            }
            Err(e) => {
                error!(device = %self.device, error = %e, "gps_port_open_failed");
                self.feed.set_authorization(Authorization::Denied);
                return;
            }
        };

        let mut reader = BufReader::new(port);
        let mut line = String::new();

        loop {
            line.clear();
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("gps_source_shutdown");
                        return;
                    }
                }
                result = reader.read_line(&mut line) => {
                    match result {
                        Ok(0) => {
                            warn!(device = %self.device, "gps_port_closed");
                            self.feed.set_authorization(Authorization::Denied);
                            return;
                        }
                        Ok(_) => {
                            if let Some(position) = parse_nmea_position(&line, Utc::now()) {
                                tracing::trace!(
                                    lat = position.latitude,
                                    lon = position.longitude,
                                    "gps_fix"
                                );
                                self.feed.push(position);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "gps_read_error");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_checksum(body: &str) -> String {
        let checksum = body.bytes().fold(0u8, |acc, b| acc ^ b);
        format!("${}*{:02X}", body, checksum)
    }

    #[test]
    fn test_parse_gga() {
        let line = with_checksum("GPGGA,123519,2627.690,N,08004.368,W,1,08,0.9,5.0,M,-30.0,M,,");
        let position = parse_nmea_position(&line, Utc::now()).unwrap();
        assert!((position.latitude - 26.46150).abs() < 1e-5);
        assert!((position.longitude + 80.07280).abs() < 1e-5);
    }

    #[test]
    fn test_parse_rmc() {
        let line =
            with_checksum("GNRMC,123519,A,2627.690,N,08004.368,W,022.4,084.4,200425,003.1,W");
        assert!(parse_nmea_position(&line, Utc::now()).is_some());
    }

    #[test]
    fn test_rejects_no_fix() {
        let gga = with_checksum("GPGGA,123519,2627.690,N,08004.368,W,0,00,,,M,,M,,");
        assert!(parse_nmea_position(&gga, Utc::now()).is_none());
        let rmc = with_checksum("GPRMC,123519,V,2627.690,N,08004.368,W,,,200425,,");
        assert!(parse_nmea_position(&rmc, Utc::now()).is_none());
    }

    #[test]
    fn test_rejects_bad_checksum() {
        let line = "$GPGGA,123519,2627.690,N,08004.368,W,1,08,0.9,5.0,M,-30.0,M,,*00";
        assert!(parse_nmea_position(line, Utc::now()).is_none());
    }

    #[test]
    fn test_ignores_other_sentences() {
        let line =
            with_checksum("GPGSV,3,1,11,03,03,111,00,04,15,270,00,06,01,010,00,13,06,292,00");
        assert!(parse_nmea_position(&line, Utc::now()).is_none());
    }

    #[test]
    fn test_feed_keeps_latest() {
        let feed = PositionFeed::new(Authorization::Authorized);
        let mut rx = feed.subscribe();
        assert_eq!(feed.latest(), None);

        let t = Utc::now();
        feed.push(Position::new(1.0, 1.0, t));
        feed.push(Position::new(2.0, 2.0, t));

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().map(|p| p.latitude), Some(2.0));
        assert_eq!(feed.latest().map(|p| p.latitude), Some(2.0));
    }

    #[test]
    fn test_feed_authorization() {
        let feed = PositionFeed::new(Authorization::NotDetermined);
        feed.set_authorization(Authorization::Denied);
        assert_eq!(feed.authorization(), Authorization::Denied);
    }
}
