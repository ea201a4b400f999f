//! Adaptive time-bucketing for sensor history queries (component I).
//!
//! spec.md §6 describes this as Postgres-specific SQL; this backend stores
//! results in SQLite (see `db.rs`), so bucketing is implemented in
//! application code over already-fetched rows instead of emitted as
//! `date_bin`-style SQL. The bucket-width ladder and "most recent
//! status/speed, averaged numerics" semantics are unchanged from spec.md.

use crate::types::{EthernetResult, PingResult};

/// Allowed bucket widths in seconds, spec.md §6.
const BUCKET_LADDER: [i64; 6] = [60, 300, 900, 3600, 21600, 86400];

/// `max(1, ceil(window_secs / max_points))`, snapped up to the nearest
/// ladder entry (or the largest one if the window outgrows it).
pub fn bucket_width_secs(window_secs: i64, max_points: i64) -> i64 {
    let max_points = max_points.max(1);
    let raw = ((window_secs as f64) / (max_points as f64)).ceil() as i64;
    let raw = raw.max(1);
    BUCKET_LADDER
        .iter()
        .copied()
        .find(|&w| w >= raw)
        .unwrap_or(*BUCKET_LADDER.last().unwrap())
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PingBucket {
    pub bucket_start: i64,
    pub avg_latency_ms: Option<f64>,
    pub status: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EthernetBucket {
    pub bucket_start: i64,
    pub avg_rx_bps: Option<f64>,
    pub avg_tx_bps: Option<f64>,
    pub status: String,
    pub speed: String,
}

fn bucket_of(timestamp: i64, since: i64, width: i64) -> i64 {
    since + ((timestamp - since) / width) * width
}

/// Averages `latency_ms`, takes the most recent `status` per bucket.
pub fn bucket_ping_results(rows: &[PingResult], since: i64, width_secs: i64) -> Vec<PingBucket> {
    let mut buckets: Vec<(i64, Vec<&PingResult>)> = Vec::new();
    for row in rows {
        let start = bucket_of(row.timestamp, since, width_secs);
        match buckets.last_mut() {
            Some((b, v)) if *b == start => v.push(row),
            _ => buckets.push((start, vec![row])),
        }
    }
    buckets
        .into_iter()
        .map(|(bucket_start, members)| {
            let latencies: Vec<i64> = members.iter().filter_map(|r| r.latency_ms).collect();
            let avg_latency_ms = if latencies.is_empty() {
                None
            } else {
                Some(latencies.iter().sum::<i64>() as f64 / latencies.len() as f64)
            };
            let status = members.last().map(|r| r.status.clone()).unwrap_or_default();
            PingBucket { bucket_start, avg_latency_ms, status }
        })
        .collect()
}

fn parse_bps(s: &str) -> Option<f64> {
    // RouterOS `monitor-traffic` reports e.g. "1.5Mbps" or a bare integer bps.
    let s = s.trim();
    let digits_end = s.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(s.len());
    let (num, suffix) = s.split_at(digits_end);
    let num: f64 = num.parse().ok()?;
    let mult = match suffix.to_ascii_lowercase().as_str() {
        "" | "bps" => 1.0,
        "kbps" => 1e3,
        "mbps" => 1e6,
        "gbps" => 1e9,
        _ => 1.0,
    };
    Some(num * mult)
}

pub fn bucket_ethernet_results(rows: &[EthernetResult], since: i64, width_secs: i64) -> Vec<EthernetBucket> {
    let mut buckets: Vec<(i64, Vec<&EthernetResult>)> = Vec::new();
    for row in rows {
        let start = bucket_of(row.timestamp, since, width_secs);
        match buckets.last_mut() {
            Some((b, v)) if *b == start => v.push(row),
            _ => buckets.push((start, vec![row])),
        }
    }
    buckets
        .into_iter()
        .map(|(bucket_start, members)| {
            let rx: Vec<f64> = members.iter().filter_map(|r| parse_bps(&r.rx_bitrate)).collect();
            let tx: Vec<f64> = members.iter().filter_map(|r| parse_bps(&r.tx_bitrate)).collect();
            let avg = |v: &[f64]| if v.is_empty() { None } else { Some(v.iter().sum::<f64>() / v.len() as f64) };
            let last = members.last().unwrap();
            EthernetBucket {
                bucket_start,
                avg_rx_bps: avg(&rx),
                avg_tx_bps: avg(&tx),
                status: last.status.clone(),
                speed: last.speed.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_snaps_to_ladder() {
        assert_eq!(bucket_width_secs(3600, 120), 60);
        assert_eq!(bucket_width_secs(86400, 120), 900);
        assert_eq!(bucket_width_secs(86400 * 30, 100), 86400);
    }

    #[test]
    fn ping_buckets_average_latency_and_keep_latest_status() {
        let rows = vec![
            PingResult { sensor_id: "s".into(), timestamp: 0, latency_ms: Some(10), status: "ok".into() },
            PingResult { sensor_id: "s".into(), timestamp: 30, latency_ms: Some(20), status: "high_latency".into() },
            PingResult { sensor_id: "s".into(), timestamp: 70, latency_ms: Some(5), status: "ok".into() },
        ];
        let buckets = bucket_ping_results(&rows, 0, 60);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].avg_latency_ms, Some(15.0));
        assert_eq!(buckets[0].status, "high_latency");
        assert_eq!(buckets[1].avg_latency_ms, Some(5.0));
    }
}
