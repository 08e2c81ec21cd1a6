//! Trace log persistence and the CSV decode report (§6, §4.7).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::decoder;
use crate::error::{CmnError, Result};
use crate::event::{Channel, Direction, Event, MatchGroup};
use crate::packet::{Packet, PacketBuffer, PACKET_SIZE};

/// One event's capture, as written to and read from a trace log file: the
/// event's identity plus its captured packets, if any were recorded.
#[derive(Debug, Serialize, Deserialize)]
pub struct TraceRecord {
    pub name: String,
    pub mesh: u32,
    pub xp_nid: u16,
    pub port: u8,
    pub channel: String,
    pub direction: String,
    pub match_groups: Vec<Vec<(String, String)>>,
    pub packets: Option<Vec<[u8; PACKET_SIZE]>>,
}

impl TraceRecord {
    fn from_event(event: &Event, buffer: &PacketBuffer) -> Self {
        TraceRecord {
            name: event.name.clone(),
            mesh: event.mesh_index,
            xp_nid: event.xp_nid,
            port: event.port,
            channel: event.channel.as_str().to_string(),
            direction: event.direction.as_str().to_string(),
            match_groups: event
                .match_groups
                .iter()
                .map(|g: &MatchGroup| g.fields.clone())
                .collect(),
            packets: if buffer.is_empty() {
                None
            } else {
                Some(buffer.iter().map(|p| *p.as_bytes()).collect())
            },
        }
    }

    fn channel(&self) -> Result<Channel> {
        match self.channel.as_str() {
            "req" => Ok(Channel::Req),
            "rsp" => Ok(Channel::Rsp),
            "snp" => Ok(Channel::Snp),
            "dat" => Ok(Channel::Dat),
            other => Err(CmnError::ParseError {
                token: other.to_string(),
                reason: "unrecognized channel in trace log".into(),
            }),
        }
    }
}

/// Writes every event's capture to `out_file`, backing up a pre-existing
/// file to `<out_file>.old` first, the way the original tool preserves the
/// previous run's trace.
pub fn save_trace(events: &[Event], buffers: &[PacketBuffer], out_file: &Path) -> Result<()> {
    if out_file.exists() {
        let backup = out_file.with_extension(
            out_file
                .extension()
                .map(|e| format!("{}.old", e.to_string_lossy()))
                .unwrap_or_else(|| "old".to_string()),
        );
        fs::rename(out_file, &backup)?;
        log::info!("backed up previous trace log to {}", backup.display());
    }

    let records: Vec<TraceRecord> = events
        .iter()
        .zip(buffers.iter())
        .map(|(event, buf)| TraceRecord::from_event(event, buf))
        .collect();

    let total_packets: usize = buffers.iter().map(|b| b.len()).sum();
    let encoded = bincode::serialize(&records)
        .map_err(|e| CmnError::ParseError { token: out_file.display().to_string(), reason: e.to_string() })?;
    fs::write(out_file, &encoded)?;
    log::info!(
        "saved trace log: {} packets, {} bytes, {}",
        total_packets,
        encoded.len(),
        out_file.display()
    );
    Ok(())
}

/// Reads back a trace log file written by [`save_trace`].
pub fn load_trace(in_file: &Path) -> Result<Vec<TraceRecord>> {
    let bytes = fs::read(in_file)?;
    bincode::deserialize(&bytes)
        .map_err(|e| CmnError::ParseError { token: in_file.display().to_string(), reason: e.to_string() })
}

/// The four record-selection strategies `report` supports, mirroring the
/// original tool's `--sample` choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStrategy {
    Header,
    Tail,
    Evenly,
    Random,
}

impl SampleStrategy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "header" => Ok(SampleStrategy::Header),
            "tail" => Ok(SampleStrategy::Tail),
            "evenly" => Ok(SampleStrategy::Evenly),
            "random" => Ok(SampleStrategy::Random),
            other => Err(CmnError::ParseError {
                token: other.to_string(),
                reason: "sample strategy must be one of header, tail, evenly, random".into(),
            }),
        }
    }
}

/// Picks which packet ordinals (within `[0, total)`) to emit, in ascending
/// order, for a given strategy and record cap.
fn select_indices(total: usize, max_records: usize, strategy: SampleStrategy) -> Vec<usize> {
    if total <= max_records {
        return (0..total).collect();
    }
    match strategy {
        SampleStrategy::Header => (0..max_records).collect(),
        SampleStrategy::Tail => (total - max_records..total).collect(),
        SampleStrategy::Evenly => {
            let step = total / max_records;
            (0..max_records).map(|i| i * step).collect()
        }
        SampleStrategy::Random => {
            let mut rng = rand::thread_rng();
            let mut indices: Vec<usize> = Vec::with_capacity(max_records);
            // reservoir-free sample without replacement, small enough
            // record counts that a rejection scheme is fine.
            let mut chosen = std::collections::HashSet::with_capacity(max_records);
            while chosen.len() < max_records {
                chosen.insert(rng.gen_range(0..total));
            }
            indices.extend(chosen);
            indices.sort_unstable();
            indices
        }
    }
}

/// Decodes one record's sampled packets to a CSV file under `out_dir`,
/// named `<event-name>-<strategy>.csv`.
fn write_record_csv(record: &TraceRecord, out_dir: &Path, max_records: usize, strategy: SampleStrategy) -> Result<PathBuf> {
    let channel = record.channel()?;
    let strategy_name = match strategy {
        SampleStrategy::Header => "header",
        SampleStrategy::Tail => "tail",
        SampleStrategy::Evenly => "evenly",
        SampleStrategy::Random => "random",
    };
    let csv_path = out_dir.join(format!("{}-{}.csv", record.name, strategy_name));
    let mut file = fs::File::create(&csv_path)?;

    let field_names: Vec<&str> = decoder::field_names(channel).collect();
    writeln!(file, "{}", field_names.join(","))?;

    let packets = match &record.packets {
        Some(p) if !p.is_empty() => p,
        _ => return Ok(csv_path),
    };
    let indices = select_indices(packets.len(), max_records, strategy);
    for index in indices {
        let packet = Packet::from_bytes(packets[index]);
        let decoded = decoder::decode(channel, &packet);
        let row: Vec<String> = decoded.into_iter().map(|(_, v)| v).collect();
        writeln!(file, "{}", row.join(","))?;
    }
    Ok(csv_path)
}

/// Writes one CSV file per captured event into `out_dir`, creating it if
/// necessary.
pub fn write_reports(
    records: &[TraceRecord],
    out_dir: &Path,
    max_records: usize,
    strategy: SampleStrategy,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)?;
    records
        .iter()
        .map(|record| write_record_csv(record, out_dir, max_records, strategy))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_indices_header_takes_prefix() {
        assert_eq!(select_indices(100, 5, SampleStrategy::Header), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn select_indices_tail_takes_suffix() {
        assert_eq!(select_indices(100, 5, SampleStrategy::Tail), vec![95, 96, 97, 98, 99]);
    }

    #[test]
    fn select_indices_evenly_spaces_by_step() {
        assert_eq!(select_indices(100, 5, SampleStrategy::Evenly), vec![0, 20, 40, 60, 80]);
    }

    #[test]
    fn select_indices_random_is_sorted_and_in_bounds() {
        let indices = select_indices(1000, 10, SampleStrategy::Random);
        assert_eq!(indices.len(), 10);
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
        assert!(indices.iter().all(|&i| i < 1000));
    }

    #[test]
    fn short_capture_is_not_truncated() {
        assert_eq!(select_indices(3, 25, SampleStrategy::Random), vec![0, 1, 2]);
    }
}
