//! Archive and CSV ingestion into typed per-sensor streams.
//!
//! Each Movella DOT export is one text file per sensor: free-form metadata
//! lines (one of which carries `DeviceTag:`), a `PacketCounter,...` header row,
//! then comma-separated samples. Only an archive that cannot be opened at all
//! is an error; anything wrong with an individual file or row is skipped and
//! recorded as an [`IngestNote`].

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Cursor, Read};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use csv::{ReaderBuilder, Trim};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::rotation::{quat_from_euler_zyx, Quat};
use crate::MotionError;

const DATA_HEADER_TOKEN: &str = "PacketCounter";
const DEVICE_TAG_TOKEN: &str = "DeviceTag:";
const MIN_COLUMNS: usize = 9;
const MICROS_PER_SECOND: f64 = 1e6;
// SampleTimeFine is an unsigned 32-bit microsecond counter.
const SAMPLE_TIME_SPAN_US: f64 = 4_294_967_296.0;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceTag {
    RightThigh,
    RightShank,
    LeftThigh,
    LeftShank,
    Pelvis,
}

impl DeviceTag {
    pub const ALL: [DeviceTag; 5] = [
        DeviceTag::RightThigh,
        DeviceTag::RightShank,
        DeviceTag::LeftThigh,
        DeviceTag::LeftShank,
        DeviceTag::Pelvis,
    ];

    pub fn from_number(n: u32) -> Option<Self> {
        match n {
            1 => Some(DeviceTag::RightThigh),
            2 => Some(DeviceTag::RightShank),
            3 => Some(DeviceTag::LeftThigh),
            4 => Some(DeviceTag::LeftShank),
            5 => Some(DeviceTag::Pelvis),
            _ => None,
        }
    }

    pub fn number(self) -> u32 {
        match self {
            DeviceTag::RightThigh => 1,
            DeviceTag::RightShank => 2,
            DeviceTag::LeftThigh => 3,
            DeviceTag::LeftShank => 4,
            DeviceTag::Pelvis => 5,
        }
    }

    pub fn segment(self) -> BodySegment {
        match self {
            DeviceTag::RightThigh => BodySegment::RightThigh,
            DeviceTag::RightShank => BodySegment::RightShank,
            DeviceTag::LeftThigh => BodySegment::LeftThigh,
            DeviceTag::LeftShank => BodySegment::LeftShank,
            DeviceTag::Pelvis => BodySegment::Pelvis,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BodySegment {
    #[serde(rename = "right thigh")]
    RightThigh,
    #[serde(rename = "right shank")]
    RightShank,
    #[serde(rename = "left thigh")]
    LeftThigh,
    #[serde(rename = "left shank")]
    LeftShank,
    #[serde(rename = "pelvis")]
    Pelvis,
}

impl BodySegment {
    pub fn name(self) -> &'static str {
        match self {
            BodySegment::RightThigh => "right thigh",
            BodySegment::RightShank => "right shank",
            BodySegment::LeftThigh => "left thigh",
            BodySegment::LeftShank => "left shank",
            BodySegment::Pelvis => "pelvis",
        }
    }
}

impl fmt::Display for BodySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One sensor's samples. `t`, `euler` and `quat` always have equal length;
/// an empty stream means the sensor file was present but held no usable rows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensorStream {
    pub tag: DeviceTag,
    /// Seconds since the first valid sample of the file.
    pub t: Vec<f64>,
    /// Raw Euler angles `[x, y, z]` in degrees.
    pub euler: Vec<[f64; 3]>,
    pub quat: Vec<Quat>,
}

impl SensorStream {
    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    pub fn duration_s(&self) -> f64 {
        self.t.last().copied().unwrap_or(0.0)
    }

    pub fn truncated(&self, len: usize) -> SensorStream {
        let len = len.min(self.len());
        SensorStream {
            tag: self.tag,
            t: self.t[..len].to_vec(),
            euler: self.euler[..len].to_vec(),
            quat: self.quat[..len].to_vec(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestIssue {
    MissingDeviceTag,
    UnknownDeviceTag { tag: u32 },
    MissingDataHeader,
    NoValidRows,
    DuplicateDeviceTag { tag: DeviceTag },
    Unreadable { reason: String },
}

impl fmt::Display for IngestIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestIssue::MissingDeviceTag => write!(f, "no DeviceTag header line"),
            IngestIssue::UnknownDeviceTag { tag } => write!(f, "unknown device tag {tag}"),
            IngestIssue::MissingDataHeader => {
                write!(f, "no {DATA_HEADER_TOKEN} data header row")
            }
            IngestIssue::NoValidRows => write!(f, "no valid data rows"),
            IngestIssue::DuplicateDeviceTag { tag } => {
                write!(f, "device tag {} seen again, replacing earlier file", tag.number())
            }
            IngestIssue::Unreadable { reason } => write!(f, "unreadable entry: {reason}"),
        }
    }
}

/// A recoverable problem with one archive entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IngestNote {
    pub entry: String,
    pub issue: IngestIssue,
}

#[derive(Clone, Debug, Default)]
pub struct Session {
    pub streams: BTreeMap<DeviceTag, SensorStream>,
    pub notes: Vec<IngestNote>,
}

impl Session {
    pub fn stream(&self, tag: DeviceTag) -> Option<&SensorStream> {
        self.streams.get(&tag)
    }

    /// The stream for `tag`, only if it holds at least one sample.
    pub fn stream_with_data(&self, tag: DeviceTag) -> Option<&SensorStream> {
        self.streams.get(&tag).filter(|s| !s.is_empty())
    }

    pub fn quaternions(&self, tag: DeviceTag) -> Option<&[Quat]> {
        self.stream(tag).map(|s| s.quat.as_slice())
    }

    pub fn times(&self, tag: DeviceTag) -> Option<&[f64]> {
        self.stream(tag).map(|s| s.t.as_slice())
    }

    pub fn insert(&mut self, stream: SensorStream) -> Option<SensorStream> {
        self.streams.insert(stream.tag, stream)
    }

    fn note(&mut self, entry: &str, issue: IngestIssue) {
        warn!("{}: {}", entry, issue);
        self.notes.push(IngestNote {
            entry: entry.to_string(),
            issue,
        });
    }
}

/// Find the `DeviceTag:` header line. Accepts `DeviceTag: 3` and `DeviceTag:,3`.
pub fn extract_device_tag(text: &str) -> Option<u32> {
    text.lines().find_map(|line| {
        let rest = line.trim().strip_prefix(DEVICE_TAG_TOKEN)?;
        let rest = rest.trim_start();
        let rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    })
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedRows {
    /// Raw SampleTimeFine values in microseconds, rollover-corrected.
    pub sample_time_us: Vec<f64>,
    pub euler: Vec<[f64; 3]>,
}

/// Parse the rows following the `PacketCounter` header. Returns `None` when the
/// header is absent. Rows with fewer than nine columns or a non-numeric time or
/// Euler column are dropped.
pub fn parse_csv_content(text: &str) -> Option<ParsedRows> {
    let mut offset = 0usize;
    let mut body_start = None;
    for line in text.split_inclusive('\n') {
        offset += line.len();
        if line.contains(DATA_HEADER_TOKEN) {
            body_start = Some(offset);
            break;
        }
    }
    let body = &text[body_start?..];

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(body.as_bytes());

    let mut rows = ParsedRows::default();
    let mut rollover = 0.0;
    let mut last_time: Option<f64> = None;
    for record in reader.records() {
        let Ok(record) = record else { continue };
        if record.len() < MIN_COLUMNS {
            continue;
        }
        let fields: Option<Vec<f64>> = (1..=4).map(|i| parse_finite(&record[i])).collect();
        let Some(fields) = fields else { continue };

        let mut time = fields[0] + rollover;
        if let Some(prev) = last_time {
            if time < prev {
                if prev - time > SAMPLE_TIME_SPAN_US / 2.0 {
                    rollover += SAMPLE_TIME_SPAN_US;
                    time += SAMPLE_TIME_SPAN_US;
                } else {
                    debug!("Dropping out-of-order sample at {} us", fields[0]);
                    continue;
                }
            }
        }
        last_time = Some(time);
        rows.sample_time_us.push(time);
        rows.euler.push([fields[1], fields[2], fields[3]]);
    }
    Some(rows)
}

fn parse_finite(field: &str) -> Option<f64> {
    field.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Turn one sensor log into a stream, or explain why it cannot be used.
pub fn parse_sensor_file(text: &str) -> Result<SensorStream, IngestIssue> {
    let number = extract_device_tag(text).ok_or(IngestIssue::MissingDeviceTag)?;
    let tag = DeviceTag::from_number(number)
        .ok_or(IngestIssue::UnknownDeviceTag { tag: number })?;
    let rows = parse_csv_content(text).ok_or(IngestIssue::MissingDataHeader)?;

    let t0 = rows.sample_time_us.first().copied().unwrap_or(0.0);
    let t = rows
        .sample_time_us
        .iter()
        .map(|&us| (us - t0) / MICROS_PER_SECOND)
        .collect();
    let quat = rows
        .euler
        .iter()
        .map(|e| quat_from_euler_zyx(e[0], e[1], e[2]))
        .collect();

    Ok(SensorStream {
        tag,
        t,
        euler: rows.euler,
        quat,
    })
}

fn is_sensor_log(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !lower.starts_with("__macosx/") && (lower.ends_with(".csv") || lower.ends_with(".txt"))
}

/// Build a session from already-extracted `(file name, contents)` pairs.
pub fn load_session_from_texts<I>(entries: I) -> Session
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut session = Session::default();
    for (name, text) in entries {
        let stream = match parse_sensor_file(&text) {
            Ok(stream) => stream,
            Err(issue) => {
                session.note(&name, issue);
                continue;
            }
        };
        let tag = stream.tag;
        if stream.is_empty() {
            // Kept as "present but empty"; downstream treats it as missing.
            session.note(&name, IngestIssue::NoValidRows);
        } else {
            debug!(
                "Loaded {} samples for device tag {} ({}) from {}",
                stream.len(),
                tag.number(),
                tag.segment(),
                name
            );
        }
        if session.insert(stream).is_some() {
            session.note(&name, IngestIssue::DuplicateDeviceTag { tag });
        }
    }
    session
}

/// Read every `.csv`/`.txt` entry of a ZIP archive into a session.
pub fn load_session_from_zip(bytes: &[u8]) -> Result<Session, MotionError> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| MotionError::Archive(e.to_string()))?;

    let mut entries = Vec::new();
    let mut unreadable = Vec::new();
    for index in 0..archive.len() {
        let mut file = match archive.by_index(index) {
            Ok(file) => file,
            Err(err) => {
                unreadable.push((format!("entry #{index}"), err.to_string()));
                continue;
            }
        };
        let name = file.name().to_string();
        if file.is_dir() || !is_sensor_log(&name) {
            debug!("Ignoring archive entry {}", name);
            continue;
        }
        let mut raw = Vec::new();
        if let Err(err) = file.read_to_end(&mut raw) {
            unreadable.push((name, err.to_string()));
            continue;
        }
        entries.push((name, String::from_utf8_lossy(&raw).into_owned()));
    }

    let mut session = load_session_from_texts(entries);
    for (name, reason) in unreadable {
        session.note(&name, IngestIssue::Unreadable { reason });
    }
    Ok(session)
}

/// Same as [`load_session_from_zip`] for a base64-encoded archive.
pub fn load_session_from_base64(encoded: &str) -> Result<Session, MotionError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(compact.as_bytes())
        .map_err(|e| MotionError::Archive(format!("invalid base64: {e}")))?;
    load_session_from_zip(&bytes)
}

/// Truncate every stream to the shortest one's length.
pub fn align_streams(streams: &[&SensorStream]) -> Vec<SensorStream> {
    let Some(min_len) = streams.iter().map(|s| s.len()).min() else {
        return Vec::new();
    };
    streams.iter().map(|s| s.truncated(min_len)).collect()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SensorValidation {
    /// Both knee pairings complete.
    pub is_valid: bool,
    pub available: Vec<BodySegment>,
    pub missing: Vec<BodySegment>,
    pub right_knee_complete: bool,
    pub left_knee_complete: bool,
}

pub fn validate_required_sensors(session: &Session) -> SensorValidation {
    let (available, missing): (Vec<DeviceTag>, Vec<DeviceTag>) = DeviceTag::ALL
        .iter()
        .partition(|&&tag| session.stream_with_data(tag).is_some());
    let has = |tag| session.stream_with_data(tag).is_some();
    let right_knee_complete = has(DeviceTag::RightThigh) && has(DeviceTag::RightShank);
    let left_knee_complete = has(DeviceTag::LeftThigh) && has(DeviceTag::LeftShank);

    SensorValidation {
        is_valid: right_knee_complete && left_knee_complete,
        available: available.into_iter().map(DeviceTag::segment).collect(),
        missing: missing.into_iter().map(DeviceTag::segment).collect(),
        right_knee_complete,
        left_knee_complete,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::{Cursor, Write};

    use zip::write::FileOptions;
    use zip::ZipWriter;

    pub const HEADER: &str =
        "PacketCounter,SampleTimeFine,Euler_X,Euler_Y,Euler_Z,FreeAcc_X,FreeAcc_Y,FreeAcc_Z,Status";

    /// A sensor log in the exporter's layout, rows given as `(time_us, [ex, ey, ez])`.
    pub fn sensor_log(tag: u32, rows: &[(u64, [f64; 3])]) -> String {
        let mut out = format!(
            "sep=,\nDeviceTag:,{tag}\nFirmwareVersion:,3.0.0\nOutputRate:,60Hz\n\n{HEADER}\n"
        );
        for (i, (time, e)) in rows.iter().enumerate() {
            out.push_str(&format!(
                "{},{},{},{},{},0.01,-0.02,0.03,0\n",
                i + 1,
                time,
                e[0],
                e[1],
                e[2]
            ));
        }
        out
    }

    pub fn zip_archive(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn still_rows(n: usize) -> Vec<(u64, [f64; 3])> {
        (0..n).map(|i| (1_000_000 + i as u64 * 16_667, [0.0, 90.0, 0.0])).collect()
    }

    #[test]
    fn test_extract_device_tag_forms() {
        assert_eq!(extract_device_tag("DeviceTag: 3\nPacketCounter"), Some(3));
        assert_eq!(extract_device_tag("sep=,\nDeviceTag:,4\n"), Some(4));
        assert_eq!(extract_device_tag("  DeviceTag: , 5  \n"), Some(5));
        assert_eq!(extract_device_tag("PacketCounter,SampleTimeFine\n0,0"), None);
    }

    #[test]
    fn test_parse_rows_skips_invalid() {
        let text = format!(
            "{HEADER}\n0,0,0,90,0,0,0,0,0\ninvalid,row,data\n2,33333,0,nan,0,0,0,0,0\n1,16666,0,95,0,0,0,0,0\n"
        );
        let rows = parse_csv_content(&text).unwrap();
        assert_eq!(rows.sample_time_us, vec![0.0, 16666.0]);
        assert_eq!(rows.euler, vec![[0.0, 90.0, 0.0], [0.0, 95.0, 0.0]]);
        assert!(parse_csv_content("DeviceTag: 1\n0,0,0,90,0,0,0,0,0").is_none());
    }

    #[test]
    fn test_sample_time_rollover() {
        let text = format!(
            "{HEADER}\n1,4294960000,0,0,0,0,0,0,0\n2,3000,0,0,0,0,0,0,0\n3,1000,0,0,0,0,0,0,0\n"
        );
        let rows = parse_csv_content(&text).unwrap();
        assert_eq!(rows.sample_time_us.len(), 2);
        assert_eq!(rows.sample_time_us[1] - rows.sample_time_us[0], 10_296.0);
    }

    #[test]
    fn test_sensor_file_is_time_zeroed() {
        let log = sensor_log(2, &still_rows(4));
        let stream = parse_sensor_file(&log).unwrap();
        assert_eq!(stream.tag, DeviceTag::RightShank);
        assert_eq!(stream.t[0], 0.0);
        assert!((stream.t[3] - 0.050001).abs() < 1e-9);
        assert_eq!(stream.quat.len(), 4);
        assert_eq!(stream.euler.len(), 4);
    }

    #[test]
    fn test_unknown_tag_is_recoverable() {
        let log = sensor_log(9, &still_rows(3));
        assert_eq!(
            parse_sensor_file(&log).unwrap_err(),
            IngestIssue::UnknownDeviceTag { tag: 9 }
        );
    }

    #[test]
    fn test_zip_ignores_unrelated_entries() {
        let right_thigh = sensor_log(1, &still_rows(10));
        let pelvis = sensor_log(5, &still_rows(10));
        let archive = zip_archive(&[
            ("1_20250711_200600_087.csv", &right_thigh),
            ("readme.md", "DeviceTag: 3\nnot a sensor"),
            ("5_20250711_200600_080.csv", &pelvis),
        ]);
        let session = load_session_from_zip(&archive).unwrap();
        assert_eq!(session.streams.len(), 2);
        assert!(session.stream(DeviceTag::RightThigh).is_some());
        assert!(session.stream(DeviceTag::Pelvis).is_some());
        assert!(session.stream(DeviceTag::LeftThigh).is_none());
        assert!(session.notes.is_empty());
    }

    #[test]
    fn test_bad_files_become_notes() {
        let good = sensor_log(3, &still_rows(5));
        let no_header = "DeviceTag: 4\n1,2,3\n";
        let no_tag = format!("{HEADER}\n0,0,0,0,0,0,0,0,0\n");
        let archive = zip_archive(&[
            ("a.csv", &good),
            ("b.csv", no_header),
            ("c.txt", &no_tag),
        ]);
        let session = load_session_from_zip(&archive).unwrap();
        assert_eq!(session.streams.len(), 1);
        let issues: Vec<_> = session.notes.iter().map(|n| n.issue.clone()).collect();
        assert!(issues.contains(&IngestIssue::MissingDataHeader));
        assert!(issues.contains(&IngestIssue::MissingDeviceTag));
    }

    #[test]
    fn test_empty_stream_is_present_but_missing() {
        let empty = format!("DeviceTag: 4\n{HEADER}\n");
        let session = load_session_from_texts(vec![("4.csv".to_string(), empty)]);
        assert!(session.stream(DeviceTag::LeftShank).is_some());
        assert!(session.stream_with_data(DeviceTag::LeftShank).is_none());
        let validation = validate_required_sensors(&session);
        assert!(validation.missing.contains(&BodySegment::LeftShank));
    }

    #[test]
    fn test_invalid_archive_is_fatal() {
        assert!(matches!(
            load_session_from_zip(b"definitely not a zip"),
            Err(MotionError::Archive(_))
        ));
        assert!(matches!(
            load_session_from_base64("@@@@"),
            Err(MotionError::Archive(_))
        ));
    }

    #[test]
    fn test_base64_archive() {
        let archive = zip_archive(&[("2.csv", &sensor_log(2, &still_rows(3)))]);
        let encoded = BASE64.encode(&archive);
        let session = load_session_from_base64(&encoded).unwrap();
        assert_eq!(session.stream(DeviceTag::RightShank).map(|s| s.len()), Some(3));
    }

    #[test]
    fn test_validation_reports_pairings() {
        let texts = [1, 2, 3, 5]
            .iter()
            .map(|&tag| (format!("{tag}.csv"), sensor_log(tag, &still_rows(3))))
            .collect::<Vec<_>>();
        let session = load_session_from_texts(texts);
        let validation = validate_required_sensors(&session);
        assert!(validation.right_knee_complete);
        assert!(!validation.left_knee_complete);
        assert!(!validation.is_valid);
        assert_eq!(validation.missing, vec![BodySegment::LeftShank]);
        assert_eq!(validation.available.len(), 4);
    }

    #[test]
    fn test_align_streams_truncates_to_shortest() {
        let a = parse_sensor_file(&sensor_log(1, &still_rows(6))).unwrap();
        let b = parse_sensor_file(&sensor_log(2, &still_rows(4))).unwrap();
        let aligned = align_streams(&[&a, &b]);
        assert!(aligned.iter().all(|s| s.len() == 4));
        assert!(align_streams(&[]).is_empty());
    }
}
