//! Reader for finished trace files.
//!
//! Exists for tooling and tests: it undoes the on-disk transformations
//! (gzip, delta encoding, timestamp truncation) so callers get entries
//! back in absolute terms. Timestamps are reconstructed in nanoseconds but
//! only carry the precision the file was written with.

use crate::trace::entries::{BytesEntry, Entry, EntryType, FrameList, FramesEntry, StandardEntry};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct TraceHeader {
    pub version: u32,
    pub trace_id: String,
    pub precision: u32,
    /// Caller-provided key/value pairs, in file order.
    pub headers: Vec<(String, String)>,
}

pub struct TraceReader {
    header: TraceHeader,
    lines: Lines<BufReader<GzDecoder<File>>>,
    denominator: i64,
    last_id: i32,
    last_timestamp: i64,
}

fn bad_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn parse<T: std::str::FromStr>(field: &str, what: &str) -> io::Result<T> {
    field
        .parse()
        .map_err(|_| bad_data(format!("bad {what} field: {field:?}")))
}

impl TraceReader {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        let mut lines = BufReader::new(GzDecoder::new(file)).lines();

        match lines.next().transpose()? {
            Some(magic) if magic == "dt" => {}
            other => return Err(bad_data(format!("bad magic line: {other:?}"))),
        }

        let mut version = None;
        let mut trace_id = None;
        let mut precision = None;
        let mut headers = Vec::new();
        loop {
            let line = lines
                .next()
                .transpose()?
                .ok_or_else(|| bad_data("truncated header"))?;
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once('|')
                .ok_or_else(|| bad_data(format!("bad header line: {line:?}")))?;
            match key {
                "ver" => version = Some(parse(value, "version")?),
                "id" => trace_id = Some(value.to_string()),
                "prec" => precision = Some(parse(value, "precision")?),
                _ => headers.push((key.to_string(), value.to_string())),
            }
        }

        let precision: u32 = precision.ok_or_else(|| bad_data("missing prec header"))?;
        if precision > 9 {
            return Err(bad_data(format!("precision {precision} out of range")));
        }
        Ok(Self {
            header: TraceHeader {
                version: version.ok_or_else(|| bad_data("missing ver header"))?,
                trace_id: trace_id.ok_or_else(|| bad_data("missing id header"))?,
                precision,
                headers,
            },
            lines,
            denominator: 10i64.pow(9 - precision),
            last_id: 0,
            last_timestamp: 0,
        })
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    fn decode_line(&mut self, line: &str) -> io::Result<Entry> {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 4 {
            return Err(bad_data(format!("short record: {line:?}")));
        }
        let id = self.last_id.wrapping_add(parse(fields[0], "id")?);
        self.last_id = id;
        let entry_type = EntryType::from_name(fields[1])
            .ok_or_else(|| bad_data(format!("unknown entry type: {:?}", fields[1])))?;

        match fields.len() {
            // id|type|matchid|payload
            4 => Ok(Entry::Bytes(BytesEntry {
                id,
                entry_type,
                matchid: parse(fields[2], "matchid")?,
                bytes: fields[3].as_bytes().to_vec(),
            })),
            // id|type|timestamp|tid|frames
            5 => {
                let timestamp = self.undelta_timestamp(parse(fields[2], "timestamp")?);
                let frames = fields[4]
                    .split(' ')
                    .filter(|f| !f.is_empty())
                    .map(|f| parse(f, "frame"))
                    .collect::<io::Result<FrameList>>()?;
                Ok(Entry::Frames(FramesEntry {
                    id,
                    entry_type,
                    timestamp,
                    tid: parse(fields[3], "tid")?,
                    frames,
                }))
            }
            // id|type|timestamp|tid|callid|matchid|extra
            7 => {
                let timestamp = self.undelta_timestamp(parse(fields[2], "timestamp")?);
                Ok(Entry::Standard(StandardEntry {
                    id,
                    entry_type,
                    timestamp,
                    tid: parse(fields[3], "tid")?,
                    callid: parse(fields[4], "callid")?,
                    matchid: parse(fields[5], "matchid")?,
                    extra: parse(fields[6], "extra")?,
                }))
            }
            n => Err(bad_data(format!("record with {n} fields: {line:?}"))),
        }
    }

    /// Accumulate the truncated-unit delta, then widen back to nanoseconds.
    fn undelta_timestamp(&mut self, delta: i64) -> i64 {
        self.last_timestamp += delta;
        self.last_timestamp * self.denominator
    }
}

impl Iterator for TraceReader {
    type Item = io::Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) if line.is_empty() => continue,
                Ok(line) => return Some(self.decode_line(&line)),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
