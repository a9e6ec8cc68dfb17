//! Flow Export
//!
//! Tabular views of finalized flows: an in-memory [`Frame`] and a delimited
//! text [`CsvWriter`]. Both take built-in columns from the first record and
//! plugin columns from every record, and produce the same rows, value for
//! value.
//!
//! Column order: identity, per-direction counters, statistics (when
//! enabled), TCP flag counters, classification, built-in features, then
//! user plugin fields under `udps.`.

use crate::anonymize::Anonymizer;
use crate::error::StreamResult;
use crate::flow::{DirectionalCounters, FlowRecord};
use crate::features::RunningStats;
use ipnetwork::IpNetwork;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::io::{self, Write};
use std::net::IpAddr;
use std::sync::OnceLock;

/// Prefix of user plugin columns
pub const UDPS_PREFIX: &str = "udps.";

const DIRECTIONS: [&str; 3] = ["bidirectional", "src2dst", "dst2src"];

/// Special-purpose ranges reported as private, as in the IANA registries
const PRIVATE_RANGES: [&str; 24] = [
    "0.0.0.0/8",
    "10.0.0.0/8",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "240.0.0.0/4",
    "255.255.255.255/32",
    "::/128",
    "::1/128",
    "::ffff:0:0/96",
    "64:ff9b:1::/48",
    "100::/64",
    "2001::/23",
    "2001:db8::/32",
    "2002::/16",
    "fc00::/7",
    "fe80::/10",
    "3fff::/20",
];

/// Globally reachable exceptions inside the private ranges
const PUBLIC_EXCEPTIONS: [&str; 8] = [
    "192.0.0.9/32",
    "192.0.0.10/32",
    "2001:1::1/128",
    "2001:1::2/128",
    "2001:3::/32",
    "2001:4:112::/48",
    "2001:20::/28",
    "2001:30::/28",
];

fn networks(ranges: &[&str]) -> Vec<IpNetwork> {
    ranges.iter().filter_map(|r| r.parse().ok()).collect()
}

fn is_private(ip: &IpAddr) -> bool {
    static PRIVATE: OnceLock<(Vec<IpNetwork>, Vec<IpNetwork>)> = OnceLock::new();
    let (private, public) = PRIVATE.get_or_init(|| (networks(&PRIVATE_RANGES), networks(&PUBLIC_EXCEPTIONS)));
    private.iter().any(|net| net.contains(*ip)) && !public.iter().any(|net| net.contains(*ip))
}

fn address(ip: &IpAddr, anonymizer: Option<&dyn Anonymizer>) -> Value {
    let text = ip.to_string();
    match anonymizer {
        Some(a) => Value::from(a.anonymize(&text)),
        None => Value::from(text),
    }
}

fn flag(b: bool) -> Value {
    Value::from(b as u8)
}

/// Built-in fields of one record, in column order
fn builtin_fields(flow: &FlowRecord, statistics: bool, anonymizer: Option<&dyn Anonymizer>) -> Vec<(String, Value)> {
    let mut fields: Vec<(String, Value)> = vec![
        ("id".into(), flow.id.into()),
        ("expiration_id".into(), flow.expiration_id.into()),
        ("src_ip".into(), address(&flow.src_ip, anonymizer)),
        ("src_ip_is_private".into(), flag(is_private(&flow.src_ip))),
        ("src_port".into(), flow.src_port.into()),
        ("dst_ip".into(), address(&flow.dst_ip, anonymizer)),
        ("dst_ip_is_private".into(), flag(is_private(&flow.dst_ip))),
        ("dst_port".into(), flow.dst_port.into()),
        ("protocol".into(), flow.protocol.into()),
        ("ip_version".into(), flow.ip_version.into()),
        ("vlan_id".into(), flow.vlan_id.into()),
        ("tunnel_id".into(), flow.tunnel_id.into()),
    ];

    let counters: [&DirectionalCounters; 3] = [&flow.bidirectional, &flow.src2dst, &flow.dst2src];
    for (dir, c) in DIRECTIONS.iter().zip(counters) {
        fields.push((format!("{dir}_first_seen_ms"), c.first_seen_ms.into()));
        fields.push((format!("{dir}_last_seen_ms"), c.last_seen_ms.into()));
        fields.push((format!("{dir}_duration_ms"), c.duration_ms().into()));
        fields.push((format!("{dir}_packets"), c.packets.into()));
        fields.push((format!("{dir}_bytes"), c.bytes.into()));
    }

    if statistics {
        let s = flow.statistics.unwrap_or_default();
        for (dir, stats) in DIRECTIONS.iter().zip([s.bidirectional, s.src2dst, s.dst2src]) {
            for (metric, acc) in [("ps", stats.ps), ("piat_ms", stats.piat)] {
                push_stats(&mut fields, dir, metric, &acc);
            }
        }
    }

    for (dir, c) in DIRECTIONS.iter().zip(counters) {
        for (name, count) in [
            ("syn", c.syn_packets),
            ("cwr", c.cwr_packets),
            ("ece", c.ece_packets),
            ("urg", c.urg_packets),
            ("ack", c.ack_packets),
            ("psh", c.psh_packets),
            ("rst", c.rst_packets),
            ("fin", c.fin_packets),
        ] {
            fields.push((format!("{dir}_{name}_packets"), count.into()));
        }
    }

    let cls = &flow.classification;
    fields.push(("application_name".into(), cls.application_name.clone().into()));
    fields.push(("application_category_name".into(), cls.category_name.clone().into()));
    fields.push(("application_is_guessed".into(), flag(cls.is_guessed)));
    fields.push(("application_confidence".into(), cls.confidence.into()));
    fields.push(("requested_server_name".into(), cls.requested_server_name.clone().into()));
    fields.push(("client_fingerprint".into(), cls.client_fingerprint.clone().into()));
    fields.push(("server_fingerprint".into(), cls.server_fingerprint.clone().into()));

    fields
}

fn push_stats(fields: &mut Vec<(String, Value)>, dir: &str, metric: &str, acc: &RunningStats) {
    fields.push((format!("{dir}_min_{metric}"), acc.min().into()));
    fields.push((format!("{dir}_mean_{metric}"), acc.mean().into()));
    fields.push((format!("{dir}_stddev_{metric}"), acc.stddev().into()));
    fields.push((format!("{dir}_max_{metric}"), acc.max().into()));
}

/// Column layout. Built-in columns follow the first record; extension
/// columns are the union over every record absorbed, sorted per namespace.
#[derive(Debug, Clone)]
struct Schema {
    builtin: Vec<String>,
    statistics: bool,
    features: BTreeSet<String>,
    udps: BTreeSet<String>,
}

impl Schema {
    fn of(first: &FlowRecord) -> Self {
        let statistics = first.statistics.is_some();
        let builtin = builtin_fields(first, statistics, None)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let mut schema = Self {
            builtin,
            statistics,
            features: BTreeSet::new(),
            udps: BTreeSet::new(),
        };
        schema.absorb(first);
        schema
    }

    /// Add the extension fields of `flow` missing from the layout
    fn absorb(&mut self, flow: &FlowRecord) {
        self.features.extend(flow.features().keys().cloned());
        self.udps.extend(flow.udps().keys().cloned());
    }

    fn columns(&self) -> Vec<String> {
        let mut columns = self.builtin.clone();
        columns.extend(self.features.iter().cloned());
        columns.extend(self.udps.iter().map(|k| format!("{UDPS_PREFIX}{k}")));
        columns
    }

    fn row(&self, flow: &FlowRecord, anonymizer: Option<&dyn Anonymizer>) -> Vec<Value> {
        let mut row: Vec<Value> = builtin_fields(flow, self.statistics, anonymizer)
            .into_iter()
            .map(|(_, value)| value)
            .collect();
        for name in &self.features {
            row.push(flow.feature(name).cloned().unwrap_or(Value::Null));
        }
        for name in &self.udps {
            row.push(flow.udp(name).cloned().unwrap_or(Value::Null));
        }
        row
    }
}

/// One record as a JSON object keyed by export column name
pub fn to_json(flow: &FlowRecord, anonymizer: Option<&dyn Anonymizer>) -> serde_json::Map<String, Value> {
    let mut object: serde_json::Map<String, Value> = builtin_fields(flow, flow.statistics.is_some(), anonymizer)
        .into_iter()
        .collect();
    for (name, value) in flow.features() {
        object.insert(name.clone(), value.clone());
    }
    for (name, value) in flow.udps() {
        object.insert(format!("{UDPS_PREFIX}{name}"), value.clone());
    }
    object
}

/// In-memory table of flows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Frame {
    /// Drain a flow stream into a table. Stops at the first error.
    ///
    /// Every plugin field written on any flow gets a column; flows that lack
    /// it hold `null` there.
    pub fn collect<I>(flows: I, anonymizer: Option<&dyn Anonymizer>) -> StreamResult<Self>
    where
        I: IntoIterator<Item = StreamResult<FlowRecord>>,
    {
        let records = flows.into_iter().collect::<StreamResult<Vec<_>>>()?;
        Ok(Self::from_records(&records, anonymizer))
    }

    /// Table over already finalized flows
    pub fn from_records(records: &[FlowRecord], anonymizer: Option<&dyn Anonymizer>) -> Self {
        let Some((first, rest)) = records.split_first() else {
            return Self::default();
        };
        let mut schema = Schema::of(first);
        for flow in rest {
            schema.absorb(flow);
        }
        Self {
            columns: schema.columns(),
            rows: records.iter().map(|flow| schema.row(flow, anonymizer)).collect(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// (rows, columns)
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), self.columns.len())
    }

    /// Values of one column, top to bottom
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Distinct values in a column, 0 when absent
    pub fn n_unique(&self, name: &str) -> usize {
        self.column(name)
            .map(|values| {
                values
                    .into_iter()
                    .map(Value::to_string)
                    .collect::<HashSet<_>>()
                    .len()
            })
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Comma-separated export. Text cells are quoted with inner quotes escaped
/// as `\"`; lists are written as quoted JSON.
///
/// [`CsvWriter::write_all`] buffers the stream so the header covers every
/// plugin field. [`CsvWriter::write_record`] streams against the header of
/// its first record and rejects a record carrying a field outside it.
pub struct CsvWriter<W: Write> {
    inner: W,
    columns: Option<Vec<String>>,
    rows: usize,
}

impl<W: Write> CsvWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            columns: None,
            rows: 0,
        }
    }

    fn header(&mut self, columns: &[String]) -> io::Result<()> {
        match &self.columns {
            None => {
                writeln!(self.inner, "{}", columns.join(","))?;
                self.columns = Some(columns.to_vec());
                Ok(())
            }
            Some(header) if header.as_slice() == columns => Ok(()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "columns differ from the header already written",
            )),
        }
    }

    fn write_row(&mut self, row: &[Value]) -> io::Result<()> {
        let cells: Vec<String> = row.iter().map(cell).collect();
        writeln!(self.inner, "{}", cells.join(","))?;
        self.rows += 1;
        Ok(())
    }

    /// Write one flow; the first call also writes the header
    pub fn write_record(&mut self, flow: &FlowRecord, anonymizer: Option<&dyn Anonymizer>) -> io::Result<()> {
        if self.columns.is_none() {
            self.header(&Schema::of(flow).columns())?;
        }
        let Some(columns) = self.columns.as_ref() else {
            return Ok(());
        };

        let mut fields = to_json(flow, anonymizer);
        let row: Vec<Value> = columns
            .iter()
            .map(|name| fields.remove(name).unwrap_or(Value::Null))
            .collect();
        if let Some(unknown) = fields.keys().next() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("flow {} carries field {unknown:?} outside the header", flow.id),
            ));
        }
        self.write_row(&row)
    }

    /// Write a whole table. Returns the number of rows written.
    pub fn write_frame(&mut self, frame: &Frame) -> io::Result<usize> {
        if frame.is_empty() {
            return Ok(0);
        }
        self.header(frame.columns())?;
        for row in frame.rows() {
            self.write_row(row)?;
        }
        Ok(frame.len())
    }

    /// Drain a flow stream. Returns the number of rows written.
    pub fn write_all<I>(&mut self, flows: I, anonymizer: Option<&dyn Anonymizer>) -> StreamResult<usize>
    where
        I: IntoIterator<Item = StreamResult<FlowRecord>>,
    {
        let frame = Frame::collect(flows, anonymizer)?;
        let rows = self.write_frame(&frame)?;
        self.inner.flush()?;
        Ok(rows)
    }

    /// Rows written so far
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\\\""))
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => (*b as u8).to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        other => quote(&other.to_string()),
    }
}
