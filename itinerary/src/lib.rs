//! Itinerary domain library: turns a spreadsheet export (CSV/TSV) into a normalized
//! day → period → timeline document.
//! The transform passes are pure functions over text and records; fetching the raw
//! export lives behind the `source::RawSource` seam so the core never touches I/O.

pub mod core {
    use serde::{Deserialize, Serialize};

    /// Period label used when a row leaves the period cell blank.
    pub const ALL_DAY_PERIOD: &str = "全日";

    /// One parsed line of the export, positionally aligned with the header row.
    pub type Row = Vec<String>;

    /* ------------------------------ Columns ------------------------------ */

    /// Columns the export is expected to carry, looked up by header label.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Column {
        Date,
        DayOfWeek,
        Period,
        GroupId,
        Time,
        Kind,
        City,
        Event,
        Description,
        TransportType,
        PaymentMethod,
        TransportInfo,
        Start,
        End,
        TransportFreq,
        Duration,
        Cost,
        Link,
        Location,
        AttractionWebsite,
        AttractionPrice,
        AttractionHours,
        AttractionIntro,
        AttractionDuration,
        SpecialNotes,
    }

    impl Column {
        pub const ALL: [Column; 25] = [
            Self::Date,
            Self::DayOfWeek,
            Self::Period,
            Self::GroupId,
            Self::Time,
            Self::Kind,
            Self::City,
            Self::Event,
            Self::Description,
            Self::TransportType,
            Self::PaymentMethod,
            Self::TransportInfo,
            Self::Start,
            Self::End,
            Self::TransportFreq,
            Self::Duration,
            Self::Cost,
            Self::Link,
            Self::Location,
            Self::AttractionWebsite,
            Self::AttractionPrice,
            Self::AttractionHours,
            Self::AttractionIntro,
            Self::AttractionDuration,
            Self::SpecialNotes,
        ];

        /// Header label as authored in the spreadsheet.
        #[must_use]
        pub const fn label(self) -> &'static str {
            match self {
                Self::Date => "日期",
                Self::DayOfWeek => "星期",
                Self::Period => "時段",
                Self::GroupId => "群組ID",
                Self::Time => "時間",
                Self::Kind => "類型",
                Self::City => "城市",
                Self::Event => "活動標題",
                Self::Description => "內容詳情",
                Self::TransportType => "交通方式",
                Self::PaymentMethod => "支付方式",
                Self::TransportInfo => "交通/票價資訊",
                Self::Start => "起始站",
                Self::End => "終點站",
                Self::TransportFreq => "班次頻率/時刻資訊",
                Self::Duration => "移動時間",
                Self::Cost => "費用",
                Self::Link => "相關連結(官網/時刻表)",
                Self::Location => "地點/導航",
                Self::AttractionWebsite => "景點官網",
                Self::AttractionPrice => "景點票價 (JPY)",
                Self::AttractionHours => "營業時間/狀態",
                Self::AttractionIntro => "景點簡介",
                Self::AttractionDuration => "景點建議停留時間",
                Self::SpecialNotes => "景點特殊狀況",
            }
        }
    }

    /* ---------------------------- Event payload ---------------------------- */

    /// Everything a timeline entry shows; structural fields (date, period, group) live
    /// on `FlatRecord` instead.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct EventDetails {
        pub time: String,
        #[serde(rename = "type")]
        pub kind: String,
        pub city: String,
        pub event: String,
        pub description: String,
        pub transport_type: String,
        pub payment_method: String,
        pub transport_info: String,
        /// `None` when the sheet marks the cost as not applicable (`-`).
        pub cost: Option<String>,
        pub link: String,
        pub map_url: Option<String>,
        pub start: String,
        pub end: String,
        pub duration: String,
        pub transport_freq: String,
        pub attraction_website: String,
        pub attraction_price: String,
        pub attraction_hours: String,
        pub attraction_intro: String,
        pub attraction_duration: String,
        pub special_notes: String,
    }

    impl EventDetails {
        /// The transport-variant subset kept when a grouped row becomes an alternative.
        pub fn transport_option(&self) -> TransportOption {
            TransportOption {
                transport_type: self.transport_type.clone(),
                payment_method: self.payment_method.clone(),
                start: self.start.clone(),
                end: self.end.clone(),
                transport_freq: self.transport_freq.clone(),
                duration: self.duration.clone(),
                cost: self.cost.clone(),
                link: self.link.clone(),
            }
        }
    }

    /// An alternative way to make the same trip, folded into its primary entry.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct TransportOption {
        pub transport_type: String,
        pub payment_method: String,
        pub start: String,
        pub end: String,
        pub transport_freq: String,
        pub duration: String,
        pub cost: Option<String>,
        pub link: String,
    }

    /* ------------------------------ Records ------------------------------ */

    /// One qualifying data row, before grouping.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct FlatRecord {
        pub date: String,
        pub day_of_week: String,
        pub period: String,
        /// Empty when the row is not part of a group.
        pub group_id: String,
        pub details: EventDetails,
    }

    impl FlatRecord {
        pub fn is_grouped(&self) -> bool {
            !self.group_id.is_empty()
        }
    }

    /// A primary record with the alternatives collected from its group.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MergedRecord {
        pub record: FlatRecord,
        pub alternatives: Vec<TransportOption>,
    }

    impl MergedRecord {
        pub fn primary(record: FlatRecord) -> Self {
            Self {
                record,
                alternatives: vec![],
            }
        }
    }

    /* ------------------------------ Document ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct TimelineEvent {
        #[serde(flatten)]
        pub details: EventDetails,
        /// Present in the output only when the entry's group produced variants.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub alternatives: Vec<TransportOption>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Period {
        pub period: String,
        /// Reserved for consumers; never filled by the builder.
        #[serde(default)]
        pub time_range: String,
        #[serde(default)]
        pub timeline: Vec<TimelineEvent>,
    }

    impl Period {
        pub fn new(label: impl Into<String>) -> Self {
            Self {
                period: label.into(),
                time_range: String::new(),
                timeline: vec![],
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Day {
        pub date: String,
        pub day_of_week: String,
        #[serde(default)]
        pub periods: Vec<Period>,
    }

    impl Day {
        pub fn new(date: impl Into<String>, day_of_week: impl Into<String>) -> Self {
            Self {
                date: date.into(),
                day_of_week: day_of_week.into(),
                periods: vec![],
            }
        }

        /// Period with `label`, opened at the end of the day if not present yet.
        pub fn period_mut(&mut self, label: &str) -> &mut Period {
            let idx = match self.periods.iter().position(|p| p.period == label) {
                Some(idx) => idx,
                None => {
                    self.periods.push(Period::new(label));
                    self.periods.len() - 1
                }
            };
            &mut self.periods[idx]
        }

        pub fn events(&self) -> impl Iterator<Item = &TimelineEvent> {
            self.periods.iter().flat_map(|p| p.timeline.iter())
        }
    }

    /// Aggregate root handed to consumers; serializes as a bare array of days.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Itinerary {
        pub days: Vec<Day>,
    }

    impl Itinerary {
        pub fn len(&self) -> usize {
            self.days.len()
        }

        pub fn is_empty(&self) -> bool {
            self.days.is_empty()
        }

        pub fn event_count(&self) -> usize {
            self.days.iter().map(|d| d.events().count()).sum()
        }
    }
}

pub mod parser {
    //! Tolerant delimited-text scanner for spreadsheet exports.
    //!
    //! One left-to-right pass with an in-quote flag:
    //! - outside quotes the delimiter ends a field, LF ends a row and CR is dropped;
    //! - inside quotes everything is literal except `""` (one quote) and a closing `"`;
    //! - an unterminated quote simply runs to end of input.
    //!
    //! The scanner never fails; malformed input degrades into odd-looking fields instead.

    use crate::core::Row;

    const BOM: char = '\u{feff}';
    const QUOTE: char = '"';

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum Delimiter {
        #[default]
        Comma,
        Tab,
    }

    impl Delimiter {
        pub const fn as_char(self) -> char {
            match self {
                Self::Comma => ',',
                Self::Tab => '\t',
            }
        }

        /// Guess the delimiter from the header line: tab wins only when it outnumbers commas.
        pub fn sniff(text: &str) -> Self {
            let (mut tabs, mut commas) = (0usize, 0usize);
            let mut in_quote = false;
            for c in text.trim_start_matches(BOM).chars() {
                match c {
                    QUOTE => in_quote = !in_quote,
                    '\n' if !in_quote => break,
                    '\t' if !in_quote => tabs += 1,
                    ',' if !in_quote => commas += 1,
                    _ => {}
                }
            }
            if tabs > commas { Self::Tab } else { Self::Comma }
        }
    }

    /// Split `input` into rows of trimmed fields.
    pub fn parse_delimited(input: &str, delimiter: Delimiter) -> Vec<Row> {
        let text = input.strip_prefix(BOM).unwrap_or(input);
        let delim = delimiter.as_char();
        let mut scan = Scanner::default();
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            if scan.in_quote {
                match c {
                    QUOTE if chars.peek() == Some(&QUOTE) => {
                        chars.next();
                        scan.field.push(QUOTE);
                    }
                    QUOTE => scan.in_quote = false,
                    _ => scan.field.push(c),
                }
            } else {
                match c {
                    QUOTE => scan.in_quote = true,
                    '\r' => {}
                    '\n' => scan.end_row(),
                    c if c == delim => scan.end_field(),
                    _ => scan.field.push(c),
                }
            }
        }

        scan.finish()
    }

    #[derive(Default)]
    struct Scanner {
        in_quote: bool,
        field: String,
        row: Row,
        rows: Vec<Row>,
    }

    impl Scanner {
        fn end_field(&mut self) {
            let value = self.field.trim_matches(|c: char| c.is_whitespace() || c == BOM);
            self.row.push(value.to_string());
            self.field.clear();
        }

        fn end_row(&mut self) {
            self.end_field();
            let row = std::mem::take(&mut self.row);
            if !is_blank(&row) {
                self.rows.push(row);
            }
        }

        fn finish(mut self) -> Vec<Row> {
            if !self.field.is_empty() || !self.row.is_empty() {
                self.end_row();
            }
            self.rows
        }
    }

    // A blank line scans as exactly one empty field.
    fn is_blank(row: &[String]) -> bool {
        matches!(row, [only] if only.is_empty())
    }

}

pub mod format {
    //! Re-serialization of parsed rows, quoting only where the scanner needs it.

    use crate::core::Row;
    use crate::parser::Delimiter;

    pub fn format_rows(rows: &[Row], delimiter: Delimiter) -> String {
        let sep = delimiter.as_char();
        let mut out = String::new();
        for row in rows {
            for (idx, field) in row.iter().enumerate() {
                if idx > 0 {
                    out.push(sep);
                }
                append_field(&mut out, field, sep);
            }
            out.push('\n');
        }
        out
    }

    fn append_field(out: &mut String, field: &str, sep: char) {
        if needs_quotes(field, sep) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }

    // A leading BOM would be stripped on re-read if it opened the text.
    fn needs_quotes(field: &str, sep: char) -> bool {
        field.starts_with('\u{feff}')
            || field
                .chars()
                .any(|c| c == sep || matches!(c, '"' | '\r' | '\n'))
    }

}

pub mod maps {
    //! Map links derived from the free-text location column.

    use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

    pub const MAP_EMBED_BASE: &str = "https://maps.google.com/maps";

    /// Placeholder the sheet uses for "no location".
    const NOT_APPLICABLE: &str = "-";

    /// Same escape set as `encodeURIComponent`.
    const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
        .remove(b'-')
        .remove(b'_')
        .remove(b'.')
        .remove(b'!')
        .remove(b'~')
        .remove(b'*')
        .remove(b'\'')
        .remove(b'(')
        .remove(b')');

    /// Embeddable map URL for `location`, or `None` when the cell has nothing to show.
    ///
    /// Absolute `http(s)` links pass through untouched; anything else is treated as a
    /// place name and becomes a search query.
    pub fn resolve_map_url(location: &str) -> Option<String> {
        let trimmed = location.trim();
        if trimmed.is_empty() || trimmed == NOT_APPLICABLE {
            return None;
        }
        if is_absolute_http(trimmed) {
            return Some(trimmed.to_string());
        }
        Some(format!(
            "{MAP_EMBED_BASE}?q={}&output=embed",
            utf8_percent_encode(trimmed, URI_COMPONENT)
        ))
    }

    fn is_absolute_http(s: &str) -> bool {
        ["http://", "https://"].iter().any(|scheme| {
            s.len() >= scheme.len() && s.as_bytes()[..scheme.len()].eq_ignore_ascii_case(scheme.as_bytes())
        })
    }

    #[cfg(test)]
    mod tests {
        use super::resolve_map_url;

        #[test]
        fn placeholders_have_no_map() {
            assert_eq!(resolve_map_url("-"), None);
            assert_eq!(resolve_map_url(""), None);
            assert_eq!(resolve_map_url("   "), None);
            assert_eq!(resolve_map_url(" - "), None);
        }

        #[test]
        fn absolute_links_pass_through() {
            assert_eq!(
                resolve_map_url("https://example.com/x").as_deref(),
                Some("https://example.com/x")
            );
            assert_eq!(
                resolve_map_url("  HTTP://maps.app.goo.gl/abc ").as_deref(),
                Some("HTTP://maps.app.goo.gl/abc")
            );
        }

        #[test]
        fn place_names_become_encoded_queries() {
            let url = resolve_map_url("Tokyo Tower").unwrap();
            assert!(url.contains("Tokyo%20Tower"), "{url}");
            assert_eq!(url, "https://maps.google.com/maps?q=Tokyo%20Tower&output=embed");
        }

        #[test]
        fn reserved_and_non_ascii_characters_are_escaped() {
            let url = resolve_map_url("淺草寺 & Kaminarimon (gate)").unwrap();
            assert_eq!(
                url,
                "https://maps.google.com/maps?q=%E6%B7%BA%E8%8D%89%E5%AF%BA%20%26%20Kaminarimon%20(gate)&output=embed"
            );
        }
    }
}

pub mod normalize {
    //! The three passes from rows to document: flatten → merge groups → build hierarchy.
    //!
    //! Each pass is a plain function over owned values so it can be exercised alone.
    //! Missing columns and short rows read as empty strings; nothing here fails.

    use crate::core::*;
    use crate::maps::resolve_map_url;
    use indexmap::IndexMap;
    use log::{debug, warn};

    /* ---------------------------- Field accessor ---------------------------- */

    /// Header label → column position, built once from row 0.
    #[derive(Debug, Clone, Default)]
    pub struct HeaderIndex {
        positions: IndexMap<String, usize>,
    }

    impl HeaderIndex {
        /// Duplicate labels resolve to their last occurrence.
        pub fn from_header(header: &[String]) -> Self {
            let mut positions = IndexMap::with_capacity(header.len());
            for (idx, label) in header.iter().enumerate() {
                positions.insert(label.clone(), idx);
            }
            Self { positions }
        }

        pub fn position(&self, label: &str) -> Option<usize> {
            self.positions.get(label).copied()
        }

        /// Value of column `label` in `row`, or `""` if the header or the row lacks it.
        pub fn get<'r>(&self, row: &'r [String], label: &str) -> &'r str {
            self.position(label)
                .and_then(|idx| row.get(idx))
                .map(String::as_str)
                .unwrap_or("")
        }

        pub fn field<'r>(&self, row: &'r [String], column: Column) -> &'r str {
            self.get(row, column.label())
        }
    }

    /* ------------------------------ Flattener ------------------------------ */

    /// One record per data row that carries a date; header echoes are dropped.
    pub fn flatten_rows(rows: &[Row]) -> Vec<FlatRecord> {
        let Some((header, data)) = rows.split_first() else {
            return vec![];
        };
        let index = HeaderIndex::from_header(header);
        let mut out = Vec::with_capacity(data.len());

        for (offset, row) in data.iter().enumerate() {
            // +2: 1-based line number, header included.
            let line = offset + 2;
            let date = index.field(row, Column::Date);
            if date.is_empty() {
                debug!("line {line}: no date, skipped");
                continue;
            }
            if date == Column::Date.label() {
                debug!("line {line}: repeated header row, skipped");
                continue;
            }
            out.push(flatten_row(&index, row));
        }
        out
    }

    fn flatten_row(index: &HeaderIndex, row: &[String]) -> FlatRecord {
        let get = |column: Column| index.field(row, column).to_string();
        let period = match index.field(row, Column::Period) {
            "" => ALL_DAY_PERIOD.to_string(),
            label => label.to_string(),
        };

        FlatRecord {
            date: get(Column::Date),
            day_of_week: get(Column::DayOfWeek),
            period,
            group_id: get(Column::GroupId),
            details: EventDetails {
                time: get(Column::Time),
                kind: get(Column::Kind),
                city: get(Column::City),
                event: get(Column::Event),
                description: get(Column::Description),
                transport_type: get(Column::TransportType),
                payment_method: get(Column::PaymentMethod),
                transport_info: get(Column::TransportInfo),
                cost: cost_value(index.field(row, Column::Cost)),
                link: get(Column::Link),
                map_url: resolve_map_url(index.field(row, Column::Location)),
                start: get(Column::Start),
                end: get(Column::End),
                duration: get(Column::Duration),
                transport_freq: get(Column::TransportFreq),
                attraction_website: get(Column::AttractionWebsite),
                attraction_price: get(Column::AttractionPrice),
                attraction_hours: get(Column::AttractionHours),
                attraction_intro: get(Column::AttractionIntro),
                attraction_duration: get(Column::AttractionDuration),
                special_notes: get(Column::SpecialNotes),
            },
        }
    }

    fn cost_value(raw: &str) -> Option<String> {
        (raw != "-").then(|| raw.to_string())
    }

    /* ---------------------------- Group merger ---------------------------- */

    /// First record of each group stays on the timeline; later ones become its alternatives.
    pub fn merge_groups(records: Vec<FlatRecord>) -> Vec<MergedRecord> {
        let mut merged: Vec<MergedRecord> = Vec::with_capacity(records.len());
        let mut primaries: IndexMap<String, usize> = IndexMap::new();

        for record in records {
            if record.is_grouped() {
                if let Some(&slot) = primaries.get(&record.group_id) {
                    debug!(
                        "group {}: folding {:?} into primary {:?}",
                        record.group_id, record.details.event, merged[slot].record.details.event
                    );
                    merged[slot]
                        .alternatives
                        .push(record.details.transport_option());
                    continue;
                }
                primaries.insert(record.group_id.clone(), merged.len());
            }
            merged.push(MergedRecord::primary(record));
        }
        merged
    }

    /* -------------------------- Hierarchy builder -------------------------- */

    /// Fold context for day/period grouping.
    ///
    /// A date seen earlier is merged back into its first day even when other dates came in
    /// between; that case is logged since it usually means the sheet was sorted oddly.
    #[derive(Debug, Default)]
    pub struct HierarchyBuilder {
        days: Vec<Day>,
        day_slots: IndexMap<String, usize>,
        current: Option<usize>,
    }

    impl HierarchyBuilder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&mut self, merged: MergedRecord) {
            let FlatRecord {
                date,
                day_of_week,
                period,
                details,
                ..
            } = merged.record;
            let slot = self.day_slot(date, day_of_week);
            self.days[slot]
                .period_mut(&period)
                .timeline
                .push(TimelineEvent {
                    details,
                    alternatives: merged.alternatives,
                });
            self.current = Some(slot);
        }

        fn day_slot(&mut self, date: String, day_of_week: String) -> usize {
            if let Some(&slot) = self.day_slots.get(&date) {
                if self.current != Some(slot) {
                    warn!("date {date} reappears after other days; merged into its first block");
                }
                return slot;
            }
            let slot = self.days.len();
            self.days.push(Day::new(date.clone(), day_of_week));
            self.day_slots.insert(date, slot);
            slot
        }

        pub fn finish(self) -> Itinerary {
            Itinerary { days: self.days }
        }
    }

    pub fn build_itinerary(records: Vec<MergedRecord>) -> Itinerary {
        let mut builder = HierarchyBuilder::new();
        for record in records {
            builder.push(record);
        }
        builder.finish()
    }

    /// Full pipeline over parsed rows. Fewer than two rows (no data) yields an empty document.
    pub fn normalize(rows: &[Row]) -> Itinerary {
        if rows.len() < 2 {
            return Itinerary::default();
        }
        build_itinerary(merge_groups(flatten_rows(rows)))
    }

}

pub mod source {
    //! Where the raw export text comes from. The transform passes never see these types.

    use log::{info, warn};
    use std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    };

    /// Bodies shorter than this are assumed to be an access-denied or error page.
    pub const MIN_EXPORT_LEN: usize = 100;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    #[derive(Debug, thiserror::Error)]
    pub enum SourceError {
        #[error("reading {path:?}: {source}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("requesting {url}: {source}")]
        Http {
            url: String,
            #[source]
            source: reqwest::Error,
        },
        #[error("HTTP status {status} from {url}")]
        Status {
            url: String,
            status: reqwest::StatusCode,
        },
        #[error("received only {len} bytes from {url} (access denied?)")]
        TooShort { url: String, len: usize },
        #[error("no data source available: {0}")]
        Unavailable(String),
    }

    /// Provider of raw export text.
    pub trait RawSource {
        /// Human-readable location for logs.
        fn describe(&self) -> String;

        fn fetch(&self) -> Result<String, SourceError>;
    }

    /* ------------------------------ Local file ------------------------------ */

    #[derive(Debug, Clone)]
    pub struct FileSource {
        pub path: PathBuf,
    }

    impl FileSource {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }
    }

    impl RawSource for FileSource {
        fn describe(&self) -> String {
            format!("file {:?}", self.path)
        }

        fn fetch(&self) -> Result<String, SourceError> {
            fs::read_to_string(&self.path).map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })
        }
    }

    /* ------------------------------ HTTP export ------------------------------ */

    /// Published-sheet export URL; redirects are followed.
    #[derive(Debug, Clone)]
    pub struct HttpSource {
        pub url: String,
        pub timeout: Duration,
        pub min_len: usize,
    }

    impl HttpSource {
        pub fn new(url: impl Into<String>) -> Self {
            Self {
                url: url.into(),
                timeout: DEFAULT_TIMEOUT,
                min_len: MIN_EXPORT_LEN,
            }
        }

        fn http_err(&self) -> impl Fn(reqwest::Error) -> SourceError + '_ {
            move |source| SourceError::Http {
                url: self.url.clone(),
                source,
            }
        }
    }

    impl RawSource for HttpSource {
        fn describe(&self) -> String {
            format!("url {}", self.url)
        }

        fn fetch(&self) -> Result<String, SourceError> {
            let client = reqwest::blocking::Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(self.http_err())?;
            let response = client.get(&self.url).send().map_err(self.http_err())?;

            let status = response.status();
            if status != reqwest::StatusCode::OK {
                return Err(SourceError::Status {
                    url: self.url.clone(),
                    status,
                });
            }

            let body = response.text().map_err(self.http_err())?;
            if body.len() < self.min_len {
                return Err(SourceError::TooShort {
                    url: self.url.clone(),
                    len: body.len(),
                });
            }
            Ok(body)
        }
    }

    /* ---------------------------- Remote + fallback ---------------------------- */

    /// Remote first, local copy second. A successful download refreshes the local copy
    /// when mirroring is on.
    pub struct FallbackSource {
        remote: Option<Box<dyn RawSource>>,
        local: FileSource,
        mirror: bool,
    }

    impl FallbackSource {
        pub fn new(remote: Option<Box<dyn RawSource>>, local: impl Into<PathBuf>) -> Self {
            Self {
                remote,
                local: FileSource::new(local),
                mirror: true,
            }
        }

        pub fn with_mirror(mut self, mirror: bool) -> Self {
            self.mirror = mirror;
            self
        }

        pub fn local_path(&self) -> &Path {
            &self.local.path
        }

        fn write_mirror(&self, text: &str) {
            let path = self.local_path();
            let written = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|()| fs::write(path, text));
            match written {
                Ok(()) => info!("mirrored remote export to {:?}", path),
                Err(err) => warn!("could not mirror remote export to {:?}: {err}", path),
            }
        }
    }

    impl RawSource for FallbackSource {
        fn describe(&self) -> String {
            match &self.remote {
                Some(remote) => format!("{} (fallback {})", remote.describe(), self.local.describe()),
                None => self.local.describe(),
            }
        }

        fn fetch(&self) -> Result<String, SourceError> {
            match &self.remote {
                Some(remote) => match remote.fetch() {
                    Ok(text) => {
                        info!("fetched {}", remote.describe());
                        if self.mirror {
                            self.write_mirror(&text);
                        }
                        return Ok(text);
                    }
                    Err(err) => warn!("remote sync failed: {err}"),
                },
                None => warn!("no remote export configured; skipping remote fetch"),
            }

            info!("using local fallback {}", self.local.describe());
            self.local
                .fetch()
                .map_err(|err| SourceError::Unavailable(err.to_string()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::cell::Cell;

        struct FakeRemote {
            body: Option<&'static str>,
            calls: Cell<usize>,
        }

        impl RawSource for FakeRemote {
            fn describe(&self) -> String {
                "fake remote".into()
            }

            fn fetch(&self) -> Result<String, SourceError> {
                self.calls.set(self.calls.get() + 1);
                self.body
                    .map(str::to_string)
                    .ok_or_else(|| SourceError::Unavailable("offline".into()))
            }
        }

        fn remote(body: Option<&'static str>) -> Box<dyn RawSource> {
            Box::new(FakeRemote {
                body,
                calls: Cell::new(0),
            })
        }

        #[test]
        fn file_source_reports_missing_files() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let err = FileSource::new(tmp.path().join("nope.csv")).fetch().unwrap_err();
            assert!(matches!(err, SourceError::Io { .. }));
        }

        #[test]
        fn remote_success_is_mirrored_locally() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let local = tmp.path().join("data").join("mirror.csv");
            let source = FallbackSource::new(Some(remote(Some("日期\n2026/03/10\n"))), &local);

            assert_eq!(source.fetch().unwrap(), "日期\n2026/03/10\n");
            assert_eq!(fs::read_to_string(&local).unwrap(), "日期\n2026/03/10\n");
        }

        #[test]
        fn mirroring_can_be_disabled() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let local = tmp.path().join("mirror.csv");
            let source = FallbackSource::new(Some(remote(Some("x"))), &local).with_mirror(false);
            source.fetch().unwrap();
            assert!(!local.exists());
        }

        #[test]
        fn remote_failure_falls_back_to_local_copy() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let local = tmp.path().join("local.csv");
            fs::write(&local, "cached").unwrap();

            let source = FallbackSource::new(Some(remote(None)), &local);
            assert_eq!(source.fetch().unwrap(), "cached");

            let local_only = FallbackSource::new(None, &local);
            assert_eq!(local_only.fetch().unwrap(), "cached");
        }

        #[test]
        fn both_sources_failing_is_unavailable() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let source = FallbackSource::new(Some(remote(None)), tmp.path().join("missing.csv"));
            assert!(matches!(source.fetch(), Err(SourceError::Unavailable(_))));
        }

        #[test]
        fn http_source_defaults() {
            let source = HttpSource::new("https://docs.google.com/spreadsheets/d/x/pub?output=csv");
            assert_eq!(source.timeout, DEFAULT_TIMEOUT);
            assert_eq!(source.min_len, MIN_EXPORT_LEN);
            assert!(source.describe().contains("output=csv"));
        }
    }
}

pub mod projectors {
    pub mod overview {
        //! Per-day read model for overview screens: main city, a morning/afternoon/evening
        //! glance, and calendar filtering.

        use crate::core::{Day, Itinerary};
        use chrono::NaiveDate;
        use indexmap::IndexMap;
        use nom::{
            IResult,
            bytes::complete::take_while_m_n,
            character::complete::one_of,
            combinator::{all_consuming, map_res},
            error::{VerboseError, VerboseErrorKind},
            sequence::tuple,
        };
        use serde::{Deserialize, Serialize};

        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub enum PeriodBucket {
            Morning,
            Afternoon,
            Evening,
        }

        impl PeriodBucket {
            pub const ALL: [PeriodBucket; 3] = [Self::Morning, Self::Afternoon, Self::Evening];

            /// Character that puts a period label into this bucket.
            pub const fn marker(self) -> char {
                match self {
                    Self::Morning => '早',
                    Self::Afternoon => '下',
                    Self::Evening => '晚',
                }
            }

            /// Every bucket a free-text period label names. A label like `下午~晚上` lands in
            /// two buckets; all-day labels land in none.
            pub fn matching(label: &str) -> impl Iterator<Item = Self> + '_ {
                Self::ALL
                    .into_iter()
                    .filter(move |bucket| label.contains(bucket.marker()))
            }

            pub const fn name(self) -> &'static str {
                match self {
                    Self::Morning => "morning",
                    Self::Afternoon => "afternoon",
                    Self::Evening => "evening",
                }
            }
        }

        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct Glance {
            pub time: String,
            pub event: String,
        }

        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct DaySummary {
            /// 1-based position in the unfiltered document.
            pub index: usize,
            pub date: String,
            pub day_of_week: String,
            pub main_city: Option<String>,
            pub morning: Vec<Glance>,
            pub afternoon: Vec<Glance>,
            pub evening: Vec<Glance>,
        }

        impl DaySummary {
            pub fn bucket(&self, bucket: PeriodBucket) -> &[Glance] {
                match bucket {
                    PeriodBucket::Morning => &self.morning,
                    PeriodBucket::Afternoon => &self.afternoon,
                    PeriodBucket::Evening => &self.evening,
                }
            }

            fn bucket_mut(&mut self, bucket: PeriodBucket) -> &mut Vec<Glance> {
                match bucket {
                    PeriodBucket::Morning => &mut self.morning,
                    PeriodBucket::Afternoon => &mut self.afternoon,
                    PeriodBucket::Evening => &mut self.evening,
                }
            }
        }

        /// Inclusive calendar filter. Days whose date does not parse are always admitted.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct DateRange {
            pub from: Option<NaiveDate>,
            pub to: Option<NaiveDate>,
        }

        impl DateRange {
            /// Raise the lower bound to `floor` (used for "from today").
            pub fn not_before(self, floor: NaiveDate) -> Self {
                Self {
                    from: Some(self.from.map_or(floor, |from| from.max(floor))),
                    ..self
                }
            }

            pub fn admits(&self, date: &str) -> bool {
                let Some(date) = parse_day_date(date) else {
                    return true;
                };
                self.from.is_none_or(|from| date >= from) && self.to.is_none_or(|to| date <= to)
            }
        }

        pub fn summarize(itinerary: &Itinerary, range: DateRange) -> Vec<DaySummary> {
            itinerary
                .days
                .iter()
                .enumerate()
                .filter(|(_, day)| range.admits(&day.date))
                .map(|(idx, day)| summarize_day(idx + 1, day))
                .collect()
        }

        fn summarize_day(index: usize, day: &Day) -> DaySummary {
            let mut summary = DaySummary {
                index,
                date: day.date.clone(),
                day_of_week: day.day_of_week.clone(),
                main_city: main_city(day),
                morning: vec![],
                afternoon: vec![],
                evening: vec![],
            };
            for period in &day.periods {
                for bucket in PeriodBucket::matching(&period.period) {
                    summary
                        .bucket_mut(bucket)
                        .extend(period.timeline.iter().map(|e| Glance {
                            time: e.details.time.clone(),
                            event: e.details.event.clone(),
                        }));
                }
            }
            summary
        }

        /// Most frequent city of the day; ties go to the city seen first.
        pub fn main_city(day: &Day) -> Option<String> {
            let mut counts: IndexMap<&str, usize> = IndexMap::new();
            for event in day.events() {
                let city = event.details.city.trim();
                if !city.is_empty() {
                    *counts.entry(city).or_default() += 1;
                }
            }

            let mut best: Option<(&str, usize)> = None;
            for (city, count) in counts {
                if best.is_none_or(|(_, top)| count > top) {
                    best = Some((city, count));
                }
            }
            best.map(|(city, _)| city.to_string())
        }

        /* ---------------------------- Date parsing ---------------------------- */

        type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

        /// `2026/03/10`, `2026-3-10` or `2026.03.10`.
        pub fn parse_day_date(text: &str) -> Option<NaiveDate> {
            all_consuming(day_date)(text.trim())
                .ok()
                .map(|(_, date)| date)
        }

        fn day_date(i: &str) -> PResult<'_, NaiveDate> {
            let (rest, (year, _, month, _, day)) = tuple((
                map_res(take_while_m_n(4, 4, is_digit), str::parse::<i32>),
                date_separator,
                map_res(take_while_m_n(1, 2, is_digit), str::parse::<u32>),
                date_separator,
                map_res(take_while_m_n(1, 2, is_digit), str::parse::<u32>),
            ))(i)?;

            match NaiveDate::from_ymd_opt(year, month, day) {
                Some(date) => Ok((rest, date)),
                None => Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("calendar date"))],
                })),
            }
        }

        fn date_separator(i: &str) -> PResult<'_, char> {
            one_of("/-.")(i)
        }

        fn is_digit(c: char) -> bool {
            c.is_ascii_digit()
        }

    }
}

/* ------------------------------ Entry points ------------------------------ */

use crate::core::Itinerary;
use crate::parser::Delimiter;
use crate::source::{RawSource, SourceError};

/// Parse and normalize an export already in memory.
pub fn convert_str(text: &str, delimiter: Delimiter) -> Itinerary {
    let rows = parser::parse_delimited(text, delimiter);
    normalize::normalize(&rows)
}

/// Fetch from `source` and normalize; `None` sniffs the delimiter from the header line.
pub fn load_itinerary(
    source: &dyn RawSource,
    delimiter: Option<Delimiter>,
) -> Result<Itinerary, SourceError> {
    let text = source.fetch()?;
    let delimiter = delimiter.unwrap_or_else(|| Delimiter::sniff(&text));
    log::debug!("parsing {} as {:?}-delimited", source.describe(), delimiter);
    Ok(convert_str(&text, delimiter))
}

pub use format::format_rows;
pub use parser::parse_delimited;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FileSource;

    const SAMPLE: &str = include_str!("../../data/template_v2.csv");

    #[test]
    fn sample_export_normalizes_end_to_end() {
        let doc = convert_str(SAMPLE, Delimiter::sniff(SAMPLE));
        assert_eq!(doc.len(), 3);

        let first = &doc.days[0];
        assert_eq!(first.date, "2026/03/10");
        let labels: Vec<_> = first.periods.iter().map(|p| p.period.as_str()).collect();
        assert_eq!(labels, vec!["早上", "下午", "晚上"]);

        let transfer = &first.periods[0].timeline[1];
        assert_eq!(transfer.details.kind, "交通");
        assert_eq!(transfer.alternatives.len(), 1);

        assert_eq!(doc.days[2].periods[0].period, "全日");
    }

    #[test]
    fn load_itinerary_sniffs_tab_exports() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("export.tsv");
        std::fs::write(&path, "日期\t時段\t活動標題\n2026/03/10\t早上\tA, B\n").unwrap();

        let doc = load_itinerary(&FileSource::new(&path), None).unwrap();
        assert_eq!(doc.days[0].periods[0].timeline[0].details.event, "A, B");
    }
}
