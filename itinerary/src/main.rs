use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use itinerary::core::Itinerary;
use itinerary::parser::Delimiter;
use itinerary::projectors::overview::{self, DateRange, DaySummary, PeriodBucket};
use itinerary::source::{FallbackSource, FileSource, HttpSource, RawSource};
use itinerary::{convert_str, format_rows, load_itinerary, parse_delimited};
use log::{info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "itinerary",
    about = "Turn a travel-planning spreadsheet export into itinerary JSON",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Convert a CSV/TSV export into itinerary JSON.
    Convert(ConvertArgs),

    /// Fetch the published sheet (falling back to the local copy) and write the JSON document.
    Sync(SyncArgs),

    /// Print a per-day overview: main city and morning/afternoon/evening highlights.
    Overview(OverviewArgs),

    /// Re-serialize an export with minimal quoting, optionally switching delimiter.
    Format(FormatArgs),
}

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum DelimiterArg {
    /// Guess from the header line.
    #[default]
    Auto,
    Comma,
    Tab,
}

impl DelimiterArg {
    fn fixed(self) -> Option<Delimiter> {
        match self {
            Self::Auto => None,
            Self::Comma => Some(Delimiter::Comma),
            Self::Tab => Some(Delimiter::Tab),
        }
    }

    fn resolve(self, text: &str) -> Delimiter {
        self.fixed().unwrap_or_else(|| Delimiter::sniff(text))
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputDelimiter {
    Comma,
    Tab,
}

impl From<OutputDelimiter> for Delimiter {
    fn from(value: OutputDelimiter) -> Self {
        match value {
            OutputDelimiter::Comma => Delimiter::Comma,
            OutputDelimiter::Tab => Delimiter::Tab,
        }
    }
}

#[derive(Debug, Args)]
struct ConvertArgs {
    /// Export file to read, or `-` for stdin.
    input: PathBuf,
    #[arg(long, value_enum, default_value_t = DelimiterArg::Auto)]
    delimiter: DelimiterArg,
    /// Write the JSON here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Emit single-line JSON.
    #[arg(long)]
    compact: bool,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Published export URL.
    #[arg(long, env = "SHEET_URL")]
    url: Option<String>,
    /// Local copy used as fallback and refreshed after a successful download.
    #[arg(long, env = "ITINERARY_LOCAL_CSV", default_value = "data/template_v2.csv")]
    local_csv: PathBuf,
    #[arg(long, env = "ITINERARY_OUTPUT", default_value = "data/travel_data.json")]
    output: PathBuf,
    /// Do not overwrite the local copy with the downloaded export.
    #[arg(long)]
    no_mirror: bool,
    #[arg(long, value_enum, default_value_t = DelimiterArg::Auto)]
    delimiter: DelimiterArg,
}

#[derive(Debug, Args)]
struct OverviewArgs {
    /// Export file to read, or `-` for stdin.
    input: PathBuf,
    /// Inclusive start date filter (YYYY-MM-DD).
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Inclusive end date filter (YYYY-MM-DD).
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Hide days before today.
    #[arg(long)]
    from_today: bool,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
    #[arg(long, value_enum, default_value_t = DelimiterArg::Auto)]
    delimiter: DelimiterArg,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Export file to format, or `-` for stdin.
    input: PathBuf,
    #[arg(long, value_enum, default_value_t = DelimiterArg::Auto)]
    delimiter: DelimiterArg,
    /// Delimiter for the output; defaults to the input's.
    #[arg(long, value_enum)]
    to: Option<OutputDelimiter>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Commands::Convert(args) => handle_convert(args),
        Commands::Sync(args) => handle_sync(args),
        Commands::Overview(args) => handle_overview(args),
        Commands::Format(args) => handle_format(args),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .init();
}

fn handle_convert(args: ConvertArgs) -> Result<()> {
    let ConvertArgs {
        input,
        delimiter,
        output,
        compact,
    } = args;
    let text = read_input(&input)?;
    let itinerary = convert_str(&text, delimiter.resolve(&text));
    info!(
        "processed {} days ({} timeline entries)",
        itinerary.len(),
        itinerary.event_count()
    );

    let json = render_json(&itinerary, compact)?;
    match output {
        Some(path) => write_output(&path, &json),
        None => {
            println!("{json}");
            Ok(())
        }
    }
}

fn handle_sync(args: SyncArgs) -> Result<()> {
    let SyncArgs {
        url,
        local_csv,
        output,
        no_mirror,
        delimiter,
    } = args;

    let remote = url
        .filter(|url| !url.trim().is_empty())
        .map(|url| Box::new(HttpSource::new(url)) as Box<dyn RawSource>);
    let source = FallbackSource::new(remote, local_csv).with_mirror(!no_mirror);

    let itinerary = load_itinerary(&source, delimiter.fixed())
        .with_context(|| format!("loading {}", source.describe()))?;
    if itinerary.is_empty() {
        warn!("export produced no days; writing an empty document");
    }

    write_output(&output, &render_json(&itinerary, false)?)?;
    println!("PROCESSED: {} days -> {}", itinerary.len(), output.display());
    Ok(())
}

fn handle_overview(args: OverviewArgs) -> Result<()> {
    let OverviewArgs {
        input,
        from,
        to,
        from_today,
        json,
        delimiter,
    } = args;
    let text = read_input(&input)?;
    let itinerary = convert_str(&text, delimiter.resolve(&text));

    let mut range = DateRange { from, to };
    if from_today {
        range = range.not_before(Local::now().date_naive());
    }
    let summaries = overview::summarize(&itinerary, range);

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        print!("{}", render_overview(&summaries));
    }
    Ok(())
}

fn handle_format(args: FormatArgs) -> Result<()> {
    let FormatArgs {
        input,
        delimiter,
        to,
        in_place,
    } = args;
    if in_place && is_stdin(&input) {
        anyhow::bail!("--in-place needs a file, not stdin");
    }

    let text = read_input(&input)?;
    let source_delimiter = delimiter.resolve(&text);
    let target = to.map(Delimiter::from).unwrap_or(source_delimiter);
    let formatted = format_rows(&parse_delimited(&text, source_delimiter), target);

    if in_place {
        fs::write(&input, formatted.as_bytes()).with_context(|| format!("writing {:?}", input))?;
    } else {
        print!("{formatted}");
    }
    Ok(())
}

fn render_overview(summaries: &[DaySummary]) -> String {
    let mut out = String::new();
    for summary in summaries {
        out.push_str(&format!("Day {}  {}", summary.index, summary.date));
        if !summary.day_of_week.is_empty() {
            out.push_str(&format!(" ({})", summary.day_of_week));
        }
        if let Some(city) = &summary.main_city {
            out.push_str(&format!("  [{city}]"));
        }
        out.push('\n');

        for bucket in PeriodBucket::ALL {
            for glance in summary.bucket(bucket) {
                out.push_str(&format!(
                    "  {:<10} {:<6} {}\n",
                    bucket.name(),
                    glance.time,
                    glance.event
                ));
            }
        }
    }
    out
}

fn render_json(itinerary: &Itinerary, compact: bool) -> Result<String> {
    let json = if compact {
        serde_json::to_string(itinerary)?
    } else {
        serde_json::to_string_pretty(itinerary)?
    };
    Ok(json)
}

fn is_stdin(path: &Path) -> bool {
    path.as_os_str() == "-"
}

fn read_input(path: &Path) -> Result<String> {
    if is_stdin(path) {
        return io::read_to_string(io::stdin()).context("reading stdin");
    }
    FileSource::new(path)
        .fetch()
        .with_context(|| format!("reading export {:?}", path))
}

fn write_output(path: &Path, contents: &str) -> Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating {:?}", dir))?;
    }
    fs::write(path, contents).with_context(|| format!("writing {:?}", path))?;
    info!("wrote {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use itinerary::projectors::overview::Glance;

    const EXPORT: &str = "日期,星期,時段,時間,城市,活動標題\n\
                          2026/03/10,二,早上,09:00,東京,Senso-ji\n\
                          2026/03/11,三,晚上,19:00,箱根,Onsen\n";

    #[test]
    fn cli_parses_subcommands_and_defaults() {
        let cli = Cli::try_parse_from(["itinerary", "--verbose", "convert", "in.csv", "--compact"])
            .expect("parse convert");
        assert!(cli.verbose);
        match cli.command {
            Commands::Convert(args) => {
                assert!(args.compact);
                assert!(matches!(args.delimiter, DelimiterArg::Auto));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["itinerary", "format", "-", "--to", "tab"]).expect("parse format");
        assert!(matches!(
            cli.command,
            Commands::Format(FormatArgs { to: Some(OutputDelimiter::Tab), .. })
        ));
    }

    #[test]
    fn convert_writes_json_document() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let input = tmp.path().join("export.csv");
        let output = tmp.path().join("out").join("travel.json");
        fs::write(&input, EXPORT).expect("write export");

        handle_convert(ConvertArgs {
            input,
            delimiter: DelimiterArg::Auto,
            output: Some(output.clone()),
            compact: true,
        })
        .expect("convert");

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&output).expect("read output")).expect("json");
        assert_eq!(written.as_array().map(Vec::len), Some(2));
        assert_eq!(written[1]["periods"][0]["timeline"][0]["event"], "Onsen");
    }

    #[test]
    fn sync_without_url_uses_local_copy() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let local = tmp.path().join("template.csv");
        let output = tmp.path().join("travel_data.json");
        fs::write(&local, EXPORT).expect("write local");

        handle_sync(SyncArgs {
            url: None,
            local_csv: local.clone(),
            output: output.clone(),
            no_mirror: false,
            delimiter: DelimiterArg::Auto,
        })
        .expect("sync");

        let doc: Itinerary =
            serde_json::from_str(&fs::read_to_string(&output).expect("read output")).expect("json");
        assert_eq!(doc.len(), 2);
        assert_eq!(fs::read_to_string(&local).expect("local intact"), EXPORT);
    }

    #[test]
    fn sync_fails_when_no_source_is_available() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let result = handle_sync(SyncArgs {
            url: Some("   ".into()),
            local_csv: tmp.path().join("missing.csv"),
            output: tmp.path().join("out.json"),
            no_mirror: true,
            delimiter: DelimiterArg::Comma,
        });
        assert!(result.is_err());
        assert!(!tmp.path().join("out.json").exists());
    }

    #[test]
    fn format_in_place_switches_delimiter() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("export.csv");
        fs::write(&path, "日期,活動標題\r\n2026/03/10,\"Lunch, then walk\"\r\n").expect("write");

        handle_format(FormatArgs {
            input: path.clone(),
            delimiter: DelimiterArg::Auto,
            to: Some(OutputDelimiter::Tab),
            in_place: true,
        })
        .expect("format");

        assert_eq!(
            fs::read_to_string(&path).expect("read back"),
            "日期\t活動標題\n2026/03/10\tLunch, then walk\n"
        );
    }

    #[test]
    fn format_refuses_in_place_on_stdin() {
        let result = handle_format(FormatArgs {
            input: PathBuf::from("-"),
            delimiter: DelimiterArg::Auto,
            to: None,
            in_place: true,
        });
        assert!(result.is_err());
    }

    #[test]
    fn overview_text_lists_buckets_in_order() {
        let summary = DaySummary {
            index: 2,
            date: "2026/03/11".into(),
            day_of_week: "三".into(),
            main_city: Some("箱根".into()),
            morning: vec![],
            afternoon: vec![Glance {
                time: "13:00".into(),
                event: "Lake Ashi".into(),
            }],
            evening: vec![Glance {
                time: "19:00".into(),
                event: "Onsen".into(),
            }],
        };
        let text = render_overview(&[summary]);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "Day 2  2026/03/11 (三)  [箱根]");
        assert!(lines[1].trim_start().starts_with("afternoon"));
        assert!(lines[2].ends_with("Onsen"));
    }
}
