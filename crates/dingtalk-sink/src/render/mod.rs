use std::fmt::Write;

use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use thiserror::Error;

use crate::event::LogEvent;

/// Rendered when `{Timestamp}` carries no explicit format.
const DEFAULT_TIMESTAMP_FORMAT: &str = "yyyy-MM-dd HH:mm:ss.fff zzz";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid output template at offset {offset}: {detail}")]
    Template { offset: usize, detail: String },

    #[error("failed to render event: {0}")]
    Format(#[from] std::fmt::Error),

    #[error("event could not be rendered: {0}")]
    Event(String),
}

/// Turns one event into display text.
///
/// Implementations append to `out`; on error the caller discards whatever
/// was appended for that event.
pub trait EventRenderer: Send + Sync + 'static {
    fn render(&self, event: &LogEvent, out: &mut String) -> Result<(), RenderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LevelFormat {
    Full,
    Upper,
    Lower,
    Upper3,
    Lower3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DatePart {
    Literal(String),
    Year4,
    Year2,
    Month { width: usize },
    MonthAbbrev,
    MonthName,
    Day { width: usize },
    DayAbbrev,
    DayName,
    Hour24 { width: usize },
    Hour12 { width: usize },
    Minute { width: usize },
    Second { width: usize },
    Fraction { digits: u32 },
    Offset { width: usize },
    AmPm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Level(LevelFormat),
    Timestamp(Vec<DatePart>),
    Message,
    NewLine,
    Exception,
    Properties { literal: bool },
    Property { name: String, literal: bool },
}

/// Renders events through a Serilog-style output template, e.g.
/// `[{Level}] {Timestamp:yyyy-MM-dd HH:mm:ss} {SourceContext} {Message}{NewLine}{Exception}`.
///
/// The template is parsed once; rendering is culture-invariant. Property
/// values are written as quoted strings unless the token carries the `l`
/// format, as in `{SourceContext:l}`.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    segments: Vec<Segment>,
}

impl TemplateRenderer {
    pub fn new(template: &str) -> Result<Self, RenderError> {
        Ok(Self {
            segments: parse_template(template)?,
        })
    }
}

impl EventRenderer for TemplateRenderer {
    fn render(&self, event: &LogEvent, out: &mut String) -> Result<(), RenderError> {
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Level(format) => write_level(event, *format, out),
                Segment::Timestamp(parts) => write_timestamp(&event.timestamp, parts, out)?,
                Segment::Message => out.push_str(&event.message),
                Segment::NewLine => out.push('\n'),
                Segment::Exception => {
                    if let Some(exception) = &event.exception {
                        out.push_str(exception);
                        out.push('\n');
                    }
                }
                Segment::Properties { literal } => {
                    out.push('{');
                    for (i, (name, value)) in event.properties.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        write!(out, "{name}=")?;
                        write_value(value, *literal, out);
                    }
                    out.push('}');
                }
                Segment::Property { name, literal } => {
                    if let Some(value) = event.property(name) {
                        write_value(value, *literal, out);
                    }
                }
            }
        }
        Ok(())
    }
}

/// `"value"` with inner quotes backslash-escaped, or the raw text when `literal`.
fn write_value(value: &str, literal: bool, out: &mut String) {
    if literal {
        out.push_str(value);
        return;
    }
    out.push('"');
    for c in value.chars() {
        if c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

fn write_level(event: &LogEvent, format: LevelFormat, out: &mut String) {
    let name = event.level.as_str();
    match format {
        LevelFormat::Full => out.push_str(name),
        LevelFormat::Upper => out.push_str(&name.to_ascii_uppercase()),
        LevelFormat::Lower => out.push_str(&name.to_ascii_lowercase()),
        LevelFormat::Upper3 => out.push_str(&short_level(name).to_ascii_uppercase()),
        LevelFormat::Lower3 => out.push_str(&short_level(name).to_ascii_lowercase()),
    }
}

/// Three-letter moniker: VRB, DBG, INF, WRN, ERR, FTL.
fn short_level(name: &str) -> &'static str {
    match name {
        "Verbose" => "Vrb",
        "Debug" => "Dbg",
        "Information" => "Inf",
        "Warning" => "Wrn",
        "Error" => "Err",
        _ => "Ftl",
    }
}

fn write_timestamp(
    ts: &DateTime<FixedOffset>,
    parts: &[DatePart],
    out: &mut String,
) -> Result<(), RenderError> {
    for part in parts {
        match part {
            DatePart::Literal(text) => out.push_str(text),
            DatePart::Year4 => write!(out, "{:04}", ts.year())?,
            DatePart::Year2 => write!(out, "{:02}", ts.year().rem_euclid(100))?,
            DatePart::Month { width } => write!(out, "{:0w$}", ts.month(), w = *width)?,
            DatePart::MonthAbbrev => write!(out, "{}", ts.format("%b"))?,
            DatePart::MonthName => write!(out, "{}", ts.format("%B"))?,
            DatePart::Day { width } => write!(out, "{:0w$}", ts.day(), w = *width)?,
            DatePart::DayAbbrev => write!(out, "{}", ts.format("%a"))?,
            DatePart::DayName => write!(out, "{}", ts.format("%A"))?,
            DatePart::Hour24 { width } => write!(out, "{:0w$}", ts.hour(), w = *width)?,
            DatePart::Hour12 { width } => write!(out, "{:0w$}", ts.hour12().1, w = *width)?,
            DatePart::Minute { width } => write!(out, "{:0w$}", ts.minute(), w = *width)?,
            DatePart::Second { width } => write!(out, "{:0w$}", ts.second(), w = *width)?,
            DatePart::Fraction { digits } => {
                // Leap-second nanos can exceed 1e9; clamp to the last representable fraction.
                let nanos = ts.nanosecond().min(999_999_999);
                let value = nanos / 10u32.pow(9 - *digits);
                write!(out, "{:0w$}", value, w = *digits as usize)?
            }
            DatePart::Offset { width } => {
                let secs = ts.offset().local_minus_utc();
                let sign = if secs < 0 { '-' } else { '+' };
                let hours = secs.abs() / 3600;
                let minutes = (secs.abs() % 3600) / 60;
                match *width {
                    1 => write!(out, "{sign}{hours}")?,
                    2 => write!(out, "{sign}{hours:02}")?,
                    _ => write!(out, "{sign}{hours:02}:{minutes:02}")?,
                }
            }
            DatePart::AmPm => out.push_str(if ts.hour12().0 { "PM" } else { "AM" }),
        }
    }
    Ok(())
}

fn parse_template(template: &str) -> Result<Vec<Segment>, RenderError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                literal.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut token = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    token.push(c);
                }
                if !closed {
                    return Err(RenderError::Template {
                        offset,
                        detail: "unclosed '{'".into(),
                    });
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(parse_token(&token, offset)?);
            }
            other => literal.push(other),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn parse_token(token: &str, offset: usize) -> Result<Segment, RenderError> {
    let (head, format) = match token.split_once(':') {
        Some((head, format)) => (head, Some(format)),
        None => (token, None),
    };
    // Alignment (`{Level,-5}`) is accepted and ignored.
    let name = head.split(',').next().unwrap_or_default().trim();
    if name.is_empty() {
        return Err(RenderError::Template {
            offset,
            detail: "empty property name".into(),
        });
    }

    let segment = match name {
        "Level" => Segment::Level(match format {
            None | Some("") => LevelFormat::Full,
            Some("u") => LevelFormat::Upper,
            Some("w") => LevelFormat::Lower,
            Some("u3") => LevelFormat::Upper3,
            Some("w3") => LevelFormat::Lower3,
            Some(other) => {
                return Err(RenderError::Template {
                    offset,
                    detail: format!("unsupported level format {other:?}"),
                });
            }
        }),
        "Timestamp" => Segment::Timestamp(parse_date_format(
            format.unwrap_or(DEFAULT_TIMESTAMP_FORMAT),
        )),
        "Message" => Segment::Message,
        "NewLine" => Segment::NewLine,
        "Exception" => Segment::Exception,
        "Properties" => Segment::Properties {
            literal: is_literal(format),
        },
        other => Segment::Property {
            name: other.to_owned(),
            literal: is_literal(format),
        },
    };
    Ok(segment)
}

fn is_literal(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.contains('l'))
}

/// Translate a .NET custom date format string into render parts.
/// Unrecognized characters are copied through literally.
fn parse_date_format(format: &str) -> Vec<DatePart> {
    let chars: Vec<char> = format.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }

        let part = match c {
            'y' => Some(if run >= 3 {
                DatePart::Year4
            } else {
                DatePart::Year2
            }),
            'M' => Some(match run {
                1 | 2 => DatePart::Month { width: run },
                3 => DatePart::MonthAbbrev,
                _ => DatePart::MonthName,
            }),
            'd' => Some(match run {
                1 | 2 => DatePart::Day { width: run },
                3 => DatePart::DayAbbrev,
                _ => DatePart::DayName,
            }),
            'H' => Some(DatePart::Hour24 { width: run.min(2) }),
            'h' => Some(DatePart::Hour12 { width: run.min(2) }),
            'm' => Some(DatePart::Minute { width: run.min(2) }),
            's' => Some(DatePart::Second { width: run.min(2) }),
            'f' | 'F' => Some(DatePart::Fraction {
                digits: run.min(9) as u32,
            }),
            'z' => Some(DatePart::Offset { width: run.min(3) }),
            't' => Some(DatePart::AmPm),
            '\'' | '"' => {
                // Quoted literal runs to the matching quote.
                let mut j = i + 1;
                while j < chars.len() && chars[j] != c {
                    literal.push(chars[j]);
                    j += 1;
                }
                i = j + 1;
                continue;
            }
            '\\' if i + 1 < chars.len() => {
                literal.push(chars[i + 1]);
                i += 2;
                continue;
            }
            _ => None,
        };

        match part {
            Some(part) => {
                if !literal.is_empty() {
                    parts.push(DatePart::Literal(std::mem::take(&mut literal)));
                }
                parts.push(part);
            }
            None => literal.extend(std::iter::repeat_n(c, run)),
        }
        i += run;
    }

    if !literal.is_empty() {
        parts.push(DatePart::Literal(literal));
    }
    parts
}
