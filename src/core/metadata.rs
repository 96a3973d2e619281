use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::LazyLock;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use exif::{In, Reader, Tag, Value};
use regex::Regex;

use crate::core::config::YearMonth;
use crate::core::scanner::{ImageFile, Mtime};

/// Where a capture timestamp was recovered from, most trustworthy first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    Exif,
    Filename,
    Filesystem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTime {
    pub at: NaiveDateTime,
    pub source: CaptureSource,
}

const EXIF_DATE_TAGS: [Tag; 3] = [Tag::DateTimeOriginal, Tag::DateTime, Tag::DateTimeDigitized];

static FILENAME_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\D)((?:19|20)\d{2})[-_]?(\d{2})[-_]?(\d{2})(?:\D|$)")
        .unwrap_or_else(|e| panic!("invalid filename date pattern: {e}"))
});

/// Pixel count read from the image header, 0 when unreadable.
pub fn resolution(path: &Path) -> u64 {
    match image::image_dimensions(path) {
        Ok((w, h)) => u64::from(w) * u64::from(h),
        Err(e) => {
            log::debug!("Could not read dimensions for {}: {}", path.display(), e);
            0
        }
    }
}

/// Capture timestamp from EXIF, then the filename, then the modification time.
pub fn capture_time(path: &Path, mtime: Mtime) -> Option<CaptureTime> {
    if let Some(at) = exif_capture_time(path) {
        return Some(CaptureTime {
            at,
            source: CaptureSource::Exif,
        });
    }
    let name = path.file_name().map(|n| n.to_string_lossy().to_string());
    if let Some(date) = name.as_deref().and_then(filename_date) {
        return date.and_hms_opt(0, 0, 0).map(|at| CaptureTime {
            at,
            source: CaptureSource::Filename,
        });
    }
    DateTime::from_timestamp(mtime.secs, mtime.nanos).map(|dt| CaptureTime {
        at: dt.with_timezone(&Local).naive_local(),
        source: CaptureSource::Filesystem,
    })
}

/// First parseable EXIF date tag.
pub fn exif_capture_time(path: &Path) -> Option<NaiveDateTime> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let exif = Reader::new().read_from_container(&mut reader).ok()?;

    EXIF_DATE_TAGS.iter().find_map(|tag| {
        let field = exif.get_field(*tag, In::PRIMARY)?;
        let text = ascii_value(&field.value)?;
        parse_exif_datetime(&text)
    })
}

/// A calendar date embedded in a filename such as `IMG_20231105_1012.jpg` or `2023-11-05 party.png`.
pub fn filename_date(name: &str) -> Option<NaiveDate> {
    FILENAME_DATE.captures_iter(name).find_map(|caps| {
        let year = caps[1].parse().ok()?;
        let month = caps[2].parse().ok()?;
        let day = caps[3].parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
    })
}

fn ascii_value(value: &Value) -> Option<String> {
    match value {
        Value::Ascii(vec) => vec.first().map(|bytes| {
            String::from_utf8_lossy(bytes)
                .trim_end_matches('\0')
                .trim()
                .to_string()
        }),
        _ => None,
    }
}

fn parse_exif_datetime(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y:%m:%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
        .map_err(|_| log::debug!("Failed to parse EXIF datetime: {text}"))
        .ok()
}

/// Recognises images taken during one month, from EXIF or from the filename.
#[derive(Debug, Clone)]
pub struct MonthMarker {
    month: YearMonth,
    pattern: Regex,
}

impl MonthMarker {
    pub fn new(month: YearMonth) -> Result<Self, regex::Error> {
        let (y, m) = (month.year, month.month);
        // 2023-11-05, 20231105, 11-2023, 112023
        let pattern = Regex::new(&format!(r"{y:04}-?{m:02}-?\d{{2}}|{m:02}-?{y:04}"))?;
        Ok(Self { month, pattern })
    }

    pub fn month(&self) -> YearMonth {
        self.month
    }

    pub fn names_month(&self, file_name: &str) -> bool {
        self.pattern.is_match(file_name)
    }

    pub fn matches(&self, file: &ImageFile) -> bool {
        if self.names_month(&file.file_name()) {
            return true;
        }
        file.capture_time()
            .is_some_and(|c| c.source == CaptureSource::Exif && self.month.contains(c.at.date()))
    }
}
