//! EXIF extraction.
//!
//! Files without an EXIF block are not an error: they yield empty
//! [`ExifData`], except that image dimensions are then read from the image
//! header when possible.
//!
//! Capture time comes from `DateTimeOriginal`. Without it, a date embedded
//! in the file name (`IMG_20210314_153012.jpg`, `2021-03-14 15.30.12.jpg`)
//! is used before the edit-time `DateTime` tag.

use crate::core::media::ExifData;
use crate::error::ExtractionError;
use ::exif::{In, Reader, Tag, Value};
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::OnceLock;

const EXIF_DATE_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Year, month, day and an optional time, separated by nothing, `-`, `_` or `.`
const FILE_NAME_DATE: &str = r"(?:^|\D)((?:19|20)\d{2})[-_.]?(0[1-9]|1[0-2])[-_.]?(0[1-9]|[12]\d|3[01])(?:[ _T.-]?([01]\d|2[0-3])[-_.:]?([0-5]\d)[-_.:]?([0-5]\d))?";

/// Reads EXIF metadata from image and RAW files
#[derive(Debug, Clone, Copy, Default)]
pub struct ExifExtractor;

impl ExifExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, path: &Path) -> Result<ExifData, ExtractionError> {
        let file = File::open(path).map_err(|source| ExtractionError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut reader = BufReader::new(file);
        let mut data = match Reader::new().read_from_container(&mut reader) {
            Ok(exif) => from_fields(&exif, path),
            Err(::exif::Error::Io(source)) => {
                return Err(ExtractionError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
            Err(e) => {
                tracing::debug!("No EXIF in {}: {}", path.display(), e);
                ExifData {
                    taken_at: date_from_path(path),
                    ..ExifData::default()
                }
            }
        };

        if data.width.is_none() || data.height.is_none() {
            if let Ok((width, height)) = image::image_dimensions(path) {
                data.width = Some(width);
                data.height = Some(height);
            }
        }

        Ok(data)
    }
}

fn from_fields(exif: &::exif::Exif, path: &Path) -> ExifData {
    let field = |tag: Tag| exif.get_field(tag, In::PRIMARY).map(|f| &f.value);
    let date = |tag: Tag| {
        field(tag)
            .and_then(string_value)
            .and_then(|s| NaiveDateTime::parse_from_str(&s, EXIF_DATE_FORMAT).ok())
    };

    let taken_at = date(Tag::DateTimeOriginal)
        .or_else(|| date_from_path(path))
        .or_else(|| date(Tag::DateTime));

    // Prefer the pixel dimensions over the stored image size
    let width = field(Tag::PixelXDimension)
        .and_then(u32_value)
        .or_else(|| field(Tag::ImageWidth).and_then(u32_value));
    let height = field(Tag::PixelYDimension)
        .and_then(u32_value)
        .or_else(|| field(Tag::ImageLength).and_then(u32_value));

    let orientation = match field(Tag::Orientation) {
        Some(Value::Short(values)) => values.first().copied(),
        _ => None,
    };

    ExifData {
        taken_at,
        width,
        height,
        camera_make: field(Tag::Make).and_then(string_value),
        camera_model: field(Tag::Model).and_then(string_value),
        orientation,
    }
}

fn date_from_path(path: &Path) -> Option<NaiveDateTime> {
    let name = path.file_stem()?.to_str()?;
    let date = date_from_file_name(name);
    if let Some(date) = date {
        tracing::debug!("Capture time of {} taken from its name: {}", path.display(), date);
    }
    date
}

/// First valid calendar date in `name`; midnight when no time follows it
fn date_from_file_name(name: &str) -> Option<NaiveDateTime> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(FILE_NAME_DATE).ok())
        .as_ref()?;

    pattern.captures_iter(name).find_map(|caps| {
        let number = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
        let year = i32::try_from(number(1)?).ok()?;
        let date = NaiveDate::from_ymd_opt(year, number(2)?, number(3)?)?;
        match (number(4), number(5), number(6)) {
            (Some(h), Some(m), Some(s)) => date.and_hms_opt(h, m, s),
            _ => date.and_hms_opt(0, 0, 0),
        }
    })
}

fn u32_value(value: &Value) -> Option<u32> {
    match value {
        Value::Long(values) => values.first().copied(),
        Value::Short(values) => values.first().map(|v| u32::from(*v)),
        _ => None,
    }
}

fn string_value(value: &Value) -> Option<String> {
    let Value::Ascii(values) = value else {
        return None;
    };
    let text = std::str::from_utf8(values.first()?).ok()?;
    let trimmed = text.trim_end_matches('\0').trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
