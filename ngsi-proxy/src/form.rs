//! `application/x-www-form-urlencoded` request bodies

use std::collections::BTreeMap;

use http::header::CONTENT_TYPE;
use http::HeaderMap;
use thiserror::Error;
use url::form_urlencoded;

pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
pub const APPLICATION_JSON: &str = "application/json";

/// Form decoding errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FormError {
    #[error("invalid URL escape {0:?}")]
    InvalidEscape(String),
}

/// Media type of the request, lower-cased and without parameters.
/// `None` when the header is absent.
pub fn media_type(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_TYPE)?;
    let value = String::from_utf8_lossy(value.as_bytes());
    let media = value.split(';').next().unwrap_or_default().trim();
    Some(media.to_ascii_lowercase())
}

/// Decode form fields from the request body and URL query.
///
/// One value per key; the first occurrence wins and body fields take
/// precedence over query fields. An empty body is an empty form.
pub fn parse_form(query: Option<&str>, body: &[u8]) -> Result<BTreeMap<String, String>, FormError> {
    let mut fields = BTreeMap::new();
    for source in [body, query.unwrap_or_default().as_bytes()] {
        check_escapes(source)?;
        for (key, value) in form_urlencoded::parse(source) {
            fields
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
    }

    Ok(fields)
}

/// Reject `%` sequences that are not followed by two hex digits
fn check_escapes(data: &[u8]) -> Result<(), FormError> {
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'%' {
            let escape = data.get(i + 1..i + 3);
            let valid = escape.map_or(false, |h| h.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                let end = (i + 3).min(data.len());
                return Err(FormError::InvalidEscape(
                    String::from_utf8_lossy(&data[i..end]).into_owned(),
                ));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(())
}
