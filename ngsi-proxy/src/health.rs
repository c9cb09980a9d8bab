//! `health` companion commands: ask a running proxy for its `/health` report

use std::io::Write;

use http::StatusCode;
use url::Url;

use ngsi_core::{json, HttpTransport, NgsiError, NgsiResult, OutboundRequest};

/// GET `<host>/health` and print the report to `out`
pub async fn check_health(
    stage: &'static str,
    transport: &dyn HttpTransport,
    host: &str,
    pretty: bool,
    out: &mut dyn Write,
) -> NgsiResult<()> {
    let url = health_url(host).map_err(|e| NgsiError::with_source(stage, 1, e))?;

    let response = transport
        .request(OutboundRequest::get(url))
        .await
        .map_err(|e| NgsiError::wrap(stage, 1, e))?;

    if response.status != StatusCode::OK {
        return Err(NgsiError::new(
            stage,
            2,
            format!("error {} {}", response.status_line(), response.body_text()),
        ));
    }

    let written = if pretty {
        let indented = json::indent(&response.body).map_err(|e| NgsiError::wrap(stage, 3, e))?;
        writeln!(out, "{}", indented)
    } else {
        out.write_all(&response.body)
    };

    written.map_err(|e| NgsiError::with_source(stage, 4, e))
}

fn health_url(host: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(host)?;
    let path = format!("{}/health", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}
