//! Device report for `/info`

use std::fmt::Write;
use std::sync::Arc;

use crate::camera::{CameraDriver, CameraFormat, DeviceError};

/// Open a short-lived session on `path` and list what the device advertises.
///
/// Runs on the blocking pool; the session is closed before returning.
pub async fn query_formats(
    driver: Arc<dyn CameraDriver>,
    path: String,
) -> anyhow::Result<Vec<CameraFormat>> {
    let formats = tokio::task::spawn_blocking(move || -> Result<_, DeviceError> {
        let mut source = driver.open(&path)?;
        let formats = source.formats();
        source.close();
        formats
    })
    .await??;

    Ok(formats)
}

/// Escape text for embedding in HTML element content or attributes.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render the pixel format table.
pub fn render_info_html(device_path: &str, formats: &[CameraFormat]) -> String {
    let mut rows = String::new();
    for format in formats {
        let code = match format.fourcc() {
            Some(fourcc) => format!("{} ({})", format.code, fourcc),
            None => format.code.to_string(),
        };
        // Writing into a String cannot fail
        let _ = write!(
            rows,
            "\n        <tr><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape_html(&format.name),
            escape_html(&code),
            escape_html(&format.resolutions_label()),
        );
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Door Opener Webcam Debug</title>
    <style>
        body, table {{
            font-family: arial, sans-serif;
        }}
        table {{
            border-collapse: collapse;
            border: solid 1px #999;
        }}
        td {{
            padding: 5px;
            background-color: #F2F2F2;
            border: solid 1px #999;
        }}
    </style>
</head>
<body>
    <h2>Door Opener Webcam Debug</h2>
    <p>Device: <code>{}</code></p>
    <table border="1">
        <tr><th colspan="3">Pixel Formats</th></tr>
        <tr><th>Name</th><th>Frame Size</th><th>Supported Resolutions</th></tr>{}
    </table>
</body>
</html>
"#,
        escape_html(device_path),
        rows
    )
}
